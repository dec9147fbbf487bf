//! Protocol buffer definitions for the IAM services.
//!
//! The main node exposes two gRPC listeners. The public one serves read-only
//! identity, certificate and node lookups plus the node registration stream
//! for unprovisioned nodes. The protected one (mTLS) adds node
//! administration, provisioning, certificate issuance and permission
//! registration.
//!
//! # Node registration stream
//!
//! ```text
//!  secondary node                          main node
//!  ──────────────                          ─────────
//!  IamOutgoingMessages { node_info }  ───►  status gate, registry insert
//!                                     ◄───  IamIncomingMessages { request_id, pause_node_request }
//!  IamOutgoingMessages { request_id,  ───►  matched to the waiting caller
//!      pause_node_response }
//! ```
//!
//! Requests and responses are matched by `request_id`, so responses may
//! arrive in any order. A `node_info` frame carries no request ID and may be
//! sent at any time to report a status change.

// Generated protobuf code doesn't have docs
#![allow(missing_docs)]

use std::fmt;
use std::str::FromStr;

/// Generated protobuf types from iamanager.proto
pub mod iamanager {
    /// Version 5 of the IAM protocol
    pub mod v5 {
        tonic::include_proto!("iamanager.v5");
    }
}

pub use iamanager::v5::*;

/// API version reported by `IamVersionService::GetApiVersion`
pub const IAM_API_VERSION: u64 = 5;

/// Node attribute marking the node that hosts the node registry
pub const MAIN_NODE_ATTRIBUTE: &str = "MainNode";

/// Error returned when parsing an unknown node status string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown node status: {0}")]
pub struct UnknownNodeStatus(pub String);

impl NodeStatus {
    /// Lowercase name used in logs, config and the provisioning state file
    pub fn label(&self) -> &'static str {
        match self {
            NodeStatus::Unspecified => "unspecified",
            NodeStatus::Unprovisioned => "unprovisioned",
            NodeStatus::Provisioned => "provisioned",
            NodeStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for NodeStatus {
    type Err = UnknownNodeStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unprovisioned" => Ok(NodeStatus::Unprovisioned),
            "provisioned" => Ok(NodeStatus::Provisioned),
            "paused" => Ok(NodeStatus::Paused),
            other => Err(UnknownNodeStatus(other.to_string())),
        }
    }
}

impl NodeInfo {
    /// Whether this node carries the main node attribute
    pub fn is_main_node(&self) -> bool {
        self.attrs
            .iter()
            .any(|attr| attr.name.eq_ignore_ascii_case(MAIN_NODE_ATTRIBUTE))
    }
}

impl ErrorInfo {
    /// Create an error payload with the given aos error code and message
    pub fn new(aos_code: i32, message: impl Into<String>) -> Self {
        Self {
            aos_code,
            exit_code: 0,
            message: message.into(),
        }
    }
}

/// Response payloads that embed a business error instead of failing the RPC
pub trait EmbeddedError {
    /// The embedded error, if the operation reported one
    fn error(&self) -> Option<&ErrorInfo>;

    /// Embed an error into the response
    fn set_error(&mut self, error: ErrorInfo);
}

macro_rules! impl_embedded_error {
    ($($ty:ty),* $(,)?) => {
        $(
            impl EmbeddedError for $ty {
                fn error(&self) -> Option<&ErrorInfo> {
                    self.error.as_ref()
                }

                fn set_error(&mut self, error: ErrorInfo) {
                    self.error = Some(error);
                }
            }
        )*
    };
}

impl_embedded_error!(
    PauseNodeResponse,
    ResumeNodeResponse,
    CertTypes,
    StartProvisioningResponse,
    FinishProvisioningResponse,
    DeprovisionResponse,
    CreateKeyResponse,
    ApplyCertResponse,
);

impl iam_incoming_messages::Message {
    /// Short name of the request kind for logging
    pub fn name(&self) -> &'static str {
        use iam_incoming_messages::Message;

        match self {
            Message::StartProvisioningRequest(_) => "start_provisioning",
            Message::FinishProvisioningRequest(_) => "finish_provisioning",
            Message::DeprovisionRequest(_) => "deprovision",
            Message::PauseNodeRequest(_) => "pause_node",
            Message::ResumeNodeRequest(_) => "resume_node",
            Message::CreateKeyRequest(_) => "create_key",
            Message::ApplyCertRequest(_) => "apply_cert",
            Message::GetCertTypesRequest(_) => "get_cert_types",
        }
    }
}

impl iam_outgoing_messages::Message {
    /// Short name of the response kind for logging
    pub fn name(&self) -> &'static str {
        use iam_outgoing_messages::Message;

        match self {
            Message::NodeInfo(_) => "node_info",
            Message::StartProvisioningResponse(_) => "start_provisioning",
            Message::FinishProvisioningResponse(_) => "finish_provisioning",
            Message::DeprovisionResponse(_) => "deprovision",
            Message::PauseNodeResponse(_) => "pause_node",
            Message::ResumeNodeResponse(_) => "resume_node",
            Message::CreateKeyResponse(_) => "create_key",
            Message::ApplyCertResponse(_) => "apply_cert",
            Message::CertTypesResponse(_) => "get_cert_types",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_status_parses_labels() {
        assert_eq!(
            "provisioned".parse::<NodeStatus>(),
            Ok(NodeStatus::Provisioned)
        );
        assert_eq!("Paused\n".parse::<NodeStatus>(), Ok(NodeStatus::Paused));
        assert!("removed".parse::<NodeStatus>().is_err());
    }

    #[test]
    fn node_status_label_matches_display() {
        for status in [
            NodeStatus::Unprovisioned,
            NodeStatus::Provisioned,
            NodeStatus::Paused,
        ] {
            assert_eq!(status.to_string(), status.label());
        }
    }

    #[test]
    fn main_node_detected_from_attrs() {
        let mut info = NodeInfo {
            node_id: "node0".to_string(),
            ..Default::default()
        };
        assert!(!info.is_main_node());

        info.attrs.push(NodeAttribute {
            name: "MainNode".to_string(),
            value: String::new(),
        });
        assert!(info.is_main_node());
    }

    #[test]
    fn embedded_error_round_trips_through_trait() {
        let mut response = PauseNodeResponse::default();
        assert!(response.error().is_none());

        response.set_error(ErrorInfo::new(9, "wrong state"));
        assert_eq!(
            response.error().map(|e| e.message.as_str()),
            Some("wrong state")
        );
    }
}
