//! Error types for node routing and collaborator services

use std::time::Duration;

use iam_proto::{ErrorInfo, NodeStatus};
use tonic::Status;

/// aos error codes carried in [`ErrorInfo::aos_code`]
pub mod codes {
    /// Generic failure
    pub const FAILED: i32 = 1;
    /// Out of memory or a fixed-capacity table is full
    pub const NO_MEMORY: i32 = 3;
    /// Requested item doesn't exist
    pub const NOT_FOUND: i32 = 5;
    /// Malformed request argument
    pub const INVALID_ARGUMENT: i32 = 6;
    /// Operation timed out
    pub const TIMEOUT: i32 = 7;
    /// Operation not permitted in the current state
    pub const WRONG_STATE: i32 = 9;
}

/// Errors raised while routing a request to a connected node
#[derive(Debug, thiserror::Error)]
pub enum IamError {
    /// No live registration stream for the target node
    #[error("stream not found")]
    StreamNotFound,

    /// The registration stream was torn down while the request was pending
    #[error("stream closed")]
    StreamClosed,

    /// The node accepted the request but never answered
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The message handler or node controller has been closed
    #[error("handler is closed")]
    HandlerClosed,

    /// The node reported a status outside the allow-list of its entry point
    #[error("node {node_id} status {status} is not allowed")]
    NotAllowed {
        /// Node that attempted to register
        node_id: String,
        /// Status it reported
        status: NodeStatus,
    },

    /// The first frame on a registration stream was not node info
    #[error("first frame must carry node info")]
    MissingNodeInfo,

    /// The node answered with a different response kind than was requested
    #[error("unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse {
        /// Requested kind
        expected: &'static str,
        /// Received kind
        actual: &'static str,
    },

    /// A collaborator service failed
    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl IamError {
    /// Whether the failure is a routing race worth retrying
    ///
    /// A node that is mid-reconnect has no stream for a moment. Once a frame
    /// has been queued the node may already have acted on it, so a closed
    /// stream, a timeout or a business error is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IamError::StreamNotFound)
    }
}

impl From<IamError> for Status {
    fn from(err: IamError) -> Self {
        match err {
            IamError::StreamNotFound => Status::not_found(err.to_string()),
            IamError::StreamClosed => Status::unavailable(err.to_string()),
            IamError::Timeout(_) => Status::deadline_exceeded(err.to_string()),
            IamError::HandlerClosed => Status::failed_precondition(err.to_string()),
            IamError::NotAllowed { .. } => Status::permission_denied(err.to_string()),
            IamError::MissingNodeInfo => Status::invalid_argument(err.to_string()),
            IamError::UnexpectedResponse { .. } => Status::cancelled(err.to_string()),
            IamError::Service(e) => e.into(),
        }
    }
}

/// Business errors reported by collaborator services
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// Requested item doesn't exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed request argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not permitted in the current state
    #[error("wrong state: {0}")]
    WrongState(String),

    /// A fixed-capacity table is full
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Anything else, including failed external commands
    #[error("{message}")]
    Failed {
        /// Error description
        message: String,
        /// Exit code of a failed external command, zero otherwise
        exit_code: i32,
    },
}

impl ServiceError {
    /// Shorthand for a generic failure without an exit code
    pub fn failed(message: impl Into<String>) -> Self {
        ServiceError::Failed {
            message: message.into(),
            exit_code: 0,
        }
    }

    /// aos error code for the embedded error payload
    pub fn code(&self) -> i32 {
        match self {
            ServiceError::NotFound(_) => codes::NOT_FOUND,
            ServiceError::InvalidArgument(_) => codes::INVALID_ARGUMENT,
            ServiceError::WrongState(_) => codes::WRONG_STATE,
            ServiceError::ResourceExhausted(_) => codes::NO_MEMORY,
            ServiceError::Failed { .. } => codes::FAILED,
        }
    }

    /// Build the payload embedded in administrative responses
    pub fn to_error_info(&self) -> ErrorInfo {
        let exit_code = match self {
            ServiceError::Failed { exit_code, .. } => *exit_code,
            _ => 0,
        };

        ErrorInfo {
            aos_code: self.code(),
            exit_code,
            message: self.to_string(),
        }
    }
}

impl From<ServiceError> for Status {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::NotFound(_) => Status::not_found(err.to_string()),
            ServiceError::InvalidArgument(_) => Status::invalid_argument(err.to_string()),
            ServiceError::WrongState(_) => Status::failed_precondition(err.to_string()),
            ServiceError::ResourceExhausted(_) => Status::resource_exhausted(err.to_string()),
            ServiceError::Failed { .. } => Status::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn routing_errors_map_to_transport_status() {
        let status: Status = IamError::StreamNotFound.into();
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), "stream not found");

        let status: Status = IamError::HandlerClosed.into();
        assert_eq!(status.code(), Code::FailedPrecondition);
        assert_eq!(status.message(), "handler is closed");

        let status: Status = IamError::Timeout(Duration::from_secs(1)).into();
        assert_eq!(status.code(), Code::DeadlineExceeded);
    }

    #[test]
    fn only_routing_races_are_retryable() {
        assert!(IamError::StreamNotFound.is_retryable());
        assert!(!IamError::StreamClosed.is_retryable());
        assert!(!IamError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!IamError::HandlerClosed.is_retryable());
        assert!(!IamError::Service(ServiceError::failed("boom")).is_retryable());
    }

    #[test]
    fn service_error_embeds_code_and_exit_code() {
        let info = ServiceError::Failed {
            message: "cmd failed".to_string(),
            exit_code: 2,
        }
        .to_error_info();
        assert_eq!(info.aos_code, codes::FAILED);
        assert_eq!(info.exit_code, 2);
        assert_eq!(info.message, "cmd failed");

        let info = ServiceError::WrongState("paused".to_string()).to_error_info();
        assert_eq!(info.aos_code, codes::WRONG_STATE);
        assert_eq!(info.exit_code, 0);
    }

    #[test]
    fn resource_limit_is_transport_level() {
        let status: Status = ServiceError::ResourceExhausted("table full".to_string()).into();
        assert_eq!(status.code(), Code::ResourceExhausted);
    }
}
