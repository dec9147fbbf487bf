//! Per-node stream multiplexer
//!
//! A [`NodeStreamHandler`] owns the outbound half of one node's registration
//! stream. Callers issue typed requests; each gets a fresh request ID and a
//! single-use slot in the pending table, the frame is queued to the
//! stream's single writer, and the caller waits on the slot with a timeout.
//! The stream's reader task fulfills slots through
//! [`NodeStreamHandler::handle_response`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use iam_proto::{
    iam_incoming_messages, iam_outgoing_messages, ApplyCertRequest, ApplyCertResponse, CertTypes,
    CreateKeyRequest, CreateKeyResponse, DeprovisionRequest, DeprovisionResponse,
    FinishProvisioningRequest, FinishProvisioningResponse, GetCertTypesRequest,
    IamIncomingMessages, PauseNodeRequest, PauseNodeResponse, ResumeNodeRequest,
    ResumeNodeResponse, StartProvisioningRequest, StartProvisioningResponse,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::IamError;

/// Frame queued for the node
pub type OutboundFrame = Result<IamIncomingMessages, Status>;

/// Response payload matched to a pending request
pub type NodeResponse = iam_outgoing_messages::Message;

/// Multiplexes synchronous requests over one node's registration stream
pub struct NodeStreamHandler {
    node_id: String,
    outbound: mpsc::Sender<OutboundFrame>,
    pending: DashMap<String, oneshot::Sender<NodeResponse>>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

macro_rules! node_request {
    ($(#[$doc:meta])* $fn_name:ident, $req:ty, $resp:ty, $in_variant:ident, $out_variant:ident, $kind:literal) => {
        $(#[$doc])*
        pub async fn $fn_name(&self, request: $req, timeout: Duration) -> Result<$resp, IamError> {
            match self
                .send_message(iam_incoming_messages::Message::$in_variant(request), timeout)
                .await?
            {
                iam_outgoing_messages::Message::$out_variant(response) => Ok(response),
                other => Err(IamError::UnexpectedResponse {
                    expected: $kind,
                    actual: other.name(),
                }),
            }
        }
    };
}

impl NodeStreamHandler {
    /// Create a handler writing frames for `node_id` into `outbound`
    pub fn new(node_id: impl Into<String>, outbound: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            node_id: node_id.into(),
            outbound,
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Node this handler routes to
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Whether the handler has been torn down
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Token cancelled when the handler closes
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Number of requests waiting for a response
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Tear down the handler
    ///
    /// Every pending request resolves to [`IamError::StreamClosed`] and the
    /// outbound stream ends. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let pending = self.pending.len();
        // dropping the senders wakes every waiter with a closed slot
        self.pending.clear();
        self.cancel.cancel();

        debug!(node_id = %self.node_id, pending = pending, "Node stream handler closed");
    }

    /// Deliver a response frame from the node to its waiting caller
    ///
    /// Returns `false` when no caller is waiting for `request_id`, which
    /// happens for late responses to timed-out requests.
    pub fn handle_response(&self, request_id: &str, response: NodeResponse) -> bool {
        match self.pending.remove(request_id) {
            Some((_, slot)) => {
                if slot.send(response).is_err() {
                    debug!(node_id = %self.node_id, request_id = %request_id, "Caller gone before response");
                }
                true
            }
            None => {
                debug!(
                    node_id = %self.node_id,
                    request_id = %request_id,
                    kind = response.name(),
                    "Response for unknown request, dropping"
                );
                false
            }
        }
    }

    /// Send one request and wait for its matching response
    pub async fn send_message(
        &self,
        message: iam_incoming_messages::Message,
        timeout: Duration,
    ) -> Result<NodeResponse, IamError> {
        if self.is_closed() {
            return Err(IamError::StreamClosed);
        }

        let request_id = Uuid::new_v4().to_string();
        let kind = message.name();
        let (slot_tx, slot_rx) = oneshot::channel();

        self.pending.insert(request_id.clone(), slot_tx);

        // close() may have drained the table between the check and the insert
        if self.is_closed() {
            self.pending.remove(&request_id);
            return Err(IamError::StreamClosed);
        }

        debug!(node_id = %self.node_id, request_id = %request_id, kind = kind, "Sending request to node");

        let frame = IamIncomingMessages {
            request_id: request_id.clone(),
            message: Some(message),
        };

        let exchange = async {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(IamError::StreamClosed),
                sent = self.outbound.send(Ok(frame)) => {
                    if sent.is_err() {
                        return Err(IamError::StreamClosed);
                    }
                }
            }

            slot_rx.await.map_err(|_| IamError::StreamClosed)
        };

        let result = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    node_id = %self.node_id,
                    request_id = %request_id,
                    kind = kind,
                    timeout_ms = timeout.as_millis(),
                    "Node request timed out"
                );
                Err(IamError::Timeout(timeout))
            }
        };

        if result.is_err() {
            self.pending.remove(&request_id);
        }

        result
    }

    node_request!(
        /// Ask the node to pause
        pause_node, PauseNodeRequest, PauseNodeResponse, PauseNodeRequest, PauseNodeResponse, "pause_node"
    );

    node_request!(
        /// Ask the node to resume
        resume_node, ResumeNodeRequest, ResumeNodeResponse, ResumeNodeRequest, ResumeNodeResponse, "resume_node"
    );

    node_request!(
        /// Certificate types the node can issue keys for
        get_cert_types, GetCertTypesRequest, CertTypes, GetCertTypesRequest, CertTypesResponse, "get_cert_types"
    );

    node_request!(
        /// Begin provisioning on the node
        start_provisioning,
        StartProvisioningRequest,
        StartProvisioningResponse,
        StartProvisioningRequest,
        StartProvisioningResponse,
        "start_provisioning"
    );

    node_request!(
        /// Complete provisioning on the node
        finish_provisioning,
        FinishProvisioningRequest,
        FinishProvisioningResponse,
        FinishProvisioningRequest,
        FinishProvisioningResponse,
        "finish_provisioning"
    );

    node_request!(
        /// Deprovision the node
        deprovision, DeprovisionRequest, DeprovisionResponse, DeprovisionRequest, DeprovisionResponse, "deprovision"
    );

    node_request!(
        /// Generate a key on the node and return its CSR
        create_key, CreateKeyRequest, CreateKeyResponse, CreateKeyRequest, CreateKeyResponse, "create_key"
    );

    node_request!(
        /// Install a signed certificate on the node
        apply_cert, ApplyCertRequest, ApplyCertResponse, ApplyCertRequest, ApplyCertResponse, "apply_cert"
    );
}

impl Drop for NodeStreamHandler {
    fn drop(&mut self) {
        self.close();
    }
}
