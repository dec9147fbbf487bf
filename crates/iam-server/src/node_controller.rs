//! Registry of connected nodes
//!
//! [`NodeController::register_node`] admits a RegisterNode stream: it reads
//! the node's first frame, checks the reported status against the entry
//! point's allow-list, records the node info and installs a
//! [`NodeStreamHandler`] keyed by node ID. A spawned reader task then pumps
//! the stream until it ends and removes the handler again.
//!
//! A rejected node never appears in the registry. A second registration for
//! the same node ID replaces the first one, whose pending requests resolve
//! to "stream closed".

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use iam_proto::{iam_outgoing_messages, IamIncomingMessages, IamOutgoingMessages, NodeInfo, NodeStatus};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tonic::Status;
use tracing::{debug, info, warn};

use crate::error::IamError;
use crate::node_stream::{NodeStreamHandler, OutboundFrame};
use crate::services::NodeManager;

/// Outbound frame buffer per node
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

/// Channel capacity for connection events
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How long a new stream may take to send its node info frame
pub const DEFAULT_FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(30);

/// Response stream returned to tonic for a registered node
pub type RegisterNodeStream =
    Pin<Box<dyn Stream<Item = Result<IamIncomingMessages, Status>> + Send + 'static>>;

/// Node connection lifecycle events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeConnectionEvent {
    /// A node's stream was linked into the registry
    Connected(String),
    /// A node's stream was removed from the registry
    Disconnected(String),
}

struct Registry {
    closed: bool,
    handlers: HashMap<String, Arc<NodeStreamHandler>>,
}

/// Maps node IDs to their live stream handlers
pub struct NodeController {
    registry: Mutex<Registry>,
    events: broadcast::Sender<NodeConnectionEvent>,
    first_frame_timeout: Duration,
}

impl Default for NodeController {
    fn default() -> Self {
        Self::new(DEFAULT_FIRST_FRAME_TIMEOUT)
    }
}

/// Shared node controller
pub type SharedNodeController = Arc<NodeController>;

impl NodeController {
    /// Create an open controller
    pub fn new(first_frame_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            registry: Mutex::new(Registry {
                closed: false,
                handlers: HashMap::new(),
            }),
            events,
            first_frame_timeout,
        }
    }

    /// Accept registrations again after [`NodeController::close`]
    pub fn start(&self) {
        self.registry.lock().closed = false;
    }

    /// Close every handler and reject new registrations
    ///
    /// Each node that was linked is reported as disconnected.
    pub fn close(&self) {
        let handlers = {
            let mut registry = self.registry.lock();
            registry.closed = true;
            std::mem::take(&mut registry.handlers)
        };

        info!(nodes = handlers.len(), "Closing node controller");

        for (node_id, handler) in handlers {
            handler.close();
            let _ = self.events.send(NodeConnectionEvent::Disconnected(node_id));
        }
    }

    /// Whether the controller rejects new registrations
    pub fn is_closed(&self) -> bool {
        self.registry.lock().closed
    }

    /// Handler for a connected node, if any
    pub fn get_node_stream_handler(&self, node_id: &str) -> Option<Arc<NodeStreamHandler>> {
        let handler = self.registry.lock().handlers.get(node_id).cloned();
        if handler.is_none() {
            debug!(node_id = %node_id, "Stream handler not found");
        }
        handler
    }

    /// IDs of every node with a live stream
    pub fn connected_node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry.lock().handlers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Subscribe to node connection events
    pub fn subscribe(&self) -> broadcast::Receiver<NodeConnectionEvent> {
        self.events.subscribe()
    }

    /// Wait until `node_id` has a live stream, up to `timeout`
    pub async fn wait_for_connection(
        &self,
        node_id: &str,
        timeout: Duration,
    ) -> Option<Arc<NodeStreamHandler>> {
        let mut rx = self.subscribe();

        if let Some(handler) = self.get_node_stream_handler(node_id) {
            return Some(handler);
        }

        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return None,
                event = rx.recv() => match event {
                    Ok(NodeConnectionEvent::Connected(id)) if id == node_id => {
                        if let Some(handler) = self.get_node_stream_handler(node_id) {
                            return Some(handler);
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Some(handler) = self.get_node_stream_handler(node_id) {
                            return Some(handler);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }

    /// Admit a RegisterNode stream
    ///
    /// Reads the first frame, which must carry the node's info, and rejects
    /// the stream if the reported status is not in `allowed`. On success the
    /// node info is stored through `node_manager`, the handler is linked and
    /// a reader task is spawned. The returned stream carries frames for the
    /// node and ends when the handler closes.
    pub async fn register_node<S>(
        self: &Arc<Self>,
        allowed: &[NodeStatus],
        mut inbound: S,
        node_manager: Arc<dyn NodeManager>,
    ) -> Result<RegisterNodeStream, IamError>
    where
        S: Stream<Item = Result<IamOutgoingMessages, Status>> + Send + Unpin + 'static,
    {
        if self.is_closed() {
            debug!("Node controller closed, rejecting registration");
            return Err(IamError::HandlerClosed);
        }

        let info = match tokio::time::timeout(self.first_frame_timeout, inbound.next()).await {
            Err(_) => return Err(IamError::Timeout(self.first_frame_timeout)),
            Ok(None) | Ok(Some(Err(_))) => return Err(IamError::StreamClosed),
            Ok(Some(Ok(IamOutgoingMessages {
                message: Some(iam_outgoing_messages::Message::NodeInfo(info)),
                ..
            }))) => info,
            Ok(Some(Ok(_))) => return Err(IamError::MissingNodeInfo),
        };

        let node_id = info.node_id.clone();
        let status = info.status();

        if !allowed.contains(&status) {
            warn!(node_id = %node_id, status = %status, "Node status is not in allowed list");
            return Err(IamError::NotAllowed { node_id, status });
        }

        node_manager.set_node_info(info).await?;

        let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundFrame>(OUTBOUND_CHANNEL_CAPACITY);
        let handler = Arc::new(NodeStreamHandler::new(node_id.clone(), outbound_tx));

        self.link(&handler)?;

        info!(node_id = %node_id, status = %status, "Node registered");

        let controller = Arc::clone(self);
        let reader_handler = Arc::clone(&handler);
        let allowed = allowed.to_vec();
        tokio::spawn(async move {
            controller
                .pump(reader_handler, inbound, allowed, node_manager)
                .await;
        });

        let stream = tokio_stream::wrappers::ReceiverStream::new(outbound_rx)
            .take_until(handler.cancellation().cancelled_owned());

        Ok(Box::pin(stream))
    }

    fn link(&self, handler: &Arc<NodeStreamHandler>) -> Result<(), IamError> {
        let node_id = handler.node_id().to_string();

        let previous = {
            let mut registry = self.registry.lock();
            if registry.closed {
                return Err(IamError::HandlerClosed);
            }
            registry.handlers.insert(node_id.clone(), Arc::clone(handler))
        };

        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, handler) {
                info!(node_id = %node_id, "Replacing existing node stream");
                previous.close();
            }
        }

        let _ = self
            .events
            .send(NodeConnectionEvent::Connected(node_id));

        Ok(())
    }

    /// Remove `handler` if it is still the one registered for its node
    fn unlink(&self, handler: &Arc<NodeStreamHandler>) -> bool {
        let node_id = handler.node_id();

        let removed = {
            let mut registry = self.registry.lock();
            match registry.handlers.get(node_id) {
                Some(current) if Arc::ptr_eq(current, handler) => {
                    registry.handlers.remove(node_id);
                    true
                }
                _ => false,
            }
        };

        if removed {
            let _ = self
                .events
                .send(NodeConnectionEvent::Disconnected(node_id.to_string()));
        }

        removed
    }

    async fn pump<S>(
        &self,
        handler: Arc<NodeStreamHandler>,
        mut inbound: S,
        allowed: Vec<NodeStatus>,
        node_manager: Arc<dyn NodeManager>,
    ) where
        S: Stream<Item = Result<IamOutgoingMessages, Status>> + Send + Unpin + 'static,
    {
        let cancel = handler.cancellation();

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = inbound.next() => frame,
            };

            match frame {
                Some(Ok(frame)) => match frame.message {
                    Some(iam_outgoing_messages::Message::NodeInfo(info)) => {
                        self.handle_node_info(&handler, info, &allowed, node_manager.as_ref())
                            .await;
                    }
                    Some(response) => {
                        handler.handle_response(&frame.request_id, response);
                    }
                    None => {
                        debug!(node_id = %handler.node_id(), "Empty frame from node, ignoring");
                    }
                },
                Some(Err(status)) => {
                    warn!(node_id = %handler.node_id(), error = %status, "Node stream error");
                    break;
                }
                None => break,
            }
        }

        handler.close();

        if self.unlink(&handler) {
            info!(node_id = %handler.node_id(), "Node disconnected");
        } else {
            debug!(node_id = %handler.node_id(), "Replaced node stream ended");
        }
    }

    async fn handle_node_info(
        &self,
        handler: &Arc<NodeStreamHandler>,
        info: NodeInfo,
        allowed: &[NodeStatus],
        node_manager: &dyn NodeManager,
    ) {
        let status = info.status();

        debug!(node_id = %info.node_id, status = %status, "Received node info");

        if info.node_id != handler.node_id() {
            warn!(
                node_id = %handler.node_id(),
                reported = %info.node_id,
                "Node info for a different node on this stream, ignoring"
            );
            return;
        }

        if !allowed.contains(&status) {
            warn!(node_id = %info.node_id, status = %status, "Node status is not in allowed list, unlinking");
            self.unlink(handler);
            return;
        }

        if let Err(e) = node_manager.set_node_info(info).await {
            warn!(node_id = %handler.node_id(), error = %e, "Failed to store node info");
            return;
        }

        if self.get_node_stream_handler(handler.node_id()).is_none() {
            if let Err(e) = self.link(handler) {
                debug!(node_id = %handler.node_id(), error = %e, "Node not relinked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::MockNodeManager;
    use iam_proto::{iam_incoming_messages, PauseNodeRequest, PauseNodeResponse};
    use tokio_stream::wrappers::ReceiverStream;

    type Inbound = ReceiverStream<Result<IamOutgoingMessages, Status>>;

    fn node_info_frame(node_id: &str, status: NodeStatus) -> IamOutgoingMessages {
        let mut info = NodeInfo {
            node_id: node_id.to_string(),
            ..Default::default()
        };
        info.set_status(status);
        IamOutgoingMessages {
            request_id: String::new(),
            message: Some(iam_outgoing_messages::Message::NodeInfo(info)),
        }
    }

    fn accepting_node_manager() -> Arc<dyn NodeManager> {
        let mut manager = MockNodeManager::new();
        manager.expect_set_node_info().returning(|_| Ok(()));
        Arc::new(manager)
    }

    fn node_channel() -> (mpsc::Sender<Result<IamOutgoingMessages, Status>>, Inbound) {
        let (tx, rx) = mpsc::channel(16);
        (tx, ReceiverStream::new(rx))
    }

    const UNPROVISIONED_ONLY: &[NodeStatus] = &[NodeStatus::Unprovisioned];

    #[tokio::test]
    async fn registration_with_allowed_status_is_linked() {
        let controller = Arc::new(NodeController::default());
        let (tx, inbound) = node_channel();
        tx.send(Ok(node_info_frame("node0", NodeStatus::Unprovisioned)))
            .await
            .expect("send");

        let _outbound = controller
            .register_node(UNPROVISIONED_ONLY, inbound, accepting_node_manager())
            .await
            .expect("registration should succeed");

        assert!(controller.get_node_stream_handler("node0").is_some());
        assert_eq!(controller.connected_node_ids(), vec!["node0".to_string()]);
    }

    #[tokio::test]
    async fn registration_with_disallowed_status_is_rejected() {
        let controller = Arc::new(NodeController::default());
        let (tx, inbound) = node_channel();
        tx.send(Ok(node_info_frame("node0", NodeStatus::Provisioned)))
            .await
            .expect("send");

        // the node manager must never see a rejected node
        let mut manager = MockNodeManager::new();
        manager.expect_set_node_info().never();

        let result = controller
            .register_node(UNPROVISIONED_ONLY, inbound, Arc::new(manager))
            .await;

        assert!(matches!(
            result,
            Err(IamError::NotAllowed {
                status: NodeStatus::Provisioned,
                ..
            })
        ));
        assert!(controller.get_node_stream_handler("node0").is_none());
    }

    #[tokio::test]
    async fn first_frame_must_be_node_info() {
        let controller = Arc::new(NodeController::default());
        let (tx, inbound) = node_channel();
        tx.send(Ok(IamOutgoingMessages {
            request_id: "x".into(),
            message: Some(iam_outgoing_messages::Message::PauseNodeResponse(
                PauseNodeResponse::default(),
            )),
        }))
        .await
        .expect("send");

        let result = controller
            .register_node(UNPROVISIONED_ONLY, inbound, accepting_node_manager())
            .await;
        assert!(matches!(result, Err(IamError::MissingNodeInfo)));
    }

    #[tokio::test]
    async fn closed_controller_rejects_registration() {
        let controller = Arc::new(NodeController::default());
        controller.close();

        let (_tx, inbound) = node_channel();
        let result = controller
            .register_node(UNPROVISIONED_ONLY, inbound, accepting_node_manager())
            .await;
        assert!(matches!(result, Err(IamError::HandlerClosed)));
    }

    #[tokio::test]
    async fn second_registration_replaces_first_and_fails_its_requests() {
        let controller = Arc::new(NodeController::default());

        let (tx1, inbound1) = node_channel();
        tx1.send(Ok(node_info_frame("node0", NodeStatus::Unprovisioned)))
            .await
            .expect("send");
        let mut outbound1 = controller
            .register_node(UNPROVISIONED_ONLY, inbound1, accepting_node_manager())
            .await
            .expect("first registration");

        let first = controller
            .get_node_stream_handler("node0")
            .expect("first handler");
        let pending = {
            let first = Arc::clone(&first);
            tokio::spawn(async move {
                first
                    .pause_node(PauseNodeRequest::default(), Duration::from_secs(30))
                    .await
            })
        };
        // wait until the request is on the wire
        let frame = outbound1.next().await.expect("frame").expect("ok");
        assert!(matches!(
            frame.message,
            Some(iam_incoming_messages::Message::PauseNodeRequest(_))
        ));

        let (tx2, inbound2) = node_channel();
        tx2.send(Ok(node_info_frame("node0", NodeStatus::Unprovisioned)))
            .await
            .expect("send");
        let _outbound2 = controller
            .register_node(UNPROVISIONED_ONLY, inbound2, accepting_node_manager())
            .await
            .expect("second registration");

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("pending request should resolve")
            .expect("join");
        assert!(matches!(result, Err(IamError::StreamClosed)));

        let current = controller
            .get_node_stream_handler("node0")
            .expect("second handler");
        assert!(!Arc::ptr_eq(&current, &first));
        assert!(first.is_closed());

        // the first stream ending must not unlink the replacement
        drop(tx1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let still = controller
            .get_node_stream_handler("node0")
            .expect("replacement stays linked");
        assert!(Arc::ptr_eq(&still, &current));
    }

    async fn register(
        controller: &Arc<NodeController>,
    ) -> (mpsc::Sender<Result<IamOutgoingMessages, Status>>, RegisterNodeStream) {
        let (tx, inbound) = node_channel();
        tx.send(Ok(node_info_frame("node0", NodeStatus::Unprovisioned)))
            .await
            .expect("send");
        let outbound = controller
            .register_node(UNPROVISIONED_ONLY, inbound, accepting_node_manager())
            .await
            .expect("registration");
        (tx, outbound)
    }

    async fn stream_ended(outbound: &mut RegisterNodeStream) -> bool {
        matches!(
            tokio::time::timeout(Duration::from_millis(200), outbound.next()).await,
            Ok(None)
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_registrations_leave_one_handler() {
        let controller = Arc::new(NodeController::default());

        let (_tx0, mut outbound0) = register(&controller).await;
        let first = controller
            .get_node_stream_handler("node0")
            .expect("first handler");
        let pending = {
            let first = Arc::clone(&first);
            tokio::spawn(async move {
                first
                    .pause_node(PauseNodeRequest::default(), Duration::from_secs(30))
                    .await
            })
        };
        outbound0.next().await.expect("frame").expect("ok");

        let (a, b) = tokio::join!(
            tokio::spawn({
                let controller = Arc::clone(&controller);
                async move { register(&controller).await }
            }),
            tokio::spawn({
                let controller = Arc::clone(&controller);
                async move { register(&controller).await }
            }),
        );
        let (_tx_a, mut outbound_a) = a.expect("join");
        let (_tx_b, mut outbound_b) = b.expect("join");

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("pending request should resolve")
            .expect("join");
        assert!(matches!(result, Err(IamError::StreamClosed)));
        assert!(first.is_closed());

        let ended_a = stream_ended(&mut outbound_a).await;
        let ended_b = stream_ended(&mut outbound_b).await;
        assert!(ended_a != ended_b, "exactly one registration must stay linked");
        assert_eq!(controller.connected_node_ids(), vec!["node0".to_string()]);

        // requests go out on the surviving stream only
        let current = controller
            .get_node_stream_handler("node0")
            .expect("current handler");
        assert!(!current.is_closed());
        let call = tokio::spawn(async move {
            current
                .pause_node(PauseNodeRequest::default(), Duration::from_millis(300))
                .await
        });
        let survivor = if ended_a { &mut outbound_b } else { &mut outbound_a };
        let frame = tokio::time::timeout(Duration::from_secs(1), survivor.next())
            .await
            .expect("request in time")
            .expect("stream open")
            .expect("ok");
        assert!(matches!(
            frame.message,
            Some(iam_incoming_messages::Message::PauseNodeRequest(_))
        ));
        assert!(matches!(call.await.expect("join"), Err(IamError::Timeout(_))));
    }

    #[tokio::test]
    async fn stream_end_deregisters_node() {
        let controller = Arc::new(NodeController::default());
        let mut events = controller.subscribe();

        let (tx, inbound) = node_channel();
        tx.send(Ok(node_info_frame("node0", NodeStatus::Unprovisioned)))
            .await
            .expect("send");
        let _outbound = controller
            .register_node(UNPROVISIONED_ONLY, inbound, accepting_node_manager())
            .await
            .expect("registration");

        assert_eq!(
            events.recv().await.expect("event"),
            NodeConnectionEvent::Connected("node0".into())
        );

        drop(tx);

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("disconnect event")
            .expect("event");
        assert_eq!(event, NodeConnectionEvent::Disconnected("node0".into()));
        assert!(controller.get_node_stream_handler("node0").is_none());
    }

    #[tokio::test]
    async fn response_frames_reach_waiting_caller() {
        let controller = Arc::new(NodeController::default());
        let (tx, inbound) = node_channel();
        tx.send(Ok(node_info_frame("node0", NodeStatus::Unprovisioned)))
            .await
            .expect("send");
        let mut outbound = controller
            .register_node(UNPROVISIONED_ONLY, inbound, accepting_node_manager())
            .await
            .expect("registration");

        let handler = controller.get_node_stream_handler("node0").expect("handler");
        let call = tokio::spawn(async move {
            handler
                .pause_node(PauseNodeRequest::default(), Duration::from_secs(5))
                .await
        });

        let frame = outbound.next().await.expect("frame").expect("ok");
        tx.send(Ok(IamOutgoingMessages {
            request_id: frame.request_id,
            message: Some(iam_outgoing_messages::Message::PauseNodeResponse(
                PauseNodeResponse::default(),
            )),
        }))
        .await
        .expect("send");

        let response = call.await.expect("join").expect("pause succeeds");
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn later_disallowed_status_unlinks_node() {
        let controller = Arc::new(NodeController::default());
        let (tx, inbound) = node_channel();
        tx.send(Ok(node_info_frame("node0", NodeStatus::Unprovisioned)))
            .await
            .expect("send");
        let _outbound = controller
            .register_node(UNPROVISIONED_ONLY, inbound, accepting_node_manager())
            .await
            .expect("registration");

        tx.send(Ok(node_info_frame("node0", NodeStatus::Provisioned)))
            .await
            .expect("send");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(controller.get_node_stream_handler("node0").is_none());
    }

    #[tokio::test]
    async fn close_ends_outbound_streams() {
        let controller = Arc::new(NodeController::default());
        let (tx, inbound) = node_channel();
        tx.send(Ok(node_info_frame("node0", NodeStatus::Unprovisioned)))
            .await
            .expect("send");
        let mut outbound = controller
            .register_node(UNPROVISIONED_ONLY, inbound, accepting_node_manager())
            .await
            .expect("registration");

        controller.close();

        let next = tokio::time::timeout(Duration::from_secs(1), outbound.next())
            .await
            .expect("stream should end");
        assert!(next.is_none());
        assert!(controller.connected_node_ids().is_empty());
    }

    #[tokio::test]
    async fn close_reports_linked_nodes_disconnected() {
        let controller = Arc::new(NodeController::default());
        let (_tx, _outbound) = register(&controller).await;

        let mut events = controller.subscribe();
        controller.close();

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("disconnect event")
            .expect("event");
        assert_eq!(event, NodeConnectionEvent::Disconnected("node0".into()));
    }

    #[tokio::test]
    async fn wait_for_connection_wakes_on_registration() {
        let controller = Arc::new(NodeController::default());

        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                controller
                    .wait_for_connection("node0", Duration::from_secs(5))
                    .await
            })
        };
        tokio::task::yield_now().await;

        let (tx, inbound) = node_channel();
        tx.send(Ok(node_info_frame("node0", NodeStatus::Unprovisioned)))
            .await
            .expect("send");
        let _outbound = controller
            .register_node(UNPROVISIONED_ONLY, inbound, accepting_node_manager())
            .await
            .expect("registration");

        let handler = waiter.await.expect("join");
        assert_eq!(handler.map(|h| h.node_id().to_string()).as_deref(), Some("node0"));
    }
}
