//! In-memory node info store

use std::sync::Weak;

use async_trait::async_trait;
use dashmap::DashMap;
use iam_proto::{NodeInfo, NodeStatus};
use iam_server::{NodeInfoListener, NodeManager, ServiceError};
use parking_lot::Mutex;
use tracing::debug;

/// [`NodeManager`] keeping node info in a concurrent map
///
/// Listeners are notified after every change that alters a node's info and
/// after every removal. Notifications run outside the map's locks.
#[derive(Default)]
pub struct MemoryNodeManager {
    nodes: DashMap<String, NodeInfo>,
    listeners: Mutex<Vec<Weak<dyn NodeInfoListener>>>,
}

impl MemoryNodeManager {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn live_listeners(&self) -> Vec<std::sync::Arc<dyn NodeInfoListener>> {
        let mut listeners = self.listeners.lock();
        listeners.retain(|l| l.strong_count() > 0);
        listeners.iter().filter_map(Weak::upgrade).collect()
    }

    fn notify_changed(&self, info: &NodeInfo) {
        for listener in self.live_listeners() {
            listener.on_node_info_change(info);
        }
    }

    fn store(&self, info: NodeInfo) -> bool {
        match self.nodes.insert(info.node_id.clone(), info.clone()) {
            Some(previous) => previous != info,
            None => true,
        }
    }
}

#[async_trait]
impl NodeManager for MemoryNodeManager {
    async fn set_node_info(&self, info: NodeInfo) -> Result<(), ServiceError> {
        if info.node_id.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "node ID can't be empty".to_string(),
            ));
        }

        if self.store(info.clone()) {
            debug!(node_id = %info.node_id, status = %info.status(), "Node info changed");
            self.notify_changed(&info);
        }

        Ok(())
    }

    async fn set_node_status(&self, node_id: &str, status: NodeStatus) -> Result<(), ServiceError> {
        let info = {
            let mut entry = self
                .nodes
                .get_mut(node_id)
                .ok_or_else(|| ServiceError::NotFound(format!("node {}", node_id)))?;

            if entry.status() == status {
                return Ok(());
            }

            entry.set_status(status);
            entry.clone()
        };

        debug!(node_id = %node_id, status = %status, "Node status changed");
        self.notify_changed(&info);

        Ok(())
    }

    async fn get_node_info(&self, node_id: &str) -> Result<NodeInfo, ServiceError> {
        self.nodes
            .get(node_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| ServiceError::NotFound(format!("node {}", node_id)))
    }

    async fn get_all_node_ids(&self) -> Result<Vec<String>, ServiceError> {
        let mut ids: Vec<String> = self.nodes.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }

    async fn remove_node_info(&self, node_id: &str) -> Result<(), ServiceError> {
        if self.nodes.remove(node_id).is_none() {
            return Err(ServiceError::NotFound(format!("node {}", node_id)));
        }

        debug!(node_id = %node_id, "Node info removed");

        for listener in self.live_listeners() {
            listener.on_node_removed(node_id);
        }

        Ok(())
    }

    fn subscribe_node_info_change(&self, listener: Weak<dyn NodeInfoListener>) {
        self.listeners.lock().push(listener);
    }
}
