//! Collaborator interfaces consumed by the message handlers
//!
//! The handlers never own node persistence, identity, permission or
//! certificate logic. They call these traits, which the binary implements
//! with file-backed and in-memory services and tests replace with mocks.

use std::collections::HashMap;
use std::sync::Weak;

use async_trait::async_trait;
use iam_proto::{CertInfo, InstanceIdent, NodeInfo, NodeStatus};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use crate::error::ServiceError;

/// Receives node info changes from the node manager
pub trait NodeInfoListener: Send + Sync {
    /// A node's durable info changed
    fn on_node_info_change(&self, info: &NodeInfo);

    /// A node was removed from the durable store
    fn on_node_removed(&self, node_id: &str);
}

/// Receives subject list changes from the ident handler
pub trait SubjectsObserver: Send + Sync {
    /// The subject list changed
    fn subjects_changed(&self, subjects: &[String]);
}

/// Receives certificate rotations from the cert provider
pub trait CertReceiver: Send + Sync {
    /// A certificate of the subscribed type changed
    fn on_cert_changed(&self, info: &CertInfo);
}

/// Local node info and status
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeInfoProvider: Send + Sync {
    /// Current info of this node, including its live status
    async fn get_node_info(&self) -> Result<NodeInfo, ServiceError>;

    /// Persist a new status for this node
    async fn set_node_status(&self, status: NodeStatus) -> Result<(), ServiceError>;
}

/// Durable per-node info store kept by the main node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeManager: Send + Sync {
    /// Insert or replace a node's info
    async fn set_node_info(&self, info: NodeInfo) -> Result<(), ServiceError>;

    /// Update the status of a known node
    async fn set_node_status(&self, node_id: &str, status: NodeStatus)
        -> Result<(), ServiceError>;

    /// Info of one node
    async fn get_node_info(&self, node_id: &str) -> Result<NodeInfo, ServiceError>;

    /// IDs of every known node
    async fn get_all_node_ids(&self) -> Result<Vec<String>, ServiceError>;

    /// Drop a node from the store
    async fn remove_node_info(&self, node_id: &str) -> Result<(), ServiceError>;

    /// Register a listener for info changes and removals
    fn subscribe_node_info_change(&self, listener: Weak<dyn NodeInfoListener>);
}

/// System identity and subjects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentHandler: Send + Sync {
    /// Unique system ID
    async fn get_system_id(&self) -> Result<String, ServiceError>;

    /// Unit model string
    async fn get_unit_model(&self) -> Result<String, ServiceError>;

    /// Current subjects
    async fn get_subjects(&self) -> Result<Vec<String>, ServiceError>;

    /// Register an observer for subject changes
    fn subscribe_subjects_changed(&self, observer: Weak<dyn SubjectsObserver>);
}

/// Permission registry for workload instances
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PermHandler: Send + Sync {
    /// Register an instance and return its secret
    ///
    /// Returns [`ServiceError::ResourceExhausted`] when the registry is full.
    async fn register_instance(
        &self,
        instance: InstanceIdent,
        permissions: HashMap<String, HashMap<String, String>>,
    ) -> Result<String, ServiceError>;

    /// Remove an instance and its secret
    async fn unregister_instance(&self, instance: &InstanceIdent) -> Result<(), ServiceError>;

    /// Look up the permissions granted to a secret for one functional server
    async fn get_permissions(
        &self,
        secret: &str,
        functional_server_id: &str,
    ) -> Result<(InstanceIdent, HashMap<String, String>), ServiceError>;
}

/// Certificate lookup and change notifications
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CertProvider: Send + Sync {
    /// Certificate of a type, optionally selected by issuer and serial
    ///
    /// Empty `issuer` and `serial` select the most recent certificate.
    async fn get_cert(
        &self,
        cert_type: &str,
        issuer: &[u8],
        serial: &[u8],
    ) -> Result<CertInfo, ServiceError>;

    /// Subscribe to rotations of a certificate type
    fn subscribe_cert_changed(
        &self,
        cert_type: &str,
        receiver: std::sync::Arc<dyn CertReceiver>,
    ) -> Result<Uuid, ServiceError>;

    /// Drop a subscription created by [`CertProvider::subscribe_cert_changed`]
    fn unsubscribe_cert_changed(&self, subscription: Uuid) -> Result<(), ServiceError>;
}

/// A certificate installed by [`ProvisionManager::apply_cert`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedCert {
    /// Location of the stored certificate
    pub cert_url: String,
    /// Certificate serial number as uppercase hex
    pub serial: String,
}

/// Provisioning lifecycle and certificate issuance on this node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProvisionManager: Send + Sync {
    /// Certificate types this node can issue keys for
    async fn get_cert_types(&self) -> Result<Vec<String>, ServiceError>;

    /// Begin provisioning
    async fn start_provisioning(&self, password: &str) -> Result<(), ServiceError>;

    /// Complete provisioning
    async fn finish_provisioning(&self, password: &str) -> Result<(), ServiceError>;

    /// Return the node to the unprovisioned state
    async fn deprovision(&self, password: &str) -> Result<(), ServiceError>;

    /// Generate a key pair and return a CSR in PEM form
    async fn create_key(
        &self,
        cert_type: &str,
        subject: &str,
        password: &str,
    ) -> Result<String, ServiceError>;

    /// Install a signed certificate
    async fn apply_cert(&self, cert_type: &str, pem_cert: &str)
        -> Result<AppliedCert, ServiceError>;
}

/// Hooks the provision manager invokes around lifecycle steps
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProvisionCallback: Send + Sync {
    /// Called before provisioning starts
    async fn on_start_provisioning(&self, password: &str) -> Result<(), ServiceError>;

    /// Called when provisioning completes
    async fn on_finish_provisioning(&self, password: &str) -> Result<(), ServiceError>;

    /// Called when the node is deprovisioned
    async fn on_deprovision(&self, password: &str) -> Result<(), ServiceError>;

    /// Called to encrypt the node's disk during provisioning
    async fn on_encrypt_disk(&self, password: &str) -> Result<(), ServiceError>;
}
