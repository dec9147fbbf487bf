//! Public listener: identity, certificates, node lookups and registration

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use iam_proto::iam_public_identity_service_server::{
    IamPublicIdentityService, IamPublicIdentityServiceServer,
};
use iam_proto::iam_public_nodes_service_server::{
    IamPublicNodesService, IamPublicNodesServiceServer,
};
use iam_proto::iam_public_permissions_service_server::{
    IamPublicPermissionsService, IamPublicPermissionsServiceServer,
};
use iam_proto::iam_public_service_server::{IamPublicService, IamPublicServiceServer};
use iam_proto::iam_version_service_server::{IamVersionService, IamVersionServiceServer};
use iam_proto::{
    ApiVersion, CertInfo, Empty, GetCertRequest, GetNodeInfoRequest, IamOutgoingMessages,
    NodeInfo, NodeStatus, NodesId, Permissions, PermissionsRequest, PermissionsResponse,
    SubscribeCertChangedRequest, Subjects, SystemInfo, IAM_API_VERSION,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Router;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::cert_writer::{CertSubscription, CertWriter};
use super::HandlerConfig;
use crate::error::{IamError, ServiceError};
use crate::node_controller::SharedNodeController;
use crate::retry::request_with_retry;
use crate::services::{
    CertProvider, IdentHandler, NodeInfoListener, NodeInfoProvider, NodeManager, PermHandler,
    SubjectsObserver,
};
use crate::stream_writer::{StreamWriter, Subscription};

/// Only brand-new nodes may register on the public listener
pub const PUBLIC_ALLOWED_STATUSES: &[NodeStatus] = &[NodeStatus::Unprovisioned];

/// Collaborators the handlers call into
#[derive(Clone)]
pub struct HandlerServices {
    /// Registry of connected nodes
    pub node_controller: SharedNodeController,
    /// This node's info and status
    pub node_info_provider: Arc<dyn NodeInfoProvider>,
    /// Durable info of every node
    pub node_manager: Arc<dyn NodeManager>,
    /// Certificate lookup
    pub cert_provider: Arc<dyn CertProvider>,
    /// Identity, when an identifier is configured
    pub ident_handler: Option<Arc<dyn IdentHandler>>,
    /// Permission registry, when enabled
    pub perm_handler: Option<Arc<dyn PermHandler>>,
}

struct HandlerState {
    node_id: String,
    main_node: bool,
    services: HandlerServices,
    config: HandlerConfig,
    node_changed: Arc<StreamWriter<NodeInfo>>,
    subjects_changed: Arc<StreamWriter<Subjects>>,
    cert_writers: Arc<DashMap<Uuid, Arc<CertWriter>>>,
    closed: Mutex<CancellationToken>,
}

/// Handler for the public gRPC services
///
/// Cloning is cheap and clones share all state, including the node
/// registry, subscription writers and the closed flag.
#[derive(Clone)]
pub struct PublicMessageHandler {
    state: Arc<HandlerState>,
    allowed_statuses: &'static [NodeStatus],
}

impl PublicMessageHandler {
    /// Create a handler for the node described by `node_info`
    pub fn new(node_info: &NodeInfo, services: HandlerServices, config: HandlerConfig) -> Self {
        let buffer = config.subscriber_buffer;

        debug!(node_id = %node_info.node_id, main_node = node_info.is_main_node(), "Initialize message handler");

        Self {
            state: Arc::new(HandlerState {
                node_id: node_info.node_id.clone(),
                main_node: node_info.is_main_node(),
                services,
                config,
                node_changed: StreamWriter::with_buffer("node-changed", buffer),
                subjects_changed: StreamWriter::with_buffer("subjects-changed", buffer),
                cert_writers: Arc::new(DashMap::new()),
                closed: Mutex::new(CancellationToken::new()),
            }),
            allowed_statuses: PUBLIC_ALLOWED_STATUSES,
        }
    }

    /// Same handler state, admitting registrations with `allowed` statuses
    pub fn with_allowed_statuses(&self, allowed: &'static [NodeStatus]) -> Self {
        Self {
            state: Arc::clone(&self.state),
            allowed_statuses: allowed,
        }
    }

    /// Statuses admitted by this handler's RegisterNode
    pub fn allowed_statuses(&self) -> &'static [NodeStatus] {
        self.allowed_statuses
    }

    /// ID of the node this handler runs on
    pub fn node_id(&self) -> &str {
        &self.state.node_id
    }

    /// Whether this node hosts the node registry
    pub fn is_main_node(&self) -> bool {
        self.state.main_node
    }

    /// Collaborators this handler calls into
    pub fn services(&self) -> &HandlerServices {
        &self.state.services
    }

    /// Handler tunables
    pub fn config(&self) -> &HandlerConfig {
        &self.state.config
    }

    /// Whether a request for `node_id` runs here rather than being forwarded
    ///
    /// An empty node ID always means this node.
    pub fn process_on_this_node(&self, node_id: &str) -> bool {
        node_id.is_empty() || node_id == self.state.node_id
    }

    /// Record a new status for `node_id`
    ///
    /// The local node info provider is updated too when the target is this
    /// node. The node manager is always updated, using this node's ID when
    /// `node_id` is empty.
    pub async fn set_node_status(
        &self,
        node_id: &str,
        status: NodeStatus,
    ) -> Result<(), ServiceError> {
        if self.process_on_this_node(node_id) {
            self.state
                .services
                .node_info_provider
                .set_node_status(status)
                .await?;
        }

        let target = if node_id.is_empty() {
            self.state.node_id.as_str()
        } else {
            node_id
        };

        self.state
            .services
            .node_manager
            .set_node_status(target, status)
            .await
    }

    /// Run a forwarded request with the handler's retry policy
    ///
    /// Aborts with [`IamError::HandlerClosed`] once the handler is closed.
    pub async fn request_with_retry<F, Fut, T>(
        &self,
        operation_name: &str,
        operation: F,
    ) -> Result<T, IamError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, IamError>>,
    {
        let closed = self.state.closed.lock().clone();
        request_with_retry(&self.state.config.retry, &closed, operation_name, operation).await
    }

    /// Reopen subscriptions after [`PublicMessageHandler::close`]
    pub fn start(&self) {
        {
            let mut closed = self.state.closed.lock();
            if closed.is_cancelled() {
                *closed = CancellationToken::new();
            }
        }

        self.state.node_changed.start();
        self.state.subjects_changed.start();
    }

    /// Abort pending retries and end every subscription
    pub fn close(&self) {
        debug!(node_id = %self.state.node_id, "Close message handler");

        self.state.closed.lock().cancel();
        self.state.node_changed.close();
        self.state.subjects_changed.close();

        for writer in self.state.cert_writers.iter() {
            writer.value().close();
        }
    }

    /// Whether [`PublicMessageHandler::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.state.closed.lock().is_cancelled()
    }

    /// Register the public services on `server`
    ///
    /// The permissions service needs a permission handler. The identity and
    /// nodes services only run on the main node.
    pub fn add_services(&self, server: &mut Server) -> Router {
        let services = &self.state.services;
        let main = self.state.main_node;

        server
            .add_service(IamVersionServiceServer::new(self.clone()))
            .add_service(IamPublicServiceServer::new(self.clone()))
            .add_optional_service(
                services
                    .perm_handler
                    .as_ref()
                    .map(|_| IamPublicPermissionsServiceServer::new(self.clone())),
            )
            .add_optional_service(
                (main && services.ident_handler.is_some())
                    .then(|| IamPublicIdentityServiceServer::new(self.clone())),
            )
            .add_optional_service(main.then(|| IamPublicNodesServiceServer::new(self.clone())))
    }

    fn ident_handler(&self) -> Result<&Arc<dyn IdentHandler>, Status> {
        self.state
            .services
            .ident_handler
            .as_ref()
            .ok_or_else(|| Status::unimplemented("identity service is not configured"))
    }

    fn perm_handler(&self) -> Result<&Arc<dyn PermHandler>, Status> {
        self.state
            .services
            .perm_handler
            .as_ref()
            .ok_or_else(|| Status::unimplemented("permissions service is not configured"))
    }
}

impl NodeInfoListener for PublicMessageHandler {
    fn on_node_info_change(&self, info: &NodeInfo) {
        debug!(node_id = %info.node_id, status = %info.status(), "Node info changed");
        self.state.node_changed.write_to_streams(info);
    }

    fn on_node_removed(&self, node_id: &str) {
        debug!(node_id = %node_id, "Node removed");
    }
}

impl SubjectsObserver for PublicMessageHandler {
    fn subjects_changed(&self, subjects: &[String]) {
        debug!(count = subjects.len(), "Subjects changed");
        self.state.subjects_changed.write_to_streams(&Subjects {
            subjects: subjects.to_vec(),
        });
    }
}

#[tonic::async_trait]
impl IamVersionService for PublicMessageHandler {
    async fn get_api_version(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<ApiVersion>, Status> {
        debug!("Process get API version");

        Ok(Response::new(ApiVersion {
            version: IAM_API_VERSION,
        }))
    }
}

#[tonic::async_trait]
impl IamPublicService for PublicMessageHandler {
    type SubscribeCertChangedStream = CertSubscription;

    async fn get_node_info(&self, _request: Request<Empty>) -> Result<Response<NodeInfo>, Status> {
        debug!("Process get node info");

        let info = self
            .state
            .services
            .node_info_provider
            .get_node_info()
            .await?;

        Ok(Response::new(info))
    }

    async fn get_cert(
        &self,
        request: Request<GetCertRequest>,
    ) -> Result<Response<CertInfo>, Status> {
        let request = request.into_inner();

        debug!(cert_type = %request.cert_type, serial = %request.serial, "Process get cert");

        let serial = hex::decode(&request.serial).map_err(|e| {
            error!(serial = %request.serial, error = %e, "Failed to convert serial number");
            Status::invalid_argument(format!("invalid serial: {}", e))
        })?;

        let info = self
            .state
            .services
            .cert_provider
            .get_cert(&request.cert_type, &request.issuer, &serial)
            .await
            .map_err(|e| {
                error!(cert_type = %request.cert_type, error = %e, "Failed to get cert");
                Status::from(e)
            })?;

        Ok(Response::new(CertInfo {
            cert_type: request.cert_type,
            key_url: info.key_url,
            cert_url: info.cert_url,
        }))
    }

    async fn subscribe_cert_changed(
        &self,
        request: Request<SubscribeCertChangedRequest>,
    ) -> Result<Response<Self::SubscribeCertChangedStream>, Status> {
        let request = request.into_inner();

        debug!(cert_type = %request.cert_type, "Process subscribe cert changed");

        if self.is_closed() {
            return Err(IamError::HandlerClosed.into());
        }

        let subscription = CertSubscription::open(
            &request.cert_type,
            self.state.config.subscriber_buffer,
            Arc::clone(&self.state.services.cert_provider),
            Arc::clone(&self.state.cert_writers),
        )
        .map_err(|e| {
            error!(cert_type = %request.cert_type, error = %e, "Failed to subscribe cert changed");
            Status::from(e)
        })?;

        Ok(Response::new(subscription))
    }
}

#[tonic::async_trait]
impl IamPublicIdentityService for PublicMessageHandler {
    type SubscribeSubjectsChangedStream = Subscription<Subjects>;

    async fn get_system_info(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<SystemInfo>, Status> {
        debug!("Process get system info");

        let ident = self.ident_handler()?;
        let system_id = ident.get_system_id().await?;
        let unit_model = ident.get_unit_model().await?;

        Ok(Response::new(SystemInfo {
            system_id,
            unit_model,
        }))
    }

    async fn get_subjects(&self, _request: Request<Empty>) -> Result<Response<Subjects>, Status> {
        debug!("Process get subjects");

        let subjects = self.ident_handler()?.get_subjects().await?;

        Ok(Response::new(Subjects { subjects }))
    }

    async fn subscribe_subjects_changed(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::SubscribeSubjectsChangedStream>, Status> {
        debug!("Process subscribe subjects changed");

        Ok(Response::new(self.state.subjects_changed.handle_stream()?))
    }
}

#[tonic::async_trait]
impl IamPublicPermissionsService for PublicMessageHandler {
    async fn get_permissions(
        &self,
        request: Request<PermissionsRequest>,
    ) -> Result<Response<PermissionsResponse>, Status> {
        let request = request.into_inner();

        debug!(functional_server_id = %request.functional_server_id, "Process get permissions");

        let (instance, permissions) = self
            .perm_handler()?
            .get_permissions(&request.secret, &request.functional_server_id)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to get permissions");
                Status::from(e)
            })?;

        Ok(Response::new(PermissionsResponse {
            instance: Some(instance),
            permissions: Some(Permissions { permissions }),
        }))
    }
}

#[tonic::async_trait]
impl IamPublicNodesService for PublicMessageHandler {
    type SubscribeNodeChangedStream = Subscription<NodeInfo>;
    type RegisterNodeStream = crate::node_controller::RegisterNodeStream;

    async fn get_all_node_ids(&self, _request: Request<Empty>) -> Result<Response<NodesId>, Status> {
        debug!("Process get all node IDs");

        let ids = self
            .state
            .services
            .node_manager
            .get_all_node_ids()
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to get all node IDs");
                Status::from(e)
            })?;

        Ok(Response::new(NodesId { ids }))
    }

    async fn get_node_info(
        &self,
        request: Request<GetNodeInfoRequest>,
    ) -> Result<Response<NodeInfo>, Status> {
        let node_id = request.into_inner().node_id;

        debug!(node_id = %node_id, "Process get node info");

        let info = self
            .state
            .services
            .node_manager
            .get_node_info(&node_id)
            .await
            .map_err(|e| {
                error!(node_id = %node_id, error = %e, "Failed to get node info");
                Status::from(e)
            })?;

        Ok(Response::new(info))
    }

    async fn subscribe_node_changed(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::SubscribeNodeChangedStream>, Status> {
        debug!("Process subscribe node changed");

        Ok(Response::new(self.state.node_changed.handle_stream()?))
    }

    #[instrument(skip(self, request), fields(allowed = ?self.allowed_statuses))]
    async fn register_node(
        &self,
        request: Request<Streaming<IamOutgoingMessages>>,
    ) -> Result<Response<Self::RegisterNodeStream>, Status> {
        debug!("Process register node");

        if self.is_closed() {
            return Err(IamError::HandlerClosed.into());
        }

        let stream = self
            .state
            .services
            .node_controller
            .register_node(
                self.allowed_statuses,
                request.into_inner(),
                Arc::clone(&self.state.services.node_manager),
            )
            .await?;

        Ok(Response::new(stream))
    }
}
