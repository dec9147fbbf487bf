//! Protected listener: node administration, provisioning, certificates and
//! permission registration
//!
//! Every node-addressed RPC runs locally when the node ID is empty or names
//! this node. Otherwise it is forwarded over the target's registration
//! stream through the shared retry policy. A node with no live stream
//! surfaces as `NOT_FOUND` rather than an embedded error.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use iam_proto::iam_certificate_service_server::{
    IamCertificateService, IamCertificateServiceServer,
};
use iam_proto::iam_nodes_service_server::{IamNodesService, IamNodesServiceServer};
use iam_proto::iam_permissions_service_server::{
    IamPermissionsService, IamPermissionsServiceServer,
};
use iam_proto::iam_provisioning_service_server::{
    IamProvisioningService, IamProvisioningServiceServer,
};
use iam_proto::{
    ApplyCertRequest, ApplyCertResponse, CertTypes, CreateKeyRequest, CreateKeyResponse,
    DeprovisionRequest, DeprovisionResponse, EmbeddedError, Empty, FinishProvisioningRequest,
    FinishProvisioningResponse, GetCertTypesRequest, NodeStatus, PauseNodeRequest,
    PauseNodeResponse, RegisterInstanceRequest, RegisterInstanceResponse, ResumeNodeRequest,
    ResumeNodeResponse, StartProvisioningRequest, StartProvisioningResponse,
    UnregisterInstanceRequest,
};
use tonic::transport::server::Router;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, error};

use super::public::PublicMessageHandler;
use crate::error::{IamError, ServiceError};
use crate::node_stream::NodeStreamHandler;
use crate::services::{PermHandler, ProvisionManager};

/// Nodes reconnecting after provisioning register on the protected listener
pub const PROTECTED_ALLOWED_STATUSES: &[NodeStatus] =
    &[NodeStatus::Provisioned, NodeStatus::Paused];

/// Handler for the protected gRPC services
///
/// Wraps a [`PublicMessageHandler`] sharing its registry and subscriptions,
/// admitting provisioned and paused nodes on RegisterNode.
#[derive(Clone)]
pub struct ProtectedMessageHandler {
    public: PublicMessageHandler,
    provision_manager: Arc<dyn ProvisionManager>,
}

impl ProtectedMessageHandler {
    /// Layer the protected surface over `public`
    pub fn new(public: &PublicMessageHandler, provision_manager: Arc<dyn ProvisionManager>) -> Self {
        debug!(node_id = %public.node_id(), "Initialize protected message handler");

        Self {
            public: public.with_allowed_statuses(PROTECTED_ALLOWED_STATUSES),
            provision_manager,
        }
    }

    /// The shared public layer, using the protected allow-list
    pub fn public(&self) -> &PublicMessageHandler {
        &self.public
    }

    /// Close the shared handler state
    pub fn close(&self) {
        debug!("Close protected message handler");
        self.public.close();
    }

    /// Register the public and protected services on `server`
    ///
    /// The permissions service needs a permission handler. Certificate,
    /// provisioning and nodes services only run on the main node.
    pub fn add_services(&self, server: &mut Server) -> Router {
        let main = self.public.is_main_node();
        let perms = self.public.services().perm_handler.is_some();

        self.public
            .add_services(server)
            .add_optional_service(perms.then(|| IamPermissionsServiceServer::new(self.clone())))
            .add_optional_service(main.then(|| IamCertificateServiceServer::new(self.clone())))
            .add_optional_service(main.then(|| IamProvisioningServiceServer::new(self.clone())))
            .add_optional_service(main.then(|| IamNodesServiceServer::new(self.clone())))
    }

    /// Forward a request to `node_id` through the retry policy
    async fn forward<F, Fut, T>(&self, node_id: &str, operation: &str, call: F) -> Result<T, Status>
    where
        F: Fn(Arc<NodeStreamHandler>) -> Fut,
        Fut: Future<Output = Result<T, IamError>>,
    {
        let controller = &self.public.services().node_controller;

        self.public
            .request_with_retry(operation, || {
                let pending = controller.get_node_stream_handler(node_id).map(&call);
                async move {
                    match pending {
                        Some(request) => request.await,
                        None => Err(IamError::StreamNotFound),
                    }
                }
            })
            .await
            .map_err(|e| {
                error!(node_id = %node_id, operation = %operation, error = %e, "Forwarded request failed");
                Status::from(e)
            })
    }

    /// Record `status` unless the response already carries an error
    async fn update_status<R: EmbeddedError + Send>(
        &self,
        node_id: &str,
        status: NodeStatus,
        response: &mut R,
    ) {
        if response.error().is_some() {
            return;
        }

        if let Err(e) = self.public.set_node_status(node_id, status).await {
            error!(node_id = %node_id, status = %status, error = %e, "Set node status failed");
            response.set_error(e.to_error_info());
        }
    }

    fn perm_handler(&self) -> Result<&Arc<dyn PermHandler>, Status> {
        self.public
            .services()
            .perm_handler
            .as_ref()
            .ok_or_else(|| Status::unimplemented("permissions service is not configured"))
    }

    async fn resolve_subject(&self, subject: &str) -> Result<String, ServiceError> {
        if !subject.is_empty() {
            return Ok(subject.to_string());
        }

        match &self.public.services().ident_handler {
            Some(ident) => ident.get_system_id().await,
            None => Err(ServiceError::NotFound("no ident handler".to_string())),
        }
    }
}

#[tonic::async_trait]
impl IamNodesService for ProtectedMessageHandler {
    async fn pause_node(
        &self,
        request: Request<PauseNodeRequest>,
    ) -> Result<Response<PauseNodeResponse>, Status> {
        let request = request.into_inner();
        let node_id = request.node_id.clone();

        debug!(node_id = %node_id, "Process pause node");

        let mut response = if self.public.process_on_this_node(&node_id) {
            PauseNodeResponse::default()
        } else {
            let timeout = self.public.config().timeouts.default;
            self.forward(&node_id, "pause_node", |handler| {
                let request = request.clone();
                async move { handler.pause_node(request, timeout).await }
            })
            .await?
        };

        self.update_status(&node_id, NodeStatus::Paused, &mut response)
            .await;

        Ok(Response::new(response))
    }

    async fn resume_node(
        &self,
        request: Request<ResumeNodeRequest>,
    ) -> Result<Response<ResumeNodeResponse>, Status> {
        let request = request.into_inner();
        let node_id = request.node_id.clone();

        debug!(node_id = %node_id, "Process resume node");

        let mut response = if self.public.process_on_this_node(&node_id) {
            ResumeNodeResponse::default()
        } else {
            let timeout = self.public.config().timeouts.default;
            self.forward(&node_id, "resume_node", |handler| {
                let request = request.clone();
                async move { handler.resume_node(request, timeout).await }
            })
            .await?
        };

        self.update_status(&node_id, NodeStatus::Provisioned, &mut response)
            .await;

        Ok(Response::new(response))
    }
}

#[tonic::async_trait]
impl IamProvisioningService for ProtectedMessageHandler {
    async fn get_cert_types(
        &self,
        request: Request<GetCertTypesRequest>,
    ) -> Result<Response<CertTypes>, Status> {
        let request = request.into_inner();
        let node_id = request.node_id.clone();

        debug!(node_id = %node_id, "Process get cert types");

        if !self.public.process_on_this_node(&node_id) {
            let timeout = self.public.config().timeouts.default;
            let response = self
                .forward(&node_id, "get_cert_types", |handler| {
                    let request = request.clone();
                    async move { handler.get_cert_types(request, timeout).await }
                })
                .await?;

            return Ok(Response::new(response));
        }

        let mut response = CertTypes::default();

        match self.provision_manager.get_cert_types().await {
            Ok(types) => response.types = types,
            Err(e) => {
                error!(error = %e, "Get cert types failed");
                response.set_error(e.to_error_info());
            }
        }

        Ok(Response::new(response))
    }

    async fn start_provisioning(
        &self,
        request: Request<StartProvisioningRequest>,
    ) -> Result<Response<StartProvisioningResponse>, Status> {
        let request = request.into_inner();
        let node_id = request.node_id.clone();

        debug!(node_id = %node_id, "Process start provisioning");

        if !self.public.process_on_this_node(&node_id) {
            let timeout = self.public.config().timeouts.provisioning;
            let response = self
                .forward(&node_id, "start_provisioning", |handler| {
                    let request = request.clone();
                    async move { handler.start_provisioning(request, timeout).await }
                })
                .await?;

            return Ok(Response::new(response));
        }

        let mut response = StartProvisioningResponse::default();

        if let Err(e) = self
            .provision_manager
            .start_provisioning(&request.password)
            .await
        {
            error!(error = %e, "Start provisioning failed");
            response.set_error(e.to_error_info());
        }

        Ok(Response::new(response))
    }

    async fn finish_provisioning(
        &self,
        request: Request<FinishProvisioningRequest>,
    ) -> Result<Response<FinishProvisioningResponse>, Status> {
        let request = request.into_inner();
        let node_id = request.node_id.clone();

        debug!(node_id = %node_id, "Process finish provisioning");

        let mut response = if self.public.process_on_this_node(&node_id) {
            let mut response = FinishProvisioningResponse::default();
            if let Err(e) = self
                .provision_manager
                .finish_provisioning(&request.password)
                .await
            {
                error!(error = %e, "Finish provisioning failed");
                response.set_error(e.to_error_info());
            }
            response
        } else {
            let timeout = self.public.config().timeouts.provisioning;
            self.forward(&node_id, "finish_provisioning", |handler| {
                let request = request.clone();
                async move { handler.finish_provisioning(request, timeout).await }
            })
            .await?
        };

        self.update_status(&node_id, NodeStatus::Provisioned, &mut response)
            .await;

        Ok(Response::new(response))
    }

    async fn deprovision(
        &self,
        request: Request<DeprovisionRequest>,
    ) -> Result<Response<DeprovisionResponse>, Status> {
        let request = request.into_inner();
        let node_id = request.node_id.clone();

        debug!(node_id = %node_id, "Process deprovision");

        let mut response = if self.public.process_on_this_node(&node_id) {
            let mut response = DeprovisionResponse::default();
            if let Err(e) = self.provision_manager.deprovision(&request.password).await {
                error!(error = %e, "Deprovision failed");
                response.set_error(e.to_error_info());
            }
            response
        } else {
            let timeout = self.public.config().timeouts.provisioning;
            self.forward(&node_id, "deprovision", |handler| {
                let request = request.clone();
                async move { handler.deprovision(request, timeout).await }
            })
            .await?
        };

        self.update_status(&node_id, NodeStatus::Unprovisioned, &mut response)
            .await;

        Ok(Response::new(response))
    }
}

#[tonic::async_trait]
impl IamCertificateService for ProtectedMessageHandler {
    async fn create_key(
        &self,
        request: Request<CreateKeyRequest>,
    ) -> Result<Response<CreateKeyResponse>, Status> {
        let mut request = request.into_inner();
        let node_id = request.node_id.clone();

        debug!(node_id = %node_id, cert_type = %request.cert_type, "Process create key");

        let mut response = CreateKeyResponse {
            node_id: node_id.clone(),
            cert_type: request.cert_type.clone(),
            ..Default::default()
        };

        request.subject = match self.resolve_subject(&request.subject).await {
            Ok(subject) => subject,
            Err(e) => {
                error!(error = %e, "Resolve key subject failed");
                response.set_error(e.to_error_info());
                return Ok(Response::new(response));
            }
        };

        if !self.public.process_on_this_node(&node_id) {
            let timeout = self.public.config().timeouts.default;
            let response = self
                .forward(&node_id, "create_key", |handler| {
                    let request = request.clone();
                    async move { handler.create_key(request, timeout).await }
                })
                .await?;

            return Ok(Response::new(response));
        }

        match self
            .provision_manager
            .create_key(&request.cert_type, &request.subject, &request.password)
            .await
        {
            Ok(csr) => response.csr = csr,
            Err(e) => {
                error!(cert_type = %request.cert_type, error = %e, "Create key failed");
                response.set_error(e.to_error_info());
            }
        }

        Ok(Response::new(response))
    }

    async fn apply_cert(
        &self,
        request: Request<ApplyCertRequest>,
    ) -> Result<Response<ApplyCertResponse>, Status> {
        let request = request.into_inner();
        let node_id = request.node_id.clone();

        debug!(node_id = %node_id, cert_type = %request.cert_type, "Process apply cert");

        if !self.public.process_on_this_node(&node_id) {
            let timeout = self.public.config().timeouts.default;
            let response = self
                .forward(&node_id, "apply_cert", |handler| {
                    let request = request.clone();
                    async move { handler.apply_cert(request, timeout).await }
                })
                .await?;

            return Ok(Response::new(response));
        }

        let mut response = ApplyCertResponse {
            node_id,
            cert_type: request.cert_type.clone(),
            ..Default::default()
        };

        match self
            .provision_manager
            .apply_cert(&request.cert_type, &request.cert)
            .await
        {
            Ok(applied) => {
                response.cert_url = applied.cert_url;
                response.serial = applied.serial;
            }
            Err(e) => {
                error!(cert_type = %request.cert_type, error = %e, "Apply cert failed");
                response.set_error(e.to_error_info());
            }
        }

        Ok(Response::new(response))
    }
}

#[tonic::async_trait]
impl IamPermissionsService for ProtectedMessageHandler {
    async fn register_instance(
        &self,
        request: Request<RegisterInstanceRequest>,
    ) -> Result<Response<RegisterInstanceResponse>, Status> {
        let request = request.into_inner();
        let instance = request
            .instance
            .ok_or_else(|| Status::invalid_argument("instance is required"))?;

        debug!(
            service_id = %instance.service_id,
            subject_id = %instance.subject_id,
            instance = instance.instance,
            "Process register instance"
        );

        let permissions: HashMap<String, HashMap<String, String>> = request
            .permissions
            .into_iter()
            .map(|(server, perms)| (server, perms.permissions))
            .collect();

        let secret = self
            .perm_handler()?
            .register_instance(instance, permissions)
            .await
            .map_err(|e| {
                error!(error = %e, "Register instance failed");
                Status::from(e)
            })?;

        Ok(Response::new(RegisterInstanceResponse { secret }))
    }

    async fn unregister_instance(
        &self,
        request: Request<UnregisterInstanceRequest>,
    ) -> Result<Response<Empty>, Status> {
        let instance = request
            .into_inner()
            .instance
            .ok_or_else(|| Status::invalid_argument("instance is required"))?;

        debug!(
            service_id = %instance.service_id,
            subject_id = %instance.subject_id,
            instance = instance.instance,
            "Process unregister instance"
        );

        self.perm_handler()?
            .unregister_instance(&instance)
            .await
            .map_err(|e| {
                error!(error = %e, "Unregister instance failed");
                Status::from(e)
            })?;

        Ok(Response::new(Empty {}))
    }
}
