//! Secondary-node side of the RegisterNode stream
//!
//! The client dials the main node, sends this node's info as the first
//! frame and then serves forwarded requests until the stream ends. Requests
//! run against the local provision manager and node info provider. Their
//! results travel back as response frames that echo the request ID.
//!
//! An unprovisioned node registers on the main node's public listener and
//! every other node on the protected one. When a request moves the node
//! across that boundary, the client finishes the current exchange and
//! reconnects to the other listener.
//!
//! Rotated TLS credentials are picked up the same way: the session ends
//! after the request in progress and the next one dials with the new
//! identity.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use iam_proto::iam_public_nodes_service_client::IamPublicNodesServiceClient;
use iam_proto::{
    iam_incoming_messages, iam_outgoing_messages, ApplyCertRequest, ApplyCertResponse,
    CertTypes, CreateKeyRequest, CreateKeyResponse, DeprovisionResponse, EmbeddedError,
    FinishProvisioningResponse, IamIncomingMessages, IamOutgoingMessages, NodeInfo, NodeStatus,
    PauseNodeResponse, ResumeNodeResponse, StartProvisioningResponse,
};
use iam_server::{IdentHandler, NodeInfoProvider, ProvisionManager, ServiceError};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, error, info, instrument, warn};

use crate::error::ClientError;

/// Default wait between connection attempts
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// Default connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const OUTBOUND_CHANNEL_CAPACITY: usize = 32;

/// Main node listener a node registers on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listener {
    /// Unprovisioned nodes
    Public,
    /// Provisioned and paused nodes
    Protected,
}

impl Listener {
    /// Listener admitting a node with `status`
    pub fn for_status(status: NodeStatus) -> Self {
        match status {
            NodeStatus::Provisioned | NodeStatus::Paused => Listener::Protected,
            NodeStatus::Unprovisioned | NodeStatus::Unspecified => Listener::Public,
        }
    }
}

/// Configuration for the node client
#[derive(Clone, Debug)]
pub struct NodeClientConfig {
    /// Main node public listener URL (e.g. "https://main:8090")
    pub public_url: String,
    /// Main node protected listener URL
    pub protected_url: String,
    /// TLS for the public listener
    pub public_tls: Option<ClientTlsConfig>,
    /// mTLS for the protected listener
    pub protected_tls: Option<ClientTlsConfig>,
    /// Wait between connection attempts
    pub reconnect_interval: Duration,
    /// Connect timeout
    pub connect_timeout: Duration,
}

impl NodeClientConfig {
    /// Plain-text connections to the given URLs with default timings
    pub fn new(public_url: impl Into<String>, protected_url: impl Into<String>) -> Self {
        Self {
            public_url: public_url.into(),
            protected_url: protected_url.into(),
            public_tls: None,
            protected_tls: None,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Local collaborators serving forwarded requests
#[derive(Clone)]
pub struct NodeServices {
    /// This node's info and status
    pub node_info_provider: Arc<dyn NodeInfoProvider>,
    /// Provisioning and certificate issuance
    pub provision_manager: Arc<dyn ProvisionManager>,
    /// Resolves empty key subjects to the system ID
    pub ident_handler: Option<Arc<dyn IdentHandler>>,
}

/// Frames produced for one forwarded request
#[derive(Debug, Default)]
pub struct Reply {
    /// Frames to send, in order
    pub frames: Vec<IamOutgoingMessages>,
    /// New local status, when the request changed it
    pub new_status: Option<NodeStatus>,
}

enum SessionEnd {
    Shutdown,
    Closed,
    Relisten(Listener),
    CredentialsUpdated,
}

#[derive(Clone)]
struct ListenerTls {
    public: Option<ClientTlsConfig>,
    protected: Option<ClientTlsConfig>,
}

/// Connection to the main node
pub struct NodeClient {
    config: NodeClientConfig,
    services: NodeServices,
    tls: watch::Sender<ListenerTls>,
}

impl NodeClient {
    /// Create a client
    pub fn new(config: NodeClientConfig, services: NodeServices) -> Self {
        let (tls, _) = watch::channel(ListenerTls {
            public: config.public_tls.clone(),
            protected: config.protected_tls.clone(),
        });

        Self {
            config,
            services,
            tls,
        }
    }

    /// Replace the TLS used to reach the main node
    ///
    /// A running session finishes the request in progress and reconnects.
    pub fn update_tls(
        &self,
        public_tls: Option<ClientTlsConfig>,
        protected_tls: Option<ClientTlsConfig>,
    ) {
        info!("Node client credentials updated");

        self.tls.send_replace(ListenerTls {
            public: public_tls,
            protected: protected_tls,
        });
    }

    /// Stay registered with the main node until `shutdown` is cancelled
    ///
    /// A dropped or failed connection is retried after the reconnect
    /// interval. A listener change or new credentials reconnect immediately.
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Node client started");

        while !shutdown.is_cancelled() {
            match self.run_session(&shutdown).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Relisten(listener)) => {
                    info!(?listener, "Node status changed listener, reconnecting");
                    continue;
                }
                Ok(SessionEnd::CredentialsUpdated) => {
                    info!("Reconnecting with new credentials");
                    continue;
                }
                Ok(SessionEnd::Closed) => info!("Connection to main node closed"),
                Err(e) => warn!(error = %e, "Connection to main node failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
            }
        }

        info!("Node client stopped");
    }

    async fn connect(&self, listener: Listener, tls: ListenerTls) -> Result<Channel, ClientError> {
        let (url, tls) = match listener {
            Listener::Public => (&self.config.public_url, tls.public),
            Listener::Protected => (&self.config.protected_url, tls.protected),
        };

        debug!(url = %url, ?listener, "Connecting to main node");

        let mut endpoint = Endpoint::from_shared(url.clone())
            .map_err(|e| ClientError::InvalidEndpoint(e.to_string()))?
            .connect_timeout(self.config.connect_timeout);

        if let Some(tls) = tls {
            endpoint = endpoint
                .tls_config(tls)
                .map_err(|e| ClientError::TlsError(e.to_string()))?;
        }

        endpoint
            .connect()
            .await
            .map_err(|e| ClientError::ConnectionFailed(e.to_string()))
    }

    async fn run_session(&self, shutdown: &CancellationToken) -> Result<SessionEnd, ClientError> {
        let info = self.services.node_info_provider.get_node_info().await?;
        let node_id = info.node_id.clone();
        let listener = Listener::for_status(info.status());

        let mut credentials = self.tls.subscribe();
        let tls = credentials.borrow_and_update().clone();
        let channel = self.connect(listener, tls).await?;

        let (tx, rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        tx.send(node_info_frame(info))
            .await
            .map_err(|_| ClientError::ChannelClosed)?;

        let mut inbound = IamPublicNodesServiceClient::new(channel)
            .register_node(ReceiverStream::new(rx))
            .await
            .map_err(|e| ClientError::StreamFailed(e.to_string()))?
            .into_inner();

        info!(node_id = %node_id, ?listener, "Registered with main node");

        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => return Ok(SessionEnd::Shutdown),
                _ = credentials.changed() => return Ok(SessionEnd::CredentialsUpdated),
                frame = inbound.next() => frame,
            };

            let frame = match frame {
                None => return Ok(SessionEnd::Closed),
                Some(Err(status)) => return Err(ClientError::StreamFailed(status.to_string())),
                Some(Ok(frame)) => frame,
            };

            let reply = self.handle_request(frame).await;
            for out in reply.frames {
                tx.send(out).await.map_err(|_| ClientError::ChannelClosed)?;
            }

            let Some(status) = reply.new_status else {
                continue;
            };

            let next = Listener::for_status(status);
            if next != listener {
                // ending our half lets the main node drain the reply and close
                drop(tx);
                let drained = tokio::time::timeout(self.config.connect_timeout, async {
                    while let Some(Ok(_)) = inbound.next().await {}
                })
                .await;
                if drained.is_err() {
                    debug!(node_id = %node_id, "Main node kept old stream open, dropping it");
                }
                return Ok(SessionEnd::Relisten(next));
            }
        }
    }

    /// Serve one forwarded request
    ///
    /// Lifecycle requests first check the local status. A request that
    /// changes the status is followed by a fresh node info frame ahead of
    /// the response. Requests without a payload produce no frames.
    pub async fn handle_request(&self, frame: IamIncomingMessages) -> Reply {
        let request_id = frame.request_id;
        let Some(message) = frame.message else {
            warn!(request_id = %request_id, "Empty request from main node, ignoring");
            return Reply::default();
        };

        debug!(request_id = %request_id, kind = message.name(), "Process request from main node");

        use iam_incoming_messages::Message as In;
        use iam_outgoing_messages::Message as Out;

        let (response, new_status) = match message {
            In::StartProvisioningRequest(request) => {
                let mut response = StartProvisioningResponse::default();
                let result = match self.check_status(&[NodeStatus::Unprovisioned]).await {
                    Ok(()) => {
                        self.services
                            .provision_manager
                            .start_provisioning(&request.password)
                            .await
                    }
                    Err(e) => Err(e),
                };
                embed(&mut response, result);
                (Out::StartProvisioningResponse(response), None)
            }
            In::FinishProvisioningRequest(request) => {
                let mut response = FinishProvisioningResponse::default();
                let status = self
                    .transition(&[NodeStatus::Unprovisioned], NodeStatus::Provisioned, || {
                        self.services
                            .provision_manager
                            .finish_provisioning(&request.password)
                    })
                    .await;
                let new_status = settle(&mut response, status);
                (Out::FinishProvisioningResponse(response), new_status)
            }
            In::DeprovisionRequest(request) => {
                let mut response = DeprovisionResponse::default();
                let status = self
                    .transition(
                        &[NodeStatus::Provisioned, NodeStatus::Paused],
                        NodeStatus::Unprovisioned,
                        || self.services.provision_manager.deprovision(&request.password),
                    )
                    .await;
                let new_status = settle(&mut response, status);
                (Out::DeprovisionResponse(response), new_status)
            }
            In::PauseNodeRequest(_) => {
                let mut response = PauseNodeResponse::default();
                let status = self
                    .transition(&[NodeStatus::Provisioned], NodeStatus::Paused, || async {
                        Ok(())
                    })
                    .await;
                let new_status = settle(&mut response, status);
                (Out::PauseNodeResponse(response), new_status)
            }
            In::ResumeNodeRequest(_) => {
                let mut response = ResumeNodeResponse::default();
                let status = self
                    .transition(&[NodeStatus::Paused], NodeStatus::Provisioned, || async {
                        Ok(())
                    })
                    .await;
                let new_status = settle(&mut response, status);
                (Out::ResumeNodeResponse(response), new_status)
            }
            In::CreateKeyRequest(request) => {
                (Out::CreateKeyResponse(self.create_key(request).await), None)
            }
            In::ApplyCertRequest(request) => {
                (Out::ApplyCertResponse(self.apply_cert(request).await), None)
            }
            In::GetCertTypesRequest(_) => {
                let mut response = CertTypes::default();
                match self.services.provision_manager.get_cert_types().await {
                    Ok(types) => response.types = types,
                    Err(e) => {
                        error!(error = %e, "Get cert types failed");
                        response.set_error(e.to_error_info());
                    }
                }
                (Out::CertTypesResponse(response), None)
            }
        };

        let mut frames = Vec::with_capacity(2);

        if new_status.is_some() {
            match self.services.node_info_provider.get_node_info().await {
                Ok(info) => frames.push(node_info_frame(info)),
                Err(e) => error!(error = %e, "Failed to read node info after status change"),
            }
        }

        frames.push(IamOutgoingMessages {
            request_id,
            message: Some(response),
        });

        Reply { frames, new_status }
    }

    async fn check_status(&self, allowed: &[NodeStatus]) -> Result<(), ServiceError> {
        let status = self.services.node_info_provider.get_node_info().await?.status();

        if !allowed.contains(&status) {
            return Err(ServiceError::WrongState(format!(
                "node status {} does not allow this operation",
                status
            )));
        }

        Ok(())
    }

    /// Check the current status, run `action`, then record `target`
    async fn transition<F, Fut>(
        &self,
        allowed: &[NodeStatus],
        target: NodeStatus,
        action: F,
    ) -> Result<NodeStatus, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), ServiceError>>,
    {
        self.check_status(allowed).await?;
        action().await?;
        self.services
            .node_info_provider
            .set_node_status(target)
            .await?;

        info!(status = %target, "Node status changed");

        Ok(target)
    }

    async fn create_key(&self, request: CreateKeyRequest) -> CreateKeyResponse {
        let mut response = CreateKeyResponse {
            node_id: request.node_id,
            cert_type: request.cert_type,
            ..Default::default()
        };

        let subject = if !request.subject.is_empty() {
            Ok(request.subject)
        } else {
            match &self.services.ident_handler {
                Some(ident) => ident.get_system_id().await,
                None => Err(ServiceError::InvalidArgument(
                    "subject can't be empty".to_string(),
                )),
            }
        };

        let result = match subject {
            Ok(subject) => {
                self.services
                    .provision_manager
                    .create_key(&response.cert_type, &subject, &request.password)
                    .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(csr) => response.csr = csr,
            Err(e) => {
                error!(cert_type = %response.cert_type, error = %e, "Create key failed");
                response.set_error(e.to_error_info());
            }
        }

        response
    }

    async fn apply_cert(&self, request: ApplyCertRequest) -> ApplyCertResponse {
        let mut response = ApplyCertResponse {
            node_id: request.node_id,
            cert_type: request.cert_type,
            ..Default::default()
        };

        match self
            .services
            .provision_manager
            .apply_cert(&response.cert_type, &request.cert)
            .await
        {
            Ok(applied) => {
                response.cert_url = applied.cert_url;
                response.serial = applied.serial;
            }
            Err(e) => {
                error!(cert_type = %response.cert_type, error = %e, "Apply cert failed");
                response.set_error(e.to_error_info());
            }
        }

        response
    }
}

fn node_info_frame(info: NodeInfo) -> IamOutgoingMessages {
    IamOutgoingMessages {
        request_id: String::new(),
        message: Some(iam_outgoing_messages::Message::NodeInfo(info)),
    }
}

fn embed<R: EmbeddedError>(response: &mut R, result: Result<(), ServiceError>) {
    if let Err(e) = result {
        error!(error = %e, "Request failed");
        response.set_error(e.to_error_info());
    }
}

fn settle<R: EmbeddedError>(
    response: &mut R,
    result: Result<NodeStatus, ServiceError>,
) -> Option<NodeStatus> {
    match result {
        Ok(status) => Some(status),
        Err(e) => {
            embed(response, Err(e));
            None
        }
    }
}
