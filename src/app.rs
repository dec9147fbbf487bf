//! Node agent composition
//!
//! Builds the local collaborators from configuration, hosts the IAM
//! listeners and, on a secondary node, keeps the registration stream to the
//! main node open.
//!
//! Outside provisioning mode the agent follows rotations of its `iam`
//! certificate: the listeners restart with the new identity and the main
//! node connection is re-established with it.

use std::path::PathBuf;
use std::sync::Arc;

use iam_node::{NodeClient, NodeClientConfig, NodeServices};
use iam_proto::CertInfo;
use iam_server::{
    CertProvider, CertReceiver, ClientTls, HandlerServices, IamServer, IdentHandler, MtlsError,
    NodeController, PermHandler, ProvisionCommands, ProvisionManager, ServerConfig, ServerError,
    ServerTls, ServiceError,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::cert::{url_to_path, FileCertHandler, FileCertProvider};
use crate::config::{Config, FILE_IDENTIFIER_PLUGIN};
use crate::identifier::FileIdentifier;
use crate::node_info::FileNodeInfoProvider;
use crate::node_manager::MemoryNodeManager;
use crate::perm_handler::MemoryPermHandler;
use crate::provision::ConfigProvisionManager;

/// Certificate type holding this node's TLS identity
pub const IAM_CERT_TYPE: &str = "iam";

/// Startup errors
#[derive(Debug, Error)]
pub enum AppError {
    /// A collaborator failed to initialize
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// Listener setup failed
    #[error(transparent)]
    Server(#[from] ServerError),

    /// TLS material is missing or malformed
    #[error(transparent)]
    Tls(#[from] MtlsError),
}

struct TlsMaterial {
    cert_path: PathBuf,
    key_path: PathBuf,
    ca_path: Option<PathBuf>,
}

impl TlsMaterial {
    async fn find(config: &Config, certs: &FileCertProvider) -> Option<Self> {
        let info = match certs.get_cert(IAM_CERT_TYPE, &[], &[]).await {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "No IAM certificate installed, listeners run without TLS");
                return None;
            }
        };

        Self::from_cert_info(&info, config.ca_cert.clone())
    }

    fn from_cert_info(info: &CertInfo, ca_path: Option<PathBuf>) -> Option<Self> {
        Some(Self {
            cert_path: url_to_path(&info.cert_url)?,
            key_path: url_to_path(&info.key_url)?,
            ca_path,
        })
    }

    fn server(&self, mutual: bool) -> Result<ServerTls, MtlsError> {
        let ca = if mutual { self.ca_path.as_deref() } else { None };
        ServerTls::from_files(&self.cert_path, &self.key_path, ca)
    }

    fn client(&self, with_identity: bool) -> Result<Option<ClientTls>, MtlsError> {
        let Some(ca_path) = &self.ca_path else {
            return Ok(None);
        };

        let ca = read(ca_path)?;
        let tls = ClientTls::new(ca)?;

        if !with_identity {
            return Ok(Some(tls));
        }

        let cert = read(&self.cert_path)?;
        let key = Zeroizing::new(read(&self.key_path)?);
        Ok(Some(tls.with_identity(cert, key)?))
    }
}

fn read(path: &std::path::Path) -> Result<String, MtlsError> {
    std::fs::read_to_string(path).map_err(|source| MtlsError::Read {
        path: path.display().to_string(),
        source,
    })
}

/// Queues rotations of the IAM certificate for [`TlsReload`]
struct CertChanges(mpsc::UnboundedSender<CertInfo>);

impl CertReceiver for CertChanges {
    fn on_cert_changed(&self, info: &CertInfo) {
        if self.0.send(info.clone()).is_err() {
            debug!(cert_type = %info.cert_type, "TLS reload stopped, dropping cert change");
        }
    }
}

/// Moves the listeners and the main node connection to a rotated identity
struct TlsReload {
    server: Arc<IamServer>,
    node_client: Option<Arc<NodeClient>>,
    ca_path: Option<PathBuf>,
}

impl TlsReload {
    async fn run(self, mut changes: mpsc::UnboundedReceiver<CertInfo>, shutdown: CancellationToken) {
        loop {
            let info = tokio::select! {
                _ = shutdown.cancelled() => break,
                info = changes.recv() => match info {
                    Some(info) => info,
                    None => break,
                },
            };

            if let Err(e) = self.apply(&info).await {
                error!(
                    cert_url = %info.cert_url,
                    error = %e,
                    "Failed to apply rotated IAM certificate"
                );
            }
        }
    }

    /// Every TLS config is built before anything is swapped, so bad
    /// material leaves the current identity in place.
    async fn apply(&self, info: &CertInfo) -> Result<(), AppError> {
        let Some(tls) = TlsMaterial::from_cert_info(info, self.ca_path.clone()) else {
            warn!(cert_url = %info.cert_url, "Rotated IAM certificate is not a file, keeping TLS");
            return Ok(());
        };

        let public_tls = tls.server(false)?;
        let protected_tls = tls.server(true)?;
        let client_tls = match &self.node_client {
            Some(client) => Some((client, tls.client(false)?, tls.client(true)?)),
            None => None,
        };

        self.server
            .reload_tls(Some(public_tls), Some(protected_tls))
            .await?;

        if let Some((client, public, protected)) = client_tls {
            client.update_tls(
                public.map(|t| t.to_tonic_config()),
                protected.map(|t| t.to_tonic_config()),
            );
        }

        info!(cert_url = %info.cert_url, "IAM certificate rotated");

        Ok(())
    }
}

/// A running node agent
pub struct App {
    server: Arc<IamServer>,
    node_client: Option<Arc<NodeClient>>,
    identifier: Option<Arc<FileIdentifier>>,
    cert_provider: Arc<FileCertProvider>,
    ca_path: Option<PathBuf>,
    follow_rotation: bool,
    cert_subscription: Option<Uuid>,
    shutdown: CancellationToken,
    client_task: Option<JoinHandle<()>>,
    reload_task: Option<JoinHandle<()>>,
}

impl App {
    /// Build every component from `config`
    ///
    /// In provisioning mode both listeners and the main node connection run
    /// without TLS.
    pub async fn new(config: &Config, provisioning_mode: bool) -> Result<Self, AppError> {
        let node_info_provider = Arc::new(FileNodeInfoProvider::new(&config.node_info)?);

        let identifier = match config.identifier.plugin.as_str() {
            FILE_IDENTIFIER_PLUGIN => match &config.identifier.params {
                Some(params) => Some(Arc::new(FileIdentifier::new(params)?)),
                None => None,
            },
            _ => None,
        };
        let ident_handler = identifier
            .clone()
            .map(|i| i as Arc<dyn IdentHandler>);

        let cert_provider = Arc::new(FileCertProvider::load(
            &config.cert_storage,
            &config.cert_modules,
        ));
        let cert_handler = Arc::new(FileCertHandler::new(
            config.cert_storage.clone(),
            &config.cert_modules,
            Arc::clone(&cert_provider),
        ));

        let provision_manager: Arc<dyn ProvisionManager> = Arc::new(ConfigProvisionManager::new(
            config.cert_modules.clone(),
            Arc::new(ProvisionCommands::new(config.provision_command_args())),
            cert_handler,
        ));

        let perm_handler = config
            .enable_permissions_handler
            .then(|| Arc::new(MemoryPermHandler::default()) as Arc<dyn PermHandler>);

        let tls = if provisioning_mode {
            None
        } else {
            TlsMaterial::find(config, &cert_provider).await
        };

        let server_config = ServerConfig {
            public_addr: config.iam_public_server_url.clone(),
            protected_addr: config.iam_protected_server_url.clone(),
            provisioning_mode,
            public_tls: tls.as_ref().map(|t| t.server(false)).transpose()?,
            protected_tls: tls.as_ref().map(|t| t.server(true)).transpose()?,
            handler: config.handler_config(),
        };

        let services = HandlerServices {
            node_controller: Arc::new(NodeController::default()),
            node_info_provider: node_info_provider.clone(),
            node_manager: Arc::new(MemoryNodeManager::new()),
            cert_provider: Arc::clone(&cert_provider) as Arc<dyn CertProvider>,
            ident_handler: ident_handler.clone(),
            perm_handler,
        };

        let server = Arc::new(
            IamServer::new(server_config, services, Arc::clone(&provision_manager)).await?,
        );

        let node_client = if config.is_main_node() || config.main_iam_protected_server_url.is_empty() {
            None
        } else {
            let mut client_config = NodeClientConfig::new(
                config.main_iam_public_server_url.clone(),
                config.main_iam_protected_server_url.clone(),
            );
            client_config.reconnect_interval = config.node_reconnect_interval;

            if let Some(tls) = &tls {
                client_config.public_tls = tls.client(false)?.map(|t| t.to_tonic_config());
                client_config.protected_tls = tls.client(true)?.map(|t| t.to_tonic_config());
            }

            Some(Arc::new(NodeClient::new(
                client_config,
                NodeServices {
                    node_info_provider,
                    provision_manager,
                    ident_handler,
                },
            )))
        };

        Ok(Self {
            server,
            node_client,
            identifier,
            cert_provider,
            ca_path: config.ca_cert.clone(),
            follow_rotation: !provisioning_mode,
            cert_subscription: None,
            shutdown: CancellationToken::new(),
            client_task: None,
            reload_task: None,
        })
    }

    /// The hosted IAM server
    pub fn server(&self) -> &IamServer {
        &self.server
    }

    /// Start the listeners and the main node connection
    pub async fn start(&mut self) -> Result<(), AppError> {
        self.server.start().await?;

        if let Some(client) = &self.node_client {
            let client = Arc::clone(client);
            let shutdown = self.shutdown.clone();
            self.client_task = Some(tokio::spawn(async move { client.run(shutdown).await }));
        }

        if self.follow_rotation {
            let (tx, rx) = mpsc::unbounded_channel();
            self.cert_subscription = Some(
                self.cert_provider
                    .subscribe_cert_changed(IAM_CERT_TYPE, Arc::new(CertChanges(tx)))?,
            );

            let reload = TlsReload {
                server: Arc::clone(&self.server),
                node_client: self.node_client.clone(),
                ca_path: self.ca_path.clone(),
            };
            let shutdown = self.shutdown.clone();
            self.reload_task = Some(tokio::spawn(reload.run(rx, shutdown)));
        }

        info!(
            secondary = self.node_client.is_some(),
            "IAM node agent started"
        );

        Ok(())
    }

    /// Re-read the identifier's subjects, notifying subscribers on change
    pub fn reload_subjects(&self) {
        if let Some(identifier) = &self.identifier {
            if identifier.reload_subjects() {
                info!("Subjects reloaded");
            }
        }
    }

    /// Stop the main node connection and the listeners
    pub async fn stop(&mut self) {
        self.shutdown.cancel();

        if let Some(task) = self.client_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Node client task failed to join");
            }
        }

        if let Some(id) = self.cert_subscription.take() {
            if let Err(e) = self.cert_provider.unsubscribe_cert_changed(id) {
                warn!(error = %e, "Failed to unsubscribe IAM cert changes");
            }
        }

        if let Some(task) = self.reload_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "TLS reload task failed to join");
            }
        }

        self.server.stop().await;
    }
}
