//! IAM server composition: handlers, listeners and lifecycle

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Router;
use tonic::transport::Server;
use tracing::{debug, error, info, instrument, warn};

use crate::error::ServiceError;
use crate::handler::{HandlerConfig, HandlerServices, ProtectedMessageHandler, PublicMessageHandler};
use crate::mtls::ServerTls;
use crate::node_controller::SharedNodeController;
use crate::services::{NodeInfoListener, ProvisionManager, SubjectsObserver};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// Listener address is empty or malformed
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Listener could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that failed
        addr: String,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// TLS could not be applied to a listener
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// A collaborator failed during initialization
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// `start` was called on a running server
    #[error("server already started")]
    AlreadyStarted,
}

/// Normalize a listener address
///
/// An address starting with `:` listens on every interface.
pub fn correct_address(addr: &str) -> Result<String, ServerError> {
    let addr = addr.trim();

    if addr.is_empty() {
        return Err(ServerError::InvalidAddress("address is empty".to_string()));
    }

    if addr.starts_with(':') {
        return Ok(format!("0.0.0.0{}", addr));
    }

    Ok(addr.to_string())
}

/// Listener and TLS settings
pub struct ServerConfig {
    /// Public listener address
    pub public_addr: String,
    /// Protected listener address
    pub protected_addr: String,
    /// Run both listeners without TLS
    pub provisioning_mode: bool,
    /// TLS identity of the public listener
    pub public_tls: Option<ServerTls>,
    /// mTLS settings of the protected listener
    pub protected_tls: Option<ServerTls>,
    /// Handler tunables
    pub handler: HandlerConfig,
}

impl ServerConfig {
    /// Insecure listeners on the given addresses with default tunables
    pub fn insecure(public_addr: impl Into<String>, protected_addr: impl Into<String>) -> Self {
        Self {
            public_addr: public_addr.into(),
            protected_addr: protected_addr.into(),
            provisioning_mode: true,
            public_tls: None,
            protected_tls: None,
            handler: HandlerConfig::default(),
        }
    }
}

#[derive(Default)]
struct ListenerTls {
    public: Option<ServerTls>,
    protected: Option<ServerTls>,
}

struct Running {
    shutdown: CancellationToken,
    public_addr: SocketAddr,
    protected_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

/// Hosts the public and protected gRPC listeners
pub struct IamServer {
    config: ServerConfig,
    tls: Mutex<ListenerTls>,
    controller: SharedNodeController,
    public: Arc<PublicMessageHandler>,
    protected: ProtectedMessageHandler,
    running: Mutex<Option<Running>>,
}

impl IamServer {
    /// Build the handlers and register them as change listeners
    ///
    /// This node's own info is stored in the node manager so that it is
    /// listed alongside the nodes that register later.
    pub async fn new(
        mut config: ServerConfig,
        services: HandlerServices,
        provision_manager: Arc<dyn ProvisionManager>,
    ) -> Result<Self, ServerError> {
        let node_info = services.node_info_provider.get_node_info().await?;

        info!(
            node_id = %node_info.node_id,
            main_node = node_info.is_main_node(),
            provisioning_mode = config.provisioning_mode,
            "Initializing IAM server"
        );

        services.node_manager.set_node_info(node_info.clone()).await?;

        let controller = Arc::clone(&services.node_controller);
        let public = Arc::new(PublicMessageHandler::new(
            &node_info,
            services,
            config.handler.clone(),
        ));
        let protected = ProtectedMessageHandler::new(&public, provision_manager);

        let weak = Arc::downgrade(&public);

        let listener: Weak<dyn NodeInfoListener> = weak.clone();
        public.services().node_manager.subscribe_node_info_change(listener);

        if let Some(ident) = &public.services().ident_handler {
            let observer: Weak<dyn SubjectsObserver> = weak;
            ident.subscribe_subjects_changed(observer);
        }

        let tls = ListenerTls {
            public: config.public_tls.take(),
            protected: config.protected_tls.take(),
        };

        Ok(Self {
            config,
            tls: Mutex::new(tls),
            controller,
            public,
            protected,
            running: Mutex::new(None),
        })
    }

    /// Handler serving the public listener
    pub fn public_handler(&self) -> &PublicMessageHandler {
        &self.public
    }

    /// Handler serving the protected listener
    pub fn protected_handler(&self) -> &ProtectedMessageHandler {
        &self.protected
    }

    /// Registry of connected nodes
    pub fn node_controller(&self) -> &SharedNodeController {
        &self.controller
    }

    /// Bound public listener address, once started
    pub fn public_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.public_addr)
    }

    /// Bound protected listener address, once started
    pub fn protected_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.protected_addr)
    }

    /// Bind both listeners and start serving
    ///
    /// Port 0 binds an ephemeral port; the bound addresses are available from
    /// [`IamServer::public_addr`] and [`IamServer::protected_addr`].
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), ServerError> {
        if self.running.lock().is_some() {
            return Err(ServerError::AlreadyStarted);
        }

        self.controller.start();
        self.public.start();

        self.serve(&self.config.public_addr, &self.config.protected_addr)
            .await
    }

    /// Replace the listeners' TLS identities
    ///
    /// A running server restarts both listeners on their bound addresses.
    /// Open subscriptions and registration streams end with the old
    /// listeners; nodes reconnect on their own. A stopped server applies the
    /// identities on the next [`IamServer::start`].
    pub async fn reload_tls(
        &self,
        public_tls: Option<ServerTls>,
        protected_tls: Option<ServerTls>,
    ) -> Result<(), ServerError> {
        *self.tls.lock() = ListenerTls {
            public: public_tls,
            protected: protected_tls,
        };

        let running = self.running.lock().take();
        let Some(running) = running else {
            debug!("Server not running, TLS applies on start");
            return Ok(());
        };

        info!("Reloading listener TLS");

        self.public.close();
        self.controller.close();
        shut_down(running.shutdown, running.tasks).await;

        self.controller.start();
        self.public.start();

        self.serve(
            &running.public_addr.to_string(),
            &running.protected_addr.to_string(),
        )
        .await
    }

    async fn serve(&self, public_addr: &str, protected_addr: &str) -> Result<(), ServerError> {
        let (public_listener, public_addr) = bind(public_addr).await?;
        let (protected_listener, protected_addr) = bind(protected_addr).await?;

        let (mut public_server, mut protected_server) = {
            let tls = self.tls.lock();
            (
                self.builder(tls.public.as_ref())?,
                self.builder(tls.protected.as_ref())?,
            )
        };

        let public_router = self.public.add_services(&mut public_server);
        let protected_router = self.protected.add_services(&mut protected_server);

        let shutdown = CancellationToken::new();
        let tasks = vec![
            spawn_listener("public", public_router, public_listener, shutdown.clone()),
            spawn_listener("protected", protected_router, protected_listener, shutdown.clone()),
        ];

        info!(%public_addr, %protected_addr, "IAM server started");

        let mut running = self.running.lock();
        if running.is_some() {
            shutdown.cancel();
            return Err(ServerError::AlreadyStarted);
        }
        *running = Some(Running {
            shutdown,
            public_addr,
            protected_addr,
            tasks,
        });

        Ok(())
    }

    /// Close the handlers and the node registry, then stop both listeners
    ///
    /// Closing the handlers aborts pending retries and ends every open
    /// subscription and registration stream so shutdown doesn't hang.
    pub async fn stop(&self) {
        let running = self.running.lock().take();

        self.public.close();
        self.protected.close();
        self.controller.close();

        if let Some(running) = running {
            shut_down(running.shutdown, running.tasks).await;
        }

        info!("IAM server stopped");
    }

    fn builder(&self, tls: Option<&ServerTls>) -> Result<Server, ServerError> {
        let server = Server::builder();

        if self.config.provisioning_mode {
            return Ok(server);
        }

        match tls {
            Some(tls) => Ok(server.tls_config(tls.to_tonic_config())?),
            None => {
                warn!("Listener running without TLS");
                Ok(server)
            }
        }
    }
}

async fn shut_down(shutdown: CancellationToken, tasks: Vec<JoinHandle<()>>) {
    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Listener task failed to join");
        }
    }
}

async fn bind(addr: &str) -> Result<(TcpListener, SocketAddr), ServerError> {
    let addr = correct_address(addr)?;

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let local = listener
        .local_addr()
        .map_err(|source| ServerError::Bind { addr, source })?;

    Ok((listener, local))
}

fn spawn_listener(
    name: &'static str,
    router: Router,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(listener = name, "Serving");

        let incoming = TcpListenerStream::new(listener);
        if let Err(e) = router
            .serve_with_incoming_shutdown(incoming, shutdown.cancelled_owned())
            .await
        {
            error!(listener = name, error = %e, "Listener failed");
        }

        debug!(listener = name, "Listener stopped");
    })
}
