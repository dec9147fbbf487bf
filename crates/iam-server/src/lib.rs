//! IAM node registry and request routing
//!
//! This crate hosts the main node's side of the IAM control plane:
//!
//! - **Registry**: secondary nodes open a long-lived `RegisterNode` stream and
//!   are admitted by [`NodeController`] if their status is allowed on the
//!   listener they dialed.
//! - **Routing**: administrative RPCs addressed to another node are forwarded
//!   over that node's stream by its [`NodeStreamHandler`], which matches
//!   responses to requests by request ID.
//! - **Fan-out**: node, subject and certificate changes are broadcast to
//!   subscription streams through [`StreamWriter`].
//!
//! # Public API
//!
//! ## Handlers
//! - [`PublicMessageHandler`]: version, identity, certificates, node lookup and
//!   registration of unprovisioned nodes
//! - [`ProtectedMessageHandler`]: node administration, provisioning,
//!   certificate issuance and permission registration
//!
//! ## Server
//! - [`IamServer`], [`ServerConfig`]: both listeners and their lifecycle
//! - [`mtls::ServerTls`], [`mtls::ClientTls`]: TLS configuration for gRPC
//!
//! ## Collaborators
//! Traits in [`services`] are implemented by the binary and mocked in tests.

pub mod commands;
pub mod error;
pub mod handler;
pub mod mtls;
pub mod node_controller;
pub mod node_stream;
pub mod retry;
pub mod server;
pub mod services;
pub mod stream_writer;

pub use commands::{ProvisionCommandArgs, ProvisionCommands};
pub use error::{codes, IamError, ServiceError};
pub use handler::{
    HandlerConfig, HandlerServices, ProtectedMessageHandler, PublicMessageHandler,
    RequestTimeouts, PROTECTED_ALLOWED_STATUSES, PUBLIC_ALLOWED_STATUSES,
};
pub use mtls::{ClientTls, MtlsError, ServerTls};
pub use node_controller::{NodeConnectionEvent, NodeController, SharedNodeController};
pub use node_stream::NodeStreamHandler;
pub use retry::RetryConfig;
pub use server::{correct_address, IamServer, ServerConfig, ServerError};
pub use services::{
    AppliedCert, CertProvider, CertReceiver, IdentHandler, NodeInfoListener, NodeInfoProvider,
    NodeManager, PermHandler, ProvisionCallback, ProvisionManager, SubjectsObserver,
};
pub use stream_writer::{StreamWriter, Subscription};
