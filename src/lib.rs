//! AOS IAM node agent
//!
//! Every node runs the IAM listeners. The main node additionally keeps the
//! registry of secondary nodes and forwards administrative requests to
//! them over their registration streams. A secondary node dials the main
//! node and serves those requests against its local collaborators.
//!
//! # Modules
//!
//! - [`config`] - JSON configuration
//! - [`telemetry`] - logging initialization
//! - [`app`] - component wiring and lifecycle
//! - [`node_info`] - this node's info from system files
//! - [`identifier`] - system identity from files
//! - [`node_manager`] - info of every known node
//! - [`perm_handler`] - instance permission registry
//! - [`cert`] - key generation and certificate storage
//! - [`provision`] - provisioning lifecycle and certificate issuance

#![deny(missing_docs)]

pub mod app;
pub mod cert;
pub mod config;
pub mod identifier;
pub mod node_info;
pub mod node_manager;
pub mod perm_handler;
pub mod provision;
pub mod telemetry;

pub use app::{App, AppError};
pub use config::{Config, ConfigError};

/// Default configuration file
pub const DEFAULT_CONFIG_PATH: &str = "aos_iamanager.cfg";
