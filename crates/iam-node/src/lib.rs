//! Secondary node agent
//!
//! A secondary node keeps a `RegisterNode` stream open to the main node and
//! serves the administrative requests forwarded over it. See
//! [`NodeClient`] for the connection lifecycle.

pub mod client;
pub mod error;

pub use client::{
    Listener, NodeClient, NodeClientConfig, NodeServices, Reply, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_RECONNECT_INTERVAL,
};
pub use error::ClientError;
