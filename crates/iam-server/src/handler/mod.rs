//! gRPC message handlers
//!
//! [`PublicMessageHandler`] serves the read-only identity, certificate and
//! node surface plus the node registration stream for unprovisioned nodes.
//! [`ProtectedMessageHandler`] wraps the same public state and adds node
//! administration, provisioning, certificate issuance and permission
//! registration. Both listeners therefore share one node registry and one
//! set of subscription writers.

mod cert_writer;
mod protected;
mod public;

use std::time::Duration;

use crate::retry::RetryConfig;
use crate::stream_writer::DEFAULT_SUBSCRIBER_BUFFER;

pub use cert_writer::{CertSubscription, CertWriter};
pub use protected::{ProtectedMessageHandler, PROTECTED_ALLOWED_STATUSES};
pub use public::{HandlerServices, PublicMessageHandler, PUBLIC_ALLOWED_STATUSES};

/// Default timeout for node status and certificate requests
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Default timeout for provisioning requests
pub const DEFAULT_PROVISIONING_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Per-request timeouts for forwarded calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTimeouts {
    /// Pause, resume, cert types, create key and apply cert
    pub default: Duration,
    /// Start provisioning, finish provisioning and deprovision
    pub provisioning: Duration,
}

impl Default for RequestTimeouts {
    fn default() -> Self {
        Self {
            default: DEFAULT_REQUEST_TIMEOUT,
            provisioning: DEFAULT_PROVISIONING_TIMEOUT,
        }
    }
}

/// Tunables shared by both message handlers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerConfig {
    /// Retry policy for forwarded requests
    pub retry: RetryConfig,
    /// Forwarded request timeouts
    pub timeouts: RequestTimeouts,
    /// Per-subscriber buffer for change subscriptions
    pub subscriber_buffer: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            timeouts: RequestTimeouts::default(),
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}
