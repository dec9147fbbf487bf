//! Per-subscription certificate change writer

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::Stream;
use iam_proto::CertInfo;
use tonic::Status;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::IamError;
use crate::services::{CertProvider, CertReceiver};
use crate::stream_writer::{StreamWriter, Subscription};

/// Forwards rotations of one certificate type to one subscriber
pub struct CertWriter {
    cert_type: String,
    writer: Arc<StreamWriter<CertInfo>>,
}

impl CertWriter {
    /// Create a writer for `cert_type`
    pub fn new(cert_type: impl Into<String>, buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            cert_type: cert_type.into(),
            writer: StreamWriter::with_buffer("cert-changed", buffer),
        })
    }

    /// Certificate type this writer follows
    pub fn cert_type(&self) -> &str {
        &self.cert_type
    }

    /// End the subscription stream
    pub fn close(&self) {
        self.writer.close();
    }

    fn handle_stream(&self) -> Result<Subscription<CertInfo>, IamError> {
        self.writer.handle_stream()
    }
}

impl CertReceiver for CertWriter {
    fn on_cert_changed(&self, info: &CertInfo) {
        if info.cert_type != self.cert_type {
            return;
        }
        self.writer.write_to_streams(info);
    }
}

/// Response stream for `SubscribeCertChanged`
///
/// Dropping it unsubscribes from the cert provider and forgets the writer.
pub struct CertSubscription {
    id: Uuid,
    inner: Subscription<CertInfo>,
    provider: Arc<dyn CertProvider>,
    writers: Arc<DashMap<Uuid, Arc<CertWriter>>>,
}

impl CertSubscription {
    /// Subscribe `provider` to rotations of `cert_type`
    pub(crate) fn open(
        cert_type: &str,
        buffer: usize,
        provider: Arc<dyn CertProvider>,
        writers: Arc<DashMap<Uuid, Arc<CertWriter>>>,
    ) -> Result<Self, IamError> {
        let writer = CertWriter::new(cert_type, buffer);
        let inner = writer.handle_stream()?;

        let id = provider.subscribe_cert_changed(cert_type, writer.clone())?;
        writers.insert(id, writer);

        debug!(cert_type = %cert_type, subscription = %id, "Cert changed subscription opened");

        Ok(Self {
            id,
            inner,
            provider,
            writers,
        })
    }
}

impl Stream for CertSubscription {
    type Item = Result<CertInfo, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for CertSubscription {
    fn drop(&mut self) {
        self.writers.remove(&self.id);

        if let Err(e) = self.provider.unsubscribe_cert_changed(self.id) {
            warn!(subscription = %self.id, error = %e, "Failed to unsubscribe cert changed");
        }

        debug!(subscription = %self.id, "Cert changed subscription closed");
    }
}
