//! Fan-out of change events to server-streaming subscriptions
//!
//! Every subscription RPC (node changed, subjects changed, cert changed)
//! gets a bounded channel whose receiving side is returned to tonic as the
//! response stream. Broadcasting clones the event into every channel
//! without blocking: a subscriber whose buffer is full or whose peer went
//! away is dropped from the set and its stream ends.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tonic::Status;
use tracing::{debug, warn};

use crate::error::IamError;

/// Default per-subscriber buffer before a subscriber counts as stalled
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 32;

type Item<T> = Result<T, Status>;

struct WriterSet<T> {
    closed: bool,
    writers: HashMap<u64, mpsc::Sender<Item<T>>>,
}

/// Broadcasts events of type `T` to every open subscription
pub struct StreamWriter<T> {
    name: &'static str,
    buffer: usize,
    state: Mutex<WriterSet<T>>,
    // Serializes broadcasts so every subscriber sees the same order
    broadcast: Mutex<()>,
    next_id: AtomicU64,
}

impl<T> StreamWriter<T>
where
    T: Clone + Send + 'static,
{
    /// Create an open writer with the default subscriber buffer
    pub fn new(name: &'static str) -> Arc<Self> {
        Self::with_buffer(name, DEFAULT_SUBSCRIBER_BUFFER)
    }

    /// Create an open writer with a custom subscriber buffer
    pub fn with_buffer(name: &'static str, buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            name,
            buffer: buffer.max(1),
            state: Mutex::new(WriterSet {
                closed: false,
                writers: HashMap::new(),
            }),
            broadcast: Mutex::new(()),
            next_id: AtomicU64::new(0),
        })
    }

    /// Accept subscriptions again after [`StreamWriter::close`]
    pub fn start(&self) {
        self.state.lock().closed = false;
    }

    /// Reject new subscriptions and end every open one
    pub fn close(&self) {
        let writers = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.writers)
        };

        debug!(writer = self.name, subscribers = writers.len(), "Closing stream writer");
        // dropping the senders ends each subscription stream
        drop(writers);
    }

    /// Open a subscription
    ///
    /// The returned stream yields every event written after this call and
    /// ends when the writer is closed or the subscriber is dropped for a
    /// failed write. Dropping it removes the subscriber.
    pub fn handle_stream(self: &Arc<Self>) -> Result<Subscription<T>, IamError> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(IamError::HandlerClosed);
            }
            state.writers.insert(id, tx);
        }

        debug!(writer = self.name, subscriber = id, "Subscriber added");

        Ok(Subscription {
            id,
            rx,
            writer: Arc::downgrade(self),
        })
    }

    /// Deliver `event` to every subscriber
    ///
    /// Returns the number of subscribers that accepted the event.
    pub fn write_to_streams(&self, event: &T) -> usize {
        let _order = self.broadcast.lock();

        let writers: Vec<(u64, mpsc::Sender<Item<T>>)> = {
            let state = self.state.lock();
            state
                .writers
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };

        let mut delivered = 0;
        let mut failed = Vec::new();

        for (id, tx) in writers {
            match tx.try_send(Ok(event.clone())) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(writer = self.name, subscriber = id, "Subscriber stalled, dropping");
                    failed.push(id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(writer = self.name, subscriber = id, "Subscriber gone, dropping");
                    failed.push(id);
                }
            }
        }

        if !failed.is_empty() {
            let mut state = self.state.lock();
            for id in failed {
                state.writers.remove(&id);
            }
        }

        delivered
    }
}

impl<T> StreamWriter<T> {
    /// Name used in logs
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of open subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().writers.len()
    }

    fn remove(&self, id: u64) {
        if self.state.lock().writers.remove(&id).is_some() {
            debug!(writer = self.name, subscriber = id, "Subscriber removed");
        }
    }
}

/// Receiving side of one subscription, usable as a tonic response stream
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::Receiver<Item<T>>,
    writer: Weak<StreamWriter<T>>,
}

impl<T> Subscription<T> {
    /// Subscriber ID within its writer
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T> Stream for Subscription<T> {
    type Item = Item<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.upgrade() {
            writer.remove(self.id);
        }
    }
}
