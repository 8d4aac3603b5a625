//! Output fan-out: subscriber bookkeeping and the per-session relay loop.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use termhub_core::{OutputHistory, OutputSink, SessionId, config::SessionsConfig};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{automation::AutomationFeed, channel::BackendChannel};

/// Token identifying one registered subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Ordered set of output subscribers.
///
/// Mutations take effect for the next chunk; a chunk already being
/// delivered goes to the snapshot taken when delivery began.
#[derive(Default)]
pub struct SubscriberSet {
    next_id: AtomicU64,
    sinks: Mutex<Vec<(SubscriberId, Arc<dyn OutputSink>)>>,
}

impl SubscriberSet {
    fn sinks(&self) -> MutexGuard<'_, Vec<(SubscriberId, Arc<dyn OutputSink>)>> {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a sink.
    pub fn add(&self, sink: Arc<dyn OutputSink>) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sinks().push((id, sink));
        id
    }

    /// Unregister a sink. Returns `false` if it was not registered.
    pub fn remove(&self, id: SubscriberId) -> bool {
        let mut sinks = self.sinks();
        let before = sinks.len();
        sinks.retain(|(sid, _)| *sid != id);
        sinks.len() != before
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks().is_empty()
    }

    pub fn clear(&self) {
        self.sinks().clear();
    }

    fn snapshot(&self) -> Vec<(SubscriberId, Arc<dyn OutputSink>)> {
        self.sinks().clone()
    }
}

/// Chunks a subscriber may have queued before further output to it is dropped.
pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 256;

/// Relay loop tunables.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Sleep between reads when the channel has nothing pending.
    pub poll_interval: Duration,
    pub read_chunk_bytes: usize,
    /// Upper bound on a single subscriber delivery.
    pub sink_timeout: Duration,
    /// Per-subscriber queue depth, in chunks.
    pub queue_chunks: usize,
}

impl From<&SessionsConfig> for RelaySettings {
    fn from(config: &SessionsConfig) -> Self {
        Self {
            poll_interval: config.relay_poll_interval(),
            read_chunk_bytes: config.read_chunk_bytes,
            sink_timeout: config.sink_timeout(),
            queue_chunks: DEFAULT_SUBSCRIBER_QUEUE,
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from(&SessionsConfig::default())
    }
}

/// Queue feeding one subscriber from its own delivery task.
///
/// The relay loop only ever `try_send`s into it, so a slow subscriber
/// loses chunks instead of holding back the others.
struct Delivery {
    tx: mpsc::Sender<Bytes>,
    dropped: u64,
    backpressured: bool,
}

impl Delivery {
    fn spawn(
        session_id: SessionId,
        id: SubscriberId,
        sink: Arc<dyn OutputSink>,
        settings: &RelaySettings,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<Bytes>(settings.queue_chunks.max(1));
        let sink_timeout = settings.sink_timeout;

        tokio::spawn(async move {
            loop {
                let chunk = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    chunk = rx.recv() => match chunk {
                        Some(chunk) => chunk,
                        None => break,
                    },
                };
                let delivered = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    result = tokio::time::timeout(sink_timeout, sink.deliver(chunk)) => result,
                };
                match delivered {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(session_id = %session_id, subscriber = %id, error = %e, "Output subscriber failed");
                    }
                    Err(_) => {
                        tracing::warn!(session_id = %session_id, subscriber = %id, "Output subscriber timed out");
                    }
                }
            }
        });

        Self {
            tx,
            dropped: 0,
            backpressured: false,
        }
    }

    fn offer(&mut self, session_id: SessionId, id: SubscriberId, chunk: Bytes) {
        match self.tx.try_send(chunk) {
            Ok(()) => {
                if self.backpressured {
                    self.backpressured = false;
                    tracing::debug!(session_id = %session_id, subscriber = %id, "Subscriber recovered from backpressure");
                }
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped += 1;
                if !self.backpressured {
                    self.backpressured = true;
                    tracing::warn!(
                        session_id = %session_id,
                        subscriber = %id,
                        dropped = self.dropped,
                        "Subscriber is backpressured, dropping output"
                    );
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Moves channel output to subscribers until cancelled.
pub(crate) struct RelayLoop {
    pub session_id: SessionId,
    pub channel: Arc<BackendChannel>,
    pub subscribers: Arc<SubscriberSet>,
    pub history: Arc<OutputHistory>,
    pub feed: Option<AutomationFeed>,
    pub settings: RelaySettings,
    pub cancel: CancellationToken,
}

impl RelayLoop {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        tracing::debug!(session_id = %self.session_id, "Relay loop started");
        let mut deliveries = HashMap::new();
        loop {
            let chunk = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                chunk = self.channel.read(self.settings.read_chunk_bytes) => chunk,
            };

            if chunk.is_empty() {
                tokio::select! {
                    () = self.cancel.cancelled() => break,
                    () = tokio::time::sleep(self.settings.poll_interval) => {}
                }
                continue;
            }

            self.dispatch(&mut deliveries, chunk);
        }
        tracing::debug!(session_id = %self.session_id, "Relay loop stopped");
    }

    fn dispatch(&self, deliveries: &mut HashMap<SubscriberId, Delivery>, chunk: Bytes) {
        self.history.push(chunk.clone());
        if let Some(feed) = &self.feed {
            feed.push(&chunk);
        }

        let snapshot = self.subscribers.snapshot();
        deliveries.retain(|id, _| snapshot.iter().any(|(sid, _)| sid == id));

        for (id, sink) in snapshot {
            deliveries
                .entry(id)
                .or_insert_with(|| {
                    Delivery::spawn(self.session_id, id, sink, &self.settings, self.cancel.child_token())
                })
                .offer(self.session_id, id, chunk.clone());
        }
    }
}
