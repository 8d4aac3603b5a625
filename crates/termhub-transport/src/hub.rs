//! Broadcaster from sessions to connected push-channel clients.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use termhub_core::{OutputSink, SessionId, SinkError};
use termhub_session::SubscriberId;
use tokio::sync::mpsc;

use crate::protocol::{ServerMessage, Utf8Decoder};

/// Identifies one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Outbound half of one client connection.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ClientConnection {
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a message. Returns `false` if the connection is gone.
    pub fn send(&self, msg: ServerMessage) -> bool {
        self.tx.send(msg).is_ok()
    }
}

#[derive(Default)]
struct HubState {
    connections: HashMap<SessionId, Vec<ClientConnection>>,
    // One output subscription per session, shared by all its connections.
    subscriptions: HashMap<SessionId, SubscriberId>,
}

/// Maps sessions to their live client connections.
#[derive(Default)]
pub struct ConnectionHub {
    next_id: AtomicU64,
    state: Mutex<HubState>,
}

impl ConnectionHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a connection and the receiver that drains it.
    pub fn open_connection(&self) -> (ClientConnection, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        (ClientConnection { id, tx }, rx)
    }

    /// Register `conn` for `session_id`.
    ///
    /// `subscribe` runs only when the session has no output subscription
    /// yet, and its result is remembered until the last connection leaves.
    pub fn connect<F>(&self, session_id: SessionId, conn: ClientConnection, subscribe: F)
    where
        F: FnOnce() -> SubscriberId,
    {
        let mut state = self.state();
        let conn_id = conn.id;
        state.connections.entry(session_id).or_default().push(conn);
        if !state.subscriptions.contains_key(&session_id) {
            let sub = subscribe();
            state.subscriptions.insert(session_id, sub);
        }
        let count = state.connections.get(&session_id).map_or(0, Vec::len);
        drop(state);
        tracing::info!(session_id = %session_id, connection = %conn_id, count, "Client connected");
    }

    /// Remove a connection.
    ///
    /// When the session has no connections left its entry is pruned and the
    /// output subscription is handed back for removal.
    pub fn disconnect(&self, session_id: SessionId, conn_id: ConnectionId) -> Option<SubscriberId> {
        let mut state = self.state();
        let remaining = match state.connections.get_mut(&session_id) {
            Some(conns) => {
                conns.retain(|c| c.id != conn_id);
                conns.len()
            }
            None => 0,
        };
        tracing::info!(session_id = %session_id, connection = %conn_id, remaining, "Client disconnected");

        if remaining > 0 {
            return None;
        }
        state.connections.remove(&session_id);
        state.subscriptions.remove(&session_id)
    }

    /// Send `msg` to every connection of `session_id`.
    ///
    /// Connections whose send fails are pruned in the same pass. Returns the
    /// number of connections that accepted the message.
    pub fn deliver(&self, session_id: SessionId, msg: &ServerMessage) -> usize {
        let mut state = self.state();
        let Some(conns) = state.connections.get_mut(&session_id) else {
            return 0;
        };

        conns.retain(|conn| {
            let ok = conn.send(msg.clone());
            if !ok {
                tracing::debug!(session_id = %session_id, connection = %conn.id, "Pruning dead connection");
            }
            ok
        });
        let delivered = conns.len();
        if delivered == 0 {
            state.connections.remove(&session_id);
        }
        delivered
    }

    /// Number of live connections for a session.
    #[must_use]
    pub fn connection_count(&self, session_id: SessionId) -> usize {
        self.state().connections.get(&session_id).map_or(0, Vec::len)
    }

    /// Number of sessions with at least one connection.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.state().connections.len()
    }
}

/// Output sink forwarding a session's output to its hub connections.
pub struct HubSink {
    hub: Arc<ConnectionHub>,
    session_id: SessionId,
    decoder: Mutex<Utf8Decoder>,
}

impl HubSink {
    #[must_use]
    pub fn new(hub: Arc<ConnectionHub>, session_id: SessionId) -> Self {
        Self {
            hub,
            session_id,
            decoder: Mutex::new(Utf8Decoder::default()),
        }
    }
}

#[async_trait]
impl OutputSink for HubSink {
    async fn deliver(&self, chunk: Bytes) -> Result<(), SinkError> {
        let text = self
            .decoder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .decode(&chunk);
        if !text.is_empty() {
            self.hub.deliver(self.session_id, &ServerMessage::output(text));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(n: u64) -> SubscriberId {
        // Subscriber ids only come from a session; borrow one from a fresh set.
        let set = termhub_session::fanout::SubscriberSet::default();
        let (tx, _rx) = mpsc::unbounded_channel::<Bytes>();
        let sink: Arc<dyn OutputSink> = Arc::new(tx);
        let mut id = set.add(Arc::clone(&sink));
        for _ in 0..n {
            id = set.add(Arc::clone(&sink));
        }
        id
    }

    #[test]
    fn test_subscribe_runs_once_per_session() {
        let hub = ConnectionHub::new();
        let session = SessionId::new_v4();
        let mut calls = 0;

        let (a, _rx_a) = hub.open_connection();
        let (b, _rx_b) = hub.open_connection();
        hub.connect(session, a.clone(), || {
            calls += 1;
            sub(0)
        });
        hub.connect(session, b.clone(), || {
            calls += 1;
            sub(1)
        });

        assert_eq!(calls, 1);
        assert_eq!(hub.connection_count(session), 2);

        assert_eq!(hub.disconnect(session, a.id()), None);
        assert_eq!(hub.disconnect(session, b.id()), Some(sub(0)));
        assert_eq!(hub.session_count(), 0);
    }

    #[test]
    fn test_deliver_fans_out_and_prunes() {
        let hub = ConnectionHub::new();
        let session = SessionId::new_v4();
        let other = SessionId::new_v4();

        let (live, mut live_rx) = hub.open_connection();
        let (dead, dead_rx) = hub.open_connection();
        let (elsewhere, mut elsewhere_rx) = hub.open_connection();
        hub.connect(session, live, || sub(0));
        hub.connect(session, dead, || sub(0));
        hub.connect(other, elsewhere, || sub(0));
        drop(dead_rx);

        let delivered = hub.deliver(session, &ServerMessage::output("x"));
        assert_eq!(delivered, 1);
        assert_eq!(hub.connection_count(session), 1);
        assert_eq!(live_rx.try_recv().unwrap(), ServerMessage::output("x"));
        assert!(elsewhere_rx.try_recv().is_err());
    }

    #[test]
    fn test_last_failed_connection_prunes_entry() {
        let hub = ConnectionHub::new();
        let session = SessionId::new_v4();
        let (conn, rx) = hub.open_connection();
        let conn_id = conn.id();
        hub.connect(session, conn, || sub(3));
        drop(rx);

        assert_eq!(hub.deliver(session, &ServerMessage::Pong), 0);
        assert_eq!(hub.session_count(), 0);
        // The subscription is still released when the handler disconnects.
        assert_eq!(hub.disconnect(session, conn_id), Some(sub(3)));
    }

    #[tokio::test]
    async fn test_hub_sink_decodes_output() {
        let hub = Arc::new(ConnectionHub::new());
        let session = SessionId::new_v4();
        let (conn, mut rx) = hub.open_connection();
        hub.connect(session, conn, || sub(0));

        let sink = HubSink::new(Arc::clone(&hub), session);
        let bytes = "ü!".as_bytes();
        sink.deliver(Bytes::copy_from_slice(&bytes[..1])).await.unwrap();
        sink.deliver(Bytes::copy_from_slice(&bytes[1..])).await.unwrap();

        assert_eq!(rx.try_recv().unwrap(), ServerMessage::output("ü!"));
        assert!(rx.try_recv().is_err());
    }
}
