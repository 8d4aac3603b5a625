//! Session registry: creation, lookup, listing, and teardown.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use termhub_core::{Config, ContainerRuntime, SessionId, history::DEFAULT_HISTORY_BYTES};
use tokio::sync::RwLock;

use crate::{
    automation::AutomationSettings,
    channel::BackendChannel,
    error::{Result, SessionError},
    fanout::RelaySettings,
    session::{Session, SessionDescriptor, SessionParts},
};

/// Registry tunables.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    pub history_bytes: usize,
    pub relay: RelaySettings,
    pub automation: AutomationSettings,
}

impl From<&Config> for RegistrySettings {
    fn from(config: &Config) -> Self {
        Self {
            max_sessions: config.sessions.max_sessions,
            idle_timeout: config.sessions.idle_timeout(),
            history_bytes: config.sessions.history_bytes,
            relay: RelaySettings::from(&config.sessions),
            automation: AutomationSettings::from(&config.automation),
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_sessions: 50,
            idle_timeout: Duration::from_secs(3600),
            history_bytes: DEFAULT_HISTORY_BYTES,
            relay: RelaySettings::default(),
            automation: AutomationSettings::default(),
        }
    }
}

/// A capacity slot held by a creation that is still connecting.
///
/// Released on drop, so a create future cancelled mid-connect gives its
/// slot back.
struct Reservation<'a> {
    reserved: &'a AtomicUsize,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.reserved.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Authoritative map of live sessions.
pub struct SessionRegistry {
    runtime: Arc<dyn ContainerRuntime>,
    settings: RegistrySettings,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    // Only incremented while the `sessions` write lock is held.
    reserved: AtomicUsize,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: RegistrySettings) -> Self {
        Self {
            runtime,
            settings,
            sessions: RwLock::new(HashMap::new()),
            reserved: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub const fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Open a channel to `container_id` and register a new session.
    ///
    /// # Errors
    /// Returns `Capacity` when the registry is full and `Connection` when the
    /// channel cannot be opened. Neither leaves a session behind.
    pub async fn create(
        &self,
        container_id: &str,
        command: Option<&str>,
        enable_automation: bool,
    ) -> Result<Arc<Session>> {
        let reservation = self.reserve(container_id).await?;

        let channel = BackendChannel::open(self.runtime.as_ref(), container_id, command)
            .await
            .map_err(|source| SessionError::Connection {
                container_id: container_id.to_string(),
                source,
            })?;

        // No await point between starting the relay loop and publishing the session.
        let mut sessions = self.sessions.write().await;
        let id = SessionId::new_v4();
        let session = Session::start(SessionParts {
            id,
            command: command.map(str::to_string),
            channel,
            automation: enable_automation.then(|| self.settings.automation.clone()),
            relay: self.settings.relay.clone(),
            history_bytes: self.settings.history_bytes,
        });
        sessions.insert(id, Arc::clone(&session));
        drop(reservation);
        let count = sessions.len();
        drop(sessions);

        tracing::info!(
            session_id = %id,
            container_id,
            automation = enable_automation,
            count,
            "Session created"
        );
        Ok(session)
    }

    async fn reserve(&self, container_id: &str) -> Result<Reservation<'_>> {
        let sessions = self.sessions.write().await;
        let occupied = sessions.len() + self.reserved.load(Ordering::Acquire);
        if occupied >= self.settings.max_sessions {
            tracing::warn!(container_id, max = self.settings.max_sessions, "Session capacity reached");
            return Err(SessionError::Capacity {
                max: self.settings.max_sessions,
            });
        }
        self.reserved.fetch_add(1, Ordering::AcqRel);
        drop(sessions);
        Ok(Reservation {
            reserved: &self.reserved,
        })
    }

    /// Look up an active session.
    pub async fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Look up an active session, failing with `NotFound`.
    ///
    /// # Errors
    /// Returns `NotFound` if the id is unknown or closed.
    pub async fn require(&self, id: SessionId) -> Result<Arc<Session>> {
        self.get(id).await.ok_or(SessionError::NotFound(id))
    }

    /// Close and forget a session. Returns `false` if it was unknown.
    pub async fn close(&self, id: SessionId) -> bool {
        let removed = self.sessions.write().await.remove(&id);
        match removed {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// Snapshot of every active session.
    pub async fn list(&self) -> Vec<SessionDescriptor> {
        self.sessions
            .read()
            .await
            .values()
            .map(|s| s.descriptor())
            .collect()
    }

    /// Number of active sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Close every session idle for at least the configured timeout.
    ///
    /// Returns the ids that were closed.
    pub async fn reap_idle(&self) -> Vec<SessionId> {
        let timeout = self.settings.idle_timeout;
        let stale: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<SessionId> = sessions
                .iter()
                .filter(|(_, s)| s.idle_for() >= timeout)
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| sessions.remove(id))
                .collect()
        };

        let mut reaped = Vec::with_capacity(stale.len());
        for session in stale {
            tracing::info!(
                session_id = %session.id(),
                idle_secs = session.idle_for().as_secs(),
                "Reaping idle session"
            );
            session.close().await;
            reaped.push(session.id());
        }
        reaped
    }

    /// Close every session.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        if !sessions.is_empty() {
            tracing::info!(count = sessions.len(), "Closing all sessions");
        }
        for session in sessions {
            session.close().await;
        }
    }
}
