//! Application context shared by every handler.

use std::sync::{Arc, Mutex, PoisonError};

use termhub_core::{Config, ContainerRuntime};
use termhub_session::{ReaperHandle, RegistrySettings, SessionRegistry, spawn_reaper};
use tokio_util::sync::CancellationToken;

use crate::hub::ConnectionHub;

struct Inner {
    config: Config,
    registry: Arc<SessionRegistry>,
    hub: Arc<ConnectionHub>,
    reaper: Mutex<Option<ReaperHandle>>,
    shutdown: CancellationToken,
}

/// Owns the registry, the connection hub, and the reaper.
///
/// Built once at startup and handed to handlers; cloning is cheap.
#[derive(Clone)]
pub struct AppContext {
    inner: Arc<Inner>,
}

impl AppContext {
    #[must_use]
    pub fn new(config: Config, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let registry = Arc::new(SessionRegistry::new(runtime, RegistrySettings::from(&config)));
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                hub: Arc::new(ConnectionHub::new()),
                reaper: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    #[must_use]
    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.inner.hub
    }

    /// Cancelled when `shutdown` begins.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Start background tasks. Calling it again is a no-op.
    pub fn start(&self) {
        let mut reaper = self.inner.reaper.lock().unwrap_or_else(PoisonError::into_inner);
        if reaper.is_some() {
            return;
        }
        *reaper = Some(spawn_reaper(
            Arc::clone(&self.inner.registry),
            self.inner.config.sessions.reap_interval(),
            self.inner.shutdown.child_token(),
        ));
    }

    /// Stop the reaper and close every session.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let reaper = self
            .inner
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reaper) = reaper {
            reaper.stop().await;
        }
        self.inner.registry.close_all().await;
        tracing::info!("Application context shut down");
    }
}
