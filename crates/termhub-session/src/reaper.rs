//! Periodic eviction of idle sessions.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::registry::SessionRegistry;

/// Handle to a running reaper task.
pub struct ReaperHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stop the reaper and wait for it to finish its current pass.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Idle reaper task failed");
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Start a task that calls [`SessionRegistry::reap_idle`] every `interval`.
///
/// The first pass runs one interval after start. A failing pass never stops
/// later ones.
#[must_use]
pub fn spawn_reaper(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> ReaperHandle {
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        tracing::info!(interval_secs = interval.as_secs_f64(), "Idle reaper started");
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    let reaped = registry.reap_idle().await;
                    if !reaped.is_empty() {
                        tracing::info!(count = reaped.len(), "Reaped idle sessions");
                    }
                }
            }
        }
        tracing::info!("Idle reaper stopped");
    });

    ReaperHandle { cancel, task }
}
