//! A live terminal session bound to one container execution.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use termhub_core::{OutputHistory, OutputSink, SessionId};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    automation::{AutomationEngine, AutomationError, AutomationSettings, Pattern},
    channel::BackendChannel,
    error::{Result, SessionError},
    fanout::{RelayLoop, RelaySettings, SubscriberId, SubscriberSet},
    script::{ExpectResult, ScriptStep},
};

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionDescriptor {
    pub session_id: SessionId,
    pub container_id: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    /// Milliseconds since the Unix epoch.
    pub last_activity: u64,
    pub active: bool,
}

/// Everything needed to bring a session up around an open channel.
pub(crate) struct SessionParts {
    pub id: SessionId,
    pub command: Option<String>,
    pub channel: BackendChannel,
    pub automation: Option<AutomationSettings>,
    pub relay: RelaySettings,
    pub history_bytes: usize,
}

/// A terminal session.
///
/// Owns its backend channel exclusively; once closed it never becomes
/// active again.
pub struct Session {
    id: SessionId,
    container_id: String,
    command: Option<String>,
    created_at: u64,
    started: Instant,
    // Milliseconds after `started`; only ever raised.
    activity_offset: AtomicU64,
    active: AtomicBool,
    channel: Arc<BackendChannel>,
    automation: Option<AutomationEngine>,
    subscribers: Arc<SubscriberSet>,
    history: Arc<OutputHistory>,
    cancel: CancellationToken,
    relay: Mutex<Option<JoinHandle<()>>>,
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

impl Session {
    /// Build the session and start its relay loop.
    pub(crate) fn start(parts: SessionParts) -> Arc<Self> {
        let SessionParts {
            id,
            command,
            channel,
            automation,
            relay,
            history_bytes,
        } = parts;

        let container_id = channel.container_id().to_string();
        let channel = Arc::new(channel);
        let (automation, feed) = match automation {
            Some(settings) => {
                let (engine, feed) = AutomationEngine::new(Arc::clone(&channel), settings);
                (Some(engine), Some(feed))
            }
            None => (None, None),
        };

        let subscribers = Arc::new(SubscriberSet::default());
        let history = Arc::new(OutputHistory::new(history_bytes));
        let cancel = CancellationToken::new();

        let handle = RelayLoop {
            session_id: id,
            channel: Arc::clone(&channel),
            subscribers: Arc::clone(&subscribers),
            history: Arc::clone(&history),
            feed,
            settings: relay,
            cancel: cancel.clone(),
        }
        .spawn();

        Arc::new(Self {
            id,
            container_id,
            command,
            created_at: unix_millis(),
            started: Instant::now(),
            activity_offset: AtomicU64::new(0),
            active: AtomicBool::new(true),
            channel,
            automation,
            subscribers,
            history,
            cancel,
            relay: Mutex::new(Some(handle)),
        })
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    #[must_use]
    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// The automation engine, if automation was requested.
    #[must_use]
    pub const fn automation(&self) -> Option<&AutomationEngine> {
        self.automation.as_ref()
    }

    /// Recent output.
    #[must_use]
    pub fn history(&self) -> &OutputHistory {
        &self.history
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Token cancelled when the session closes.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Creation time in milliseconds since the Unix epoch.
    #[must_use]
    pub const fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Last input or resize, in milliseconds since the Unix epoch.
    #[must_use]
    pub fn last_activity(&self) -> u64 {
        self.created_at
            .saturating_add(self.activity_offset.load(Ordering::SeqCst))
    }

    /// Time since the last input or resize.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        let last = self.started + Duration::from_millis(self.activity_offset.load(Ordering::SeqCst));
        Instant::now().saturating_duration_since(last)
    }

    fn touch(&self) {
        let offset = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.activity_offset.fetch_max(offset, Ordering::SeqCst);
    }

    #[must_use]
    pub fn descriptor(&self) -> SessionDescriptor {
        SessionDescriptor {
            session_id: self.id,
            container_id: self.container_id.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity(),
            active: self.is_active(),
        }
    }

    /// Send input to the execution.
    ///
    /// Ignored once the session is closed. Goes through the automation
    /// engine when there is one.
    pub async fn send_input(&self, data: &[u8]) {
        if !self.is_active() {
            tracing::debug!(session_id = %self.id, "Ignoring input for closed session");
            return;
        }
        self.touch();
        match &self.automation {
            Some(engine) => engine.send(data).await,
            None => self.channel.write(data).await,
        }
    }

    /// Resize this session's terminal.
    pub async fn resize(&self, rows: u16, cols: u16) {
        if !self.is_active() {
            return;
        }
        self.touch();
        self.channel.resize(rows, cols).await;
    }

    /// Subscribe to output.
    pub fn add_output_callback(&self, sink: Arc<dyn OutputSink>) -> SubscriberId {
        let id = self.subscribers.add(sink);
        tracing::debug!(session_id = %self.id, subscriber = %id, "Output subscriber added");
        id
    }

    /// Unsubscribe. Returns `false` if `id` was not subscribed.
    pub fn remove_output_callback(&self, id: SubscriberId) -> bool {
        self.subscribers.remove(id)
    }

    /// Run `commands` in order, waiting for a prompt after each.
    ///
    /// The prompt for command `i` is `expect_prompts[i]` when given, else
    /// the configured default. A prompt timeout is recorded as a failed
    /// step and ends the script.
    ///
    /// # Errors
    /// Returns error if automation is disabled or the engine is closed.
    pub async fn run_script(
        &self,
        commands: &[String],
        expect_prompts: &[String],
        timeout: Option<Duration>,
    ) -> Result<Vec<ScriptStep>> {
        let engine = self.engine()?;
        let timeout = timeout.unwrap_or(engine.settings().default_timeout);
        let mut steps = Vec::with_capacity(commands.len());

        for (i, command) in commands.iter().enumerate() {
            let prompt = expect_prompts
                .get(i)
                .map_or(engine.settings().default_prompt.as_str(), String::as_str);

            match engine
                .send_command(command, true, &Pattern::literal(prompt), timeout)
                .await
            {
                Ok(output) => steps.push(ScriptStep {
                    command: command.clone(),
                    output,
                    success: true,
                }),
                Err(e @ AutomationError::Timeout { .. }) => {
                    tracing::warn!(session_id = %self.id, command, error = %e, "Script step timed out");
                    steps.push(ScriptStep {
                        command: command.clone(),
                        output: e.to_string(),
                        success: false,
                    });
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(steps)
    }

    /// Wait for any of `patterns`, given as literals or regexes.
    ///
    /// # Errors
    /// Returns error if automation is disabled, a regex is invalid, or no
    /// patterns are given. A timeout is reported as an unmatched result.
    pub async fn expect_any(
        &self,
        patterns: &[String],
        regex: bool,
        timeout: Option<Duration>,
    ) -> Result<ExpectResult> {
        let engine = self.engine()?;
        let timeout = timeout.unwrap_or(engine.settings().default_timeout);
        let patterns = Pattern::from_sources(patterns, regex)?;

        match engine.expect(&patterns, timeout).await {
            Ok(index) => Ok(ExpectResult::matched(index, patterns[index].as_str())),
            Err(AutomationError::Timeout { .. }) => Ok(ExpectResult::unmatched()),
            Err(e) => Err(e.into()),
        }
    }

    fn engine(&self) -> Result<&AutomationEngine> {
        self.automation
            .as_ref()
            .ok_or(SessionError::AutomationDisabled(self.id))
    }

    /// Stop the relay loop and release the automation engine and channel.
    ///
    /// Safe to call more than once.
    pub async fn close(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let relay = self
            .relay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(relay) = relay {
            if let Err(e) = relay.await {
                tracing::error!(session_id = %self.id, error = %e, "Relay loop task failed");
            }
        }

        if let Some(engine) = &self.automation {
            engine.close();
        }
        self.channel.close().await;
        self.subscribers.clear();
        tracing::info!(session_id = %self.id, container_id = %self.container_id, "Session closed");
    }
}
