//! Send/expect automation over a backend channel.
//!
//! The relay loop is the only reader of a channel; when automation is enabled
//! it pushes every chunk into the engine through an [`AutomationFeed`]. The
//! engine accumulates those bytes until a pattern matches, then discards
//! everything up to and including the match.

use std::{
    slice,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use regex::bytes::Regex;
use termhub_core::config::AutomationConfig;
use thiserror::Error;
use tokio::time::Instant;

use crate::channel::BackendChannel;

/// Automation error.
#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("Pattern not found within {timeout:?}")]
    Timeout {
        timeout: Duration,
        /// Bytes discarded by the buffer cap over the engine's lifetime.
        dropped_bytes: u64,
    },
    #[error("Invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
    #[error("No patterns supplied")]
    NoPatterns,
    #[error("Automation engine closed")]
    Closed,
}

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct AutomationSettings {
    pub poll_interval: Duration,
    pub default_timeout: Duration,
    pub max_buffer_bytes: usize,
    pub default_prompt: String,
    pub newline: String,
}

impl From<&AutomationConfig> for AutomationSettings {
    fn from(config: &AutomationConfig) -> Self {
        Self {
            poll_interval: config.expect_poll_interval(),
            default_timeout: config.default_timeout(),
            max_buffer_bytes: config.max_buffer_bytes,
            default_prompt: config.default_prompt.clone(),
            newline: config.newline.clone(),
        }
    }
}

impl Default for AutomationSettings {
    fn default() -> Self {
        Self::from(&AutomationConfig::default())
    }
}

/// A literal string or a regular expression to wait for.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Matched byte-for-byte, never interpreted as a regex.
    Literal(String),
    Regex(Regex),
}

impl Pattern {
    /// A literal pattern.
    #[must_use]
    pub fn literal(text: impl Into<String>) -> Self {
        Self::Literal(text.into())
    }

    /// A regular expression pattern.
    ///
    /// # Errors
    /// Returns error if the expression does not compile.
    pub fn regex(expr: &str) -> Result<Self, AutomationError> {
        Ok(Self::Regex(Regex::new(expr)?))
    }

    /// Build patterns from strings, as literals or as regexes.
    ///
    /// # Errors
    /// Returns error if a regex does not compile.
    pub fn from_sources<S: AsRef<str>>(
        sources: &[S],
        as_regex: bool,
    ) -> Result<Vec<Self>, AutomationError> {
        sources
            .iter()
            .map(|s| {
                if as_regex {
                    Self::regex(s.as_ref())
                } else {
                    Ok(Self::literal(s.as_ref()))
                }
            })
            .collect()
    }

    /// The pattern's source text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Literal(text) => text,
            Self::Regex(regex) => regex.as_str(),
        }
    }

    /// Compiled matcher; literals become escaped expressions.
    fn matcher(&self) -> Result<Regex, AutomationError> {
        match self {
            Self::Literal(text) => Ok(Regex::new(&regex::escape(text))?),
            Self::Regex(regex) => Ok(regex.clone()),
        }
    }
}

impl From<&str> for Pattern {
    fn from(text: &str) -> Self {
        Self::literal(text)
    }
}

struct Shared {
    buffer: Mutex<Vec<u8>>,
    dropped: AtomicU64,
    closed: AtomicBool,
    max_bytes: usize,
}

impl Shared {
    fn buffer(&self) -> MutexGuard<'_, Vec<u8>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Producer side of an engine's buffer, held by the relay loop.
#[derive(Clone)]
pub struct AutomationFeed {
    shared: Arc<Shared>,
}

impl AutomationFeed {
    /// Append received output, enforcing the buffer cap.
    pub fn push(&self, chunk: &[u8]) {
        if chunk.is_empty() || self.shared.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut buffer = self.shared.buffer();
        buffer.extend_from_slice(chunk);
        if buffer.len() > self.shared.max_bytes {
            let excess = buffer.len() - self.shared.max_bytes;
            buffer.drain(..excess);
            let total = self.shared.dropped.fetch_add(excess as u64, Ordering::SeqCst) + excess as u64;
            tracing::warn!(
                dropped = excess,
                total_dropped = total,
                cap = self.shared.max_bytes,
                "Automation buffer overflow, discarded oldest bytes"
            );
        }
    }
}

/// Successful match: which pattern won and what preceded it.
struct Match {
    index: usize,
    before: Vec<u8>,
}

/// Send/expect engine wrapping one backend channel.
///
/// The engine never closes the channel; that stays with the session.
pub struct AutomationEngine {
    channel: Arc<BackendChannel>,
    shared: Arc<Shared>,
    // Serializes expect/send_command so one match cannot consume another's output.
    op_lock: tokio::sync::Mutex<()>,
    settings: AutomationSettings,
}

impl AutomationEngine {
    /// Create an engine and the feed that supplies its buffer.
    #[must_use]
    pub fn new(channel: Arc<BackendChannel>, settings: AutomationSettings) -> (Self, AutomationFeed) {
        let shared = Arc::new(Shared {
            buffer: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            max_bytes: settings.max_buffer_bytes,
        });
        let feed = AutomationFeed {
            shared: Arc::clone(&shared),
        };
        let engine = Self {
            channel,
            shared,
            op_lock: tokio::sync::Mutex::new(()),
            settings,
        };
        (engine, feed)
    }

    /// Engine tunables.
    #[must_use]
    pub const fn settings(&self) -> &AutomationSettings {
        &self.settings
    }

    /// Send raw input.
    pub async fn send(&self, data: &[u8]) {
        self.channel.write(data).await;
    }

    /// Send `line` followed by the configured line terminator.
    pub async fn sendline(&self, line: &str) {
        let mut data = Vec::with_capacity(line.len() + self.settings.newline.len());
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(self.settings.newline.as_bytes());
        self.send(&data).await;
    }

    /// Wait until one of `patterns` appears in the buffer.
    ///
    /// Patterns are tested in the order given; the first one that matches
    /// anywhere in the buffer wins, regardless of where other patterns would
    /// match. On a win the buffer is discarded through the end of the match
    /// and the winning index is returned.
    ///
    /// # Errors
    /// Returns `Timeout` if nothing matches before `timeout` elapses.
    pub async fn expect(
        &self,
        patterns: &[Pattern],
        timeout: Duration,
    ) -> Result<usize, AutomationError> {
        let deadline = Instant::now() + timeout;
        let _op = self.acquire(deadline, timeout).await?;
        self.wait_for(patterns, deadline, timeout)
            .await
            .map(|m| m.index)
    }

    /// Clear the buffer, send `command` as a line, and collect its output.
    ///
    /// With `expect_prompt` the call waits for `prompt` and returns the bytes
    /// that arrived between the send and the start of the prompt match.
    /// Without it, whatever has arrived so far is returned.
    ///
    /// # Errors
    /// Returns `Timeout` if the prompt does not appear in time.
    pub async fn send_command(
        &self,
        command: &str,
        expect_prompt: bool,
        prompt: &Pattern,
        timeout: Duration,
    ) -> Result<String, AutomationError> {
        let deadline = Instant::now() + timeout;
        let _op = self.acquire(deadline, timeout).await?;
        self.ensure_open()?;

        self.shared.buffer().clear();
        self.sendline(command).await;

        let output = if expect_prompt {
            self.wait_for(slice::from_ref(prompt), deadline, timeout)
                .await?
                .before
        } else {
            self.shared.buffer().clone()
        };
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    /// Discard all unmatched output.
    pub fn clear(&self) {
        self.shared.buffer().clear();
    }

    /// Copy of the unmatched output currently held.
    #[must_use]
    pub fn buffered(&self) -> Vec<u8> {
        self.shared.buffer().clone()
    }

    /// Bytes discarded by the buffer cap so far.
    #[must_use]
    pub fn dropped_bytes(&self) -> u64 {
        self.shared.dropped.load(Ordering::SeqCst)
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Clear the buffer and stop accepting output. The channel stays open.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.buffer().clear();
    }

    fn ensure_open(&self) -> Result<(), AutomationError> {
        if self.is_closed() {
            Err(AutomationError::Closed)
        } else {
            Ok(())
        }
    }

    async fn acquire(
        &self,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<tokio::sync::MutexGuard<'_, ()>, AutomationError> {
        tokio::time::timeout_at(deadline, self.op_lock.lock())
            .await
            .map_err(|_| self.timeout_error(timeout))
    }

    async fn wait_for(
        &self,
        patterns: &[Pattern],
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Match, AutomationError> {
        if patterns.is_empty() {
            return Err(AutomationError::NoPatterns);
        }
        let matchers = patterns
            .iter()
            .map(Pattern::matcher)
            .collect::<Result<Vec<_>, _>>()?;

        loop {
            self.ensure_open()?;

            if let Some(found) = self.try_match(patterns, &matchers) {
                return Ok(found);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.timeout_error(timeout));
            }
            tokio::time::sleep(self.settings.poll_interval.min(deadline - now)).await;
        }
    }

    fn try_match(&self, patterns: &[Pattern], matchers: &[Regex]) -> Option<Match> {
        let mut buffer = self.shared.buffer();
        patterns.iter().zip(matchers).enumerate().find_map(|(index, (pattern, matcher))| {
            let found = matcher.find(&buffer)?;
            let (start, end) = (found.start(), found.end());
            let consumed: Vec<u8> = buffer.drain(..end).collect();
            tracing::debug!(index, pattern = pattern.as_str(), "Automation pattern matched");
            Some(Match {
                index,
                before: consumed[..start].to_vec(),
            })
        })
    }

    fn timeout_error(&self, timeout: Duration) -> AutomationError {
        AutomationError::Timeout {
            timeout,
            dropped_bytes: self.dropped_bytes(),
        }
    }
}
