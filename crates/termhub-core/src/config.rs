//! Configuration management.
//!
//! Configuration is read from a TOML file (default
//! `~/.config/termhub/config.toml`), every field falls back to a default, and
//! a handful of `TERMHUB_*` environment variables override the file.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 10000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("{0} must be greater than 0")]
    ZeroValue(&'static str),

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("log format must be one of: json, pretty; got {0}")]
    InvalidLogFormat(String),

    #[error("runtime binary must not be empty")]
    EmptyRuntimeBinary,
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
const VALID_LOG_FORMATS: &[&str] = &["json", "pretty"];

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// HTTP and push-channel listener.
    pub server: ServerConfig,
    /// Registry, relay loop, and reaper tunables.
    pub sessions: SessionsConfig,
    /// Send/expect engine tunables.
    pub automation: AutomationConfig,
    /// Container runtime invocation.
    pub runtime: RuntimeConfig,
    /// Log output.
    pub logging: LoggingConfig,
}

/// Listener configuration (`[server]`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origins allowed by CORS. Empty or `"*"` allows any origin.
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            allowed_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

/// Session lifecycle configuration (`[sessions]`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionsConfig {
    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,
    /// Sessions idle for longer than this are closed by the reaper.
    pub idle_timeout_secs: u64,
    /// How often the reaper sweeps.
    pub reap_interval_secs: u64,
    /// Relay loop back-off when the channel has no output.
    pub relay_poll_interval_ms: u64,
    /// Maximum bytes pulled from a channel per read.
    pub read_chunk_bytes: usize,
    /// Upper bound on a single subscriber delivery.
    pub sink_timeout_ms: u64,
    /// Per-session output history kept for replay.
    pub history_bytes: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_sessions: 50,
            idle_timeout_secs: 3600,
            reap_interval_secs: 60,
            relay_poll_interval_ms: 10,
            read_chunk_bytes: 4096,
            sink_timeout_ms: 1000,
            history_bytes: 1024 * 1024,
        }
    }
}

impl SessionsConfig {
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    #[must_use]
    pub const fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    #[must_use]
    pub const fn relay_poll_interval(&self) -> Duration {
        Duration::from_millis(self.relay_poll_interval_ms)
    }

    #[must_use]
    pub const fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }
}

/// Automation configuration (`[automation]`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AutomationConfig {
    pub expect_poll_interval_ms: u64,
    pub default_timeout_secs: u64,
    /// Cap on unmatched bytes held by one engine.
    pub max_buffer_bytes: usize,
    /// Prompt waited for by script steps that name none.
    pub default_prompt: String,
    /// Line terminator appended by `sendline`.
    pub newline: String,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            expect_poll_interval_ms: 100,
            default_timeout_secs: 30,
            max_buffer_bytes: 1024 * 1024,
            default_prompt: "$".to_string(),
            newline: "\n".to_string(),
        }
    }
}

impl AutomationConfig {
    #[must_use]
    pub const fn expect_poll_interval(&self) -> Duration {
        Duration::from_millis(self.expect_poll_interval_ms)
    }

    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

/// Container runtime configuration (`[runtime]`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Runtime CLI, resolved through `PATH` when not absolute.
    pub binary: String,
    /// Command started when a session names none.
    pub default_command: String,
    /// `TERM` exported into the execution.
    pub term: String,
    pub rows: u16,
    pub cols: u16,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            default_command: "/bin/bash".to_string(),
            term: "xterm-256color".to_string(),
            rows: 24,
            cols: 80,
        }
    }
}

/// Logging configuration (`[logging]`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `json` or `pretty`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

/// Default configuration file location.
#[must_use]
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termhub")
        .join("config.toml")
}

impl Config {
    /// Validate value ranges.
    ///
    /// # Errors
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let max = self.sessions.max_sessions;
        if !(1..=10_000).contains(&max) {
            return Err(ConfigError::InvalidMaxSessions(max));
        }

        let non_zero = [
            ("sessions.idle_timeout_secs", self.sessions.idle_timeout_secs),
            ("sessions.reap_interval_secs", self.sessions.reap_interval_secs),
            (
                "sessions.relay_poll_interval_ms",
                self.sessions.relay_poll_interval_ms,
            ),
            ("sessions.sink_timeout_ms", self.sessions.sink_timeout_ms),
            (
                "automation.expect_poll_interval_ms",
                self.automation.expect_poll_interval_ms,
            ),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::ZeroValue(name));
            }
        }
        if self.sessions.read_chunk_bytes == 0 {
            return Err(ConfigError::ZeroValue("sessions.read_chunk_bytes"));
        }
        if self.automation.max_buffer_bytes == 0 {
            return Err(ConfigError::ZeroValue("automation.max_buffer_bytes"));
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }
        let format = self.logging.format.to_lowercase();
        if !VALID_LOG_FORMATS.contains(&format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(self.logging.format.clone()));
        }

        if self.runtime.binary.trim().is_empty() {
            return Err(ConfigError::EmptyRuntimeBinary);
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::from_toml(&contents)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?;
        tracing::debug!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Load from `path`, or from the default location.
    ///
    /// A missing default file yields the default configuration; a missing
    /// explicit file is an error.
    ///
    /// # Errors
    /// Returns error if an existing file cannot be read or parsed.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let path = default_config_path();
        if path.is_file() {
            Self::load(&path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    /// Returns error if the TOML is malformed or has wrong types.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML: {}", format_toml_error(&e)))
    }

    /// Serialize configuration to a TOML string.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    /// Apply `TERMHUB_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = var("TERMHUB_HOST") {
            self.server.host = host;
        }
        if let Some(port) = parse_var(&var, "TERMHUB_PORT") {
            self.server.port = port;
        }
        if let Some(level) = var("TERMHUB_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("TERMHUB_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Some(max) = parse_var(&var, "TERMHUB_MAX_SESSIONS") {
            self.sessions.max_sessions = max;
        }
        if let Some(timeout) = parse_var(&var, "TERMHUB_SESSION_TIMEOUT") {
            self.sessions.idle_timeout_secs = timeout;
        }
    }
}

fn parse_var<F, T>(var: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();
    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }
    msg
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.port, 8000);
        assert_eq!(config.sessions.max_sessions, 50);
        assert_eq!(config.sessions.idle_timeout_secs, 3600);
        assert_eq!(config.sessions.reap_interval_secs, 60);
        assert_eq!(config.automation.default_prompt, "$");
        assert_eq!(config.runtime.default_command, "/bin/bash");
        assert_eq!(config.logging.format, "json");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r##"
[sessions]
max_sessions = 5

[automation]
default_prompt = "# "
"##;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.sessions.max_sessions, 5);
        assert_eq!(config.automation.default_prompt, "# ");
        assert_eq!(config.sessions.idle_timeout_secs, 3600);
        assert_eq!(config.runtime.binary, "docker");
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let err = Config::from_toml("[sessions\nmax_sessions = 1").unwrap_err();
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let result = Config::from_toml("[sessions]\nmax_sessions = \"many\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_roundtrip() {
        let mut original = Config::default();
        original.sessions.max_sessions = 7;
        original.server.allowed_origins = vec!["*".to_string()];

        let loaded = Config::from_toml(&original.to_toml().unwrap()).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.sessions.max_sessions = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(0)));

        let mut config = Config::default();
        config.sessions.relay_poll_interval_ms = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroValue("sessions.relay_poll_interval_ms"))
        );

        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel(_))
        ));

        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidLogFormat(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TERMHUB_PORT", "9000"),
            ("TERMHUB_MAX_SESSIONS", "3"),
            ("TERMHUB_SESSION_TIMEOUT", "not-a-number"),
            ("TERMHUB_LOG_FORMAT", "pretty"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| vars.get(key).map(|v| (*v).to_string()));

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.sessions.max_sessions, 3);
        assert_eq!(config.sessions.idle_timeout_secs, 3600);
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[server]\nport = 8123\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 8123);

        let config = Config::load_or_default(Some(&path)).unwrap();
        assert_eq!(config.server.port, 8123);
    }

    #[test]
    fn test_load_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load_or_default(Some(&dir.path().join("missing.toml")));
        assert!(result.is_err());
    }
}
