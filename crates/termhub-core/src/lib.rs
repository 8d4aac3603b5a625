//! Core abstractions for container terminal session orchestration.
//!
//! This crate provides the shared building blocks:
//! - `ContainerRuntime` / `ExecStream` - The collaborator that opens execution channels
//! - `OutputSink` - The single capability every output subscriber implements
//! - `OutputHistory` - Byte-bounded history of recent session output
//! - `Config` - TOML configuration for the whole service

pub mod config;
pub mod history;
pub mod runtime;
pub mod sink;

pub use config::{Config, ConfigError};
pub use history::OutputHistory;
pub use runtime::{ContainerRuntime, ExecStream, RuntimeError};
pub use sink::{FnSink, OutputSink, SinkError};

/// Session identifier.
pub type SessionId = uuid::Uuid;
