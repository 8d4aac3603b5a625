//! Container runtime collaborator traits.
//!
//! A runtime opens an execution inside a container and hands back an
//! [`ExecStream`] bound to exactly that execution. All later I/O, including
//! resize, goes through the stream, never through a lookup by container.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "memory")]
pub use memory::{MemoryExecHandle, MemoryRuntime};

/// Container runtime error.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("Container is not running: {0}")]
    ContainerNotRunning(String),
    #[error("Failed to start execution: {0}")]
    Spawn(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Execution stream closed")]
    Closed,
}

/// Opens execution channels inside containers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start `command` (or the runtime's default shell) in `container_id`.
    ///
    /// # Errors
    /// Returns error if the execution cannot be established.
    async fn open(
        &self,
        container_id: &str,
        command: Option<&str>,
    ) -> Result<Box<dyn ExecStream>, RuntimeError>;
}

/// A live, bidirectional byte stream bound to one execution.
#[async_trait]
pub trait ExecStream: Send + Sync {
    /// Read up to `max_bytes` of pending output.
    ///
    /// Must not wait for output: returns an empty chunk when nothing is
    /// currently available.
    ///
    /// # Errors
    /// Returns error on transport failure.
    async fn read(&self, max_bytes: usize) -> Result<Bytes, RuntimeError>;

    /// Write input to the execution.
    ///
    /// # Errors
    /// Returns error on transport failure.
    async fn write(&self, data: &[u8]) -> Result<(), RuntimeError>;

    /// Resize this execution's terminal.
    ///
    /// # Errors
    /// Returns error on transport failure.
    async fn resize(&self, rows: u16, cols: u16) -> Result<(), RuntimeError>;

    /// Release the execution. Calling it more than once is allowed.
    ///
    /// # Errors
    /// Returns error if the transport could not be released cleanly.
    async fn close(&self) -> Result<(), RuntimeError>;
}
