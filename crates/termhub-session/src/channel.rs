//! Backend channel: the byte stream between a session and its execution.
//!
//! Only `open` reports failure. Once open, transport faults are logged and
//! degraded (empty read, no-op write/resize) so a transient glitch never
//! tears down the owning session.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use termhub_core::{ContainerRuntime, ExecStream, RuntimeError};

/// Bidirectional byte stream bound to one execution.
pub struct BackendChannel {
    container_id: String,
    stream: Box<dyn ExecStream>,
    closed: AtomicBool,
}

impl BackendChannel {
    /// Open an execution in `container_id` through `runtime`.
    ///
    /// # Errors
    /// Returns the runtime's error if the execution cannot be established.
    pub async fn open(
        runtime: &dyn ContainerRuntime,
        container_id: &str,
        command: Option<&str>,
    ) -> Result<Self, RuntimeError> {
        let stream = runtime.open(container_id, command).await.inspect_err(|e| {
            tracing::error!(container_id, error = %e, "Failed to open backend channel");
        })?;
        Ok(Self::from_stream(container_id, stream))
    }

    /// Wrap an already-open stream.
    #[must_use]
    pub fn from_stream(container_id: impl Into<String>, stream: Box<dyn ExecStream>) -> Self {
        Self {
            container_id: container_id.into(),
            stream,
            closed: AtomicBool::new(false),
        }
    }

    /// Container this channel is attached to.
    #[must_use]
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Read up to `max_bytes` of pending output.
    ///
    /// Returns an empty chunk when nothing is available, after close, or on
    /// transport failure.
    pub async fn read(&self, max_bytes: usize) -> Bytes {
        if self.is_closed() {
            return Bytes::new();
        }
        match self.stream.read(max_bytes).await {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::error!(container_id = %self.container_id, error = %e, "Error reading from backend channel");
                Bytes::new()
            }
        }
    }

    /// Best-effort write.
    pub async fn write(&self, data: &[u8]) {
        if self.is_closed() {
            tracing::debug!(container_id = %self.container_id, "Dropping write to closed channel");
            return;
        }
        if let Err(e) = self.stream.write(data).await {
            tracing::error!(container_id = %self.container_id, error = %e, "Error writing to backend channel");
        }
    }

    /// Best-effort resize of this channel's own execution.
    pub async fn resize(&self, rows: u16, cols: u16) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.stream.resize(rows, cols).await {
            tracing::error!(container_id = %self.container_id, rows, cols, error = %e, "Error resizing backend channel");
        }
    }

    /// Release the transport. Later calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.stream.close().await {
            tracing::error!(container_id = %self.container_id, error = %e, "Error closing backend channel");
        }
    }
}

#[cfg(test)]
mod tests {
    use termhub_core::runtime::MemoryRuntime;

    use super::*;

    #[tokio::test]
    async fn test_open_failure_propagates() {
        let runtime = MemoryRuntime::new();
        runtime.reject("c1");

        let result = BackendChannel::open(&runtime, "c1", None).await;
        assert!(matches!(result, Err(RuntimeError::ContainerNotRunning(_))));
    }

    #[tokio::test]
    async fn test_transport_faults_degrade() {
        let runtime = MemoryRuntime::new();
        let channel = BackendChannel::open(&runtime, "c1", None).await.unwrap();
        let handle = runtime.last_handle().unwrap();

        handle.emit(b"pending");
        handle.set_failing(true);
        assert!(channel.read(64).await.is_empty());
        channel.write(b"lost").await;
        channel.resize(10, 10).await;
        assert!(handle.written().is_empty());
        assert!(handle.resizes().is_empty());

        handle.set_failing(false);
        assert_eq!(channel.read(64).await.as_ref(), b"pending");
    }

    #[tokio::test]
    async fn test_resize_targets_own_execution() {
        let runtime = MemoryRuntime::new();
        let first = BackendChannel::open(&runtime, "c1", None).await.unwrap();
        let second = BackendChannel::open(&runtime, "c1", Some("top")).await.unwrap();

        second.resize(40, 120).await;
        first.resize(24, 80).await;

        let handles = runtime.handles();
        assert_eq!(handles[0].resizes(), vec![(24, 80)]);
        assert_eq!(handles[1].resizes(), vec![(40, 120)]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let runtime = MemoryRuntime::new();
        let channel = BackendChannel::open(&runtime, "c1", None).await.unwrap();
        let handle = runtime.last_handle().unwrap();

        channel.close().await;
        channel.close().await;
        assert!(channel.is_closed());
        assert!(handle.is_closed());

        channel.write(b"after close").await;
        assert!(channel.read(16).await.is_empty());
        assert!(handle.written().is_empty());
    }
}
