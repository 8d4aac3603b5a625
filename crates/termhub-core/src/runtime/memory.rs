//! In-memory container runtime.

use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use bytes::Bytes;

use super::{ContainerRuntime, ExecStream, RuntimeError};

/// In-memory runtime implementation.
///
/// Useful for development and tests. Every opened stream is recorded and can
/// be driven from the outside through its [`MemoryExecHandle`].
#[derive(Default)]
pub struct MemoryRuntime {
    state: Mutex<RuntimeState>,
    echo: bool,
}

#[derive(Default)]
struct RuntimeState {
    rejected: HashSet<String>,
    opened: Vec<MemoryExecHandle>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryRuntime {
    /// Create a runtime that accepts every container id.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a runtime whose streams reflect written input back as output.
    #[must_use]
    pub fn with_echo() -> Self {
        Self {
            echo: true,
            ..Self::default()
        }
    }

    /// Make `open` fail for this container id.
    pub fn reject(&self, container_id: impl Into<String>) {
        lock(&self.state).rejected.insert(container_id.into());
    }

    /// Handles of every stream opened so far, oldest first.
    #[must_use]
    pub fn handles(&self) -> Vec<MemoryExecHandle> {
        lock(&self.state).opened.clone()
    }

    /// Handle of the most recently opened stream.
    #[must_use]
    pub fn last_handle(&self) -> Option<MemoryExecHandle> {
        lock(&self.state).opened.last().cloned()
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn open(
        &self,
        container_id: &str,
        command: Option<&str>,
    ) -> Result<Box<dyn ExecStream>, RuntimeError> {
        let mut state = lock(&self.state);
        if state.rejected.contains(container_id) {
            return Err(RuntimeError::ContainerNotRunning(container_id.to_string()));
        }

        let handle = MemoryExecHandle {
            shared: Arc::new(Shared {
                container_id: container_id.to_string(),
                command: command.map(str::to_string),
                echo: self.echo,
                io: Mutex::new(StreamIo::default()),
            }),
        };
        state.opened.push(handle.clone());

        Ok(Box::new(MemoryExecStream { handle }))
    }
}

struct Shared {
    container_id: String,
    command: Option<String>,
    echo: bool,
    io: Mutex<StreamIo>,
}

#[derive(Default)]
struct StreamIo {
    pending: VecDeque<Bytes>,
    written: Vec<u8>,
    resizes: Vec<(u16, u16)>,
    closed: bool,
    failing: bool,
}

/// Test-side view of one in-memory execution.
#[derive(Clone)]
pub struct MemoryExecHandle {
    shared: Arc<Shared>,
}

impl MemoryExecHandle {
    /// Container the stream was opened against.
    #[must_use]
    pub fn container_id(&self) -> &str {
        &self.shared.container_id
    }

    /// Command the stream was opened with.
    #[must_use]
    pub fn command(&self) -> Option<&str> {
        self.shared.command.as_deref()
    }

    /// Queue output as if the execution had produced it.
    pub fn emit(&self, data: impl AsRef<[u8]>) {
        let data = data.as_ref();
        if data.is_empty() {
            return;
        }
        lock(&self.shared.io)
            .pending
            .push_back(Bytes::copy_from_slice(data));
    }

    /// Everything written to the execution so far.
    #[must_use]
    pub fn written(&self) -> Vec<u8> {
        lock(&self.shared.io).written.clone()
    }

    /// Written input decoded lossily as UTF-8.
    #[must_use]
    pub fn written_string(&self) -> String {
        String::from_utf8_lossy(&self.written()).into_owned()
    }

    /// Every resize received, in order, as `(rows, cols)`.
    #[must_use]
    pub fn resizes(&self) -> Vec<(u16, u16)> {
        lock(&self.shared.io).resizes.clone()
    }

    /// Whether the stream has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.shared.io).closed
    }

    /// Make every read, write, and resize fail until turned off again.
    pub fn set_failing(&self, failing: bool) {
        lock(&self.shared.io).failing = failing;
    }
}

struct MemoryExecStream {
    handle: MemoryExecHandle,
}

fn injected_failure() -> RuntimeError {
    RuntimeError::Io(std::io::Error::other("injected transport failure"))
}

#[async_trait]
impl ExecStream for MemoryExecStream {
    async fn read(&self, max_bytes: usize) -> Result<Bytes, RuntimeError> {
        let mut io = lock(&self.handle.shared.io);
        if io.failing {
            return Err(injected_failure());
        }
        if io.closed {
            return Ok(Bytes::new());
        }
        let Some(mut chunk) = io.pending.pop_front() else {
            return Ok(Bytes::new());
        };
        if chunk.len() > max_bytes {
            let rest = chunk.split_off(max_bytes);
            io.pending.push_front(rest);
        }
        Ok(chunk)
    }

    async fn write(&self, data: &[u8]) -> Result<(), RuntimeError> {
        let mut io = lock(&self.handle.shared.io);
        if io.failing {
            return Err(injected_failure());
        }
        if io.closed {
            return Err(RuntimeError::Closed);
        }
        io.written.extend_from_slice(data);
        if self.handle.shared.echo && !data.is_empty() {
            io.pending.push_back(Bytes::copy_from_slice(data));
        }
        Ok(())
    }

    async fn resize(&self, rows: u16, cols: u16) -> Result<(), RuntimeError> {
        let mut io = lock(&self.handle.shared.io);
        if io.failing {
            return Err(injected_failure());
        }
        if io.closed {
            return Err(RuntimeError::Closed);
        }
        io.resizes.push((rows, cols));
        Ok(())
    }

    async fn close(&self) -> Result<(), RuntimeError> {
        let mut io = lock(&self.handle.shared.io);
        io.closed = true;
        io.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_is_non_blocking() {
        let runtime = MemoryRuntime::new();
        let stream = runtime.open("c1", None).await.unwrap();

        let chunk = stream.read(4096).await.unwrap();
        assert!(chunk.is_empty());
    }

    #[tokio::test]
    async fn test_read_splits_large_chunks() {
        let runtime = MemoryRuntime::new();
        let stream = runtime.open("c1", Some("sh")).await.unwrap();
        let handle = runtime.last_handle().unwrap();
        assert_eq!(handle.command(), Some("sh"));

        handle.emit(b"abcdef");
        assert_eq!(stream.read(4).await.unwrap().as_ref(), b"abcd");
        assert_eq!(stream.read(4).await.unwrap().as_ref(), b"ef");
    }

    #[tokio::test]
    async fn test_rejected_container() {
        let runtime = MemoryRuntime::new();
        runtime.reject("gone");

        let result = runtime.open("gone", None).await;
        assert!(matches!(result, Err(RuntimeError::ContainerNotRunning(_))));
        assert!(runtime.handles().is_empty());
    }

    #[tokio::test]
    async fn test_echo_and_close() {
        let runtime = MemoryRuntime::with_echo();
        let stream = runtime.open("c1", None).await.unwrap();
        let handle = runtime.last_handle().unwrap();

        stream.write(b"hi").await.unwrap();
        assert_eq!(stream.read(16).await.unwrap().as_ref(), b"hi");
        assert_eq!(handle.written_string(), "hi");

        stream.close().await.unwrap();
        stream.close().await.unwrap();
        assert!(handle.is_closed());
        assert!(matches!(stream.write(b"x").await, Err(RuntimeError::Closed)));
    }
}
