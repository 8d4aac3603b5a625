//! `docker exec` runtime backed by a local pseudo-terminal.
//!
//! Each opened stream owns its PTY pair and exec child, so resize always
//! applies to the session's own execution.

use std::{
    io::{Read, Write},
    path::PathBuf,
    process::Stdio,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use termhub_core::{
    ContainerRuntime, ExecStream, RuntimeError, config::RuntimeConfig,
};
use tokio::sync::mpsc;

use crate::{command::ExecCommand, locate::resolve_executable_path};

/// Buffer size for reading from the PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Settings for [`DockerExecRuntime`].
#[derive(Debug, Clone)]
pub struct DockerSettings {
    pub binary: String,
    pub default_command: String,
    pub term: String,
    pub rows: u16,
    pub cols: u16,
}

impl From<&RuntimeConfig> for DockerSettings {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            default_command: config.default_command.clone(),
            term: config.term.clone(),
            rows: config.rows,
            cols: config.cols,
        }
    }
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

/// Container runtime driving the Docker CLI.
pub struct DockerExecRuntime {
    binary: PathBuf,
    settings: DockerSettings,
}

impl DockerExecRuntime {
    /// Resolve the runtime binary and build the runtime.
    ///
    /// # Errors
    /// Returns error if the binary cannot be found.
    pub async fn locate(settings: DockerSettings) -> Result<Self, RuntimeError> {
        let binary = resolve_executable_path(&settings.binary)
            .await
            .ok_or_else(|| {
                RuntimeError::Unavailable(format!("executable not found: {}", settings.binary))
            })?;
        tracing::info!(binary = %binary.display(), "Using container runtime CLI");
        Ok(Self { binary, settings })
    }

    async fn ensure_running(&self, container_id: &str) -> Result<(), RuntimeError> {
        let output = tokio::process::Command::new(&self.binary)
            .args(["container", "inspect", "--format", "{{.State.Running}}"])
            .arg(container_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        let running = output.status.success()
            && String::from_utf8_lossy(&output.stdout).trim() == "true";
        if running {
            Ok(())
        } else {
            tracing::debug!(
                container_id,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "Container inspect reported not running"
            );
            Err(RuntimeError::ContainerNotRunning(container_id.to_string()))
        }
    }

    fn spawn_exec(&self, args: Vec<String>, container_id: &str) -> Result<PtyExecStream, RuntimeError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: self.settings.rows,
                cols: self.settings.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| RuntimeError::Spawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&self.binary);
        cmd.args(&args);
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| RuntimeError::Spawn(e.to_string()))?;
        // The exec child holds the slave end; dropping ours lets EOF propagate.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| RuntimeError::Spawn(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| RuntimeError::Spawn(format!("failed to take PTY writer: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        spawn_reader(reader, tx, container_id.to_string());
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        spawn_writer(writer, input_rx, container_id.to_string());

        Ok(PtyExecStream {
            container_id: container_id.to_string(),
            pid: child.process_id(),
            master: Mutex::new(pair.master),
            input: Mutex::new(Some(input_tx)),
            child: Mutex::new(Some(child)),
            output: Mutex::new(OutputQueue {
                rx,
                pending: Bytes::new(),
            }),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerExecRuntime {
    async fn open(
        &self,
        container_id: &str,
        command: Option<&str>,
    ) -> Result<Box<dyn ExecStream>, RuntimeError> {
        let command = command
            .filter(|c| !c.trim().is_empty())
            .unwrap_or(&self.settings.default_command);
        let args = ExecCommand::new(container_id, command)
            .env("TERM", &self.settings.term)
            .build()
            .map_err(|e| RuntimeError::Spawn(e.to_string()))?;

        self.ensure_running(container_id).await?;

        let stream = self.spawn_exec(args, container_id)?;
        tracing::info!(container_id, command, "Opened exec channel");
        Ok(Box::new(stream))
    }
}

fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::UnboundedSender<Bytes>,
    container_id: String,
) {
    std::thread::spawn(move || {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(Bytes::copy_from_slice(&buffer[..n])).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::debug!(container_id = %container_id, error = %e, "PTY read ended");
                    break;
                }
            }
        }
        tracing::debug!(container_id = %container_id, "PTY reader thread exiting");
    });
}

/// Writes queued input to the PTY off the async runtime.
///
/// A child that stops reading fills the PTY buffer and blocks `write(2)`;
/// only this thread waits on it.
fn spawn_writer(
    mut writer: Box<dyn Write + Send>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    container_id: String,
) {
    std::thread::spawn(move || {
        while let Some(data) = rx.blocking_recv() {
            if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
                tracing::debug!(container_id = %container_id, error = %e, "PTY write failed");
                break;
            }
        }
        tracing::debug!(container_id = %container_id, "PTY writer thread exiting");
    });
}

/// Kill the exec child and wait for it so no zombie is left behind.
fn reap_child(mut child: Box<dyn Child + Send + Sync>, container_id: String) {
    std::thread::spawn(move || {
        if matches!(child.try_wait(), Ok(None)) {
            if let Err(e) = child.kill() {
                tracing::debug!(container_id = %container_id, error = %e, "Exec child kill failed");
            }
        }
        match child.wait() {
            Ok(status) => {
                tracing::debug!(container_id = %container_id, code = status.exit_code(), "Exec child exited");
            }
            Err(e) => {
                tracing::debug!(container_id = %container_id, error = %e, "Exec child wait failed");
            }
        }
    });
}

struct OutputQueue {
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
}

struct PtyExecStream {
    container_id: String,
    pid: Option<u32>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    input: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    output: Mutex<OutputQueue>,
    closed: AtomicBool,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PtyExecStream {
    fn release(&self) {
        lock(&self.input).take();
        if let Some(child) = lock(&self.child).take() {
            reap_child(child, self.container_id.clone());
        }
    }
}

#[async_trait]
impl ExecStream for PtyExecStream {
    async fn read(&self, max_bytes: usize) -> Result<Bytes, RuntimeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(Bytes::new());
        }

        let mut output = lock(&self.output);
        if output.pending.is_empty() {
            match output.rx.try_recv() {
                Ok(chunk) => output.pending = chunk,
                // Disconnected means the exec ended; there is nothing more to read.
                Err(mpsc::error::TryRecvError::Empty | mpsc::error::TryRecvError::Disconnected) => {
                    return Ok(Bytes::new());
                }
            }
        }
        let take = max_bytes.min(output.pending.len());
        Ok(output.pending.split_to(take))
    }

    async fn write(&self, data: &[u8]) -> Result<(), RuntimeError> {
        let input = lock(&self.input);
        let input = input.as_ref().ok_or(RuntimeError::Closed)?;
        input
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| RuntimeError::Closed)
    }

    async fn resize(&self, rows: u16, cols: u16) -> Result<(), RuntimeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RuntimeError::Closed);
        }
        lock(&self.master)
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| RuntimeError::Io(std::io::Error::other(e.to_string())))
    }

    async fn close(&self) -> Result<(), RuntimeError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.release();
        tracing::debug!(container_id = %self.container_id, "Exec channel released");
        Ok(())
    }
}

impl Drop for PtyExecStream {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_config() {
        let mut config = RuntimeConfig::default();
        config.binary = "podman".to_string();
        config.rows = 50;

        let settings = DockerSettings::from(&config);
        assert_eq!(settings.binary, "podman");
        assert_eq!(settings.rows, 50);
        assert_eq!(settings.default_command, "/bin/bash");
    }

    #[tokio::test]
    async fn test_locate_missing_binary() {
        let settings = DockerSettings {
            binary: "/nonexistent/termhub-docker".to_string(),
            ..DockerSettings::default()
        };

        let result = DockerExecRuntime::locate(settings).await;
        assert!(matches!(result, Err(RuntimeError::Unavailable(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_open_rejects_when_inspect_fails() {
        // `false` exits non-zero for any arguments, like inspecting an unknown container.
        let settings = DockerSettings {
            binary: "false".to_string(),
            ..DockerSettings::default()
        };
        let Ok(runtime) = DockerExecRuntime::locate(settings).await else {
            return;
        };

        let result = runtime.open("missing", None).await;
        assert!(matches!(result, Err(RuntimeError::ContainerNotRunning(_))));
    }

    fn local_runtime(binary: &str) -> Option<DockerExecRuntime> {
        let binary = which::which(binary).ok()?;
        Some(DockerExecRuntime {
            binary,
            settings: DockerSettings::default(),
        })
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pty_stream_echoes_input() {
        let Some(runtime) = local_runtime("cat") else {
            return;
        };
        let Ok(stream) = runtime.spawn_exec(Vec::new(), "local") else {
            return;
        };

        stream.write(b"hello\n").await.unwrap();

        let mut output = Vec::new();
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while !String::from_utf8_lossy(&output).contains("hello") {
            assert!(tokio::time::Instant::now() < deadline, "no echo: {output:?}");
            let chunk = stream.read(READ_BUFFER_SIZE).await.unwrap();
            if chunk.is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            output.extend_from_slice(&chunk);
        }

        stream.close().await.unwrap();
        assert!(matches!(stream.write(b"late").await, Err(RuntimeError::Closed)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_does_not_block_when_child_stops_reading() {
        let Some(runtime) = local_runtime("sleep") else {
            return;
        };
        let Ok(stream) = runtime.spawn_exec(vec!["30".to_string()], "local") else {
            return;
        };

        let payload = vec![b'x'; 1 << 20];
        let written = tokio::time::timeout(std::time::Duration::from_secs(1), stream.write(&payload)).await;
        assert!(matches!(written, Ok(Ok(()))));

        stream.close().await.unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_close_reaps_exec_child() {
        let Some(runtime) = local_runtime("sleep") else {
            return;
        };
        let Ok(stream) = runtime.spawn_exec(vec!["30".to_string()], "local") else {
            return;
        };
        let Some(pid) = stream.pid else {
            return;
        };
        let proc_dir = PathBuf::from(format!("/proc/{pid}"));
        assert!(proc_dir.exists());

        stream.close().await.unwrap();

        // A zombie keeps its /proc entry until it is waited on.
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while proc_dir.exists() {
            assert!(tokio::time::Instant::now() < deadline, "exec child {pid} was not reaped");
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }
}
