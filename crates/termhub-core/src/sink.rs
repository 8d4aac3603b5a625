//! Output sink capability.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// Sink error.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Sink closed")]
    Closed,
    #[error("Sink is full")]
    Full,
    #[error("Sink rejected chunk: {0}")]
    Rejected(String),
}

/// Anything that accepts session output.
///
/// The relay loop invokes every subscriber through this one path, whether it
/// forwards to a channel, a push connection, or a plain closure.
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Accept one output chunk.
    ///
    /// # Errors
    /// Returns error if the chunk could not be accepted.
    async fn deliver(&self, chunk: Bytes) -> Result<(), SinkError>;
}

#[async_trait]
impl OutputSink for mpsc::UnboundedSender<Bytes> {
    async fn deliver(&self, chunk: Bytes) -> Result<(), SinkError> {
        self.send(chunk).map_err(|_| SinkError::Closed)
    }
}

#[async_trait]
impl OutputSink for mpsc::Sender<Bytes> {
    async fn deliver(&self, chunk: Bytes) -> Result<(), SinkError> {
        self.try_send(chunk).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

/// Sink backed by a synchronous closure.
pub struct FnSink<F>(F);

impl<F> FnSink<F>
where
    F: Fn(Bytes) -> Result<(), SinkError> + Send + Sync,
{
    /// Wrap a closure.
    #[must_use]
    pub const fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> OutputSink for FnSink<F>
where
    F: Fn(Bytes) -> Result<(), SinkError> + Send + Sync,
{
    async fn deliver(&self, chunk: Bytes) -> Result<(), SinkError> {
        (self.0)(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_sender_reports_full() {
        let (tx, _rx) = mpsc::channel::<Bytes>(1);
        tx.deliver(Bytes::from_static(b"a")).await.unwrap();

        let result = tx.deliver(Bytes::from_static(b"b")).await;
        assert!(matches!(result, Err(SinkError::Full)));
    }

    #[tokio::test]
    async fn test_unbounded_sender_reports_closed() {
        let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
        drop(rx);

        let result = tx.deliver(Bytes::from_static(b"a")).await;
        assert!(matches!(result, Err(SinkError::Closed)));
    }

    #[tokio::test]
    async fn test_fn_sink() {
        let sink = FnSink::new(|chunk: Bytes| {
            if chunk.is_empty() {
                Err(SinkError::Rejected("empty".into()))
            } else {
                Ok(())
            }
        });

        assert!(sink.deliver(Bytes::from_static(b"x")).await.is_ok());
        assert!(sink.deliver(Bytes::new()).await.is_err());
    }
}
