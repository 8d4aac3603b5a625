//! Byte-bounded output history for replay to late subscribers.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use bytes::{Bytes, BytesMut};

/// Default history size limit (1 MiB).
pub const DEFAULT_HISTORY_BYTES: usize = 1024 * 1024;

struct Inner {
    chunks: VecDeque<Bytes>,
    total_bytes: usize,
}

/// Recent session output, oldest chunks evicted first.
///
/// New push-channel clients receive this history before live output.
pub struct OutputHistory {
    inner: RwLock<Inner>,
    limit: usize,
}

impl Default for OutputHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_BYTES)
    }
}

impl OutputHistory {
    /// Create a history holding at most `limit` bytes.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                chunks: VecDeque::with_capacity(32),
                total_bytes: 0,
            }),
            limit,
        }
    }

    /// Append a chunk, evicting the oldest ones past the limit.
    pub fn push(&self, chunk: Bytes) {
        if chunk.is_empty() || self.limit == 0 {
            return;
        }
        // A single oversized chunk keeps only its tail.
        let chunk = if chunk.len() > self.limit {
            chunk.slice(chunk.len() - self.limit..)
        } else {
            chunk
        };
        let bytes = chunk.len();

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        while inner.total_bytes.saturating_add(bytes) > self.limit {
            if let Some(front) = inner.chunks.pop_front() {
                inner.total_bytes = inner.total_bytes.saturating_sub(front.len());
            } else {
                break;
            }
        }
        inner.chunks.push_back(chunk);
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
    }

    /// Bytes currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .total_bytes
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The whole history as one contiguous chunk.
    #[must_use]
    pub fn snapshot(&self) -> Bytes {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut out = BytesMut::with_capacity(inner.total_bytes);
        for chunk in &inner.chunks {
            out.extend_from_slice(chunk);
        }
        out.freeze()
    }

    /// History decoded as text and split into lines.
    ///
    /// Returns the last `lines` lines, or all of them when `None`.
    #[must_use]
    pub fn tail_lines(&self, lines: Option<usize>) -> Vec<String> {
        let snapshot = self.snapshot();
        let text = String::from_utf8_lossy(&snapshot);
        let all: Vec<String> = text.lines().map(str::to_string).collect();
        match lines {
            Some(n) if n < all.len() => all[all.len() - n..].to_vec(),
            _ => all,
        }
    }

    /// Drop everything.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.chunks.clear();
        inner.total_bytes = 0;
    }
}
