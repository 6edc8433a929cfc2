//! Bounded tail of a capture process's stderr, with live fan-out

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

/// Capacity of the live subscriber channel
const SUBSCRIBER_BUFFER: usize = 256;

struct Inner {
    lines: VecDeque<String>,
    /// `None` once the process's stderr has closed
    tx: Option<broadcast::Sender<String>>,
}

/// Last N stderr lines of one session plus a broadcast of new lines
pub struct LogTail {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl LogTail {
    /// Create an empty tail keeping at most `capacity` lines
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "log capacity must be > 0");

        let (tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            inner: Mutex::new(Inner {
                lines: VecDeque::with_capacity(capacity),
                tx: Some(tx),
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a line, evicting the oldest when full
    pub fn push(&self, line: String) {
        let mut inner = self.lock();
        if inner.lines.len() == self.capacity {
            inner.lines.pop_front();
        }
        inner.lines.push_back(line.clone());
        if let Some(tx) = &inner.tx {
            // No subscribers is fine
            let _ = tx.send(line);
        }
    }

    /// Mark the stream finished; subscribers see `Closed` after the backlog
    pub fn close(&self) {
        self.lock().tx = None;
    }

    /// Whether [`close`](Self::close) has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().tx.is_none()
    }

    /// Copy of the retained lines, oldest first
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.lock().lines.iter().cloned().collect()
    }

    /// Last `n` retained lines joined with newlines
    #[must_use]
    pub fn last_lines(&self, n: usize) -> String {
        let inner = self.lock();
        let skip = inner.lines.len().saturating_sub(n);
        inner
            .lines
            .iter()
            .skip(skip)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Snapshot plus a receiver for lines pushed afterwards
    ///
    /// For a closed tail the receiver reports `Closed` immediately.
    #[must_use]
    pub fn subscribe(&self) -> (Vec<String>, broadcast::Receiver<String>) {
        let inner = self.lock();
        let rx = match &inner.tx {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        };
        (inner.lines.iter().cloned().collect(), rx)
    }
}

impl std::fmt::Debug for LogTail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogTail")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
