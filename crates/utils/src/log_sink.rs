use std::{collections::VecDeque, sync::RwLock};

/// Bounded ring buffer of a child process's combined stdout/stderr, line by line.
///
/// Single writer (the process supervisor's output reader), many readers (the
/// log-tail API). Reads never block writes: the inner lock is only ever held
/// long enough to push or clone out a snapshot.
pub struct LogSink {
    lines: RwLock<VecDeque<String>>,
    capacity: usize,
}

impl LogSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    /// Append one line, evicting the oldest line if at capacity.
    pub fn push_line(&self, line: impl Into<String>) {
        let mut buf = self.lines.write().unwrap();
        if buf.len() >= self.capacity {
            buf.pop_front();
        }
        buf.push_back(line.into());
    }

    /// Return the last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let buf = self.lines.read().unwrap();
        let skip = buf.len().saturating_sub(n);
        buf.iter().skip(skip).cloned().collect()
    }

    /// Return every buffered line, oldest first.
    pub fn all(&self) -> Vec<String> {
        self.lines.read().unwrap().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new(1000)
    }
}
