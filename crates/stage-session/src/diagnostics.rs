use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const TRACEBACK_MARKER: &str = "Traceback";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub message: String,
    pub reported_at: DateTime<Utc>,
}

impl ErrorReport {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            reported_at: Utc::now(),
        }
    }
}

/// Batches the program's stderr into one report per traceback.
///
/// Output before a traceback starts is ignored. Once capturing, every chunk is
/// kept until `flush_after` has passed since the first one; then the batch is
/// closed and capture re-arms.
#[derive(Debug)]
pub struct ErrorCollector {
    flush_after: Duration,
    buffer: String,
    started_at: Option<Instant>,
    ready: VecDeque<ErrorReport>,
}

impl ErrorCollector {
    pub fn new(flush_after: Duration) -> Self {
        Self {
            flush_after,
            buffer: String::new(),
            started_at: None,
            ready: VecDeque::new(),
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.started_at.is_some()
    }

    /// Returns whether the chunk was captured. A chunk arriving after the
    /// window closes the current batch first and is judged on its own.
    pub fn push(&mut self, chunk: &str, now: Instant) -> bool {
        self.close_expired(now);
        if self.started_at.is_none() {
            if !chunk.starts_with(TRACEBACK_MARKER) {
                return false;
            }
            self.started_at = Some(now);
        }
        self.buffer.push_str(chunk);
        self.buffer.push('\n');
        true
    }

    pub fn take_ready(&mut self, now: Instant) -> Option<ErrorReport> {
        self.close_expired(now);
        self.ready.pop_front()
    }

    fn close_expired(&mut self, now: Instant) {
        let Some(started) = self.started_at else {
            return;
        };
        if now.saturating_duration_since(started) < self.flush_after {
            return;
        }
        self.started_at = None;
        self.ready
            .push_back(ErrorReport::new(std::mem::take(&mut self.buffer)));
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.started_at = None;
        self.ready.clear();
    }
}
