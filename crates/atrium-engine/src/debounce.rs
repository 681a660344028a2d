//! Batches streamed text so the live channel is not flooded with one event per token.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct ChunkDebouncer {
    interval: Duration,
    buffer: String,
    last_flush: Instant,
}

impl ChunkDebouncer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            buffer: String::new(),
            last_flush: Instant::now(),
        }
    }

    /// Buffer `delta`. Returns the batch once `interval` has passed since the last flush.
    pub fn push(&mut self, delta: &str) -> Option<String> {
        self.buffer.push_str(delta);
        if self.interval.is_zero() || self.last_flush.elapsed() >= self.interval {
            self.flush()
        } else {
            None
        }
    }

    /// Whatever is buffered, if anything.
    pub fn flush(&mut self) -> Option<String> {
        self.last_flush = Instant::now();
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}
