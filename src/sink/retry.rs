use crate::canonical::CanonicalLog;
use std::collections::VecDeque;
use std::time::Duration;

/// Exponential backoff schedule for transient sink failures: 1s initial
/// delay doubling to a 60s cap, at most 5 retry attempts. `next_delay`
/// returns `None` once the attempts are exhausted, at which point the
/// batch is parked.
#[derive(Debug)]
pub struct Backoff {
    next: Duration,
    cap: Duration,
    remaining: u32,
}

impl Backoff {
    pub fn new(initial: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            next: initial,
            cap,
            remaining: max_attempts,
        }
    }

    pub fn standard() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 5)
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let delay = self.next;
        self.next = (self.next * 2).min(self.cap);
        Some(delay)
    }
}

/// Source-local buffer of batches that exhausted their retries. Bounded;
/// beyond the cap the oldest batch is discarded and reported so the
/// caller can count it.
#[derive(Debug)]
pub struct RetryBuffer {
    batches: VecDeque<Vec<CanonicalLog>>,
    cap: usize,
}

pub const DEFAULT_RETRY_BUFFER_CAP: usize = 1_000;

impl RetryBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            batches: VecDeque::new(),
            cap,
        }
    }

    /// Park a batch at the back. Returns the discarded oldest batch when
    /// the buffer was full.
    pub fn park(&mut self, batch: Vec<CanonicalLog>) -> Option<Vec<CanonicalLog>> {
        let discarded = if self.batches.len() >= self.cap {
            self.batches.pop_front()
        } else {
            None
        };
        self.batches.push_back(batch);
        discarded
    }

    /// Put a batch back at the front, ahead of younger parked batches.
    pub fn requeue_front(&mut self, batch: Vec<CanonicalLog>) {
        self.batches.push_front(batch);
        while self.batches.len() > self.cap {
            self.batches.pop_back();
        }
    }

    pub fn pop(&mut self) -> Option<Vec<CanonicalLog>> {
        self.batches.pop_front()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}
