// Exponential retry delays for read failures and empty-progress retries.
use rand::Rng;
use std::time::Duration;

/// Doubling backoff bounded by `max`, with up to 10% jitter shaved off larger delays.
///
/// Not thread-safe on its own; the dispatcher keeps one per purpose inside its
/// locked state.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Returns the delay to wait now and doubles the following one.
    pub fn next(&mut self) -> Duration {
        let mut current = self.next;
        if current < self.max {
            self.next = (self.next * 2).min(self.max);
        }
        // Spread retries of many subscriptions failing together.
        let current_ms = current.as_millis() as u64;
        if current_ms > 10 {
            let jitter = rand::thread_rng().gen_range(0..current_ms / 10);
            current -= Duration::from_millis(jitter);
        }
        current.max(self.initial)
    }

    /// Halves the next delay after a success, never below the initial delay.
    pub fn reduce_to_half(&mut self) {
        if self.next > self.initial {
            self.next = (self.next / 2).max(self.initial);
        }
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay the next call to [`Backoff::next`] starts from, before jitter.
    pub fn peek(&self) -> Duration {
        self.next
    }
}
