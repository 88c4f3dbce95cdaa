// Dispatch throttling: caps messages and bytes handed out per interval.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Caps how much a dispatcher may hand out per interval.
///
/// Quotas are charged after a send with what was actually dispatched, so a batch
/// may overdraw the bucket; the debt is paid back by later refills.
pub trait DispatchRateLimiter: Send + Sync + fmt::Debug {
    fn has_dispatch_permit(&self) -> bool;

    /// Messages still allowed in this interval, `None` when unlimited.
    fn available_messages(&self) -> Option<u64>;

    /// Bytes still allowed in this interval, `None` when unlimited.
    fn available_bytes(&self) -> Option<u64>;

    fn consume(&self, messages: u64, bytes: u64);

    fn is_enabled(&self) -> bool;

    fn close(&self);

    /// Applies the remaining budget to a planned read. `None` means no budget at all.
    fn cap(&self, messages: usize, bytes: u64) -> Option<(usize, u64)> {
        if !self.has_dispatch_permit() {
            return None;
        }
        let messages = match self.available_messages() {
            Some(available) => messages.min(usize::try_from(available).unwrap_or(usize::MAX)),
            None => messages,
        };
        let bytes = match self.available_bytes() {
            Some(available) => bytes.min(available),
            None => bytes,
        };
        Some((messages, bytes))
    }
}

// Quotas stay well below 2^53, where every integer is exact as f64.
fn to_tokens(count: u64) -> f64 {
    count as f64
}

// Whole tokens left; an overdrawn bucket has none.
fn whole_tokens(tokens: f64) -> u64 {
    if tokens < 1.0 {
        return 0;
    }
    // Saturates past u64::MAX.
    tokens.floor() as u64
}

#[derive(Debug)]
struct BucketState {
    message_tokens: f64,
    byte_tokens: f64,
    last_refill: Instant,
}

/// Token bucket refilled continuously at `quota / period`, holding at most one
/// period's worth of quota.
#[derive(Debug)]
pub struct TokenBucketRateLimiter {
    messages_per_period: Option<u64>,
    bytes_per_period: Option<u64>,
    period: Duration,
    state: Mutex<BucketState>,
    closed: AtomicBool,
}

impl TokenBucketRateLimiter {
    pub fn new(
        messages_per_period: Option<u64>,
        bytes_per_period: Option<u64>,
        period: Duration,
    ) -> Self {
        let period = period.max(Duration::from_millis(1));
        Self {
            messages_per_period,
            bytes_per_period,
            period,
            state: Mutex::new(BucketState {
                message_tokens: to_tokens(messages_per_period.unwrap_or(0)),
                byte_tokens: to_tokens(bytes_per_period.unwrap_or(0)),
                last_refill: Instant::now(),
            }),
            closed: AtomicBool::new(false),
        }
    }

    pub fn per_second(messages: Option<u64>, bytes: Option<u64>) -> Self {
        Self::new(messages, bytes, Duration::from_secs(1))
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        let fraction = elapsed / self.period.as_secs_f64();
        if let Some(quota) = self.messages_per_period {
            let quota = to_tokens(quota);
            state.message_tokens = (state.message_tokens + fraction * quota).min(quota);
        }
        if let Some(quota) = self.bytes_per_period {
            let quota = to_tokens(quota);
            state.byte_tokens = (state.byte_tokens + fraction * quota).min(quota);
        }
        state.last_refill = now;
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl DispatchRateLimiter for TokenBucketRateLimiter {
    fn has_dispatch_permit(&self) -> bool {
        if self.is_closed() || !self.is_enabled() {
            return true;
        }
        let mut state = self.state.lock();
        self.refill(&mut state);
        let messages_ok = self.messages_per_period.is_none() || state.message_tokens >= 1.0;
        let bytes_ok = self.bytes_per_period.is_none() || state.byte_tokens >= 1.0;
        messages_ok && bytes_ok
    }

    fn available_messages(&self) -> Option<u64> {
        self.messages_per_period?;
        if self.is_closed() {
            return None;
        }
        let mut state = self.state.lock();
        self.refill(&mut state);
        Some(whole_tokens(state.message_tokens))
    }

    fn available_bytes(&self) -> Option<u64> {
        self.bytes_per_period?;
        if self.is_closed() {
            return None;
        }
        let mut state = self.state.lock();
        self.refill(&mut state);
        Some(whole_tokens(state.byte_tokens))
    }

    fn consume(&self, messages: u64, bytes: u64) {
        if self.is_closed() {
            return;
        }
        let mut state = self.state.lock();
        self.refill(&mut state);
        if self.messages_per_period.is_some() {
            state.message_tokens -= to_tokens(messages);
        }
        if self.bytes_per_period.is_some() {
            state.byte_tokens -= to_tokens(bytes);
        }
    }

    fn is_enabled(&self) -> bool {
        self.messages_per_period.is_some() || self.bytes_per_period.is_some()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
