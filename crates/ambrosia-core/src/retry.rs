//! Retry policy: how many attempts, how long to wait, which errors qualify

use std::time::Duration;

/// Delay curve between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every retry
    Fixed(Duration),
    /// `base * 2^(attempt-1)`, capped at `max`
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed(d) => d,
            Self::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Retry strategy for operations failing with `E`.
///
/// `max_retries: None` retries forever; `retryable` decides which errors are
/// worth another attempt at all.
pub struct RetryPolicy<E> {
    pub max_retries: Option<u32>,
    pub backoff: Backoff,
    pub retryable: fn(&E) -> bool,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for RetryPolicy<E> {}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

fn always<E>(_: &E) -> bool {
    true
}

impl<E> RetryPolicy<E> {
    /// Retry every error forever with a fixed delay
    pub fn forever(delay: Duration) -> Self {
        Self {
            max_retries: None,
            backoff: Backoff::Fixed(delay),
            retryable: always::<E>,
        }
    }

    /// Retry every error up to `max_retries` times
    pub fn bounded(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            max_retries: Some(max_retries),
            backoff,
            retryable: always::<E>,
        }
    }

    /// Replace the error classifier
    pub fn classify(self, retryable: fn(&E) -> bool) -> Self {
        Self { retryable, ..self }
    }

    /// Delay before retry number `attempt` (1-based) after `err`, or `None` to give up.
    pub fn next_delay(&self, attempt: u32, err: &E) -> Option<Duration> {
        if !(self.retryable)(err) {
            return None;
        }
        match self.max_retries {
            Some(max) if attempt > max => None,
            _ => Some(self.backoff.delay(attempt)),
        }
    }
}
