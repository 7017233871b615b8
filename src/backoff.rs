use rand::Rng;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Jittered backoff strategy for connection and query retries.
///
/// `Custom` receives `(previous_delay_ms, attempt)` and its return value
/// is used as-is, unvalidated.
#[derive(Clone)]
pub enum Backoff {
    Full,
    Decorrelated,
    Custom(Arc<dyn Fn(u64, u32) -> u64 + Send + Sync>),
}

impl Backoff {
    /// Map a configuration tag to a strategy. Unknown tags fall back to
    /// full jitter instead of failing, so a typo in user configuration
    /// degrades rather than crashes.
    pub fn from_tag(tag: &str) -> Self {
        match tag.to_ascii_lowercase().as_str() {
            "full" => Backoff::Full,
            "decorrelated" => Backoff::Decorrelated,
            _ => Backoff::Full,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backoff::Full => "full",
            Backoff::Decorrelated => "decorrelated",
            Backoff::Custom(_) => "custom",
        }
    }

    /// Compute the next delay in milliseconds.
    ///
    /// `attempt` is the current retry number (1-based), `prev` the delay
    /// slept before this attempt (0 on the first).
    pub fn delay(&self, base: u64, cap: u64, attempt: u32, prev: u64) -> u64 {
        match self {
            Backoff::Full => {
                let ceiling = cap.min(base.saturating_mul(2u64.saturating_pow(attempt)));
                rand_range(0, ceiling)
            }
            Backoff::Decorrelated => {
                cap.min(rand_range(base, base.max(prev.saturating_mul(3))))
            }
            Backoff::Custom(f) => f(prev, attempt),
        }
    }
}

impl Debug for Backoff {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Uniform random integer in `[min, max]`.
fn rand_range(min: u64, max: u64) -> u64 {
    if max <= min {
        return min;
    }
    rand::rng().random_range(min..=max)
}
