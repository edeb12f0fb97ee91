//! Retry policy: exponential backoff and permanent-failure classification.

use std::time::Duration;

/// SMTP reply codes that mean retrying will not help.
pub const PERMANENT_SMTP_CODES: [&str; 5] = ["550", "551", "552", "553", "554"];

/// Default first backoff step.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(5 * 60);
/// Default backoff ceiling.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(4 * 60 * 60);

/// Exponential backoff with a ceiling.
///
/// `backoff(n) = min(base * 2^(n - 1), cap)`. Attempt 0 is treated as 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            cap: DEFAULT_BACKOFF_CAP,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before the given attempt may be retried.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Whether an error message carries a permanent SMTP reply code.
///
/// Only the literal substrings 550..=554 count.
#[must_use]
pub fn is_permanent_text(message: &str) -> bool {
    PERMANENT_SMTP_CODES
        .iter()
        .any(|code| message.contains(code))
}
