// =============================================================================
// Retry policy — classify broker failures and schedule backoff
// =============================================================================
//
// Classification is by message substring because the live SDK surfaces
// everything as text. Risk refusals are never retried — a margin rejection
// will not fix itself by resubmitting.
// =============================================================================

use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorBucket {
    /// Timeouts and connectivity blips — short exponential backoff.
    Transient,
    /// Rate limiting — linear backoff, a little more patient.
    Throttle,
    /// Margin / RMS refusal — surfaced immediately, never retried.
    Risk,
    /// Everything else — one attempt, then surface.
    Fatal,
}

impl ErrorBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Throttle => "throttle",
            Self::Risk => "risk",
            Self::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for ErrorBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
pub struct RetryPolicy;

impl RetryPolicy {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, message: &str) -> ErrorBucket {
        let msg = message.to_lowercase();
        if ["timeout", "temporarily", "connection", "network"]
            .iter()
            .any(|k| msg.contains(k))
        {
            return ErrorBucket::Transient;
        }
        if msg.contains("rate") && msg.contains("limit") {
            return ErrorBucket::Throttle;
        }
        if ["margin", "rms", "insufficient"].iter().any(|k| msg.contains(k)) {
            return ErrorBucket::Risk;
        }
        ErrorBucket::Fatal
    }

    pub fn max_attempts(&self, bucket: ErrorBucket) -> u32 {
        match bucket {
            ErrorBucket::Transient => 3,
            ErrorBucket::Throttle => 4,
            ErrorBucket::Risk => 1,
            ErrorBucket::Fatal => 1,
        }
    }

    /// Backoff before retry number `attempt` (0-based: the sleep after the
    /// first failure is `sleep(bucket, 0)`).
    pub fn backoff(&self, bucket: ErrorBucket, attempt: u32) -> Duration {
        let seconds = match bucket {
            ErrorBucket::Throttle => (0.4 * (attempt + 1) as f64).min(1.5),
            ErrorBucket::Transient => (0.2 * 2f64.powi(attempt as i32)).min(1.0),
            _ => 0.0,
        };
        Duration::from_secs_f64(seconds)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_by_substring() {
        let policy = RetryPolicy::new();
        assert_eq!(policy.classify("Connection reset by peer"), ErrorBucket::Transient);
        assert_eq!(policy.classify("request timeout after 5s"), ErrorBucket::Transient);
        assert_eq!(policy.classify("network unreachable"), ErrorBucket::Transient);
        assert_eq!(policy.classify("Rate limit exceeded"), ErrorBucket::Throttle);
        assert_eq!(policy.classify("Insufficient margin for order"), ErrorBucket::Risk);
        assert_eq!(policy.classify("RMS: position limit breached"), ErrorBucket::Risk);
        assert_eq!(policy.classify("order id not found"), ErrorBucket::Fatal);
    }

    #[test]
    fn attempt_budgets() {
        let policy = RetryPolicy::new();
        assert_eq!(policy.max_attempts(ErrorBucket::Transient), 3);
        assert_eq!(policy.max_attempts(ErrorBucket::Throttle), 4);
        assert_eq!(policy.max_attempts(ErrorBucket::Risk), 1);
        assert_eq!(policy.max_attempts(ErrorBucket::Fatal), 1);
    }

    #[test]
    fn transient_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new();
        assert_eq!(policy.backoff(ErrorBucket::Transient, 0), Duration::from_millis(200));
        assert_eq!(policy.backoff(ErrorBucket::Transient, 1), Duration::from_millis(400));
        assert_eq!(policy.backoff(ErrorBucket::Transient, 2), Duration::from_millis(800));
        assert_eq!(policy.backoff(ErrorBucket::Transient, 5), Duration::from_secs(1));
    }

    #[test]
    fn throttle_backoff_is_linear_and_caps() {
        let policy = RetryPolicy::new();
        assert_eq!(policy.backoff(ErrorBucket::Throttle, 0), Duration::from_millis(400));
        assert_eq!(policy.backoff(ErrorBucket::Throttle, 1), Duration::from_millis(800));
        assert_eq!(policy.backoff(ErrorBucket::Throttle, 9), Duration::from_millis(1500));
    }

    #[test]
    fn risk_and_fatal_never_sleep() {
        let policy = RetryPolicy::new();
        assert_eq!(policy.backoff(ErrorBucket::Risk, 0), Duration::ZERO);
        assert_eq!(policy.backoff(ErrorBucket::Fatal, 0), Duration::ZERO);
    }
}
