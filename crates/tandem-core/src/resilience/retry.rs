use crate::config::RetryConfig;
use crate::error::{EngineError, EngineErrorKind};
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            jitter: Duration::from_millis(cfg.jitter_ms),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// `min(max_delay, base_delay * 2^(attempt-1))`, without jitter.
    /// `attempt` is 1-based: the wait after the first failure is `backoff(1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Backoff plus a uniform random jitter in `[0, jitter]`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.backoff(attempt) + Duration::from_millis(extra)
    }

    /// Upper bound on the total time spent waiting between attempts.
    pub fn worst_case(&self) -> Duration {
        (1..self.max_attempts)
            .map(|n| self.backoff(n) + self.jitter)
            .sum()
    }
}

/// Network and timeout failures are worth retrying. Everything else
/// (auth, corruption, conflicts, missing refs) is fatal.
pub fn is_retryable(err: &EngineError) -> bool {
    matches!(err.kind, EngineErrorKind::Network | EngineErrorKind::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let p = policy();
        let secs: Vec<u64> = (1..=7).map(|n| p.backoff(n).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(p.backoff(200), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_in_range() {
        let p = policy();
        for _ in 0..100 {
            let d = p.delay_for_attempt(3);
            assert!(d >= Duration::from_secs(4));
            assert!(d <= Duration::from_millis(4_250));
        }
        assert_eq!(RetryPolicy::no_retry().delay_for_attempt(1), Duration::ZERO);
    }

    #[test]
    fn worst_case_sums_waits_between_attempts() {
        // 1 + 2 + 4 + 8 seconds plus 4 * 250ms of jitter
        assert_eq!(policy().worst_case(), Duration::from_millis(16_000));
    }

    #[test]
    fn classification() {
        assert!(is_retryable(&EngineError::network("reset")));
        assert!(is_retryable(&EngineError::timeout("slow")));
        assert!(!is_retryable(&EngineError::auth("denied")));
        assert!(!is_retryable(&EngineError::new(EngineErrorKind::Corrupt, "bad")));
    }

    #[test]
    fn from_config_clamps_attempts() {
        let cfg = RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        };
        assert_eq!(RetryPolicy::from(&cfg).max_attempts, 1);
    }
}
