//! Attempt classification and backoff policy.
//!
//! Failures are classified into an explicit outcome instead of driving
//! control flow through error types: deadlocks and serialization failures
//! restart the whole attempt, everything else aborts it.

use std::time::Duration;

use rand::Rng;

use stockpile_infra::StorageError;

/// Classified result of one allocation/release attempt.
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    /// The transaction committed.
    Success(T),
    /// Deadlock or serialization failure; a fresh attempt may succeed.
    Retryable(StorageError),
    /// Anything else; propagate to the caller unchanged.
    Fatal(StorageError),
}

impl<T> AttemptOutcome<T> {
    pub fn classify(result: Result<T, StorageError>) -> Self {
        match result {
            Ok(value) => AttemptOutcome::Success(value),
            Err(err) if err.is_retryable() => AttemptOutcome::Retryable(err),
            Err(err) => AttemptOutcome::Fatal(err),
        }
    }
}

/// Exponential backoff with jitter for attempt-level conflicts.
///
/// `sleep = base_delay * 2^attempt + uniform(0, jitter_max)`. The jitter
/// spreads workers that collided once so they do not collide again in
/// lockstep.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempt bound, first execution included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            jitter_max: Duration::from_millis(30),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Whether a failure on attempt `attempt` (1-indexed) leaves budget
    /// for another try.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Backoff before re-running after `attempt` failures.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = 2u32.saturating_pow(attempt.min(16));
        let backoff = self.base_delay.saturating_mul(exp);

        let jitter_ms = self.jitter_max.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };

        backoff + jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retryable() -> StorageError {
        StorageError::RetryableConflict {
            code: "40001".to_string(),
            message: "serialization failure".to_string(),
        }
    }

    #[test]
    fn classification_matches_error_kind() {
        assert!(matches!(
            AttemptOutcome::classify(Ok(42)),
            AttemptOutcome::Success(42)
        ));
        assert!(matches!(
            AttemptOutcome::<()>::classify(Err(retryable())),
            AttemptOutcome::Retryable(_)
        ));
        assert!(matches!(
            AttemptOutcome::<()>::classify(Err(StorageError::backend("commit", "io error"))),
            AttemptOutcome::Fatal(_)
        ));
    }

    #[test]
    fn overlap_and_duplicate_are_not_retryable() {
        // These are absorbed below the retry loop; if one ever reaches it,
        // it must abort rather than spin.
        assert!(!StorageError::OverlapConflict("claim".into()).is_retryable());
        assert!(!StorageError::DuplicateOperation("op".into()).is_retryable());
    }

    #[test]
    fn delay_grows_exponentially_within_jitter_bounds() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            jitter_max: Duration::from_millis(30),
        };

        for attempt in 1..=4u32 {
            let floor = Duration::from_millis(50 * 2u64.pow(attempt));
            let ceiling = floor + Duration::from_millis(30);
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay >= floor, "attempt {attempt}: {delay:?} < {floor:?}");
            assert!(delay <= ceiling, "attempt {attempt}: {delay:?} > {ceiling:?}");
        }
    }

    #[test]
    fn attempt_budget_is_respected() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));

        assert!(!RetryPolicy::no_retry().should_retry(1));
    }
}
