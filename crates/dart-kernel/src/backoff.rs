//! Exponential backoff with jitter for fallible async operations
//!
//! After failed attempt `n` the policy waits `base_delay * 2^(n-1)` scaled by a uniform
//! factor in `[1 - jitter, 1 + jitter]`. Cancellation interrupts both the in-flight
//! attempt and the wait.
//!
//! The policy never touches the audit trail. Callers attach the returned
//! [`AttemptHistory`] wherever they need it.

use std::future::Future;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Retry policy
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    max_attempts: u32,
    base_delay: Duration,
    jitter_fraction: f64,
    seed: Option<u64>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), 0.25)
    }
}

impl BackoffPolicy {
    /// Build a policy. `max_attempts` is at least one and jitter is clamped to `[0, 1]`.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, jitter_fraction: f64) -> Self {
        let jitter_fraction = if jitter_fraction.is_finite() {
            jitter_fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            jitter_fraction,
            seed: None,
        }
    }

    /// Make jitter deterministic
    #[inline]
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Maximum number of attempts
    #[inline]
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the second attempt, before jitter
    #[inline]
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Jitter fraction in `[0, 1]`
    #[inline]
    #[must_use]
    pub fn jitter_fraction(&self) -> f64 {
        self.jitter_fraction
    }

    /// Un-jittered delay after failed attempt `attempt` (1-based)
    #[must_use]
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }

    /// Upper bound for any single wait: `base * 2^(max-1) * (1 + jitter)`
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        scale(
            self.nominal_delay(self.max_attempts),
            1.0 + self.jitter_fraction,
        )
    }

    /// Every wait the policy would perform if all attempts failed
    #[must_use]
    pub fn preview_delays(&self) -> Vec<Duration> {
        let mut rng = self.rng();
        (1..self.max_attempts)
            .map(|attempt| self.jittered(attempt, &mut rng))
            .collect()
    }

    /// Run `op` until it succeeds, the attempts run out, or `cancel` fires.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn execute<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<Retried<T>, BackoffError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut rng = self.rng();
        let mut history = AttemptHistory::default();
        let mut attempt = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(BackoffError::Cancelled { history });
            }

            let started = Instant::now();
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::debug!(attempt, "attempt interrupted by cancellation");
                    return Err(BackoffError::Cancelled { history });
                }
                result = op(attempt) => result,
            };
            let elapsed = started.elapsed();

            match result {
                Ok(value) => {
                    tracing::debug!(attempt, elapsed_ms = elapsed.as_millis() as u64, "attempt succeeded");
                    history.records.push(AttemptRecord {
                        attempt,
                        elapsed,
                        outcome: AttemptOutcome::Succeeded,
                        delay: None,
                    });
                    return Ok(Retried { value, history });
                }
                Err(err) if attempt >= self.max_attempts => {
                    tracing::warn!(attempt, error = %err, "attempts exhausted");
                    history.records.push(AttemptRecord {
                        attempt,
                        elapsed,
                        outcome: AttemptOutcome::Failed(err.to_string()),
                        delay: None,
                    });
                    return Err(BackoffError::Exhausted {
                        attempts: attempt,
                        last_error: err,
                        history,
                    });
                }
                Err(err) => {
                    let delay = self.jittered(attempt, &mut rng);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed; backing off"
                    );
                    history.records.push(AttemptRecord {
                        attempt,
                        elapsed,
                        outcome: AttemptOutcome::Failed(err.to_string()),
                        delay: Some(delay),
                    });

                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => {
                            tracing::debug!(attempt, "backoff wait interrupted by cancellation");
                            return Err(BackoffError::Cancelled { history });
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        }
    }

    fn jittered(&self, attempt: u32, rng: &mut StdRng) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter_fraction == 0.0 {
            return nominal;
        }
        let j = self.jitter_fraction;
        scale(nominal, 1.0 + rng.random_range(-j..=j))
    }
}

fn scale(duration: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(duration.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

/// Successful result plus the attempts it took
#[derive(Debug, Clone)]
pub struct Retried<T> {
    /// Value of the successful attempt
    pub value: T,
    /// Every attempt, including the successful one
    pub history: AttemptHistory,
}

/// Ordered record of every attempt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttemptHistory {
    /// One record per attempt, in order
    pub records: Vec<AttemptRecord>,
}

impl AttemptHistory {
    /// Number of attempts made
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no attempt was made
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sum of every backoff wait
    #[must_use]
    pub fn total_delay(&self) -> Duration {
        self.records.iter().filter_map(|r| r.delay).sum()
    }

    /// Waits in the order they were taken
    #[must_use]
    pub fn delays(&self) -> Vec<Duration> {
        self.records.iter().filter_map(|r| r.delay).collect()
    }
}

/// One attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number
    pub attempt: u32,
    /// Time spent inside the operation
    pub elapsed: Duration,
    /// What happened
    pub outcome: AttemptOutcome,
    /// Wait taken after this attempt, if any
    pub delay: Option<Duration>,
}

/// Attempt outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed(String),
}

/// Backoff failure
#[derive(Debug, thiserror::Error)]
pub enum BackoffError<E> {
    /// Every attempt failed
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted {
        attempts: u32,
        last_error: E,
        history: AttemptHistory,
    },

    /// Cancellation token fired
    #[error("cancelled after {} attempts", .history.len())]
    Cancelled { history: AttemptHistory },
}

impl<E> BackoffError<E> {
    /// Attempt history up to the failure
    #[must_use]
    pub fn history(&self) -> &AttemptHistory {
        match self {
            BackoffError::Exhausted { history, .. } | BackoffError::Cancelled { history } => {
                history
            }
        }
    }

    /// Whether the failure came from cancellation
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BackoffError::Cancelled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nominal_delay_doubles() {
        let policy = BackoffPolicy::new(4, Duration::from_millis(100), 0.0);
        assert_eq!(policy.nominal_delay(1), Duration::from_millis(100));
        assert_eq!(policy.nominal_delay(2), Duration::from_millis(200));
        assert_eq!(policy.nominal_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn constructor_clamps_inputs() {
        let policy = BackoffPolicy::new(0, Duration::from_millis(10), 4.0);
        assert_eq!(policy.max_attempts(), 1);
        assert!((policy.jitter_fraction() - 1.0).abs() < f64::EPSILON);

        let policy = BackoffPolicy::new(2, Duration::from_millis(10), f64::NAN);
        assert!(policy.jitter_fraction().abs() < f64::EPSILON);
    }

    #[test]
    fn seeded_preview_is_deterministic() {
        let policy = BackoffPolicy::new(5, Duration::from_millis(50), 0.5).with_seed(7);
        assert_eq!(policy.preview_delays(), policy.preview_delays());
        assert_eq!(policy.preview_delays().len(), 4);
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        let policy = BackoffPolicy::new(200, Duration::from_secs(1), 0.25);
        assert!(policy.nominal_delay(100) >= policy.nominal_delay(40));
        let _ = policy.max_delay();
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_short_circuits() {
        let policy = BackoffPolicy::new(3, Duration::from_secs(1), 0.0);
        let cancel = CancellationToken::new();
        let out = policy
            .execute(&cancel, |attempt| async move {
                if attempt < 2 { Err("flaky") } else { Ok(attempt) }
            })
            .await
            .expect("second attempt succeeds");
        assert_eq!(out.value, 2);
        assert_eq!(out.history.len(), 2);
        assert_eq!(out.history.total_delay(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_keeps_last_error() {
        let policy = BackoffPolicy::new(3, Duration::from_millis(10), 0.0);
        let cancel = CancellationToken::new();
        let err = policy
            .execute(&cancel, |attempt| async move { Err::<(), _>(format!("fail {attempt}")) })
            .await
            .unwrap_err();
        match err {
            BackoffError::Exhausted { attempts, last_error, history } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "fail 3");
                assert_eq!(history.delays(), vec![Duration::from_millis(10), Duration::from_millis(20)]);
            }
            BackoffError::Cancelled { .. } => panic!("unexpected cancellation"),
        }
    }

    #[tokio::test]
    async fn pre_cancelled_token_never_runs() {
        let policy = BackoffPolicy::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = policy
            .execute(&cancel, |_| async { Ok::<_, String>(()) })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(err.history().is_empty());
    }
}
