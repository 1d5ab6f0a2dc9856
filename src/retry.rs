//! Durable retries for activities.
//!
//! Each attempt is an ordinary scheduled activity and each backoff delay an
//! ordinary durable timer, so a retry loop replays exactly like any other
//! orchestration code.

use crate::futures::Either2;
use crate::{FailureDetail, OrchestrationContext, codec};
use std::sync::Arc;
use std::time::Duration;

/// Delay between attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Retry immediately.
    None,
    /// Same delay before every retry.
    Fixed { delay: Duration },
    /// `base * attempt`, capped at `max`.
    Linear { base: Duration, max: Duration },
    /// `base * multiplier^(attempt - 1)`, capped at `max`.
    Exponential {
        base: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffStrategy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Linear { base, max } => base.saturating_mul(attempt).min(*max),
            BackoffStrategy::Exponential { base, multiplier, max } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let factor = multiplier.powi(exponent);
                let millis = base.as_millis() as f64 * factor;
                if !millis.is_finite() || millis >= max.as_millis() as f64 {
                    *max
                } else {
                    Duration::from_millis(millis as u64)
                }
            }
        }
    }
}

/// What a retry predicate gets to look at.
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub last_failure: FailureDetail,
    /// Number of the attempt that just failed, starting at 1.
    pub attempt: u32,
}

pub type RetryHandler = Arc<dyn Fn(&RetryContext) -> bool + Send + Sync>;

/// Retry policy for [`OrchestrationContext::schedule_activity_with_retry`].
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    /// Per-attempt timeout. A timed out attempt is never retried.
    pub timeout: Option<Duration>,
    /// Optional predicate deciding whether a failure is worth another attempt.
    pub handler: Option<RetryHandler>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("timeout", &self.timeout)
            .field("handler", &self.handler.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::default(),
            timeout: None,
            handler: None,
        }
    }
}

impl RetryPolicy {
    /// # Panics
    ///
    /// Panics if `max_attempts` is zero.
    pub fn new(max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Retry only when `handler` returns true for the failed attempt.
    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&RetryContext) -> bool + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }

    /// Whether attempt number `attempt` failing with `failure` gets another try.
    pub fn should_retry(&self, failure: &FailureDetail, attempt: u32) -> bool {
        if attempt >= self.max_attempts || !failure.is_retryable() {
            return false;
        }
        match &self.handler {
            Some(handler) => handler(&RetryContext {
                last_failure: failure.clone(),
                attempt,
            }),
            None => true,
        }
    }
}

impl OrchestrationContext {
    /// Run an activity until it succeeds or the policy gives up; returns the
    /// last failure in the latter case.
    pub async fn schedule_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: RetryPolicy,
    ) -> Result<String, FailureDetail> {
        let name = name.into();
        let input = input.into();
        let mut attempt: u32 = 1;
        loop {
            let call = self.schedule_activity(name.clone(), input.clone());
            let result = match policy.timeout {
                Some(timeout) => match self.select2(call, self.schedule_timer(timeout)).await {
                    Either2::First(output) => output.into_activity_result(),
                    Either2::Second(_) => {
                        crate::durable_warn!(self, activity = %name, attempt, "activity attempt timed out");
                        return Err(FailureDetail::timeout(format!(
                            "activity '{name}' timeout after {}ms on attempt {attempt}",
                            timeout.as_millis()
                        )));
                    }
                },
                None => call.into_activity().await,
            };

            let failure = match result {
                Ok(output) => return Ok(output),
                Err(failure) => failure,
            };
            if !policy.should_retry(&failure, attempt) {
                return Err(failure);
            }

            let delay = policy.delay_for_attempt(attempt);
            crate::durable_debug!(
                self,
                activity = %name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "activity attempt failed, retrying"
            );
            if !delay.is_zero() {
                self.schedule_timer(delay).into_timer().await;
            }
            attempt += 1;
        }
    }

    /// Typed variant of [`schedule_activity_with_retry`](Self::schedule_activity_with_retry).
    pub async fn schedule_activity_with_retry_typed<In, Out>(
        &self,
        name: &str,
        input: &In,
        policy: RetryPolicy,
    ) -> Result<Out, FailureDetail>
    where
        In: serde::Serialize + Sync,
        Out: serde::de::DeserializeOwned,
    {
        let payload = codec::Json::encode(input)?;
        let raw = self.schedule_activity_with_retry(name, payload, policy).await?;
        codec::Json::decode(&raw)
    }
}
