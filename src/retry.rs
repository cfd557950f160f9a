//! Retry logic with exponential backoff
//!
//! This module runs one logical operation under a [`RetryPolicy`]: a bounded
//! number of attempts, each with its own deadline, separated by exponential
//! backoff with optional full jitter. A caller-supplied
//! [`CancellationToken`] reaches every attempt and every backoff sleep.
//!
//! # Example
//!
//! ```no_run
//! use fanout_fetch::config::RetryPolicy;
//! use fanout_fetch::fault::Fault;
//! use fanout_fetch::retry::run_with_retry;
//!
//! # async fn example() -> Result<(), Fault> {
//! let policy = RetryPolicy::default();
//! let value = run_with_retry("https://example.com/a.json", "GET", &policy, None, |_attempt| async {
//!     Ok::<_, Fault>(42)
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryPolicy;
use crate::fault::{Fault, FaultKind};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Upper bound of a single backoff step
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Trait for failures that can be classified as retryable or not
pub trait IsRetryable {
    /// Returns true if another attempt of a `method` request may succeed
    fn is_retryable(&self, method: &str, policy: &RetryPolicy) -> bool;
}

impl IsRetryable for Fault {
    fn is_retryable(&self, method: &str, policy: &RetryPolicy) -> bool {
        match self.kind() {
            // Missing resources stay missing
            FaultKind::Status { status: 404, .. } => false,
            FaultKind::Status { status, .. } => policy.retryable_status_codes.contains(status),
            FaultKind::Network { .. }
            | FaultKind::Timeout { .. }
            | FaultKind::Cancelled { .. }
            | FaultKind::EmptyPayload { .. } => policy.retries_method(method),
            FaultKind::Decode { .. }
            | FaultKind::InvalidRequest { .. }
            | FaultKind::Storage { .. }
            | FaultKind::Aggregate { .. } => false,
        }
    }
}

/// Result of a single attempt
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    /// The attempt produced a value
    Success(T),
    /// The attempt failed but another one may succeed
    TransientFailure(Fault),
    /// The attempt failed and no further attempt will be made
    TerminalFailure(Fault),
}

/// Classify the result of one attempt of a `method` request
pub fn classify<T>(
    result: Result<T, Fault>,
    method: &str,
    policy: &RetryPolicy,
) -> AttemptOutcome<T> {
    match result {
        Ok(value) => AttemptOutcome::Success(value),
        Err(fault) if fault.is_retryable(method, policy) => AttemptOutcome::TransientFailure(fault),
        Err(fault) => AttemptOutcome::TerminalFailure(fault),
    }
}

/// Backoff ceiling after the 0-based `attempt` failed
///
/// `min(60s, floor(backoff_base * backoff_factor ^ attempt))`, in whole milliseconds.
pub fn backoff_ceiling(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base_ms = policy.backoff_base.as_millis() as f64;
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let ms = (base_ms * policy.backoff_factor.powi(exponent)).floor();
    let cap_ms = MAX_BACKOFF.as_millis() as f64;
    Duration::from_millis(ms.min(cap_ms) as u64)
}

/// Delay to sleep after the 0-based `attempt` failed
///
/// Equal to [`backoff_ceiling`] without jitter; a uniform draw in
/// `[0, backoff_ceiling]` with jitter.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let ceiling = backoff_ceiling(policy, attempt);
    if policy.jitter {
        full_jitter(ceiling)
    } else {
        ceiling
    }
}

fn full_jitter(ceiling: Duration) -> Duration {
    let ceiling_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
    let ms = rand::thread_rng().gen_range(0..=ceiling_ms);
    Duration::from_millis(ms)
}

/// Execute an async operation under `policy`
///
/// `operation` receives the 0-based attempt index. Each attempt runs inside
/// its own scope: a child of `cancel` that also fires when
/// `policy.per_attempt_timeout` elapses. Firing from either side drops the
/// attempt's future.
///
/// Stops on success, on a terminal failure, after the last attempt, or once
/// `cancel` has fired, and returns the last failure in the latter cases.
pub async fn run_with_retry<F, Fut, T>(
    target: &str,
    method: &str,
    policy: &RetryPolicy,
    cancel: Option<&CancellationToken>,
    mut operation: F,
) -> Result<T, Fault>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Fault>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let scope = match cancel {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };

        let result = tokio::select! {
            biased;
            _ = scope.cancelled() => Err(Fault::cancelled(target)),
            result = operation(attempt) => result,
            _ = tokio::time::sleep(policy.per_attempt_timeout) => {
                scope.cancel();
                Err(Fault::timeout(target, policy.per_attempt_timeout))
            }
        };

        let fault = match classify(result, method, policy) {
            AttemptOutcome::Success(value) => {
                if attempt > 0 {
                    tracing::info!(url = %target, attempts = attempt + 1, "Request succeeded after retry");
                }
                return Ok(value);
            }
            AttemptOutcome::TerminalFailure(fault) => {
                tracing::debug!(url = %target, error = %fault, "Request failed with non-retryable error");
                return Err(fault);
            }
            AttemptOutcome::TransientFailure(fault) => fault,
        };

        if attempt + 1 >= max_attempts {
            tracing::debug!(
                url = %target,
                error = %fault,
                attempts = attempt + 1,
                "Request failed after all retry attempts exhausted"
            );
            return Err(fault);
        }

        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(fault);
        }

        let delay = backoff_delay(policy, attempt);
        tracing::warn!(
            url = %target,
            error = %fault,
            attempt = attempt + 1,
            max_attempts = max_attempts,
            delay_ms = delay.as_millis(),
            "Request failed, retrying"
        );

        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!(url = %target, "Cancelled during backoff");
                        return Err(fault);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => tokio::time::sleep(delay).await,
        }

        attempt += 1;
    }
}
