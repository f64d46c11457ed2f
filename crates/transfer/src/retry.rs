//! Classification of chunk and commit failures into retryable and fatal.
//!
//! Rules, in order:
//! 1. Errors that did not come from the network transport are fatal.
//! 2. A "forbidden" transport error on a signed-access URL is retried with
//!    a fixed delay, up to a fixed number of times: the URL's access policy
//!    may not be active server-side yet.
//! 3. Any other transport error is handed to the injected [`RetryPolicy`].
//!    The default policy, [`NoRetry`], makes it fatal.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use mediablob_protocol::BlobHandle;
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::TransferError;
use crate::blob::{BlobClient, BlobError};
use crate::config::TransferConfig;

/// Injected strategy deciding whether a transport error is retried.
pub trait RetryPolicy: Send + Sync {
    /// Returns the delay before the next attempt, or `None` to give up.
    ///
    /// `attempt` counts consecutive transport failures of one operation,
    /// starting at 1.
    fn retry_after(&self, attempt: u32, error: &BlobError) -> Option<Duration>;
}

/// Never retries: transport errors are fatal.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn retry_after(&self, _attempt: u32, _error: &BlobError) -> Option<Duration> {
        None
    }
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct ExponentialRetry {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
    /// Failures tolerated before giving up.
    pub max_attempts: u32,
}

impl Default for ExponentialRetry {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(15),
            backoff_factor: 2.0,
            max_attempts: 5,
        }
    }
}

impl ExponentialRetry {
    /// Calculates the delay for a given attempt number (1-based),
    /// with ±25% jitter to avoid thundering herd.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let jitter = capped * 0.25 * rand::thread_rng().gen_range(-1.0..1.0);
        Duration::from_secs_f64((capped + jitter).max(0.0))
    }
}

impl RetryPolicy for ExponentialRetry {
    fn retry_after(&self, attempt: u32, _error: &BlobError) -> Option<Duration> {
        (attempt <= self.max_attempts).then(|| self.delay_for_attempt(attempt))
    }
}

/// Outcome of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Success,
    /// Resubmit the same operation after the delay.
    Retryable(Duration),
    Fatal,
}

/// Failure counters for one logical operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Every failed attempt, whatever its classification.
    pub failures: u32,
    pub forbidden_failures: u32,
    pub transport_failures: u32,
}

impl RetryState {
    /// Attempts made so far that failed.
    pub fn attempts(&self) -> u32 {
        self.failures
    }
}

/// Classifies failures of one transfer.
#[derive(Clone)]
pub struct FaultClassifier {
    policy: Arc<dyn RetryPolicy>,
    signed_access: bool,
    forbidden_max: u32,
    forbidden_delay: Duration,
}

impl FaultClassifier {
    pub fn new(
        policy: Arc<dyn RetryPolicy>,
        signed_access: bool,
        forbidden_max: u32,
        forbidden_delay: Duration,
    ) -> Self {
        Self {
            policy,
            signed_access,
            forbidden_max,
            forbidden_delay,
        }
    }

    /// Classifier for transfers of `blob` under `config`.
    pub fn for_blob(
        config: &TransferConfig,
        policy: Arc<dyn RetryPolicy>,
        blob: &BlobHandle,
    ) -> Self {
        Self::new(
            policy,
            blob.uses_signed_access(),
            config.forbidden_retry_attempts,
            config.forbidden_retry_delay(),
        )
    }

    /// Classifies an attempt's result, updating `state` on failure.
    pub fn classify<T>(
        &self,
        result: &Result<T, BlobError>,
        state: &mut RetryState,
    ) -> Classification {
        match result {
            Ok(_) => Classification::Success,
            Err(error) => self.classify_error(error, state),
        }
    }

    pub fn classify_error(&self, error: &BlobError, state: &mut RetryState) -> Classification {
        state.failures += 1;
        if !error.is_transport() {
            return Classification::Fatal;
        }
        if self.signed_access && error.is_forbidden() {
            state.forbidden_failures += 1;
            return if state.forbidden_failures <= self.forbidden_max {
                Classification::Retryable(self.forbidden_delay)
            } else {
                Classification::Fatal
            };
        }
        state.transport_failures += 1;
        match self.policy.retry_after(state.transport_failures, error) {
            Some(delay) => Classification::Retryable(delay),
            None => Classification::Fatal,
        }
    }

    /// Classifies a failure and converts a fatal outcome into an error.
    pub fn retry_delay(
        &self,
        error: BlobError,
        state: &mut RetryState,
    ) -> Result<Duration, TransferError> {
        match self.classify_error(&error, state) {
            Classification::Retryable(delay) => Ok(delay),
            Classification::Success | Classification::Fatal => {
                let attempts = state.attempts();
                if attempts > 1 {
                    Err(TransferError::RetriesExhausted {
                        attempts,
                        source: error,
                    })
                } else {
                    Err(TransferError::Blob(error))
                }
            }
        }
    }

    /// Handles one failed attempt of `what`: classifies it, logs the retry
    /// and waits out the delay.
    ///
    /// Returns `Ok(false)` if `cancel` fired while waiting, and the fatal
    /// error when the failure is not retried.
    pub(crate) async fn backoff(
        &self,
        what: &str,
        error: BlobError,
        state: &mut RetryState,
        cancel: &CancellationToken,
    ) -> Result<bool, TransferError> {
        let message = error.to_string();
        let delay = self.retry_delay(error, state)?;
        warn!(
            operation = what,
            attempt = state.attempts(),
            delay_ms = delay.as_millis() as u64,
            error = %message,
            "retrying"
        );
        Ok(sleep_or_cancel(delay, cancel).await)
    }
}

/// Runs `op` until it succeeds, fails fatally, or `cancel` fires.
///
/// Returns `Ok(None)` on cancellation.
pub(crate) async fn with_retry<T, F, Fut>(
    classifier: &FaultClassifier,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<Option<T>, TransferError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BlobError>>,
{
    let mut state = RetryState::default();
    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        match op().await {
            Ok(value) => return Ok(Some(value)),
            Err(error) => {
                if !classifier.backoff(what, error, &mut state, cancel).await? {
                    return Ok(None);
                }
            }
        }
    }
}

/// Sleeps for `delay`. Returns `false` if cancelled first.
pub(crate) async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Waits for a signed URL's access policy to become active.
///
/// Probes the blob's metadata while the service answers "forbidden", for
/// at most `budget`. Best effort: returns `true` once the service answers
/// with anything other than "forbidden" (a missing blob counts, since an
/// upload target does not exist yet), `false` if the budget runs out or
/// the probe fails otherwise. Non-signed blobs return `true` immediately.
pub async fn wait_for_policy_activation(
    client: &dyn BlobClient,
    blob: &BlobHandle,
    budget: Duration,
    interval: Duration,
) -> bool {
    if !blob.uses_signed_access() {
        return true;
    }

    let deadline = Instant::now() + budget;
    let mut probes = 0u32;
    loop {
        probes += 1;
        match client.get_properties(blob).await {
            Ok(_) | Err(BlobError::NotFound(_)) => {
                if probes > 1 {
                    info!(blob = %blob.uri, probes, "access policy active");
                }
                return true;
            }
            Err(e) if e.is_forbidden() => {
                if Instant::now() + interval > deadline {
                    warn!(blob = %blob.uri, probes, "access policy still inactive, giving up");
                    return false;
                }
                debug!(blob = %blob.uri, probes, "access policy not active yet");
                tokio::time::sleep(interval).await;
            }
            Err(e) => {
                debug!(blob = %blob.uri, error = %e, "policy probe failed");
                return false;
            }
        }
    }
}
