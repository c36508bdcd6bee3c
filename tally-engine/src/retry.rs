//! Store call retry logic
//!
//! Exponential backoff for transient store failures (network errors,
//! throttling, 5xx). Non-transient errors are returned on the first attempt.
//! Creates only retry throttling, see [`retry_rejected`].

use crate::store::StoreError;
use std::time::{Duration, Instant};

const INITIAL_BACKOFF_MS: u64 = 10;
const MAX_BACKOFF_MS: u64 = 1000;

/// Retry a store operation with exponential backoff until `max_wait_ms` elapses.
///
/// **Algorithm:**
/// 1. Attempt operation
/// 2. If successful, return result
/// 3. If the error is transient:
///    a. If time elapsed < max_wait_ms: log WARN, backoff, retry
///    b. Otherwise: log ERROR, return the last error
/// 4. Any other error is returned immediately
///
/// **Backoff:** 10ms initial, doubling, capped at 1000ms per sleep.
///
/// Only for idempotent operations. A transient failure may arrive after the
/// store already applied the request.
pub async fn retry_transient<F, Fut, T>(operation_name: &str, max_wait_ms: u64, operation: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    retry_when(operation_name, max_wait_ms, StoreError::is_transient, operation).await
}

/// Retry only failures the store rejected before doing anything (throttling)
///
/// Used for non-idempotent creates: a timeout or 5xx leaves it unknown
/// whether the item exists, so those are returned to the caller.
pub async fn retry_rejected<F, Fut, T>(operation_name: &str, max_wait_ms: u64, operation: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    retry_when(operation_name, max_wait_ms, StoreError::is_rejected, operation).await
}

async fn retry_when<F, Fut, T>(
    operation_name: &str,
    max_wait_ms: u64,
    retryable: fn(&StoreError) -> bool,
    mut operation: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    let start_time = Instant::now();
    let max_duration = Duration::from_millis(max_wait_ms);
    let mut attempt = 0u32;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        "Store operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) if !retryable(&err) => return Err(err),
            Err(err) => {
                let elapsed = start_time.elapsed();

                if elapsed >= max_duration {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        max_wait_ms,
                        error = %err,
                        "Store operation failed: retry budget exhausted"
                    );
                    return Err(err);
                }

                let sleep_ms = backoff_ms
                    .min(MAX_BACKOFF_MS)
                    .min(max_duration.saturating_sub(elapsed).as_millis() as u64)
                    .max(1);

                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms = sleep_ms,
                    error = %err,
                    "Transient store error, will retry after backoff"
                );

                tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        }
    }
}
