//! Cancellation-aware bounded retry with exponential backoff, shared by the
//! REST clients and the transfer drivers.

use std::fmt::Display;

use futures::Future;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DEFAULT_BASE_BACKOFF_SECONDS: f64 = 0.25;
pub const DEFAULT_MAX_BACKOFF_SECONDS: f64 = 8.0;

pub fn exponential_backoff_duration_seconds(n: u32, base_seconds: f64, max_seconds: f64) -> f64 {
    if n == 0 {
        0.0
    } else {
        (base_seconds * 2.0_f64.powi((n - 1) as i32)).min(max_seconds)
    }
}

/// Sleep for the n'th backoff interval, returning early if `cancel` fires.
pub async fn exponential_backoff(
    n: u32,
    base_seconds: f64,
    max_seconds: f64,
    cancel: &CancellationToken,
) {
    let seconds = exponential_backoff_duration_seconds(n, base_seconds, max_seconds);
    if seconds == 0.0 {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(std::time::Duration::from_secs_f64(seconds)) => {}
        _ = cancel.cancelled() => {}
    }
}

/// Retry `op` up to `max_retries` times on errors that `is_permanent` does
/// not reject. Returns `None` when cancelled, otherwise the final result.
///
/// Attempts past `warn_threshold` are logged at warn level so a flapping
/// dependency is visible without drowning the log on the first hiccup.
pub async fn retry<T, O, F, E>(
    mut op: O,
    is_permanent: impl Fn(&E) -> bool,
    warn_threshold: u32,
    max_retries: u32,
    description: &str,
    cancel: &CancellationToken,
) -> Option<Result<T, E>>
where
    O: FnMut() -> F,
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        let result = op().await;
        match &result {
            Ok(_) => return Some(result),
            Err(e) if is_permanent(e) => return Some(result),
            Err(e) => {
                if attempt >= max_retries {
                    warn!("{description} failed, exhausted retries: {e:#}");
                    return Some(result);
                }
                if attempt >= warn_threshold {
                    warn!("{description} failed, retrying (attempt {attempt}): {e:#}");
                } else {
                    info!("{description} failed, retrying (attempt {attempt}): {e:#}");
                }
            }
        }
        attempt += 1;
        exponential_backoff(
            attempt,
            DEFAULT_BASE_BACKOFF_SECONDS,
            DEFAULT_MAX_BACKOFF_SECONDS,
            cancel,
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_durations_double_up_to_the_cap() {
        assert_eq!(exponential_backoff_duration_seconds(0, 0.25, 8.0), 0.0);
        assert_eq!(exponential_backoff_duration_seconds(1, 0.25, 8.0), 0.25);
        assert_eq!(exponential_backoff_duration_seconds(2, 0.25, 8.0), 0.5);
        assert_eq!(exponential_backoff_duration_seconds(16, 0.25, 8.0), 8.0);
    }

    #[tokio::test]
    async fn retry_stops_on_permanent_errors() {
        let attempts = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Option<Result<(), &str>> = retry(
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err("permanent")
            },
            |_| true,
            0,
            10,
            "test op",
            &cancel,
        )
        .await;
        assert!(matches!(result, Some(Err("permanent"))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_retries_transient_errors_until_success() {
        let attempts = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Option<Result<u32, &str>> = retry(
            || async {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("transient")
                } else {
                    Ok(n)
                }
            },
            |_| false,
            10,
            5,
            "test op",
            &cancel,
        )
        .await;
        assert!(matches!(result, Some(Ok(2))));
    }

    #[tokio::test]
    async fn retry_returns_none_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Option<Result<(), &str>> =
            retry(|| async { Err("nope") }, |_| false, 0, 3, "test op", &cancel).await;
        assert!(result.is_none());
    }
}
