//! Deadlines for live executions.
//!
//! An operation is raced against a timer. Whichever settles first decides the
//! result; the loser is dropped. Dropping a future stops it from being polled
//! but does not undo what it already started: a spawned process, an open
//! browser page or a running emulator stays alive. Callers that own such
//! resources clean them up through the hook of [`with_time_limit_or_else`] or
//! in their own error branch.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// The deadline elapsed before the operation settled
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (time limit {limit:?})")]
pub struct TimeoutError {
    /// Caller supplied description of what did not finish
    pub message: String,
    /// The limit that elapsed
    pub limit: Duration,
}

/// Run `operation` with a deadline of `limit`.
///
/// If the operation settles first, its value or error is returned unchanged.
/// Otherwise the call fails with a [`TimeoutError`] carrying `message`,
/// converted into the caller's error type. A zero limit fires on the first
/// poll unless the operation is already complete.
pub async fn with_time_limit<T, E, F>(
    limit: Duration,
    message: impl Into<String>,
    operation: F,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<TimeoutError>,
{
    tokio::select! {
        biased;
        settled = operation => settled,
        _ = tokio::time::sleep(limit) => Err(E::from(TimeoutError {
            message: message.into(),
            limit,
        })),
    }
}

/// Like [`with_time_limit`], but runs `on_timeout` after the deadline has
/// elapsed and before the timeout error is returned.
///
/// The hook is where resources the abandoned operation was using get closed.
/// A failing hook is logged; the timeout error is still what the caller sees.
pub async fn with_time_limit_or_else<T, E, F, H, HF, HE>(
    limit: Duration,
    message: impl Into<String>,
    operation: F,
    on_timeout: H,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<TimeoutError>,
    H: FnOnce() -> HF,
    HF: Future<Output = Result<(), HE>>,
    HE: std::fmt::Display,
{
    let message = message.into();
    let timed_out = tokio::select! {
        biased;
        settled = operation => return settled,
        _ = tokio::time::sleep(limit) => TimeoutError { message, limit },
    };
    if let Err(e) = on_timeout().await {
        warn!(error = %e, "cleanup after timeout failed");
    }
    Err(E::from(timed_out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Timeout(TimeoutError),
        Failed(&'static str),
    }

    impl From<TimeoutError> for TestError {
        fn from(e: TimeoutError) -> Self {
            TestError::Timeout(e)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolves_when_operation_is_faster() {
        let result: Result<u32, TestError> =
            with_time_limit(Duration::from_millis(100), "slow", async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(7)
            })
            .await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_error_propagates() {
        let result: Result<u32, TestError> =
            with_time_limit(Duration::from_millis(100), "slow", async {
                Err(TestError::Failed("boom"))
            })
            .await;
        assert_eq!(result, Err(TestError::Failed("boom")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_with_message() {
        let result: Result<u32, TestError> =
            with_time_limit(Duration::from_millis(50), "content did not end", async {
                std::future::pending::<()>().await;
                Ok(1)
            })
            .await;
        assert_eq!(
            result,
            Err(TestError::Timeout(TimeoutError {
                message: "content did not end".to_string(),
                limit: Duration::from_millis(50),
            }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_limit_fires_immediately() {
        let result: Result<(), TestError> = with_time_limit(Duration::ZERO, "zero", async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(TestError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_hook_runs_only_on_timeout() {
        let cleaned = Arc::new(AtomicBool::new(false));

        let flag = cleaned.clone();
        let ok: Result<u8, TestError> = with_time_limit_or_else(
            Duration::from_millis(100),
            "fast",
            async { Ok(1) },
            move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<(), String>(())
            },
        )
        .await;
        assert_eq!(ok, Ok(1));
        assert!(!cleaned.load(Ordering::SeqCst));

        let flag = cleaned.clone();
        let timed_out: Result<u8, TestError> = with_time_limit_or_else(
            Duration::from_millis(100),
            "stuck",
            std::future::pending(),
            move || async move {
                flag.store(true, Ordering::SeqCst);
                Err::<(), String>("close failed".to_string())
            },
        )
        .await;
        assert!(matches!(timed_out, Err(TestError::Timeout(_))));
        assert!(cleaned.load(Ordering::SeqCst));
    }
}
