//! Fail-open utilities for best-effort side effects
//!
//! In-memory orchestration state is authoritative. Persisting it is a side
//! effect that may lag or fail without changing what the orchestrator believes,
//! so persistence goes through these helpers.
//!
//! DO NOT use fail-open for:
//! - Agent execution (a failed agent call must reach the caller)
//! - State transitions (a refused transition is an error)

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Execute an operation that should fail open
///
/// Logs the error via `tracing::warn!` on failure and returns `None`.
///
/// # Usage
///
/// ```no_run
/// use conclave_core::fail_open::fail_open;
/// use conclave_core::Result;
///
/// async fn save_loop_state() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let saved = fail_open("review_loop::persist", || save_loop_state()).await;
///     // saved is None if persisting failed, otherwise Some(())
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

/// Synchronous variant for side effects that never suspend
pub fn fail_open_sync<F, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Result<T>,
{
    match f() {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConclaveError;

    #[tokio::test]
    async fn test_fail_open_success() {
        let result = fail_open("test_op", || async { Ok::<_, ConclaveError>(42) }).await;
        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn test_fail_open_failure() {
        let result = fail_open("test_op", || async {
            Err::<i32, _>(ConclaveError::Storage("disk full".to_string()))
        })
        .await;
        assert_eq!(result, None);
    }

    #[test]
    fn test_fail_open_sync() {
        assert_eq!(fail_open_sync("ok", || Ok(7)), Some(7));
        assert_eq!(
            fail_open_sync::<_, i32>("err", || Err(ConclaveError::Other("boom".into()))),
            None
        );
    }
}
