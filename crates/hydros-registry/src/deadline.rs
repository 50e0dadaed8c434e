//! Bounded-latency wrapper for storage calls.
//!
//! Nothing in Hydros may wait on a backing store indefinitely.  Every call to
//! a [`ControlStore`][crate::store::ControlStore], log sink, or sensor
//! provider is wrapped in [`bounded`], which converts an elapsed deadline into
//! [`HydroError::StorageUnavailable`].
//!
//! Writes use [`settle`] instead.  Dropping a write that is already running
//! would let it commit after the caller reported failure, so an overrunning
//! write is given a grace period to report how it ended.

use std::future::Future;
use std::pin::pin;
use std::time::Duration;

use hydros_types::HydroError;
use tracing::warn;

/// Default deadline for a single storage round-trip.
pub const DEFAULT_STORAGE_TIMEOUT: Duration = Duration::from_secs(2);

/// Await `fut` for at most `limit`.
///
/// `what` names the operation in the timeout message, e.g. `"control_store.get"`.
///
/// # Errors
///
/// Returns the future's own error, or [`HydroError::StorageUnavailable`] when
/// the deadline elapses first.
pub async fn bounded<T, F>(limit: Duration, what: &str, fut: F) -> Result<T, HydroError>
where
    F: Future<Output = Result<T, HydroError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(operation = what, timeout_ms = limit.as_millis() as u64, "storage call timed out");
            Err(HydroError::StorageUnavailable(format!(
                "{what} timed out after {} ms",
                limit.as_millis()
            )))
        }
    }
}

/// Await a write for `limit`, then for up to one more `limit` if it overran.
///
/// Stores are expected to resolve a write within `limit` (the SQLite store
/// cancels writes that have not started by then).  The grace period only
/// covers a write that was already running when the deadline passed.
///
/// # Errors
///
/// Returns the write's own error, or [`HydroError::StorageUnavailable`] when
/// it still has not resolved after the grace period.
pub async fn settle<T, F>(limit: Duration, what: &str, fut: F) -> Result<T, HydroError>
where
    F: Future<Output = Result<T, HydroError>>,
{
    let mut fut = pin!(fut);
    if let Ok(result) = tokio::time::timeout(limit, fut.as_mut()).await {
        return result;
    }
    warn!(operation = what, timeout_ms = limit.as_millis() as u64, "storage write overran its deadline; waiting for its outcome");
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(operation = what, "storage write outcome unknown");
            Err(HydroError::StorageUnavailable(format!(
                "{what} timed out after {} ms; outcome unknown",
                limit.as_millis() * 2
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fast_call_passes_through() {
        let out = bounded(Duration::from_millis(100), "fast", async { Ok::<_, HydroError>(7) }).await;
        assert_eq!(out, Ok(7));
    }

    #[tokio::test]
    async fn inner_error_is_preserved() {
        let out: Result<(), _> = bounded(Duration::from_millis(100), "nf", async {
            Err(HydroError::NotFound("x".into()))
        })
        .await;
        assert_eq!(out, Err(HydroError::NotFound("x".into())));
    }

    #[tokio::test]
    async fn slow_call_becomes_storage_unavailable() {
        let out: Result<(), _> = bounded(Duration::from_millis(10), "slow", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(out, Err(HydroError::StorageUnavailable(ref m)) if m.contains("slow")));
    }

    #[tokio::test]
    async fn settle_waits_for_an_overrunning_write() {
        let out = settle(Duration::from_millis(20), "write", async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok::<_, HydroError>("committed")
        })
        .await;
        assert_eq!(out, Ok("committed"));
    }

    #[tokio::test]
    async fn settle_gives_up_after_grace_period() {
        let out: Result<(), _> =
            settle(Duration::from_millis(10), "stuck", std::future::pending()).await;
        assert!(matches!(out, Err(HydroError::StorageUnavailable(ref m)) if m.contains("outcome unknown")));
    }
}
