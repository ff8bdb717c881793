//! Time-boxed, cancellable execution of backend calls.

use std::future::Future;
use std::time::Duration;

use super::CancellationToken;
use crate::errors::VdpflowError;

/// Runs `operation` until it finishes, `timeout` elapses, or `token` is
/// cancelled, whichever comes first.
///
/// The operation future is dropped on timeout or cancellation, which
/// aborts the underlying request instead of leaving it running.
pub async fn run_time_boxed<T, Fut>(
    label: &str,
    timeout: Duration,
    token: &CancellationToken,
    operation: Fut,
) -> Result<T, VdpflowError>
where
    Fut: Future<Output = Result<T, VdpflowError>>,
{
    if token.is_cancelled() {
        return Err(VdpflowError::Cancelled(
            token.reason().unwrap_or_else(|| label.to_string()),
        ));
    }

    tokio::select! {
        biased;
        () = token.cancelled() => Err(VdpflowError::Cancelled(
            token.reason().unwrap_or_else(|| label.to_string()),
        )),
        result = tokio::time::timeout(timeout, operation) => match result {
            Ok(inner) => inner,
            Err(_) => Err(VdpflowError::transient(format!(
                "{label} timed out after {}ms",
                timeout.as_millis()
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureKind;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_completes_within_budget() {
        let token = CancellationToken::new();
        let result = run_time_boxed("probe", Duration::from_secs(1), &token, async {
            Ok::<_, VdpflowError>(7)
        })
        .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let token = CancellationToken::new();
        let result: Result<(), _> = run_time_boxed("probe", Duration::from_millis(10), &token, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Transient);
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancellation_abandons_call() {
        let token = Arc::new(CancellationToken::new());
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                token.cancel("caller gave up");
            })
        };

        let result: Result<(), _> = run_time_boxed("extract", Duration::from_secs(30), &token, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .await;
        canceller.await.unwrap();

        assert!(matches!(result, Err(VdpflowError::Cancelled(ref r)) if r == "caller gave up"));
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_skips_operation() {
        let token = CancellationToken::new();
        token.cancel("already");
        let ran = std::sync::atomic::AtomicBool::new(false);
        let result: Result<(), _> =
            run_time_boxed("extract", Duration::from_secs(1), &token, async {
                ran.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(VdpflowError::Cancelled(_))));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }
}
