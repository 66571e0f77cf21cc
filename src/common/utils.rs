//! Utility functions for farmd

use std::time::{SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp (seconds)
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// Retry with exponential backoff: one initial attempt plus up to
/// `max_retries` retries.
///
/// Retries only errors for which [`crate::Error::is_retryable`] holds; any
/// other error is returned to the caller immediately.
pub async fn retry_with_backoff<F, Fut, T>(
    mut f: F,
    max_retries: usize,
    initial_delay: std::time::Duration,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let mut delay = initial_delay;
    let attempts = max_retries + 1;

    for attempt in 0..attempts {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < attempts - 1 => {
                tracing::warn!(
                    "Retry attempt {} failed: {}, retrying in {:?}",
                    attempt + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }

    Err(crate::Error::Internal("Max retries exceeded".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_retry_gives_up_on_semantic_error() {
        let mut calls = 0;
        let result: crate::Result<()> = retry_with_backoff(
            || {
                calls += 1;
                async {
                    Err(crate::Error::Semantic {
                        server: "s1".into(),
                        reason: "nope".into(),
                    })
                }
            },
            3,
            std::time::Duration::from_millis(1),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_retry_retries_transport_error() {
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let result: crate::Result<u32> = retry_with_backoff(
            || {
                let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(crate::Error::Transport {
                            server: "s1".into(),
                            reason: "refused".into(),
                        })
                    } else {
                        Ok(7)
                    }
                }
            },
            3,
            std::time::Duration::from_millis(1),
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_is_initial_attempt_plus_retries() {
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let result: crate::Result<()> = retry_with_backoff(
            || {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async {
                    Err(crate::Error::Transport {
                        server: "s1".into(),
                        reason: "refused".into(),
                    })
                }
            },
            2,
            std::time::Duration::from_millis(1),
        )
        .await;
        assert!(result.is_err());
        // 2 retries means 3 driver calls in total
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
