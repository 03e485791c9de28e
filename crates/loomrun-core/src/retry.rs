use std::future::Future;
use std::time::Duration;

use loomrun_types::EngineError;

/// Exponential-backoff retry for classified-retryable errors, built on
/// `tokio::time::timeout` plus a manual retry loop, as one reusable policy
/// instead of each tool re-implementing it.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Run `f` until it succeeds, returns a non-transient error, or attempts
    /// are exhausted. Returns the outcome plus the number of retries that
    /// were actually performed, for the `tool_result.retryCount` field.
    pub async fn run<F, Fut, T>(&self, mut f: F) -> (Result<T, EngineError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match f().await {
                Ok(value) => return (Ok(value), attempt),
                Err(err) if err.is_transient() && attempt + 1 < self.max_attempts => {
                    attempt += 1;
                    let delay = self
                        .base_delay
                        .mul_f64(self.factor.powi(attempt as i32 - 1));
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return (Err(err), attempt),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry_on_first_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let (result, retries) = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, EngineError>(42) }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(retries, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_errors_then_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            factor: 1.0,
        };
        let (result, retries) = policy
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(EngineError::ToolTransient {
                            message: "timeout".into(),
                            invocation_id: None,
                            call_id: "c1".into(),
                        })
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn does_not_retry_fatal_errors() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let (result, retries) = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(EngineError::ToolFatal {
                        message: "bad args".into(),
                        invocation_id: None,
                        call_id: "c1".into(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(retries, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            factor: 1.0,
        };
        let (result, retries) = policy
            .run(|| async {
                Err::<(), _>(EngineError::ToolTransient {
                    message: "still failing".into(),
                    invocation_id: None,
                    call_id: "c1".into(),
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(retries, 2);
    }
}
