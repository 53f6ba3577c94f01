/// Bounded retry loop shared by device I/O and database connections
use log::error;
use std::fmt::Display;
use std::future::Future;

use crate::config::RetryPolicy;

/// Run `operation` until it succeeds or `policy.max_attempts` is exhausted
///
/// Waits `policy.wait` between attempts (not after the last one) and logs
/// every failure. Returns the error of the final attempt.
///
/// # Arguments
/// * `policy` - Attempt ceiling and wait between attempts
/// * `label` - What is being attempted, used in log lines
/// * `operation` - Factory producing one attempt's future
pub async fn with_retry<T, E, F, Fut>(policy: RetryPolicy, label: &str, operation: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                error!("{} attempt {}/{} failed: {}", label, attempt, attempts, e);
                if attempt >= attempts {
                    return Err(e);
                }
            }
        }

        if !policy.wait.is_zero() {
            tokio::time::sleep(policy.wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            wait: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn stops_at_first_success() {
        let calls = AtomicUsize::new(0);
        let result: Result<usize, String> = with_retry(policy(5), "op", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("fail {}", n))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_ceiling() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), String> = with_retry(policy(3), "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("nope".to_string())
        })
        .await;
        assert_eq!(result.unwrap_err(), "nope");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
