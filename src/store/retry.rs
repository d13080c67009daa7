//! Bounded retry for transient database failures.

use std::future::Future;
use std::time::Duration;

use crate::error::StoreError;

/// Maximum attempts per operation, including the first.
const MAX_ATTEMPTS: u32 = 3;

/// Initial backoff; doubled after each failed attempt.
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Whether a raw libsql error message looks like a transient lock conflict.
pub fn is_transient(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("database is locked") || m.contains("database is busy") || m.contains("busy")
}

/// Run `op` up to three times with exponential backoff, converting a
/// persistent transient failure into `StoreError::Transient`.
pub async fn with_backoff<T, F, Fut>(op: F) -> Result<T, StoreError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut backoff = INITIAL_BACKOFF;
    let mut last_message = String::new();

    for attempt in 1..=MAX_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(StoreError::Query(msg)) if is_transient(&msg) => {
                tracing::warn!(attempt, error = %msg, "Transient store error, retrying");
                last_message = msg;
                if attempt < MAX_ATTEMPTS {
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
            Err(other) => return Err(other),
        }
    }

    Err(StoreError::Transient(last_message))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn transient_detection() {
        assert!(is_transient("database is locked"));
        assert!(is_transient("SQLite error: database is busy"));
        assert!(!is_transient("no such table: tasks"));
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StoreError::Query("database is locked".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_three_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Query("database is locked".into())) }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_pass_through() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Query("no such table".into())) }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Query(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
