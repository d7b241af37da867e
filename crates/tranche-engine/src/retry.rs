use std::future::Future;
use std::time::Duration;

use anyhow::Result;

const BACKOFF_STEP: Duration = Duration::from_millis(20);

/// Run an idempotent read up to `attempts` times (at least once), sleeping a
/// little longer after each failure. Only the last error is returned.
pub async fn with_read_retry<T, F, Fut>(what: &str, attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < attempts => {
                tracing::warn!(read = what, attempt, error = %format!("{e:#}"), "store_read_retry");
                tokio::time::sleep(BACKOFF_STEP * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e.context(format!("{what} failed after {attempt} attempt(s)"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use anyhow::anyhow;

    use super::*;

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let v = with_read_retry("load_order", 3, move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(anyhow!("transient"))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(v, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_the_configured_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let r: Result<()> = with_read_retry("load_order", 2, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("down"))
        })
        .await;
        assert!(r.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_attempts_still_tries_once() {
        let r = with_read_retry("load_order", 0, || async { Ok::<_, anyhow::Error>(1) }).await;
        assert_eq!(r.unwrap(), 1);
    }
}
