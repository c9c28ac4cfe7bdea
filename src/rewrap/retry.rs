use std::future::Future;
use std::time::Duration;

use log::warn;

pub const RETRY_BACKOFF: Duration = Duration::from_millis(50);
const MAX_ATTEMPTS: u32 = 2;

/// Errors that can report whether they were caused by a timeout.
pub trait TimeoutAware {
    fn is_timeout(&self) -> bool;
}

#[derive(Debug)]
pub enum CallError<E> {
    TimedOut,
    Failed(E),
}

/// Run `op` under `limit`. A timeout (either ours or one reported by the
/// error) is retried once after [`RETRY_BACKOFF`]; any other error is
/// returned immediately.
pub async fn call_with_retry<T, E, F, Fut>(
    what: &str,
    limit: Duration,
    mut op: F,
) -> Result<T, CallError<E>>
where
    E: TimeoutAware,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match tokio::time::timeout(limit, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if !e.is_timeout() => return Err(CallError::Failed(e)),
            Ok(Err(_)) | Err(_) => {
                if attempt >= MAX_ATTEMPTS {
                    return Err(CallError::TimedOut);
                }
                warn!("{} timed out after {:?}, retrying once", what, limit);
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
        }
    }
}
