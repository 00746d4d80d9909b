//! Backoff for read operations. Writes are never retried here, a repeated
//! insert could duplicate a message.

use crate::core::error::{Error, Result};
use log::warn;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

pub const READ_ATTEMPTS: u32 = 3;
const INITIAL_DELAY: Duration = Duration::from_millis(50);
const MAX_DELAY: Duration = Duration::from_millis(800);

/// Runs `read` until it succeeds, fails with something other than a store
/// error, or `READ_ATTEMPTS` runs out.
pub async fn retry_read<T, F, Fut>(what: &str, mut read: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = INITIAL_DELAY;
    let mut attempt = 1;

    loop {
        match read().await {
            Err(Error::Store(err)) if attempt < READ_ATTEMPTS => {
                warn!("{what} failed on attempt {attempt}/{READ_ATTEMPTS}: {err}");
                sleep(delay).await;
                delay = delay.saturating_mul(2).min(MAX_DELAY);
                attempt += 1;
            }
            result => return result,
        }
    }
}
