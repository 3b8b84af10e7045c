//! Fixed-delay retry that never gives up on its own; only the cancellation
//! token ends it.

use log::warn;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Retry configuration: a constant delay between attempts, unbounded attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self { delay }
    }

    /// Runs `operation` until it succeeds or `token` is cancelled.
    ///
    /// The closure receives the attempt number (0-indexed). Returns `None`
    /// only on cancellation, including cancellation during a delay.
    pub async fn run<F, Fut, T, E>(&self, token: &CancellationToken, mut operation: F) -> Option<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 0u32;
        loop {
            if token.is_cancelled() {
                return None;
            }

            match operation(attempt).await {
                Ok(value) => return Some(value),
                Err(err) => {
                    warn!(
                        "Attempt {} failed: {}; retrying in {:?}",
                        attempt + 1,
                        err,
                        self.delay
                    );
                    attempt = attempt.saturating_add(1);
                    tokio::select! {
                        _ = token.cancelled() => return None,
                        _ = tokio::time::sleep(self.delay) => {}
                    }
                }
            }
        }
    }
}
