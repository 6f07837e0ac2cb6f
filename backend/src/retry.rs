use common::{Error, Result, RetryConfig, Transient};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::BackendClient;

/// Retries transient backend errors: waits out flood waits and follows redirects.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub max_flood_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            max_flood_wait: Duration::from_secs(cfg.max_flood_wait_secs),
        }
    }
}

impl RetryPolicy {
    /// Run `call` until it succeeds, fails for good, or `abort` fires.
    /// Once aborted no further attempt is made and `Error::Aborted` is returned.
    pub async fn run<T, F, Fut>(
        &self,
        op: &str,
        client: &dyn BackendClient,
        abort: &CancellationToken,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            if abort.is_cancelled() {
                tracing::debug!("{} aborted before attempt {}", op, attempt);
                return Err(Error::Aborted);
            }
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(Error::BackendTransient(transient)) => transient,
                Err(e) => return Err(e),
            };

            if let Transient::FloodWait(wait) = &err {
                if *wait > self.max_flood_wait {
                    return Err(Error::BackendFatal(format!(
                        "{}: flood wait of {:?} exceeds {:?}",
                        op, wait, self.max_flood_wait
                    )));
                }
            }
            if attempt >= self.max_attempts {
                tracing::warn!("{} gave up after {} attempts: {}", op, attempt, err);
                return Err(Error::BackendTransient(err));
            }

            match &err {
                Transient::FloodWait(wait) => {
                    tracing::warn!("{} hit a flood wait, sleeping {:?}", op, wait);
                    tokio::select! {
                        _ = abort.cancelled() => {
                            tracing::info!("{} aborted during a flood wait", op);
                            return Err(Error::Aborted);
                        }
                        _ = tokio::time::sleep(*wait) => {}
                    }
                }
                Transient::Redirect(target) => {
                    tracing::warn!("{} redirected to {}", op, target);
                    client.redirect(target).await?;
                }
            }
            attempt += 1;
        }
    }
}
