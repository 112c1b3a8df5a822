use busline_core::{CoreError, CoreResult};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded retry with exponential backoff and a per-attempt timeout.
/// Only transient failures are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            timeout: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub async fn execute<T, F, Fut>(&self, service: &str, operation: F) -> CoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let mut delay = self.initial_delay;
        let mut attempt = 1;
        loop {
            let err = match tokio::time::timeout(self.timeout, operation()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => err,
                Err(_) => CoreError::Collaborator {
                    service: service.to_string(),
                    message: format!("timed out after {:?}", self.timeout),
                    retryable: true,
                },
            };

            if !err.is_transient() || attempt >= self.attempts {
                return Err(err);
            }
            warn!(service, attempt, error = %err, "Collaborator call failed, retrying");
            tokio::time::sleep(delay).await;
            delay = delay.mul_f64(self.multiplier);
            attempt += 1;
        }
    }
}
