//! Shared HTTP retry policy for provider calls.
//!
//! Retries rate limits (429) and server errors (5xx) with capped
//! exponential backoff. Anything else is returned to the caller as-is;
//! per-API status handling stays in the adapters.

use std::time::Duration;

pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(1 << attempt.min(6)))
    }
}

/// Send a request, retrying transient failures per the policy.
pub async fn send_with_retry(
    builder: reqwest::RequestBuilder,
    policy: &RetryPolicy,
) -> Result<reqwest::Response, reqwest::Error> {
    let mut attempt = 0;
    loop {
        let request = builder
            .try_clone()
            .expect("retryable requests must have cloneable bodies");
        match request.send().await {
            Ok(resp) => {
                let status = resp.status();
                let retryable = status.as_u16() == 429 || status.is_server_error();
                if retryable && attempt + 1 < policy.max_attempts {
                    log::debug!("HTTP {status}, retrying (attempt {})", attempt + 1);
                    tokio::time::sleep(policy.backoff(attempt)).await;
                    attempt += 1;
                    continue;
                }
                return Ok(resp);
            }
            Err(e) if attempt + 1 < policy.max_attempts => {
                log::debug!("HTTP error {e}, retrying (attempt {})", attempt + 1);
                tokio::time::sleep(policy.backoff(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2000));
        // Exponent is clamped so pathological attempt counts don't overflow.
        assert_eq!(policy.backoff(60), Duration::from_millis(32_000));
    }
}
