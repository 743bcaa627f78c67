use log::{debug, info};
use std::time::{Duration, Instant};

/// Body signature of a cold-start 503 from the container platform. Only
/// responses carrying it are retried; a user app's own 503 passes through.
pub const PROVISIONING_SIGNATURE: &str = "There is no Container instance available";

/// Cold-start retry parameters.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub total_budget_ms: u64,
    /// An attempt only starts when at least this much budget remains.
    pub min_remaining_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base_delay_ms: 2_000,
            max_delay_ms: 16_000,
            total_budget_ms: 60_000,
            min_remaining_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// `min(base · 2^attempt, cap)` milliseconds.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let doubled = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        doubled.min(self.max_delay_ms)
    }
}

/// A fully materialized upstream response.
#[derive(Debug)]
pub struct FetchedResponse {
    pub status: u16,
    pub headers: reqwest::header::HeaderMap,
    pub body: bytes::Bytes,
}

impl FetchedResponse {
    pub fn is_provisioning_503(&self) -> bool {
        self.status == 503
            && String::from_utf8_lossy(&self.body).contains(PROVISIONING_SIGNATURE)
    }
}

/// Sends the request until it stops being a provisioning 503 or the budget
/// runs out. `make_request` builds a fresh request per attempt.
pub async fn fetch_with_retry<F>(
    policy: &RetryPolicy,
    mut make_request: F,
) -> Result<FetchedResponse, reqwest::Error>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        let response = make_request().send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        let fetched = FetchedResponse {
            status,
            headers,
            body,
        };

        if !fetched.is_provisioning_503() {
            if attempt > 0 {
                info!("Upstream came up after {} retries", attempt);
            }
            return Ok(fetched);
        }

        let delay = policy.backoff_ms(attempt);
        let elapsed = started.elapsed().as_millis() as u64;
        let remaining_after_delay = policy
            .total_budget_ms
            .saturating_sub(elapsed.saturating_add(delay));
        if remaining_after_delay < policy.min_remaining_ms {
            debug!(
                "Provisioning 503 after {} attempts, budget exhausted",
                attempt + 1
            );
            return Ok(fetched);
        }

        debug!(
            "Provisioning 503 (attempt {}), retrying in {}ms",
            attempt + 1,
            delay
        );
        tokio::time::sleep(Duration::from_millis(delay)).await;
        attempt += 1;
    }
}
