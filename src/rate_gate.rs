use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::{Quota, RateLimiter};
use rand::Rng;
use reqwest::{RequestBuilder, StatusCode};
use tracing::{info, warn};

use crate::config::RateLimitConfig;
use crate::error::{CoreError, Result, UpstreamErrorBody, RATE_GATE_RETRY_CODES};

type Limiter = RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, DefaultClock>;

/// Token-bucket + retry/backoff wrapper around every upstream call (spec.md §4.2).
///
/// Built on `governor`'s in-memory token bucket (burst + sustained rate) and a manual
/// backoff loop, generalizing the teacher's hand-rolled `fetch_with_retry` in
/// `rd_client.rs` into a reusable gate other clients share.
pub struct RateGate {
    limiter: Arc<Limiter>,
    config: RateLimitConfig,
}

/// Outcome of inspecting a non-2xx response: either retry (possibly after a wait) or
/// hand the classified error back to the caller.
enum Decision {
    RetryAfter(Duration),
    Fail(CoreError),
}

impl RateGate {
    pub fn new(config: RateLimitConfig) -> Self {
        let rate = config.effective_rate().max(1);
        let burst = config.burst.max(1);
        let quota = Quota::per_minute(NonZeroU32::new(rate).unwrap())
            .allow_burst(NonZeroU32::new(burst).unwrap());
        Self { limiter: Arc::new(RateLimiter::direct(quota)), config }
    }

    /// Exponential backoff for a 429 with no `Retry-After` header: `base * 2^attempt`,
    /// capped at `max_backoff_ms` (spec.md §4.2 step 4).
    fn doubling_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(32));
        let ms = self.config.base_backoff_ms.saturating_mul(factor).min(self.config.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Jittered backoff (±20%) for codes 5/34/36, capped at 60s (spec.md §4.2 step 3).
    fn jittered_backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.config.base_backoff_ms.saturating_mul(1u64 << attempt.min(20));
        let capped_ms = base_ms.min(60_000);
        let jitter_frac = rand::thread_rng().gen_range(-0.2..=0.2);
        let jittered = (capped_ms as f64) * (1.0 + jitter_frac);
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    async fn wait_for_capacity(&self) {
        self.limiter.until_ready().await;
    }

    fn classify(&self, status: StatusCode, attempt: u32, body: &str) -> Decision {
        if body.trim_start().starts_with('<') {
            // Maintenance page / HTML error (spec.md §6): treat as transient, retry.
            return Decision::RetryAfter(self.jittered_backoff(attempt));
        }
        let parsed: UpstreamErrorBody = serde_json::from_str(body).unwrap_or_default();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Decision::RetryAfter(self.doubling_backoff(attempt));
        }
        if let Some(code) = parsed.error_code {
            if RATE_GATE_RETRY_CODES.contains(&code) {
                return Decision::RetryAfter(self.jittered_backoff(attempt));
            }
        }
        Decision::Fail(CoreError::from_body(status, &parsed))
    }

    /// Runs the retry loop and returns the status and raw body text of the eventual
    /// 2xx response. Never returns a partially-read body: on any non-2xx branch the
    /// body is fully consumed before deciding whether to retry or fail (spec.md §4.2
    /// "RateGate never returns partially read bodies").
    async fn execute<F>(&self, filename_hint: Option<&str>, make_request: F) -> Result<(StatusCode, String)>
    where
        F: Fn() -> RequestBuilder,
    {
        let max_retries = self.config.max_retries;
        let mut retried = false;

        for attempt in 0..=max_retries {
            self.wait_for_capacity().await;

            let resp = match make_request().send().await {
                Ok(r) => r,
                Err(e) => {
                    if attempt == max_retries {
                        return Err(CoreError::Transient(e));
                    }
                    warn!(attempt, error = %e, "upstream request failed, retrying");
                    tokio::time::sleep(self.doubling_backoff(attempt)).await;
                    retried = true;
                    continue;
                }
            };

            let status = resp.status();
            let text = resp.text().await.map_err(CoreError::Transient)?;

            if status.is_success() {
                if retried {
                    if let Some(hint) = filename_hint {
                        info!(file = %hint, attempt, "upstream call recovered after retry");
                    }
                }
                return Ok((status, text));
            }

            match self.classify(status, attempt, &text) {
                Decision::RetryAfter(wait) => {
                    if attempt == max_retries {
                        let parsed: UpstreamErrorBody = serde_json::from_str(&text).unwrap_or_default();
                        return Err(CoreError::from_body(status, &parsed));
                    }
                    warn!(attempt, ?wait, status = %status, "retrying after backoff");
                    tokio::time::sleep(wait).await;
                    retried = true;
                }
                Decision::Fail(err) => return Err(err),
            }
        }
        unreachable!("loop always returns before exhausting attempts")
    }

    /// Issue `make_request()` through the gate and deserialize the body as `T` on
    /// success (spec.md §4.2).
    pub async fn do_request<T, F>(&self, filename_hint: Option<&str>, make_request: F) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let (_, text) = self.execute(filename_hint, make_request).await?;
        if text.trim().is_empty() {
            serde_json::from_str("null").map_err(CoreError::Serde)
        } else {
            serde_json::from_str(&text).map_err(CoreError::Serde)
        }
    }

    /// Like `do_request`, but a `204 No Content` (or empty body) response yields `None`
    /// instead of attempting to deserialize — used by `TorrentInfo`, where a 204 is one
    /// of the two ways the upstream signals "not found" (spec.md §4.3, §7).
    pub async fn do_request_opt<T, F>(&self, filename_hint: Option<&str>, make_request: F) -> Result<Option<T>>
    where
        T: serde::de::DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let (status, text) = self.execute(filename_hint, make_request).await?;
        if status == StatusCode::NO_CONTENT || text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text).map(Some).map_err(CoreError::Serde)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> RateGate {
        RateGate::new(RateLimitConfig {
            requests_per_minute: 220,
            burst: 50,
            max_retries: 5,
            base_backoff_ms: 500,
            max_backoff_ms: 8000,
        })
    }

    #[test]
    fn doubling_backoff_is_capped() {
        let g = gate();
        assert_eq!(g.doubling_backoff(0), Duration::from_millis(500));
        assert_eq!(g.doubling_backoff(1), Duration::from_millis(1000));
        assert_eq!(g.doubling_backoff(2), Duration::from_millis(2000));
        assert_eq!(g.doubling_backoff(10), Duration::from_millis(8000));
    }

    #[test]
    fn jittered_backoff_stays_within_20_percent_and_60s_cap() {
        let g = gate();
        for attempt in 0..10 {
            let d = g.jittered_backoff(attempt);
            assert!(d <= Duration::from_millis(60_000 + 12_000));
        }
        let d = g.jittered_backoff(20);
        assert!(d <= Duration::from_millis(72_000));
    }

    #[test]
    fn retry_code_union_includes_5_34_and_36() {
        assert!(RATE_GATE_RETRY_CODES.contains(&5));
        assert!(RATE_GATE_RETRY_CODES.contains(&34));
        assert!(RATE_GATE_RETRY_CODES.contains(&36));
    }

    #[test]
    fn classify_maintenance_html_is_retried() {
        let g = gate();
        let decision = g.classify(StatusCode::SERVICE_UNAVAILABLE, 0, "<html>maintenance</html>");
        assert!(matches!(decision, Decision::RetryAfter(_)));
    }

    #[test]
    fn classify_429_always_retries_regardless_of_body_code() {
        let g = gate();
        let decision = g.classify(StatusCode::TOO_MANY_REQUESTS, 0, r#"{"error":"x","error_code":21}"#);
        assert!(matches!(decision, Decision::RetryAfter(_)));
    }

    #[test]
    fn classify_cacheable_code_is_a_terminal_failure_not_a_retry() {
        let g = gate();
        let decision = g.classify(StatusCode::BAD_REQUEST, 0, r#"{"error":"hoster down","error_code":19}"#);
        match decision {
            Decision::Fail(e) => assert_eq!(e.code(), Some(19)),
            _ => panic!("expected Fail"),
        }
    }

    #[tokio::test]
    async fn bucket_never_admits_more_than_burst_plus_one_immediately() {
        let g = RateGate::new(RateLimitConfig {
            requests_per_minute: 60,
            burst: 3,
            max_retries: 1,
            base_backoff_ms: 10,
            max_backoff_ms: 100,
        });
        let start = tokio::time::Instant::now();
        for _ in 0..3 {
            g.wait_for_capacity().await;
        }
        // the 4th call should have to wait for a refill, not run immediately
        g.wait_for_capacity().await;
        assert!(start.elapsed() >= Duration::from_millis(1));
    }
}
