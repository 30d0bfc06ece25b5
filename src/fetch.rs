//! Shared retrying HTTP transport.
//!
//! Every upstream call goes through [`FetchClient`]: per-request timeouts,
//! exponential backoff with jitter on transient failures, per-host pacing
//! and concurrency caps, and cooperative cancellation.

use parking_lot::Mutex;
use rand::Rng;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::FetchError;

#[derive(Debug, Clone)]
pub struct FetchClientConfig {
    /// Connect + read timeout per attempt.
    pub timeout: Duration,
    /// Attempts per call, counting the first.
    pub max_retries: u32,
    /// First retry delay; doubles per attempt.
    pub base_backoff: Duration,
    /// Upper bound honored for `Retry-After`.
    pub retry_after_ceiling: Duration,
    /// In-flight request cap per upstream host.
    pub max_concurrent_per_host: usize,
    /// Minimum spacing between request starts against one host.
    pub min_host_interval: Duration,
}

impl Default for FetchClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
            retry_after_ceiling: Duration::from_secs(60),
            max_concurrent_per_host: 4,
            min_host_interval: Duration::from_millis(250),
        }
    }
}

struct HostGate {
    slots: Arc<Semaphore>,
    /// Next instant a request may start against this host.
    next_start: tokio::sync::Mutex<Instant>,
}

#[derive(Clone)]
pub struct FetchClient {
    client: Client,
    config: FetchClientConfig,
    hosts: Arc<Mutex<HashMap<String, Arc<HostGate>>>>,
}

impl FetchClient {
    pub fn new(config: FetchClientConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .user_agent("heimdall-asis/0.1")
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            config,
            hosts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &FetchClientConfig {
        &self.config
    }

    /// GET returning parsed JSON.
    pub async fn get_json(
        &self,
        url: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, FetchError> {
        let response = self.get(url, query, headers, cancel).await?;
        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| FetchError::Transient(format!("decode body: {e}")))
    }

    /// GET returning the response body as text.
    pub async fn get_text(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<String, FetchError> {
        let response = self.get(url, &[], &[], cancel).await?;
        response
            .text()
            .await
            .map_err(|e| FetchError::Transient(format!("read body: {e}")))
    }

    /// GET with retry, pacing, and cancellation.
    pub async fn get(
        &self,
        url: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, FetchError> {
        let gate = self.gate_for(url);
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            permit = gate.slots.clone().acquire_owned() => {
                permit.map_err(|_| FetchError::Transient("host gate closed".into()))?
            }
        };

        let mut rate_limited_last = false;

        for attempt in 0..self.config.max_retries {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            self.pace(&gate, cancel).await?;

            let mut request = self.client.get(url).query(query);
            for (name, value) in headers {
                request = request.header(name.as_str(), value.as_str());
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                result = request.send() => result,
            };

            let retry_after = match outcome {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        rate_limited_last = true;
                        let retry_after = parse_retry_after(&response)
                            .map(|d| d.min(self.config.retry_after_ceiling));
                        warn!(url, attempt = attempt + 1, "rate limited by upstream");
                        retry_after
                    } else if status.is_server_error() {
                        rate_limited_last = false;
                        warn!(url, status = status.as_u16(), attempt = attempt + 1,
                              "server error from upstream");
                        None
                    } else {
                        // 4xx other than 429: not worth retrying
                        let body = response.text().await.unwrap_or_default();
                        return Err(FetchError::Permanent {
                            status: status.as_u16(),
                            body: truncate(&body, 512),
                        });
                    }
                }
                Err(e) => {
                    rate_limited_last = false;
                    warn!(url, attempt = attempt + 1, error = %e, "request failed");
                    None
                }
            };

            if attempt + 1 < self.config.max_retries {
                let delay =
                    retry_after.unwrap_or_else(|| jittered_backoff(attempt, self.config.base_backoff));
                debug!(url, delay_ms = delay.as_millis() as u64, "retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    _ = sleep(delay) => {}
                }
            }
        }

        if rate_limited_last {
            Err(FetchError::RateLimited)
        } else {
            Err(FetchError::Transient(format!(
                "max retries exceeded for {url}"
            )))
        }
    }

    fn gate_for(&self, url: &str) -> Arc<HostGate> {
        let host = reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_owned))
            .unwrap_or_else(|| "unknown".into());

        let mut hosts = self.hosts.lock();
        hosts
            .entry(host)
            .or_insert_with(|| {
                Arc::new(HostGate {
                    slots: Arc::new(Semaphore::new(self.config.max_concurrent_per_host.max(1))),
                    next_start: tokio::sync::Mutex::new(Instant::now()),
                })
            })
            .clone()
    }

    /// Token-bucket pacing: claim the host's next start slot, then wait
    /// until it arrives.
    async fn pace(&self, gate: &HostGate, cancel: &CancellationToken) -> Result<(), FetchError> {
        let wait_until = {
            let mut next = gate.next_start.lock().await;
            let now = Instant::now();
            let slot = (*next).max(now);
            *next = slot + self.config.min_host_interval;
            slot
        };

        if wait_until > Instant::now() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep_until(wait_until) => {}
            }
        }
        Ok(())
    }
}

/// Exponential schedule (base, 2*base, 4*base, ...) with ±25% jitter.
fn jittered_backoff(attempt: u32, base: Duration) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(16));
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    exp.mul_f64(jitter)
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_doubles_within_jitter_bounds() {
        let base = Duration::from_secs(1);
        for attempt in 0..3u32 {
            let expected = base * (1 << attempt);
            let delay = jittered_backoff(attempt, base);
            assert!(delay >= expected.mul_f64(0.75), "attempt {attempt}: {delay:?}");
            assert!(delay <= expected.mul_f64(1.25), "attempt {attempt}: {delay:?}");
        }
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 3), "hel");
        // multi-byte char straddling the cut
        let s = "héllo";
        let t = truncate(s, 2);
        assert!(s.starts_with(&t));
    }

    #[tokio::test]
    async fn cancelled_call_returns_immediately() {
        let client = FetchClient::new(FetchClientConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = client
            .get("http://127.0.0.1:9/never", &[], &[], &cancel)
            .await;
        assert!(matches!(result, Err(FetchError::Cancelled)));
    }

    #[tokio::test]
    async fn connection_refused_is_transient_after_retries() {
        let client = FetchClient::new(FetchClientConfig {
            max_retries: 2,
            base_backoff: Duration::from_millis(5),
            min_host_interval: Duration::from_millis(1),
            ..FetchClientConfig::default()
        });
        let cancel = CancellationToken::new();

        // port 9 (discard) is not listening
        let result = client
            .get("http://127.0.0.1:9/nothing", &[], &[], &cancel)
            .await;
        assert!(matches!(result, Err(FetchError::Transient(_))));
    }
}
