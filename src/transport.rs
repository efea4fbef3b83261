//! Outbound admission control and retry.
//!
//! Every remote call funnels through one [`TransportGovernor`] so the request
//! ceiling is global to the uploader. The governor knows nothing about
//! payloads: it sees a [`RawResponse`] and decides between success, retry and
//! immediate failure.

use crate::config::TransportConfig;
use bytes::Bytes;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use rand::Rng;
use reqwest::{
    RequestBuilder, StatusCode,
    header::{HeaderMap, RETRY_AFTER},
};
use serde::{Deserialize, de::DeserializeOwned};
use std::{
    borrow::Cow,
    future::Future,
    num::NonZeroU32,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

const TARGET: &str = "hermes.transport";
/// Upper bound on a server-supplied `Retry-After` hint.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RawResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    fn retry_after(&self) -> Option<Duration> {
        self.headers
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<f64>().ok())
            .filter(|secs| !secs.is_nan() && *secs >= 0.0)
            .map(|secs| {
                Duration::try_from_secs_f64(secs)
                    .unwrap_or(Duration::MAX)
                    .min(MAX_RETRY_AFTER)
            })
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited after {attempts} attempt(s)")]
    RateLimited { attempts: u32 },
    #[error("server error HTTP {status} after {attempts} attempt(s)")]
    Server { status: u16, attempts: u32 },
    #[error("request rejected with HTTP {status}: {detail}")]
    Rejected { status: u16, detail: String },
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::Rejected { .. })
    }

    /// The remote never saw the request.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, TransportError::Connect(_))
    }

    /// Call deadlines belong to the governor, which reports the configured
    /// limit as [`TransportError::Timeout`].
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

/// Whether a call may be replayed after an ambiguous failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Idempotent: replay on any transient failure.
    Retryable,
    /// Creates state remotely: replay only when the remote provably did not act
    /// (rate-limit signal or connection refused).
    AtMostOnce,
}

pub type RateLimitPredicate = Arc<dyn Fn(&RawResponse) -> bool + Send + Sync>;

/// HTTP 429, or a GraphQL envelope carrying a `THROTTLED` error code.
pub fn default_rate_limit_predicate() -> RateLimitPredicate {
    Arc::new(|response: &RawResponse| {
        if response.status == StatusCode::TOO_MANY_REQUESTS {
            return true;
        }
        if !response.status.is_success() {
            return false;
        }
        response
            .json::<ThrottleProbe>()
            .map(|probe| probe.is_throttled())
            .unwrap_or(false)
    })
}

#[derive(Deserialize)]
struct ThrottleProbe {
    #[serde(default)]
    errors: Option<Vec<ThrottleProbeError>>,
}

#[derive(Deserialize)]
struct ThrottleProbeError {
    #[serde(default)]
    extensions: Option<ThrottleProbeExtensions>,
}

#[derive(Deserialize)]
struct ThrottleProbeExtensions {
    #[serde(default)]
    code: Option<String>,
}

impl ThrottleProbe {
    fn is_throttled(&self) -> bool {
        self.errors.iter().flatten().any(|error| {
            error
                .extensions
                .as_ref()
                .and_then(|ext| ext.code.as_deref())
                .is_some_and(|code| code.eq_ignore_ascii_case("THROTTLED"))
        })
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TransportConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.backoff_multiplier.max(1.0),
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }

    /// Deterministic delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(millis as u64).min(self.max_backoff)
    }

    fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let mut delay = self.backoff(attempt);
        if let Some(hint) = retry_after {
            delay = delay.max(hint);
        }
        if !self.jitter.is_zero() {
            let extra = rand::rng().random_range(0..=self.jitter.as_millis() as u64);
            delay += Duration::from_millis(extra);
        }
        delay
    }
}

#[derive(Clone)]
pub struct TransportGovernor {
    inner: Arc<GovernorInner>,
}

struct GovernorInner {
    limiter: DefaultDirectRateLimiter,
    policy: RetryPolicy,
    call_timeout: Duration,
    is_rate_limited: RateLimitPredicate,
}

enum Verdict {
    Done(RawResponse),
    Retry(TransportError, Option<Duration>),
    Fail(TransportError),
}

impl TransportGovernor {
    pub fn new(config: &TransportConfig) -> Self {
        Self::with_predicate(config, default_rate_limit_predicate())
    }

    pub fn with_predicate(config: &TransportConfig, is_rate_limited: RateLimitPredicate) -> Self {
        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        debug!(
            target: TARGET,
            requests_per_second = per_second.get(),
            max_attempts = config.max_attempts,
            "transport_governor_ready"
        );
        Self {
            inner: Arc::new(GovernorInner {
                limiter: RateLimiter::direct(Quota::per_second(per_second)),
                policy: RetryPolicy::from_config(config),
                call_timeout: config.call_timeout(),
                is_rate_limited,
            }),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    /// Runs `op` under the rate ceiling, retrying transient failures with backoff.
    ///
    /// `op` is invoked once per attempt and must rebuild its request each time.
    pub async fn execute<F, Fut>(
        &self,
        operation: &'static str,
        delivery: Delivery,
        mut op: F,
    ) -> Result<RawResponse, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<RawResponse, TransportError>>,
    {
        let policy = &self.inner.policy;
        let mut attempt = 1;
        loop {
            self.inner.limiter.until_ready().await;
            crate::metrics::inc_requests(operation);
            let started = Instant::now();

            let outcome = match timeout(self.inner.call_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(self.inner.call_timeout)),
            };
            let verdict = self.judge(outcome, delivery, attempt);
            crate::metrics::stage_elapsed(operation, started.elapsed().as_millis());

            match verdict {
                Verdict::Done(response) => return Ok(response),
                Verdict::Fail(err) => return Err(err),
                Verdict::Retry(err, retry_after) => {
                    if attempt >= policy.max_attempts {
                        warn!(
                            target: TARGET,
                            operation,
                            attempts = attempt,
                            error = %err,
                            "retry_budget_exhausted"
                        );
                        return Err(err);
                    }
                    let delay = policy.delay(attempt, retry_after);
                    debug!(
                        target: TARGET,
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retry_scheduled"
                    );
                    crate::metrics::retry_scheduled(operation, attempt, delay.as_millis());
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn judge(
        &self,
        outcome: Result<RawResponse, TransportError>,
        delivery: Delivery,
        attempt: u32,
    ) -> Verdict {
        let response = match outcome {
            Ok(response) => response,
            Err(err @ TransportError::Connect(_)) => return Verdict::Retry(err, None),
            Err(err) if delivery == Delivery::Retryable && err.is_transient() => {
                return Verdict::Retry(err, None);
            }
            Err(err) => return Verdict::Fail(err),
        };

        if (self.inner.is_rate_limited)(&response) {
            let retry_after = response.retry_after();
            return Verdict::Retry(TransportError::RateLimited { attempts: attempt }, retry_after);
        }

        let status = response.status;
        if status.is_server_error() {
            let err = TransportError::Server {
                status: status.as_u16(),
                attempts: attempt,
            };
            return match delivery {
                Delivery::Retryable => Verdict::Retry(err, None),
                Delivery::AtMostOnce => Verdict::Fail(err),
            };
        }
        if status.is_client_error() {
            let detail: String = response.text().chars().take(300).collect();
            return Verdict::Fail(TransportError::Rejected {
                status: status.as_u16(),
                detail,
            });
        }
        Verdict::Done(response)
    }
}

/// Sends a prepared request and buffers the whole body.
pub async fn send(request: RequestBuilder) -> Result<RawResponse, TransportError> {
    let response = request.send().await.map_err(TransportError::from_reqwest)?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response
        .bytes()
        .await
        .map_err(TransportError::from_reqwest)?;
    Ok(RawResponse {
        status,
        headers,
        body,
    })
}
