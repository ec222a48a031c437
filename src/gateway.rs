//! Uniform HTTP client to the per-service API adapters (§4.9).
//!
//! Retry (decorrelated jitter) and the circuit breaker are two independent
//! wrappers around a `reqwest::Client` call: the breaker counts attempts,
//! not retry budget, so `call()` asks the breaker before every attempt and
//! reports the outcome back afterward. Breaker bookkeeping follows the
//! first-failure/grace-period shape used by webhook-delivery workers
//! elsewhere in the retrieval pack (see DESIGN.md).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tokio::sync::{RwLock, Semaphore};

use crate::model::Provider;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("authentication failed")]
    AuthFailed,
    #[error("not found")]
    NotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("request timed out")]
    Timeout,
    #[error("circuit open for {service:?}/{installation_id}")]
    CircuitOpen {
        service: Provider,
        installation_id: String,
    },
}

pub type Result<T> = std::result::Result<T, GatewayError>;

const MAX_ATTEMPTS: u32 = 4;
const BASE_DELAY: Duration = Duration::from_millis(200);
const MAX_DELAY: Duration = Duration::from_secs(10);
const FAILURE_THRESHOLD: u32 = 5;
const FAILURE_WINDOW: Duration = Duration::from_secs(60);
const OPEN_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, PartialEq, Eq)]
enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerState {
    phase: BreakerPhase,
    consecutive_failures: u32,
    first_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            phase: BreakerPhase::Closed,
            consecutive_failures: 0,
            first_failure_at: None,
            opened_at: None,
        }
    }
}

pub struct Request<'a> {
    pub method: Method,
    pub path: &'a str,
    pub body: Option<Value>,
    pub access_token: &'a str,
}

pub struct ServiceGateway {
    client: reqwest::Client,
    base_urls: HashMap<Provider, String>,
    breakers: RwLock<HashMap<(Provider, String), BreakerState>>,
    semaphores: RwLock<HashMap<Provider, Arc<Semaphore>>>,
    per_target_limit: usize,
}

impl ServiceGateway {
    pub fn new(base_urls: HashMap<Provider, String>, per_target_limit: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_urls,
            breakers: RwLock::new(HashMap::new()),
            semaphores: RwLock::new(HashMap::new()),
            per_target_limit,
        }
    }

    async fn semaphore_for(&self, service: Provider) -> Arc<Semaphore> {
        let mut sems = self.semaphores.write().await;
        Arc::clone(
            sems.entry(service)
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_target_limit))),
        )
    }

    async fn breaker_allow(&self, service: Provider, installation_id: &str) -> Result<()> {
        let key = (service, installation_id.to_string());
        let mut breakers = self.breakers.write().await;
        let state = breakers.entry(key.clone()).or_default();
        match state.phase {
            BreakerPhase::Closed => Ok(()),
            BreakerPhase::Open => {
                if state.opened_at.map(|t| t.elapsed() >= OPEN_COOLDOWN).unwrap_or(false) {
                    state.phase = BreakerPhase::HalfOpen;
                    Ok(())
                } else {
                    Err(GatewayError::CircuitOpen {
                        service,
                        installation_id: installation_id.to_string(),
                    })
                }
            }
            BreakerPhase::HalfOpen => Ok(()),
        }
    }

    async fn breaker_report(&self, service: Provider, installation_id: &str, success: bool) {
        let key = (service, installation_id.to_string());
        let mut breakers = self.breakers.write().await;
        let state = breakers.entry(key).or_default();
        if success {
            *state = BreakerState::default();
            return;
        }
        let now = Instant::now();
        if state.first_failure_at.is_none() {
            state.first_failure_at = Some(now);
        }
        state.consecutive_failures += 1;
        let within_window = state
            .first_failure_at
            .map(|t| now.duration_since(t) <= FAILURE_WINDOW)
            .unwrap_or(true);
        if state.phase == BreakerPhase::HalfOpen
            || (state.consecutive_failures >= FAILURE_THRESHOLD && within_window)
        {
            state.phase = BreakerPhase::Open;
            state.opened_at = Some(now);
        }
    }

    /// Decorrelated jitter: delay = min(cap, uniform(base, prev*3)).
    fn next_delay(prev: Duration) -> Duration {
        let upper = (prev.as_millis() as u64 * 3).max(BASE_DELAY.as_millis() as u64);
        let jittered = rand::thread_rng().gen_range(BASE_DELAY.as_millis() as u64..=upper.max(BASE_DELAY.as_millis() as u64 + 1));
        Duration::from_millis(jittered).min(MAX_DELAY)
    }

    pub async fn call(&self, service: Provider, installation_id: &str, req: Request<'_>) -> Result<Value> {
        let _permit = self
            .semaphore_for(service)
            .await
            .acquire_owned()
            .await
            .expect("semaphore never closed");

        let base = self
            .base_urls
            .get(&service)
            .ok_or_else(|| GatewayError::BadRequest(format!("no base url configured for {service:?}")))?;
        let url = format!("{base}{}", req.path);

        let mut delay = BASE_DELAY;
        let mut last_err = GatewayError::Timeout;

        for attempt in 1..=MAX_ATTEMPTS {
            self.breaker_allow(service, installation_id).await?;

            let mut builder = self
                .client
                .request(req.method.clone(), &url)
                .bearer_auth(req.access_token);
            if let Some(body) = &req.body {
                builder = builder.json(body);
            }

            let outcome = builder.send().await;
            match outcome {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        self.breaker_report(service, installation_id, true).await;
                        return response
                            .json()
                            .await
                            .map_err(|e| GatewayError::ServiceUnavailable(e.to_string()));
                    }
                    self.breaker_report(service, installation_id, false).await;
                    last_err = classify_status(status);
                    if !is_retryable(status) || attempt == MAX_ATTEMPTS {
                        return Err(last_err);
                    }
                }
                Err(e) => {
                    self.breaker_report(service, installation_id, false).await;
                    last_err = if e.is_timeout() {
                        GatewayError::Timeout
                    } else {
                        GatewayError::ServiceUnavailable(e.to_string())
                    };
                    if attempt == MAX_ATTEMPTS {
                        return Err(last_err);
                    }
                }
            }

            tokio::time::sleep(delay).await;
            delay = Self::next_delay(delay);
        }

        Err(last_err)
    }
}

fn classify_status(status: StatusCode) -> GatewayError {
    match status {
        StatusCode::UNAUTHORIZED => GatewayError::AuthFailed,
        StatusCode::NOT_FOUND => GatewayError::NotFound,
        s if s.is_server_error() => GatewayError::ServiceUnavailable(s.to_string()),
        s => GatewayError::BadRequest(s.to_string()),
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn jitter_respects_cap() {
        let delay = ServiceGateway::next_delay(Duration::from_secs(100));
        assert!(delay <= MAX_DELAY);
    }

    #[test]
    fn classify_maps_known_statuses() {
        assert!(matches!(classify_status(StatusCode::UNAUTHORIZED), GatewayError::AuthFailed));
        assert!(matches!(classify_status(StatusCode::NOT_FOUND), GatewayError::NotFound));
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable(StatusCode::BAD_REQUEST));
    }

    fn gateway_for(server: &MockServer) -> ServiceGateway {
        let mut base_urls = HashMap::new();
        base_urls.insert(Provider::CodeForge, server.uri());
        ServiceGateway::new(base_urls, 4)
    }

    #[tokio::test]
    async fn call_retries_server_error_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "msg-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = gateway_for(&server);
        let response = gateway
            .call(
                Provider::CodeForge,
                "inst-1",
                Request {
                    method: Method::POST,
                    path: "/flaky",
                    body: Some(serde_json::json!({"body": "hi"})),
                    access_token: "tok",
                },
            )
            .await
            .unwrap();
        assert_eq!(response.get("id").and_then(|v| v.as_str()), Some("msg-1"));
    }

    #[tokio::test]
    async fn call_opens_breaker_after_persistent_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let gateway = gateway_for(&server);
        // MAX_ATTEMPTS (4) retried failures per call, FAILURE_THRESHOLD is 5:
        // two exhausted calls guarantee the breaker has tripped.
        for _ in 0..2 {
            let _ = gateway
                .call(
                    Provider::CodeForge,
                    "inst-2",
                    Request {
                        method: Method::POST,
                        path: "/down",
                        body: None,
                        access_token: "tok",
                    },
                )
                .await;
        }

        let result = gateway
            .call(
                Provider::CodeForge,
                "inst-2",
                Request {
                    method: Method::POST,
                    path: "/down",
                    body: None,
                    access_token: "tok",
                },
            )
            .await;
        assert!(matches!(result, Err(GatewayError::CircuitOpen { .. })));
    }
}
