use crate::{config::env_parse, models::ApiError};
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

const KEY_HEADER: &str = "X-Control-Key";

#[derive(Clone)]
pub struct AuthState {
    operators: Arc<HashMap<String, OperatorContext>>,
    limiter: Arc<TokenBuckets>,
}

/// Who is driving the control surface, attached to authenticated requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorContext {
    pub operator_id: String,
    pub key_id: String,
}

impl AuthState {
    pub fn from_env() -> Self {
        let raw = env::var("CONTROL_API_KEYS").unwrap_or_default();
        Self {
            operators: Arc::new(load_keys(&raw)),
            limiter: Arc::new(TokenBuckets::from_env()),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<OperatorContext> {
        self.operators.get(presented).cloned()
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(error_response(
            StatusCode::UNAUTHORIZED,
            "missing_api_key",
            "Provide X-Control-Key or Bearer token",
        ));
    };

    let Some(context) = state.authenticate(&presented) else {
        return Ok(error_response(
            StatusCode::UNAUTHORIZED,
            "invalid_api_key",
            "Key not recognized",
        ));
    };

    match state.limiter.consume(&context.operator_id).await {
        Ok(permit) => {
            request.extensions_mut().insert(context);
            let mut response = next.run(request).await;
            permit.apply_headers(response.headers_mut());
            Ok(response)
        }
        Err(exceeded) => {
            let mut response = error_response(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "Too many requests",
            );
            exceeded.apply_headers(response.headers_mut());
            Ok(response)
        }
    }
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get(KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (status, Json(payload)).into_response()
}

/// Parses `operator:key` pairs separated by commas. With no usable pair the
/// local development key is installed.
fn load_keys(raw: &str) -> HashMap<String, OperatorContext> {
    let mut entries = HashMap::new();
    for (idx, token) in raw.split(',').enumerate() {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(2, ':');
        let operator = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let key = parts.next().map(str::trim).filter(|s| !s.is_empty());
        match (operator, key) {
            (Some(operator), Some(secret)) => {
                entries.insert(
                    secret.to_string(),
                    OperatorContext {
                        operator_id: operator.to_string(),
                        key_id: format!("key-{:02}", idx + 1),
                    },
                );
            }
            _ => warn!(
                target = "catalog.api",
                "ignored malformed CONTROL_API_KEYS entry at position {}",
                idx + 1
            ),
        }
    }

    if entries.is_empty() {
        warn!(
            target = "catalog.api",
            "CONTROL_API_KEYS produced no keys; falling back to the local key"
        );
        entries.insert(
            "local-key".to_string(),
            OperatorContext {
                operator_id: "local".to_string(),
                key_id: "key-01".to_string(),
            },
        );
    } else {
        info!(
            target = "catalog.api",
            key_count = entries.len(),
            "loaded control keys from env"
        );
    }

    entries
}

struct TokenBuckets {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Mutex<HashMap<String, BucketState>>,
}

impl TokenBuckets {
    fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            rate_per_sec,
            capacity,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn from_env() -> Self {
        Self::new(
            env_parse::<f64>("RATE_LIMIT_PER_SEC")
                .filter(|value| *value > 0.0)
                .unwrap_or(5.0),
            env_parse::<f64>("RATE_LIMIT_CAPACITY")
                .filter(|value| *value >= 1.0)
                .unwrap_or(10.0),
        )
    }

    async fn consume(&self, key: &str) -> Result<RatePermit, RateExceeded> {
        let mut guard = self.buckets.lock().await;
        let now = Instant::now();
        let state = guard.entry(key.to_string()).or_insert_with(|| BucketState {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            state.last_refill = now;
        }

        let window = Window {
            capacity: self.capacity,
            tokens: state.tokens,
            rate: self.rate_per_sec,
        };
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(RatePermit(Window {
                tokens: state.tokens,
                ..window
            }))
        } else {
            let retry_after = ((1.0 - state.tokens) / self.rate_per_sec).max(0.0);
            Err(RateExceeded {
                retry_after,
                window,
            })
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    capacity: f64,
    tokens: f64,
    rate: f64,
}

impl Window {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let remaining = self.tokens.max(0.0).floor() as u64;
        let reset = ((self.capacity - self.tokens) / self.rate).ceil().max(0.0) as u64;
        insert_number(headers, "X-RateLimit-Limit", self.capacity as u64);
        insert_number(headers, "X-RateLimit-Remaining", remaining);
        insert_number(headers, "X-RateLimit-Reset", reset);
    }
}

#[derive(Debug, Clone)]
struct RatePermit(Window);

impl RatePermit {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        self.0.apply_headers(headers);
    }
}

#[derive(Debug, Clone)]
struct RateExceeded {
    retry_after: f64,
    window: Window,
}

impl RateExceeded {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        self.window.apply_headers(headers);
        headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
        let retry = self.retry_after.ceil().max(1.0) as u64;
        headers.insert(http::header::RETRY_AFTER, HeaderValue::from(retry));
    }
}

fn insert_number(headers: &mut http::HeaderMap, name: &'static str, value: u64) {
    headers.insert(name, HeaderValue::from(value));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_operator_keys_and_skips_malformed() {
        let keys = load_keys("ops:abc, broken ,:nokey, qa : def");
        assert_eq!(keys.len(), 2);
        assert_eq!(keys["abc"].operator_id, "ops");
        assert_eq!(keys["def"].operator_id, "qa");
        assert_eq!(keys["def"].key_id, "key-04");
    }

    #[test]
    fn empty_key_list_falls_back_to_local_key() {
        let keys = load_keys("");
        assert_eq!(keys["local-key"].operator_id, "local");
    }

    #[test]
    fn bearer_token_wins_over_header() {
        let mut headers = http::HeaderMap::new();
        headers.insert(KEY_HEADER, HeaderValue::from_static(" header-key "));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("header-key"));
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer bearer-key"),
        );
        assert_eq!(extract_api_key(&headers).as_deref(), Some("bearer-key"));
        assert!(extract_api_key(&http::HeaderMap::new()).is_none());
    }

    #[tokio::test]
    async fn bucket_rejects_after_capacity() {
        let buckets = TokenBuckets::new(0.001, 2.0);
        assert!(buckets.consume("ops").await.is_ok());
        assert!(buckets.consume("ops").await.is_ok());
        let exceeded = buckets.consume("ops").await.unwrap_err();
        let mut headers = http::HeaderMap::new();
        exceeded.apply_headers(&mut headers);
        assert_eq!(headers["X-RateLimit-Remaining"], "0");
        assert!(headers.contains_key(http::header::RETRY_AFTER));
        assert!(buckets.consume("other").await.is_ok());
    }
}
