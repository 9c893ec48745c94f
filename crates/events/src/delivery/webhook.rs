//! Signed webhook delivery with bounded retry.
//!
//! [`WebhookDelivery`] POSTs the canonical JSON encoding of a payload and,
//! when a shared secret is configured, signs it with
//! `X-Webhook-Signature: sha256=<hex>`. Up to three attempts are made:
//!
//! - 5xx responses and transport errors wait `2^attempt` seconds (1s, 2s);
//! - timeouts are retried immediately;
//! - 4xx responses are final.
//!
//! Failures are logged and reported as a [`DeliveryOutcome`], never as an
//! error, so a dead webhook never fails the job that triggered it.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use studio_core::signing::{canonical_json, signature_header, SIGNATURE_HEADER};

/// Attempts per delivery, including the first.
pub const MAX_ATTEMPTS: u32 = 3;

/// Total time allowed for one attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Time allowed to establish the connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Wait before the first retry; doubles per attempt.
const RETRY_BASE: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Error type for a single delivery attempt.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The underlying HTTP request failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The remote server returned a non-success status code.
    #[error("Webhook returned HTTP {0}")]
    HttpStatus(u16),

    /// The payload could not be encoded.
    #[error("Failed to encode webhook payload: {0}")]
    Encode(#[from] serde_json::Error),
}

impl WebhookError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, WebhookError::Request(e) if e.is_timeout())
    }

    /// Server errors and transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            WebhookError::Request(_) => true,
            WebhookError::HttpStatus(status) => *status >= 500,
            WebhookError::Encode(_) => false,
        }
    }
}

/// How a delivery ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The receiver answered 2xx/3xx.
    Delivered { status: u16, attempts: u32 },
    /// The receiver answered 4xx; not retried.
    Rejected { status: u16 },
    /// Every attempt failed, or the payload could not be encoded.
    Exhausted { attempts: u32, last_error: String },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

// ---------------------------------------------------------------------------
// WebhookDelivery
// ---------------------------------------------------------------------------

/// Delivers job results to caller-supplied webhook URLs.
#[derive(Clone)]
pub struct WebhookDelivery {
    client: reqwest::Client,
    secret: Option<String>,
    retry_base: Duration,
}

impl WebhookDelivery {
    /// Create a delivery service. An empty secret is treated as none.
    pub fn new(secret: Option<String>) -> Result<Self, WebhookError> {
        Ok(Self {
            client: build_client(REQUEST_TIMEOUT)?,
            secret: secret.filter(|s| !s.is_empty()),
            retry_base: RETRY_BASE,
        })
    }

    /// Override the per-attempt timeout (default 60s).
    pub fn with_request_timeout(mut self, timeout: Duration) -> Result<Self, WebhookError> {
        self.client = build_client(timeout)?;
        Ok(self)
    }

    /// Override the first retry wait. Later waits still double.
    pub fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    pub fn is_signing(&self) -> bool {
        self.secret.is_some()
    }

    /// Deliver `payload` to `url`, retrying per the module policy.
    pub async fn deliver<T: Serialize + ?Sized>(&self, url: &str, payload: &T) -> DeliveryOutcome {
        let body = match canonical_json(payload) {
            Ok(body) => body,
            Err(e) => {
                let err = WebhookError::from(e);
                tracing::error!(url, error = %err, "Webhook payload could not be encoded");
                return DeliveryOutcome::Exhausted {
                    attempts: 0,
                    last_error: err.to_string(),
                };
            }
        };

        let signature = match self.secret.as_deref() {
            Some(secret) => Some(signature_header(secret, &body)),
            None => {
                tracing::warn!(url, "WEBHOOK_SECRET not configured, sending webhook unsigned");
                None
            }
        };

        let mut last_error = String::new();

        for attempt in 0..MAX_ATTEMPTS {
            tracing::info!(
                url,
                attempt = attempt + 1,
                max_attempts = MAX_ATTEMPTS,
                "Sending webhook",
            );

            let err = match self.try_send(url, &body, signature.as_deref()).await {
                Ok(status) => {
                    tracing::info!(url, status, "Webhook delivered");
                    return DeliveryOutcome::Delivered {
                        status,
                        attempts: attempt + 1,
                    };
                }
                Err(err) => err,
            };

            if let WebhookError::HttpStatus(status) = err {
                if !err.is_retryable() {
                    tracing::error!(url, status, "Webhook rejected by receiver");
                    return DeliveryOutcome::Rejected { status };
                }
            }

            last_error = err.to_string();
            if attempt + 1 == MAX_ATTEMPTS {
                break;
            }

            if err.is_timeout() {
                tracing::warn!(url, attempt = attempt + 1, "Webhook timed out, retrying");
                continue;
            }

            let wait = self.retry_base * 2u32.pow(attempt);
            tracing::warn!(
                url,
                attempt = attempt + 1,
                wait_ms = wait.as_millis() as u64,
                error = %err,
                "Webhook delivery attempt failed, retrying",
            );
            tokio::time::sleep(wait).await;
        }

        tracing::error!(
            url,
            attempts = MAX_ATTEMPTS,
            error = %last_error,
            "Webhook delivery failed after all retries",
        );
        DeliveryOutcome::Exhausted {
            attempts: MAX_ATTEMPTS,
            last_error,
        }
    }

    /// Execute a single POST request and check the response status.
    async fn try_send(
        &self,
        url: &str,
        body: &str,
        signature: Option<&str>,
    ) -> Result<u16, WebhookError> {
        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_owned());
        if let Some(signature) = signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() || status.is_redirection() {
            Ok(status.as_u16())
        } else {
            Err(WebhookError::HttpStatus(status.as_u16()))
        }
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, WebhookError> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(CONNECT_TIMEOUT.min(timeout))
        .build()?;
    Ok(client)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use assert_matches::assert_matches;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use serde_json::json;
    use studio_core::signing::verify_signature;

    use super::*;

    #[derive(Debug, Clone)]
    struct Received {
        signature: Option<String>,
        content_type: Option<String>,
        body: String,
    }

    #[derive(Clone, Default)]
    struct Hook {
        received: Arc<Mutex<Vec<Received>>>,
        statuses: Arc<Mutex<VecDeque<u16>>>,
        /// Delay before answering, per request, in order.
        delays: Arc<Mutex<VecDeque<Duration>>>,
    }

    async fn record(State(hook): State<Hook>, headers: HeaderMap, body: String) -> StatusCode {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        hook.received.lock().unwrap().push(Received {
            signature: header(SIGNATURE_HEADER),
            content_type: header("content-type"),
            body,
        });
        let delay = hook.delays.lock().unwrap().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let code = hook.statuses.lock().unwrap().pop_front().unwrap_or(200);
        StatusCode::from_u16(code).unwrap()
    }

    /// Serve a throwaway receiver answering with `statuses` in order, then 200.
    async fn spawn_receiver(statuses: &[u16]) -> (String, Hook) {
        spawn_slow_receiver(statuses, &[]).await
    }

    /// Like [`spawn_receiver`], sleeping `delays[i]` before answering request `i`.
    async fn spawn_slow_receiver(statuses: &[u16], delays: &[Duration]) -> (String, Hook) {
        let hook = Hook::default();
        hook.statuses.lock().unwrap().extend(statuses.iter().copied());
        hook.delays.lock().unwrap().extend(delays.iter().copied());

        let app = Router::new()
            .route("/hook", post(record))
            .with_state(hook.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}/hook"), hook)
    }

    fn delivery(secret: Option<&str>) -> WebhookDelivery {
        WebhookDelivery::new(secret.map(str::to_string))
            .unwrap()
            .with_retry_base(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn signed_payload_verifies_against_canonical_body() {
        let (url, hook) = spawn_receiver(&[]).await;
        let payload = json!({"studio_id": "s1", "status": "completed", "id": "s1"});

        let outcome = delivery(Some("shh")).deliver(&url, &payload).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { status: 200, attempts: 1 });

        let received = hook.received.lock().unwrap().clone();
        assert_eq!(received.len(), 1);
        let hit = &received[0];
        assert_eq!(hit.body, r#"{"id": "s1", "status": "completed", "studio_id": "s1"}"#);
        assert_eq!(hit.content_type.as_deref(), Some("application/json"));
        let signature = hit.signature.as_deref().unwrap();
        assert!(verify_signature("shh", &hit.body, signature));
    }

    #[tokio::test]
    async fn missing_secret_sends_unsigned() {
        let (url, hook) = spawn_receiver(&[]).await;
        let sender = delivery(Some(""));
        assert!(!sender.is_signing());

        assert!(sender.deliver(&url, &json!({"a": 1})).await.is_delivered());
        assert!(hook.received.lock().unwrap()[0].signature.is_none());
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let (url, hook) = spawn_receiver(&[500, 502]).await;

        let outcome = delivery(None).deliver(&url, &json!({"a": 1})).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { status: 200, attempts: 3 });
        assert_eq!(hook.received.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn timeouts_are_retried_without_waiting() {
        let (url, hook) = spawn_slow_receiver(&[], &[Duration::from_secs(2)]).await;
        let retry_base = Duration::from_secs(5);
        let sender = WebhookDelivery::new(None)
            .unwrap()
            .with_retry_base(retry_base)
            .with_request_timeout(Duration::from_millis(200))
            .unwrap();

        let start = std::time::Instant::now();
        let outcome = sender.deliver(&url, &json!({"a": 1})).await;

        assert_eq!(outcome, DeliveryOutcome::Delivered { status: 200, attempts: 2 });
        assert!(start.elapsed() < retry_base, "waited {:?}", start.elapsed());
        assert_eq!(hook.received.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (url, hook) = spawn_receiver(&[404]).await;

        let outcome = delivery(None).deliver(&url, &json!({"a": 1})).await;
        assert_eq!(outcome, DeliveryOutcome::Rejected { status: 404 });
        assert_eq!(hook.received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn persistent_server_errors_exhaust_the_budget() {
        let (url, hook) = spawn_receiver(&[503, 503, 503, 503]).await;

        let outcome = delivery(None).deliver(&url, &json!({"a": 1})).await;
        assert_matches!(outcome, DeliveryOutcome::Exhausted { attempts: 3, ref last_error } if last_error.contains("503"));
        assert_eq!(hook.received.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unreachable_receiver_is_swallowed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let outcome = delivery(None)
            .deliver(&format!("http://{addr}/hook"), &json!({"a": 1}))
            .await;
        assert_matches!(outcome, DeliveryOutcome::Exhausted { attempts: 3, .. });
    }

    #[test]
    fn webhook_error_display_http_status() {
        let err = WebhookError::HttpStatus(502);
        assert_eq!(err.to_string(), "Webhook returned HTTP 502");
        assert!(err.is_retryable());
        assert!(!WebhookError::HttpStatus(422).is_retryable());
    }
}
