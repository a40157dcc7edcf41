//! Inference Client: a stage-agnostic chat-completion primitive with a
//! bounded retry policy and classified failures.
//!
//! One primitive, [`InferenceClient::call`], is reused for every stage of
//! the resolution pipeline (structured image extraction, OCR transcription,
//! text code suggestion). Failures are classified and retried:
//!
//! - rate-limited → wait the server-suggested delay (structured
//!   `Retry-After` first, message patterns second, fixed default last),
//!   plus jitter
//! - timeout / connection / 5xx / empty body → exponential backoff + jitter
//! - 4xx other than 429 → fail immediately, no retry
//!
//! At most `max_retries` retries per call; exhaustion surfaces a terminal
//! [`InferenceError`] distinguishing "try later" from "unsupported
//! request". A process-wide single-permit gate bounds concurrent calls so
//! parallel requests cannot stampede the provider.

use async_trait::async_trait;
use base64::Engine as _;
use rand::Rng;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::InferenceConfig;

/// Process-wide bound on simultaneous in-flight inference calls.
static INFLIGHT: Semaphore = Semaphore::const_new(1);

/// A single chat-style request: system instruction plus user content,
/// optionally carrying inline image data and a JSON response constraint.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub user_text: String,
    pub image_jpeg_b64: Option<String>,
    pub json_response: bool,
}

impl ChatRequest {
    pub fn text(system: impl Into<String>, user_text: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user_text: user_text.into(),
            image_jpeg_b64: None,
            json_response: false,
        }
    }

    pub fn image(system: impl Into<String>, user_text: impl Into<String>, jpeg: &[u8]) -> Self {
        Self {
            system: system.into(),
            user_text: user_text.into(),
            image_jpeg_b64: Some(base64::engine::general_purpose::STANDARD.encode(jpeg)),
            json_response: false,
        }
    }

    pub fn expect_json(mut self) -> Self {
        self.json_response = true;
        self
    }
}

/// One failed backend call, classified for the retry policy.
#[derive(Debug, Clone)]
pub enum CallFailure {
    RateLimited {
        /// Structured delay from a `Retry-After` header, when the server
        /// sent one.
        retry_after: Option<Duration>,
        message: String,
    },
    Timeout(String),
    Connect(String),
    Status { code: u16, message: String },
    Empty,
    Other(String),
}

/// Terminal inference failure, surfaced to the caller only after the
/// retry budget is spent (or immediately for non-retryable requests).
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("rate limit still active after {attempts} attempts: {message}")]
    RateLimitExhausted { attempts: u32, message: String },
    #[error("timed out after {attempts} attempts: {message}")]
    TimeoutExhausted { attempts: u32, message: String },
    #[error("server errors persisted after {attempts} attempts: {message}")]
    ServerExhausted { attempts: u32, message: String },
    #[error("request rejected by provider ({status}): {message}")]
    Client { status: u16, message: String },
    #[error("inference provider is disabled")]
    Disabled,
    #[error("{0}")]
    Other(String),
}

impl InferenceError {
    /// Critical failures abort all remaining resolution passes: retrying
    /// the whole pipeline cannot help a spent rate limit, a dead network,
    /// or a request the provider refuses outright.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            InferenceError::RateLimitExhausted { .. }
                | InferenceError::TimeoutExhausted { .. }
                | InferenceError::Client { .. }
        )
    }
}

/// Transport behind the retry engine. The HTTP implementation talks to an
/// OpenAI-compatible endpoint; tests substitute scripted doubles.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<String, CallFailure>;
}

/// Injection point for backoff sleeps so tests can record them instead of
/// waiting.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Parse a server-suggested wait out of a rate-limit error message.
/// Preference order: seconds, milliseconds, minutes. This is a fragile
/// contract on the provider's wording; the structured `Retry-After` value
/// is always preferred when present.
pub fn parse_retry_after_message(message: &str) -> Option<Duration> {
    static SECS: OnceLock<Regex> = OnceLock::new();
    static MILLIS: OnceLock<Regex> = OnceLock::new();
    static MINS: OnceLock<Regex> = OnceLock::new();
    let secs = SECS.get_or_init(|| Regex::new(r"(?i)try again in (\d+(?:\.\d+)?)s").unwrap());
    let millis = MILLIS.get_or_init(|| Regex::new(r"(?i)try again in (\d+(?:\.\d+)?)ms").unwrap());
    let mins = MINS.get_or_init(|| Regex::new(r"(?i)try again in (\d+(?:\.\d+)?)m").unwrap());

    let parse = |caps: regex::Captures<'_>| caps[1].parse::<f64>().ok();
    if let Some(v) = secs.captures(message).and_then(parse) {
        return Some(Duration::from_secs_f64(v));
    }
    if let Some(v) = millis.captures(message).and_then(parse) {
        return Some(Duration::from_secs_f64(v / 1000.0));
    }
    if let Some(v) = mins.captures(message).and_then(parse) {
        return Some(Duration::from_secs_f64(v * 60.0));
    }
    None
}

fn jitter() -> Duration {
    Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..1.0))
}

/// The retry engine around a [`ChatBackend`].
pub struct InferenceClient {
    backend: Option<Arc<dyn ChatBackend>>,
    max_retries: u32,
    rate_limit_wait: Duration,
    backoff_base: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl InferenceClient {
    /// Build from configuration: the HTTP backend for `openai`, or a
    /// disabled client whose calls fail fast without retries.
    pub fn from_config(config: &InferenceConfig) -> Self {
        let backend: Option<Arc<dyn ChatBackend>> = if config.is_enabled() {
            Some(Arc::new(HttpBackend::new(config)))
        } else {
            None
        };
        Self {
            backend,
            max_retries: config.max_retries,
            rate_limit_wait: Duration::from_secs(config.rate_limit_wait_secs),
            backoff_base: Duration::from_secs(config.backoff_base_secs),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Wire an explicit backend and sleeper (tests, alternative providers).
    pub fn with_backend(
        backend: Arc<dyn ChatBackend>,
        config: &InferenceConfig,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            backend: Some(backend),
            max_retries: config.max_retries,
            rate_limit_wait: Duration::from_secs(config.rate_limit_wait_secs),
            backoff_base: Duration::from_secs(config.backoff_base_secs),
            sleeper,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Run one stage call with bounded retries. `stage` only labels logs.
    pub async fn call(&self, stage: &str, request: &ChatRequest) -> Result<String, InferenceError> {
        let Some(backend) = &self.backend else {
            return Err(InferenceError::Disabled);
        };

        let attempts = self.max_retries + 1;
        let mut last: Option<CallFailure> = None;

        for attempt in 1..=attempts {
            info!(stage, attempt, attempts, "inference call");

            let result = {
                let _permit = INFLIGHT.acquire().await.expect("inference gate closed");
                backend.complete(request).await
            };

            let failure = match result {
                Ok(content) => {
                    let content = content.trim();
                    if content.is_empty() {
                        CallFailure::Empty
                    } else {
                        return Ok(content.to_string());
                    }
                }
                Err(failure) => failure,
            };

            // Non-retryable client errors short-circuit the whole budget.
            if let CallFailure::Status { code, message } = &failure {
                if (400..500).contains(code) && *code != 429 {
                    warn!(stage, code, "inference request rejected, not retrying");
                    return Err(InferenceError::Client {
                        status: *code,
                        message: message.clone(),
                    });
                }
            }

            if attempt < attempts {
                let wait = match &failure {
                    CallFailure::RateLimited {
                        retry_after,
                        message,
                    } => retry_after
                        .or_else(|| parse_retry_after_message(message))
                        .unwrap_or(self.rate_limit_wait),
                    _ => self.backoff_base * 2u32.pow(attempt - 1),
                };
                let wait = wait + jitter();
                warn!(stage, attempt, wait_secs = wait.as_secs_f64(), "inference call failed, backing off");
                self.sleeper.sleep(wait).await;
            }

            last = Some(failure);
        }

        Err(match last.expect("at least one attempt ran") {
            CallFailure::RateLimited { message, .. } => InferenceError::RateLimitExhausted {
                attempts,
                message,
            },
            CallFailure::Timeout(message) | CallFailure::Connect(message) => {
                InferenceError::TimeoutExhausted { attempts, message }
            }
            CallFailure::Status { message, .. } => InferenceError::ServerExhausted {
                attempts,
                message,
            },
            CallFailure::Empty => InferenceError::Other(format!(
                "no content in response after {} attempts",
                attempts
            )),
            CallFailure::Other(message) => InferenceError::Other(message),
        })
    }
}

// ============ HTTP backend (OpenAI-compatible) ============

/// Chat-completions transport for any OpenAI-compatible endpoint.
/// The API key comes from `OPENAI_API_KEY` at call time.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl HttpBackend {
    pub fn new(config: &InferenceConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: config.base_url.clone(),
            model: config.model.clone(),
        }
    }

    fn endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else if base.ends_with("/v1") {
            format!("{}/chat/completions", base)
        } else {
            format!("{}/v1/chat/completions", base)
        }
    }

    fn body(&self, request: &ChatRequest) -> serde_json::Value {
        let user_content = match &request.image_jpeg_b64 {
            Some(b64) => serde_json::json!([
                { "type": "text", "text": request.user_text },
                { "type": "image_url",
                  "image_url": { "url": format!("data:image/jpeg;base64,{}", b64) } }
            ]),
            None => serde_json::Value::String(request.user_text.clone()),
        };
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": user_content }
            ],
            "temperature": 0.0,
        });
        if request.json_response {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }
        body
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn complete(&self, request: &ChatRequest) -> Result<String, CallFailure> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| CallFailure::Other("OPENAI_API_KEY not set".to_string()))?;

        let response = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CallFailure::Timeout(e.to_string())
                } else if e.is_connect() {
                    CallFailure::Connect(e.to_string())
                } else {
                    CallFailure::Other(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<f64>().ok())
                .map(Duration::from_secs_f64);
            let message = response.text().await.unwrap_or_default();
            return Err(CallFailure::RateLimited {
                retry_after,
                message,
            });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CallFailure::Status {
                code: status.as_u16(),
                message,
            });
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|_| CallFailure::Empty)?;
        let content = json["choices"]
            .get(0)
            .and_then(|c| c["message"]["content"].as_str())
            .unwrap_or("");
        if content.trim().is_empty() {
            return Err(CallFailure::Empty);
        }
        Ok(content.to_string())
    }
}
