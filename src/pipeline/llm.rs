//! Language-model calls: send a prompt, get a reply, turn it into a record.
//!
//! Model access sits behind the [`LanguageModel`] trait, so the stages do not
//! care whether the reply comes from a local Ollama server, a hosted
//! provider through `edgequake_llm`, or a scripted test double.
//!
//! ## Retry Strategy
//!
//! Only transport failures (connection refused, non-2xx, timeout) are
//! retried, with exponential backoff (`retry_backoff_ms * 2^attempt`). A reply
//! that arrives but is not JSON is never retried: at low temperature the same
//! prompt produces the same non-JSON answer. The default is no retries at all.

use crate::config::PipelineConfig;
use crate::error::{ModelError, PipelineError};
use crate::output::{RawFallback, StageOutput};
use crate::pipeline::parse;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

/// One non-streaming generation request.
#[derive(Debug, Clone, Copy)]
pub struct GenerateRequest<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    pub temperature: f32,
}

/// A text-in, text-out language model.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Return the complete reply text for `request`.
    ///
    /// Errors are always [`ModelError::Transport`] or
    /// [`ModelError::Timeout`]; reply content is never judged here.
    async fn generate(&self, request: &GenerateRequest<'_>) -> Result<String, ModelError>;
}

// ═══════════════════════════════════════════════════════════
// Ollama
// ═══════════════════════════════════════════════════════════

#[derive(Serialize)]
struct OllamaGenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct OllamaGenerateReply {
    #[serde(default)]
    response: String,
}

/// Client for Ollama's `POST /api/generate` endpoint.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: String,
    http: reqwest::Client,
}

impl OllamaClient {
    pub fn new(base_url: &str) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| PipelineError::Internal(format!("HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn transport(&self, model: &str, detail: impl Into<String>) -> ModelError {
        ModelError::Transport {
            model: model.to_string(),
            detail: detail.into(),
        }
    }
}

#[async_trait]
impl LanguageModel for OllamaClient {
    async fn generate(&self, request: &GenerateRequest<'_>) -> Result<String, ModelError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = OllamaGenerateBody {
            model: request.model,
            prompt: request.prompt,
            stream: false,
            options: OllamaOptions {
                temperature: request.temperature,
            },
        };

        let response = self.http.post(&url).json(&body).send().await.map_err(|e| {
            if e.is_connect() {
                self.transport(
                    request.model,
                    format!("Ollama is not reachable at {}: {}", self.base_url, e),
                )
            } else {
                self.transport(request.model, e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(self.transport(
                request.model,
                format!("HTTP {} from {}: {}", status, url, text.trim()),
            ));
        }

        let reply: OllamaGenerateReply = response.json().await.map_err(|e| {
            self.transport(request.model, format!("malformed generate response: {}", e))
        })?;
        Ok(reply.response)
    }
}

// ═══════════════════════════════════════════════════════════
// Hosted providers via edgequake_llm
// ═══════════════════════════════════════════════════════════

/// Routes calls through an `edgequake_llm` provider (`openai`, `anthropic`,
/// `gemini`, `ollama`, …). Credentials come from the provider's usual
/// environment variables.
///
/// One provider instance is built per model identifier and reused.
pub struct ProviderModel {
    provider_name: String,
    providers: Mutex<HashMap<String, Arc<dyn LLMProvider>>>,
}

impl ProviderModel {
    pub fn new(provider_name: impl Into<String>) -> Self {
        Self {
            provider_name: provider_name.into(),
            providers: Mutex::new(HashMap::new()),
        }
    }

    /// Build providers for `models` up front so a missing API key is
    /// reported before any image is processed.
    pub fn connect(provider_name: &str, models: &[&str]) -> Result<Self, PipelineError> {
        let mut providers = HashMap::new();
        for model in models {
            let provider = ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
                PipelineError::ProviderNotConfigured {
                    provider: provider_name.to_string(),
                    hint: format!("{e}"),
                }
            })?;
            providers.insert(model.to_string(), provider);
        }
        Ok(Self {
            provider_name: provider_name.to_string(),
            providers: Mutex::new(providers),
        })
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    fn provider_for(&self, model: &str) -> Result<Arc<dyn LLMProvider>, ModelError> {
        let mut cache = self.providers.lock().map_err(|_| ModelError::Transport {
            model: model.to_string(),
            detail: "provider cache lock poisoned".into(),
        })?;
        if let Some(provider) = cache.get(model) {
            return Ok(Arc::clone(provider));
        }
        let provider = ProviderFactory::create_llm_provider(&self.provider_name, model).map_err(
            |e| ModelError::Transport {
                model: model.to_string(),
                detail: format!("provider '{}' is not configured: {}", self.provider_name, e),
            },
        )?;
        cache.insert(model.to_string(), Arc::clone(&provider));
        Ok(provider)
    }
}

#[async_trait]
impl LanguageModel for ProviderModel {
    async fn generate(&self, request: &GenerateRequest<'_>) -> Result<String, ModelError> {
        let provider = self.provider_for(request.model)?;
        let messages = vec![ChatMessage::user(request.prompt)];
        let options = CompletionOptions {
            temperature: Some(request.temperature),
            ..Default::default()
        };

        let response = provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| ModelError::Transport {
                model: request.model.to_string(),
                detail: e.to_string(),
            })?;
        debug!(
            "{}/{}: {} input tokens, {} output tokens",
            self.provider_name, request.model, response.prompt_tokens, response.completion_tokens
        );
        Ok(response.content)
    }
}

// ═══════════════════════════════════════════════════════════
// Mock
// ═══════════════════════════════════════════════════════════

/// Scripted model for tests and offline runs.
///
/// Replies are keyed by model identifier; every call is recorded.
#[derive(Default)]
pub struct MockLanguageModel {
    replies: HashMap<String, Result<String, String>>,
    delay: Option<Duration>,
    fail_first: u32,
    attempts: AtomicU32,
    calls: Mutex<Vec<(String, String)>>,
}

impl MockLanguageModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every request for `model` with `reply`.
    pub fn with_reply(mut self, model: impl Into<String>, reply: impl Into<String>) -> Self {
        self.replies.insert(model.into(), Ok(reply.into()));
        self
    }

    /// Fail every request for `model` with a transport error.
    pub fn with_transport_failure(
        mut self,
        model: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        self.replies.insert(model.into(), Err(detail.into()));
        self
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the first `n` calls (any model) with a transport error.
    pub fn failing_first(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    /// `(model, prompt)` for every call so far, in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LanguageModel for MockLanguageModel {
    async fn generate(&self, request: &GenerateRequest<'_>) -> Result<String, ModelError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((request.model.to_string(), request.prompt.to_string()));
        }
        if let Some(delay) = self.delay {
            sleep(delay).await;
        }
        let transport = |detail: &str| ModelError::Transport {
            model: request.model.to_string(),
            detail: detail.to_string(),
        };
        if self.attempts.fetch_add(1, Ordering::SeqCst) < self.fail_first {
            return Err(transport("scripted transient failure"));
        }
        match self.replies.get(request.model) {
            Some(Ok(reply)) => Ok(reply.clone()),
            Some(Err(detail)) => Err(transport(detail)),
            None => Err(transport("no scripted reply for this model")),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Calling
// ═══════════════════════════════════════════════════════════

/// Call `client` with the configured timeout and transport retries.
pub async fn call_model(
    client: &dyn LanguageModel,
    request: &GenerateRequest<'_>,
    config: &PipelineConfig,
) -> Result<String, ModelError> {
    let start = Instant::now();
    let mut last_err: Option<ModelError> = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let backoff = config
                .retry_backoff_ms
                .saturating_mul(1u64 << (attempt - 1).min(16));
            warn!(
                "{}: retry {}/{} after {}ms",
                request.model, attempt, config.max_retries, backoff
            );
            sleep(Duration::from_millis(backoff)).await;
        }

        let result = match config.api_timeout_secs {
            Some(secs) => match timeout(Duration::from_secs(secs), client.generate(request)).await {
                Ok(r) => r,
                Err(_) => Err(ModelError::Timeout {
                    model: request.model.to_string(),
                    secs,
                }),
            },
            None => client.generate(request).await,
        };

        match result {
            Ok(reply) => {
                debug!(
                    "{}: {} chars in {:?}",
                    request.model,
                    reply.len(),
                    start.elapsed()
                );
                return Ok(reply);
            }
            Err(e) if e.is_transport() => {
                warn!("{}: attempt {} failed: {}", request.model, attempt + 1, e);
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| ModelError::Transport {
        model: request.model.to_string(),
        detail: "no attempt was made".into(),
    }))
}

/// Call the model and parse its reply into `T`.
///
/// Never fails: transport errors and unparseable replies both come back as
/// [`StageOutput::Fallback`].
pub async fn request_record<T: DeserializeOwned>(
    client: &dyn LanguageModel,
    request: &GenerateRequest<'_>,
    config: &PipelineConfig,
) -> StageOutput<T> {
    match call_model(client, request, config).await {
        Ok(reply) => {
            let output = parse::parse_reply(request.model, &reply);
            if let StageOutput::Fallback(fb) = &output {
                warn!("{}", fb.error);
            }
            output
        }
        Err(e) => {
            warn!("{}", e);
            StageOutput::Fallback(RawFallback::from_transport(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::AnalysisRecord;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn request<'a>(model: &'a str, prompt: &'a str) -> GenerateRequest<'a> {
        GenerateRequest {
            model,
            prompt,
            temperature: 0.2,
        }
    }

    /// Serve one canned HTTP response and hand back the raw request.
    async fn serve_once(
        status: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf);
                if let Some(end) = text.find("\r\n\r\n") {
                    let content_length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + content_length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&buf).to_string()
        });
        (format!("http://{}", addr), handle)
    }

    #[tokio::test]
    async fn ollama_client_posts_non_streaming_request() {
        let (url, server) = serve_once(
            "200 OK",
            r#"{"model":"gemma:2b","response":"{\"summary\":\"fine\"}","done":true}"#,
        )
        .await;
        let client = OllamaClient::new(&url).unwrap();
        let reply = client.generate(&request("gemma:2b", "hello")).await.unwrap();
        assert_eq!(reply, r#"{"summary":"fine"}"#);

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /api/generate"));
        assert!(raw.contains(r#""stream":false"#));
        assert!(raw.contains(r#""model":"gemma:2b""#));
        assert!(raw.contains(r#""temperature":0.2"#));
    }

    #[tokio::test]
    async fn ollama_missing_response_field_is_empty_reply() {
        let (url, _server) = serve_once("200 OK", r#"{"done":true}"#).await;
        let client = OllamaClient::new(&url).unwrap();
        assert_eq!(client.generate(&request("m", "p")).await.unwrap(), "");
    }

    #[tokio::test]
    async fn ollama_http_error_is_transport() {
        let (url, _server) =
            serve_once("404 Not Found", r#"{"error":"model 'x' not found"}"#).await;
        let client = OllamaClient::new(&url).unwrap();
        let err = client.generate(&request("x", "p")).await.unwrap_err();
        assert!(err.is_transport());
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn ollama_connection_refused_is_transport() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = OllamaClient::new(&format!("http://{}", addr)).unwrap();
        let err = client.generate(&request("m", "p")).await.unwrap_err();
        assert!(matches!(err, ModelError::Transport { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn mock_records_calls() {
        let mock = MockLanguageModel::new().with_reply("a", "{}");
        mock.generate(&request("a", "first")).await.unwrap();
        assert!(mock.generate(&request("b", "second")).await.is_err());
        assert_eq!(
            mock.calls(),
            vec![
                ("a".to_string(), "first".to_string()),
                ("b".to_string(), "second".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn call_model_retries_transport_failures() {
        let mock = MockLanguageModel::new()
            .with_reply("m", "ok")
            .failing_first(2);
        let config = PipelineConfig::builder()
            .max_retries(2)
            .retry_backoff_ms(1)
            .build()
            .unwrap();
        assert_eq!(call_model(&mock, &request("m", "p"), &config).await.unwrap(), "ok");
        assert_eq!(mock.calls().len(), 3);
    }

    #[tokio::test]
    async fn call_model_without_retries_fails_once() {
        let mock = MockLanguageModel::new().with_reply("m", "ok").failing_first(1);
        let config = PipelineConfig::default();
        assert!(call_model(&mock, &request("m", "p"), &config).await.is_err());
        assert_eq!(mock.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn call_model_times_out() {
        let mock = MockLanguageModel::new()
            .with_reply("slow", "{}")
            .with_delay(Duration::from_secs(30));
        let config = PipelineConfig::builder().api_timeout_secs(5).build().unwrap();
        let err = call_model(&mock, &request("slow", "p"), &config).await.unwrap_err();
        assert_eq!(
            err,
            ModelError::Timeout {
                model: "slow".into(),
                secs: 5
            }
        );
    }

    #[tokio::test]
    async fn request_record_wraps_transport_failure() {
        let mock = MockLanguageModel::new().with_transport_failure("m", "connection refused");
        let out: StageOutput<AnalysisRecord> =
            request_record(&mock, &request("m", "p"), &PipelineConfig::default()).await;
        let fb = out.fallback().expect("fallback");
        assert!(fb.raw.contains("connection refused"));
        assert!(fb.error.is_transport());
    }

    #[tokio::test]
    async fn request_record_parses_reply() {
        let mock = MockLanguageModel::new().with_reply("m", "Sure! {\"summary\": \"normal\"}");
        let out: StageOutput<AnalysisRecord> =
            request_record(&mock, &request("m", "p"), &PipelineConfig::default()).await;
        assert_eq!(out.parsed().unwrap().summary.as_deref(), Some("normal"));
    }
}
