//! The generation gateway.
//!
//! The only path by which the completion capability is reached. Every call
//! acquires a rate-limit token, runs under the retry policy, and on success
//! records a usage row, token metrics, and a latency-histogram sample.
//! Prompt shaping (system prompts, patterns injection, fence stripping)
//! comes from `brainloop_core::generation`.

use std::time::Duration;

use async_trait::async_trait;
use brainloop_core::generation::{
    code_system_prompt, digest_system_prompt, strip_code_fences, validate_generated,
    GenerationError, GenerationRequest, GenerationResult, Generator,
};
use brainloop_core::ratelimit::{retry_with_backoff, RateLimiter, RetryConfig, RetryError};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::metrics::Histogram;
use crate::storage::{LifecycleStore, OutputStore};

/// Wall-clock budget for one completion request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Default completion model.
pub const DEFAULT_MODEL: &str = "zai-glm-4.6";

/// Default completion endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.cerebras.ai/v1";

const MAX_TOKENS: i64 = 8000;

/// HTTP implementation of the completion capability.
pub struct HttpGenerator {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
}

#[derive(serde::Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: i64,
    stream: bool,
}

#[derive(serde::Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
}

impl HttpGenerator {
    /// # Errors
    ///
    /// `Fatal` when the HTTP client cannot be constructed.
    pub fn new(base_url: &str, api_key: SecretString, model: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Fatal(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> std::result::Result<GenerationResult, GenerationError> {
        let started = std::time::Instant::now();
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user_prompt,
                },
            ],
            temperature: request.temperature,
            max_tokens: MAX_TOKENS,
            stream: false,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GenerationError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(GenerationError::Api {
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| GenerationError::Transport(format!("malformed response: {e}")))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or(GenerationError::EmptyResponse)?;

        Ok(GenerationResult {
            content: choice.message.content,
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
            temperature: request.temperature,
            prompt_tokens: parsed.usage.prompt_tokens,
            completion_tokens: parsed.usage.completion_tokens,
            latency_ms: started.elapsed().as_millis() as i64,
        })
    }
}

/// The gateway itself: capability + rate limiter + telemetry.
pub struct Gateway {
    generator: Arc<dyn Generator>,
    limiter: Arc<RateLimiter>,
    retry: RetryConfig,
    lifecycle: LifecycleStore,
    output: OutputStore,
    histogram: Histogram,
    cancel: CancellationToken,
}

impl Gateway {
    #[must_use]
    pub fn new(
        generator: Arc<dyn Generator>,
        limiter: Arc<RateLimiter>,
        lifecycle: LifecycleStore,
        output: OutputStore,
        histogram: Histogram,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            generator,
            limiter,
            retry: RetryConfig::default(),
            lifecycle,
            output,
            histogram,
            cancel,
        }
    }

    /// One rate-limited, retried completion call with full telemetry.
    ///
    /// # Errors
    ///
    /// `ExternalFailure` once the retry budget is exhausted or the rate
    /// limiter refuses; `Timeout` on cancellation.
    pub async fn generate(
        &self,
        operation: &str,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f64,
    ) -> Result<GenerationResult> {
        let request = GenerationRequest {
            system_prompt: system_prompt.to_string(),
            user_prompt: user_prompt.to_string(),
            temperature,
        };

        let outcome = retry_with_backoff(&self.limiter, &self.retry, &self.cancel, || {
            let request = request.clone();
            let generator = Arc::clone(&self.generator);
            async move { generator.generate(&request).await }
        })
        .await;

        let result = match outcome {
            Ok(result) => result,
            Err(RetryError::Cancelled) => {
                return Err(Error::Timeout("generation cancelled".to_string()));
            },
            Err(err) => return Err(Error::ExternalFailure(err.to_string())),
        };

        self.record_telemetry(operation, &result);
        Ok(result)
    }

    /// Code-emission entry: shapes the system prompt for `code_type`,
    /// strips fences from the response, and sanity-checks the output.
    pub async fn generate_code(
        &self,
        operation: &str,
        prompt: &str,
        code_type: &str,
        patterns: Option<&serde_json::Value>,
        temperature: f64,
    ) -> Result<String> {
        let system = code_system_prompt(code_type, patterns);
        let result = self.generate(operation, &system, prompt, temperature).await?;
        let code = strip_code_fences(&result.content);
        validate_generated(&code, code_type)
            .map_err(|e| Error::ExternalFailure(e.to_string()))?;
        Ok(code)
    }

    /// Digest entry: shapes the schema prompt for `source_type`.
    pub async fn generate_digest(
        &self,
        source_type: &str,
        source_data: &str,
        temperature: f64,
    ) -> Result<String> {
        let system = digest_system_prompt(source_type);
        let result = self
            .generate("generate_digest", &system, source_data, temperature)
            .await?;
        Ok(result.content)
    }

    /// Snapshot of the rate limiter, for `get_stats`.
    #[must_use]
    pub fn limiter_stats(&self) -> brainloop_core::ratelimit::RateLimiterStats {
        self.limiter.stats()
    }

    fn record_telemetry(&self, operation: &str, result: &GenerationResult) {
        let request_id = Uuid::new_v4().to_string();
        if let Err(err) = self.lifecycle.record_usage(
            &request_id,
            operation,
            &result.model,
            result.temperature,
            result.prompt_tokens,
            result.completion_tokens,
            result.latency_ms,
        ) {
            tracing::warn!(error = %err, "failed to record usage row");
        }

        for (name, value) in [
            ("cerebras_tokens_prompt", result.prompt_tokens as f64),
            ("cerebras_tokens_completion", result.completion_tokens as f64),
            ("cerebras_latency_ms", result.latency_ms as f64),
        ] {
            if let Err(err) = self.output.record_metric(name, value) {
                tracing::warn!(metric = name, error = %err, "failed to record metric");
            }
        }

        if let Err(err) = self.histogram.record("generate", result.latency_ms) {
            tracing::warn!(error = %err, "failed to record generation latency");
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// A scripted generator: returns canned contents in order, cycling on
    /// the last one. Records every request it sees.
    pub struct ScriptedGenerator {
        responses: Vec<String>,
        calls: AtomicUsize,
        pub seen: std::sync::Mutex<Vec<GenerationRequest>>,
    }

    impl ScriptedGenerator {
        pub fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: responses.into_iter().map(String::from).collect(),
                calls: AtomicUsize::new(0),
                seen: std::sync::Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(
            &self,
            request: &GenerationRequest,
        ) -> std::result::Result<GenerationResult, GenerationError> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.clone());
            let content = self
                .responses
                .get(index)
                .or_else(|| self.responses.last())
                .cloned()
                .unwrap_or_default();
            Ok(GenerationResult {
                content,
                model: "scripted".to_string(),
                temperature: request.temperature,
                prompt_tokens: 10,
                completion_tokens: 20,
                latency_ms: 7,
            })
        }
    }

    /// A generator that always fails; exercises the retry path.
    pub struct FailingGenerator;

    #[async_trait]
    impl Generator for FailingGenerator {
        async fn generate(
            &self,
            _request: &GenerationRequest,
        ) -> std::result::Result<GenerationResult, GenerationError> {
            Err(GenerationError::Transport("connection refused".to_string()))
        }
    }
}
