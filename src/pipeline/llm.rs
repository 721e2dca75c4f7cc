//! Model calls: the client seam, the retry/failover policy, and the loop that
//! walks a candidate list.
//!
//! All provider-specific behaviour stays behind [`ModelClient`]; everything
//! retry-related goes through [`decide`], so the orchestrator and the fusion
//! engine share one policy:
//!
//! | failure                          | step                               |
//! |----------------------------------|------------------------------------|
//! | `Auth`, `QuotaExceeded`          | fail over immediately              |
//! | `Transient`, `Timeout`, `InvalidResponse` | retry with back-off, then fail over |
//!
//! Back-off doubles per retry: with 500 ms base and 2 retries the waits are
//! 500 ms → 1 s before the next model is tried.

use crate::config::AnalysisConfig;
use crate::error::ModelProviderError;
use crate::output::{AttemptFailure, StageKind};
use crate::pipeline::postprocess::clean_model_text;
use crate::registry::ModelDescriptor;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

// ── Requests ─────────────────────────────────────────────────────────────

/// One model call: system message, user prompt, optional drawing image.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system: String,
    pub prompt: String,
    pub image: Option<ImageData>,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl ModelRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>, config: &AnalysisConfig) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            image: None,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    pub fn with_image(mut self, image: Option<ImageData>) -> Self {
        self.image = image;
        self
    }
}

/// A raw model answer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelReply {
    pub text: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

// ── Client seam ──────────────────────────────────────────────────────────

/// A model endpoint that answers one request.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, ModelProviderError>;
}

/// Creates a client for a registry entry.
///
/// A factory error means the provider could not be instantiated at all
/// (missing API key, unknown provider); it counts as an `Auth` failure.
pub trait ClientFactory: Send + Sync {
    fn create(&self, model: &ModelDescriptor) -> Result<Arc<dyn ModelClient>, ModelProviderError>;
}

/// [`ClientFactory`] backed by `edgequake-llm`.
///
/// API keys come from the environment (`GEMINI_API_KEY`,
/// `OPENROUTER_API_KEY`, `OPENAI_API_KEY`, …) as read by
/// [`ProviderFactory::create_llm_provider`].
#[derive(Debug, Default, Clone, Copy)]
pub struct LlmClientFactory;

impl ClientFactory for LlmClientFactory {
    fn create(&self, model: &ModelDescriptor) -> Result<Arc<dyn ModelClient>, ModelProviderError> {
        let provider_name = model.provider.factory_name();
        let provider = ProviderFactory::create_llm_provider(provider_name, model.api_model())
            .map_err(|e| ModelProviderError::Auth {
                model: model.id.clone(),
                detail: format!("cannot create {provider_name} provider: {e}"),
            })?;
        debug!(model = %model.id, provider = provider_name, "created model client");
        Ok(Arc::new(LlmClient {
            model_id: model.id.clone(),
            provider,
        }))
    }
}

/// Wraps an `edgequake-llm` provider.
pub struct LlmClient {
    model_id: String,
    provider: Arc<dyn LLMProvider>,
}

impl LlmClient {
    pub fn new(model_id: impl Into<String>, provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            model_id: model_id.into(),
            provider,
        }
    }
}

#[async_trait]
impl ModelClient for LlmClient {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, ModelProviderError> {
        let mut messages = vec![ChatMessage::system(&request.system)];
        match &request.image {
            Some(image) => messages.push(ChatMessage::user_with_images(
                &request.prompt,
                vec![image.clone()],
            )),
            None => messages.push(ChatMessage::user(&request.prompt)),
        }

        let options = CompletionOptions {
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            ..Default::default()
        };

        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| classify_provider_error(&self.model_id, &e.to_string()))?;

        debug!(
            model = %self.model_id,
            "{} input tokens, {} output tokens",
            response.prompt_tokens, response.completion_tokens
        );
        Ok(ModelReply {
            text: response.content,
            prompt_tokens: response.prompt_tokens,
            completion_tokens: response.completion_tokens,
        })
    }
}

/// Map a provider error message onto the retry taxonomy.
///
/// Providers surface HTTP status and API error codes only in their message
/// text, so classification is textual.
pub fn classify_provider_error(model: &str, message: &str) -> ModelProviderError {
    let lower = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
    let model = model.to_string();
    let detail = message.to_string();

    if has(&["429", "quota", "rate limit", "rate_limit", "resource_exhausted", "resource exhausted", "too many requests"]) {
        ModelProviderError::QuotaExceeded { model, detail }
    } else if has(&["401", "403", "unauthorized", "unauthorised", "forbidden", "api key", "api_key", "authentication", "permission denied"]) {
        ModelProviderError::Auth { model, detail }
    } else if has(&["invalid json", "malformed", "deserializ", "unexpected response", "no choices", "empty response"]) {
        ModelProviderError::InvalidResponse { model, detail }
    } else {
        ModelProviderError::Transient { model, detail }
    }
}

// ── Cancellation ─────────────────────────────────────────────────────────

/// Cooperative cancellation shared by everyone holding a clone.
#[derive(Debug, Clone)]
pub struct Cancellation {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`Cancellation::cancel`] has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so `wait_for` cannot observe a close.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

// ── Policy ───────────────────────────────────────────────────────────────

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Call the same model again after `backoff`.
    Retry { backoff: Duration },
    /// Move on to the next candidate.
    Failover,
}

/// The single retry/failover policy.
///
/// `retries_so_far` counts retries already spent on this model.
pub fn decide(err: &ModelProviderError, retries_so_far: u32, config: &AnalysisConfig) -> Step {
    if err.is_failover_immediately() || matches!(err, ModelProviderError::Cancelled { .. }) {
        return Step::Failover;
    }
    if retries_so_far < config.max_retries {
        Step::Retry {
            backoff: config.backoff_for(retries_so_far + 1),
        }
    } else {
        Step::Failover
    }
}

// ── Failover loop ────────────────────────────────────────────────────────

/// A served call.
#[derive(Debug, Clone)]
pub struct Served {
    pub model: ModelDescriptor,
    /// Cleaned answer, never empty.
    pub text: String,
    /// Calls issued across all candidates, including the successful one.
    pub attempts: u32,
    pub duration_ms: u64,
}

/// Outcome of walking a candidate list.
#[derive(Debug, Clone)]
pub enum CallOutcome {
    Served(Served),
    /// Every candidate failed. `reached` is false when no client could even
    /// be created.
    Exhausted { attempts: u32, reached: bool },
    Cancelled,
}

/// Try `candidates` in order under the shared policy.
///
/// Every failed attempt is appended to `failures`. No lock is held across a
/// model call; quota cooldowns are recorded through short synchronous
/// updates on the health table.
pub async fn call_with_failover(
    stage: StageKind,
    candidates: &[ModelDescriptor],
    request: &ModelRequest,
    config: &AnalysisConfig,
    failures: &mut Vec<AttemptFailure>,
) -> CallOutcome {
    let start = Instant::now();
    let mut attempts = 0u32;
    let mut reached = false;
    let callback = &config.progress_callback;

    for model in candidates {
        if config.cancellation.is_cancelled() {
            return CallOutcome::Cancelled;
        }

        let client = match config.client_factory.create(model) {
            Ok(client) => client,
            Err(err) => {
                warn!(stage = ?stage, model = %model.id, "client unavailable: {err}");
                failures.push(failure(stage, model, &err));
                callback.on_failover(stage, &model.id, err.kind());
                continue;
            }
        };
        reached = true;

        let mut retries = 0u32;
        loop {
            attempts += 1;
            debug!(stage = ?stage, model = %model.id, attempt = attempts, "calling model");

            let result = tokio::select! {
                biased;
                _ = config.cancellation.cancelled() => {
                    let err = ModelProviderError::Cancelled { model: model.id.clone() };
                    info!(stage = ?stage, model = %model.id, "in-flight call cancelled");
                    failures.push(failure(stage, model, &err));
                    return CallOutcome::Cancelled;
                }
                r = tokio::time::timeout(config.api_timeout(), client.complete(request)) => r,
            };

            let err = match result {
                Ok(Ok(reply)) => {
                    let text = clean_model_text(&reply.text);
                    if !text.is_empty() {
                        info!(stage = ?stage, model = %model.id, attempts, "stage served");
                        return CallOutcome::Served(Served {
                            model: model.clone(),
                            text,
                            attempts,
                            duration_ms: start.elapsed().as_millis() as u64,
                        });
                    }
                    ModelProviderError::InvalidResponse {
                        model: model.id.clone(),
                        detail: "empty answer".to_string(),
                    }
                }
                Ok(Err(err)) => err,
                Err(_elapsed) => ModelProviderError::Timeout {
                    model: model.id.clone(),
                    secs: config.api_timeout_secs,
                },
            };

            warn!(stage = ?stage, model = %model.id, kind = err.kind(), "attempt failed: {err}");
            failures.push(failure(stage, model, &err));
            if matches!(err, ModelProviderError::QuotaExceeded { .. }) {
                config
                    .health
                    .mark_quota_exhausted(&model.id, Duration::from_secs(config.quota_cooldown_secs));
            }

            match decide(&err, retries, config) {
                Step::Retry { backoff } => {
                    retries += 1;
                    warn!(
                        stage = ?stage,
                        model = %model.id,
                        "retry {}/{} after {}ms",
                        retries,
                        config.max_retries,
                        backoff.as_millis()
                    );
                    tokio::select! {
                        biased;
                        _ = config.cancellation.cancelled() => return CallOutcome::Cancelled,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Step::Failover => {
                    callback.on_failover(stage, &model.id, err.kind());
                    break;
                }
            }
        }
    }

    CallOutcome::Exhausted { attempts, reached }
}

fn failure(stage: StageKind, model: &ModelDescriptor, err: &ModelProviderError) -> AttemptFailure {
    AttemptFailure {
        stage,
        model_id: model.id.clone(),
        kind: err.kind().to_string(),
        detail: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(retries: u32) -> AnalysisConfig {
        AnalysisConfig::builder()
            .max_retries(retries)
            .retry_backoff_ms(100)
            .build()
            .unwrap()
    }

    #[test]
    fn quota_and_auth_fail_over_immediately() {
        let c = config(3);
        let quota = classify_provider_error("m", "HTTP 429 Too Many Requests");
        let auth = classify_provider_error("m", "401 Unauthorized: invalid api key");
        assert!(matches!(quota, ModelProviderError::QuotaExceeded { .. }));
        assert!(matches!(auth, ModelProviderError::Auth { .. }));
        assert_eq!(decide(&quota, 0, &c), Step::Failover);
        assert_eq!(decide(&auth, 0, &c), Step::Failover);
    }

    #[test]
    fn transient_retries_then_fails_over() {
        let c = config(2);
        let err = classify_provider_error("m", "503 Service Unavailable");
        assert!(matches!(err, ModelProviderError::Transient { .. }));
        assert_eq!(
            decide(&err, 0, &c),
            Step::Retry {
                backoff: Duration::from_millis(100)
            }
        );
        assert_eq!(
            decide(&err, 1, &c),
            Step::Retry {
                backoff: Duration::from_millis(200)
            }
        );
        assert_eq!(decide(&err, 2, &c), Step::Failover);
    }

    #[test]
    fn invalid_response_is_retried_like_transient() {
        let c = config(1);
        let err = classify_provider_error("m", "invalid JSON in body");
        assert!(matches!(err, ModelProviderError::InvalidResponse { .. }));
        assert!(matches!(decide(&err, 0, &c), Step::Retry { .. }));
    }

    #[test]
    fn timeout_is_retried() {
        let c = config(1);
        let err = ModelProviderError::Timeout {
            model: "m".into(),
            secs: 30,
        };
        assert!(matches!(decide(&err, 0, &c), Step::Retry { .. }));
        assert_eq!(decide(&err, 1, &c), Step::Failover);
    }

    #[tokio::test]
    async fn cancellation_wakes_waiters() {
        let token = Cancellation::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        assert!(!token.is_cancelled());
        token.cancel();
        handle.await.unwrap();
        assert!(token.is_cancelled());
    }

    struct Hanging;

    #[async_trait]
    impl ModelClient for Hanging {
        async fn complete(&self, _request: &ModelRequest) -> Result<ModelReply, ModelProviderError> {
            std::future::pending().await
        }
    }

    struct HangingFactory;

    impl ClientFactory for HangingFactory {
        fn create(&self, _model: &ModelDescriptor) -> Result<Arc<dyn ModelClient>, ModelProviderError> {
            Ok(Arc::new(Hanging))
        }
    }

    #[tokio::test]
    async fn cancelled_call_is_recorded_as_a_failure() {
        use crate::registry::{Capability, CostTier, Provider};

        let token = Cancellation::new();
        let c = AnalysisConfig::builder()
            .client_factory(Arc::new(HangingFactory))
            .cancellation(token.clone())
            .build()
            .unwrap();
        let model = ModelDescriptor {
            id: "slow".into(),
            name: "Slow".into(),
            provider: Provider::OpenRouter,
            api_model: None,
            capabilities: [Capability::Reasoning].into_iter().collect(),
            context_tokens: 32_768,
            cost_tier: CostTier::Free,
            priority: 1,
        };
        let request = ModelRequest::new("system", "prompt", &c);
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let mut failures = Vec::new();
        let outcome = call_with_failover(StageKind::Overview, &[model], &request, &c, &mut failures).await;
        canceller.await.unwrap();

        assert!(matches!(outcome, CallOutcome::Cancelled));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, "cancelled");
        assert_eq!(failures[0].model_id, "slow");
        assert_eq!(
            decide(&ModelProviderError::Cancelled { model: "slow".into() }, 0, &c),
            Step::Failover
        );
    }

    #[test]
    fn already_cancelled_resolves_immediately() {
        let token = Cancellation::new();
        token.cancel();
        tokio_test::block_on(token.cancelled());
        assert!(token.clone().is_cancelled());
    }
}
