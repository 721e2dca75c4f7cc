//! Model registry: which AI models exist, what they can do, in what order
//! automatic selection tries them.
//!
//! The registry is plain data. It ships with a built-in table and can be
//! replaced by a TOML file:
//!
//! ```toml
//! [[models]]
//! id = "gemini-2.5-flash"
//! name = "Gemini 2.5 Flash"
//! provider = "gemini_direct"
//! capabilities = ["vision", "fast"]
//! context_tokens = 1048576
//! cost_tier = "free"
//! priority = 10
//! ```
//!
//! Ordering for automatic selection is `(cooling, cost_tier, priority, id)`:
//! free before paid, lower `priority` first, and models in a quota cooldown
//! pushed to the back.

use crate::error::CadError;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Backend that serves a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Google Gemini API called directly.
    GeminiDirect,
    /// OpenRouter aggregator.
    OpenRouter,
    OpenAi,
    Anthropic,
    /// Local Ollama server.
    Ollama,
}

impl Provider {
    /// Provider name understood by `edgequake_llm::ProviderFactory`.
    pub fn factory_name(self) -> &'static str {
        match self {
            Provider::GeminiDirect => "gemini",
            Provider::OpenRouter => "openrouter",
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Ollama => "ollama",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.factory_name())
    }
}

/// What a model can be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Accepts image input.
    Vision,
    /// Strong at text-only reasoning over structured evidence.
    Reasoning,
    Fast,
    Technical,
    LargeContext,
    Lite,
    Advanced,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Capability::Vision => "vision",
            Capability::Reasoning => "reasoning",
            Capability::Fast => "fast",
            Capability::Technical => "technical",
            Capability::LargeContext => "large_context",
            Capability::Lite => "lite",
            Capability::Advanced => "advanced",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostTier {
    Free,
    Paid,
}

/// One registry row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Registry id, used for explicit selection and in results.
    pub id: String,
    pub name: String,
    pub provider: Provider,
    /// Model name sent to the provider; defaults to `id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_model: Option<String>,
    pub capabilities: BTreeSet<Capability>,
    #[serde(default = "default_context_tokens")]
    pub context_tokens: u32,
    pub cost_tier: CostTier,
    /// Lower is tried first.
    #[serde(default = "default_priority")]
    pub priority: u32,
}

fn default_context_tokens() -> u32 {
    32_768
}

fn default_priority() -> u32 {
    100
}

impl ModelDescriptor {
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn api_model(&self) -> &str {
        self.api_model.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct RegistryFile {
    #[serde(default)]
    models: Vec<ModelDescriptor>,
}

/// The set of models available to the orchestrator and the fusion engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRegistry {
    models: Vec<ModelDescriptor>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ModelRegistry {
    /// Build a registry from descriptors, rejecting duplicate or blank ids.
    pub fn new(models: Vec<ModelDescriptor>) -> Result<Self, CadError> {
        let mut seen = BTreeSet::new();
        for m in &models {
            if m.id.trim().is_empty() {
                return Err(CadError::Registry("model id must not be empty".into()));
            }
            if !seen.insert(m.id.as_str()) {
                return Err(CadError::Registry(format!("duplicate model id '{}'", m.id)));
            }
        }
        Ok(Self { models })
    }

    /// The built-in model table: free vision models first, then text
    /// reasoning models, then paid fallbacks.
    pub fn builtin() -> Self {
        use Capability::*;
        let row = |id: &str, name: &str, provider, caps: &[Capability], ctx, tier, priority| {
            ModelDescriptor {
                id: id.to_string(),
                name: name.to_string(),
                provider,
                api_model: None,
                capabilities: caps.iter().copied().collect(),
                context_tokens: ctx,
                cost_tier: tier,
                priority,
            }
        };
        Self {
            models: vec![
                row("gemini-2.5-flash", "Gemini 2.5 Flash", Provider::GeminiDirect, &[Vision, Fast, LargeContext], 1_048_576, CostTier::Free, 10),
                row("gemini-2.5-flash-lite", "Gemini 2.5 Flash Lite", Provider::GeminiDirect, &[Vision, Fast, Lite], 1_048_576, CostTier::Free, 20),
                row("google/gemini-2.0-flash-exp:free", "Gemini 2.0 Flash (OpenRouter)", Provider::OpenRouter, &[Vision, Fast], 1_048_576, CostTier::Free, 30),
                row("nvidia/nemotron-nano-12b-v2-vl:free", "Nemotron Nano 12B VL", Provider::OpenRouter, &[Vision, Technical], 128_000, CostTier::Free, 40),
                row("qwen/qwen-2.5-vl-7b-instruct:free", "Qwen 2.5 VL 7B", Provider::OpenRouter, &[Vision], 32_768, CostTier::Free, 50),
                row("meta-llama/llama-3.3-70b-instruct:free", "Llama 3.3 70B", Provider::OpenRouter, &[Reasoning, LargeContext], 131_072, CostTier::Free, 60),
                row("google/gemma-3-27b-it:free", "Gemma 3 27B", Provider::OpenRouter, &[Reasoning, Fast], 8_192, CostTier::Free, 70),
                row("openai/gpt-oss-20b:free", "GPT-OSS 20B", Provider::OpenRouter, &[Reasoning], 131_072, CostTier::Free, 80),
                row("deepseek/deepseek-r1", "DeepSeek R1", Provider::OpenRouter, &[Reasoning, Advanced], 163_840, CostTier::Paid, 90),
                row("qwen/qwen3-235b-a22b", "Qwen3 235B", Provider::OpenRouter, &[Reasoning, Advanced, LargeContext], 131_072, CostTier::Paid, 100),
            ],
        }
    }

    /// Parse a registry from TOML text.
    pub fn from_toml_str(source: &str) -> Result<Self, CadError> {
        let file: RegistryFile =
            toml::from_str(source).map_err(|e| CadError::Registry(e.to_string()))?;
        Self::new(file.models)
    }

    /// Load a registry file.
    pub fn from_file(path: &Path) -> Result<Self, CadError> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| CadError::Registry(format!("{}: {e}", path.display())))?;
        let registry = Self::from_toml_str(&source)?;
        info!(path = %path.display(), models = registry.models.len(), "loaded model registry");
        Ok(registry)
    }

    /// Serialise back to the TOML file format.
    pub fn to_toml_string(&self) -> Result<String, CadError> {
        toml::to_string_pretty(&RegistryFile {
            models: self.models.clone(),
        })
        .map_err(|e| CadError::Registry(e.to_string()))
    }

    pub fn models(&self) -> &[ModelDescriptor] {
        &self.models
    }

    pub fn get(&self, id: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Models supporting `capability`, in automatic-selection order.
    pub fn priority_list(&self, capability: Capability, health: &ProviderHealth) -> Vec<&ModelDescriptor> {
        let mut list: Vec<&ModelDescriptor> = self
            .models
            .iter()
            .filter(|m| m.supports(capability))
            .collect();
        list.sort_by(|a, b| {
            (health.is_cooling(&a.id), a.cost_tier, a.priority, &a.id).cmp(&(
                health.is_cooling(&b.id),
                b.cost_tier,
                b.priority,
                &b.id,
            ))
        });
        debug!(
            capability = %capability,
            order = ?list.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            "priority list"
        );
        list
    }
}

// ── Provider health ──────────────────────────────────────────────────────

static GLOBAL_HEALTH: Lazy<Arc<ProviderHealth>> = Lazy::new(|| Arc::new(ProviderHealth::default()));

/// Per-model quota cooldowns.
///
/// The lock is only taken inside these synchronous methods, never across an
/// `.await`.
#[derive(Debug, Default)]
pub struct ProviderHealth {
    cooling_until: Mutex<HashMap<String, Instant>>,
}

impl ProviderHealth {
    /// The process-wide table.
    pub fn shared() -> Arc<ProviderHealth> {
        Arc::clone(&GLOBAL_HEALTH)
    }

    /// Record a quota failure; the model sorts last until `cooldown` passes.
    pub fn mark_quota_exhausted(&self, model_id: &str, cooldown: Duration) {
        if cooldown.is_zero() {
            return;
        }
        if let Ok(mut table) = self.cooling_until.lock() {
            table.insert(model_id.to_string(), Instant::now() + cooldown);
        }
    }

    pub fn is_cooling(&self, model_id: &str) -> bool {
        match self.cooling_until.lock() {
            Ok(mut table) => match table.get(model_id) {
                Some(until) if *until > Instant::now() => true,
                Some(_) => {
                    table.remove(model_id);
                    false
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    pub fn clear(&self) {
        if let Ok(mut table) = self.cooling_until.lock() {
            table.clear();
        }
    }
}
