//! Model registry with context-window and rate-limit ceilings.

use serde::{Deserialize, Serialize};

/// Context window used for model ids the registry does not know.
pub const DEFAULT_CONTEXT_WINDOW: u32 = 128_000;

/// Model definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier as the backend expects it
    pub id: String,
    /// Provider name (matches a provider entry in the config)
    pub provider: String,
    /// Architectural context window in tokens
    pub context_window: u32,
    /// Tokens a single request may carry under the backend's per-interval rate limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_per_interval: Option<u32>,
    /// Maximum output tokens
    pub max_tokens: u32,
}

impl ModelInfo {
    /// A model the registry does not know about.
    pub fn custom(provider: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            context_window: DEFAULT_CONTEXT_WINDOW,
            tokens_per_interval: None,
            max_tokens: 8192,
        }
    }

    /// Effective ceiling: the smaller of the context window and the per-interval limit.
    pub fn ceiling(&self) -> u32 {
        match self.tokens_per_interval {
            Some(limit) => self.context_window.min(limit),
            None => self.context_window,
        }
    }
}

struct ModelSpec {
    id: &'static str,
    provider: &'static str,
    context_window: u32,
    tokens_per_interval: Option<u32>,
    max_tokens: u32,
}

impl ModelSpec {
    fn to_info(&self) -> ModelInfo {
        ModelInfo {
            id: self.id.to_string(),
            provider: self.provider.to_string(),
            context_window: self.context_window,
            tokens_per_interval: self.tokens_per_interval,
            max_tokens: self.max_tokens,
        }
    }
}

// Per-interval limits are the free/entry tier request caps; override them in
// the config when an account has higher limits.
const MODELS: &[ModelSpec] = &[
    ModelSpec {
        id: "claude-sonnet-4-5",
        provider: "anthropic",
        context_window: 200_000,
        tokens_per_interval: Some(30_000),
        max_tokens: 64_000,
    },
    ModelSpec {
        id: "claude-haiku-4-5",
        provider: "anthropic",
        context_window: 200_000,
        tokens_per_interval: Some(50_000),
        max_tokens: 64_000,
    },
    ModelSpec {
        id: "gpt-4.1",
        provider: "openai",
        context_window: 1_047_576,
        tokens_per_interval: Some(30_000),
        max_tokens: 32_768,
    },
    ModelSpec {
        id: "gpt-4o-mini",
        provider: "openai",
        context_window: 128_000,
        tokens_per_interval: Some(200_000),
        max_tokens: 16_384,
    },
    ModelSpec {
        id: "gemini-2.5-flash",
        provider: "google",
        context_window: 1_048_576,
        tokens_per_interval: Some(250_000),
        max_tokens: 65_536,
    },
    ModelSpec {
        id: "llama-3.3-70b-versatile",
        provider: "groq",
        context_window: 131_072,
        tokens_per_interval: Some(12_000),
        max_tokens: 32_768,
    },
    ModelSpec {
        id: "qwen/qwen3-32b",
        provider: "groq",
        context_window: 131_072,
        tokens_per_interval: Some(6_000),
        max_tokens: 40_960,
    },
    ModelSpec {
        id: "deepseek-chat",
        provider: "deepseek",
        context_window: 64_000,
        tokens_per_interval: None,
        max_tokens: 8_192,
    },
    ModelSpec {
        id: "qwen2.5-coder:14b",
        provider: "ollama",
        context_window: 32_768,
        tokens_per_interval: None,
        max_tokens: 8_192,
    },
];

/// Look up a model by ID (first match across all providers).
pub fn get_model_by_id(id: &str) -> Option<ModelInfo> {
    MODELS.iter().find(|m| m.id == id).map(ModelSpec::to_info)
}

/// Get all models for a specific provider.
pub fn get_models(provider: &str) -> Vec<ModelInfo> {
    MODELS
        .iter()
        .filter(|m| m.provider.eq_ignore_ascii_case(provider))
        .map(ModelSpec::to_info)
        .collect()
}

/// Get all registered models.
pub fn get_all_models() -> Vec<ModelInfo> {
    MODELS.iter().map(ModelSpec::to_info).collect()
}

/// Resolve a model id for a provider, falling back to registry defaults.
pub fn resolve(provider: &str, id: &str) -> ModelInfo {
    match get_model_by_id(id) {
        Some(mut model) => {
            model.provider = provider.to_string();
            model
        }
        None => ModelInfo::custom(provider, id),
    }
}

/// Find registered models whose id contains `query` (case-insensitive).
pub fn search(query: &str) -> Vec<ModelInfo> {
    let q = query.to_lowercase();
    MODELS
        .iter()
        .filter(|m| m.id.to_lowercase().contains(&q))
        .map(ModelSpec::to_info)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_uses_rate_limit_when_smaller() {
        let model = get_model_by_id("llama-3.3-70b-versatile").unwrap();
        assert_eq!(model.ceiling(), 12_000);
    }

    #[test]
    fn test_ceiling_without_rate_limit() {
        let model = get_model_by_id("deepseek-chat").unwrap();
        assert_eq!(model.ceiling(), 64_000);
    }

    #[test]
    fn test_ceiling_when_window_is_smaller() {
        let model = get_model_by_id("gpt-4o-mini").unwrap();
        assert_eq!(model.ceiling(), 128_000);
    }

    #[test]
    fn test_resolve_unknown_model() {
        let model = resolve("local", "my-finetune");
        assert_eq!(model.id, "my-finetune");
        assert_eq!(model.provider, "local");
        assert_eq!(model.ceiling(), DEFAULT_CONTEXT_WINDOW);
    }

    #[test]
    fn test_resolve_known_model_keeps_requested_provider() {
        let model = resolve("openrouter", "claude-sonnet-4-5");
        assert_eq!(model.provider, "openrouter");
        assert_eq!(model.context_window, 200_000);
    }

    #[test]
    fn test_search_and_provider_filter() {
        assert!(search("CLAUDE").len() >= 2);
        assert!(get_models("groq").iter().all(|m| m.provider == "groq"));
        assert!(!get_all_models().is_empty());
    }
}
