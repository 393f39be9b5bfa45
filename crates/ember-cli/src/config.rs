//! Configuration file support

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use ember_agent::{PermissionGate, SupervisorConfig};
use ember_ai::{CommandProvider, ModelInfo, models};
use serde::{Deserialize, Serialize};

/// Model used when neither the flags, the config, nor the provider name one.
pub const DEFAULT_MODEL: &str = "qwen2.5-coder:14b";

/// Provider used when neither the flags nor the config name one.
pub const DEFAULT_PROVIDER: &str = "local";

/// Configuration for ember
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default model to use
    pub model: Option<String>,
    /// Default provider
    pub provider: Option<String>,
    /// Custom system prompt file path
    pub system_prompt_file: Option<String>,
    /// Bridge commands, keyed by provider name
    pub providers: BTreeMap<String, ProviderConfig>,
    pub permissions: PermissionSettings,
    pub limits: LimitSettings,
    pub process: ProcessSettings,
}

/// An external program that answers chat requests
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Model used when switching to this provider without naming one
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionSettings {
    /// Run every tool without asking
    pub auto_approve: bool,
    /// Replaces the built-in list of tools that need approval
    pub dangerous_tools: Option<Vec<String>>,
}

/// Overrides for the model registry and the loop
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub context_window: Option<u32>,
    pub tokens_per_interval: Option<u32>,
    pub max_depth: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSettings {
    pub foreground_timeout_secs: Option<u64>,
}

impl LimitSettings {
    /// Apply the configured ceilings on top of the registry values.
    pub fn apply(&self, mut model: ModelInfo) -> ModelInfo {
        if let Some(window) = self.context_window {
            model.context_window = window;
        }
        if let Some(limit) = self.tokens_per_interval {
            model.tokens_per_interval = Some(limit);
        }
        model
    }
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ember")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("EMBER_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from file
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Create the default config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, example_config())?;
        Ok(path)
    }

    /// The gate this configuration asks for.
    pub fn permission_gate(&self, auto_approve: bool) -> PermissionGate {
        if auto_approve || self.permissions.auto_approve {
            return PermissionGate::permissive();
        }
        match &self.permissions.dangerous_tools {
            Some(tools) => PermissionGate::new(tools.iter().cloned()),
            None => PermissionGate::with_defaults(),
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        let mut config = SupervisorConfig::default();
        if let Some(secs) = self.process.foreground_timeout_secs {
            config.foreground_timeout = Duration::from_secs(secs);
        }
        config
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    /// The bridge configured under `[providers.<name>]`.
    pub fn bridge(&self, name: &str) -> anyhow::Result<CommandProvider> {
        let provider = self.providers.get(name).with_context(|| {
            format!(
                "No provider named '{}' in {}. Run `ember --init-config` for an example.",
                name,
                Self::config_path().display()
            )
        })?;
        if provider.command.trim().is_empty() {
            anyhow::bail!("Provider '{}' has an empty command", name);
        }
        Ok(CommandProvider::new(
            name,
            provider.command.clone(),
            provider.args.clone(),
        ))
    }

    /// Resolve the model for `provider`: the requested id, then the provider's
    /// default, then the global default. Limits from the config apply on top.
    pub fn model_for(&self, provider: &str, requested: Option<&str>) -> ModelInfo {
        let id = requested
            .or_else(|| {
                self.providers
                    .get(provider)
                    .and_then(|p| p.default_model.as_deref())
            })
            .unwrap_or(DEFAULT_MODEL);
        self.limits.apply(models::resolve(provider, id))
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# ember configuration file
# Place at ~/.config/ember/config.toml or point EMBER_CONFIG_PATH at it

# Default provider (a key of [providers])
provider = "local"

# Default model
model = "qwen2.5-coder:14b"

# Custom system prompt file (optional)
# system_prompt_file = "~/.config/ember/system_prompt.txt"

# Each provider is a program that reads one JSON request on stdin and
# writes one JSON reply on stdout.
[providers.local]
command = "ember-bridge-ollama"
args = []
default_model = "qwen2.5-coder:14b"

[permissions]
# Run every tool without asking (same as --yes)
auto_approve = false
# Tools that need approval
# dangerous_tools = ["write_file", "run_command", "stop_process", "send_input"]

[limits]
# Override the model registry
# context_window = 32768
# tokens_per_interval = 30000
# max_depth = 15

[process]
# Seconds a command may run before it is moved to the background
# foreground_timeout_secs = 15
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses() {
        let config: Config = toml::from_str(example_config()).unwrap();
        assert_eq!(config.provider.as_deref(), Some("local"));
        let local = &config.providers["local"];
        assert_eq!(local.command, "ember-bridge-ollama");
        assert!(!config.permissions.auto_approve);
        assert!(config.limits.context_window.is_none());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.providers.is_empty());
        assert_eq!(
            config.supervisor_config().foreground_timeout,
            Duration::from_secs(15)
        );
    }

    #[test]
    fn test_limits_override_model() {
        let config: Config = toml::from_str(
            r#"
            [limits]
            context_window = 50000
            tokens_per_interval = 30000
            "#,
        )
        .unwrap();
        let model = config.limits.apply(ModelInfo::custom("local", "m"));
        assert_eq!(model.context_window, 50_000);
        assert_eq!(model.ceiling(), 30_000);
    }

    #[test]
    fn test_permission_settings() {
        let config: Config = toml::from_str(
            r#"
            [permissions]
            dangerous_tools = ["fetch_url"]
            "#,
        )
        .unwrap();
        let gate = config.permission_gate(false);
        assert!(gate.requires_approval("fetch_url"));
        assert!(!gate.requires_approval("write_file"));
        assert!(!config.permission_gate(true).requires_approval("fetch_url"));
    }

    #[test]
    fn test_bridge_lookup() {
        let config: Config = toml::from_str(example_config()).unwrap();
        assert!(config.bridge("local").is_ok());
        let err = config.bridge("cloud").unwrap_err();
        assert!(err.to_string().contains("No provider named 'cloud'"));
    }

    #[test]
    fn test_model_for_falls_back_to_provider_default() {
        let config: Config = toml::from_str(
            r#"
            [providers.local]
            command = "bridge"
            default_model = "my-model"

            [limits]
            context_window = 9000
            "#,
        )
        .unwrap();
        let model = config.model_for("local", None);
        assert_eq!(model.id, "my-model");
        assert_eq!(model.context_window, 9000);
        assert_eq!(config.model_for("local", Some("other")).id, "other");
        assert_eq!(config.model_for("remote", None).id, DEFAULT_MODEL);
    }

    #[test]
    fn test_process_timeout() {
        let config: Config = toml::from_str("[process]\nforeground_timeout_secs = 5\n").unwrap();
        assert_eq!(
            config.supervisor_config().foreground_timeout,
            Duration::from_secs(5)
        );
    }
}
