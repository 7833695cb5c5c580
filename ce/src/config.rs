//! Engine configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Generation parameters carried per provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 1.0,
            max_tokens: 1024,
        }
    }
}

/// Provider endpoint configuration. Immutable per request.
///
/// `Local` is an OpenAI-compatible endpoint that doubles as the designated
/// fallback terminus: a turn already running against it is never
/// fallback-chained again.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderConfig {
    OpenAi {
        base_url: String,
        api_key: String,
        model: String,
        #[serde(default)]
        params: GenerationParams,
    },
    Gemini {
        base_url: String,
        api_key: String,
        model: String,
        #[serde(default)]
        params: GenerationParams,
    },
    Local {
        base_url: String,
        #[serde(default)]
        api_key: String,
        model: String,
        #[serde(default)]
        params: GenerationParams,
    },
}

impl ProviderConfig {
    pub fn label(&self) -> &'static str {
        match self {
            ProviderConfig::OpenAi { .. } => "openai",
            ProviderConfig::Gemini { .. } => "gemini",
            ProviderConfig::Local { .. } => "local",
        }
    }

    pub fn base_url(&self) -> &str {
        match self {
            ProviderConfig::OpenAi { base_url, .. }
            | ProviderConfig::Gemini { base_url, .. }
            | ProviderConfig::Local { base_url, .. } => base_url,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            ProviderConfig::OpenAi { model, .. }
            | ProviderConfig::Gemini { model, .. }
            | ProviderConfig::Local { model, .. } => model,
        }
    }

    pub fn params(&self) -> &GenerationParams {
        match self {
            ProviderConfig::OpenAi { params, .. }
            | ProviderConfig::Gemini { params, .. }
            | ProviderConfig::Local { params, .. } => params,
        }
    }

    /// True for the designated local fallback provider
    pub fn is_local(&self) -> bool {
        matches!(self, ProviderConfig::Local { .. })
    }
}

/// A preset few-shot message injected after the system prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetMessage {
    pub role: crate::codec::Role,
    pub text: String,
}

/// Auto-loop planner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoLoopConfig {
    pub enabled: bool,
    pub max_loops: u32,
}

impl Default for AutoLoopConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_loops: 3,
        }
    }
}

/// Orchestrator tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Optional system prompt prepended to every request
    pub system_prompt: Option<String>,

    /// Optional few-shot preset messages
    pub presets: Vec<PresetMessage>,

    /// Trailing window of prior turns included in the prompt
    pub history_window: usize,

    /// Show deltas as they arrive, or withhold until completion
    pub stream_visibly: bool,

    /// Per-character display delay in ms (0 disables pacing)
    pub char_delay_ms: u64,

    /// Minimum interval between persistence writes, in ms
    pub persist_interval_ms: u64,

    /// Delay before the slow-first-byte hint, in ms (0 disables)
    pub slow_hint_after_ms: u64,

    /// First-content timeout for regenerate, in ms
    pub response_timeout_ms: u64,

    /// Auto-loop planner
    pub auto_loop: AutoLoopConfig,

    /// Active prompt template; `{{input}}` is substituted
    pub template: Option<String>,

    /// Augment user turns with retrieved knowledge
    pub retrieval: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            presets: Vec::new(),
            history_window: 10,
            stream_visibly: true,
            char_delay_ms: 0,
            persist_interval_ms: 750,
            slow_hint_after_ms: 6000,
            response_timeout_ms: 30_000,
            auto_loop: AutoLoopConfig::default(),
            template: None,
            retrieval: true,
        }
    }
}

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Primary provider
    pub provider: ProviderConfig,

    /// Optional fallback provider tried at most once per turn
    #[serde(default)]
    pub fallback: Option<ProviderConfig>,

    /// Orchestrator settings
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Knowledge store index path (retrieval augmentation)
    #[serde(default = "default_knowledge_path")]
    pub knowledge_path: PathBuf,

    /// Transport-level proxy, applied at connection-build time
    #[serde(default)]
    pub proxy: Option<String>,

    /// Session cache bound
    #[serde(default = "default_session_cache_size")]
    pub session_cache_size: usize,
}

fn default_knowledge_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chatengine")
        .join("knowledge.db")
}

fn default_session_cache_size() -> usize {
    5
}

impl Config {
    /// Validate configuration before use.
    ///
    /// Fails fast with a clear message on missing credentials or model ids.
    pub fn validate(&self) -> Result<()> {
        self.validate_provider(&self.provider)?;
        if let Some(fallback) = &self.fallback {
            self.validate_provider(fallback)?;
        }
        Ok(())
    }

    fn validate_provider(&self, provider: &ProviderConfig) -> Result<()> {
        if provider.model().is_empty() {
            return Err(eyre::eyre!("{} provider has no model configured", provider.label()));
        }
        if provider.base_url().is_empty() {
            return Err(eyre::eyre!("{} provider has no base_url configured", provider.label()));
        }
        match provider {
            ProviderConfig::OpenAi { api_key, .. } | ProviderConfig::Gemini { api_key, .. } if api_key.is_empty() => {
                Err(eyre::eyre!("{} provider has no API key configured", provider.label()))
            }
            _ => Ok(()),
        }
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".chatengine.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("chatengine").join("chatengine.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        Err(eyre::eyre!(
            "No configuration found. Create .chatengine.yml or pass --config."
        ))
    }

    fn load_from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}
