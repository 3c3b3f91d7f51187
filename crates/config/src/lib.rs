//! Configuration loading, validation, and management for JARVIS.
//!
//! Loads configuration from `~/.jarvis/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use jarvis_core::ModelTier;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.jarvis/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Assistant persona
    #[serde(default)]
    pub persona: PersonaConfig,

    /// Model files per tier
    #[serde(default)]
    pub models: ModelsConfig,

    /// Generation loop settings
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Memory store settings
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Prompt assembly settings
    #[serde(default)]
    pub context: ContextConfig,

    /// Tier routing heuristics
    #[serde(default)]
    pub router: RouterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    #[serde(default = "default_persona_name")]
    pub name: String,

    /// Base system prompt. A stored `llm/system_prompt` preference overrides it.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_persona_name() -> String {
    "JARVIS".into()
}
fn default_system_prompt() -> String {
    "You are JARVIS, a helpful local AI assistant. You run entirely on the user's \
     machine and remember what they tell you. Be concise, friendly and accurate."
        .into()
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            name: default_persona_name(),
            system_prompt: default_system_prompt(),
        }
    }
}

/// GGUF model paths. A tier without a path stays unloaded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fast: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deep: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<PathBuf>,
}

impl ModelsConfig {
    pub fn path(&self, tier: ModelTier) -> Option<&Path> {
        match tier {
            ModelTier::Fast => self.fast.as_deref(),
            ModelTier::Deep => self.deep.as_deref(),
            ModelTier::Fallback => self.fallback.as_deref(),
        }
    }

    pub fn set_path(&mut self, tier: ModelTier, path: PathBuf) {
        match tier {
            ModelTier::Fast => self.fast = Some(path),
            ModelTier::Deep => self.deep = Some(path),
            ModelTier::Fallback => self.fallback = Some(path),
        }
    }

    /// Tiers that have a configured path, in tier order.
    pub fn configured(&self) -> Vec<(ModelTier, PathBuf)> {
        ModelTier::ALL
            .iter()
            .filter_map(|t| self.path(*t).map(|p| (*t, p.to_path_buf())))
            .collect()
    }
}

/// What to do when a chat arrives while the tier's session is generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Fail immediately with `SessionBusy`.
    #[default]
    Reject,
    /// Wait in FIFO order for the session.
    Queue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Maximum tokens produced per response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Token batch capacity used during prefill
    #[serde(default = "default_batch_capacity")]
    pub batch_capacity: usize,

    #[serde(default)]
    pub busy_policy: BusyPolicy,

    #[serde(default)]
    pub sampling: SamplingConfig,
}

fn default_max_tokens() -> usize {
    512
}
fn default_batch_capacity() -> usize {
    512
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            batch_capacity: default_batch_capacity(),
            busy_policy: BusyPolicy::default(),
            sampling: SamplingConfig::default(),
        }
    }
}

/// Sampling hyperparameters. `temperature = 0` means greedy arg-max.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default)]
    pub temperature: f32,

    /// 0 disables top-k filtering
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// 1.0 disables nucleus filtering
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_top_k() -> usize {
    40
}
fn default_top_p() -> f32 {
    0.95
}
fn default_seed() -> u64 {
    299_792_458
}

impl SamplingConfig {
    pub fn greedy() -> Self {
        Self::default()
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_k: default_top_k(),
            top_p: default_top_p(),
            seed: default_seed(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// "sqlite" or "in_memory"
    #[serde(default = "default_memory_backend")]
    pub backend: String,

    /// Database file; defaults to `~/.jarvis/jarvis.db`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Memories recalled per turn
    #[serde(default = "default_recall_limit")]
    pub recall_limit: usize,

    /// Token budget of the memory digest
    #[serde(default = "default_context_tokens")]
    pub context_tokens: usize,
}

fn default_memory_backend() -> String {
    "sqlite".into()
}
fn default_recall_limit() -> usize {
    5
}
fn default_context_tokens() -> usize {
    512
}

impl MemoryConfig {
    pub fn database_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("jarvis.db"))
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
            path: None,
            recall_limit: default_recall_limit(),
            context_tokens: default_context_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Prompt token budget; clamped to the model's context window
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,

    /// Completed turns kept in conversation history
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
}

fn default_token_budget() -> usize {
    2048
}
fn default_history_turns() -> usize {
    10
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            history_turns: default_history_turns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Messages at least this many characters long are complex
    #[serde(default = "default_long_message_chars")]
    pub long_message_chars: usize,

    /// Messages with at least this many words are complex
    #[serde(default = "default_long_message_words")]
    pub long_message_words: usize,

    /// Number of question marks that makes a message complex
    #[serde(default = "default_question_marks")]
    pub question_marks: usize,

    /// Words or phrases that indicate a complex request
    #[serde(default = "default_complex_keywords")]
    pub complex_keywords: Vec<String>,
}

fn default_long_message_chars() -> usize {
    280
}
fn default_long_message_words() -> usize {
    50
}
fn default_question_marks() -> usize {
    2
}
fn default_complex_keywords() -> Vec<String> {
    [
        "explain",
        "why",
        "compare",
        "analyze",
        "analyse",
        "step by step",
        "design",
        "implement",
        "debug",
        "refactor",
        "prove",
        "derive",
        "summarize",
        "plan",
        "write a",
        "code",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            long_message_chars: default_long_message_chars(),
            long_message_words: default_long_message_words(),
            question_marks: default_question_marks(),
            complex_keywords: default_complex_keywords(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.jarvis/config.toml).
    ///
    /// Environment variables override the file:
    /// - `JARVIS_MODEL_FAST`, `JARVIS_MODEL_DEEP`, `JARVIS_MODEL_FALLBACK`
    /// - `JARVIS_MEMORY_PATH`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in `load`).
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for (tier, var) in [
            (ModelTier::Fast, "JARVIS_MODEL_FAST"),
            (ModelTier::Deep, "JARVIS_MODEL_DEEP"),
            (ModelTier::Fallback, "JARVIS_MODEL_FALLBACK"),
        ] {
            if let Some(path) = lookup(var).filter(|v| !v.is_empty()) {
                self.models.set_path(tier, PathBuf::from(path));
            }
        }
        if let Some(path) = lookup("JARVIS_MEMORY_PATH").filter(|v| !v.is_empty()) {
            self.memory.path = Some(PathBuf::from(path));
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".jarvis")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sampling = &self.generation.sampling;
        if !(0.0..=2.0).contains(&sampling.temperature) {
            return Err(ConfigError::ValidationError(
                "generation.sampling.temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if !(sampling.top_p > 0.0 && sampling.top_p <= 1.0) {
            return Err(ConfigError::ValidationError(
                "generation.sampling.top_p must be in (0.0, 1.0]".into(),
            ));
        }
        if self.generation.max_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "generation.max_tokens must be > 0".into(),
            ));
        }
        if self.generation.batch_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "generation.batch_capacity must be > 0".into(),
            ));
        }
        if self.context.token_budget == 0 {
            return Err(ConfigError::ValidationError(
                "context.token_budget must be > 0".into(),
            ));
        }
        match self.memory.backend.as_str() {
            "sqlite" | "in_memory" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "memory.backend must be 'sqlite' or 'in_memory', got '{other}'"
                )));
            }
        }
        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for jarvis_core::Error {
    fn from(e: ConfigError) -> Self {
        jarvis_core::Error::Config { message: e.to_string() }
    }
}
