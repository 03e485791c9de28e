use serde::{Deserialize, Serialize};

fn default_max_tokens() -> Option<u32> {
    Some(4096)
}
fn default_temperature() -> Option<f32> {
    Some(0.2)
}

/// The model an agent steps against. `provider = "mock"` activates
/// the deterministic `MockProvider`, scripted from `mock_responses_file` —
/// the out-of-the-box default when no real provider is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// "mock" or a real provider identifier ("openai" | "anthropic" | ...).
    /// Only "mock" is wired into this runtime; other values are accepted so
    /// a pipeline file can name its intended target before a real adapter
    /// is plugged in.
    pub provider: String,
    pub name: String,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_temperature")]
    pub temperature: Option<f32>,
    /// Path to a YAML mock-response script (`provider = "mock"` only).
    /// See `loomrun_model::load_steps`.
    pub mock_responses_file: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "mock".into(),
            name: "mock-1".into(),
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            mock_responses_file: None,
        }
    }
}

fn default_max_iterations() -> u32 {
    20
}
fn default_tool_timeout_secs() -> u64 {
    60
}
fn default_retry_max_attempts() -> u32 {
    3
}

/// Defaults applied to every agent/tool unless a pipeline file overrides
/// them per node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefaults {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            tool_timeout_secs: default_tool_timeout_secs(),
            retry_max_attempts: default_retry_max_attempts(),
        }
    }
}

fn default_session_dir() -> String {
    ".loomrun/sessions".into()
}

/// Where `JsonlSessionService` persists sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_dir")]
    pub dir: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dir: default_session_dir(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

/// `tracing-subscriber` filter applied at startup, as a config field so
/// headless runs don't need an env var to get useful output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentDefaults,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Named provider configurations, selectable per-agent from a pipeline
    /// file by key.
    #[serde(default)]
    pub providers: std::collections::HashMap<String, ModelConfig>,
}
