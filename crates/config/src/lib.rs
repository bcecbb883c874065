//! Configuration loading, validation, and management for tapeloop.
//!
//! Loads configuration from `<home>/config.toml` with environment variable
//! overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.tapeloop/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Model identifier passed to the provider
    #[serde(default = "default_model")]
    pub model: String,

    /// API key for the model provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Max tokens per model response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Replaces the built-in system prompt when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Data directory holding tapes; defaults to `~/.tapeloop`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<PathBuf>,

    /// Base tape name for the default session
    #[serde(default = "default_tape_name")]
    pub tape_name: String,

    /// Agent loop settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Shell execution settings
    #[serde(default)]
    pub shell: ShellConfig,

    /// Memory zone settings
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Input routing settings
    #[serde(default)]
    pub router: RouterConfig,
}

fn default_model() -> String {
    "echo".into()
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_tape_name() -> String {
    "tapeloop".into()
}
fn default_true() -> bool {
    true
}

fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("model", &self.model)
            .field("api_key", &redact(&self.api_key))
            .field("max_tokens", &self.max_tokens)
            .field("system_prompt", &self.system_prompt.as_ref().map(|p| p.len()))
            .field("home", &self.home)
            .field("tape_name", &self.tape_name)
            .field("agent", &self.agent)
            .field("shell", &self.shell)
            .field("memory", &self.memory)
            .field("router", &self.router)
            .finish()
    }
}

/// Agent loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Step ceiling for one background loop run
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Pause between steps, in milliseconds
    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,

    /// Per model call timeout; `None` waits forever
    #[serde(default = "default_model_timeout")]
    pub model_timeout_secs: Option<u64>,

    /// Consecutive no-new-information rounds tolerated before recovery
    #[serde(default = "default_stagnation_window")]
    pub stagnation_window: u32,

    /// Native tool-call rounds allowed inside one model turn
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
}

fn default_max_steps() -> u32 {
    100
}
fn default_step_delay_ms() -> u64 {
    50
}
fn default_model_timeout() -> Option<u64> {
    Some(120)
}
fn default_stagnation_window() -> u32 {
    1
}
fn default_max_tool_rounds() -> u32 {
    16
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            step_delay_ms: default_step_delay_ms(),
            model_timeout_secs: default_model_timeout(),
            stagnation_window: default_stagnation_window(),
            max_tool_rounds: default_max_tool_rounds(),
        }
    }
}

/// Shell execution configuration.
///
/// Commands are not sandboxed. `allowed_commands` is the only gate and is
/// meant for callers that already know which binaries they trust.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    #[serde(default = "default_shell_timeout")]
    pub timeout_secs: u64,

    /// Empty means every command is allowed
    #[serde(default)]
    pub allowed_commands: Vec<String>,
}

fn default_shell_timeout() -> u64 {
    60
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_shell_timeout(),
            allowed_commands: Vec::new(),
        }
    }
}

/// Memory zone configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Daily notes older than this are dropped by `prune`
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Window of daily notes rendered into model context
    #[serde(default = "default_recent_days")]
    pub recent_days: u32,
}

fn default_retention_days() -> u32 {
    30
}
fn default_recent_days() -> u32 {
    7
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            recent_days: default_recent_days(),
        }
    }
}

/// Human input routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Treat a bare line that looks like a shell command as one
    #[serde(default = "default_true")]
    pub detect_bare_shell: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            detect_bare_shell: true,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (`<home>/config.toml`).
    ///
    /// Environment overrides (highest priority):
    /// - `TAPELOOP_HOME`
    /// - `TAPELOOP_MODEL`
    /// - `TAPELOOP_API_KEY`
    /// - `TAPELOOP_MAX_STEPS`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides()?;
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

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(home) = std::env::var("TAPELOOP_HOME") {
            self.home = Some(PathBuf::from(home));
        }
        if let Ok(model) = std::env::var("TAPELOOP_MODEL") {
            self.model = model;
        }
        if self.api_key.is_none() {
            self.api_key = std::env::var("TAPELOOP_API_KEY").ok();
        }
        if let Ok(steps) = std::env::var("TAPELOOP_MAX_STEPS") {
            self.agent.max_steps = steps.parse().map_err(|_| {
                ConfigError::ValidationError(format!("TAPELOOP_MAX_STEPS is not a number: {steps}"))
            })?;
        }
        self.validate()
    }

    /// The configuration directory: `TAPELOOP_HOME` or `~/.tapeloop`.
    pub fn config_dir() -> PathBuf {
        std::env::var("TAPELOOP_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| dirs_home().join(".tapeloop"))
    }

    /// The data directory tapes are stored under.
    pub fn home_dir(&self) -> PathBuf {
        self.home.clone().unwrap_or_else(Self::config_dir)
    }

    /// Directory holding the JSONL tape files.
    pub fn tapes_dir(&self) -> PathBuf {
        self.home_dir().join("tapes")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_steps == 0 {
            return Err(ConfigError::ValidationError("agent.max_steps must be > 0".into()));
        }
        if self.agent.stagnation_window == 0 {
            return Err(ConfigError::ValidationError(
                "agent.stagnation_window must be > 0".into(),
            ));
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::ValidationError("max_tokens must be > 0".into()));
        }
        if self.tape_name.trim().is_empty() {
            return Err(ConfigError::ValidationError("tape_name must not be empty".into()));
        }
        Ok(())
    }

    /// Generate a default config TOML string (for `init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            api_key: None,
            max_tokens: default_max_tokens(),
            system_prompt: None,
            home: None,
            tape_name: default_tape_name(),
            agent: AgentConfig::default(),
            shell: ShellConfig::default(),
            memory: MemoryConfig::default(),
            router: RouterConfig::default(),
        }
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
