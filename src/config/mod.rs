use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Model endpoint settings
    #[serde(default)]
    pub model: ModelConfig,

    /// Test execution settings
    #[serde(default)]
    pub run: RunConfig,

    /// Session budget
    #[serde(default)]
    pub budget: RunBudget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Generative model endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model API URL (Ollama-compatible `/api/generate` endpoint)
    #[serde(default = "default_model_url")]
    pub url: String,

    /// Model name to use for test synthesis
    #[serde(default = "default_model_name")]
    pub name: String,
}

/// How the target project's tests are executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Command that runs the whole test suite from the project root.
    /// A single test file is run as `{test_command} {file}`.
    #[serde(default = "default_test_command")]
    pub test_command: String,

    /// Wall-clock limit for one sandbox execution, in seconds
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Maximum captured stdout/stderr per execution (bytes)
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Maximum related units (tests, dependents) included in one
    /// generation context
    #[serde(default = "default_max_related")]
    pub max_related: usize,

    /// Maximum total generation context size (bytes)
    #[serde(default = "default_max_context_bytes")]
    pub max_context_bytes: usize,
}

/// Session budget. Read-only once a session starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunBudget {
    /// Maximum surviving mutants to take through generation
    #[serde(default = "default_max_mutants")]
    pub max_mutants: usize,

    /// Maximum synthesis attempts per mutant
    #[serde(default = "default_max_attempts")]
    pub max_attempts_per_mutant: u32,

    /// Wall-clock limit for the whole session, in seconds
    #[serde(default = "default_max_session_seconds")]
    pub max_session_seconds: u64,

    /// Maximum concurrent sandbox executions
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl RunConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl RunBudget {
    pub fn session_limit(&self) -> Duration {
        Duration::from_secs(self.max_session_seconds)
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_model_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_model_name() -> String {
    "qwen2.5-coder:7b".to_string()
}

fn default_test_command() -> String {
    "pytest -q".to_string()
}

fn default_timeout_seconds() -> u64 {
    120
}

fn default_max_output_bytes() -> usize {
    10_000
}

fn default_max_related() -> usize {
    4
}

fn default_max_context_bytes() -> usize {
    16_000
}

fn default_max_mutants() -> usize {
    25
}

fn default_max_attempts() -> u32 {
    2
}

fn default_max_session_seconds() -> u64 {
    1800
}

fn default_max_concurrent() -> usize {
    4
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            url: default_model_url(),
            name: default_model_name(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            test_command: default_test_command(),
            timeout_seconds: default_timeout_seconds(),
            max_output_bytes: default_max_output_bytes(),
            max_related: default_max_related(),
            max_context_bytes: default_max_context_bytes(),
        }
    }
}

impl Default for RunBudget {
    fn default() -> Self {
        Self {
            max_mutants: default_max_mutants(),
            max_attempts_per_mutant: default_max_attempts(),
            max_session_seconds: default_max_session_seconds(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl Config {
    /// Load configuration from file, or use defaults if no file is given
    /// or the file does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = if let Some(path) = path {
            if path.exists() {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config from {:?}", path))?;
                toml::from_str(&contents)
                    .with_context(|| format!("Failed to parse config from {:?}", path))?
            } else {
                Config::default()
            }
        } else {
            Config::default()
        };

        Ok(config)
    }
}
