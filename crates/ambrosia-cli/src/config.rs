//! `ambrosia.toml`: service endpoint, rate limits and retry behavior

use std::path::{Path, PathBuf};
use std::time::Duration;

use ambrosia_core::{Backoff, RetryPolicy};
use ambrosia_psort::ProviderError;
use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub provider: ProviderSection,
    pub limits: LimitsConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderSection {
    pub base_url: String,
    #[serde(deserialize_with = "deserialize_env_var")]
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_tokens: u32,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            model: "gpt-3.5-turbo".to_string(),
            timeout_secs: 15,
            max_tokens: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Requests per minute
    pub rpm: u64,
    /// Tokens per minute
    pub tpm: u64,
    pub concurrency: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            rpm: 3150,
            tpm: 81_000,
            concurrency: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Unset retries forever
    pub max_retries: Option<u32>,
    pub backoff_ms: u64,
    /// Double the delay after every failed attempt, up to this many ms
    pub max_backoff_ms: Option<u64>,
    /// Give up immediately on errors that cannot succeed on retry (auth, bad request)
    pub transient_only: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            backoff_ms: 1000,
            max_backoff_ms: None,
            transient_only: false,
        }
    }
}

impl RetryConfig {
    /// Policy for provider calls; `max_retries` overrides the file value
    pub fn policy(&self, max_retries: Option<u32>) -> RetryPolicy<ProviderError> {
        let base = Duration::from_millis(self.backoff_ms);
        let backoff = match self.max_backoff_ms {
            Some(max) => Backoff::Exponential {
                base,
                max: Duration::from_millis(max),
            },
            None => Backoff::Fixed(base),
        };
        let policy = RetryPolicy {
            max_retries: max_retries.or(self.max_retries),
            backoff,
            ..RetryPolicy::forever(base)
        };
        if self.transient_only {
            policy.classify(ProviderError::is_transient)
        } else {
            policy
        }
    }
}

/// `api_key` may name an environment variable as `${VAR}`. An unset or empty
/// variable leaves the key unset.
fn deserialize_env_var<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|value| expand_env_var(&value)))
}

fn expand_env_var(value: &str) -> Option<String> {
    match value.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
        Some(name) => std::env::var(name).ok().filter(|v| !v.is_empty()),
        None => Some(value.to_owned()),
    }
}

/// Candidate config files, most specific first
fn search_path() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("ambrosia.toml")];
    if let Some(dirs) = directories::ProjectDirs::from("", "", "ambrosia") {
        paths.push(dirs.config_dir().join("config.toml"));
    }
    paths
}

impl Config {
    /// First existing file of `./ambrosia.toml` and the per-user
    /// `config.toml`, else built-in defaults.
    pub fn load() -> Result<Self> {
        match search_path().into_iter().find(|p| p.is_file()) {
            Some(path) => Self::from_file(&path),
            None => {
                log::debug!("no config file, using built-in defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        let config = toml::from_str::<Config>(&text)
            .with_context(|| format!("invalid config {}", path.display()))?;
        log::info!("using config {}", path.display());
        Ok(config)
    }
}
