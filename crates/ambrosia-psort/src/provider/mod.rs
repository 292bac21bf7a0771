//! Text-generation providers: one prompt in, one completion out

mod dry_run;
mod openai;

use std::time::Duration;

pub use dry_run::DryRun;
pub use openai::{OpenAi, OpenAiConfig};

use crate::error::ProviderError;

/// One compiled prompt, tagged with its position in the todo set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: usize,
    pub system_prompt: String,
    pub prompt: String,
}

impl Request {
    /// Rough token cost used to reserve rate-limit budget before the call
    pub fn byte_estimate(&self) -> u64 {
        (self.prompt.len() + self.system_prompt.len()) as u64
    }
}

/// Completion for the request with the same `id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub id: usize,
    pub completion: String,
    /// Tokens the service charged for the call
    pub tokens: u64,
}

/// Capability to run prompts against a text-generation service.
pub trait Provider: Send + Sync {
    fn infer(&self, request: &Request) -> Result<Response, ProviderError>;

    /// Cheap pre-flight check (credentials, reachability)
    fn ping(&self) -> Result<(), ProviderError>;

    fn name(&self) -> &str;
}

/// Provider selection for a run
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub dry_run: bool,
    /// Print each prompt when running dry
    pub echo: bool,
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            echo: true,
            model: "gpt-3.5-turbo".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            max_tokens: 5,
            timeout: Duration::from_secs(15),
        }
    }
}

/// Build the provider for a run. Dry-run wins over any model setting.
pub fn build_provider(config: &ProviderConfig) -> anyhow::Result<Box<dyn Provider>> {
    if config.dry_run {
        log::info!("dry-run enabled");
        return Ok(Box::new(DryRun::new(config.echo)));
    }
    anyhow::ensure!(
        !config.model.trim().is_empty(),
        "dry-run not set and no model specified"
    );
    log::info!("using model {} at {}", config.model, config.base_url);
    Ok(Box::new(OpenAi::new(OpenAiConfig {
        base_url: config.base_url.clone(),
        // An invalid or missing key surfaces on the ping
        api_key: config.api_key.clone().unwrap_or_default(),
        model: config.model.clone(),
        max_tokens: config.max_tokens,
        timeout: config.timeout,
    })))
}
