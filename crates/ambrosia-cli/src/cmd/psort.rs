//! `ambrosia psort` - sort records into shards by model completion

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use ambrosia_core::{CancelToken, SharedProgress, load_jsonl};
use ambrosia_psort::{PromptTemplate, ProviderConfig, Render, build_provider};
use anyhow::{Context, Result};
use clap::Args;

use crate::config::Config;

#[derive(Args, Debug)]
pub struct PsortArgs {
    /// Input JSONL file; shards are written beside it
    pub infile: PathBuf,

    /// Model to prompt
    #[arg(long, env = "AMBROSIA_MODEL")]
    pub model: Option<String>,

    /// API token (default: config file, then OPENAI_API_KEY)
    #[arg(long, env = "AMBROSIA_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// API base URL of an OpenAI-compatible service
    #[arg(long, env = "AMBROSIA_BASE_URL")]
    pub base_url: Option<String>,

    /// Text placed before each record
    #[arg(long, env = "AMBROSIA_INSTRUCTION")]
    pub instruction: Option<String>,

    /// Text placed after each record
    #[arg(long, env = "AMBROSIA_END_INSTRUCTION")]
    pub end_instruction: Option<String>,

    /// System prompt
    #[arg(long, env = "AMBROSIA_SYSPROMPT")]
    pub sysprompt: Option<String>,

    /// Fields to include in the prompt (comma-separated; default: all)
    #[arg(long, value_delimiter = ',', env = "AMBROSIA_FIELDS")]
    pub fields: Vec<String>,

    /// Render fields as one JSON object instead of `field: value` lines
    #[arg(long, env = "AMBROSIA_JSON")]
    pub json: bool,

    /// Store the completion on output records
    #[arg(long, env = "AMBROSIA_INCLUDE_RESP")]
    pub include_resp: bool,

    /// Echo prompts instead of calling the service
    #[arg(long, env = "AMBROSIA_DRY_RUN")]
    pub dry_run: bool,

    /// Concurrent requests
    #[arg(short, long, env = "AMBROSIA_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Requests per minute
    #[arg(long, env = "AMBROSIA_RPM")]
    pub rpm: Option<u64>,

    /// Tokens per minute
    #[arg(long, env = "AMBROSIA_TPM")]
    pub tpm: Option<u64>,

    /// Maximum completion length in tokens (0: service default)
    #[arg(long, env = "AMBROSIA_MAX_TOKENS")]
    pub max_tokens: Option<u32>,

    /// Per-request timeout in seconds
    #[arg(long, env = "AMBROSIA_TIMEOUT")]
    pub timeout: Option<u64>,

    /// Give up on a record after this many retries (default: never)
    #[arg(long, env = "AMBROSIA_MAX_RETRIES")]
    pub max_retries: Option<u32>,

    /// Show a progress bar
    #[arg(long, env = "AMBROSIA_PROGRESS")]
    pub progress: bool,
}

impl PsortArgs {
    fn provider_config(&self, config: &Config) -> ProviderConfig {
        let section = &config.provider;
        ProviderConfig {
            dry_run: self.dry_run,
            // Prompt previews would tear the progress bar
            echo: !self.progress,
            model: self.model.clone().unwrap_or_else(|| section.model.clone()),
            base_url: self
                .base_url
                .clone()
                .unwrap_or_else(|| section.base_url.clone()),
            api_key: self.token.clone().or_else(|| section.api_key.clone()),
            max_tokens: self.max_tokens.unwrap_or(section.max_tokens),
            timeout: Duration::from_secs(self.timeout.unwrap_or(section.timeout_secs)),
        }
    }

    fn psort_config(&self, config: &Config) -> ambrosia_psort::Config {
        ambrosia_psort::Config {
            input_path: self.infile.clone(),
            prompt: PromptTemplate {
                instruction: self.instruction.clone(),
                end_instruction: self.end_instruction.clone(),
                system_prompt: self.sysprompt.clone(),
                fields: self.fields.clone(),
                render: if self.json { Render::Json } else { Render::Text },
            },
            include_completion: self.include_resp,
            dry_run: self.dry_run,
            concurrency: self.concurrency.unwrap_or(config.limits.concurrency),
            rpm: self.rpm.unwrap_or(config.limits.rpm),
            tpm: self.tpm.unwrap_or(config.limits.tpm),
            retry: config.retry.policy(self.max_retries),
            progress: self.progress,
        }
    }
}

pub fn run(args: PsortArgs, config: &Config, progress: &SharedProgress) -> Result<ExitCode> {
    let records = load_jsonl(&args.infile)
        .with_context(|| format!("Failed to load {}", args.infile.display()))?;
    log::info!(
        "loaded {} records from {}",
        records.len(),
        args.infile.display()
    );

    let provider = build_provider(&args.provider_config(config))?;
    let psort = args.psort_config(config);
    let summary = ambrosia_psort::run(
        &psort,
        records,
        &*provider,
        progress,
        &CancelToken::new(),
    )?;

    if progress.is_tty() {
        summary.print();
    } else {
        summary.log();
    }

    if summary.interrupted {
        log::warn!(
            "Shutdown requested, {} records left for the next run",
            summary.unfinished()
        );
        return Ok(ExitCode::from(130));
    }
    if summary.failed > 0 {
        log::error!("{} requests failed after retries", summary.failed);
        return Ok(ExitCode::from(1));
    }
    Ok(ExitCode::SUCCESS)
}
