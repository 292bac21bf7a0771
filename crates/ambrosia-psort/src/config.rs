//! psort pipeline configuration

use std::path::PathBuf;
use std::time::Duration;

use ambrosia_core::{LimiterConfig, RetryPolicy};

use crate::error::ProviderError;
use crate::prompt::PromptTemplate;

/// Command identifier used in shard file names
pub const COMMAND: &str = "psort";

/// Runtime configuration for one psort run
#[derive(Debug, Clone)]
pub struct Config {
    /// Input JSONL; shard files are written beside it
    pub input_path: PathBuf,
    pub prompt: PromptTemplate,
    /// Store the completion on output records under the reserved key
    pub include_completion: bool,
    /// Echo prompts instead of calling the service; bypasses the limiter
    pub dry_run: bool,
    /// Number of concurrent dispatcher workers
    pub concurrency: usize,
    pub rpm: u64,
    pub tpm: u64,
    pub retry: RetryPolicy<ProviderError>,
    /// Show a record progress bar (TTY only)
    pub progress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_path: PathBuf::from("input.jsonl"),
            prompt: PromptTemplate::default(),
            include_completion: false,
            dry_run: false,
            concurrency: 10,
            rpm: 3150,
            tpm: 81_000,
            retry: RetryPolicy::forever(Duration::from_secs(1)),
            progress: false,
        }
    }
}

impl Config {
    /// Bounded queue size between pipeline stages
    pub fn queue_capacity(&self) -> usize {
        self.concurrency.max(1) * 2
    }

    pub fn limiter(&self) -> LimiterConfig {
        LimiterConfig::per_minute(self.rpm, self.tpm)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.concurrency > 0, "concurrency must be at least 1");
        if !self.dry_run {
            anyhow::ensure!(self.rpm > 0, "rpm must be at least 1");
            anyhow::ensure!(self.tpm > 0, "tpm must be at least 1");
        }
        Ok(())
    }
}
