//! Prompt-dispatch pipeline ("psort").
//!
//! Turns JSONL records into prompts, sends them to a text-generation service
//! under a requests/tokens-per-minute budget and writes every completed record
//! to a shard file chosen by the first letter of its completion. Shard files
//! double as the resume state: rerunning on the same input only issues calls
//! for records no shard holds yet.

pub mod config;
pub mod error;
pub mod prompt;
pub mod provider;
pub mod resume;
pub mod runner;
pub mod stats;
pub mod worker;

pub use config::{COMMAND, Config};
pub use error::ProviderError;
pub use prompt::{PromptTemplate, Render};
pub use provider::{
    DryRun, OpenAi, OpenAiConfig, Provider, ProviderConfig, Request, Response, build_provider,
};
pub use runner::run;
pub use stats::Summary;
pub use worker::{DispatchStats, Dispatcher};
