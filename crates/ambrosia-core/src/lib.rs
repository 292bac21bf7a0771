//! Ambrosia Core - Common infrastructure for dataset preparation pipelines
//!
//! This crate provides reusable components for loading JSONL records,
//! budgeting requests against remote services, and writing results
//! into resumable sharded outputs.

pub mod http;
pub mod limiter;
pub mod logging;
pub mod progress;
pub mod record;
pub mod retry;
pub mod shutdown;
pub mod sink;

// Re-exports for convenience
pub use http::{HttpError, SHARED_RUNTIME, http_client};
pub use limiter::{Bucket, Limiter, LimiterConfig, LimiterStats};
pub use logging::{LogFormat, ProgressLogger, init_logging};
pub use progress::{ProgressContext, SharedProgress};
pub use record::{COMPLETION_KEY, Record, RecordError, load_jsonl, same_record, write_jsonl};
pub use retry::{Backoff, RetryPolicy};
pub use shutdown::{CancelToken, Cancelled, is_shutdown_requested, shutdown_flag};
pub use sink::{AppendError, ShardReport, ShardSink, ShardTemplate, shard_key};
