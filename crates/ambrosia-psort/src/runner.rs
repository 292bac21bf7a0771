//! Main execution logic for a psort run

use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, sync_channel};
use std::time::Instant;

use ambrosia_core::{
    AppendError, CancelToken, Limiter, ProgressContext, Record, ShardSink, ShardTemplate,
};
use anyhow::{Context, anyhow};
use indicatif::ProgressBar;

use crate::config::{COMMAND, Config};
use crate::provider::{Provider, Response};
use crate::stats::Summary;
use crate::worker::Dispatcher;
use crate::{prompt, resume};

#[derive(Debug, Default)]
struct SinkCounts {
    written: usize,
    skipped_empty: usize,
    tokens: u64,
}

/// Run the pipeline over `records` read from `config.input_path`.
///
/// Records already present in shard files are skipped. Completed records are
/// appended to shards beside the input as responses arrive, so an interrupted
/// run loses at most the calls that were in flight.
pub fn run(
    config: &Config,
    records: Vec<Record>,
    provider: &dyn Provider,
    progress: &ProgressContext,
    cancel: &CancelToken,
) -> anyhow::Result<Summary> {
    config.validate()?;
    let start = Instant::now();
    let input_records = records.len();

    let (todo, already_completed) = resume::resolve(&config.input_path, COMMAND, records)?;
    let mut summary = Summary {
        input_records,
        already_completed,
        todo: todo.len(),
        ..Default::default()
    };
    if todo.is_empty() {
        log::info!("nothing to do: every input record is already in a shard");
        summary.elapsed = start.elapsed();
        return Ok(summary);
    }

    let stage = progress.stage_line("ping");
    stage.set_message(format!("checking {}", provider.name()));
    let pinged = provider.ping();
    stage.finish_and_clear();
    pinged.with_context(|| format!("error with model {}", provider.name()))?;

    let limiter = if config.dry_run {
        None
    } else {
        Some(Limiter::new(config.limiter()).context("Failed to start rate limiter")?)
    };

    // Fatal sink errors cancel this token only, never the caller's
    let run_cancel = cancel.child();
    let dispatcher = Dispatcher::new(
        provider,
        limiter.as_ref(),
        config.retry,
        config.concurrency,
        run_cancel.clone(),
    )?;
    let sink = ShardSink::new(ShardTemplate::for_input(&config.input_path, COMMAND));
    let pb = progress.record_bar("psort", todo.len(), config.progress);

    log::info!(
        "processing {} records with {} workers via {}",
        todo.len(),
        config.concurrency,
        provider.name()
    );

    let (req_tx, req_rx) = sync_channel(config.queue_capacity());
    let (resp_tx, resp_rx) = sync_channel(config.queue_capacity());

    let (drive, dispatch) = std::thread::scope(|s| -> anyhow::Result<_> {
        let (todo, run_cancel, dispatcher) = (&todo, &run_cancel, &dispatcher);

        let producer = std::thread::Builder::new()
            .name("prompt-compiler".into())
            .spawn_scoped(s, move || prompt::submit(&config.prompt, todo, req_tx, run_cancel))
            .context("Failed to spawn prompt compiler")?;
        let workers = std::thread::Builder::new()
            .name("dispatcher".into())
            .spawn_scoped(s, move || dispatcher.run(req_rx, resp_tx))
            .context("Failed to spawn dispatcher")?;

        let drive = drive_sink(&sink, todo, resp_rx, config.include_completion, &pb);
        if drive.is_err() {
            run_cancel.cancel();
        }

        let sent = producer
            .join()
            .map_err(|_| anyhow!("prompt compiler panicked"))?;
        log::debug!("prompt compiler sent {sent} requests");
        let dispatch = workers.join().map_err(|_| anyhow!("dispatcher panicked"))?;
        Ok((drive, dispatch))
    })?;
    pb.finish_and_clear();

    // Close before reporting a sink failure so flushed shards stay usable
    let closed = sink.close();
    let counts = drive?;
    summary.shards = closed.context("Failed to close shard files")?;

    summary.written = counts.written;
    summary.skipped_empty = counts.skipped_empty;
    summary.tokens_used = counts.tokens;
    summary.failed = dispatch.failed;
    summary.retries = dispatch.retries;
    summary.requests_admitted = limiter
        .as_ref()
        .map_or(0, |l| l.stats().requests.load(Ordering::Relaxed));
    summary.interrupted = cancel.is_cancelled() && summary.unfinished() > 0;
    summary.elapsed = start.elapsed();
    Ok(summary)
}

/// Merge each response onto its source record and append it to the sink.
///
/// Returns when every dispatcher worker has exited.
fn drive_sink(
    sink: &ShardSink,
    todo: &[Record],
    rx: Receiver<Response>,
    include_completion: bool,
    pb: &ProgressBar,
) -> anyhow::Result<SinkCounts> {
    let mut counts = SinkCounts::default();
    for response in rx {
        let record = todo
            .get(response.id)
            .ok_or_else(|| anyhow!("response for unknown request {}", response.id))?;
        counts.tokens += response.tokens;

        let appended = if include_completion {
            sink.append_with_completion(&response.completion, record.clone())
        } else {
            sink.append(&response.completion, record)
        };
        match appended {
            Ok(shard) => {
                counts.written += 1;
                log::debug!("request {} -> shard '{shard}'", response.id);
            }
            Err(AppendError::EmptyCompletion) => {
                counts.skipped_empty += 1;
                log::warn!("request {}: empty completion, record skipped", response.id);
            }
            Err(e) => return Err(anyhow::Error::new(e).context("error appending")),
        }
        pb.inc(1);
    }
    Ok(counts)
}
