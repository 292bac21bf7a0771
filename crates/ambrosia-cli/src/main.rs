//! ambrosia - dataset preparation with LLM prompts
//!
//! Sends every record of a JSONL file to a text-generation service and sorts
//! the records into shard files by the completion they received.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use ambrosia_core::{LogFormat, shutdown_flag};
use clap::{Parser, Subcommand};

mod cmd;
mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "ambrosia")]
#[command(about = "Dataset preparation with LLM prompts")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true, env = "AMBROSIA_DEBUG")]
    debug: bool,

    /// Emit log lines as JSON objects
    #[arg(long, global = true, env = "AMBROSIA_LOG_JSON")]
    log_json: bool,

    /// Config file path (default: ./ambrosia.toml or ~/.config/ambrosia/config.toml)
    #[arg(short = 'C', long, global = true, env = "AMBROSIA_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Prompt a model per record and sort records into shards by its answer
    Psort(cmd::psort::PsortArgs),
    /// Show current configuration
    Config,
}

fn setup_signal_handler() -> std::io::Result<()> {
    // First signal: set graceful shutdown flag
    // Second signal: force exit
    // SAFETY: AtomicBool::swap and process::exit are async-signal-safe
    unsafe {
        signal_hook::low_level::register(signal_hook::consts::SIGTERM, || {
            if shutdown_flag().swap(true, Ordering::Relaxed) {
                std::process::exit(130);
            }
        })?;
        signal_hook::low_level::register(signal_hook::consts::SIGINT, || {
            if shutdown_flag().swap(true, Ordering::Relaxed) {
                std::process::exit(130);
            }
        })?;
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Progress context (TTY auto-detect)
    let progress = Arc::new(ambrosia_core::ProgressContext::new());

    // Logging:
    //   TTY + progress bar: quiet (warn) unless --debug
    //   otherwise:          info unless --debug
    let is_tty = progress.is_tty();
    let bars = matches!(&cli.command, Command::Psort(args) if args.progress);
    let format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Plain
    };
    let multi = if is_tty && !cli.log_json {
        Some(progress.multi())
    } else {
        None
    };
    let quiet = is_tty && bars && !cli.debug;
    ambrosia_core::init_logging(quiet, cli.debug, format, multi);

    if let Err(e) = setup_signal_handler() {
        log::warn!("Failed to register signal handlers: {e}");
    }

    match run(cli, &progress) {
        Ok(code) => code,
        Err(e) => {
            log::error!("Fatal error: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli, progress: &ambrosia_core::SharedProgress) -> anyhow::Result<ExitCode> {
    let config = if let Some(path) = cli.config {
        Config::from_file(&path)?
    } else {
        Config::load()?
    };

    match cli.command {
        Command::Psort(args) => cmd::psort::run(args, &config, progress),
        Command::Config => {
            print_config(&config);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_config(config: &Config) {
    use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Setting").fg(Color::Cyan),
            Cell::new("Value").fg(Color::Cyan),
        ]);

    table.add_row(vec!["Base URL", &config.provider.base_url]);
    table.add_row(vec!["Model", &config.provider.model]);
    table.add_row(vec![
        "API key",
        if config.provider.api_key.is_some() {
            "configured"
        } else {
            "not set"
        },
    ]);
    table.add_row(vec![
        "Timeout",
        &format!("{}s", config.provider.timeout_secs),
    ]);
    table.add_row(vec!["Max tokens", &config.provider.max_tokens.to_string()]);
    table.add_row(vec!["Requests/min", &config.limits.rpm.to_string()]);
    table.add_row(vec!["Tokens/min", &config.limits.tpm.to_string()]);
    table.add_row(vec!["Concurrency", &config.limits.concurrency.to_string()]);
    table.add_row(vec![
        "Max retries",
        &config
            .retry
            .max_retries
            .map_or_else(|| "unlimited".to_string(), |n| n.to_string()),
    ]);
    let backoff = match config.retry.max_backoff_ms {
        Some(max) => format!("{}ms doubling to {max}ms", config.retry.backoff_ms),
        None => format!("{}ms", config.retry.backoff_ms),
    };
    table.add_row(vec!["Backoff", &backoff]);
    table.add_row(vec![
        "Retry",
        if config.retry.transient_only {
            "transient errors only"
        } else {
            "all errors"
        },
    ]);

    eprintln!("\n{table}");
}
