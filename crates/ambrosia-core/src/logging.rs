//! Log setup for the CLI.
//!
//! Three sinks: colored lines printed above the progress bars on a TTY, plain
//! `[LEVEL] message` lines otherwise, and JSON objects for log shippers.

use std::io::Write;

use indicatif::MultiProgress;

/// Output format for non-TTY logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// `[LEVEL] message`
    #[default]
    Plain,
    /// One JSON object per line
    Json,
}

const RESET: &str = "\x1b[0m";

/// Five-column label so messages line up
fn label(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "ERROR",
        log::Level::Warn => "WARN ",
        log::Level::Info => "INFO ",
        log::Level::Debug => "DEBUG",
        log::Level::Trace => "TRACE",
    }
}

fn color(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "\x1b[31m",
        log::Level::Warn => "\x1b[33m",
        log::Level::Info => "\x1b[32m",
        log::Level::Debug => "\x1b[36m",
        log::Level::Trace => "\x1b[35m",
    }
}

fn tag(level: log::Level, ansi: bool) -> String {
    if ansi {
        format!("[{}{}{RESET}]", color(level), label(level))
    } else {
        format!("[{}]", label(level))
    }
}

fn json_line(record: &log::Record) -> String {
    serde_json::json!({
        "level": record.level().as_str().to_ascii_lowercase(),
        "target": record.target(),
        "msg": record.args().to_string(),
    })
    .to_string()
}

/// Prints through a `MultiProgress` so log lines never split a bar redraw.
pub struct ProgressLogger {
    filter: env_logger::Logger,
    multi: MultiProgress,
}

impl ProgressLogger {
    pub fn new(filter: env_logger::Logger, multi: MultiProgress) -> Self {
        Self { filter, multi }
    }
}

impl log::Log for ProgressLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.filter.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if !self.filter.matches(record) {
            return;
        }
        let line = format!("{} {}", tag(record.level(), true), record.args());
        self.multi.suspend(|| eprintln!("{line}"));
    }

    fn flush(&self) {
        self.filter.flush();
    }
}

/// Install the global logger. Later calls are ignored.
///
/// `RUST_LOG` overrides the level picked from `quiet`/`debug`. Passing `multi`
/// selects the TTY sink unless `format` asks for JSON.
pub fn init_logging(quiet: bool, debug: bool, format: LogFormat, multi: Option<&MultiProgress>) {
    let level = match (debug, quiet) {
        (true, _) => "debug",
        (false, true) => "warn",
        (false, false) => "info",
    };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));

    if let (Some(multi), LogFormat::Plain) = (multi, format) {
        let filter = builder.build();
        let max = filter.filter();
        if log::set_boxed_logger(Box::new(ProgressLogger::new(filter, multi.clone()))).is_ok() {
            log::set_max_level(max);
        }
        return;
    }

    match format {
        LogFormat::Json => builder.format(|buf, record| writeln!(buf, "{}", json_line(record))),
        LogFormat::Plain => builder.format(|buf, record| {
            writeln!(buf, "{} {}", tag(record.level(), false), record.args())
        }),
    };
    let _ = builder.try_init();
}
