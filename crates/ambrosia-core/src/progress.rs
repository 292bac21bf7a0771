//! Progress display for interactive runs.
//!
//! On a TTY every bar lives in one `MultiProgress`, which the log bridge also
//! prints through. Elsewhere all bars are hidden and logs carry the progress.

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

const SPINNER_TICK: Duration = Duration::from_millis(80);

/// Records done/total with throughput and ETA
fn record_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix:<8.cyan.bold} {bar:30.green/dim} {pos:>7}/{len:7} {per_sec:>10} {eta:>4} {wide_msg:.dim}")
        .expect("invalid template")
        .progress_chars("--")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.green} {prefix:<8.cyan.bold} {wide_msg}")
        .expect("invalid template")
}

/// Owner of the run's progress bars.
pub struct ProgressContext {
    multi: MultiProgress,
    is_tty: bool,
}

impl ProgressContext {
    /// Draw bars only when stderr is a terminal.
    pub fn new() -> Self {
        Self::with_tty(std::io::stderr().is_terminal())
    }

    /// Never draws; for tests and piped output
    pub fn hidden() -> Self {
        Self::with_tty(false)
    }

    fn with_tty(is_tty: bool) -> Self {
        Self {
            multi: MultiProgress::new(),
            is_tty,
        }
    }

    /// Bar counting processed records. Hidden unless on a TTY and `visible`.
    pub fn record_bar(&self, name: &str, total: usize, visible: bool) -> ProgressBar {
        if !self.is_tty || !visible {
            return ProgressBar::hidden();
        }
        let pb = self.multi.add(ProgressBar::new(total as u64));
        pb.set_style(record_style());
        pb.set_prefix(name.to_string());
        pb
    }

    /// Spinner for a short blocking step; `finish_and_clear` it when done.
    pub fn stage_line(&self, name: &str) -> ProgressBar {
        if !self.is_tty {
            return ProgressBar::hidden();
        }
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(spinner_style());
        pb.set_prefix(name.to_string());
        pb.enable_steady_tick(SPINNER_TICK);
        pb
    }

    pub fn is_tty(&self) -> bool {
        self.is_tty
    }

    /// Handle for the log bridge
    pub fn multi(&self) -> &MultiProgress {
        &self.multi
    }
}

impl Default for ProgressContext {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedProgress = Arc<ProgressContext>;

/// `1234567` -> `"1,234,567"`
pub fn fmt_num(n: u64) -> String {
    let digits = n.to_string();
    let head = digits.len() % 3;
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.char_indices() {
        if i > 0 && (i + 3 - head) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
