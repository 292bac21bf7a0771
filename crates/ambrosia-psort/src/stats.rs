//! Run summary for one psort invocation

use std::time::Duration;

use ambrosia_core::ShardReport;
use ambrosia_core::progress::fmt_num;
use comfy_table::{Attribute, Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};

/// What one run did, from resolution to the last shard flush.
#[derive(Debug, Clone, Default)]
pub struct Summary {
    /// Records in the input file
    pub input_records: usize,
    /// Rows found in shard files from earlier runs
    pub already_completed: usize,
    /// Records left to process after resolution
    pub todo: usize,
    /// Records appended to shards this run
    pub written: usize,
    /// Responses dropped for an empty completion
    pub skipped_empty: usize,
    /// Requests abandoned by the retry policy
    pub failed: usize,
    pub retries: usize,
    /// Calls admitted by the rate limiter, retries included
    pub requests_admitted: u64,
    /// Tokens reported by the service
    pub tokens_used: u64,
    pub shards: Vec<ShardReport>,
    pub interrupted: bool,
    pub elapsed: Duration,
}

impl Summary {
    /// Todo records neither written, skipped nor failed
    pub fn unfinished(&self) -> usize {
        self.todo
            .saturating_sub(self.written + self.skipped_empty + self.failed)
    }

    pub fn is_success(&self) -> bool {
        !self.interrupted && self.failed == 0
    }

    /// Log minimal summary (non-TTY mode).
    pub fn log(&self) {
        log::info!(
            "psort {}: {} written, {} skipped, {} failed, {} retries, {} tokens [{:.1}s]",
            if self.interrupted { "interrupted" } else { "complete" },
            fmt_num(self.written as u64),
            fmt_num(self.skipped_empty as u64),
            fmt_num(self.failed as u64),
            fmt_num(self.retries as u64),
            fmt_num(self.tokens_used),
            self.elapsed.as_secs_f64()
        );
        for shard in &self.shards {
            log::info!(
                "shard '{}': {} rows -> {}",
                shard.shard,
                fmt_num(shard.rows as u64),
                shard.path.display()
            );
        }
    }

    /// Format summary table as a string.
    pub fn format_table(&self) -> String {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec![
                Cell::new("psort")
                    .fg(Color::Cyan)
                    .add_attribute(Attribute::Bold),
                Cell::new("Value").fg(Color::Cyan),
            ]);

        let num = |n: usize| fmt_num(n as u64);
        table.add_row(vec![Cell::new("Input records"), Cell::new(num(self.input_records))]);
        table.add_row(vec![
            Cell::new("Already completed"),
            Cell::new(num(self.already_completed)),
        ]);
        table.add_row(vec![Cell::new("To do"), Cell::new(num(self.todo))]);
        table.add_row(vec![
            Cell::new("Written").fg(Color::Green),
            Cell::new(num(self.written)).fg(Color::Green),
        ]);
        table.add_row(vec![
            Cell::new("Skipped (empty)"),
            Cell::new(num(self.skipped_empty)),
        ]);
        let failed_color = if self.failed > 0 { Color::Red } else { Color::Reset };
        table.add_row(vec![
            Cell::new("Failed").fg(failed_color),
            Cell::new(num(self.failed)).fg(failed_color),
        ]);
        table.add_row(vec![Cell::new("Retries"), Cell::new(num(self.retries))]);
        table.add_row(vec![
            Cell::new("Requests admitted"),
            Cell::new(fmt_num(self.requests_admitted)),
        ]);
        table.add_row(vec![Cell::new("Tokens used"), Cell::new(fmt_num(self.tokens_used))]);
        for shard in &self.shards {
            table.add_row(vec![
                Cell::new(format!("Shard '{}'", shard.shard)),
                Cell::new(num(shard.rows)),
            ]);
        }
        if self.interrupted {
            table.add_row(vec![
                Cell::new("Interrupted").fg(Color::Yellow),
                Cell::new(format!("{} unfinished", num(self.unfinished()))).fg(Color::Yellow),
            ]);
        }
        table.add_row(vec![
            Cell::new("Elapsed"),
            Cell::new(format!("{:.1}s", self.elapsed.as_secs_f64())),
        ]);

        format!("\n{table}")
    }

    /// Print summary table to stderr (TTY mode).
    pub fn print(&self) {
        eprintln!("{}", self.format_table());
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn sample() -> Summary {
        Summary {
            input_records: 1200,
            already_completed: 200,
            todo: 1000,
            written: 990,
            skipped_empty: 4,
            failed: 1,
            retries: 12,
            requests_admitted: 1003,
            tokens_used: 45_210,
            shards: vec![
                ShardReport {
                    shard: 'N',
                    path: PathBuf::from("data_psort_N.jsonl"),
                    rows: 400,
                },
                ShardReport {
                    shard: 'Y',
                    path: PathBuf::from("data_psort_Y.jsonl"),
                    rows: 590,
                },
            ],
            interrupted: false,
            elapsed: Duration::from_secs(42),
        }
    }

    #[test]
    fn unfinished_counts_remaining() {
        let mut s = sample();
        assert_eq!(s.unfinished(), 5);
        s.written = 2000;
        assert_eq!(s.unfinished(), 0);
    }

    #[test]
    fn success_requires_no_failures() {
        let mut s = sample();
        assert!(!s.is_success());
        s.failed = 0;
        assert!(s.is_success());
        s.interrupted = true;
        assert!(!s.is_success());
    }

    #[test]
    fn table_lists_shards() {
        let table = sample().format_table();
        assert!(table.contains("Shard 'N'"));
        assert!(table.contains("Shard 'Y'"));
        assert!(table.contains("45,210"));
        assert!(!table.contains("Interrupted"));
    }

    #[test]
    fn table_flags_interruption() {
        let s = Summary {
            interrupted: true,
            ..sample()
        };
        assert!(s.format_table().contains("5 unfinished"));
    }
}
