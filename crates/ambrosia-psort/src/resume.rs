//! Resumable work-set resolution from existing shard files

use std::path::Path;

use ambrosia_core::record::identity_key;
use ambrosia_core::{Record, ShardTemplate, load_jsonl};
use anyhow::Context;
use rustc_hash::FxHashSet;

/// Load every record already written to a shard of `input` by `command`.
///
/// Shards are concatenated in path order; rows within a shard keep file order.
pub fn load_completed(input: &Path, command: &str) -> anyhow::Result<Vec<Record>> {
    let template = ShardTemplate::for_input(input, command);
    let pattern = template.glob_pattern();
    log::debug!("scanning for shard files matching {pattern}");

    let mut paths = Vec::new();
    for entry in glob::glob(&pattern).context("Invalid shard glob pattern")? {
        let path = entry.context("Failed to list output directory")?;
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut completed = Vec::new();
    for path in paths {
        let records = load_jsonl(&path)
            .with_context(|| format!("Failed to load shard {}", path.display()))?;
        log::debug!(
            "shard '{}': {} records in {}",
            template.shard_of(&path).unwrap_or('?'),
            records.len(),
            path.display()
        );
        completed.extend(records);
    }
    Ok(completed)
}

/// Records of `input` that have no equal (ignoring the completion key) in
/// `completed`, in input order.
pub fn subtract(input: Vec<Record>, completed: &[Record]) -> Vec<Record> {
    if completed.is_empty() {
        return input;
    }
    let done: FxHashSet<String> = completed.iter().map(identity_key).collect();
    input
        .into_iter()
        .filter(|r| !done.contains(&identity_key(r)))
        .collect()
}

/// Work still to do for `records` read from `input`.
///
/// Returns the todo set and how many completed rows the shards hold.
pub fn resolve(
    input: &Path,
    command: &str,
    records: Vec<Record>,
) -> anyhow::Result<(Vec<Record>, usize)> {
    log::info!("checking for resumable outputs beside {}", input.display());
    let completed = load_completed(input, command)?;
    if completed.is_empty() {
        log::debug!("no resumable outputs found");
        return Ok((records, 0));
    }
    log::debug!("resumable data found: {} records", completed.len());
    let todo = subtract(records, &completed);
    log::info!("resuming: {} records remaining", todo.len());
    Ok((todo, completed.len()))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use ambrosia_core::{COMPLETION_KEY, write_jsonl};
    use serde_json::{Value, json};
    use tempfile::TempDir;

    use super::*;

    fn rec(v: Value) -> Record {
        v.as_object().unwrap().clone()
    }

    fn with_completion(v: Value, completion: &str) -> Record {
        let mut r = rec(v);
        r.insert(COMPLETION_KEY.to_string(), json!(completion));
        r
    }

    #[test]
    fn subtract_preserves_order() {
        let input = vec![
            rec(json!({"id": 1})),
            rec(json!({"id": 2})),
            rec(json!({"id": 3})),
            rec(json!({"id": 4})),
        ];
        let completed = vec![rec(json!({"id": 3})), with_completion(json!({"id": 1}), "Yes")];
        let todo = subtract(input, &completed);
        assert_eq!(todo, vec![rec(json!({"id": 2})), rec(json!({"id": 4}))]);
    }

    #[test]
    fn subtract_nothing_completed() {
        let input = vec![rec(json!({"a": "x"})), rec(json!({"a": "y"}))];
        assert_eq!(subtract(input.clone(), &[]), input);
    }

    #[test]
    fn subtract_ignores_completion_on_input_side() {
        let input = vec![with_completion(json!({"a": 1}), "old")];
        let completed = vec![rec(json!({"a": 1}))];
        assert!(subtract(input, &completed).is_empty());
    }

    #[test]
    fn subtract_removes_duplicates_of_completed() {
        let input = vec![rec(json!({"a": 1})), rec(json!({"a": 1})), rec(json!({"a": 2}))];
        let completed = vec![rec(json!({"a": 1}))];
        assert_eq!(subtract(input, &completed), vec![rec(json!({"a": 2}))]);
    }

    #[test]
    fn subtract_distinguishes_values() {
        let input = vec![rec(json!({"a": 1, "b": [1, 2]}))];
        let completed = vec![rec(json!({"a": 1, "b": [2, 1]}))];
        assert_eq!(subtract(input.clone(), &completed), input);
    }

    #[test]
    fn load_completed_reads_matching_shards_only() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("data.jsonl");
        fs::write(&input, "{\"a\":1}\n").unwrap();

        write_jsonl(
            &dir.path().join("data_psort_Y.jsonl"),
            &[with_completion(json!({"a": 1}), "Yes")],
        )
        .unwrap();
        write_jsonl(
            &dir.path().join("data_psort_N.jsonl"),
            &[rec(json!({"a": 2})), rec(json!({"a": 3}))],
        )
        .unwrap();
        // Not shards of this input/command
        write_jsonl(&dir.path().join("data_dedupe.jsonl"), &[rec(json!({"a": 9}))]).unwrap();
        write_jsonl(&dir.path().join("data_psort_YY.jsonl"), &[rec(json!({"a": 8}))]).unwrap();
        write_jsonl(&dir.path().join("other_psort_Y.jsonl"), &[rec(json!({"a": 7}))]).unwrap();

        let completed = load_completed(&input, "psort").unwrap();
        assert_eq!(completed.len(), 3);
        // Path order: N before Y
        assert_eq!(completed[0], rec(json!({"a": 2})));
        assert_eq!(completed[2]["a"], json!(1));
    }

    #[test]
    fn load_completed_none() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("data.jsonl");
        assert!(load_completed(&input, "psort").unwrap().is_empty());
    }

    #[test]
    fn load_completed_malformed_shard_fails() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("data.jsonl");
        fs::write(dir.path().join("data_psort_a.jsonl"), "{\"a\":1}\nnot json\n").unwrap();
        let err = load_completed(&input, "psort").unwrap_err();
        assert!(format!("{err:#}").contains(":2:"));
    }

    #[test]
    fn resolve_reports_completed_count() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("data.jsonl");
        write_jsonl(
            &dir.path().join("data_psort_1.jsonl"),
            &[with_completion(json!({"n": 1}), "1")],
        )
        .unwrap();
        let records = vec![rec(json!({"n": 1})), rec(json!({"n": 2}))];
        let (todo, completed) = resolve(&input, "psort", records).unwrap();
        assert_eq!(completed, 1);
        assert_eq!(todo, vec![rec(json!({"n": 2}))]);
    }

    #[test]
    fn glob_metacharacters_in_name() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("set[1].jsonl");
        write_jsonl(&dir.path().join("set[1]_psort_x.jsonl"), &[rec(json!({"a": 1}))]).unwrap();
        assert_eq!(load_completed(&input, "psort").unwrap().len(), 1);
    }
}
