//! Prefix-sharded, append-only JSONL sink.
//!
//! Completed records are routed to one file per shard character, derived from
//! the completion text. Shard files are the durable record of finished work, so
//! every append is flushed before it returns.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use rustc_hash::FxHashMap;
use unicode_properties::{GeneralCategoryGroup, UnicodeGeneralCategory};

use crate::record::{COMPLETION_KEY, Record, encode_line};

/// Shard used when a completion has no usable leading character
pub const FALLBACK_SHARD: char = '_';

/// Error appending one record
#[derive(Debug)]
pub enum AppendError {
    /// Nothing to route on; the record was not written
    EmptyCompletion,
    Io { path: PathBuf, source: io::Error },
    Encode(serde_json::Error),
}

impl std::fmt::Display for AppendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyCompletion => f.write_str("empty completion"),
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::Encode(e) => write!(f, "encoding record: {e}"),
        }
    }
}

impl std::error::Error for AppendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::EmptyCompletion => None,
            Self::Io { source, .. } => Some(source),
            Self::Encode(e) => Some(e),
        }
    }
}

/// Shard file naming: `<dir>/<name>_<command>_<c><ext>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardTemplate {
    dir: PathBuf,
    prefix: String,
    ext: String,
}

impl ShardTemplate {
    /// Shards for `input` produced by `command`, placed beside the input.
    ///
    /// `data/train.jsonl` + `psort` → `data/train_psort_<c>.jsonl`
    pub fn for_input(input: &Path, command: &str) -> Self {
        let dir = input
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = input
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        Self {
            dir,
            prefix: format!("{stem}_{command}_"),
            ext,
        }
    }

    pub fn path_for(&self, shard: char) -> PathBuf {
        self.dir.join(format!("{}{shard}{}", self.prefix, self.ext))
    }

    /// Glob matching every shard path of this template (one character wide)
    pub fn glob_pattern(&self) -> String {
        let dir = self.dir.to_string_lossy();
        let name = format!(
            "{}?{}",
            glob::Pattern::escape(&self.prefix),
            glob::Pattern::escape(&self.ext)
        );
        if dir.is_empty() {
            name
        } else {
            format!("{}/{name}", glob::Pattern::escape(&dir))
        }
    }

    /// Shard character of a path produced by this template
    pub fn shard_of(&self, path: &Path) -> Option<char> {
        let name = path.file_name()?.to_str()?;
        let middle = name.strip_prefix(&self.prefix)?.strip_suffix(&self.ext)?;
        let mut chars = middle.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Some(c),
            _ => None,
        }
    }
}

/// Unicode general category P*. ASCII symbols such as `$+<=>^|~` are
/// category S and stay usable shard characters.
fn is_punctuation(c: char) -> bool {
    c.general_category_group() == GeneralCategoryGroup::Punctuation
}

/// Shard character for a completion: the first char that is neither
/// whitespace nor punctuation. `None` for an empty completion.
pub fn shard_key(completion: &str) -> Option<char> {
    if completion.is_empty() {
        return None;
    }
    let key = completion
        .chars()
        .find(|c| !c.is_whitespace() && !is_punctuation(*c))
        .unwrap_or(FALLBACK_SHARD);
    Some(key)
}

struct ShardFile {
    path: PathBuf,
    writer: Mutex<ShardWriter>,
}

struct ShardWriter {
    out: BufWriter<File>,
    rows: usize,
}

impl ShardFile {
    fn open(path: PathBuf) -> Result<Self, AppendError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| AppendError::Io {
                path: path.clone(),
                source,
            })?;
        log::debug!("opened shard {}", path.display());
        Ok(Self {
            path,
            writer: Mutex::new(ShardWriter {
                out: BufWriter::new(file),
                rows: 0,
            }),
        })
    }

    fn append(&self, line: &[u8]) -> Result<(), AppendError> {
        let io_err = |source| AppendError::Io {
            path: self.path.clone(),
            source,
        };
        let mut w = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        w.out.write_all(line).map_err(io_err)?;
        w.out.flush().map_err(io_err)?;
        w.rows += 1;
        Ok(())
    }
}

/// Rows appended to one shard during this run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardReport {
    pub shard: char,
    pub path: PathBuf,
    pub rows: usize,
}

/// Append-only writer distributing records across shard files.
///
/// Safe to share between threads: appends to one shard are serialized, appends
/// to different shards only contend on the brief shard-map lookup.
pub struct ShardSink {
    template: ShardTemplate,
    shards: Mutex<FxHashMap<char, Arc<ShardFile>>>,
}

impl std::fmt::Debug for ShardSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardSink")
            .field("template", &self.template)
            .finish_non_exhaustive()
    }
}

impl ShardSink {
    pub fn new(template: ShardTemplate) -> Self {
        Self {
            template,
            shards: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn template(&self) -> &ShardTemplate {
        &self.template
    }

    fn shard(&self, key: char) -> Result<Arc<ShardFile>, AppendError> {
        let mut shards = self.shards.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(shard) = shards.get(&key) {
            return Ok(shard.clone());
        }
        let shard = Arc::new(ShardFile::open(self.template.path_for(key))?);
        shards.insert(key, shard.clone());
        Ok(shard)
    }

    /// Append `record` to the shard selected by `completion`.
    ///
    /// Returns the shard character. An empty completion writes nothing.
    pub fn append(&self, completion: &str, record: &Record) -> Result<char, AppendError> {
        let key = shard_key(completion).ok_or(AppendError::EmptyCompletion)?;
        let line = encode_line(record).map_err(AppendError::Encode)?;
        self.shard(key)?.append(&line)?;
        Ok(key)
    }

    /// Like [`append`](Self::append), storing the completion under [`COMPLETION_KEY`] first.
    pub fn append_with_completion(
        &self,
        completion: &str,
        mut record: Record,
    ) -> Result<char, AppendError> {
        if completion.is_empty() {
            return Err(AppendError::EmptyCompletion);
        }
        record.insert(COMPLETION_KEY.to_string(), completion.into());
        self.append(completion, &record)
    }

    /// Flush and close every shard file, reporting rows written per shard.
    pub fn close(self) -> io::Result<Vec<ShardReport>> {
        let shards = self
            .shards
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        let mut reports = Vec::with_capacity(shards.len());
        for (shard, file) in shards {
            let Ok(file) = Arc::try_unwrap(file) else {
                return Err(io::Error::other(format!(
                    "shard '{shard}' still in use at close"
                )));
            };
            let writer = file
                .writer
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner);
            let out = writer.out.into_inner().map_err(|e| e.into_error())?;
            out.sync_all()?;
            reports.push(ShardReport {
                shard,
                path: file.path,
                rows: writer.rows,
            });
        }
        reports.sort_by_key(|r| r.shard);
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::load_jsonl;
    use serde_json::json;
    use tempfile::TempDir;

    fn rec(v: serde_json::Value) -> Record {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn shard_key_skips_space_and_punct() {
        assert_eq!(shard_key("Yes"), Some('Y'));
        assert_eq!(shard_key("  \"no\"."), Some('n'));
        assert_eq!(shard_key("\n- 1. item"), Some('1'));
        assert_eq!(shard_key("«Oui»"), Some('O'));
        assert_eq!(shard_key("$5"), Some('$'));
        assert_eq!(shard_key("？是"), Some('是'));
        assert_eq!(shard_key("：好"), Some('好'));
        assert_eq!(shard_key("؟نعم"), Some('ن'));
        assert_eq!(shard_key("।हाँ"), Some('ह'));
        assert_eq!(shard_key("\u{2e18}si"), Some('s'));
        assert_eq!(shard_key("\u{fe10}\u{fe6b}x"), Some('x'));
    }

    #[test]
    fn shard_key_edge_cases() {
        assert_eq!(shard_key(""), None);
        assert_eq!(shard_key("  ...  "), Some(FALLBACK_SHARD));
    }

    #[test]
    fn shard_key_case_sensitive() {
        assert_ne!(shard_key("yes"), shard_key("Yes"));
    }

    #[test]
    fn template_paths() {
        let t = ShardTemplate::for_input(Path::new("data/train.jsonl"), "psort");
        assert_eq!(t.path_for('Y'), PathBuf::from("data/train_psort_Y.jsonl"));
        assert_eq!(t.shard_of(Path::new("data/train_psort_Y.jsonl")), Some('Y'));
        assert_eq!(t.shard_of(Path::new("data/train_psort_YY.jsonl")), None);
        assert_eq!(t.shard_of(Path::new("data/train_dedupe.jsonl")), None);
    }

    #[test]
    fn template_without_extension() {
        let t = ShardTemplate::for_input(Path::new("/tmp/data"), "psort");
        assert_eq!(t.path_for('a'), PathBuf::from("/tmp/data_psort_a"));
        assert_eq!(t.glob_pattern(), "/tmp/data_psort_?");
    }

    #[test]
    fn glob_pattern_escapes_literals() {
        let t = ShardTemplate::for_input(Path::new("/tmp/[x]/in*.jsonl"), "psort");
        let pattern = glob::Pattern::new(&t.glob_pattern()).unwrap();
        assert!(pattern.matches("/tmp/[x]/in*_psort_a.jsonl"));
        assert!(!pattern.matches("/tmp/x/inZ_psort_a.jsonl"));
    }

    #[test]
    fn empty_completion_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let sink = ShardSink::new(ShardTemplate::for_input(&dir.path().join("in.jsonl"), "psort"));
        let err = sink.append("", &rec(json!({"a": 1}))).unwrap_err();
        assert!(matches!(err, AppendError::EmptyCompletion));
        let err = sink
            .append_with_completion("", rec(json!({"a": 1})))
            .unwrap_err();
        assert!(matches!(err, AppendError::EmptyCompletion));
        assert!(sink.close().unwrap().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn routes_by_prefix_and_round_trips() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.jsonl");
        let sink = ShardSink::new(ShardTemplate::for_input(&input, "psort"));

        let a = rec(json!({"q": "first"}));
        let b = rec(json!({"q": "second"}));
        let c = rec(json!({"q": "third"}));
        assert_eq!(sink.append_with_completion("Yes", a.clone()).unwrap(), 'Y');
        assert_eq!(sink.append_with_completion(" no", b.clone()).unwrap(), 'n');
        assert_eq!(sink.append("Yep", &c).unwrap(), 'Y');

        let reports = sink.close().unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!((reports[0].shard, reports[0].rows), ('Y', 2));
        assert_eq!((reports[1].shard, reports[1].rows), ('n', 1));

        let yes = load_jsonl(&dir.path().join("in_psort_Y.jsonl")).unwrap();
        assert_eq!(yes.len(), 2);
        assert_eq!(yes[0]["ambrosia"], json!("Yes"));
        assert_eq!(yes[0]["q"], json!("first"));
        assert_eq!(yes[1], c);

        let no = load_jsonl(&dir.path().join("in_psort_n.jsonl")).unwrap();
        assert_eq!(no[0]["ambrosia"], json!(" no"));
    }

    #[test]
    fn appends_to_existing_shard() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.jsonl");
        let existing = dir.path().join("in_psort_Y.jsonl");
        std::fs::write(&existing, "{\"q\":\"old\"}\n").unwrap();

        let sink = ShardSink::new(ShardTemplate::for_input(&input, "psort"));
        sink.append("Yes", &rec(json!({"q": "new"}))).unwrap();
        sink.close().unwrap();

        let rows = load_jsonl(&existing).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["q"], json!("old"));
        assert_eq!(rows[1]["q"], json!("new"));
    }

    #[test]
    fn flushed_before_close() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.jsonl");
        let sink = ShardSink::new(ShardTemplate::for_input(&input, "psort"));
        sink.append("abc", &rec(json!({"k": 1}))).unwrap();
        // Visible on disk without closing the sink
        let rows = load_jsonl(&dir.path().join("in_psort_a.jsonl")).unwrap();
        assert_eq!(rows.len(), 1);
        drop(sink);
    }

    #[test]
    fn concurrent_appends() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.jsonl");
        let sink = ShardSink::new(ShardTemplate::for_input(&input, "psort"));
        std::thread::scope(|s| {
            for t in 0..4 {
                let sink = &sink;
                s.spawn(move || {
                    for i in 0..50 {
                        let completion = if i % 2 == 0 { "even" } else { "odd" };
                        sink.append(completion, &rec(json!({"t": t, "i": i})))
                            .unwrap();
                    }
                });
            }
        });
        let reports = sink.close().unwrap();
        let total: usize = reports.iter().map(|r| r.rows).sum();
        assert_eq!(total, 200);
        assert_eq!(
            load_jsonl(&dir.path().join("in_psort_e.jsonl")).unwrap().len(),
            100
        );
        assert_eq!(
            load_jsonl(&dir.path().join("in_psort_o.jsonl")).unwrap().len(),
            100
        );
    }
}
