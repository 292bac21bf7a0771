//! Line-delimited JSON record store

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

/// One dataset entry: a JSON object keyed by field name.
pub type Record = Map<String, Value>;

/// Field holding the model completion on merged output records.
///
/// Ignored when deciding whether two records are the same logical entry.
pub const COMPLETION_KEY: &str = "ambrosia";

/// Error loading or writing a JSONL file
#[derive(Debug)]
pub enum RecordError {
    Io {
        path: PathBuf,
        source: io::Error,
    },
    /// Line is not valid JSON
    Parse {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },
    /// Line is valid JSON but not an object
    NotAnObject { path: PathBuf, line: usize },
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::Parse { path, line, source } => write!(
                f,
                "{}:{line}: {source}: are you using a valid JSONL file?",
                path.display()
            ),
            Self::NotAnObject { path, line } => {
                write!(f, "{}:{line}: expected a JSON object", path.display())
            }
        }
    }
}

impl std::error::Error for RecordError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
            Self::NotAnObject { .. } => None,
        }
    }
}

/// Load every record from a JSONL file, preserving line order.
///
/// Blank lines are skipped; any other line that is not a JSON object fails the load.
pub fn load_jsonl(path: &Path) -> Result<Vec<Record>, RecordError> {
    let io_err = |source| RecordError::Io {
        path: path.to_path_buf(),
        source,
    };
    let reader = BufReader::new(File::open(path).map_err(io_err)?);

    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(io_err)?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line).map_err(|source| RecordError::Parse {
            path: path.to_path_buf(),
            line: idx + 1,
            source,
        })?;
        match value {
            Value::Object(map) => records.push(map),
            _ => {
                return Err(RecordError::NotAnObject {
                    path: path.to_path_buf(),
                    line: idx + 1,
                });
            }
        }
    }
    Ok(records)
}

/// Compact JSON encoding of a record followed by a newline
pub fn encode_line(record: &Record) -> serde_json::Result<Vec<u8>> {
    let mut buf = serde_json::to_vec(record)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Write records to a new JSONL file. Fails if `path` already exists.
pub fn write_jsonl(path: &Path, records: &[Record]) -> Result<(), RecordError> {
    let io_err = |source| RecordError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    for record in records {
        let line = encode_line(record).map_err(|e| io_err(io::Error::other(e)))?;
        writer.write_all(&line).map_err(io_err)?;
    }
    writer.flush().map_err(io_err)
}

/// Equality ignoring [`COMPLETION_KEY`] on both sides
pub fn same_record(a: &Record, b: &Record) -> bool {
    let significant = |r: &Record| r.keys().filter(|k| *k != COMPLETION_KEY).count();
    significant(a) == significant(b)
        && a
            .iter()
            .filter(|(k, _)| *k != COMPLETION_KEY)
            .all(|(k, v)| b.get(k) == Some(v))
}

/// Canonical encoding of a record without [`COMPLETION_KEY`].
///
/// Two records are [`same_record`] iff their identity keys are equal, so the key
/// can stand in for the record in hash sets.
pub fn identity_key(record: &Record) -> String {
    let mut stripped: Vec<(&String, &Value)> = record
        .iter()
        .filter(|(k, _)| *k != COMPLETION_KEY)
        .collect();
    stripped.sort_unstable_by(|a, b| a.0.cmp(b.0));

    let mut key = String::new();
    for (k, v) in stripped {
        // Keys are JSON-quoted, so the separator cannot appear unescaped inside them
        key.push_str(&Value::String(k.clone()).to_string());
        key.push(':');
        push_canonical(&mut key, v);
        key.push('\u{1e}');
    }
    key
}

fn push_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (k, v) in entries {
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                push_canonical(out, v);
                out.push(',');
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for item in items {
                push_canonical(out, item);
                out.push(',');
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
