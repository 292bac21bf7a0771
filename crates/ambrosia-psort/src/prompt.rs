//! Prompt compiler: record + template -> request

use std::fmt::Write as _;
use std::sync::mpsc::SyncSender;

use ambrosia_core::{COMPLETION_KEY, CancelToken, Record};
use serde_json::Value;

use crate::provider::Request;

/// How selected fields are laid out in the prompt body
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Render {
    /// One `field: value` line per field
    #[default]
    Text,
    /// The selected fields as a single JSON object
    Json,
}

/// Prompt layout shared by every record of a run
#[derive(Debug, Clone, Default)]
pub struct PromptTemplate {
    /// Text placed before the record body
    pub instruction: Option<String>,
    /// Text placed after the record body
    pub end_instruction: Option<String>,
    pub system_prompt: Option<String>,
    /// Fields to include, in order. Empty means every field, sorted by name.
    pub fields: Vec<String>,
    pub render: Render,
}

fn non_empty(s: &Option<String>) -> Option<&str> {
    s.as_deref().filter(|s| !s.is_empty())
}

impl PromptTemplate {
    /// Field names to render for `record`, skipping ones it lacks
    fn selected<'a>(&'a self, record: &'a Record) -> Vec<&'a str> {
        if self.fields.is_empty() {
            let mut keys: Vec<&str> = record
                .keys()
                .map(String::as_str)
                .filter(|k| *k != COMPLETION_KEY)
                .collect();
            keys.sort_unstable();
            keys
        } else {
            self.fields
                .iter()
                .map(String::as_str)
                .filter(|f| record.contains_key(*f))
                .collect()
        }
    }

    fn render_body(&self, record: &Record, out: &mut String) {
        let fields = self.selected(record);
        match self.render {
            Render::Text => {
                for field in fields {
                    match &record[field] {
                        Value::String(s) => {
                            let _ = writeln!(out, "{field}: {s}");
                        }
                        other => {
                            let _ = writeln!(out, "{field}: {other}");
                        }
                    }
                }
            }
            Render::Json => {
                let subset: Record = fields
                    .into_iter()
                    .map(|f| (f.to_string(), record[f].clone()))
                    .collect();
                let _ = writeln!(out, "{}", Value::Object(subset));
            }
        }
    }

    /// Compiled prompt text for one record, trimmed
    pub fn prompt(&self, record: &Record) -> String {
        let mut out = String::new();
        if let Some(instruction) = non_empty(&self.instruction) {
            let _ = write!(out, "{instruction}\n\n");
        }
        self.render_body(record, &mut out);
        if let Some(end) = non_empty(&self.end_instruction) {
            let _ = write!(out, "\n{end}\n");
        }
        out.trim().to_string()
    }

    pub fn compile(&self, id: usize, record: &Record) -> Request {
        Request {
            id,
            system_prompt: self.system_prompt.clone().unwrap_or_default(),
            prompt: self.prompt(record),
        }
    }
}

/// Compile `records` in order and send them down the request queue.
///
/// Stops early when `cancel` fires or the receiving side hangs up. Returns the
/// number of requests sent; dropping `tx` on return closes the queue.
pub fn submit(
    template: &PromptTemplate,
    records: &[Record],
    tx: SyncSender<Request>,
    cancel: &CancelToken,
) -> usize {
    let mut sent = 0;
    for (id, record) in records.iter().enumerate() {
        if cancel.is_cancelled() {
            log::debug!("prompt submission cancelled after {sent} requests");
            break;
        }
        if tx.send(template.compile(id, record)).is_err() {
            log::debug!("request queue closed after {sent} requests");
            break;
        }
        sent += 1;
    }
    sent
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::sync_channel;

    use serde_json::json;

    use super::*;

    fn record(v: Value) -> Record {
        match v {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn sample() -> Record {
        record(json!({"text": "The cat sat.", "score": 3, "tags": ["a", "b"]}))
    }

    #[test]
    fn text_all_fields_sorted() {
        let t = PromptTemplate::default();
        assert_eq!(
            t.prompt(&sample()),
            "score: 3\ntags: [\"a\",\"b\"]\ntext: The cat sat."
        );
    }

    #[test]
    fn text_selected_fields_in_order() {
        let t = PromptTemplate {
            fields: vec!["text".into(), "missing".into(), "score".into()],
            ..Default::default()
        };
        assert_eq!(t.prompt(&sample()), "text: The cat sat.\nscore: 3");
    }

    #[test]
    fn instructions_wrap_body() {
        let t = PromptTemplate {
            instruction: Some("Rate this sentence.".into()),
            end_instruction: Some("Answer with one digit.".into()),
            fields: vec!["text".into()],
            ..Default::default()
        };
        assert_eq!(
            t.prompt(&sample()),
            "Rate this sentence.\n\ntext: The cat sat.\n\nAnswer with one digit."
        );
    }

    #[test]
    fn empty_instructions_ignored() {
        let t = PromptTemplate {
            instruction: Some(String::new()),
            end_instruction: Some(String::new()),
            fields: vec!["score".into()],
            ..Default::default()
        };
        assert_eq!(t.prompt(&sample()), "score: 3");
    }

    #[test]
    fn json_selected_fields() {
        let t = PromptTemplate {
            fields: vec!["text".into(), "score".into()],
            render: Render::Json,
            ..Default::default()
        };
        let prompt = t.prompt(&sample());
        let parsed: Value = serde_json::from_str(&prompt).unwrap();
        assert_eq!(parsed, json!({"text": "The cat sat.", "score": 3}));
    }

    #[test]
    fn json_all_fields_skips_completion_key() {
        let mut r = sample();
        r.insert(COMPLETION_KEY.to_string(), json!("Yes"));
        let t = PromptTemplate {
            render: Render::Json,
            ..Default::default()
        };
        let parsed: Value = serde_json::from_str(&t.prompt(&r)).unwrap();
        assert_eq!(parsed, Value::Object(sample()));
    }

    #[test]
    fn text_all_fields_skips_completion_key() {
        let mut r = record(json!({"text": "hi"}));
        r.insert(COMPLETION_KEY.to_string(), json!("Yes"));
        assert_eq!(PromptTemplate::default().prompt(&r), "text: hi");
    }

    #[test]
    fn compile_carries_id_and_system_prompt() {
        let t = PromptTemplate {
            system_prompt: Some("You are a grader.".into()),
            fields: vec!["text".into()],
            ..Default::default()
        };
        let req = t.compile(4, &sample());
        assert_eq!(req.id, 4);
        assert_eq!(req.system_prompt, "You are a grader.");
        assert_eq!(req.prompt, "text: The cat sat.");
        assert_eq!(req.byte_estimate(), (17 + 18) as u64);
    }

    #[test]
    fn deterministic() {
        let t = PromptTemplate::default();
        assert_eq!(t.prompt(&sample()), t.prompt(&sample()));
    }

    #[test]
    fn submit_sends_all_in_order() {
        let records = vec![sample(), record(json!({"text": "b"})), record(json!({"text": "c"}))];
        let (tx, rx) = sync_channel(8);
        let sent = submit(&PromptTemplate::default(), &records, tx, &CancelToken::new());
        assert_eq!(sent, 3);
        let ids: Vec<usize> = rx.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn submit_stops_when_cancelled() {
        let records = vec![sample(), sample()];
        let (tx, rx) = sync_channel(8);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(submit(&PromptTemplate::default(), &records, tx, &cancel), 0);
        assert!(rx.recv().is_err());
    }

    #[test]
    fn submit_stops_when_receiver_dropped() {
        let records = vec![sample(), sample()];
        let (tx, rx) = sync_channel(8);
        drop(rx);
        assert_eq!(
            submit(&PromptTemplate::default(), &records, tx, &CancelToken::new()),
            0
        );
    }
}
