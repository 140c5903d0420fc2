use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};

use crate::runs::{GenerationFailure, ItemStatus};

pub type EventPayload = Map<String, Value>;

/// What a progress observer learns each time a batch item settles.
#[derive(Debug, Clone, Copy)]
pub struct ProgressUpdate<'a> {
    pub index: usize,
    pub total: usize,
    pub status: ItemStatus,
    pub images: usize,
    pub attempts: u32,
    pub error: Option<&'a GenerationFailure>,
}

/// Hook for front ends that render batch progress.
///
/// Called synchronously on the batch thread right after an item settles.
pub trait ProgressObserver {
    fn on_item_complete(&self, update: &ProgressUpdate<'_>);
}

impl<F> ProgressObserver for F
where
    F: Fn(&ProgressUpdate<'_>),
{
    fn on_item_complete(&self, update: &ProgressUpdate<'_>) {
        self(update)
    }
}

/// Envelope keys every event line starts with. Payload entries using these
/// names are dropped.
pub const ENVELOPE_KEYS: [&str; 3] = ["type", "run_id", "ts"];

/// Append-only JSONL run log.
///
/// The file is opened on the first event and kept open. Clones share the
/// handle, so lines from one batch never interleave.
#[derive(Debug, Clone)]
pub struct EventWriter {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    path: PathBuf,
    run_id: String,
    file: Mutex<Option<File>>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                path: path.into(),
                run_id: run_id.into(),
                file: Mutex::new(None),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn run_id(&self) -> &str {
        &self.shared.run_id
    }

    /// Appends one event and returns it as written.
    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = EventPayload::new();
        event.insert("type".to_string(), json!(event_type));
        event.insert("run_id".to_string(), json!(self.shared.run_id));
        event.insert("ts".to_string(), json!(now_utc_iso()));
        for (key, value) in payload {
            if ENVELOPE_KEYS.contains(&key.as_str()) {
                tracing::debug!(event = event_type, key = %key, "dropping reserved payload key");
                continue;
            }
            event.insert(key, value);
        }

        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        self.append(line.as_bytes())?;
        Ok(Value::Object(event))
    }

    fn append(&self, line: &[u8]) -> anyhow::Result<()> {
        let mut file = self
            .shared
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        if file.is_none() {
            *file = Some(self.open()?);
        }
        if let Some(file) = file.as_mut() {
            file.write_all(line)
                .with_context(|| format!("failed appending to {}", self.path().display()))?;
        }
        Ok(())
    }

    fn open(&self) -> anyhow::Result<File> {
        let path = &self.shared.path;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open event log {}", path.display()))
    }
}

impl ProgressObserver for EventWriter {
    fn on_item_complete(&self, update: &ProgressUpdate<'_>) {
        let mut payload = map_object(json!({
            "index": update.index,
            "total": update.total,
            "status": update.status.as_str(),
            "images": update.images,
            "attempts": update.attempts,
        }));
        if let Some(error) = update.error {
            payload.insert("reason".to_string(), json!(error.reason.as_str()));
            payload.insert("error".to_string(), json!(error.message));
        }
        if let Err(err) = self.emit("item_completed", payload) {
            tracing::warn!(path = %self.path().display(), "event write failed: {err:#}");
        }
    }
}

/// Non-object values become an empty payload.
pub fn map_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::fs;

    use chrono::DateTime;

    use super::*;
    use crate::runs::FailureReason;

    fn read_lines(path: &Path) -> anyhow::Result<Vec<Value>> {
        let content = fs::read_to_string(path)?;
        Ok(content
            .lines()
            .map(serde_json::from_str::<Value>)
            .collect::<Result<_, _>>()?)
    }

    #[test]
    fn log_file_appears_with_the_first_event() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("out").join("events.jsonl");
        let writer = EventWriter::new(&path, "run-7f3a");
        assert!(!path.exists());

        let emitted = writer.emit("batch_started", map_object(json!({ "total": 3 })))?;

        let lines = read_lines(&path)?;
        assert_eq!(lines, vec![emitted]);
        assert_eq!(lines[0]["type"], json!("batch_started"));
        assert_eq!(lines[0]["run_id"], json!("run-7f3a"));
        assert_eq!(lines[0]["total"], json!(3));
        let ts = lines[0]["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn payload_cannot_rewrite_the_envelope() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "run-7f3a");

        let emitted = writer.emit(
            "item_retry",
            map_object(json!({
                "type": "spoofed",
                "run_id": "other-run",
                "index": 1,
                "attempt": 2,
                "delay_ms": 2000,
                "reason": "rate_limited",
            })),
        )?;

        assert_eq!(emitted["type"], json!("item_retry"));
        assert_eq!(emitted["run_id"], json!("run-7f3a"));
        assert_eq!(emitted["delay_ms"], json!(2000));
        assert_eq!(emitted["reason"], json!("rate_limited"));
        Ok(())
    }

    #[test]
    fn clones_append_to_one_log_in_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "run-7f3a");
        let clone = writer.clone();

        writer.emit("batch_started", map_object(json!({ "total": 1 })))?;
        clone.emit("batch_finished", map_object(json!({ "succeeded": 1 })))?;

        let kinds: Vec<Value> = read_lines(&path)?
            .into_iter()
            .map(|line| line["type"].clone())
            .collect();
        assert_eq!(kinds, [json!("batch_started"), json!("batch_finished")]);
        Ok(())
    }

    #[test]
    fn observer_events_carry_failure_reason() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "run-123");
        let failure = GenerationFailure::new(FailureReason::RateLimited, "429 from service");

        writer.on_item_complete(&ProgressUpdate {
            index: 0,
            total: 2,
            status: ItemStatus::Succeeded,
            images: 4,
            attempts: 1,
            error: None,
        });
        writer.on_item_complete(&ProgressUpdate {
            index: 1,
            total: 2,
            status: ItemStatus::Failed,
            images: 0,
            attempts: 3,
            error: Some(&failure),
        });

        let lines = read_lines(&path)?;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], json!("item_completed"));
        assert_eq!(lines[0]["images"], json!(4));
        assert!(lines[0].get("reason").is_none());
        assert_eq!(lines[1]["status"], json!("failed"));
        assert_eq!(lines[1]["reason"], json!("rate_limited"));
        Ok(())
    }

    #[test]
    fn closures_are_observers() {
        let seen = RefCell::new(Vec::new());
        let observer = |update: &ProgressUpdate<'_>| seen.borrow_mut().push(update.index);
        observer.on_item_complete(&ProgressUpdate {
            index: 7,
            total: 8,
            status: ItemStatus::Failed,
            images: 0,
            attempts: 0,
            error: None,
        });
        assert_eq!(seen.into_inner(), vec![7]);
    }
}
