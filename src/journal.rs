// =============================================================================
// Execution journal — append-only JSONL event log with trace propagation
// =============================================================================
//
// The journal supports incident forensics and execution attribution. Every
// entry is one JSON object per line; files are never rewritten, so readers
// must tolerate a partial trailing line. All timestamps are UTC ISO-8601
// with millisecond precision and an explicit Z suffix.
// =============================================================================

use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::error;
use uuid::Uuid;

use crate::types::TradingMode;

/// Unified UTC timestamp helper so the journal never mixes local-time and
/// UTC entries.
pub fn utc_now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Current unix time, seconds with fractional part.
pub fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Trace context
// ---------------------------------------------------------------------------

/// Threads related journal events together. Each `next_span` call mints a
/// fresh span id and chains it as the parent of the following one.
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub trace_id: String,
    pub parent_span_id: Option<String>,
    pub tags: Map<String, Value>,
}

impl TraceContext {
    pub fn new(tags: Map<String, Value>) -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
            parent_span_id: None,
            tags,
        }
    }

    /// Build a spanned journal payload for `operation`, merging in `extra`
    /// fields. Mutates the context so the next span points back at this one.
    pub fn next_span(&mut self, operation: &str, extra: Map<String, Value>) -> Map<String, Value> {
        let span_id = Uuid::new_v4().simple().to_string()[..16].to_string();

        let mut payload = Map::new();
        payload.insert("trace_id".into(), json!(self.trace_id));
        payload.insert("span_id".into(), json!(span_id));
        payload.insert(
            "parent_span_id".into(),
            self.parent_span_id
                .as_deref()
                .map(|s| json!(s))
                .unwrap_or(Value::Null),
        );
        payload.insert("operation".into(), json!(operation));
        payload.insert("timestamp".into(), json!(utc_now_iso()));
        if !self.tags.is_empty() {
            payload.insert("tags".into(), Value::Object(self.tags.clone()));
        }
        for (k, v) in extra {
            payload.insert(k, v);
        }

        self.parent_span_id = Some(span_id);
        payload
    }
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

/// Append-only event journal. Appends are serialised by a mutex; a failed
/// write is logged and swallowed — journalling must never take the engine
/// down.
pub struct ExecutionJournal {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ExecutionJournal {
    pub fn new(trading_mode: TradingMode, base_dir: &Path) -> Self {
        Self {
            path: base_dir.join(format!("execution_journal_{trading_mode}.jsonl")),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. `payload` fields land at the top level next to
    /// `event_type` and `timestamp`.
    pub fn append(&self, event_type: &str, payload: Map<String, Value>) {
        let mut entry = Map::new();
        entry.insert("event_type".into(), json!(event_type));
        entry.insert("timestamp".into(), json!(utc_now_iso()));
        for (k, v) in payload {
            // A spanned payload carries its own timestamp; the entry-level
            // stamp wins so readers can sort on one field.
            if k == "timestamp" {
                continue;
            }
            entry.insert(k, v);
        }

        let line = match serde_json::to_string(&Value::Object(entry)) {
            Ok(line) => line,
            Err(err) => {
                error!(error = %err, "failed to serialise journal event");
                return;
            }
        };

        let _guard = self.lock.lock();
        if let Err(err) = self.append_line(&line) {
            error!(error = %err, path = %self.path.display(), "failed to append journal event");
        }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// Read every parseable entry, skipping blank and partial trailing lines.
    pub fn read_entries(&self) -> Vec<Map<String, Value>> {
        let Ok(content) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str::<Value>(l).ok())
            .filter_map(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect()
    }
}

impl std::fmt::Debug for ExecutionJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionJournal")
            .field("path", &self.path)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn utc_stamp_has_z_suffix_and_millis() {
        let ts = utc_now_iso();
        assert!(ts.ends_with('Z'), "timestamp {ts} should end with Z");
        // e.g. 2025-01-02T03:04:05.678Z
        assert_eq!(ts.len(), 24, "unexpected stamp shape: {ts}");
    }

    #[test]
    fn spans_chain_parent_ids() {
        let mut trace = TraceContext::new(obj(&[("tradingsymbol", json!("NIFTY24DEC24500CE"))]));

        let first = trace.next_span("signal_received", Map::new());
        assert_eq!(first["parent_span_id"], Value::Null);
        let first_span = first["span_id"].as_str().unwrap().to_string();

        let second = trace.next_span("order_placed", Map::new());
        assert_eq!(second["parent_span_id"].as_str().unwrap(), first_span);
        assert_eq!(second["trace_id"], first["trace_id"]);
        assert_eq!(second["tags"]["tradingsymbol"], json!("NIFTY24DEC24500CE"));
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let journal = ExecutionJournal::new(TradingMode::Paper, dir.path());

        journal.append("order_placed", obj(&[("order_id", json!("paper_1"))]));
        journal.append("order_fill", obj(&[("order_id", json!("paper_1"))]));

        let entries = journal.read_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["event_type"], json!("order_placed"));
        assert_eq!(entries[1]["order_id"], json!("paper_1"));
        assert!(entries[0]["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn partial_trailing_line_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let journal = ExecutionJournal::new(TradingMode::Paper, dir.path());
        journal.append("order_placed", Map::new());

        // Simulate a crash mid-write.
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(journal.path())
            .unwrap();
        file.write_all(b"{\"event_type\": \"order_").unwrap();

        let entries = journal.read_entries();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let journal = ExecutionJournal::new(TradingMode::Live, dir.path());
        assert!(journal.read_entries().is_empty());
    }
}
