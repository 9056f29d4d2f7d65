//! JSON-lines audit log sink.
//!
//! Writes one JSON object per line to an append-only writer. Each line holds
//! the event type, a timestamp, a unique record ID, and the record fields.
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use uuid::Uuid;

use crate::events::{AuditSink, EventFields, EventType};

/// Event type key in each written line.
pub const EVENT_TYPE: &str = "event";
/// RFC 3339 emission time key.
pub const EVENT_TIME: &str = "time";
/// Unique record ID key.
pub const EVENT_ID: &str = "uid";

/// Audit sink writing structured JSON to an append-only file or writer.
pub struct JsonAuditLog {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl JsonAuditLog {
    /// Create an audit log that appends to the given file path, creating
    /// parent directories as needed.
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!("failed to create audit log directory {}: {e}", parent.display())
            })?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open audit log {}: {e}", path.display()))?;
        Ok(Self {
            writer: Mutex::new(Box::new(file)),
        })
    }

    /// Create an audit log from an arbitrary writer (stdout, tests).
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Write a single JSON line.
    fn write_entry(&self, event: EventType, fields: EventFields) -> anyhow::Result<()> {
        let mut entry = EventFields::new();
        entry.insert(EVENT_TYPE.to_owned(), event.as_str().into());
        entry.insert(EVENT_ID.to_owned(), Uuid::new_v4().to_string().into());
        entry.insert(EVENT_TIME.to_owned(), Utc::now().to_rfc3339().into());
        entry.extend(fields);

        let line = serde_json::to_string(&entry)?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|e| anyhow::anyhow!("audit lock poisoned: {e}"))?;
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }
}

impl AuditSink for JsonAuditLog {
    fn emit_audit_event(&self, event: EventType, fields: EventFields) {
        if let Err(e) = self.write_entry(event, fields) {
            tracing::warn!(event = %event, error = %e, "failed to write audit record");
        }
    }
}
