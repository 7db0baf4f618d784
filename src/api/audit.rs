// Append-only audit files. Best-effort: a failed write is logged and
// otherwise ignored, it never fails a fetch or a crawl.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::db::models::now_timestamp;

#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    responses: Option<PathBuf>,
    record_errors: Option<PathBuf>,
}

impl AuditLog {
    /// `None` disables the corresponding file.
    pub fn new(responses: Option<PathBuf>, record_errors: Option<PathBuf>) -> Self {
        Self {
            responses,
            record_errors,
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// One block per fetch: timestamp, cursor, raw body.
    pub fn record_response(&self, cursor: &str, body: &str) {
        if let Some(path) = &self.responses {
            let entry = format!(
                "Date: {}\nCursor: {}\nResponse: {}\n\n",
                now_timestamp(),
                cursor,
                body
            );
            append(path, &entry);
        }
    }

    /// One line per record that failed to ingest.
    pub fn record_error(&self, subject_id: &str, record: &serde_json::Value, error: &str) {
        if let Some(path) = &self.record_errors {
            let entry = format!(
                "{} subject={} error={} record={}\n",
                now_timestamp(),
                subject_id,
                error,
                record
            );
            append(path, &entry);
        }
    }
}

fn append(path: &Path, entry: &str) {
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| file.write_all(entry.as_bytes()));

    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Failed to write audit entry");
    }
}
