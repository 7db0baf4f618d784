// Data models: Rust structs that map to document store rows.
//
// These are the types that flow through the crawl and transfer pipelines.
// They're separate from the SQL so other modules can use them without
// depending on rusqlite or sqlx directly.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Timestamp layout used for every stored time value. Fixed precision keeps
/// the strings lexicographically ordered, so SQL range filters work on TEXT.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Format a local timestamp the way the stores expect it.
pub fn format_timestamp(at: NaiveDateTime) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a stored timestamp. Returns None for malformed values.
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT).ok()
}

/// Current local time in the stored layout.
pub fn now_timestamp() -> String {
    format_timestamp(chrono::Local::now().naive_local())
}

/// The mutable display fields of an account as seen in a following list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountProfile {
    pub external_id: String,
    pub handle: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

/// A stored account. `status` is set to "new" on first insert and never
/// touched by re-discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub external_id: String,
    pub handle: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Status written on first discovery of an account.
pub const ACCOUNT_STATUS_NEW: &str = "new";

/// A directed following relationship (subject follows target).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub id: i64,
    pub subject_id: String,
    pub target_id: String,
    pub created_at: String,
}

/// Lifecycle of a queued subject. Transitions only move forward, except
/// for an explicit manual reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WorkStatus {
    New,
    Processing,
    Completed,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::New => "new",
            WorkStatus::Processing => "processing",
            WorkStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "new" => Some(WorkStatus::New),
            "processing" => Some(WorkStatus::Processing),
            "completed" => Some(WorkStatus::Completed),
            _ => None,
        }
    }

    /// Statuses that may legally advance to `self`.
    pub fn predecessors(&self) -> &'static [WorkStatus] {
        match self {
            WorkStatus::New => &[],
            WorkStatus::Processing => &[WorkStatus::New],
            WorkStatus::Completed => &[WorkStatus::New, WorkStatus::Processing],
        }
    }
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A subject waiting in one of the crawl queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub queue: String,
    pub external_id: String,
    pub handle: Option<String>,
    pub display_name: Option<String>,
    pub status: WorkStatus,
    pub last_scanned_at: Option<String>,
}

/// Point-in-time dump of every raw page entry seen during one crawl.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub external_id: String,
    pub handle: Option<String>,
    pub records: Vec<serde_json::Value>,
    pub captured_at: String,
}

/// Session material for one bot account used against the following API.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub handle: String,
    pub cookie: String,
    pub auth_token: String,
    pub csrf_token: String,
    pub user_agent: String,
    pub status: String,
}

/// Credentials with this status are excluded from the rotation pool.
pub const CREDENTIAL_STATUS_ERROR: &str = "error";
pub const CREDENTIAL_STATUS_ACTIVE: &str = "active";

// Session secrets must never end up in logs.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("handle", &self.handle)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Which collection a transfer-status flag belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    Account,
    Edge,
}

impl TransferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferKind::Account => "account",
            TransferKind::Edge => "edge",
        }
    }
}

impl std::fmt::Display for TransferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of one transfer attempt, written against every record it covered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Transferred,
    Failed(String),
}

/// Stored per-environment transfer flag for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferState {
    pub transferred: bool,
    pub error: Option<String>,
    pub updated_at: String,
}

/// Per-document tallies from an unordered bulk write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkWriteSummary {
    /// Documents newly inserted
    pub inserted: usize,
    /// Documents that already existed (updated in place, or skipped for edges)
    pub existing: usize,
    /// Documents whose write failed; the rest of the batch still went through
    pub failed: usize,
}

impl BulkWriteSummary {
    pub fn merge(&mut self, other: BulkWriteSummary) {
        self.inserted += other.inserted;
        self.existing += other.existing;
        self.failed += other.failed;
    }
}

/// Row counts used by the status report.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub accounts: i64,
    pub edges: i64,
    pub snapshots: i64,
    pub active_credentials: i64,
    /// (queue, status, count)
    pub queue_counts: Vec<(String, String, i64)>,
    pub untransferred_accounts: i64,
    pub untransferred_edges: i64,
    pub failed_transfers: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_timestamp_roundtrip_keeps_millis() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_milli_opt(9, 5, 7, 42)
            .unwrap();
        let text = format_timestamp(at);
        assert_eq!(text, "2024-03-01 09:05:07.042");
        assert_eq!(parse_timestamp(&text), Some(at));
    }

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let earlier = "2023-12-31 23:59:59.000";
        let later = "2024-01-01 00:00:00.000";
        assert!(earlier < later);
    }

    #[test]
    fn test_work_status_parse() {
        assert_eq!(WorkStatus::parse("new"), Some(WorkStatus::New));
        assert_eq!(WorkStatus::parse("processing"), Some(WorkStatus::Processing));
        assert_eq!(WorkStatus::parse("completed"), Some(WorkStatus::Completed));
        assert_eq!(WorkStatus::parse("done"), None);
    }

    #[test]
    fn test_work_status_only_moves_forward() {
        assert!(WorkStatus::Completed.predecessors().contains(&WorkStatus::Processing));
        assert!(!WorkStatus::New.predecessors().contains(&WorkStatus::Completed));
        assert!(!WorkStatus::Processing
            .predecessors()
            .contains(&WorkStatus::Completed));
    }

    #[test]
    fn test_credential_debug_hides_secrets() {
        let cred = Credential {
            handle: "bot_one".to_string(),
            cookie: "auth_token=supersecret".to_string(),
            auth_token: "Bearer AAAA".to_string(),
            csrf_token: "csrf123".to_string(),
            user_agent: "Mozilla/5.0".to_string(),
            status: CREDENTIAL_STATUS_ACTIVE.to_string(),
        };
        let debug = format!("{cred:?}");
        assert!(debug.contains("bot_one"));
        assert!(!debug.contains("supersecret"));
        assert!(!debug.contains("csrf123"));
    }
}
