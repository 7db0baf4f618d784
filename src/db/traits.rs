// Store traits: backend-agnostic async interfaces for both stores.
//
// DocumentStore is the primary store the crawler writes into (implemented by
// SqliteStore). RelationalStore is the replication target the transfer
// process writes into (implemented by PgStore).
//
// All methods are async so the sync rusqlite backend (behind a Mutex) and
// the native async sqlx backend fit behind the same kind of interface.

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use super::models::{
    Account, AccountProfile, BulkWriteSummary, Credential, Edge, RawSnapshot, StoreStats,
    TransferKind, TransferOutcome, TransferState, WorkItem, WorkStatus,
};
use crate::queue::WorkQueue;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    // --- Lifecycle ---

    /// Count the number of user-created tables.
    async fn table_count(&self) -> Result<i64>;

    // --- Accounts ---

    /// Insert with status "new", or refresh display fields of an existing
    /// account without touching its status.
    async fn upsert_account(&self, profile: &AccountProfile) -> Result<()>;

    /// Unordered bulk form of `upsert_account`.
    async fn upsert_many_accounts(&self, profiles: &[AccountProfile]) -> Result<BulkWriteSummary>;

    async fn get_account(&self, external_id: &str) -> Result<Option<Account>>;

    // --- Edges ---

    /// Insert the edge if absent. Returns whether it already existed.
    async fn add_edge(&self, subject_id: &str, target_id: &str) -> Result<bool>;

    /// Unordered bulk form of `add_edge` for one subject.
    async fn add_many_edges(&self, subject_id: &str, target_ids: &[String])
        -> Result<BulkWriteSummary>;

    async fn get_edges(&self, subject_id: &str) -> Result<Vec<Edge>>;

    // --- Raw snapshots ---

    /// Overwrite the subject's snapshot with the records of the latest crawl.
    async fn save_snapshot(
        &self,
        external_id: &str,
        handle: Option<&str>,
        records: &[serde_json::Value],
    ) -> Result<()>;

    async fn get_snapshot(&self, external_id: &str) -> Result<Option<RawSnapshot>>;

    // --- Work queues ---

    /// Queue a subject (status "new" on first insert).
    async fn upsert_work_item(
        &self,
        queue: &str,
        external_id: &str,
        handle: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<()>;

    /// Next eligible item whose last scan is older than `cutoff`.
    async fn next_work_item(&self, queue: &WorkQueue, cutoff: &str) -> Result<Option<WorkItem>>;

    /// Atomically claim an item. False means someone else claimed it first.
    async fn claim_work_item(
        &self,
        queue: &WorkQueue,
        external_id: &str,
        cutoff: &str,
        now: &str,
    ) -> Result<bool>;

    /// Forward-only status move. False if the move would go backward.
    async fn advance_work_status(&self, queue: &str, external_id: &str, to: WorkStatus)
        -> Result<bool>;

    /// Stamp `last_scanned_at` and complete a "processing" item.
    async fn finish_work_item(&self, queue: &str, external_id: &str, scanned_at: &str)
        -> Result<()>;

    /// Manual reset to "new" with no scan time.
    async fn reset_work_item(&self, queue: &str, external_id: &str) -> Result<bool>;

    async fn get_work_item(&self, queue: &str, external_id: &str) -> Result<Option<WorkItem>>;

    /// Whether the subject already sits in any of `queues`.
    async fn queued_in_any(&self, queues: &[&str], external_id: &str) -> Result<bool>;

    // --- Credentials ---

    /// Credentials eligible for rotation (status other than "error").
    async fn load_credentials(&self) -> Result<Vec<Credential>>;

    async fn list_credentials(&self) -> Result<Vec<Credential>>;

    async fn upsert_credential(&self, credential: &Credential) -> Result<()>;

    async fn set_credential_status(&self, handle: &str, status: &str) -> Result<bool>;

    // --- Transfer outbox ---

    /// Up to `limit` accounts not yet transferred to `environment`.
    async fn pending_accounts(&self, environment: &str, limit: u32) -> Result<Vec<Account>>;

    /// Up to `limit` edges not yet transferred to `environment`.
    async fn pending_edges(&self, environment: &str, limit: u32) -> Result<Vec<Edge>>;

    /// Record one outcome against every key. Never flips true back to false.
    async fn mark_transfer(
        &self,
        kind: TransferKind,
        keys: &[String],
        environment: &str,
        outcome: &TransferOutcome,
    ) -> Result<()>;

    async fn transfer_state(
        &self,
        kind: TransferKind,
        key: &str,
        environment: &str,
    ) -> Result<Option<TransferState>>;

    // --- Stats ---

    async fn stats(&self, environment: &str) -> Result<StoreStats>;
}

/// Failure of a write against the relational store.
#[derive(Debug, Error)]
pub enum TransferError {
    /// No connection could be acquired. The batch was not attempted.
    #[error("relational store pool exhausted: {0}")]
    PoolExhausted(String),

    /// The statement or transaction failed and was rolled back.
    #[error("{0}")]
    Database(String),
}

/// Where upstream subjects are imported from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectSource {
    /// Registered users, destined for the "user" queue
    Users,
    /// Tracked accounts, destined for the "tracking" queue
    Tracking,
}

impl SubjectSource {
    /// Queue the imported subjects land in.
    pub fn queue(&self) -> crate::queue::WorkQueue {
        match self {
            SubjectSource::Users => crate::queue::USER,
            SubjectSource::Tracking => crate::queue::TRACKING,
        }
    }
}

/// A subject listed by the relational store's upstream tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub external_id: String,
    pub handle: Option<String>,
}

#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// One multi-row upsert inside a transaction, keyed by external_id.
    async fn upsert_accounts(&self, accounts: &[Account], stamp: &str) -> Result<(), TransferError>;

    /// One multi-row upsert inside a transaction, keyed by (subject_id, target_id).
    async fn upsert_edges(&self, edges: &[Edge], stamp: &str) -> Result<(), TransferError>;

    /// Subjects to seed the crawl queues with.
    async fn load_subjects(&self, source: SubjectSource) -> Result<Vec<Subject>>;
}
