// SqliteStore: rusqlite backend implementing the DocumentStore trait.
//
// The Connection is wrapped in tokio::sync::Mutex because Connection is !Send.
// Trait methods lock the mutex, do synchronous rusqlite work, and return.
// Every compare-and-set (claims, status moves) is a single UPDATE, so two
// processes sharing the database file cannot both win the same item.

use anyhow::Result;
use async_trait::async_trait;
use rusqlite::Connection;
use tokio::sync::Mutex;

use super::models::{
    now_timestamp, Account, AccountProfile, BulkWriteSummary, Credential, Edge, RawSnapshot,
    StoreStats, TransferKind, TransferOutcome, TransferState, WorkItem, WorkStatus,
};
use super::queries;
use super::traits::DocumentStore;
use crate::queue::WorkQueue;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Wrap an already-opened rusqlite Connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn table_count(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        super::schema::table_count(&conn)
    }

    async fn upsert_account(&self, profile: &AccountProfile) -> Result<()> {
        let conn = self.conn.lock().await;
        queries::upsert_account(&conn, profile, &now_timestamp())
    }

    async fn upsert_many_accounts(&self, profiles: &[AccountProfile]) -> Result<BulkWriteSummary> {
        let conn = self.conn.lock().await;
        queries::upsert_many_accounts(&conn, profiles, &now_timestamp())
    }

    async fn get_account(&self, external_id: &str) -> Result<Option<Account>> {
        let conn = self.conn.lock().await;
        queries::get_account(&conn, external_id)
    }

    async fn add_edge(&self, subject_id: &str, target_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        queries::add_edge(&conn, subject_id, target_id, &now_timestamp())
    }

    async fn add_many_edges(
        &self,
        subject_id: &str,
        target_ids: &[String],
    ) -> Result<BulkWriteSummary> {
        let conn = self.conn.lock().await;
        queries::add_many_edges(&conn, subject_id, target_ids, &now_timestamp())
    }

    async fn get_edges(&self, subject_id: &str) -> Result<Vec<Edge>> {
        let conn = self.conn.lock().await;
        queries::get_edges(&conn, subject_id)
    }

    async fn save_snapshot(
        &self,
        external_id: &str,
        handle: Option<&str>,
        records: &[serde_json::Value],
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        queries::save_snapshot(&conn, external_id, handle, records, &now_timestamp())
    }

    async fn get_snapshot(&self, external_id: &str) -> Result<Option<RawSnapshot>> {
        let conn = self.conn.lock().await;
        queries::get_snapshot(&conn, external_id)
    }

    async fn upsert_work_item(
        &self,
        queue: &str,
        external_id: &str,
        handle: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        queries::upsert_work_item(&conn, queue, external_id, handle, display_name)
    }

    async fn next_work_item(&self, queue: &WorkQueue, cutoff: &str) -> Result<Option<WorkItem>> {
        let conn = self.conn.lock().await;
        queries::next_work_item(&conn, queue, cutoff)
    }

    async fn claim_work_item(
        &self,
        queue: &WorkQueue,
        external_id: &str,
        cutoff: &str,
        now: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        queries::claim_work_item(&conn, queue, external_id, cutoff, now)
    }

    async fn advance_work_status(
        &self,
        queue: &str,
        external_id: &str,
        to: WorkStatus,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        queries::advance_work_status(&conn, queue, external_id, to)
    }

    async fn finish_work_item(
        &self,
        queue: &str,
        external_id: &str,
        scanned_at: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        queries::finish_work_item(&conn, queue, external_id, scanned_at)
    }

    async fn reset_work_item(&self, queue: &str, external_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        queries::reset_work_item(&conn, queue, external_id)
    }

    async fn get_work_item(&self, queue: &str, external_id: &str) -> Result<Option<WorkItem>> {
        let conn = self.conn.lock().await;
        queries::get_work_item(&conn, queue, external_id)
    }

    async fn queued_in_any(&self, queues: &[&str], external_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        queries::queued_in_any(&conn, queues, external_id)
    }

    async fn load_credentials(&self) -> Result<Vec<Credential>> {
        let conn = self.conn.lock().await;
        queries::load_active_credentials(&conn)
    }

    async fn list_credentials(&self) -> Result<Vec<Credential>> {
        let conn = self.conn.lock().await;
        queries::list_credentials(&conn)
    }

    async fn upsert_credential(&self, credential: &Credential) -> Result<()> {
        let conn = self.conn.lock().await;
        queries::upsert_credential(&conn, credential)
    }

    async fn set_credential_status(&self, handle: &str, status: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        queries::set_credential_status(&conn, handle, status)
    }

    async fn pending_accounts(&self, environment: &str, limit: u32) -> Result<Vec<Account>> {
        let conn = self.conn.lock().await;
        queries::pending_accounts(&conn, environment, limit)
    }

    async fn pending_edges(&self, environment: &str, limit: u32) -> Result<Vec<Edge>> {
        let conn = self.conn.lock().await;
        queries::pending_edges(&conn, environment, limit)
    }

    async fn mark_transfer(
        &self,
        kind: TransferKind,
        keys: &[String],
        environment: &str,
        outcome: &TransferOutcome,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        queries::mark_transfer(&conn, kind, keys, environment, outcome, &now_timestamp())
    }

    async fn transfer_state(
        &self,
        kind: TransferKind,
        key: &str,
        environment: &str,
    ) -> Result<Option<TransferState>> {
        let conn = self.conn.lock().await;
        queries::get_transfer_state(&conn, kind, key, environment)
    }

    async fn stats(&self, environment: &str) -> Result<StoreStats> {
        let conn = self.conn.lock().await;
        queries::stats(&conn, environment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::ACCOUNT_STATUS_NEW;
    use crate::db::schema::create_tables;
    use crate::queue::{AUTO_TRACKING, KOL, USER};

    async fn test_db() -> SqliteStore {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        SqliteStore::new(conn)
    }

    fn profile(id: &str, handle: &str, name: &str) -> AccountProfile {
        AccountProfile {
            external_id: id.to_string(),
            handle: handle.to_string(),
            display_name: name.to_string(),
            avatar_url: Some(format!("https://img.example/{id}.jpg")),
        }
    }

    const CUTOFF: &str = "2024-03-01 00:00:00.000";
    const NOW: &str = "2024-03-01 10:00:00.000";

    #[tokio::test]
    async fn test_trait_table_count() {
        let db = test_db().await;
        assert_eq!(db.table_count().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_upsert_account_refreshes_fields_and_keeps_status() {
        let db = test_db().await;
        db.upsert_account(&profile("42", "old_handle", "Old Name"))
            .await
            .unwrap();

        // Someone downstream moves the status on
        {
            let conn = db.conn.lock().await;
            conn.execute(
                "UPDATE accounts SET status = 'reviewed' WHERE external_id = '42'",
                [],
            )
            .unwrap();
        }

        db.upsert_account(&profile("42", "new_handle", "New Name"))
            .await
            .unwrap();

        let account = db.get_account("42").await.unwrap().unwrap();
        assert_eq!(account.handle, "new_handle");
        assert_eq!(account.display_name, "New Name");
        assert_eq!(account.status, "reviewed");
        assert_eq!(db.stats("dev").await.unwrap().accounts, 1);
    }

    #[tokio::test]
    async fn test_new_account_gets_status_new() {
        let db = test_db().await;
        db.upsert_account(&profile("1", "a", "A")).await.unwrap();
        let account = db.get_account("1").await.unwrap().unwrap();
        assert_eq!(account.status, ACCOUNT_STATUS_NEW);
    }

    #[tokio::test]
    async fn test_add_edge_reports_existing() {
        let db = test_db().await;
        assert!(!db.add_edge("A", "B").await.unwrap());
        for _ in 0..4 {
            assert!(db.add_edge("A", "B").await.unwrap());
        }
        assert_eq!(db.get_edges("A").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bulk_writes_tally_inserted_and_existing() {
        let db = test_db().await;
        db.upsert_account(&profile("1", "a", "A")).await.unwrap();
        let summary = db
            .upsert_many_accounts(&[profile("1", "a", "A2"), profile("2", "b", "B")])
            .await
            .unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.existing, 1);
        assert_eq!(summary.failed, 0);

        db.add_edge("S", "1").await.unwrap();
        let summary = db
            .add_many_edges("S", &["1".to_string(), "2".to_string(), "3".to_string()])
            .await
            .unwrap();
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.existing, 1);
        assert_eq!(db.get_edges("S").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_snapshot_is_overwritten() {
        let db = test_db().await;
        db.save_snapshot("7", Some("seven"), &[serde_json::json!({"n": 1})])
            .await
            .unwrap();
        db.save_snapshot(
            "7",
            Some("seven"),
            &[serde_json::json!({"n": 2}), serde_json::json!({"n": 3})],
        )
        .await
        .unwrap();

        let snapshot = db.get_snapshot("7").await.unwrap().unwrap();
        assert_eq!(snapshot.records.len(), 2);
        assert_eq!(snapshot.records[0]["n"], 2);
        assert_eq!(db.stats("dev").await.unwrap().snapshots, 1);
    }

    #[tokio::test]
    async fn test_next_work_item_respects_cutoff_and_status() {
        let db = test_db().await;
        db.upsert_work_item("user", "fresh", None, None).await.unwrap();
        db.upsert_work_item("user", "stale", None, None).await.unwrap();
        {
            let conn = db.conn.lock().await;
            conn.execute_batch(
                "UPDATE work_items SET status = 'completed';
                 UPDATE work_items SET last_scanned_at = '2024-03-01 00:00:00.000' WHERE external_id = 'fresh';
                 UPDATE work_items SET last_scanned_at = '2024-02-29 23:59:59.000' WHERE external_id = 'stale';",
            )
            .unwrap();
        }

        let next = db.next_work_item(&USER, CUTOFF).await.unwrap().unwrap();
        assert_eq!(next.external_id, "stale");

        // Stamp it; nothing else is eligible today
        assert!(db.claim_work_item(&USER, "stale", CUTOFF, NOW).await.unwrap());
        assert!(db.next_work_item(&USER, CUTOFF).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_computed_cutoff_splits_leap_day_from_first_of_march() {
        let now = chrono::NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let cutoff = crate::db::models::format_timestamp(crate::queue::staleness_cutoff(now));
        assert_eq!(cutoff, CUTOFF);

        let db = test_db().await;
        db.upsert_work_item("kol", "today", None, None).await.unwrap();
        db.upsert_work_item("kol", "leap-day", None, None).await.unwrap();
        {
            let conn = db.conn.lock().await;
            conn.execute_batch(
                "UPDATE work_items SET last_scanned_at = '2024-03-01 00:00:00.000' WHERE external_id = 'today';
                 UPDATE work_items SET last_scanned_at = '2024-02-29 23:59:59.000' WHERE external_id = 'leap-day';",
            )
            .unwrap();
        }

        let next = db.next_work_item(&KOL, &cutoff).await.unwrap().unwrap();
        assert_eq!(next.external_id, "leap-day");
        assert!(db.claim_work_item(&KOL, "leap-day", &cutoff, NOW).await.unwrap());
        assert!(db.next_work_item(&KOL, &cutoff).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_user_queue_requires_completed_status() {
        let db = test_db().await;
        db.upsert_work_item("user", "u1", Some("u1"), None).await.unwrap();
        assert!(db.next_work_item(&USER, CUTOFF).await.unwrap().is_none());
        // kol has no status gate
        db.upsert_work_item("kol", "k1", None, None).await.unwrap();
        assert!(db.next_work_item(&KOL, CUTOFF).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_never_scanned_items_come_first() {
        let db = test_db().await;
        db.upsert_work_item("kol", "scanned", None, None).await.unwrap();
        db.upsert_work_item("kol", "never", None, None).await.unwrap();
        {
            let conn = db.conn.lock().await;
            conn.execute(
                "UPDATE work_items SET last_scanned_at = '2024-01-01 00:00:00.000' WHERE external_id = 'scanned'",
                [],
            )
            .unwrap();
        }
        let next = db.next_work_item(&KOL, CUTOFF).await.unwrap().unwrap();
        assert_eq!(next.external_id, "never");
    }

    #[tokio::test]
    async fn test_claim_by_status_only_succeeds_once() {
        let db = test_db().await;
        db.upsert_work_item("auto-tracking", "x", None, None).await.unwrap();
        assert!(db
            .claim_work_item(&AUTO_TRACKING, "x", CUTOFF, NOW)
            .await
            .unwrap());
        assert!(!db
            .claim_work_item(&AUTO_TRACKING, "x", CUTOFF, NOW)
            .await
            .unwrap());
        let item = db.get_work_item("auto-tracking", "x").await.unwrap().unwrap();
        assert_eq!(item.status, WorkStatus::Processing);
    }

    #[tokio::test]
    async fn test_status_never_moves_backward() {
        let db = test_db().await;
        db.upsert_work_item("auto-tracking", "x", None, None).await.unwrap();
        assert!(db
            .advance_work_status("auto-tracking", "x", WorkStatus::Completed)
            .await
            .unwrap());
        assert!(!db
            .advance_work_status("auto-tracking", "x", WorkStatus::Processing)
            .await
            .unwrap());
        assert!(!db
            .advance_work_status("auto-tracking", "x", WorkStatus::New)
            .await
            .unwrap());

        // Re-queueing keeps the status too
        db.upsert_work_item("auto-tracking", "x", Some("handle"), None)
            .await
            .unwrap();
        let item = db.get_work_item("auto-tracking", "x").await.unwrap().unwrap();
        assert_eq!(item.status, WorkStatus::Completed);
        assert_eq!(item.handle.as_deref(), Some("handle"));
    }

    #[tokio::test]
    async fn test_finish_and_reset() {
        let db = test_db().await;
        db.upsert_work_item("auto-tracking", "x", None, None).await.unwrap();
        db.claim_work_item(&AUTO_TRACKING, "x", CUTOFF, NOW)
            .await
            .unwrap();
        db.finish_work_item("auto-tracking", "x", NOW).await.unwrap();

        let item = db.get_work_item("auto-tracking", "x").await.unwrap().unwrap();
        assert_eq!(item.status, WorkStatus::Completed);
        assert_eq!(item.last_scanned_at.as_deref(), Some(NOW));

        assert!(db.reset_work_item("auto-tracking", "x").await.unwrap());
        let item = db.get_work_item("auto-tracking", "x").await.unwrap().unwrap();
        assert_eq!(item.status, WorkStatus::New);
        assert!(item.last_scanned_at.is_none());
    }

    #[tokio::test]
    async fn test_credentials_flagged_error_are_not_loaded() {
        let db = test_db().await;
        for handle in ["bot_a", "bot_b"] {
            db.upsert_credential(&Credential {
                handle: handle.to_string(),
                cookie: "c".to_string(),
                auth_token: "t".to_string(),
                csrf_token: "x".to_string(),
                user_agent: "ua".to_string(),
                status: "active".to_string(),
            })
            .await
            .unwrap();
        }
        assert!(db.set_credential_status("bot_b", "error").await.unwrap());

        let loaded = db.load_credentials().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].handle, "bot_a");
        assert_eq!(db.list_credentials().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_transferred_records_are_not_reselected() {
        let db = test_db().await;
        db.upsert_account(&profile("1", "a", "A")).await.unwrap();
        db.upsert_account(&profile("2", "b", "B")).await.unwrap();

        db.mark_transfer(
            TransferKind::Account,
            &["1".to_string()],
            "dev",
            &TransferOutcome::Transferred,
        )
        .await
        .unwrap();

        let pending = db.pending_accounts("dev", 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].external_id, "2");

        // Other environments track their own flag
        assert_eq!(db.pending_accounts("prod", 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_records_wait_until_fresh_ones_are_taken() {
        let db = test_db().await;
        for id in ["1", "2", "3"] {
            db.upsert_account(&profile(id, id, id)).await.unwrap();
        }
        db.mark_transfer(
            TransferKind::Account,
            &["1".to_string()],
            "dev",
            &TransferOutcome::Failed("bad row".into()),
        )
        .await
        .unwrap();

        // The failed row is first by rowid but is not mixed into a fresh batch
        let pending = db.pending_accounts("dev", 2).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|a| a.external_id.as_str()).collect();
        assert_eq!(ids, ["2", "3"]);

        db.mark_transfer(
            TransferKind::Account,
            &["2".to_string(), "3".to_string()],
            "dev",
            &TransferOutcome::Transferred,
        )
        .await
        .unwrap();
        let retry = db.pending_accounts("dev", 2).await.unwrap();
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].external_id, "1");
    }

    #[tokio::test]
    async fn test_failed_edges_wait_until_fresh_ones_are_taken() {
        let db = test_db().await;
        for target in ["a", "b"] {
            db.add_edge("S", target).await.unwrap();
        }
        let first = db.get_edges("S").await.unwrap().remove(0);
        db.mark_transfer(
            TransferKind::Edge,
            &[first.id.to_string()],
            "dev",
            &TransferOutcome::Failed("bad row".into()),
        )
        .await
        .unwrap();

        let pending = db.pending_edges("dev", 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].target_id, "b");
    }

    #[tokio::test]
    async fn test_transfer_flag_is_monotonic() {
        let db = test_db().await;
        db.add_edge("S", "T").await.unwrap();
        let edge = db.get_edges("S").await.unwrap().remove(0);
        let key = vec![edge.id.to_string()];

        db.mark_transfer(TransferKind::Edge, &key, "dev", &TransferOutcome::Failed("boom".into()))
            .await
            .unwrap();
        let state = db
            .transfer_state(TransferKind::Edge, &key[0], "dev")
            .await
            .unwrap()
            .unwrap();
        assert!(!state.transferred);
        assert_eq!(state.error.as_deref(), Some("boom"));
        assert_eq!(db.pending_edges("dev", 10).await.unwrap().len(), 1);

        db.mark_transfer(TransferKind::Edge, &key, "dev", &TransferOutcome::Transferred)
            .await
            .unwrap();
        db.mark_transfer(TransferKind::Edge, &key, "dev", &TransferOutcome::Failed("late".into()))
            .await
            .unwrap();

        let state = db
            .transfer_state(TransferKind::Edge, &key[0], "dev")
            .await
            .unwrap()
            .unwrap();
        assert!(state.transferred);
        assert!(state.error.is_none());
        assert!(db.pending_edges("dev", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stats_counts_queues_and_outbox() {
        let db = test_db().await;
        db.upsert_account(&profile("1", "a", "A")).await.unwrap();
        db.add_edge("S", "1").await.unwrap();
        db.upsert_work_item("kol", "k", None, None).await.unwrap();
        db.upsert_work_item("user", "u", None, None).await.unwrap();

        let stats = db.stats("dev").await.unwrap();
        assert_eq!(stats.accounts, 1);
        assert_eq!(stats.edges, 1);
        assert_eq!(stats.untransferred_accounts, 1);
        assert_eq!(stats.untransferred_edges, 1);
        assert_eq!(stats.failed_transfers, 0);
        assert_eq!(stats.queue_counts.len(), 2);
    }
}
