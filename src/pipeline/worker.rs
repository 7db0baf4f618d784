// Crawl worker: select the next stale subject from one queue, claim it,
// crawl it, store the snapshot, and mark it done.
//
// Several workers (processes) may share a queue. Claims are compare-and-set
// in the store, so two workers racing for the same item cannot both win;
// the loser just moves on to the next round.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDateTime;
use tracing::{debug, info};

use super::crawl::{CrawlReport, Crawler};
use crate::db::models::{format_timestamp, now_timestamp, WorkStatus};
use crate::db::DocumentStore;
use crate::queue::{staleness_cutoff, WorkQueue};

#[derive(Debug)]
pub enum WorkOutcome {
    /// Nothing eligible right now
    Idle,
    /// Subject already handled by another queue; completed without crawling
    Skipped { external_id: String },
    /// Another worker claimed the item first
    Lost { external_id: String },
    Crawled {
        external_id: String,
        report: CrawlReport,
    },
}

pub struct Worker {
    store: Arc<dyn DocumentStore>,
    crawler: Crawler,
    queue: WorkQueue,
    idle_delay: Duration,
}

impl Worker {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        crawler: Crawler,
        queue: WorkQueue,
        idle_delay: Duration,
    ) -> Self {
        Self {
            store,
            crawler,
            queue,
            idle_delay,
        }
    }

    /// Process at most one item, using the local clock.
    pub async fn run_once(&self) -> Result<WorkOutcome> {
        self.run_once_at(chrono::Local::now().naive_local()).await
    }

    /// Process at most one item as if the local time were `now`.
    pub async fn run_once_at(&self, now: NaiveDateTime) -> Result<WorkOutcome> {
        let queue = &self.queue;
        let cutoff = format_timestamp(staleness_cutoff(now));

        let item = match self.store.next_work_item(queue, &cutoff).await? {
            Some(item) => item,
            None => return Ok(WorkOutcome::Idle),
        };
        let external_id = item.external_id.clone();

        if !queue.shadow_queues.is_empty()
            && self
                .store
                .queued_in_any(queue.shadow_queues, &external_id)
                .await?
        {
            self.store
                .advance_work_status(queue.name, &external_id, WorkStatus::Completed)
                .await?;
            info!(queue = queue.name, external_id = %external_id, "Already tracked elsewhere, skipping");
            return Ok(WorkOutcome::Skipped { external_id });
        }

        let claimed = self
            .store
            .claim_work_item(queue, &external_id, &cutoff, &format_timestamp(now))
            .await?;
        if !claimed {
            debug!(queue = queue.name, external_id = %external_id, "Lost claim race");
            return Ok(WorkOutcome::Lost { external_id });
        }

        info!(
            queue = queue.name,
            external_id = %external_id,
            handle = item.handle.as_deref().unwrap_or("-"),
            "Crawling subject"
        );
        let report = self.crawler.crawl(&external_id).await;

        // Partial results from an aborted crawl are kept as well
        self.store
            .save_snapshot(&external_id, item.handle.as_deref(), &report.records)
            .await?;
        self.store
            .finish_work_item(queue.name, &external_id, &now_timestamp())
            .await?;

        Ok(WorkOutcome::Crawled {
            external_id,
            report,
        })
    }

    /// Keep processing items, backing off when the queue is empty. Store
    /// errors end the loop.
    pub async fn run_forever(&self) -> Result<()> {
        loop {
            match self.run_once().await? {
                WorkOutcome::Idle => {
                    debug!(queue = self.queue.name, "Queue idle");
                    tokio::time::sleep(self.idle_delay).await;
                }
                WorkOutcome::Lost { .. } => tokio::time::sleep(self.idle_delay).await,
                WorkOutcome::Skipped { .. } | WorkOutcome::Crawled { .. } => {}
            }
        }
    }
}

/// Queue a subject so `queue` will select it. Queues gated on `completed`
/// get the item advanced there; status never moves backward.
pub async fn enqueue(
    store: &dyn DocumentStore,
    queue: &WorkQueue,
    external_id: &str,
    handle: Option<&str>,
) -> Result<()> {
    store
        .upsert_work_item(queue.name, external_id, handle, None)
        .await?;
    let ready = queue.ready_status();
    if ready != WorkStatus::New {
        store
            .advance_work_status(queue.name, external_id, ready)
            .await?;
    }
    Ok(())
}

/// Clear the scan time so the item is crawled again on the next round.
/// Returns false when the item is not queued.
pub async fn requeue(store: &dyn DocumentStore, queue: &WorkQueue, external_id: &str) -> Result<bool> {
    if !store.reset_work_item(queue.name, external_id).await? {
        return Ok(false);
    }
    let ready = queue.ready_status();
    if ready != WorkStatus::New {
        store
            .advance_work_status(queue.name, external_id, ready)
            .await?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::AuditLog;
    use crate::db::schema::create_tables;
    use crate::db::sqlite::SqliteStore;
    use crate::pipeline::crawl::tests::{page, ScriptedSource};
    use crate::pipeline::crawl::{CrawlOutcome, CrawlSettings};
    use crate::pipeline::ingest::Ingestor;
    use crate::queue::{AUTO_TRACKING, KOL, USER};
    use chrono::NaiveDate;
    use rusqlite::Connection;

    fn test_store() -> Arc<dyn DocumentStore> {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        Arc::new(SqliteStore::new(conn))
    }

    fn worker(
        store: Arc<dyn DocumentStore>,
        source: Arc<ScriptedSource>,
        queue: WorkQueue,
    ) -> Worker {
        let settings = CrawlSettings {
            auto_track_queue: queue.auto_track_into,
            ..CrawlSettings::default()
        };
        let crawler = Crawler::new(
            source,
            Ingestor::new(store.clone(), AuditLog::disabled()),
            settings,
        );
        Worker::new(store, crawler, queue, Duration::from_secs(10))
    }

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_when_queue_empty() {
        let store = test_store();
        let source = Arc::new(ScriptedSource::new(vec![]));
        let outcome = worker(store, source, KOL).run_once_at(noon()).await.unwrap();
        assert!(matches!(outcome, WorkOutcome::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_crawl_writes_snapshot_and_completes_item() {
        let store = test_store();
        store
            .upsert_work_item("auto-tracking", "S", Some("subject"), None)
            .await
            .unwrap();
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(page(&["1", "2"], Some("c1"))),
            Ok(page(&["3"], Some("0|done"))),
        ]));

        let outcome = worker(store.clone(), source, AUTO_TRACKING)
            .run_once_at(noon())
            .await
            .unwrap();
        match outcome {
            WorkOutcome::Crawled { external_id, report } => {
                assert_eq!(external_id, "S");
                assert_eq!(report.outcome, CrawlOutcome::Sentinel);
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let snapshot = store.get_snapshot("S").await.unwrap().unwrap();
        assert_eq!(snapshot.records.len(), 3);
        assert_eq!(snapshot.handle.as_deref(), Some("subject"));

        let item = store.get_work_item("auto-tracking", "S").await.unwrap().unwrap();
        assert_eq!(item.status, WorkStatus::Completed);
        assert!(item.last_scanned_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_crawl_still_saves_partial_snapshot() {
        let store = test_store();
        store.upsert_work_item("kol", "K", None, None).await.unwrap();
        let source = Arc::new(ScriptedSource::new(vec![Ok(page(&["1"], Some("c1")))]));

        let outcome = worker(store.clone(), source, KOL)
            .run_once_at(noon())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            WorkOutcome::Crawled { ref report, .. } if report.outcome.is_aborted()
        ));
        assert_eq!(store.get_snapshot("K").await.unwrap().unwrap().records.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subject_in_shadow_queue_is_skipped() {
        let store = test_store();
        store.upsert_work_item("user", "S", None, None).await.unwrap();
        store
            .upsert_work_item("auto-tracking", "S", None, None)
            .await
            .unwrap();
        let source = Arc::new(ScriptedSource::new(vec![]));

        let outcome = worker(store.clone(), source.clone(), AUTO_TRACKING)
            .run_once_at(noon())
            .await
            .unwrap();
        assert!(matches!(outcome, WorkOutcome::Skipped { .. }));
        assert!(source.cursors().is_empty());

        let item = store.get_work_item("auto-tracking", "S").await.unwrap().unwrap();
        assert_eq!(item.status, WorkStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scanned_today_is_not_picked_again() {
        let store = test_store();
        store.upsert_work_item("user", "U", None, None).await.unwrap();
        store
            .advance_work_status("user", "U", WorkStatus::Completed)
            .await
            .unwrap();
        let source = Arc::new(ScriptedSource::new(vec![Ok(page(&["1"], None))]));
        let w = worker(store.clone(), source, USER);

        assert!(matches!(
            w.run_once_at(noon()).await.unwrap(),
            WorkOutcome::Crawled { .. }
        ));
        assert!(matches!(
            w.run_once_at(noon()).await.unwrap(),
            WorkOutcome::Idle
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracking_crawl_feeds_auto_tracking() {
        let store = test_store();
        store.upsert_work_item("tracking", "T", None, None).await.unwrap();
        store
            .advance_work_status("tracking", "T", WorkStatus::Completed)
            .await
            .unwrap();
        let source = Arc::new(ScriptedSource::new(vec![Ok(page(&["9"], None))]));

        worker(store.clone(), source, crate::queue::TRACKING)
            .run_once_at(noon())
            .await
            .unwrap();

        let queued = store.get_work_item("auto-tracking", "9").await.unwrap().unwrap();
        assert_eq!(queued.status, WorkStatus::New);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueued_user_subject_is_crawled() {
        let store = test_store();
        enqueue(store.as_ref(), &USER, "U", Some("someone")).await.unwrap();
        let source = Arc::new(ScriptedSource::new(vec![Ok(page(&["1"], None))]));

        let outcome = worker(store.clone(), source, USER)
            .run_once_at(noon())
            .await
            .unwrap();
        assert!(matches!(outcome, WorkOutcome::Crawled { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeued_user_subject_is_crawled_again() {
        let store = test_store();
        enqueue(store.as_ref(), &USER, "U", None).await.unwrap();
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(page(&["1"], None)),
            Ok(page(&["2"], None)),
        ]));
        let w = worker(store.clone(), source, USER);

        assert!(matches!(w.run_once_at(noon()).await.unwrap(), WorkOutcome::Crawled { .. }));
        assert!(requeue(store.as_ref(), &USER, "U").await.unwrap());
        let item = store.get_work_item("user", "U").await.unwrap().unwrap();
        assert_eq!(item.status, WorkStatus::Completed);
        assert!(item.last_scanned_at.is_none());

        assert!(matches!(w.run_once_at(noon()).await.unwrap(), WorkOutcome::Crawled { .. }));
        assert!(!requeue(store.as_ref(), &USER, "missing").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeued_auto_tracking_item_starts_over_as_new() {
        let store = test_store();
        enqueue(store.as_ref(), &AUTO_TRACKING, "A", None).await.unwrap();
        store
            .advance_work_status("auto-tracking", "A", WorkStatus::Completed)
            .await
            .unwrap();

        assert!(requeue(store.as_ref(), &AUTO_TRACKING, "A").await.unwrap());
        let item = store.get_work_item("auto-tracking", "A").await.unwrap().unwrap();
        assert_eq!(item.status, WorkStatus::New);
    }
}
