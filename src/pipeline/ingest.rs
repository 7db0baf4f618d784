// Ingestion writer: turns one page of raw entries into account upserts,
// edge inserts and (optionally) auto-tracking queue entries.
//
// Nothing in here fails a page. Malformed entries go to the error log,
// failed writes are logged and counted.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::api::{parse_account, AuditLog};
use crate::db::models::{AccountProfile, BulkWriteSummary};
use crate::db::DocumentStore;

/// How a page gets written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOptions {
    /// One unordered bulk write per collection instead of record-by-record
    pub bulk: bool,
    /// Report (and in record mode, stop at) the first already-known edge
    pub stop_on_known_edge: bool,
    /// Queue every discovered account here (first page only, decided by the caller)
    pub auto_track_queue: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub accounts: BulkWriteSummary,
    pub edges: BulkWriteSummary,
    /// Entries that could not be parsed into an account
    pub rejected: usize,
    /// Accounts added to the auto-tracking queue
    pub enqueued: usize,
    /// An edge from this page was already stored
    pub hit_known_edge: bool,
}

impl IngestReport {
    pub fn merge(&mut self, other: IngestReport) {
        self.accounts.merge(other.accounts);
        self.edges.merge(other.edges);
        self.rejected += other.rejected;
        self.enqueued += other.enqueued;
        self.hit_known_edge |= other.hit_known_edge;
    }
}

pub struct Ingestor {
    store: Arc<dyn DocumentStore>,
    audit: AuditLog,
}

impl Ingestor {
    pub fn new(store: Arc<dyn DocumentStore>, audit: AuditLog) -> Self {
        Self { store, audit }
    }

    pub async fn ingest_page(
        &self,
        subject_id: &str,
        records: &[Value],
        options: IngestOptions,
    ) -> IngestReport {
        let mut report = IngestReport::default();
        let mut profiles = Vec::with_capacity(records.len());

        for record in records {
            match parse_account(record) {
                Ok(profile) => profiles.push(profile),
                Err(e) => {
                    debug!(subject_id, error = %e, "Skipping unparseable entry");
                    self.audit.record_error(subject_id, record, &e.to_string());
                    report.rejected += 1;
                }
            }
        }

        if options.bulk {
            self.write_bulk(subject_id, &profiles, options, &mut report)
                .await;
        } else {
            self.write_each(subject_id, &profiles, options, &mut report)
                .await;
        }

        report
    }

    async fn write_bulk(
        &self,
        subject_id: &str,
        profiles: &[AccountProfile],
        options: IngestOptions,
        report: &mut IngestReport,
    ) {
        match self.store.upsert_many_accounts(profiles).await {
            Ok(summary) => report.accounts.merge(summary),
            Err(e) => {
                warn!(subject_id, error = %e, "Bulk account write failed");
                report.accounts.failed += profiles.len();
            }
        }

        let targets: Vec<String> = profiles.iter().map(|p| p.external_id.clone()).collect();
        match self.store.add_many_edges(subject_id, &targets).await {
            Ok(summary) => {
                report.hit_known_edge = options.stop_on_known_edge && summary.existing > 0;
                report.edges.merge(summary);
            }
            Err(e) => {
                warn!(subject_id, error = %e, "Bulk edge write failed");
                report.edges.failed += targets.len();
            }
        }

        if let Some(queue) = options.auto_track_queue {
            for profile in profiles {
                self.enqueue(queue, profile, report).await;
            }
        }
    }

    async fn write_each(
        &self,
        subject_id: &str,
        profiles: &[AccountProfile],
        options: IngestOptions,
        report: &mut IngestReport,
    ) {
        for profile in profiles {
            match self.store.upsert_account(profile).await {
                // Per-record mode does not distinguish insert from refresh
                Ok(()) => report.accounts.inserted += 1,
                Err(e) => {
                    warn!(subject_id, external_id = %profile.external_id, error = %e, "Account upsert failed");
                    report.accounts.failed += 1;
                    continue;
                }
            }

            if let Some(queue) = options.auto_track_queue {
                self.enqueue(queue, profile, report).await;
            }

            match self.store.add_edge(subject_id, &profile.external_id).await {
                Ok(true) => {
                    report.edges.existing += 1;
                    if options.stop_on_known_edge {
                        report.hit_known_edge = true;
                        break;
                    }
                }
                Ok(false) => report.edges.inserted += 1,
                Err(e) => {
                    warn!(subject_id, target_id = %profile.external_id, error = %e, "Edge insert failed");
                    report.edges.failed += 1;
                }
            }
        }
    }

    async fn enqueue(&self, queue: &str, profile: &AccountProfile, report: &mut IngestReport) {
        let result = self
            .store
            .upsert_work_item(
                queue,
                &profile.external_id,
                Some(&profile.handle),
                Some(&profile.display_name),
            )
            .await;

        match result {
            Ok(()) => report.enqueued += 1,
            Err(e) => {
                warn!(queue, external_id = %profile.external_id, error = %e, "Auto-track enqueue failed")
            }
        }
    }
}
