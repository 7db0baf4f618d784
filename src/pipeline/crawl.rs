// Crawl controller: drives the pagination loop for one subject.
//
// Per page: fixed delay, fetch, then either
//   - authorization failure: keep (or resume) the cursor, back off, retry.
//     The pool picks a different credential on the next attempt.
//   - any other failure: stop, keeping everything accumulated so far.
//   - success: ingest, accumulate, check the stop conditions, jittered delay.
//
// Pages of one subject are strictly sequential: each cursor comes from the
// previous response.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::ingest::{IngestOptions, IngestReport, Ingestor};
use crate::api::{FetchError, PageSource};
use crate::retry::Backoff;

/// Cursor prefix the API uses to mark the end of a following list.
pub const END_OF_LIST_PREFIX: &str = "0|";

#[derive(Debug, Clone)]
pub struct CrawlSettings {
    /// Wait before every fetch, including retries
    pub page_delay: Duration,
    /// Extra random wait between successful pages
    pub jitter_min: Duration,
    pub jitter_max: Duration,
    /// Stop once more than this many records were accumulated
    pub max_records: usize,
    pub stop_on_known_edge: bool,
    pub bulk_ingest: bool,
    /// Backoff between authorization retries; `max_retries` bounds how many
    /// consecutive authorization failures are tolerated
    pub auth_backoff: Backoff,
    /// Queue discovered accounts from the first page into this queue
    pub auto_track_queue: Option<&'static str>,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            page_delay: Duration::from_secs(10),
            jitter_min: Duration::from_secs(2),
            jitter_max: Duration::from_secs(4),
            max_records: 1000,
            stop_on_known_edge: false,
            bulk_ingest: true,
            auth_backoff: Backoff::default(),
            auto_track_queue: None,
        }
    }
}

impl CrawlSettings {
    fn jitter(&self) -> Duration {
        if self.jitter_max <= self.jitter_min {
            return self.jitter_min;
        }
        let secs = rand::rng()
            .random_range(self.jitter_min.as_secs_f64()..=self.jitter_max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Why a crawl stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlOutcome {
    /// The API returned no next cursor
    Exhausted,
    /// The next cursor carried the end-of-list prefix
    Sentinel,
    /// More than `max_records` records were accumulated
    Ceiling,
    /// A page contained an already-known edge
    KnownBoundary,
    /// Fetching failed; the records gathered so far are still returned
    Aborted { reason: String },
}

impl CrawlOutcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self, CrawlOutcome::Aborted { .. })
    }
}

#[derive(Debug, Clone)]
pub struct CrawlReport {
    /// Every raw record from every processed page, in order
    pub records: Vec<Value>,
    pub pages: usize,
    pub outcome: CrawlOutcome,
    pub ingest: IngestReport,
    /// Authorization failures that were retried
    pub auth_retries: u32,
}

pub struct Crawler {
    source: Arc<dyn PageSource>,
    ingestor: Ingestor,
    settings: CrawlSettings,
}

impl Crawler {
    pub fn new(source: Arc<dyn PageSource>, ingestor: Ingestor, settings: CrawlSettings) -> Self {
        Self {
            source,
            ingestor,
            settings,
        }
    }

    pub fn settings(&self) -> &CrawlSettings {
        &self.settings
    }

    /// Crawl one subject's following list from the first page.
    pub async fn crawl(&self, subject_id: &str) -> CrawlReport {
        let settings = &self.settings;
        let mut cursor = String::new();
        let mut records: Vec<Value> = Vec::new();
        let mut pages = 0usize;
        let mut ingest = IngestReport::default();
        let mut consecutive_auth_failures = 0u32;
        let mut auth_retries = 0u32;

        let outcome = loop {
            tokio::time::sleep(settings.page_delay).await;

            let page = match self.source.fetch_page(subject_id, &cursor).await {
                Ok(page) => page,
                Err(e) if e.is_retryable() => {
                    consecutive_auth_failures += 1;
                    if consecutive_auth_failures > settings.auth_backoff.max_retries {
                        warn!(
                            subject_id,
                            cursor = %cursor,
                            failures = consecutive_auth_failures,
                            "Giving up after repeated authorization failures"
                        );
                        break CrawlOutcome::Aborted {
                            reason: format!(
                                "{consecutive_auth_failures} consecutive failures, last: {e}"
                            ),
                        };
                    }

                    if let Some(resume) = e.resume_cursor() {
                        cursor = resume.to_string();
                    }
                    auth_retries += 1;

                    let delay = settings.auth_backoff.delay_for(consecutive_auth_failures);
                    warn!(
                        subject_id,
                        cursor = %cursor,
                        error = %e,
                        backoff_secs = delay.as_secs_f64(),
                        "Authorization error, retrying same cursor with another credential"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => {
                    warn!(subject_id, cursor = %cursor, error = %e, "Aborting crawl");
                    break CrawlOutcome::Aborted {
                        reason: e.to_string(),
                    };
                }
            };

            consecutive_auth_failures = 0;
            pages += 1;

            let options = IngestOptions {
                bulk: settings.bulk_ingest,
                stop_on_known_edge: settings.stop_on_known_edge,
                auto_track_queue: if cursor.is_empty() {
                    settings.auto_track_queue
                } else {
                    None
                },
            };
            let page_report = self
                .ingestor
                .ingest_page(subject_id, &page.records, options)
                .await;
            ingest.merge(page_report);
            records.extend(page.records);

            debug!(
                subject_id,
                page = pages,
                total = records.len(),
                next_cursor = ?page.next_cursor,
                "Processed page"
            );

            if page_report.hit_known_edge {
                break CrawlOutcome::KnownBoundary;
            }
            let next = match page.next_cursor {
                Some(next) => next,
                None => break CrawlOutcome::Exhausted,
            };
            if next.starts_with(END_OF_LIST_PREFIX) {
                break CrawlOutcome::Sentinel;
            }
            if records.len() > settings.max_records {
                break CrawlOutcome::Ceiling;
            }
            cursor = next;

            tokio::time::sleep(settings.jitter()).await;
        };

        info!(
            subject_id,
            pages,
            records = records.len(),
            outcome = ?outcome,
            "Crawl finished"
        );

        CrawlReport {
            records,
            pages,
            outcome,
            ingest,
            auth_retries,
        }
    }
}
