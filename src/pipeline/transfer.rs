// Outbox transfer: replicate untransferred accounts and edges from the
// document store into the relational store.
//
// A batch is one multi-row upsert in one transaction, so it succeeds or
// fails as a whole. Every record in a failed batch gets the same error and
// stays selectable; every record in a successful batch is flagged
// transferred for the configured environment and is never selected again.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::db::models::{now_timestamp, TransferKind, TransferOutcome};
use crate::db::{DocumentStore, RelationalStore, TransferError};

/// How records are written to the relational store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// One multi-row statement per batch
    Batch,
    /// One transaction per record, outcome recorded per record
    PerRecord,
}

#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Name of the transfer-status flag (e.g. "dev", "prod")
    pub environment: String,
    pub batch_size: u32,
    /// Sleep between drains
    pub interval: Duration,
    pub mode: TransferMode,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            environment: "dev".to_string(),
            batch_size: 500,
            interval: Duration::from_secs(3),
            mode: TransferMode::Batch,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub selected: usize,
    pub transferred: usize,
    pub failed: usize,
}

impl BatchReport {
    fn merge(&mut self, other: BatchReport) {
        self.selected += other.selected;
        self.transferred += other.transferred;
        self.failed += other.failed;
    }
}

/// True when the error chain holds a pool-exhaustion failure, which the
/// driver reports and retries on its next iteration.
pub fn is_pool_exhausted(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<TransferError>(),
        Some(TransferError::PoolExhausted(_))
    )
}

pub struct Transfer {
    store: Arc<dyn DocumentStore>,
    target: Arc<dyn RelationalStore>,
    settings: TransferSettings,
}

impl Transfer {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        target: Arc<dyn RelationalStore>,
        settings: TransferSettings,
    ) -> Self {
        Self {
            store,
            target,
            settings,
        }
    }

    /// Write one batch through `mode`.
    pub async fn transfer(&self, kind: TransferKind, limit: u32) -> Result<BatchReport> {
        match self.settings.mode {
            TransferMode::Batch => self.transfer_batch(kind, limit).await,
            TransferMode::PerRecord => self.transfer_each(kind, limit).await,
        }
    }

    /// Select up to `limit` untransferred records and upsert them with one
    /// statement. Pool exhaustion is returned as an error without marking
    /// anything, since nothing was attempted.
    pub async fn transfer_batch(&self, kind: TransferKind, limit: u32) -> Result<BatchReport> {
        let env = &self.settings.environment;
        let stamp = now_timestamp();

        let (keys, result) = match kind {
            TransferKind::Account => {
                let accounts = self.store.pending_accounts(env, limit).await?;
                if accounts.is_empty() {
                    return Ok(BatchReport::default());
                }
                let keys: Vec<String> = accounts.iter().map(|a| a.external_id.clone()).collect();
                (keys, self.target.upsert_accounts(&accounts, &stamp).await)
            }
            TransferKind::Edge => {
                let edges = self.store.pending_edges(env, limit).await?;
                if edges.is_empty() {
                    return Ok(BatchReport::default());
                }
                let keys: Vec<String> = edges.iter().map(|e| e.id.to_string()).collect();
                (keys, self.target.upsert_edges(&edges, &stamp).await)
            }
        };

        let selected = keys.len();
        match result {
            Ok(()) => {
                self.store
                    .mark_transfer(kind, &keys, env, &TransferOutcome::Transferred)
                    .await?;
                debug!(kind = %kind, count = selected, "Batch transferred");
                Ok(BatchReport {
                    selected,
                    transferred: selected,
                    failed: 0,
                })
            }
            Err(TransferError::Database(message)) => {
                warn!(kind = %kind, count = selected, error = %message, "Batch transfer failed");
                self.store
                    .mark_transfer(kind, &keys, env, &TransferOutcome::Failed(message))
                    .await?;
                Ok(BatchReport {
                    selected,
                    transferred: 0,
                    failed: selected,
                })
            }
            Err(exhausted @ TransferError::PoolExhausted(_)) => Err(exhausted.into()),
        }
    }

    /// Like `transfer_batch`, but each record gets its own transaction and
    /// its own outcome.
    pub async fn transfer_each(&self, kind: TransferKind, limit: u32) -> Result<BatchReport> {
        let env = &self.settings.environment;
        let mut report = BatchReport::default();

        let attempts: Vec<(String, Result<(), TransferError>)> = match kind {
            TransferKind::Account => {
                let accounts = self.store.pending_accounts(env, limit).await?;
                let mut attempts = Vec::with_capacity(accounts.len());
                for account in accounts {
                    let result = self
                        .target
                        .upsert_accounts(std::slice::from_ref(&account), &now_timestamp())
                        .await;
                    let exhausted = matches!(result, Err(TransferError::PoolExhausted(_)));
                    attempts.push((account.external_id, result));
                    if exhausted {
                        break;
                    }
                }
                attempts
            }
            TransferKind::Edge => {
                let edges = self.store.pending_edges(env, limit).await?;
                let mut attempts = Vec::with_capacity(edges.len());
                for edge in edges {
                    let result = self
                        .target
                        .upsert_edges(std::slice::from_ref(&edge), &now_timestamp())
                        .await;
                    let exhausted = matches!(result, Err(TransferError::PoolExhausted(_)));
                    attempts.push((edge.id.to_string(), result));
                    if exhausted {
                        break;
                    }
                }
                attempts
            }
        };

        for (key, result) in attempts {
            let outcome = match result {
                Ok(()) => {
                    report.transferred += 1;
                    TransferOutcome::Transferred
                }
                Err(TransferError::Database(message)) => {
                    warn!(kind = %kind, key = %key, error = %message, "Record transfer failed");
                    report.failed += 1;
                    TransferOutcome::Failed(message)
                }
                Err(exhausted @ TransferError::PoolExhausted(_)) => return Err(exhausted.into()),
            };
            report.selected += 1;
            self.store
                .mark_transfer(kind, std::slice::from_ref(&key), env, &outcome)
                .await?;
        }

        Ok(report)
    }

    /// Transfer batches until nothing is left or a batch fails.
    pub async fn drain(&self, kind: TransferKind) -> Result<BatchReport> {
        let mut total = BatchReport::default();
        loop {
            let report = self.transfer(kind, self.settings.batch_size).await?;
            total.merge(report);
            if report.selected == 0 {
                break;
            }
            if report.failed > 0 {
                // Retry on the next interval, not in a hot loop
                break;
            }
        }
        Ok(total)
    }

    /// Drain every kind, sleep, repeat. Pool exhaustion is reported and
    /// retried; any other error ends the loop.
    pub async fn run_forever(&self, kinds: &[TransferKind]) -> Result<()> {
        loop {
            for &kind in kinds {
                match self.drain(kind).await {
                    Ok(report) if report.selected > 0 => info!(
                        kind = %kind,
                        transferred = report.transferred,
                        failed = report.failed,
                        "Transfer pass complete"
                    ),
                    Ok(_) => debug!(kind = %kind, "Nothing to transfer"),
                    Err(e) if is_pool_exhausted(&e) => {
                        warn!(kind = %kind, error = %e, "Relational store unavailable, retrying next pass")
                    }
                    Err(e) => return Err(e),
                }
            }
            tokio::time::sleep(self.settings.interval).await;
        }
    }
}
