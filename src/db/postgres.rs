// PgStore: PostgreSQL backend implementing the RelationalStore trait.
//
// Uses sqlx PgPool for native async queries. All queries use runtime
// parameter binding (not compile-time macros) to avoid requiring
// DATABASE_URL at compile time.
//
// Timestamps arrive as fixed-precision local time strings and are cast
// server-side with `::timestamp`. Tables are created with IF NOT EXISTS on
// connect; there is no versioned migration runner.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx_core::pool::Pool;
use sqlx_core::row::Row;
use sqlx_postgres::Postgres;
use tracing::info;

use super::models::{Account, Edge};
use super::traits::{RelationalStore, Subject, SubjectSource, TransferError};
use crate::retry::{with_retry, Backoff};

/// Type alias for the PostgreSQL connection pool.
pub type PgPool = Pool<Postgres>;

const ACCOUNT_COLUMNS: usize = 4;
const EDGE_COLUMNS: usize = 2;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect (retrying with backoff) and make sure the tables exist.
    pub async fn connect(database_url: &str, backoff: &Backoff) -> Result<Self> {
        let pool = with_retry(
            backoff,
            "PostgreSQL connect",
            |_: &sqlx_core::Error| true,
            || PgPool::connect(database_url),
        )
        .await
        .context("Failed to connect to PostgreSQL")?;

        let store = Self { pool };
        store.ensure_schema().await?;
        info!("Connected to relational store");
        Ok(store)
    }

    /// Wrap an existing pool (tests, or callers with their own pool options).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx_core::raw_sql::raw_sql(
            "CREATE TABLE IF NOT EXISTS accounts (
                external_id TEXT PRIMARY KEY,
                handle TEXT NOT NULL,
                display_name TEXT NOT NULL,
                avatar_url TEXT,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL
            );
            CREATE TABLE IF NOT EXISTS account_following (
                subject_id TEXT NOT NULL,
                target_id TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL,
                PRIMARY KEY (subject_id, target_id)
            );",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create relational tables")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Build `($2, $3, ..., $1::timestamp, $1::timestamp), (...)` for `rows`
/// rows of `columns` bound values each. `$1` is the shared timestamp.
fn values_clause(rows: usize, columns: usize) -> String {
    (0..rows)
        .map(|row| {
            let first = 2 + row * columns;
            let params: Vec<String> = (first..first + columns).map(|i| format!("${i}")).collect();
            format!("({}, $1::timestamp, $1::timestamp)", params.join(", "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn classify(err: sqlx_core::Error) -> TransferError {
    match &err {
        sqlx_core::Error::PoolTimedOut | sqlx_core::Error::PoolClosed => {
            TransferError::PoolExhausted(err.to_string())
        }
        _ => TransferError::Database(err.to_string()),
    }
}

#[async_trait]
impl RelationalStore for PgStore {
    async fn upsert_accounts(&self, accounts: &[Account], stamp: &str) -> Result<(), TransferError> {
        if accounts.is_empty() {
            return Ok(());
        }

        let sql = format!(
            "INSERT INTO accounts (external_id, handle, display_name, avatar_url, created_at, updated_at)
             VALUES {}
             ON CONFLICT (external_id) DO UPDATE SET
                handle = EXCLUDED.handle,
                display_name = EXCLUDED.display_name,
                avatar_url = EXCLUDED.avatar_url,
                updated_at = EXCLUDED.updated_at",
            values_clause(accounts.len(), ACCOUNT_COLUMNS)
        );

        let mut query = sqlx_core::query::query(&sql).bind(stamp);
        for account in accounts {
            query = query
                .bind(account.external_id.as_str())
                .bind(account.handle.as_str())
                .bind(account.display_name.as_str())
                .bind(account.avatar_url.as_deref());
        }

        // Dropping the transaction on error rolls it back
        let mut tx = self.pool.begin().await.map_err(classify)?;
        query.execute(&mut *tx).await.map_err(classify)?;
        tx.commit().await.map_err(classify)?;
        Ok(())
    }

    async fn upsert_edges(&self, edges: &[Edge], stamp: &str) -> Result<(), TransferError> {
        if edges.is_empty() {
            return Ok(());
        }

        let sql = format!(
            "INSERT INTO account_following (subject_id, target_id, created_at, updated_at)
             VALUES {}
             ON CONFLICT (subject_id, target_id) DO UPDATE SET
                updated_at = EXCLUDED.updated_at",
            values_clause(edges.len(), EDGE_COLUMNS)
        );

        let mut query = sqlx_core::query::query(&sql).bind(stamp);
        for edge in edges {
            query = query
                .bind(edge.subject_id.as_str())
                .bind(edge.target_id.as_str());
        }

        let mut tx = self.pool.begin().await.map_err(classify)?;
        query.execute(&mut *tx).await.map_err(classify)?;
        tx.commit().await.map_err(classify)?;
        Ok(())
    }

    async fn load_subjects(&self, source: SubjectSource) -> Result<Vec<Subject>> {
        let subjects = match source {
            SubjectSource::Users => {
                let rows = sqlx_core::query::query(
                    "SELECT external_id, handle FROM users WHERE external_id IS NOT NULL",
                )
                .fetch_all(&self.pool)
                .await
                .context("Failed to load users")?;

                rows.iter()
                    .map(|r| Subject {
                        external_id: r.get::<String, _>(0),
                        handle: r.get::<Option<String>, _>(1),
                    })
                    .collect()
            }
            SubjectSource::Tracking => {
                let rows = sqlx_core::query::query(
                    "SELECT DISTINCT external_id FROM tracking WHERE external_id IS NOT NULL",
                )
                .fetch_all(&self.pool)
                .await
                .context("Failed to load tracked accounts")?;

                rows.iter()
                    .map(|r| Subject {
                        external_id: r.get::<String, _>(0),
                        handle: None,
                    })
                    .collect()
            }
        };
        Ok(subjects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_clause_numbers_rows_after_stamp() {
        assert_eq!(
            values_clause(2, 2),
            "($2, $3, $1::timestamp, $1::timestamp), ($4, $5, $1::timestamp, $1::timestamp)"
        );
    }

    #[test]
    fn test_values_clause_account_width() {
        let clause = values_clause(1, ACCOUNT_COLUMNS);
        assert_eq!(clause, "($2, $3, $4, $5, $1::timestamp, $1::timestamp)");
    }

    #[test]
    fn test_pool_timeout_is_exhaustion() {
        assert!(matches!(
            classify(sqlx_core::Error::PoolTimedOut),
            TransferError::PoolExhausted(_)
        ));
        assert!(matches!(
            classify(sqlx_core::Error::RowNotFound),
            TransferError::Database(_)
        ));
    }
}
