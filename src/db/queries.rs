// Document store queries: every SQL statement the crawler and the
// transfer process run against SQLite.
//
// Keeping SQL in one place gives the rest of the app clean Rust interfaces.
// Functions take `&Connection`; bulk writes open an unchecked transaction so
// they can share the same borrowed connection.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::warn;

use super::models::{
    Account, AccountProfile, BulkWriteSummary, Credential, Edge, RawSnapshot, StoreStats,
    TransferKind, TransferOutcome, TransferState, WorkItem, WorkStatus, ACCOUNT_STATUS_NEW,
    CREDENTIAL_STATUS_ERROR,
};
use crate::queue::WorkQueue;

// --- Accounts ---

fn account_exists(conn: &Connection, external_id: &str) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM accounts WHERE external_id = ?1",
        params![external_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Insert or refresh an account. Display fields are overwritten; `status`
/// is only written on insert.
pub fn upsert_account(conn: &Connection, profile: &AccountProfile, now: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO accounts (external_id, handle, display_name, avatar_url, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
         ON CONFLICT(external_id) DO UPDATE SET
            handle = excluded.handle,
            display_name = excluded.display_name,
            avatar_url = excluded.avatar_url,
            updated_at = excluded.updated_at",
        params![
            profile.external_id,
            profile.handle,
            profile.display_name,
            profile.avatar_url,
            ACCOUNT_STATUS_NEW,
            now,
        ],
    )?;
    Ok(())
}

/// Unordered bulk upsert. A failing document is logged and counted; the
/// rest of the batch is still written.
pub fn upsert_many_accounts(
    conn: &Connection,
    profiles: &[AccountProfile],
    now: &str,
) -> Result<BulkWriteSummary> {
    let tx = conn.unchecked_transaction()?;
    let mut summary = BulkWriteSummary::default();

    for profile in profiles {
        let existed = match account_exists(&tx, &profile.external_id) {
            Ok(existed) => existed,
            Err(e) => {
                warn!(external_id = %profile.external_id, error = %e, "Bulk account lookup failed");
                summary.failed += 1;
                continue;
            }
        };
        match upsert_account(&tx, profile, now) {
            Ok(()) if existed => summary.existing += 1,
            Ok(()) => summary.inserted += 1,
            Err(e) => {
                warn!(external_id = %profile.external_id, error = %e, "Bulk account upsert failed");
                summary.failed += 1;
            }
        }
    }

    tx.commit()?;
    Ok(summary)
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        external_id: row.get(0)?,
        handle: row.get(1)?,
        display_name: row.get(2)?,
        avatar_url: row.get(3)?,
        status: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

pub fn get_account(conn: &Connection, external_id: &str) -> Result<Option<Account>> {
    let account = conn
        .query_row(
            "SELECT external_id, handle, display_name, avatar_url, status, created_at, updated_at
             FROM accounts WHERE external_id = ?1",
            params![external_id],
            account_from_row,
        )
        .optional()?;
    Ok(account)
}

// --- Edges ---

/// Insert the edge unless it is already stored. Returns whether it existed.
pub fn add_edge(conn: &Connection, subject_id: &str, target_id: &str, now: &str) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO edges (subject_id, target_id, created_at) VALUES (?1, ?2, ?3)",
        params![subject_id, target_id, now],
    )?;
    Ok(inserted == 0)
}

/// Unordered bulk insert of edges from one subject. Already-known edges are
/// counted as existing, not as failures.
pub fn add_many_edges(
    conn: &Connection,
    subject_id: &str,
    target_ids: &[String],
    now: &str,
) -> Result<BulkWriteSummary> {
    let tx = conn.unchecked_transaction()?;
    let mut summary = BulkWriteSummary::default();

    for target_id in target_ids {
        match add_edge(&tx, subject_id, target_id, now) {
            Ok(true) => summary.existing += 1,
            Ok(false) => summary.inserted += 1,
            Err(e) => {
                warn!(subject_id, target_id = %target_id, error = %e, "Bulk edge insert failed");
                summary.failed += 1;
            }
        }
    }

    tx.commit()?;
    Ok(summary)
}

fn edge_from_row(row: &Row<'_>) -> rusqlite::Result<Edge> {
    Ok(Edge {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        target_id: row.get(2)?,
        created_at: row.get(3)?,
    })
}

/// All edges leaving one subject, oldest first.
pub fn get_edges(conn: &Connection, subject_id: &str) -> Result<Vec<Edge>> {
    let mut stmt = conn.prepare(
        "SELECT id, subject_id, target_id, created_at FROM edges
         WHERE subject_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![subject_id], edge_from_row)?;

    let mut edges = Vec::new();
    for row in rows {
        edges.push(row?);
    }
    Ok(edges)
}

// --- Raw snapshots ---

/// Replace the stored snapshot for a subject.
pub fn save_snapshot(
    conn: &Connection,
    external_id: &str,
    handle: Option<&str>,
    records: &[serde_json::Value],
    now: &str,
) -> Result<()> {
    let records_json = serde_json::to_string(records)?;
    conn.execute(
        "INSERT INTO raw_snapshots (external_id, handle, records, captured_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(external_id) DO UPDATE SET
            handle = excluded.handle,
            records = excluded.records,
            captured_at = excluded.captured_at",
        params![external_id, handle, records_json, now],
    )?;
    Ok(())
}

pub fn get_snapshot(conn: &Connection, external_id: &str) -> Result<Option<RawSnapshot>> {
    let row: Option<(String, Option<String>, String, String)> = conn
        .query_row(
            "SELECT external_id, handle, records, captured_at FROM raw_snapshots
             WHERE external_id = ?1",
            params![external_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;

    match row {
        Some((external_id, handle, records_json, captured_at)) => Ok(Some(RawSnapshot {
            external_id,
            handle,
            records: serde_json::from_str(&records_json)?,
            captured_at,
        })),
        None => Ok(None),
    }
}

// --- Work queues ---

/// Add a subject to a queue with status "new". If it is already queued,
/// only the display fields are refreshed.
pub fn upsert_work_item(
    conn: &Connection,
    queue: &str,
    external_id: &str,
    handle: Option<&str>,
    display_name: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO work_items (queue, external_id, handle, display_name, status)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(queue, external_id) DO UPDATE SET
            handle = COALESCE(excluded.handle, work_items.handle),
            display_name = COALESCE(excluded.display_name, work_items.display_name)",
        params![
            queue,
            external_id,
            handle,
            display_name,
            WorkStatus::New.as_str()
        ],
    )?;
    Ok(())
}

fn work_item_from_row(row: &Row<'_>) -> rusqlite::Result<WorkItem> {
    let status: String = row.get(4)?;
    Ok(WorkItem {
        queue: row.get(0)?,
        external_id: row.get(1)?,
        handle: row.get(2)?,
        display_name: row.get(3)?,
        // Unknown statuses are treated as untouched
        status: WorkStatus::parse(&status).unwrap_or(WorkStatus::New),
        last_scanned_at: row.get(5)?,
    })
}

/// Pick the next eligible item: never scanned first, then least recently
/// scanned, restricted to scans older than `cutoff`.
pub fn next_work_item(
    conn: &Connection,
    queue: &WorkQueue,
    cutoff: &str,
) -> Result<Option<WorkItem>> {
    let status = queue.eligible_status.map(|s| s.as_str());
    let item = conn
        .query_row(
            "SELECT queue, external_id, handle, display_name, status, last_scanned_at
             FROM work_items
             WHERE queue = ?1
               AND (last_scanned_at IS NULL OR last_scanned_at < ?2)
               AND (?3 IS NULL OR status = ?3)
             ORDER BY last_scanned_at IS NOT NULL, last_scanned_at, rowid
             LIMIT 1",
            params![queue.name, cutoff, status],
            work_item_from_row,
        )
        .optional()?;
    Ok(item)
}

/// Compare-and-set claim. Returns false when another process got there first.
pub fn claim_work_item(
    conn: &Connection,
    queue: &WorkQueue,
    external_id: &str,
    cutoff: &str,
    now: &str,
) -> Result<bool> {
    let changed = if queue.claims_by_status() {
        conn.execute(
            "UPDATE work_items SET status = ?3
             WHERE queue = ?1 AND external_id = ?2 AND status = ?4",
            params![
                queue.name,
                external_id,
                WorkStatus::Processing.as_str(),
                WorkStatus::New.as_str()
            ],
        )?
    } else {
        conn.execute(
            "UPDATE work_items SET last_scanned_at = ?4
             WHERE queue = ?1 AND external_id = ?2
               AND (last_scanned_at IS NULL OR last_scanned_at < ?3)",
            params![queue.name, external_id, cutoff, now],
        )?
    };
    Ok(changed == 1)
}

/// Move an item forward to `to`. Backward moves are refused (returns false).
pub fn advance_work_status(
    conn: &Connection,
    queue: &str,
    external_id: &str,
    to: WorkStatus,
) -> Result<bool> {
    let allowed: Vec<&str> = to.predecessors().iter().map(|s| s.as_str()).collect();
    if allowed.is_empty() {
        return Ok(false);
    }

    // The predecessor names are fixed literals, not user input.
    let sql = format!(
        "UPDATE work_items SET status = ?3
         WHERE queue = ?1 AND external_id = ?2 AND status IN ({})",
        allowed
            .iter()
            .map(|s| format!("'{s}'"))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let changed = conn.execute(&sql, params![queue, external_id, to.as_str()])?;
    Ok(changed == 1)
}

/// Record the end of a crawl: stamp the scan time and complete an item
/// that was claimed into "processing".
pub fn finish_work_item(
    conn: &Connection,
    queue: &str,
    external_id: &str,
    scanned_at: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE work_items SET
            last_scanned_at = ?3,
            status = CASE WHEN status = ?4 THEN ?5 ELSE status END
         WHERE queue = ?1 AND external_id = ?2",
        params![
            queue,
            external_id,
            scanned_at,
            WorkStatus::Processing.as_str(),
            WorkStatus::Completed.as_str()
        ],
    )?;
    Ok(())
}

/// Manual reset back to "new", clearing the scan time.
pub fn reset_work_item(conn: &Connection, queue: &str, external_id: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE work_items SET status = ?3, last_scanned_at = NULL
         WHERE queue = ?1 AND external_id = ?2",
        params![queue, external_id, WorkStatus::New.as_str()],
    )?;
    Ok(changed == 1)
}

pub fn get_work_item(conn: &Connection, queue: &str, external_id: &str) -> Result<Option<WorkItem>> {
    let item = conn
        .query_row(
            "SELECT queue, external_id, handle, display_name, status, last_scanned_at
             FROM work_items WHERE queue = ?1 AND external_id = ?2",
            params![queue, external_id],
            work_item_from_row,
        )
        .optional()?;
    Ok(item)
}

/// Whether the subject is queued in any of the given queues.
pub fn queued_in_any(conn: &Connection, queues: &[&str], external_id: &str) -> Result<bool> {
    for queue in queues {
        if get_work_item(conn, queue, external_id)?.is_some() {
            return Ok(true);
        }
    }
    Ok(false)
}

// --- Credentials ---

fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<Credential> {
    Ok(Credential {
        handle: row.get(0)?,
        cookie: row.get(1)?,
        auth_token: row.get(2)?,
        csrf_token: row.get(3)?,
        user_agent: row.get(4)?,
        status: row.get(5)?,
    })
}

/// Credentials usable by the rotator (anything not flagged "error").
pub fn load_active_credentials(conn: &Connection) -> Result<Vec<Credential>> {
    let mut stmt = conn.prepare(
        "SELECT handle, cookie, auth_token, csrf_token, user_agent, status
         FROM credentials WHERE status != ?1 ORDER BY handle",
    )?;
    let rows = stmt.query_map(params![CREDENTIAL_STATUS_ERROR], credential_from_row)?;

    let mut credentials = Vec::new();
    for row in rows {
        credentials.push(row?);
    }
    Ok(credentials)
}

pub fn list_credentials(conn: &Connection) -> Result<Vec<Credential>> {
    let mut stmt = conn.prepare(
        "SELECT handle, cookie, auth_token, csrf_token, user_agent, status
         FROM credentials ORDER BY handle",
    )?;
    let rows = stmt.query_map([], credential_from_row)?;

    let mut credentials = Vec::new();
    for row in rows {
        credentials.push(row?);
    }
    Ok(credentials)
}

pub fn upsert_credential(conn: &Connection, credential: &Credential) -> Result<()> {
    conn.execute(
        "INSERT INTO credentials (handle, cookie, auth_token, csrf_token, user_agent, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(handle) DO UPDATE SET
            cookie = excluded.cookie,
            auth_token = excluded.auth_token,
            csrf_token = excluded.csrf_token,
            user_agent = excluded.user_agent,
            status = excluded.status",
        params![
            credential.handle,
            credential.cookie,
            credential.auth_token,
            credential.csrf_token,
            credential.user_agent,
            credential.status,
        ],
    )?;
    Ok(())
}

pub fn set_credential_status(conn: &Connection, handle: &str, status: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE credentials SET status = ?2 WHERE handle = ?1",
        params![handle, status],
    )?;
    Ok(changed == 1)
}

// --- Transfer outbox ---

// Records never attempted go first, and a batch never mixes them with
// records that already failed. Otherwise one row that always fails would
// drag every fresh record selected alongside it into the same failure.
const NEVER_ATTEMPTED: &str = "t.transferred IS NULL";
const PREVIOUSLY_FAILED: &str = "t.transferred = 0";

/// Accounts whose flag for `environment` is absent or false. Never-attempted
/// accounts are returned while any remain; failed ones are retried after,
/// least recently attempted first.
pub fn pending_accounts(conn: &Connection, environment: &str, limit: u32) -> Result<Vec<Account>> {
    let fresh = select_pending_accounts(conn, environment, limit, NEVER_ATTEMPTED, "a.rowid")?;
    if !fresh.is_empty() {
        return Ok(fresh);
    }
    select_pending_accounts(conn, environment, limit, PREVIOUSLY_FAILED, "t.updated_at, a.rowid")
}

fn select_pending_accounts(
    conn: &Connection,
    environment: &str,
    limit: u32,
    filter: &str,
    order: &str,
) -> Result<Vec<Account>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT a.external_id, a.handle, a.display_name, a.avatar_url, a.status,
                a.created_at, a.updated_at
         FROM accounts a
         LEFT JOIN transfer_status t
           ON t.record_kind = ?1 AND t.record_key = a.external_id AND t.environment = ?2
         WHERE {filter}
         ORDER BY {order}
         LIMIT ?3"
    ))?;
    let rows = stmt.query_map(
        params![TransferKind::Account.as_str(), environment, limit],
        account_from_row,
    )?;

    let mut accounts = Vec::new();
    for row in rows {
        accounts.push(row?);
    }
    Ok(accounts)
}

/// Edges whose flag for `environment` is absent or false, selected the same
/// way as `pending_accounts`.
pub fn pending_edges(conn: &Connection, environment: &str, limit: u32) -> Result<Vec<Edge>> {
    let fresh = select_pending_edges(conn, environment, limit, NEVER_ATTEMPTED, "e.id")?;
    if !fresh.is_empty() {
        return Ok(fresh);
    }
    select_pending_edges(conn, environment, limit, PREVIOUSLY_FAILED, "t.updated_at, e.id")
}

fn select_pending_edges(
    conn: &Connection,
    environment: &str,
    limit: u32,
    filter: &str,
    order: &str,
) -> Result<Vec<Edge>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT e.id, e.subject_id, e.target_id, e.created_at
         FROM edges e
         LEFT JOIN transfer_status t
           ON t.record_kind = ?1 AND t.record_key = CAST(e.id AS TEXT) AND t.environment = ?2
         WHERE {filter}
         ORDER BY {order}
         LIMIT ?3"
    ))?;
    let rows = stmt.query_map(
        params![TransferKind::Edge.as_str(), environment, limit],
        edge_from_row,
    )?;

    let mut edges = Vec::new();
    for row in rows {
        edges.push(row?);
    }
    Ok(edges)
}

/// Write one outcome against every key. A flag that is already true stays
/// true (and keeps no error), whatever the new outcome says.
pub fn mark_transfer(
    conn: &Connection,
    kind: TransferKind,
    keys: &[String],
    environment: &str,
    outcome: &TransferOutcome,
    now: &str,
) -> Result<()> {
    let (transferred, error) = match outcome {
        TransferOutcome::Transferred => (1i64, None),
        TransferOutcome::Failed(message) => (0i64, Some(message.as_str())),
    };

    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO transfer_status (record_kind, record_key, environment, transferred, error, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(record_kind, record_key, environment) DO UPDATE SET
                transferred = MAX(transfer_status.transferred, excluded.transferred),
                error = CASE
                    WHEN MAX(transfer_status.transferred, excluded.transferred) = 1 THEN NULL
                    ELSE excluded.error
                END,
                updated_at = excluded.updated_at",
        )?;
        for key in keys {
            stmt.execute(params![
                kind.as_str(),
                key,
                environment,
                transferred,
                error,
                now
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

pub fn get_transfer_state(
    conn: &Connection,
    kind: TransferKind,
    key: &str,
    environment: &str,
) -> Result<Option<TransferState>> {
    let state = conn
        .query_row(
            "SELECT transferred, error, updated_at FROM transfer_status
             WHERE record_kind = ?1 AND record_key = ?2 AND environment = ?3",
            params![kind.as_str(), key, environment],
            |row| {
                Ok(TransferState {
                    transferred: row.get::<_, i64>(0)? != 0,
                    error: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(state)
}

// --- Stats ---

fn count(conn: &Connection, sql: &str, environment: Option<&str>) -> Result<i64> {
    let value: i64 = match environment {
        Some(env) => conn.query_row(sql, params![env], |row| row.get(0))?,
        None => conn.query_row(sql, [], |row| row.get(0))?,
    };
    Ok(value)
}

pub fn stats(conn: &Connection, environment: &str) -> Result<StoreStats> {
    let mut stats = StoreStats {
        accounts: count(conn, "SELECT COUNT(*) FROM accounts", None)?,
        edges: count(conn, "SELECT COUNT(*) FROM edges", None)?,
        snapshots: count(conn, "SELECT COUNT(*) FROM raw_snapshots", None)?,
        active_credentials: count(
            conn,
            "SELECT COUNT(*) FROM credentials WHERE status != 'error'",
            None,
        )?,
        untransferred_accounts: count(
            conn,
            "SELECT COUNT(*) FROM accounts a
             LEFT JOIN transfer_status t
               ON t.record_kind = 'account' AND t.record_key = a.external_id AND t.environment = ?1
             WHERE t.transferred IS NULL OR t.transferred = 0",
            Some(environment),
        )?,
        untransferred_edges: count(
            conn,
            "SELECT COUNT(*) FROM edges e
             LEFT JOIN transfer_status t
               ON t.record_kind = 'edge' AND t.record_key = CAST(e.id AS TEXT) AND t.environment = ?1
             WHERE t.transferred IS NULL OR t.transferred = 0",
            Some(environment),
        )?,
        failed_transfers: count(
            conn,
            "SELECT COUNT(*) FROM transfer_status WHERE environment = ?1 AND transferred = 0",
            Some(environment),
        )?,
        queue_counts: Vec::new(),
    };

    let mut stmt = conn.prepare(
        "SELECT queue, status, COUNT(*) FROM work_items GROUP BY queue, status ORDER BY queue, status",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
    for row in rows {
        stats.queue_counts.push(row?);
    }

    Ok(stats)
}
