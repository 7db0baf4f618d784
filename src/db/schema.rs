// Document store schema: one table per collection.
//
// Every statement is CREATE ... IF NOT EXISTS, so this runs on every startup.
// The unique keys here are what make account upserts and edge inserts
// idempotent.

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Create all tables if they don't exist yet.
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Accounts discovered in following lists
        CREATE TABLE IF NOT EXISTS accounts (
            external_id TEXT PRIMARY KEY,
            handle TEXT NOT NULL,
            display_name TEXT NOT NULL,
            avatar_url TEXT,
            status TEXT NOT NULL DEFAULT 'new',   -- set on insert only
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- Following edges (subject follows target), written once
        CREATE TABLE IF NOT EXISTS edges (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            subject_id TEXT NOT NULL,
            target_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (subject_id, target_id)
        );

        -- Crawl queues; `queue` names the variant (user, auto-tracking, kol, tracking)
        CREATE TABLE IF NOT EXISTS work_items (
            queue TEXT NOT NULL,
            external_id TEXT NOT NULL,
            handle TEXT,
            display_name TEXT,
            status TEXT NOT NULL DEFAULT 'new',
            last_scanned_at TEXT,               -- NULL = never scanned
            PRIMARY KEY (queue, external_id)
        );

        -- Latest raw page dump per subject, overwritten on every crawl
        CREATE TABLE IF NOT EXISTS raw_snapshots (
            external_id TEXT PRIMARY KEY,
            handle TEXT,
            records TEXT NOT NULL,              -- JSON array of raw entries
            captured_at TEXT NOT NULL
        );

        -- Bot sessions used by the credential rotator
        CREATE TABLE IF NOT EXISTS credentials (
            handle TEXT PRIMARY KEY,
            cookie TEXT NOT NULL,
            auth_token TEXT NOT NULL,
            csrf_token TEXT NOT NULL,
            user_agent TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active'
        );

        -- Outbox flags, one row per (record, environment). No row = never attempted.
        CREATE TABLE IF NOT EXISTS transfer_status (
            record_kind TEXT NOT NULL,          -- 'account' or 'edge'
            record_key TEXT NOT NULL,           -- accounts.external_id or edges.id
            environment TEXT NOT NULL,
            transferred INTEGER NOT NULL,
            error TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (record_kind, record_key, environment)
        );

        CREATE INDEX IF NOT EXISTS idx_work_items_selection
            ON work_items(queue, status, last_scanned_at);

        CREATE INDEX IF NOT EXISTS idx_edges_target
            ON edges(target_id);
        ",
    )
    .context("Failed to create document store tables")?;

    Ok(())
}

/// Count the number of tables in the database (useful for init confirmation).
pub fn table_count(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}
