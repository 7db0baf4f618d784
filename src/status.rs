// System status display: store size, collection counts, queue states and
// the transfer backlog for the configured environment.

use anyhow::Result;
use colored::Colorize;
use std::path::Path;
use std::sync::Arc;

use crate::db::models::StoreStats;
use crate::db::DocumentStore;

/// Display system status to the terminal.
pub async fn show(
    store: &Arc<dyn DocumentStore>,
    db_display_path: &str,
    environment: &str,
) -> Result<()> {
    // Database file size
    let file_size = std::fs::metadata(db_display_path)
        .map(|m| format_bytes(m.len()))
        .unwrap_or_else(|_| "unknown".to_string());
    println!("Database: {} ({})", db_display_path, file_size);

    let stats = store.stats(environment).await?;
    for line in render(&stats, environment) {
        println!("{line}");
    }

    if stats.active_credentials == 0 {
        println!(
            "  {}",
            "No usable credentials. Add one with `followgraph credentials add`.".yellow()
        );
    }

    Ok(())
}

/// Whether the document store file exists yet.
pub fn is_initialized(db_path: &str) -> bool {
    Path::new(db_path).exists()
}

fn render(stats: &StoreStats, environment: &str) -> Vec<String> {
    let mut lines = vec![
        format!("Accounts: {}", stats.accounts),
        format!("Edges: {}", stats.edges),
        format!("Snapshots: {}", stats.snapshots),
        format!("Active credentials: {}", stats.active_credentials),
    ];

    if stats.queue_counts.is_empty() {
        lines.push("Queues: empty".to_string());
    } else {
        lines.push("Queues:".to_string());
        for (queue, status, count) in &stats.queue_counts {
            lines.push(format!("  {queue:<14} {status:<11} {count}"));
        }
    }

    lines.push(format!(
        "Untransferred ({environment}): {} accounts, {} edges",
        stats.untransferred_accounts, stats.untransferred_edges
    ));
    if stats.failed_transfers > 0 {
        lines.push(format!(
            "  {} records carry a transfer error",
            stats.failed_transfers
        ));
    }

    lines
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
