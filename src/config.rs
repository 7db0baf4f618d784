use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::pipeline::{CrawlSettings, TransferMode, TransferSettings};
use crate::queue::WorkQueue;
use crate::retry::Backoff;

/// Largest transfer batch PostgreSQL can take in one statement: 65535 bind
/// parameters, one shared timestamp plus four per account row.
pub const MAX_TRANSFER_BATCH: u32 = (u16::MAX as u32 - 1) / 4;

/// Central configuration loaded from environment variables.
///
/// Secrets (bot sessions) live in the document store, not here. The .env
/// file is loaded automatically at startup via dotenvy.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    /// PostgreSQL connection URL for the relational store
    pub database_url: Option<String>,
    pub following_api_url: String,
    /// Raw response log; `None` disables it
    pub audit_log: Option<PathBuf>,
    /// Per-record parse failure log; `None` disables it
    pub error_log: Option<PathBuf>,

    pub max_records: usize,
    pub page_delay: Duration,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
    pub stop_on_known_edge: bool,
    pub bulk_ingest: bool,
    pub idle_delay: Duration,

    pub transfer_environment: String,
    pub transfer_batch_size: u32,
    pub transfer_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables. Everything has a
    /// default except DATABASE_URL.
    pub fn load() -> Result<Self> {
        Ok(Self {
            db_path: env::var("FOLLOWGRAPH_DB_PATH")
                .unwrap_or_else(|_| "./followgraph.db".to_string()),
            database_url: env::var("DATABASE_URL").ok().filter(|u| !u.is_empty()),
            following_api_url: env::var("FOLLOWING_API_URL")
                .unwrap_or_else(|_| crate::api::DEFAULT_FOLLOWING_URL.to_string()),
            audit_log: optional_path("FOLLOWGRAPH_AUDIT_LOG", "./log.txt"),
            error_log: optional_path("FOLLOWGRAPH_ERROR_LOG", "./error_get_following.txt"),

            max_records: parse_var("CRAWL_MAX_RECORDS", 1000)?,
            page_delay: Duration::from_secs(parse_var("CRAWL_PAGE_DELAY_SECS", 10)?),
            jitter_min: Duration::from_secs(parse_var("CRAWL_JITTER_MIN_SECS", 2)?),
            jitter_max: Duration::from_secs(parse_var("CRAWL_JITTER_MAX_SECS", 4)?),
            stop_on_known_edge: parse_var("CRAWL_STOP_ON_KNOWN_EDGE", false)?,
            bulk_ingest: parse_var("CRAWL_BULK_INGEST", true)?,
            idle_delay: Duration::from_secs(parse_var("CRAWL_IDLE_SECS", 10)?),

            transfer_environment: env::var("TRANSFER_ENVIRONMENT")
                .unwrap_or_else(|_| "dev".to_string()),
            transfer_batch_size: batch_size(parse_var("TRANSFER_BATCH_SIZE", 500)?)?,
            transfer_interval: Duration::from_secs(parse_var("TRANSFER_INTERVAL_SECS", 3)?),
        })
    }

    /// Check that the relational store is configured and return its URL.
    /// Call this before any command that talks to PostgreSQL.
    pub fn require_relational(&self) -> Result<&str> {
        match self.database_url.as_deref() {
            Some(url) if url.starts_with("postgres://") || url.starts_with("postgresql://") => {
                Ok(url)
            }
            Some(_) => anyhow::bail!(
                "DATABASE_URL must be a postgres:// or postgresql:// URL.\n\
                 See .env.example for the required variables."
            ),
            None => anyhow::bail!(
                "DATABASE_URL not set. Add it to your .env file.\n\
                 See .env.example for the required variables."
            ),
        }
    }

    /// Crawl settings for one queue.
    pub fn crawl_settings(&self, queue: &WorkQueue) -> CrawlSettings {
        CrawlSettings {
            page_delay: self.page_delay,
            jitter_min: self.jitter_min,
            jitter_max: self.jitter_max,
            max_records: self.max_records,
            stop_on_known_edge: self.stop_on_known_edge,
            bulk_ingest: self.bulk_ingest,
            auth_backoff: Backoff::default(),
            auto_track_queue: queue.auto_track_into,
        }
    }

    pub fn transfer_settings(&self, mode: TransferMode) -> TransferSettings {
        TransferSettings {
            environment: self.transfer_environment.clone(),
            batch_size: self.transfer_batch_size,
            interval: self.transfer_interval,
            mode,
        }
    }
}

/// Path from the environment, the default when unset, `None` when set empty.
fn optional_path(name: &str, default: &str) -> Option<PathBuf> {
    match env::var(name) {
        Ok(value) if value.is_empty() => None,
        Ok(value) => Some(PathBuf::from(value)),
        Err(_) => Some(PathBuf::from(default)),
    }
}

fn batch_size(size: u32) -> Result<u32> {
    if size == 0 || size > MAX_TRANSFER_BATCH {
        anyhow::bail!("TRANSFER_BATCH_SIZE must be between 1 and {MAX_TRANSFER_BATCH}, got {size}");
    }
    Ok(size)
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {name}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{TRACKING, USER};

    fn config() -> Config {
        Config {
            db_path: "./followgraph.db".to_string(),
            database_url: None,
            following_api_url: crate::api::DEFAULT_FOLLOWING_URL.to_string(),
            audit_log: None,
            error_log: None,
            max_records: 1000,
            page_delay: Duration::from_secs(10),
            jitter_min: Duration::from_secs(2),
            jitter_max: Duration::from_secs(4),
            stop_on_known_edge: false,
            bulk_ingest: true,
            idle_delay: Duration::from_secs(10),
            transfer_environment: "dev".to_string(),
            transfer_batch_size: 500,
            transfer_interval: Duration::from_secs(3),
        }
    }

    #[test]
    fn test_require_relational() {
        let mut cfg = config();
        assert!(cfg.require_relational().is_err());

        cfg.database_url = Some("mysql://nope".to_string());
        assert!(cfg.require_relational().is_err());

        cfg.database_url = Some("postgres://u:p@localhost/graph".to_string());
        assert_eq!(
            cfg.require_relational().unwrap(),
            "postgres://u:p@localhost/graph"
        );
    }

    #[test]
    fn test_crawl_settings_follow_queue() {
        let cfg = config();
        assert_eq!(cfg.crawl_settings(&USER).auto_track_queue, None);
        assert_eq!(
            cfg.crawl_settings(&TRACKING).auto_track_queue,
            Some("auto-tracking")
        );
        assert_eq!(cfg.crawl_settings(&USER).max_records, 1000);
    }

    #[test]
    fn test_batch_size_bounds() {
        assert!(batch_size(0).is_err());
        assert_eq!(batch_size(500).unwrap(), 500);
        assert_eq!(batch_size(16383).unwrap(), 16383);
        assert!(batch_size(16384).is_err());
    }

    #[test]
    fn test_unset_vars_fall_back_to_defaults() {
        // Names unlikely to exist in the test environment
        assert_eq!(parse_var("FOLLOWGRAPH_TEST_UNSET_VAR", 7u32).unwrap(), 7);
        assert!(optional_path("FOLLOWGRAPH_TEST_UNSET_PATH", "./x").is_some());
    }
}
