// Crawl-and-ingest pipeline plus the outbox transfer.
//
// worker -> crawl -> (api fetch) -> ingest -> document store
// transfer: document store -> relational store, run as its own process

pub mod crawl;
pub mod ingest;
pub mod transfer;
pub mod worker;

pub use crawl::{CrawlOutcome, CrawlReport, CrawlSettings, Crawler};
pub use ingest::{IngestOptions, IngestReport, Ingestor};
pub use transfer::{BatchReport, Transfer, TransferMode, TransferSettings};
pub use worker::{enqueue, requeue, WorkOutcome, Worker};
