// Followgraph: follow-relationship crawler and replicator
//
// This is the library root. Each module corresponds to a major subsystem:
// fetching pages from the following API, persisting them, scheduling work
// across queues, and replicating results into the relational store.

pub mod api;
pub mod config;
pub mod db;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod status;
