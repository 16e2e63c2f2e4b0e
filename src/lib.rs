//! Streaming aggregation backbone of a clustered APM collector.
//!
//! Telemetry enters per-type processing graphs of mailbox workers, is
//! aggregated per time bucket and entity, routed to the cluster member
//! owning each key, rolled up into coarser buckets and periodically
//! persisted through a double-buffered cache.

pub mod agent;
pub mod aggregation;
pub mod analysis;
pub mod config;
pub mod export;
pub mod graph;
pub mod module;
pub mod persistence;
pub mod record;
pub mod remote;
pub mod storage;
pub mod worker;
