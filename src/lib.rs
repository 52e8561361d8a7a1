//! Thermostat telemetry history ingestion and query subsystem
//!
//! This crate pulls device history from an upstream telemetry service,
//! extracts records from large streaming JSON responses, and lands them
//! in a partitioned on-disk store with a metadata index that serves
//! paged range queries.
//!
//! # Features
//!
//! - Per-site rate-limited dispatch with bounded FIFO queues
//! - Chunk-resumable extraction from multi-megabyte JSON bodies
//! - Automatic splitting of long date ranges into request-sized spans
//! - Site/device/day partition files with first-seen-wins dedup
//! - Metadata index driving arithmetic page skips without file reads
//! - Device discovery without touching the store

// Core modules
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod model;
pub mod range;
pub mod storage;

// Re-export main types for convenience
pub use config::HistoryConfig;
pub use error::{HistoryError, Result};
pub use ingest::{HistoryService, IngestReport};
