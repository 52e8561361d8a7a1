//! Date-partitioned history storage
//!
//! Three pieces cooperate here:
//! - [`partition`]: per (site, device, day) record files with merge-on-write
//! - [`index`]: the persisted metadata index used for all query planning
//! - [`query`]: paginated range reads resolved through the index
//!
//! [`HistoryStore`] ties them together and keeps the write path's invariant:
//! every partition write is followed by an index update and index persist, so
//! the index never lags the files it describes.

pub mod index;
pub mod partition;
pub mod query;

pub use index::{DeviceIndex, IndexEntry, MetadataIndex, SiteIndex, INDEX_SCHEMA_VERSION};
pub use partition::{PartitionFact, PartitionWriter};
pub use query::{QueryPage, QueryRequest};

use crate::error::Result;
use crate::model::HistoryRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Storage layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory holding partition files and the index document
    pub root_dir: PathBuf,

    /// Index document file name inside the root
    pub index_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            index_file: "index.json".to_string(),
        }
    }
}

/// Platform data directory fallback, e.g. `~/.local/share/thermo-history`
fn default_root_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("thermo-history"))
        .unwrap_or_else(|| PathBuf::from("thermo-history-data"))
}

/// Snapshot of what the index currently covers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub sites: usize,
    pub devices: usize,
    pub partitions: usize,
    pub total_records: u64,
    pub updated_at: DateTime<Utc>,
}

/// Partitioned record store plus its metadata index.
///
/// Single-writer per process: concurrent ingestion runs against the same
/// (site, device, day) must be serialized externally.
pub struct HistoryStore {
    writer: PartitionWriter,
    index: RwLock<MetadataIndex>,
    index_path: PathBuf,
}

impl HistoryStore {
    /// Open (or initialize) a store under the configured root
    pub async fn open(config: &StorageConfig) -> Result<Self> {
        fs::create_dir_all(&config.root_dir).await?;
        let index_path = config.root_dir.join(&config.index_file);
        let index = MetadataIndex::load(&index_path).await?;
        info!(
            "Opened history store at {} ({} sites indexed)",
            config.root_dir.display(),
            index.sites.len()
        );
        Ok(Self {
            writer: PartitionWriter::new(config.root_dir.clone()),
            index: RwLock::new(index),
            index_path,
        })
    }

    /// Merge a record batch into its partitions and absorb the resulting
    /// facts into the index, persisting the index document afterwards.
    ///
    /// An empty batch is a no-op: devices that reported no samples produce
    /// no partitions and no index entries.
    pub async fn write_batch(
        &self,
        site: &str,
        batch: Vec<HistoryRecord>,
    ) -> Result<Vec<PartitionFact>> {
        if batch.is_empty() {
            debug!("Skipping empty batch for site {}", site);
            return Ok(Vec::new());
        }

        let facts = self.writer.write(site, batch).await?;
        let mut index = self.index.write().await;
        for fact in &facts {
            index.update(site, fact);
        }
        index.persist(&self.index_path).await?;
        Ok(facts)
    }

    /// Serve one page of records through the index
    pub async fn query(&self, request: &QueryRequest) -> Result<QueryPage> {
        let index = self.index.read().await;
        query::execute(&self.writer, &index, request).await
    }

    /// Index entries for a device and date range, without reading files
    pub async fn find_partitions(
        &self,
        site: &str,
        device: &str,
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    ) -> Vec<IndexEntry> {
        self.index.read().await.find_partitions(site, device, start, end)
    }

    /// Coverage snapshot derived from the index alone
    pub async fn stats(&self) -> StorageStats {
        let index = self.index.read().await;
        let devices = index.sites.values().map(|s| s.devices.len()).sum();
        let partitions = index
            .sites
            .values()
            .flat_map(|s| s.devices.values())
            .map(|d| d.entries.len())
            .sum();
        let total_records = index
            .sites
            .values()
            .flat_map(|s| s.devices.values())
            .map(|d| d.total_entries)
            .sum();
        StorageStats {
            sites: index.sites.len(),
            devices,
            partitions,
            total_records,
            updated_at: index.updated_at,
        }
    }
}
