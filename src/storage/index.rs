//! Persisted metadata index over partition files
//!
//! The index is the only input to query planning: it maps site → device →
//! per-day entries carrying record counts and file locations, so a range
//! query never scans the filesystem. It is held in memory, mutated as
//! partition facts arrive, and written back whole as a single JSON document.

use crate::error::{HistoryError, Result};
use crate::storage::partition::PartitionFact;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;
use tracing::debug;

/// Bumped when the on-disk index layout changes
pub const INDEX_SCHEMA_VERSION: u32 = 1;

/// One partition's entry under a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub date: NaiveDate,
    pub record_count: u64,
    pub file_path: String,
}

/// All indexed partitions for one device
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIndex {
    /// Sum of all entries' record counts
    pub total_entries: u64,
    /// Kept sorted ascending by date
    pub entries: Vec<IndexEntry>,
}

/// All indexed devices for one site
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteIndex {
    pub devices: BTreeMap<String, DeviceIndex>,
}

/// Whole-store index document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataIndex {
    pub schema_version: u32,
    pub updated_at: DateTime<Utc>,
    pub sites: BTreeMap<String, SiteIndex>,
}

impl Default for MetadataIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataIndex {
    pub fn new() -> Self {
        Self {
            schema_version: INDEX_SCHEMA_VERSION,
            updated_at: Utc::now(),
            sites: BTreeMap::new(),
        }
    }

    /// Absorb one partition fact: insert or replace the entry for that
    /// device and date, then recompute the device total from its entries.
    pub fn update(&mut self, site: &str, fact: &PartitionFact) {
        let device = self
            .sites
            .entry(site.to_string())
            .or_default()
            .devices
            .entry(fact.device.clone())
            .or_default();

        let entry = IndexEntry {
            date: fact.date,
            record_count: fact.record_count,
            file_path: fact.file_path.clone(),
        };
        match device.entries.binary_search_by_key(&fact.date, |e| e.date) {
            Ok(at) => device.entries[at] = entry,
            Err(at) => device.entries.insert(at, entry),
        }
        device.total_entries = device.entries.iter().map(|e| e.record_count).sum();
        self.updated_at = Utc::now();
    }

    /// Entries for (site, device) whose date falls in the inclusive range.
    /// Pure in-memory lookup; the result is date-ascending.
    pub fn find_partitions(
        &self,
        site: &str,
        device: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Vec<IndexEntry> {
        self.sites
            .get(site)
            .and_then(|s| s.devices.get(device))
            .map(|d| {
                d.entries
                    .iter()
                    .filter(|e| e.date >= start && e.date <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Load the index document, yielding an empty index when none exists yet
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No index at {}, starting empty", path.display());
            return Ok(Self::new());
        }
        let bytes = fs::read(path).await.map_err(|e| {
            HistoryError::storage(format!("failed to read index {}: {e}", path.display()))
        })?;
        let index: MetadataIndex = serde_json::from_slice(&bytes).map_err(|e| {
            HistoryError::storage(format!("failed to parse index {}: {e}", path.display()))
        })?;
        if index.schema_version != INDEX_SCHEMA_VERSION {
            return Err(HistoryError::storage(format!(
                "unsupported index schema version {} in {} (expected {})",
                index.schema_version,
                path.display(),
                INDEX_SCHEMA_VERSION
            )));
        }
        Ok(index)
    }

    /// Write the whole index document back atomically
    pub async fn persist(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(|e| {
            HistoryError::storage(format!("failed to serialize index {}: {e}", path.display()))
        })?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &json).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}
