//! Date-partitioned record files with merge-on-write
//!
//! One partition holds all records for a (site, device, calendar day) at
//! `<root>/<site>/<device>/<YYYY>/<MM>/<DD>.json`. Writes never append or
//! patch in place: the existing file is read, unioned with the incoming
//! batch keyed by timestamp, sorted, and written back whole through a temp
//! file rename.

use crate::error::{HistoryError, Result};
use crate::model::HistoryRecord;
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Outcome of one partition merge-write, consumed by the metadata index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionFact {
    pub device: String,
    pub date: NaiveDate,
    /// Record count of the partition after the merge
    pub record_count: u64,
    pub file_path: String,
}

/// Writes record batches into per-day partition files under a store root
#[derive(Debug, Clone)]
pub struct PartitionWriter {
    root: PathBuf,
}

impl PartitionWriter {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Deterministic partition location for (site, device, day)
    pub fn partition_path(&self, site: &str, device: &str, date: NaiveDate) -> PathBuf {
        self.root
            .join(sanitize_component(site))
            .join(sanitize_component(device))
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}.json", date.day()))
    }

    /// Persist a batch of records for one site.
    ///
    /// Records are grouped by (device, calendar day); each group is merged
    /// into its partition with existing records winning timestamp conflicts
    /// (first-seen wins). Returns one fact per partition touched, in
    /// (device, date) order. Re-writing the same batch is idempotent.
    pub async fn write(&self, site: &str, batch: Vec<HistoryRecord>) -> Result<Vec<PartitionFact>> {
        let mut groups: BTreeMap<(String, NaiveDate), Vec<HistoryRecord>> = BTreeMap::new();
        for record in batch {
            groups
                .entry((record.device_serial.clone(), record.date()))
                .or_default()
                .push(record);
        }

        let mut facts = Vec::with_capacity(groups.len());
        for ((device, date), records) in groups {
            let fact = self.merge_write(site, &device, date, records).await?;
            facts.push(fact);
        }
        Ok(facts)
    }

    /// Load a partition file as written by [`write`](Self::write)
    pub async fn read(&self, path: &Path) -> Result<Vec<HistoryRecord>> {
        let bytes = fs::read(path).await.map_err(|e| {
            HistoryError::storage(format!("failed to read partition {}: {e}", path.display()))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            HistoryError::storage(format!("failed to parse partition {}: {e}", path.display()))
        })
    }

    async fn merge_write(
        &self,
        site: &str,
        device: &str,
        date: NaiveDate,
        incoming: Vec<HistoryRecord>,
    ) -> Result<PartitionFact> {
        let path = self.partition_path(site, device, date);
        let incoming_count = incoming.len();

        let mut merged: BTreeMap<NaiveDateTime, HistoryRecord> = BTreeMap::new();
        if path.exists() {
            for record in self.read(&path).await? {
                merged.entry(record.timestamp).or_insert(record);
            }
        }
        for record in incoming {
            merged.entry(record.timestamp).or_insert(record);
        }

        // BTreeMap iteration yields ascending timestamps
        let records: Vec<HistoryRecord> = merged.into_values().collect();
        let json = serde_json::to_vec_pretty(&records).map_err(|e| {
            HistoryError::storage(format!("failed to serialize partition {}: {e}", path.display()))
        })?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &json).await?;
        fs::rename(&tmp, &path).await?;

        debug!(
            "Merged {} incoming records into {} ({} total)",
            incoming_count,
            path.display(),
            records.len()
        );

        Ok(PartitionFact {
            device: device.to_string(),
            date,
            record_count: records.len() as u64,
            file_path: path.to_string_lossy().to_string(),
        })
    }
}

/// Make a site or device identifier safe as a single path component
fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}
