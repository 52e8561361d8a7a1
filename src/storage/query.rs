//! Paginated range reads over indexed partitions

use crate::error::{HistoryError, Result};
use crate::model::HistoryRecord;
use crate::storage::index::MetadataIndex;
use crate::storage::partition::PartitionWriter;
use chrono::NaiveDate;
use serde::Serialize;
use std::path::Path;
use tracing::debug;

/// One page worth of history records for (site, device, date range)
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub site: String,
    pub device: String,
    /// Inclusive first day
    pub start: NaiveDate,
    /// Inclusive last day
    pub end: NaiveDate,
    /// Zero-based page number
    pub page: usize,
    pub page_size: usize,
}

/// Query result page
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPage {
    /// Records in ascending timestamp order
    pub records: Vec<HistoryRecord>,
    /// Whether the page filled exactly and further records remain
    pub has_more: bool,
}

/// Resolve candidate partitions through the index and collect one page.
///
/// Partitions are visited in date order. Whole partitions in front of the
/// page are skipped arithmetically using their index record counts, so only
/// the files contributing to the page are read; `has_more` likewise derives
/// from index counts rather than further reads.
pub(crate) async fn execute(
    writer: &PartitionWriter,
    index: &MetadataIndex,
    request: &QueryRequest,
) -> Result<QueryPage> {
    if request.start > request.end {
        return Err(HistoryError::invalid_input(format!(
            "query start {} is after end {}",
            request.start, request.end
        )));
    }
    if request.page_size == 0 {
        return Err(HistoryError::invalid_input("page size must be at least 1"));
    }

    let entries = index.find_partitions(&request.site, &request.device, request.start, request.end);
    let total: u64 = entries.iter().map(|e| e.record_count).sum();
    let mut to_skip = (request.page as u64)
        .checked_mul(request.page_size as u64)
        .ok_or_else(|| HistoryError::invalid_input("page offset overflows"))?;

    let mut records = Vec::new();
    for entry in &entries {
        if records.len() >= request.page_size {
            break;
        }
        if to_skip >= entry.record_count {
            to_skip -= entry.record_count;
            continue;
        }

        let partition = writer.read(Path::new(&entry.file_path)).await?;
        for record in partition.into_iter().skip(to_skip as usize) {
            records.push(record);
            if records.len() >= request.page_size {
                break;
            }
        }
        to_skip = 0;
    }

    let consumed = (request.page as u64) * (request.page_size as u64) + records.len() as u64;
    let has_more = records.len() == request.page_size && consumed < total;

    debug!(
        "Query {}/{} {}..{} page {} -> {} records (has_more={})",
        request.site,
        request.device,
        request.start,
        request.end,
        request.page,
        records.len(),
        has_more
    );

    Ok(QueryPage { records, has_more })
}
