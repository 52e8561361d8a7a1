//! Ingestion orchestration
//!
//! `HistoryService` ties the subsystem together: it resolves site
//! credentials, splits the requested range into request-sized spans,
//! pushes each span through the rate-limited dispatcher, streams the
//! response through the extractor, and lands records in the
//! partitioned store. Queries and discovery go through the same
//! service so every upstream call shares one pacing policy.

use crate::client::TelemetryClient;
use crate::config::directory::SiteDirectory;
use crate::config::HistoryConfig;
use crate::dispatch::{DispatcherStats, RateLimitedDispatcher};
use crate::error::{HistoryError, Result};
use crate::extract::{ExtractorConfig, StreamExtractor};
use crate::model::HistorySelection;
use crate::range::{day_end, day_start, split_span};
use crate::storage::{HistoryStore, QueryPage, QueryRequest, StorageStats};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Summary of one ingestion run
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    /// Number of request spans the range was split into
    pub spans: usize,
    /// Distinct devices seen across the run
    pub devices: usize,
    /// Records handed to the store (before dedup)
    pub records: u64,
    /// Partition files written or merged
    pub partitions_touched: u64,
}

/// Result of draining one span's response
#[derive(Debug, Default)]
struct SpanOutcome {
    serials: BTreeSet<String>,
    records: u64,
    partitions: u64,
}

/// Orchestrates ingestion, discovery, and queries for the history store
pub struct HistoryService {
    config: HistoryConfig,
    directory: SiteDirectory,
    dispatcher: RateLimitedDispatcher,
    store: Arc<HistoryStore>,
}

impl HistoryService {
    /// Build a service from validated configuration
    pub async fn new(config: HistoryConfig) -> Result<Self> {
        config.validate()?;
        let directory = SiteDirectory::load(&config.sites_file)?;
        let store = Arc::new(HistoryStore::open(&config.storage).await?);
        let dispatcher = RateLimitedDispatcher::new(config.dispatcher.clone());
        Ok(Self {
            config,
            directory,
            dispatcher,
            store,
        })
    }

    /// Ingest history for one site across an inclusive date range.
    ///
    /// Credential resolution happens before any network traffic; a site
    /// without usable credentials fails the whole run. Spans run strictly
    /// in order and the run aborts on the first span failure, leaving
    /// partitions written so far in place.
    pub async fn ingest_range(
        &self,
        site: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<IngestReport> {
        let credentials = self.directory.lookup(site)?;
        let client = Arc::new(TelemetryClient::new(&self.config.upstream, &credentials)?);

        let spans = split_span(
            day_start(start),
            day_end(end),
            self.config.upstream.max_span_days,
        )?;
        info!(
            "ingesting {} span(s) for site {site} covering {start} to {end}",
            spans.len()
        );

        let mut report = IngestReport {
            spans: spans.len(),
            ..Default::default()
        };
        let mut serials = BTreeSet::new();

        for span in spans {
            let selection = HistorySelection::new(span.start, span.end);
            let client = Arc::clone(&client);
            let store = Arc::clone(&self.store);
            let extractor_config = self.config.extractor.clone();
            let span_site = site.to_string();

            let outcome = match self
                .dispatcher
                .submit(site, move || {
                    ingest_span(client, store, extractor_config, span_site, selection)
                })
                .await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(
                        "aborting ingestion for site {site}: span {} to {} failed: {err}",
                        span.start, span.end
                    );
                    return Err(err);
                }
            };

            serials.extend(outcome.serials);
            report.records += outcome.records;
            report.partitions_touched += outcome.partitions;
        }

        report.devices = serials.len();
        info!(
            "ingestion for site {site} finished: {} record(s) across {} partition(s) from {} device(s)",
            report.records, report.partitions_touched, report.devices
        );
        Ok(report)
    }

    /// Enumerate device serials a site reported on one day.
    ///
    /// Runs through the dispatcher like any other upstream call but never
    /// writes to the store; devices with empty history still count.
    pub async fn discover(&self, site: &str, date: NaiveDate) -> Result<Vec<String>> {
        let credentials = self.directory.lookup(site)?;
        let client = Arc::new(TelemetryClient::new(&self.config.upstream, &credentials)?);
        let selection = HistorySelection::new(day_start(date), day_end(date));
        let extractor_config = self.config.extractor.clone();
        let span_site = site.to_string();

        self.dispatcher
            .submit(site, move || async move {
                let mut response = client.fetch_history(&selection).await?;
                let mut extractor = StreamExtractor::new(extractor_config);
                let mut serials = BTreeSet::new();

                while let Some(chunk) = response.chunk().await? {
                    for block in extractor.feed(&chunk)? {
                        serials.insert(block.serial_no);
                    }
                }

                let summary = extractor.finalize();
                if summary.found && !summary.completed {
                    return Err(HistoryError::parse(
                        "history array not terminated before end of response",
                    ));
                }
                debug!(
                    "discovery for site {span_site} on {} found {} device(s)",
                    selection.start_date_time.date(),
                    serials.len()
                );
                Ok(serials.into_iter().collect())
            })
            .await
    }

    /// Serve one page of stored records.
    ///
    /// A zero page size falls back to the configured default; sizes above
    /// the configured maximum are rejected.
    pub async fn query(&self, mut request: QueryRequest) -> Result<QueryPage> {
        if request.page_size == 0 {
            request.page_size = self.config.query.default_page_size;
        }
        if request.page_size > self.config.query.max_page_size {
            return Err(HistoryError::invalid_input(format!(
                "page size {} exceeds the maximum of {}",
                request.page_size, self.config.query.max_page_size
            )));
        }
        self.store.query(&request).await
    }

    /// Coverage snapshot from the metadata index
    pub async fn stats(&self) -> StorageStats {
        self.store.stats().await
    }

    /// Dispatcher counters for observability
    pub async fn dispatcher_stats(&self) -> DispatcherStats {
        self.dispatcher.stats().await
    }

    /// Stop dispatching and drop queued work
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}

/// Drain one span's response into the store.
///
/// Each closed history object becomes durable before the next byte is
/// scanned, so an abort keeps everything written so far.
async fn ingest_span(
    client: Arc<TelemetryClient>,
    store: Arc<HistoryStore>,
    extractor_config: ExtractorConfig,
    site: String,
    selection: HistorySelection,
) -> Result<SpanOutcome> {
    let mut response = client.fetch_history(&selection).await?;
    let mut extractor = StreamExtractor::new(extractor_config);
    let mut outcome = SpanOutcome::default();
    let mut blocks = Vec::new();

    while let Some(chunk) = response.chunk().await? {
        // objects preceding a malformed one still land before the abort
        let scan = extractor.feed_into(&chunk, &mut blocks);
        for block in blocks.drain(..) {
            outcome.serials.insert(block.serial_no.clone());
            let records = block.into_records();
            outcome.records += records.len() as u64;
            let facts = store.write_batch(&site, records).await?;
            outcome.partitions += facts.len() as u64;
        }
        scan?;
    }

    let summary = extractor.finalize();
    if summary.found && !summary.completed {
        return Err(HistoryError::parse(
            "history array not terminated before end of response",
        ));
    }
    if let Some(message) = &summary.trailing_message {
        debug!("trailing service message for site {site}: {message}");
    }
    debug!(
        "span {} to {} for site {site}: {} object(s), {} record(s)",
        selection.start_date_time, selection.end_date_time, summary.emitted, outcome.records
    );
    Ok(outcome)
}
