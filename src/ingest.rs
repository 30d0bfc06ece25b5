//! Ingestion engine: poll due catalog entries and land raw rows.
//!
//! Each entry is ingested in isolation; one upstream falling over never
//! aborts the batch. Fetches run concurrently across catalog keys, bounded
//! by the HTTP client's per-host caps, while the store serializes writes.

use chrono::Utc;
use futures_util::future::join_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::adapters::{self, AdapterConfig};
use crate::error::PipelineError;
use crate::fetch::FetchClient;
use crate::models::{CatalogEntry, IngestReport, RawRecord, UpdateFrequency};
use crate::store::Store;

#[derive(Clone)]
pub struct IngestEngine {
    store: Store,
    http: FetchClient,
    adapters: AdapterConfig,
}

enum EntryOutcome {
    Written,
    Duplicate,
    Empty,
    Failed,
}

impl IngestEngine {
    pub fn new(store: Store, http: FetchClient, adapters: AdapterConfig) -> Self {
        Self {
            store,
            http,
            adapters,
        }
    }

    /// Ingest every active catalog entry at `frequency` (optionally narrowed
    /// to one key). Per-entry failures are logged and counted, never raised.
    pub async fn ingest(
        &self,
        frequency: UpdateFrequency,
        only_catalog: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<IngestReport, PipelineError> {
        let entries = self
            .store
            .load_catalog(Some(frequency), only_catalog, true)
            .await?;

        if entries.is_empty() {
            info!(frequency = frequency.as_str(), "no active catalog entries due");
            return Ok(IngestReport::default());
        }

        info!(
            frequency = frequency.as_str(),
            count = entries.len(),
            "starting ingestion batch"
        );

        let outcomes = join_all(entries.iter().map(|entry| self.ingest_one(entry, cancel))).await;

        let mut report = IngestReport {
            attempted: entries.len(),
            ..IngestReport::default()
        };
        for outcome in outcomes {
            match outcome {
                EntryOutcome::Written => {
                    report.succeeded += 1;
                    report.raw_rows_written += 1;
                }
                EntryOutcome::Duplicate => report.succeeded += 1,
                EntryOutcome::Empty => report.skipped_empty += 1,
                EntryOutcome::Failed => report.failed += 1,
            }
        }

        info!(
            frequency = frequency.as_str(),
            attempted = report.attempted,
            succeeded = report.succeeded,
            skipped_empty = report.skipped_empty,
            failed = report.failed,
            raw_rows_written = report.raw_rows_written,
            "ingestion batch finished"
        );
        Ok(report)
    }

    async fn ingest_one(&self, entry: &CatalogEntry, cancel: &CancellationToken) -> EntryOutcome {
        let started = Instant::now();
        let result = self.try_ingest(entry, cancel).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok((request_hash, inserted)) => {
                info!(
                    catalog_key = %entry.catalog_key,
                    source_family = entry.source_family.as_str(),
                    status = if inserted { "ok" } else { "duplicate" },
                    duration_ms,
                    request_hash = %request_hash,
                    "catalog entry ingested"
                );
                if inserted {
                    EntryOutcome::Written
                } else {
                    EntryOutcome::Duplicate
                }
            }
            Err(PipelineError::EmptyResultSet) => {
                warn!(
                    catalog_key = %entry.catalog_key,
                    source_family = entry.source_family.as_str(),
                    status = "empty",
                    duration_ms,
                    error_kind = "empty_result_set",
                    "upstream returned no items"
                );
                EntryOutcome::Empty
            }
            Err(e) => {
                error!(
                    catalog_key = %entry.catalog_key,
                    source_family = entry.source_family.as_str(),
                    status = "failed",
                    duration_ms,
                    error_kind = e.error_kind(),
                    error = %e,
                    "catalog entry failed"
                );
                EntryOutcome::Failed
            }
        }
    }

    async fn try_ingest(
        &self,
        entry: &CatalogEntry,
        cancel: &CancellationToken,
    ) -> Result<(String, bool), PipelineError> {
        let envelope =
            adapters::fetch_envelope(&self.http, &self.adapters, entry, None, cancel).await?;

        let now = Utc::now();
        let bucket = entry.update_frequency.bucket(now);
        let request_hash =
            adapters::request_hash(&entry.catalog_key, &envelope.query_echo, &bucket);

        let record = RawRecord {
            request_hash: request_hash.clone(),
            catalog_key: entry.catalog_key.clone(),
            source_family: entry.source_family,
            payload: envelope,
            inserted_at: now,
        };

        let inserted = self.store.upsert_raw(&record).await?;
        self.store
            .set_ingest_watermark(&entry.catalog_key, now)
            .await?;

        Ok((request_hash, inserted))
    }

    /// Probe each entry with `limit=1` and activate it on HTTP success with
    /// at least one item. Already-active entries are re-probed only when
    /// named explicitly.
    pub async fn activate(
        &self,
        only_catalog: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<usize, PipelineError> {
        let entries = self.store.load_catalog(None, only_catalog, false).await?;
        let mut activated = 0usize;

        for entry in &entries {
            if entry.is_active && only_catalog.is_none() {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            match adapters::fetch_envelope(&self.http, &self.adapters, entry, Some(1), cancel)
                .await
            {
                Ok(envelope) if !envelope.has_error_marker() => {
                    self.store.activate_catalog(&entry.catalog_key).await?;
                    activated += 1;
                    info!(
                        catalog_key = %entry.catalog_key,
                        source_family = entry.source_family.as_str(),
                        status = "activated",
                        "catalog entry confirmed"
                    );
                }
                Ok(_) => {
                    warn!(
                        catalog_key = %entry.catalog_key,
                        status = "not_activated",
                        error_kind = "rate_limited",
                        "activation probe was rate limited"
                    );
                }
                Err(e) => {
                    warn!(
                        catalog_key = %entry.catalog_key,
                        status = "not_activated",
                        error_kind = e.error_kind(),
                        error = %e,
                        "activation probe failed"
                    );
                }
            }
        }

        info!(activated, probed = entries.len(), "activation pass finished");
        Ok(activated)
    }
}
