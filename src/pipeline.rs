//! Cleaning pipeline: differential Bronze-to-Silver driver.
//!
//! Per family: read the cleaning watermark, pull the delta of raw rows past
//! it (oldest first, capped), transform through the family's cleaner, then
//! commit rows and watermark in one transaction. A rolled-back batch leaves
//! the watermark untouched and is retried on the next invocation; upsert
//! semantics make the retry idempotent.

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cleaners::{self, BodyExtractor};
use crate::error::PipelineError;
use crate::models::{CleanReport, RawRecord, SilverRows, SourceFamily, Watermark};
use crate::store::{fmt_ts, Store};

pub const DEFAULT_BATCH_CAP: usize = 100;

#[derive(Debug, Clone)]
pub struct CleanOptions {
    pub families: Vec<SourceFamily>,
    pub dry_run: bool,
    /// Raw rows pulled per delta query; bounds memory.
    pub batch_cap: usize,
}

impl Default for CleanOptions {
    fn default() -> Self {
        Self {
            families: SourceFamily::ALL.to_vec(),
            dry_run: false,
            batch_cap: DEFAULT_BATCH_CAP,
        }
    }
}

/// One family's row in the `--verify` report.
#[derive(Debug, Clone)]
pub struct VerifyRow {
    pub family: SourceFamily,
    pub raw_rows: usize,
    pub silver_rows: usize,
    pub pending_raw_rows: usize,
    pub watermark: Watermark,
}

#[derive(Clone)]
pub struct CleaningPipeline {
    store: Store,
    extractor: BodyExtractor,
}

impl CleaningPipeline {
    pub fn new(store: Store, extractor: BodyExtractor) -> Self {
        Self { store, extractor }
    }

    /// Run the differential algorithm for the selected families.
    pub async fn clean(
        &self,
        options: &CleanOptions,
        cancel: &CancellationToken,
    ) -> Result<CleanReport, PipelineError> {
        let mut total = CleanReport::default();
        for family in &options.families {
            if cancel.is_cancelled() {
                break;
            }
            total.absorb(self.clean_family(*family, options, cancel).await?);
        }
        info!(
            batches = total.batches,
            raw_rows_seen = total.raw_rows_seen,
            silver_rows_written = total.silver_rows_written,
            skipped = total.skipped,
            dry_run = options.dry_run,
            "cleaning finished"
        );
        Ok(total)
    }

    async fn clean_family(
        &self,
        family: SourceFamily,
        options: &CleanOptions,
        cancel: &CancellationToken,
    ) -> Result<CleanReport, PipelineError> {
        let watermark_key = family.cleaning_watermark_key();
        let mut cursor = self
            .store
            .get_watermark(&watermark_key)
            .await?
            .last_cleaned_at;
        let mut report = CleanReport::default();

        loop {
            if cancel.is_cancelled() {
                warn!(source_family = family.as_str(), "cleaning interrupted by shutdown");
                break;
            }

            let delta = self
                .store
                .fetch_raw_delta(family, cursor, options.batch_cap)
                .await?;

            if delta.is_empty() {
                if report.batches == 0 {
                    info!(
                        source_family = family.as_str(),
                        status = "idle",
                        "no new records"
                    );
                }
                break;
            }

            // delta is ordered ascending, so the last row carries the max
            let max_inserted_at = delta[delta.len() - 1].inserted_at;
            let batch_len = delta.len();

            let (rows, skipped) = self.transform(family, &delta, cancel).await;
            report.raw_rows_seen += batch_len;
            report.skipped += skipped;

            if cancel.is_cancelled() {
                // shutdown raced the transform; do not commit a partial view
                warn!(source_family = family.as_str(), "discarding batch on shutdown");
                break;
            }

            if options.dry_run {
                info!(
                    source_family = family.as_str(),
                    status = "dry_run",
                    count = rows.len(),
                    skipped,
                    would_advance_to = %fmt_ts(max_inserted_at),
                    "dry run: batch not committed"
                );
            } else {
                match self
                    .store
                    .commit_clean_batch(&watermark_key, &rows, max_inserted_at)
                    .await
                {
                    Ok(written) => {
                        report.silver_rows_written += written;
                        info!(
                            source_family = family.as_str(),
                            status = "committed",
                            count = written,
                            skipped,
                            watermark = %fmt_ts(max_inserted_at),
                            "cleaning batch committed"
                        );
                    }
                    Err(e) => {
                        // watermark unchanged; this batch retries next run
                        error!(
                            source_family = family.as_str(),
                            status = "rolled_back",
                            error_kind = e.error_kind(),
                            error = %e,
                            "cleaning batch rolled back"
                        );
                        break;
                    }
                }
            }

            report.batches += 1;
            cursor = Some(max_inserted_at);

            if batch_len < options.batch_cap {
                break;
            }
        }

        Ok(report)
    }

    /// Dispatch each raw row to its family cleaner. Per-row failures are
    /// logged and counted as skips; the batch always survives.
    async fn transform(
        &self,
        family: SourceFamily,
        delta: &[RawRecord],
        cancel: &CancellationToken,
    ) -> (SilverRows, usize) {
        let mut skipped = 0usize;

        match family {
            SourceFamily::MacroSeries => {
                let mut rows = Vec::new();
                for record in delta {
                    match cleaners::macro_series::clean(record) {
                        Ok((mut batch, batch_skipped)) => {
                            rows.append(&mut batch);
                            skipped += batch_skipped;
                        }
                        Err(e) => {
                            skipped += 1;
                            warn!(
                                catalog_key = %record.catalog_key,
                                request_hash = %record.request_hash,
                                error_kind = e.error_kind(),
                                error = %e,
                                "skipping uncleanable raw row"
                            );
                        }
                    }
                }
                (SilverRows::Macro(rows), skipped)
            }
            SourceFamily::PriceBars => {
                let mut rows = Vec::new();
                for record in delta {
                    match cleaners::price_bars::clean(record) {
                        Ok((mut batch, batch_skipped)) => {
                            rows.append(&mut batch);
                            skipped += batch_skipped;
                        }
                        Err(e) => {
                            skipped += 1;
                            warn!(
                                catalog_key = %record.catalog_key,
                                request_hash = %record.request_hash,
                                error_kind = e.error_kind(),
                                error = %e,
                                "skipping uncleanable raw row"
                            );
                        }
                    }
                }
                (SilverRows::Micro(rows), skipped)
            }
            SourceFamily::NewsFeed => {
                let mut rows = Vec::new();
                for record in delta {
                    match cleaners::news_feed::clean(record, &self.extractor, cancel).await {
                        Ok((mut batch, batch_skipped)) => {
                            rows.append(&mut batch);
                            skipped += batch_skipped;
                        }
                        Err(e) => {
                            skipped += 1;
                            warn!(
                                catalog_key = %record.catalog_key,
                                request_hash = %record.request_hash,
                                error_kind = e.error_kind(),
                                error = %e,
                                "skipping uncleanable raw row"
                            );
                        }
                    }
                }
                (SilverRows::News(rows), skipped)
            }
        }
    }

    /// Null the cleaning watermark so the next run reprocesses everything.
    pub async fn reset_watermark(
        &self,
        family: Option<SourceFamily>,
    ) -> Result<(), PipelineError> {
        let families = match family {
            Some(f) => vec![f],
            None => SourceFamily::ALL.to_vec(),
        };
        for family in families {
            let key = family.cleaning_watermark_key();
            self.store.reset_clean_watermark(&key).await?;
            info!(
                source_family = family.as_str(),
                status = "watermark_reset",
                "cleaning watermark reset"
            );
        }
        Ok(())
    }

    /// Consistency report for `--verify`: raw vs silver counts, watermark
    /// position, and raw rows not yet cleaned.
    pub async fn verify(&self) -> Result<Vec<VerifyRow>, PipelineError> {
        let mut rows = Vec::with_capacity(SourceFamily::ALL.len());
        for family in SourceFamily::ALL {
            let watermark = self
                .store
                .get_watermark(&family.cleaning_watermark_key())
                .await?;
            rows.push(VerifyRow {
                family,
                raw_rows: self.store.count_raw(family).await?,
                silver_rows: self.store.count_silver(family).await?,
                pending_raw_rows: self
                    .store
                    .count_raw_pending(family, watermark.last_cleaned_at)
                    .await?,
                watermark,
            });
        }
        Ok(rows)
    }
}
