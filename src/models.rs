//! Core domain types shared across the pipeline.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Source family of a catalog stream. Closed set: registering a new family
/// is a source-code change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceFamily {
    MacroSeries,
    PriceBars,
    NewsFeed,
}

impl SourceFamily {
    pub const ALL: [SourceFamily; 3] = [
        SourceFamily::MacroSeries,
        SourceFamily::PriceBars,
        SourceFamily::NewsFeed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFamily::MacroSeries => "MACRO_SERIES",
            SourceFamily::PriceBars => "PRICE_BARS",
            SourceFamily::NewsFeed => "NEWS_FEED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "MACRO_SERIES" | "MACRO" => Some(SourceFamily::MacroSeries),
            "PRICE_BARS" | "MICRO" => Some(SourceFamily::PriceBars),
            "NEWS_FEED" | "NEWS" => Some(SourceFamily::NewsFeed),
            _ => None,
        }
    }

    /// Synthetic catalog key under which the cleaning stage checkpoints its
    /// progress for this family.
    pub fn cleaning_watermark_key(&self) -> String {
        format!("SYSTEM_CLEANING_{}", self.as_str())
    }
}

/// Update cadence of a catalog stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateFrequency {
    Hourly,
    Daily,
    Monthly,
    Quarterly,
}

impl UpdateFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateFrequency::Hourly => "HOURLY",
            UpdateFrequency::Daily => "DAILY",
            UpdateFrequency::Monthly => "MONTHLY",
            UpdateFrequency::Quarterly => "QUARTERLY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "HOURLY" => Some(UpdateFrequency::Hourly),
            "DAILY" => Some(UpdateFrequency::Daily),
            "MONTHLY" => Some(UpdateFrequency::Monthly),
            "QUARTERLY" => Some(UpdateFrequency::Quarterly),
            _ => None,
        }
    }

    /// Normalized time-window token at this frequency's granularity.
    ///
    /// Folded into the request hash so that repeated fetches within the same
    /// bucket collapse to one raw row.
    pub fn bucket(&self, at: DateTime<Utc>) -> String {
        match self {
            UpdateFrequency::Hourly => at.format("%Y-%m-%dT%H").to_string(),
            UpdateFrequency::Daily => at.format("%Y-%m-%d").to_string(),
            UpdateFrequency::Monthly => at.format("%Y-%m").to_string(),
            UpdateFrequency::Quarterly => {
                let quarter = (at.month() - 1) / 3 + 1;
                format!("{}-Q{}", at.year(), quarter)
            }
        }
    }
}

/// Registry entry for one logical data stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub catalog_key: String,
    pub source_family: SourceFamily,
    pub update_frequency: UpdateFrequency,
    /// Source-specific configuration: series id, ticker, search keywords...
    pub source_config: serde_json::Value,
    pub is_active: bool,
    /// Judgment vs validation. Pass-through metadata.
    pub role_tag: Option<String>,
    /// Macro vs micro. Pass-through metadata.
    pub scope_tag: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Canonical envelope every adapter normalizes its vendor response into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEnvelope {
    pub fetched_at: DateTime<Utc>,
    /// Canonical query parameter string; also feeds the request hash.
    pub query_echo: String,
    /// Source-specific items. May be empty or carry an upstream error marker.
    pub items: serde_json::Value,
}

impl RawEnvelope {
    /// True when the envelope records an upstream error (e.g. rate limiting)
    /// instead of data.
    pub fn has_error_marker(&self) -> bool {
        self.items.get("error").map_or(false, |e| !e.is_null())
    }
}

/// One Bronze row: a persisted adapter fetch.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub request_hash: String,
    pub catalog_key: String,
    pub source_family: SourceFamily,
    pub payload: RawEnvelope,
    pub inserted_at: DateTime<Utc>,
}

/// Per-stream, per-stage checkpoint.
#[derive(Debug, Clone, Default)]
pub struct Watermark {
    pub last_ingested_at: Option<DateTime<Utc>>,
    pub last_cleaned_at: Option<DateTime<Utc>>,
}

/// Silver macro observation.
#[derive(Debug, Clone, PartialEq)]
pub struct MacroRow {
    pub catalog_key: String,
    pub obs_date: NaiveDate,
    pub value: f64,
}

/// Silver price bar.
#[derive(Debug, Clone, PartialEq)]
pub struct MicroRow {
    pub catalog_key: String,
    pub obs_date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: Option<f64>,
}

impl MicroRow {
    /// OHLC sanity: `low <= min(open, close) <= max(open, close) <= high`,
    /// all finite, volume non-negative where present.
    pub fn is_sane(&self) -> bool {
        let finite = [self.open, self.high, self.low, self.close]
            .iter()
            .all(|v| v.is_finite());
        let ordered = self.low <= self.open.min(self.close)
            && self.open.max(self.close) <= self.high;
        let volume_ok = self.volume.map_or(true, |v| v.is_finite() && v >= 0.0);
        finite && ordered && volume_ok
    }
}

/// Silver news row, keyed by md5 of the canonicalized URL.
#[derive(Debug, Clone, PartialEq)]
pub struct NewsRow {
    pub fingerprint: String,
    pub catalog_key: String,
    pub title: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub author: Option<String>,
    pub source_name: Option<String>,
    pub body: Option<String>,
}

/// Typed rows produced by one cleaning batch. A batch is always one family.
#[derive(Debug, Clone)]
pub enum SilverRows {
    Macro(Vec<MacroRow>),
    Micro(Vec<MicroRow>),
    News(Vec<NewsRow>),
}

impl SilverRows {
    pub fn len(&self) -> usize {
        match self {
            SilverRows::Macro(rows) => rows.len(),
            SilverRows::Micro(rows) => rows.len(),
            SilverRows::News(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Aggregate counters returned by one ingestion batch.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IngestReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub skipped_empty: usize,
    pub failed: usize,
    pub raw_rows_written: usize,
}

/// Aggregate counters returned by one cleaning invocation.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CleanReport {
    pub batches: usize,
    pub raw_rows_seen: usize,
    pub silver_rows_written: usize,
    pub skipped: usize,
}

impl CleanReport {
    pub fn absorb(&mut self, other: CleanReport) {
        self.batches += other.batches;
        self.raw_rows_seen += other.raw_rows_seen;
        self.silver_rows_written += other.silver_rows_written;
        self.skipped += other.skipped;
    }
}
