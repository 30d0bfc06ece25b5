//! Persistence gateway for the embedded analytical store.
//!
//! Owns the single writer connection for the lifetime of the process.
//! External consumers (dashboards, analytics) open their own read-only
//! handles; WAL mode keeps those readers unblocked while we write.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::PipelineError;
use crate::models::{
    CatalogEntry, MacroRow, MicroRow, NewsRow, RawEnvelope, RawRecord, SilverRows, SourceFamily,
    UpdateFrequency, Watermark,
};

/// Fixed-width UTC timestamp format. Lexicographic order matches
/// chronological order, which the delta query relies on.
const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the store at `path`, enable WAL, and bootstrap the
    /// schema idempotently.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create data dir {}", parent.display()))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("open store at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        Self::create_schema(&conn).context("bootstrap schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS data_catalog (
                catalog_key TEXT PRIMARY KEY,
                source_family TEXT NOT NULL,
                update_frequency TEXT NOT NULL,
                source_config TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 0,
                role_tag TEXT,
                scope_tag TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS raw_ingestion_cache (
                request_hash TEXT PRIMARY KEY,
                catalog_key TEXT NOT NULL,
                source_family TEXT NOT NULL,
                payload TEXT NOT NULL,
                inserted_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_raw_family_inserted
             ON raw_ingestion_cache(source_family, inserted_at)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_watermarks (
                catalog_key TEXT PRIMARY KEY,
                last_ingested_at TEXT,
                last_cleaned_at TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS timeseries_macro (
                catalog_key TEXT NOT NULL,
                obs_date TEXT NOT NULL,
                value REAL NOT NULL,
                PRIMARY KEY (catalog_key, obs_date)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS timeseries_micro (
                catalog_key TEXT NOT NULL,
                obs_date TEXT NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL,
                PRIMARY KEY (catalog_key, obs_date)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS news_intel_pool (
                fingerprint TEXT PRIMARY KEY,
                catalog_key TEXT NOT NULL,
                title TEXT NOT NULL,
                url TEXT NOT NULL,
                published_at TEXT,
                author TEXT,
                source_name TEXT,
                body TEXT,
                sentiment REAL,
                ai_summary TEXT
            )",
            [],
        )?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Catalog
    // ------------------------------------------------------------------

    /// Insert a catalog entry if its key is not already registered.
    pub async fn seed_catalog(&self, entries: &[CatalogEntry]) -> Result<usize, PipelineError> {
        let conn = self.conn.lock().await;
        let mut inserted = 0usize;
        for entry in entries {
            let config_json =
                serde_json::to_string(&entry.source_config).unwrap_or_else(|_| "{}".into());
            inserted += conn.execute(
                "INSERT OR IGNORE INTO data_catalog
                 (catalog_key, source_family, update_frequency, source_config,
                  is_active, role_tag, scope_tag, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.catalog_key,
                    entry.source_family.as_str(),
                    entry.update_frequency.as_str(),
                    config_json,
                    entry.is_active as i64,
                    entry.role_tag,
                    entry.scope_tag,
                    fmt_ts(entry.created_at),
                ],
            )?;
        }
        Ok(inserted)
    }

    /// Load catalog entries, optionally filtered by frequency and key.
    pub async fn load_catalog(
        &self,
        frequency: Option<UpdateFrequency>,
        catalog_key: Option<&str>,
        only_active: bool,
    ) -> Result<Vec<CatalogEntry>, PipelineError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT catalog_key, source_family, update_frequency, source_config,
                    is_active, role_tag, scope_tag, created_at
             FROM data_catalog
             WHERE (?1 IS NULL OR update_frequency = ?1)
               AND (?2 IS NULL OR catalog_key = ?2)
               AND (?3 = 0 OR is_active = 1)
             ORDER BY catalog_key ASC",
        )?;

        let rows = stmt
            .query_map(
                params![
                    frequency.map(|f| f.as_str()),
                    catalog_key,
                    only_active as i64
                ],
                Self::row_to_catalog_entry,
            )?
            .filter_map(|r| match r {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable catalog row");
                    None
                }
            })
            .collect();

        Ok(rows)
    }

    fn row_to_catalog_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<CatalogEntry>> {
        let key: String = row.get(0)?;
        let family_raw: String = row.get(1)?;
        let freq_raw: String = row.get(2)?;
        let config_raw: String = row.get(3)?;
        let is_active: i64 = row.get(4)?;
        let role_tag: Option<String> = row.get(5)?;
        let scope_tag: Option<String> = row.get(6)?;
        let created_raw: String = row.get(7)?;

        let (Some(source_family), Some(update_frequency)) = (
            SourceFamily::parse(&family_raw),
            UpdateFrequency::parse(&freq_raw),
        ) else {
            warn!(catalog_key = %key, "catalog row has unknown family or frequency");
            return Ok(None);
        };

        Ok(Some(CatalogEntry {
            catalog_key: key,
            source_family,
            update_frequency,
            source_config: serde_json::from_str(&config_raw)
                .unwrap_or(serde_json::Value::Null),
            is_active: is_active != 0,
            role_tag,
            scope_tag,
            created_at: parse_ts(&created_raw).unwrap_or_else(Utc::now),
        }))
    }

    /// Flip a catalog entry active and seed its watermark row, atomically.
    pub async fn activate_catalog(&self, catalog_key: &str) -> Result<(), PipelineError> {
        let conn = self.conn.lock().await;
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> rusqlite::Result<()> {
            conn.execute(
                "UPDATE data_catalog SET is_active = 1 WHERE catalog_key = ?1",
                params![catalog_key],
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO sync_watermarks (catalog_key) VALUES (?1)",
                params![catalog_key],
            )?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                conn.execute("COMMIT", [])?;
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e.into())
            }
        }
    }

    // ------------------------------------------------------------------
    // Bronze
    // ------------------------------------------------------------------

    /// Insert a raw row keyed by request hash. No-op when the hash already
    /// exists. Returns true when a new row landed.
    pub async fn upsert_raw(&self, record: &RawRecord) -> Result<bool, PipelineError> {
        let payload_json = serde_json::to_string(&record.payload)
            .map_err(|e| PipelineError::PermanentUpstream(format!("unserializable payload: {e}")))?;

        let conn = self.conn.lock().await;
        let changes = conn.execute(
            "INSERT OR IGNORE INTO raw_ingestion_cache
             (request_hash, catalog_key, source_family, payload, inserted_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.request_hash,
                record.catalog_key,
                record.source_family.as_str(),
                payload_json,
                fmt_ts(record.inserted_at),
            ],
        )?;
        Ok(changes > 0)
    }

    /// Raw rows of one family strictly after `after`, oldest first, capped.
    pub async fn fetch_raw_delta(
        &self,
        family: SourceFamily,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<RawRecord>, PipelineError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT request_hash, catalog_key, payload, inserted_at
             FROM raw_ingestion_cache
             WHERE source_family = ?1
               AND (?2 IS NULL OR inserted_at > ?2)
             ORDER BY inserted_at ASC
             LIMIT ?3",
        )?;

        let rows = stmt
            .query_map(
                params![family.as_str(), after.map(fmt_ts), limit as i64],
                |row| {
                    let request_hash: String = row.get(0)?;
                    let catalog_key: String = row.get(1)?;
                    let payload_raw: String = row.get(2)?;
                    let inserted_raw: String = row.get(3)?;
                    Ok((request_hash, catalog_key, payload_raw, inserted_raw))
                },
            )?
            .filter_map(|r| r.ok())
            .filter_map(|(request_hash, catalog_key, payload_raw, inserted_raw)| {
                let payload: RawEnvelope = match serde_json::from_str(&payload_raw) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(request_hash = %request_hash, error = %e,
                              "skipping raw row with undecodable payload");
                        return None;
                    }
                };
                let inserted_at = parse_ts(&inserted_raw)?;
                Some(RawRecord {
                    request_hash,
                    catalog_key,
                    source_family: family,
                    payload,
                    inserted_at,
                })
            })
            .collect();

        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Watermarks
    // ------------------------------------------------------------------

    pub async fn get_watermark(&self, catalog_key: &str) -> Result<Watermark, PipelineError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT last_ingested_at, last_cleaned_at FROM sync_watermarks
             WHERE catalog_key = ?1",
        )?;
        let row = stmt
            .query_row(params![catalog_key], |row| {
                let ingested: Option<String> = row.get(0)?;
                let cleaned: Option<String> = row.get(1)?;
                Ok((ingested, cleaned))
            })
            .optional()?;

        Ok(match row {
            Some((ingested, cleaned)) => Watermark {
                last_ingested_at: ingested.as_deref().and_then(parse_ts),
                last_cleaned_at: cleaned.as_deref().and_then(parse_ts),
            },
            None => Watermark::default(),
        })
    }

    pub async fn set_ingest_watermark(
        &self,
        catalog_key: &str,
        ts: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sync_watermarks (catalog_key, last_ingested_at)
             VALUES (?1, ?2)
             ON CONFLICT(catalog_key) DO UPDATE SET
                last_ingested_at = excluded.last_ingested_at",
            params![catalog_key, fmt_ts(ts)],
        )?;
        Ok(())
    }

    /// Null out `last_cleaned_at` so the next cleaning run reprocesses all
    /// raw rows of the family.
    pub async fn reset_clean_watermark(&self, catalog_key: &str) -> Result<(), PipelineError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sync_watermarks (catalog_key, last_cleaned_at)
             VALUES (?1, NULL)
             ON CONFLICT(catalog_key) DO UPDATE SET last_cleaned_at = NULL",
            params![catalog_key],
        )?;
        Ok(())
    }

    pub async fn list_watermarks(&self) -> Result<Vec<(String, Watermark)>, PipelineError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT catalog_key, last_ingested_at, last_cleaned_at
             FROM sync_watermarks ORDER BY catalog_key ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let key: String = row.get(0)?;
                let ingested: Option<String> = row.get(1)?;
                let cleaned: Option<String> = row.get(2)?;
                Ok((key, ingested, cleaned))
            })?
            .filter_map(|r| r.ok())
            .map(|(key, ingested, cleaned)| {
                (
                    key,
                    Watermark {
                        last_ingested_at: ingested.as_deref().and_then(parse_ts),
                        last_cleaned_at: cleaned.as_deref().and_then(parse_ts),
                    },
                )
            })
            .collect();
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Silver + atomic batch commit
    // ------------------------------------------------------------------

    /// Commit one cleaning batch: upsert every silver row, then advance the
    /// family's cleaning watermark. All inside a single transaction; any
    /// failure rolls the whole batch back and leaves the watermark in place.
    pub async fn commit_clean_batch(
        &self,
        watermark_key: &str,
        rows: &SilverRows,
        new_watermark: DateTime<Utc>,
    ) -> Result<usize, PipelineError> {
        let conn = self.conn.lock().await;
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| -> rusqlite::Result<usize> {
            let written = match rows {
                SilverRows::Macro(rows) => Self::upsert_macro_rows(&conn, rows)?,
                SilverRows::Micro(rows) => Self::upsert_micro_rows(&conn, rows)?,
                SilverRows::News(rows) => Self::upsert_news_rows(&conn, rows)?,
            };
            conn.execute(
                "INSERT INTO sync_watermarks (catalog_key, last_cleaned_at)
                 VALUES (?1, ?2)
                 ON CONFLICT(catalog_key) DO UPDATE SET
                    last_cleaned_at = excluded.last_cleaned_at",
                params![watermark_key, fmt_ts(new_watermark)],
            )?;
            Ok(written)
        })();

        match result {
            Ok(written) => {
                conn.execute("COMMIT", [])?;
                Ok(written)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e.into())
            }
        }
    }

    fn upsert_macro_rows(conn: &Connection, rows: &[MacroRow]) -> rusqlite::Result<usize> {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO timeseries_macro (catalog_key, obs_date, value)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(catalog_key, obs_date) DO UPDATE SET
                value = excluded.value",
        )?;
        for row in rows {
            stmt.execute(params![
                row.catalog_key,
                row.obs_date.format("%Y-%m-%d").to_string(),
                row.value,
            ])?;
        }
        Ok(rows.len())
    }

    fn upsert_micro_rows(conn: &Connection, rows: &[MicroRow]) -> rusqlite::Result<usize> {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO timeseries_micro
             (catalog_key, obs_date, open, high, low, close, volume)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(catalog_key, obs_date) DO UPDATE SET
                open = excluded.open,
                high = excluded.high,
                low = excluded.low,
                close = excluded.close,
                volume = excluded.volume",
        )?;
        for row in rows {
            stmt.execute(params![
                row.catalog_key,
                row.obs_date.format("%Y-%m-%d").to_string(),
                row.open,
                row.high,
                row.low,
                row.close,
                row.volume,
            ])?;
        }
        Ok(rows.len())
    }

    // Later observation of the same fingerprint replaces earlier metadata;
    // sentiment and ai_summary belong to downstream enrichers and survive
    // the upsert untouched.
    fn upsert_news_rows(conn: &Connection, rows: &[NewsRow]) -> rusqlite::Result<usize> {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO news_intel_pool
             (fingerprint, catalog_key, title, url, published_at, author,
              source_name, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(fingerprint) DO UPDATE SET
                catalog_key = excluded.catalog_key,
                title = excluded.title,
                url = excluded.url,
                published_at = excluded.published_at,
                author = excluded.author,
                source_name = excluded.source_name,
                body = excluded.body",
        )?;
        for row in rows {
            stmt.execute(params![
                row.fingerprint,
                row.catalog_key,
                row.title,
                row.url,
                row.published_at.map(fmt_ts),
                row.author,
                row.source_name,
                row.body,
            ])?;
        }
        Ok(rows.len())
    }

    // ------------------------------------------------------------------
    // Inspection helpers (--show-watermarks, --verify)
    // ------------------------------------------------------------------

    pub async fn count_raw(&self, family: SourceFamily) -> Result<usize, PipelineError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM raw_ingestion_cache WHERE source_family = ?1",
            params![family.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Raw rows of a family not yet past the cleaning watermark.
    pub async fn count_raw_pending(
        &self,
        family: SourceFamily,
        after: Option<DateTime<Utc>>,
    ) -> Result<usize, PipelineError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM raw_ingestion_cache
             WHERE source_family = ?1 AND (?2 IS NULL OR inserted_at > ?2)",
            params![family.as_str(), after.map(fmt_ts)],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub async fn count_silver(&self, family: SourceFamily) -> Result<usize, PipelineError> {
        let table = match family {
            SourceFamily::MacroSeries => "timeseries_macro",
            SourceFamily::PriceBars => "timeseries_micro",
            SourceFamily::NewsFeed => "news_intel_pool",
        };
        let conn = self.conn.lock().await;
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Point read used by tests and verification.
    pub async fn get_macro_value(
        &self,
        catalog_key: &str,
        obs_date: NaiveDate,
    ) -> Result<Option<f64>, PipelineError> {
        let conn = self.conn.lock().await;
        let value = conn
            .query_row(
                "SELECT value FROM timeseries_macro
                 WHERE catalog_key = ?1 AND obs_date = ?2",
                params![catalog_key, obs_date.format("%Y-%m-%d").to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub async fn get_news_body(
        &self,
        fingerprint: &str,
    ) -> Result<Option<Option<String>>, PipelineError> {
        let conn = self.conn.lock().await;
        let body = conn
            .query_row(
                "SELECT body FROM news_intel_pool WHERE fingerprint = ?1",
                params![fingerprint],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, Store) {
        let dir = TempDir::new().expect("tempdir");
        let store = Store::open(&dir.path().join("test.db")).expect("open store");
        (dir, store)
    }

    fn raw_record(hash: &str, key: &str, inserted_at: DateTime<Utc>) -> RawRecord {
        RawRecord {
            request_hash: hash.into(),
            catalog_key: key.into(),
            source_family: SourceFamily::MacroSeries,
            payload: RawEnvelope {
                fetched_at: inserted_at,
                query_echo: format!("series_id={key}"),
                items: json!({"observations": [{"date": "2025-01-02", "value": "4.23"}]}),
            },
            inserted_at,
        }
    }

    #[tokio::test]
    async fn raw_upsert_is_idempotent() {
        let (_dir, store) = test_store();
        let ts = Utc.with_ymd_and_hms(2025, 1, 2, 12, 0, 0).unwrap();
        let record = raw_record("abc123", "METRIC_US_10Y_YIELD", ts);

        assert!(store.upsert_raw(&record).await.unwrap());
        assert!(!store.upsert_raw(&record).await.unwrap());
        assert_eq!(store.count_raw(SourceFamily::MacroSeries).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delta_query_orders_and_filters() {
        let (_dir, store) = test_store();
        let t1 = Utc.with_ymd_and_hms(2025, 1, 2, 12, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2025, 1, 3, 12, 0, 0).unwrap();
        let t3 = Utc.with_ymd_and_hms(2025, 1, 4, 12, 0, 0).unwrap();

        // inserted out of order on purpose
        store.upsert_raw(&raw_record("h2", "A", t2)).await.unwrap();
        store.upsert_raw(&raw_record("h1", "A", t1)).await.unwrap();
        store.upsert_raw(&raw_record("h3", "A", t3)).await.unwrap();

        let all = store
            .fetch_raw_delta(SourceFamily::MacroSeries, None, 100)
            .await
            .unwrap();
        let hashes: Vec<_> = all.iter().map(|r| r.request_hash.as_str()).collect();
        assert_eq!(hashes, vec!["h1", "h2", "h3"]);

        let delta = store
            .fetch_raw_delta(SourceFamily::MacroSeries, Some(t1), 100)
            .await
            .unwrap();
        assert_eq!(delta.len(), 2);
        assert_eq!(delta[0].request_hash, "h2");

        let capped = store
            .fetch_raw_delta(SourceFamily::MacroSeries, None, 2)
            .await
            .unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[tokio::test]
    async fn clean_batch_commit_is_atomic_and_advances_watermark() {
        let (_dir, store) = test_store();
        let wm_key = SourceFamily::MacroSeries.cleaning_watermark_key();
        let ts = Utc.with_ymd_and_hms(2025, 1, 5, 0, 0, 0).unwrap();

        let rows = SilverRows::Macro(vec![
            MacroRow {
                catalog_key: "METRIC_US_10Y_YIELD".into(),
                obs_date: NaiveDate::from_ymd_opt(2025, 1, 2).unwrap(),
                value: 4.23,
            },
            MacroRow {
                catalog_key: "METRIC_US_10Y_YIELD".into(),
                obs_date: NaiveDate::from_ymd_opt(2025, 1, 3).unwrap(),
                value: 4.25,
            },
        ]);

        let written = store.commit_clean_batch(&wm_key, &rows, ts).await.unwrap();
        assert_eq!(written, 2);
        assert_eq!(store.count_silver(SourceFamily::MacroSeries).await.unwrap(), 2);

        let wm = store.get_watermark(&wm_key).await.unwrap();
        assert_eq!(wm.last_cleaned_at, Some(ts));
    }

    #[tokio::test]
    async fn silver_upsert_replaces_on_conflict() {
        let (_dir, store) = test_store();
        let wm_key = SourceFamily::MacroSeries.cleaning_watermark_key();
        let date = NaiveDate::from_ymd_opt(2025, 1, 2).unwrap();
        let ts = Utc::now();

        let first = SilverRows::Macro(vec![MacroRow {
            catalog_key: "K".into(),
            obs_date: date,
            value: 1.0,
        }]);
        let second = SilverRows::Macro(vec![MacroRow {
            catalog_key: "K".into(),
            obs_date: date,
            value: 2.0,
        }]);

        store.commit_clean_batch(&wm_key, &first, ts).await.unwrap();
        store.commit_clean_batch(&wm_key, &second, ts).await.unwrap();

        assert_eq!(store.count_silver(SourceFamily::MacroSeries).await.unwrap(), 1);
        assert_eq!(store.get_macro_value("K", date).await.unwrap(), Some(2.0));
    }

    #[tokio::test]
    async fn news_upsert_preserves_enrichment_columns() {
        let (_dir, store) = test_store();
        let wm_key = SourceFamily::NewsFeed.cleaning_watermark_key();
        let ts = Utc::now();

        let row = NewsRow {
            fingerprint: "f1".into(),
            catalog_key: "NEWS_US_TECH_SECTOR".into(),
            title: "Title".into(),
            url: "https://example.com/a".into(),
            published_at: Some(ts),
            author: None,
            source_name: Some("Example".into()),
            body: Some("body text".into()),
        };
        store
            .commit_clean_batch(&wm_key, &SilverRows::News(vec![row.clone()]), ts)
            .await
            .unwrap();

        // downstream enricher writes sentiment out-of-band
        {
            let conn = store.conn.lock().await;
            conn.execute(
                "UPDATE news_intel_pool SET sentiment = 0.7 WHERE fingerprint = 'f1'",
                [],
            )
            .unwrap();
        }

        // metadata correction re-upserts the same fingerprint
        let corrected = NewsRow {
            title: "Corrected title".into(),
            ..row
        };
        store
            .commit_clean_batch(&wm_key, &SilverRows::News(vec![corrected]), ts)
            .await
            .unwrap();

        let conn = store.conn.lock().await;
        let (title, sentiment): (String, Option<f64>) = conn
            .query_row(
                "SELECT title, sentiment FROM news_intel_pool WHERE fingerprint = 'f1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(title, "Corrected title");
        assert_eq!(sentiment, Some(0.7));
    }

    #[tokio::test]
    async fn watermark_reset_clears_cleaned_only() {
        let (_dir, store) = test_store();
        let key = "SYSTEM_CLEANING_NEWS_FEED";
        let ts = Utc::now();

        store
            .commit_clean_batch(key, &SilverRows::News(vec![]), ts)
            .await
            .unwrap();
        assert!(store.get_watermark(key).await.unwrap().last_cleaned_at.is_some());

        store.reset_clean_watermark(key).await.unwrap();
        let wm = store.get_watermark(key).await.unwrap();
        assert!(wm.last_cleaned_at.is_none());
    }

    #[tokio::test]
    async fn catalog_seed_and_activation() {
        let (_dir, store) = test_store();
        let entry = CatalogEntry {
            catalog_key: "NVDA".into(),
            source_family: SourceFamily::PriceBars,
            update_frequency: UpdateFrequency::Daily,
            source_config: json!({"symbol": "NVDA"}),
            is_active: false,
            role_tag: Some("judgment".into()),
            scope_tag: Some("micro".into()),
            created_at: Utc::now(),
        };

        assert_eq!(store.seed_catalog(&[entry.clone()]).await.unwrap(), 1);
        // re-seed is a no-op
        assert_eq!(store.seed_catalog(&[entry]).await.unwrap(), 0);

        let inactive = store
            .load_catalog(Some(UpdateFrequency::Daily), None, true)
            .await
            .unwrap();
        assert!(inactive.is_empty());

        store.activate_catalog("NVDA").await.unwrap();
        let active = store
            .load_catalog(Some(UpdateFrequency::Daily), None, true)
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert!(active[0].is_active);
    }
}
