//! Price-bar cleaner: raw bars to `timeseries_micro` rows.

use chrono::NaiveDate;
use tracing::debug;

use crate::adapters::price_bars::Bar;
use crate::error::PipelineError;
use crate::models::{MicroRow, RawRecord};

/// Emit one row per bar whose OHLC columns are present, finite, and
/// ordered (`low <= min(open, close) <= max(open, close) <= high`).
/// Anything else is dropped.
pub fn clean(record: &RawRecord) -> Result<(Vec<MicroRow>, usize), PipelineError> {
    let bars: Vec<Bar> = serde_json::from_value(
        record
            .payload
            .items
            .get("bars")
            .cloned()
            .unwrap_or(serde_json::Value::Array(vec![])),
    )
    .map_err(|e| PipelineError::PermanentUpstream(format!("malformed bars: {e}")))?;

    let mut rows = Vec::with_capacity(bars.len());
    let mut skipped = 0usize;

    for bar in bars {
        match to_row(&record.catalog_key, &bar) {
            Some(row) => rows.push(row),
            None => {
                debug!(catalog_key = %record.catalog_key, date = %bar.date,
                       "dropping bar with missing or inconsistent columns");
                skipped += 1;
            }
        }
    }

    Ok((rows, skipped))
}

fn to_row(catalog_key: &str, bar: &Bar) -> Option<MicroRow> {
    let obs_date = NaiveDate::parse_from_str(&bar.date, "%Y-%m-%d").ok()?;
    let row = MicroRow {
        catalog_key: catalog_key.to_string(),
        obs_date,
        open: bar.open?,
        high: bar.high?,
        low: bar.low?,
        close: bar.close?,
        volume: bar.volume,
    };
    row.is_sane().then_some(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RawEnvelope, SourceFamily};
    use chrono::Utc;
    use serde_json::json;

    fn record(items: serde_json::Value) -> RawRecord {
        RawRecord {
            request_hash: "h".into(),
            catalog_key: "NVDA".into(),
            source_family: SourceFamily::PriceBars,
            payload: RawEnvelope {
                fetched_at: Utc::now(),
                query_echo: "symbol=NVDA".into(),
                items,
            },
            inserted_at: Utc::now(),
        }
    }

    #[test]
    fn keeps_well_formed_bars() {
        let (rows, skipped) = clean(&record(json!({
            "bars": [
                {"date": "2025-01-02", "open": 10.0, "high": 12.0, "low": 9.5,
                 "close": 11.0, "volume": 1000000.0},
                {"date": "2025-01-03", "open": 11.0, "high": 11.5, "low": 10.0,
                 "close": 10.5, "volume": null},
            ]
        })))
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(skipped, 0);
        assert_eq!(rows[1].volume, None);
    }

    #[test]
    fn drops_bars_with_missing_columns() {
        let (rows, skipped) = clean(&record(json!({
            "bars": [
                {"date": "2025-01-02", "open": 10.0, "high": null, "low": 9.5,
                 "close": 11.0, "volume": 100.0},
            ]
        })))
        .unwrap();
        assert!(rows.is_empty());
        assert_eq!(skipped, 1);
    }

    #[test]
    fn drops_bars_violating_ohlc_ordering() {
        let (rows, skipped) = clean(&record(json!({
            "bars": [
                // low above open
                {"date": "2025-01-02", "open": 10.0, "high": 12.0, "low": 10.5,
                 "close": 11.0, "volume": 100.0},
                // high below close
                {"date": "2025-01-03", "open": 10.0, "high": 10.5, "low": 9.0,
                 "close": 11.0, "volume": 100.0},
                // negative volume
                {"date": "2025-01-04", "open": 10.0, "high": 12.0, "low": 9.0,
                 "close": 11.0, "volume": -1.0},
            ]
        })))
        .unwrap();
        assert!(rows.is_empty());
        assert_eq!(skipped, 3);
    }

    #[test]
    fn drops_bars_with_bad_dates() {
        let (rows, skipped) = clean(&record(json!({
            "bars": [
                {"date": "02/01/2025", "open": 10.0, "high": 12.0, "low": 9.0,
                 "close": 11.0, "volume": 100.0},
            ]
        })))
        .unwrap();
        assert!(rows.is_empty());
        assert_eq!(skipped, 1);
    }
}
