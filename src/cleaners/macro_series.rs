//! Macro-series cleaner: raw observations to `timeseries_macro` rows.

use chrono::NaiveDate;
use tracing::debug;

use crate::adapters::macro_series::Observation;
use crate::error::PipelineError;
use crate::models::{MacroRow, RawRecord};

/// Emit one row per observation with a parseable numeric value and a valid
/// date. Sentinel non-numerics (e.g. ".") and malformed dates are dropped.
pub fn clean(record: &RawRecord) -> Result<(Vec<MacroRow>, usize), PipelineError> {
    let observations: Vec<Observation> = serde_json::from_value(
        record
            .payload
            .items
            .get("observations")
            .cloned()
            .unwrap_or(serde_json::Value::Array(vec![])),
    )
    .map_err(|e| PipelineError::PermanentUpstream(format!("malformed observations: {e}")))?;

    let mut rows = Vec::with_capacity(observations.len());
    let mut skipped = 0usize;

    for obs in observations {
        let date = match NaiveDate::parse_from_str(&obs.date, "%Y-%m-%d") {
            Ok(d) => d,
            Err(_) => {
                debug!(catalog_key = %record.catalog_key, date = %obs.date,
                       "dropping observation with unparseable date");
                skipped += 1;
                continue;
            }
        };
        let value = match obs.value.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => v,
            _ => {
                debug!(catalog_key = %record.catalog_key, date = %obs.date,
                       value = %obs.value, "dropping non-numeric observation");
                skipped += 1;
                continue;
            }
        };
        rows.push(MacroRow {
            catalog_key: record.catalog_key.clone(),
            obs_date: date,
            value,
        });
    }

    Ok((rows, skipped))
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
            catalog_key: "METRIC_US_10Y_YIELD".into(),
            source_family: SourceFamily::MacroSeries,
            payload: RawEnvelope {
                fetched_at: Utc::now(),
                query_echo: "series_id=DGS10".into(),
                items,
            },
            inserted_at: Utc::now(),
        }
    }

    #[test]
    fn parses_numeric_observations() {
        let (rows, skipped) = clean(&record(json!({
            "observations": [
                {"date": "2025-01-02", "value": "4.23"},
                {"date": "2025-01-03", "value": "4.25"},
            ]
        })))
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(skipped, 0);
        assert_eq!(rows[0].value, 4.23);
        assert_eq!(
            rows[1].obs_date,
            NaiveDate::from_ymd_opt(2025, 1, 3).unwrap()
        );
    }

    #[test]
    fn drops_sentinel_and_malformed_entries() {
        let (rows, skipped) = clean(&record(json!({
            "observations": [
                {"date": "2025-01-02", "value": "."},
                {"date": "not-a-date", "value": "1.0"},
                {"date": "2025-01-04", "value": "NaN"},
                {"date": "2025-01-05", "value": "2.5"},
            ]
        })))
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(skipped, 3);
        assert_eq!(rows[0].value, 2.5);
    }

    #[test]
    fn missing_observations_key_yields_no_rows() {
        let (rows, skipped) = clean(&record(json!({}))).unwrap();
        assert!(rows.is_empty());
        assert_eq!(skipped, 0);
    }

    #[test]
    fn non_array_observations_is_an_error() {
        assert!(clean(&record(json!({"observations": "oops"}))).is_err());
    }
}
