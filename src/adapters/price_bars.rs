//! Security price-bar adapter (Tiingo-style end-of-day API).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::adapters::AdapterConfig;
use crate::error::PipelineError;
use crate::fetch::FetchClient;
use crate::models::RawEnvelope;

pub const DEFAULT_BASE_URL: &str = "https://api.tiingo.com/tiingo/daily";

#[derive(Debug, Deserialize)]
struct VendorBar {
    date: String,
    open: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    close: Option<f64>,
    volume: Option<f64>,
}

/// Bar as it lands in the envelope: date normalized to UTC midnight
/// (`YYYY-MM-DD`), columns kept optional so the cleaner decides drops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub date: String,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
}

pub async fn fetch(
    http: &FetchClient,
    config: &AdapterConfig,
    source_config: &serde_json::Value,
    limit: Option<u32>,
    cancel: &CancellationToken,
) -> Result<RawEnvelope, PipelineError> {
    let symbol = source_config
        .get("symbol")
        .and_then(|v| v.as_str())
        .ok_or_else(|| PipelineError::PermanentUpstream("source_config missing symbol".into()))?;

    let mut query: Vec<(String, String)> = vec![
        ("token".into(), config.price_api_key.clone()),
        ("format".into(), "json".into()),
    ];
    if let Some(l) = limit {
        query.push(("limit".into(), l.to_string()));
    }

    let query_echo = match limit {
        Some(l) => format!("symbol={symbol}&limit={l}"),
        None => format!("symbol={symbol}"),
    };

    let url = format!("{}/{}/prices", config.price_base_url, symbol);
    let body = http.get_json(&url, &query, &[], cancel).await?;

    let vendor_bars: Vec<VendorBar> = serde_json::from_value(body)
        .map_err(|e| PipelineError::PermanentUpstream(format!("unexpected response shape: {e}")))?;

    if vendor_bars.is_empty() {
        return Err(PipelineError::EmptyResultSet);
    }

    let bars: Vec<Bar> = vendor_bars.into_iter().map(normalize_bar).collect();

    Ok(RawEnvelope {
        fetched_at: Utc::now(),
        query_echo,
        items: json!({ "bars": bars }),
    })
}

/// Vendor timestamps arrive as `2025-01-02T00:00:00.000Z`; keep the UTC
/// calendar date only.
fn normalize_bar(bar: VendorBar) -> Bar {
    let date = bar.date.chars().take(10).collect::<String>();
    Bar {
        date,
        open: bar.open,
        high: bar.high,
        low: bar.low,
        close: bar.close,
        volume: bar.volume,
    }
}
