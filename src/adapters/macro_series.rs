//! Macro-economic series adapter (FRED-style observations API).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::adapters::AdapterConfig;
use crate::error::PipelineError;
use crate::fetch::FetchClient;
use crate::models::RawEnvelope;

pub const DEFAULT_BASE_URL: &str = "https://api.stlouisfed.org/fred";

#[derive(Debug, Deserialize)]
struct ObservationsResponse {
    #[serde(default)]
    observations: Vec<Observation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub date: String,
    /// Raw value string. Sentinel non-numerics (e.g. ".") pass through;
    /// the cleaner filters them.
    pub value: String,
}

/// Fetch observations for the series named in the catalog config.
pub async fn fetch(
    http: &FetchClient,
    config: &AdapterConfig,
    source_config: &serde_json::Value,
    limit: Option<u32>,
    cancel: &CancellationToken,
) -> Result<RawEnvelope, PipelineError> {
    let series_id = source_config
        .get("series_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            PipelineError::PermanentUpstream("source_config missing series_id".into())
        })?;

    let mut query: Vec<(String, String)> = vec![
        ("series_id".into(), series_id.to_string()),
        ("api_key".into(), config.macro_api_key.clone()),
        ("file_type".into(), "json".into()),
        ("sort_order".into(), "desc".into()),
    ];
    if let Some(l) = limit {
        query.push(("limit".into(), l.to_string()));
    }

    // credentials stay out of the canonical echo
    let query_echo = match limit {
        Some(l) => format!("series_id={series_id}&limit={l}"),
        None => format!("series_id={series_id}"),
    };

    let url = format!("{}/series/observations", config.macro_base_url);
    let body = http.get_json(&url, &query, &[], cancel).await?;

    let parsed: ObservationsResponse = serde_json::from_value(body)
        .map_err(|e| PipelineError::PermanentUpstream(format!("unexpected response shape: {e}")))?;

    if parsed.observations.is_empty() {
        return Err(PipelineError::EmptyResultSet);
    }

    Ok(RawEnvelope {
        fetched_at: Utc::now(),
        query_echo,
        items: json!({ "observations": parsed.observations }),
    })
}
