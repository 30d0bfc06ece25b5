//! Financial news adapter (NewsAPI-style everything endpoint).
//!
//! A rate-limit response is not an error here: it becomes an envelope with
//! an error marker that is persisted as a valid Bronze row, so the quota
//! pressure is visible downstream and the cleaner can skip past it.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::adapters::AdapterConfig;
use crate::error::{FetchError, PipelineError};
use crate::fetch::FetchClient;
use crate::models::RawEnvelope;

pub const DEFAULT_BASE_URL: &str = "https://newsapi.org/v2";
const DEFAULT_PAGE_SIZE: u32 = 50;

#[derive(Debug, Deserialize)]
struct EverythingResponse {
    #[serde(default)]
    articles: Vec<VendorArticle>,
}

#[derive(Debug, Deserialize)]
struct VendorArticle {
    #[serde(default)]
    source: VendorSource,
    author: Option<String>,
    title: Option<String>,
    description: Option<String>,
    url: Option<String>,
    #[serde(rename = "publishedAt")]
    published_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct VendorSource {
    name: Option<String>,
}

/// Article as it lands in the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub title: Option<String>,
    pub url: Option<String>,
    pub published_at: Option<String>,
    pub author: Option<String>,
    pub source_name: Option<String>,
    pub description: Option<String>,
}

pub async fn fetch(
    http: &FetchClient,
    config: &AdapterConfig,
    source_config: &serde_json::Value,
    limit: Option<u32>,
    cancel: &CancellationToken,
) -> Result<RawEnvelope, PipelineError> {
    let search = source_config
        .get("query")
        .and_then(|v| v.as_str())
        .ok_or_else(|| PipelineError::PermanentUpstream("source_config missing query".into()))?;
    let domains = source_config.get("domains").and_then(|v| v.as_str());

    let page_size = limit.unwrap_or(DEFAULT_PAGE_SIZE);
    let mut query: Vec<(String, String)> = vec![
        ("q".into(), search.to_string()),
        ("pageSize".into(), page_size.to_string()),
        ("sortBy".into(), "publishedAt".into()),
    ];
    if let Some(d) = domains {
        query.push(("domains".into(), d.to_string()));
    }

    let query_echo = match domains {
        Some(d) => format!("q={search}&domains={d}&page_size={page_size}"),
        None => format!("q={search}&page_size={page_size}"),
    };

    let headers = vec![("X-Api-Key".to_string(), config.news_api_key.clone())];
    let url = format!("{}/everything", config.news_base_url);

    let body = match http.get_json(&url, &query, &headers, cancel).await {
        Ok(body) => body,
        // quota exhausted: record it rather than drop it
        Err(FetchError::RateLimited) => {
            return Ok(RawEnvelope {
                fetched_at: Utc::now(),
                query_echo,
                items: json!({ "error": "rate_limited", "articles": [] }),
            });
        }
        Err(e) => return Err(e.into()),
    };

    let parsed: EverythingResponse = serde_json::from_value(body)
        .map_err(|e| PipelineError::PermanentUpstream(format!("unexpected response shape: {e}")))?;

    if parsed.articles.is_empty() {
        return Err(PipelineError::EmptyResultSet);
    }

    let articles: Vec<Article> = parsed.articles.into_iter().map(flatten_article).collect();

    Ok(RawEnvelope {
        fetched_at: Utc::now(),
        query_echo,
        items: json!({ "articles": articles }),
    })
}

fn flatten_article(article: VendorArticle) -> Article {
    Article {
        title: article.title,
        url: article.url,
        published_at: article.published_at,
        author: article.author,
        source_name: article.source.name,
        description: article.description,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_article_flattens_nested_source() {
        let body = json!({
            "status": "ok",
            "totalResults": 1,
            "articles": [{
                "source": {"id": "the-verge", "name": "The Verge"},
                "author": "A. Writer",
                "title": "Chips are up",
                "description": "Semiconductor rally continues.",
                "url": "https://example.com/chips",
                "publishedAt": "2025-01-02T08:30:00Z"
            }]
        });
        let parsed: EverythingResponse = serde_json::from_value(body).unwrap();
        let article = flatten_article(parsed.articles.into_iter().next().unwrap());
        assert_eq!(article.source_name.as_deref(), Some("The Verge"));
        assert_eq!(article.published_at.as_deref(), Some("2025-01-02T08:30:00Z"));
    }

    #[test]
    fn article_with_missing_fields_still_parses() {
        let body = json!({
            "articles": [{"title": "Bare", "url": "https://example.com/bare"}]
        });
        let parsed: EverythingResponse = serde_json::from_value(body).unwrap();
        let article = flatten_article(parsed.articles.into_iter().next().unwrap());
        assert!(article.author.is_none());
        assert!(article.source_name.is_none());
    }
}
