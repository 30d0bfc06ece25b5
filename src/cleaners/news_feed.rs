//! News cleaner: articles to `news_intel_pool` rows, with concurrent
//! full-text extraction.
//!
//! Extraction fans out across the articles of one envelope, bounded by a
//! semaphore, and fans back in before the cleaner returns so the caller can
//! commit the whole batch atomically. A failed or empty extraction falls
//! back to the article description; the row is emitted either way.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use scraper::{Html, Selector};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adapters::news_feed::Article;
use crate::error::PipelineError;
use crate::fetch::FetchClient;
use crate::models::{NewsRow, RawRecord};

const DEFAULT_CONCURRENCY: usize = 4;
const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);
const MIN_PARAGRAPH_CHARS: usize = 30;

/// Fetches article HTML and derives readable body text.
#[derive(Clone)]
pub struct BodyExtractor {
    http: FetchClient,
    permits: Arc<Semaphore>,
    deadline: Duration,
}

impl BodyExtractor {
    pub fn new(http: FetchClient) -> Self {
        Self::with_limits(http, DEFAULT_CONCURRENCY, DEFAULT_DEADLINE)
    }

    pub fn with_limits(http: FetchClient, concurrency: usize, deadline: Duration) -> Self {
        Self {
            http,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            deadline,
        }
    }

    /// Fetch the page and extract body text. Returns None on fetch failure,
    /// deadline overrun, or when the page yields no usable paragraphs.
    pub async fn extract(&self, url: &str, cancel: &CancellationToken) -> Option<String> {
        let _permit = self.permits.acquire().await.ok()?;

        let fetched =
            tokio::time::timeout(self.deadline, self.http.get_text(url, cancel)).await;
        match fetched {
            Ok(Ok(html)) => extract_body(&html),
            Ok(Err(e)) => {
                debug!(url, error = %e, "article fetch failed");
                None
            }
            Err(_) => {
                debug!(url, "article fetch exceeded deadline");
                None
            }
        }
    }
}

/// Clean one raw news envelope. Envelopes carrying an upstream error marker
/// (e.g. rate limiting) yield zero rows and one skip.
pub async fn clean(
    record: &RawRecord,
    extractor: &BodyExtractor,
    cancel: &CancellationToken,
) -> Result<(Vec<NewsRow>, usize), PipelineError> {
    if record.payload.has_error_marker() {
        debug!(catalog_key = %record.catalog_key, request_hash = %record.request_hash,
               "skipping error-marker envelope");
        return Ok((vec![], 1));
    }

    let articles: Vec<Article> = serde_json::from_value(
        record
            .payload
            .items
            .get("articles")
            .cloned()
            .unwrap_or(serde_json::Value::Array(vec![])),
    )
    .map_err(|e| PipelineError::PermanentUpstream(format!("malformed articles: {e}")))?;

    let mut skipped = 0usize;
    let mut pending = Vec::with_capacity(articles.len());

    for article in articles {
        let Some(url) = article.url.as_deref().filter(|u| !u.trim().is_empty()) else {
            skipped += 1;
            continue;
        };
        let Some(title) = article.title.as_deref().filter(|t| !t.trim().is_empty()) else {
            warn!(catalog_key = %record.catalog_key, url, "dropping article without title");
            skipped += 1;
            continue;
        };
        let Some(canonical) = canonicalize_url(url) else {
            warn!(catalog_key = %record.catalog_key, url, "dropping article with unparseable url");
            skipped += 1;
            continue;
        };

        let fingerprint = format!("{:x}", md5::compute(canonical.as_bytes()));
        let catalog_key = record.catalog_key.clone();
        let title = title.to_string();
        let url = url.to_string();
        let published_at = article.published_at.as_deref().and_then(parse_published);
        let author = article.author.clone();
        let source_name = article.source_name.clone();
        let description = article
            .description
            .clone()
            .filter(|d| !d.trim().is_empty());

        pending.push(async move {
            let body = match extractor.extract(&url, cancel).await {
                Some(text) => Some(text),
                None => description,
            };
            NewsRow {
                fingerprint,
                catalog_key,
                title,
                url,
                published_at,
                author,
                source_name,
                body,
            }
        });
    }

    // fan-in: every extraction settles before the batch is handed back
    let rows = join_all(pending).await;
    Ok((rows, skipped))
}

fn parse_published(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Identity of a news item: md5 over the canonicalized URL. Lowercased
/// scheme and host, no fragment, no tracking parameters, no trailing slash.
pub fn canonicalize_url(raw: &str) -> Option<String> {
    let mut url = reqwest::Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    Some(url.to_string())
}

fn is_tracking_param(key: &str) -> bool {
    key.starts_with("utm_") || key == "fbclid" || key == "gclid"
}

/// Readability-style extraction: prefer paragraphs scoped under `article`,
/// fall back to all paragraphs, keep the substantial ones.
pub fn extract_body(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let scoped = Selector::parse("article p").ok()?;
    let any_p = Selector::parse("p").ok()?;

    let mut paragraphs = collect_paragraphs(&document, &scoped);
    if paragraphs.is_empty() {
        paragraphs = collect_paragraphs(&document, &any_p);
    }

    if paragraphs.is_empty() {
        None
    } else {
        Some(paragraphs.join("\n\n"))
    }
}

fn collect_paragraphs(document: &Html, selector: &Selector) -> Vec<String> {
    document
        .select(selector)
        .map(|el| {
            el.text()
                .collect::<Vec<_>>()
                .join(" ")
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|text| text.len() >= MIN_PARAGRAPH_CHARS)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchClientConfig;
    use crate::models::{RawEnvelope, SourceFamily};
    use chrono::TimeZone;
    use serde_json::json;

    fn record(items: serde_json::Value) -> RawRecord {
        RawRecord {
            request_hash: "h".into(),
            catalog_key: "NEWS_US_TECH_SECTOR".into(),
            source_family: SourceFamily::NewsFeed,
            payload: RawEnvelope {
                fetched_at: Utc::now(),
                query_echo: "q=tech".into(),
                items,
            },
            inserted_at: Utc::now(),
        }
    }

    fn offline_extractor() -> BodyExtractor {
        // points at nothing; extraction fails fast and the description
        // fallback kicks in
        let http = FetchClient::new(FetchClientConfig {
            max_retries: 1,
            base_backoff: Duration::from_millis(1),
            min_host_interval: Duration::from_millis(1),
            ..FetchClientConfig::default()
        });
        BodyExtractor::with_limits(http, 2, Duration::from_secs(2))
    }

    #[test]
    fn canonical_url_strips_tracking_and_fragment() {
        let canonical = canonicalize_url(
            "HTTPS://Example.COM/story/?utm_source=x&utm_medium=y&id=7#comments",
        )
        .unwrap();
        assert_eq!(canonical, "https://example.com/story?id=7");
    }

    #[test]
    fn canonical_url_equates_trailing_slash_variants() {
        let a = canonicalize_url("https://example.com/story/").unwrap();
        let b = canonicalize_url("https://example.com/story").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn canonical_url_rejects_non_http() {
        assert!(canonicalize_url("ftp://example.com/x").is_none());
        assert!(canonicalize_url("not a url").is_none());
    }

    #[test]
    fn extract_body_prefers_article_paragraphs() {
        let html = r#"
            <html><body>
            <nav><p>Home News Sport Weather and a lot of other navigation</p></nav>
            <article>
              <p>The semiconductor sector extended its rally on Thursday as
                 investors digested stronger than expected earnings.</p>
              <p>Analysts pointed to sustained data-center demand.</p>
            </article>
            </body></html>
        "#;
        let body = extract_body(html).unwrap();
        assert!(body.contains("semiconductor sector"));
        assert!(body.contains("data-center demand"));
        assert!(!body.contains("navigation"));
    }

    #[test]
    fn extract_body_empty_page_yields_none() {
        assert!(extract_body("<html><body><div>ad</div></body></html>").is_none());
    }

    #[tokio::test]
    async fn rate_limited_envelope_yields_zero_rows_one_skip() {
        let record = record(json!({"error": "rate_limited", "articles": []}));
        let extractor = offline_extractor();
        let cancel = CancellationToken::new();

        let (rows, skipped) = clean(&record, &extractor, &cancel).await.unwrap();
        assert!(rows.is_empty());
        assert_eq!(skipped, 1);
    }

    #[tokio::test]
    async fn unreachable_article_falls_back_to_description() {
        let record = record(json!({"articles": [{
            "title": "Chips are up",
            "url": "http://127.0.0.1:9/story",
            "published_at": "2025-01-02T08:30:00Z",
            "author": "A. Writer",
            "source_name": "Example Wire",
            "description": "Semiconductor rally continues."
        }]}));
        let extractor = offline_extractor();
        let cancel = CancellationToken::new();

        let (rows, skipped) = clean(&record, &extractor, &cancel).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(skipped, 0);
        assert_eq!(rows[0].body.as_deref(), Some("Semiconductor rally continues."));
        assert_eq!(
            rows[0].published_at,
            Some(Utc.with_ymd_and_hms(2025, 1, 2, 8, 30, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn articles_without_url_or_title_are_skipped() {
        let record = record(json!({"articles": [
            {"title": "No url here"},
            {"url": "https://example.com/no-title"},
            {"title": "Good", "url": "http://127.0.0.1:9/good",
             "description": "fallback text"},
        ]}));
        let extractor = offline_extractor();
        let cancel = CancellationToken::new();

        let (rows, skipped) = clean(&record, &extractor, &cancel).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(skipped, 2);
        assert_eq!(rows[0].title, "Good");
    }

    #[tokio::test]
    async fn same_canonical_url_yields_same_fingerprint() {
        let record = record(json!({"articles": [
            {"title": "A", "url": "https://example.com/story?utm_source=feed",
             "description": "d"},
            {"title": "B", "url": "https://Example.com/story/",
             "description": "d"},
        ]}));
        let extractor = offline_extractor();
        let cancel = CancellationToken::new();

        let (rows, _) = clean(&record, &extractor, &cancel).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].fingerprint, rows[1].fingerprint);
    }
}
