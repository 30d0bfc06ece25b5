//! Error taxonomy for the ingestion-and-cleaning pipeline.
//!
//! Errors are localized to the smallest meaningful unit (record, catalog
//! entry, batch) and never abort the surrounding batch; only fatal setup
//! errors (store unavailable, missing credentials) propagate out of `main`.

use thiserror::Error;

/// Errors surfaced by the shared HTTP transport.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network error, timeout, or 5xx. Retried by the client; surfaced only
    /// once retries are exhausted.
    #[error("transient upstream error: {0}")]
    Transient(String),

    /// 4xx other than 429. Raised immediately, never retried.
    #[error("permanent upstream error ({status}): {body}")]
    Permanent { status: u16, body: String },

    /// 429 still failing after retries.
    #[error("upstream rate limited")]
    RateLimited,

    /// The call's cancellation signal fired.
    #[error("request cancelled")]
    Cancelled,
}

/// Errors raised inside the pipeline proper.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("transient upstream failure: {0}")]
    TransientUpstream(String),

    #[error("permanent upstream failure: {0}")]
    PermanentUpstream(String),

    /// Upstream success with zero items. Not a storage failure; no raw row
    /// is written for macro/price streams.
    #[error("upstream returned an empty result set")]
    EmptyResultSet,

    /// News-specific: the upstream throttled us. Persisted as an
    /// error-marker envelope rather than dropped.
    #[error("upstream rate limited")]
    RateLimited,

    /// Any SQL error on the write path. The enclosing transaction is rolled
    /// back and the batch unit abandoned.
    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Full-text extraction failed; the news row is still emitted with the
    /// description fallback.
    #[error("body extraction failed: {0}")]
    Extraction(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Stable snake_case token used in structured log fields.
    pub fn error_kind(&self) -> &'static str {
        match self {
            PipelineError::TransientUpstream(_) => "transient_upstream",
            PipelineError::PermanentUpstream(_) => "permanent_upstream",
            PipelineError::EmptyResultSet => "empty_result_set",
            PipelineError::RateLimited => "rate_limited",
            PipelineError::Storage(_) => "storage_failure",
            PipelineError::Extraction(_) => "extraction_failure",
            PipelineError::Cancelled => "cancelled",
        }
    }
}

impl From<FetchError> for PipelineError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Transient(msg) => PipelineError::TransientUpstream(msg),
            FetchError::Permanent { status, body } => {
                PipelineError::PermanentUpstream(format!("{}: {}", status, body))
            }
            FetchError::RateLimited => PipelineError::RateLimited,
            FetchError::Cancelled => PipelineError::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_tokens_are_stable() {
        assert_eq!(
            PipelineError::TransientUpstream("x".into()).error_kind(),
            "transient_upstream"
        );
        assert_eq!(PipelineError::EmptyResultSet.error_kind(), "empty_result_set");
        assert_eq!(PipelineError::RateLimited.error_kind(), "rate_limited");
        assert_eq!(PipelineError::Cancelled.error_kind(), "cancelled");
    }

    #[test]
    fn fetch_errors_map_onto_pipeline_kinds() {
        let err: PipelineError = FetchError::Permanent {
            status: 404,
            body: "not found".into(),
        }
        .into();
        assert_eq!(err.error_kind(), "permanent_upstream");

        let err: PipelineError = FetchError::RateLimited.into();
        assert_eq!(err.error_kind(), "rate_limited");
    }
}
