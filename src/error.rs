//! Error taxonomy for the preservation pipeline.
//!
//! Resource-level errors ([`PreserveError::InvalidReference`],
//! [`PreserveError::FetchFailed`], [`PreserveError::StoreWriteFailed`]) are
//! recorded and skipped by the pipeline. [`PreserveError::ScrapeFailed`]
//! aborts the work for one article but never the batch.

use crate::models::ArticleId;
use std::fmt;
use thiserror::Error;

/// Why a fetch did not produce a body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchCause {
    /// Connection refused/reset, DNS failure, TLS error.
    Network(String),
    /// The request exceeded its timeout.
    Timeout,
    /// The origin answered with a non-2xx status.
    Status(u16),
    /// The redirect chain exceeded the configured maximum.
    TooManyRedirects,
    /// The body is larger than the configured limit.
    TooLarge { limit: usize },
    /// The body stream broke off before completion.
    Body(String),
}

impl FetchCause {
    /// Whether another attempt has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchCause::Network(_) | FetchCause::Timeout | FetchCause::Body(_) => true,
            FetchCause::Status(code) => *code >= 500,
            FetchCause::TooManyRedirects | FetchCause::TooLarge { .. } => false,
        }
    }
}

impl fmt::Display for FetchCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchCause::Network(msg) => write!(f, "network error: {msg}"),
            FetchCause::Timeout => write!(f, "timed out"),
            FetchCause::Status(code) => write!(f, "HTTP status {code}"),
            FetchCause::TooManyRedirects => write!(f, "too many redirects"),
            FetchCause::TooLarge { limit } => write!(f, "body exceeds {limit} bytes"),
            FetchCause::Body(msg) => write!(f, "body read failed: {msg}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PreserveError {
    #[error("invalid resource reference `{reference}`: {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("fetch failed for {url}: {cause}")]
    FetchFailed { url: String, cause: FetchCause },

    #[error("storage write failed for {path}: {source}")]
    StoreWriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("scrape failed for {url}: {cause}")]
    ScrapeFailed { url: String, cause: String },

    /// The substitution pattern could not be built from the URL map.
    #[error("content rewrite failed: {0}")]
    RewriteError(String),

    #[error("unknown article {0}")]
    UnknownArticle(ArticleId),

    #[error("unknown feed `{0}`")]
    UnknownFeed(String),

    #[error("`{0}` is not a supported feed URL")]
    InvalidFeedUrl(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PreserveError {
    pub fn invalid_reference(reference: &str, reason: impl Into<String>) -> Self {
        PreserveError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }

    pub fn fetch_failed(url: &str, cause: FetchCause) -> Self {
        PreserveError::FetchFailed {
            url: url.to_string(),
            cause,
        }
    }

    pub fn scrape_failed(url: &str, cause: impl fmt::Display) -> Self {
        PreserveError::ScrapeFailed {
            url: url.to_string(),
            cause: cause.to_string(),
        }
    }

    /// True for fetch failures worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, PreserveError::FetchFailed { cause, .. } if cause.is_transient())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_causes() {
        assert!(FetchCause::Timeout.is_transient());
        assert!(FetchCause::Network("reset".into()).is_transient());
        assert!(FetchCause::Status(503).is_transient());
        assert!(!FetchCause::Status(404).is_transient());
        assert!(!FetchCause::TooLarge { limit: 10 }.is_transient());
    }

    #[test]
    fn test_error_display() {
        let e = PreserveError::fetch_failed("https://x.com/a.png", FetchCause::Status(410));
        assert_eq!(e.to_string(), "fetch failed for https://x.com/a.png: HTTP status 410");
        assert!(!e.is_transient());
    }
}
