//! Batch preservation driver.
//!
//! A run claims the eligible articles of a batch (one `PRESERVING`
//! transition), preserves them with bounded concurrency, then stamps the
//! whole claimed set as crawled and stored in a second transition. Article
//! failures are logged and reported but never abort the batch, and every
//! claimed article takes part in the final stamping, including those whose
//! page could not be scraped.
//!
//! Both transitions go through a [`BatchLedger`]. With a [`CatalogFile`]
//! ledger the claim is committed to disk before the first page is fetched.
//!
//! [`CatalogFile`]: crate::catalog::CatalogFile

use crate::catalog::{BatchLedger, EligibilityPolicy, TagPolicy};
use crate::error::PreserveError;
use crate::fetcher::Fetch;
use crate::models::ArticleId;
use crate::pipeline::{ArticleOutcome, Preserver};
use crate::storage::ObjectStore;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::time::Instant;
use tracing::{error, info, instrument};

/// An article whose page could not be preserved at all.
#[derive(Debug, Clone, Serialize)]
pub struct ArticleFailure {
    pub article: ArticleId,
    pub error: String,
}

/// What one run did.
#[derive(Debug, Default, Serialize)]
pub struct BatchReport {
    pub requested: usize,
    /// Articles moved to `PRESERVING` by this run.
    pub claimed: Vec<ArticleId>,
    pub preserved: Vec<ArticleOutcome>,
    pub failed: Vec<ArticleFailure>,
}

impl BatchReport {
    pub fn stored_resources(&self) -> usize {
        self.preserved.iter().map(|o| o.resources.len() + 1).sum()
    }

    pub fn failed_resources(&self) -> usize {
        self.preserved.iter().map(|o| o.failures.len()).sum()
    }
}

/// Drives preservation batches against a catalog.
pub struct Orchestrator<'a, L, F, S, P = TagPolicy> {
    ledger: &'a L,
    preserver: &'a Preserver<F, S>,
    policy: P,
    article_concurrency: usize,
}

impl<'a, L: BatchLedger, F: Fetch, S: ObjectStore> Orchestrator<'a, L, F, S> {
    /// An orchestrator selecting articles with [`TagPolicy`].
    ///
    /// # Arguments
    ///
    /// * `ledger` - In-memory [`Catalog`](crate::catalog::Catalog) or a shared
    ///   [`CatalogFile`](crate::catalog::CatalogFile)
    /// * `preserver` - Per-article pipeline
    /// * `article_concurrency` - Articles in flight at once; 0 is treated as 1
    pub fn new(ledger: &'a L, preserver: &'a Preserver<F, S>, article_concurrency: usize) -> Self {
        Self::with_policy(ledger, preserver, TagPolicy, article_concurrency)
    }
}

impl<'a, L: BatchLedger, F: Fetch, S: ObjectStore, P: EligibilityPolicy> Orchestrator<'a, L, F, S, P> {
    pub fn with_policy(
        ledger: &'a L,
        preserver: &'a Preserver<F, S>,
        policy: P,
        article_concurrency: usize,
    ) -> Self {
        Self {
            ledger,
            preserver,
            policy,
            article_concurrency: article_concurrency.max(1),
        }
    }

    /// Task entry point: preserve the eligible articles among `ids` and hand
    /// the same ids back.
    pub async fn crawl_resources(&self, ids: Vec<ArticleId>) -> Vec<ArticleId> {
        self.run(&ids).await;
        ids
    }

    /// Run one batch.
    #[instrument(level = "info", skip_all, fields(requested = ids.len()))]
    pub async fn run(&self, ids: &[ArticleId]) -> BatchReport {
        let t0 = Instant::now();
        let mut report = BatchReport {
            requested: ids.len(),
            ..BatchReport::default()
        };
        let articles = match self.ledger.claim(ids, &self.policy).await {
            Ok(articles) => articles,
            Err(e) => {
                error!(error = %e, "Could not claim batch");
                return report;
            }
        };
        let claimed: Vec<ArticleId> = articles.iter().map(|a| a.id).collect();
        info!(claimed = claimed.len(), ids = ?claimed, "Batch marked PRESERVING");
        report.claimed = claimed.clone();
        if claimed.is_empty() {
            return report;
        }

        let results: Vec<(ArticleId, Result<ArticleOutcome, PreserveError>)> = stream::iter(articles.iter())
            .map(|article| async move { (article.id, self.preserver.preserve_article(article).await) })
            .buffer_unordered(self.article_concurrency)
            .collect()
            .await;

        for (article, result) in results {
            match result {
                Ok(outcome) => report.preserved.push(outcome),
                Err(e) => {
                    error!(article, error = %e, "Article preservation failed");
                    report.failed.push(ArticleFailure {
                        article,
                        error: e.to_string(),
                    });
                }
            }
        }

        match self.ledger.finish(&claimed).await {
            Ok(()) => info!(count = claimed.len(), "Batch marked crawled and stored"),
            Err(e) => error!(error = %e, "Could not stamp batch as crawled"),
        }

        info!(
            preserved = report.preserved.len(),
            failed = report.failed.len(),
            stored_resources = report.stored_resources(),
            failed_resources = report.failed_resources(),
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "Batch finished"
        );
        report
    }
}
