//! Per-article preservation: scrape, fetch and store every embedded
//! resource, rewrite the page onto the hosted copies and store it.
//!
//! Work inside one article is ordered: the page can only be rewritten once
//! every resource has been attempted. Resource fetches are independent and
//! run concurrently, bounded by a fetch pool shared by every article the
//! [`Preserver`] handles.

use crate::error::PreserveError;
use crate::fetcher::{Fetch, Fetched};
use crate::models::{
    Article, ArticleId, DiscoveredResource, ResourceFailure, ResourceKind, StoredResource,
};
use crate::resolver::classify_by_content_type;
use crate::rewriter::{hosted_mapping, rewrite_bytes};
use crate::scrapers::scrape_page;
use crate::storage::{ObjectStore, ResourceStore};
use crate::stylesheet::{Harvest, process_stylesheet};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

/// Result of preserving one article.
#[derive(Debug, Clone, Serialize)]
pub struct ArticleOutcome {
    pub article: ArticleId,
    /// The rewritten page.
    pub page: StoredResource,
    /// Every other stored object, stylesheet sub-resources included.
    pub resources: Vec<StoredResource>,
    /// Resources left pointing at their origin.
    pub failures: Vec<ResourceFailure>,
}

/// One top-level resource and, for stylesheets, what it pulled in.
struct PreservedResource {
    stored: StoredResource,
    nested: Vec<StoredResource>,
    nested_failures: Vec<ResourceFailure>,
}

/// Runs the pipeline for single articles.
pub struct Preserver<F, S> {
    fetcher: F,
    store: ResourceStore<S>,
    fetch_pool: Semaphore,
    concurrency: usize,
}

impl<F: Fetch, S: ObjectStore> Preserver<F, S> {
    /// # Arguments
    ///
    /// * `fetcher` - Used for pages, resources and stylesheet sub-resources
    /// * `store` - Destination of every preserved object
    /// * `concurrency` - Resource fetches in flight across all articles; 0 is
    ///   treated as 1
    pub fn new(fetcher: F, store: ResourceStore<S>, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            fetcher,
            store,
            fetch_pool: Semaphore::new(concurrency),
            concurrency,
        }
    }

    pub fn store(&self) -> &ResourceStore<S> {
        &self.store
    }

    async fn fetch_pooled(&self, url: &str) -> Result<Fetched, PreserveError> {
        // The pool is never closed, so a permit is always granted.
        let _permit = self.fetch_pool.acquire().await.ok();
        self.fetcher.fetch(url).await
    }

    /// Preserve one article.
    ///
    /// # Returns
    ///
    /// The stored page, the stored resources and the resources left pointing
    /// at their origin.
    ///
    /// # Errors
    ///
    /// Only a page that cannot be scraped, rewritten or stored fails the
    /// article; resource failures are collected in the outcome.
    #[instrument(level = "info", skip_all, fields(article = article.id, url = %article.url))]
    pub async fn preserve_article(&self, article: &Article) -> Result<ArticleOutcome, PreserveError> {
        let t0 = Instant::now();
        let page = scrape_page(&self.fetcher, &article.url).await?;

        let results: Vec<_> = stream::iter(page.resources.iter())
            .map(|found| async move { (found, self.preserve_resource(article, found).await) })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut hosted = Vec::new();
        let mut resources = Vec::new();
        let mut failures = Vec::new();
        for (found, result) in results {
            match result {
                Ok(preserved) => {
                    resources.push(preserved.stored.clone());
                    resources.extend(preserved.nested);
                    failures.extend(preserved.nested_failures);
                    hosted.push((found, preserved.stored));
                }
                Err(e) => {
                    warn!(url = %found.url, kind = %found.kind, error = %e, "Resource not preserved");
                    failures.push(ResourceFailure::new(&found.url, found.kind, &e));
                }
            }
        }

        let mapping = hosted_mapping(hosted.iter().map(|(found, stored)| (*found, stored)));
        let content = rewrite_bytes(&page.content, &mapping)?;
        let page = self
            .store
            .store(article, &article.url, None, ResourceKind::Page, &content, true)
            .await?;

        info!(
            page = %page.path,
            stored = resources.len(),
            failed = failures.len(),
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "Article preserved"
        );
        Ok(ArticleOutcome {
            article: article.id,
            page,
            resources,
            failures,
        })
    }

    async fn preserve_resource(
        &self,
        article: &Article,
        found: &DiscoveredResource,
    ) -> Result<PreservedResource, PreserveError> {
        let fetched = self.fetch_pooled(&found.url).await?;
        let kind = match (found.kind, fetched.content_type.as_deref()) {
            (ResourceKind::Other, Some(content_type)) => {
                classify_by_content_type(content_type).unwrap_or(ResourceKind::Other)
            }
            (kind, _) => kind,
        };

        match kind {
            ResourceKind::Style => {
                let outcome = process_stylesheet(
                    self,
                    article,
                    &fetched.final_url,
                    &fetched.bytes,
                    self.concurrency,
                )
                .await;
                let stored = self
                    .store
                    .store(article, &found.url, None, kind, &outcome.content, true)
                    .await?;
                Ok(PreservedResource {
                    stored,
                    nested: outcome.stored,
                    nested_failures: outcome.failures,
                })
            }
            _ => {
                let stored = self
                    .store
                    .store(article, &found.url, None, kind, &fetched.bytes, true)
                    .await?;
                Ok(PreservedResource {
                    stored,
                    nested: Vec::new(),
                    nested_failures: Vec::new(),
                })
            }
        }
    }
}

impl<F: Fetch, S: ObjectStore> Harvest for Preserver<F, S> {
    /// Fetch and store as-is; stylesheets found here are not processed further.
    async fn harvest(
        &self,
        article: &Article,
        resource: &DiscoveredResource,
    ) -> Result<StoredResource, PreserveError> {
        let fetched = self.fetch_pooled(&resource.url).await?;
        self.store
            .store(article, &resource.url, None, resource.kind, &fetched.bytes, true)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchSettings;
    use crate::fetcher::HttpFetcher;
    use crate::storage::{FsStore, Hosting, ObjectStore};

    fn preserver(dir: &tempfile::TempDir) -> Preserver<HttpFetcher, FsStore> {
        Preserver::new(
            HttpFetcher::new(&FetchSettings::default()).unwrap(),
            ResourceStore::new(
                FsStore::new(dir.path()),
                Hosting::new("https://archive.example.org", None),
            ),
            4,
        )
    }

    #[tokio::test]
    async fn test_failed_resource_is_left_unresolved() {
        let mut server = mockito::Server::new_async().await;
        let origin = server.url();
        server
            .mock("GET", "/story.html")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body(format!(
                r#"<html><body><img src="{origin}/ok.png"><img src="/gone.png"></body></html>"#
            ))
            .create_async()
            .await;
        server
            .mock("GET", "/ok.png")
            .with_status(200)
            .with_header("content-type", "image/png")
            .with_body("png")
            .create_async()
            .await;
        server.mock("GET", "/gone.png").with_status(404).create_async().await;

        let dir = tempfile::tempdir().unwrap();
        let article = Article::new(1, "feed", &format!("{origin}/story.html"));
        let outcome = preserver(&dir).preserve_article(&article).await.unwrap();

        assert_eq!(outcome.resources.len(), 1);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].url, format!("{origin}/gone.png"));

        let page = std::fs::read_to_string(dir.path().join(&outcome.page.path)).unwrap();
        assert!(!page.contains(&format!("{origin}/ok.png")));
        assert!(page.contains(&outcome.resources[0].hosted_url));
        assert!(page.contains(r#"src="/gone.png""#));
    }

    #[tokio::test]
    async fn test_scrape_failure_stores_nothing() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/story.html").with_status(500).create_async().await;

        let dir = tempfile::tempdir().unwrap();
        let article = Article::new(1, "feed", &format!("{}/story.html", server.url()));
        let err = preserver(&dir).preserve_article(&article).await.unwrap_err();

        assert!(matches!(err, PreserveError::ScrapeFailed { .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    /// Filesystem store that refuses every path containing `fail_on`.
    struct FailingStore {
        inner: FsStore,
        fail_on: &'static str,
    }

    impl ObjectStore for FailingStore {
        async fn create(&self, path: &str, bytes: &[u8]) -> std::io::Result<()> {
            if path.contains(self.fail_on) {
                return Err(std::io::Error::other("disk full"));
            }
            self.inner.create(path, bytes).await
        }
    }

    #[tokio::test]
    async fn test_store_failure_leaves_other_resources_stored() {
        let mut server = mockito::Server::new_async().await;
        let origin = server.url();
        server
            .mock("GET", "/story.html")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body(format!(
                r#"<html><body><img src="{origin}/ok.png"><img src="/broken.png"></body></html>"#
            ))
            .create_async()
            .await;
        server
            .mock("GET", "/ok.png")
            .with_status(200)
            .with_header("content-type", "image/png")
            .with_body("png")
            .create_async()
            .await;
        server
            .mock("GET", "/broken.png")
            .with_status(200)
            .with_header("content-type", "image/png")
            .with_body("png")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let preserver = Preserver::new(
            HttpFetcher::new(&FetchSettings::default()).unwrap(),
            ResourceStore::new(
                FailingStore {
                    inner: FsStore::new(dir.path()),
                    fail_on: "broken",
                },
                Hosting::new("https://archive.example.org", None),
            ),
            4,
        );
        let article = Article::new(1, "feed", &format!("{origin}/story.html"));
        let outcome = preserver.preserve_article(&article).await.unwrap();

        assert_eq!(outcome.resources.len(), 1);
        assert_eq!(outcome.resources[0].original_url, format!("{origin}/ok.png"));
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].url, format!("{origin}/broken.png"));
        assert!(outcome.failures[0].error.contains("disk full"));

        let page = std::fs::read_to_string(dir.path().join(&outcome.page.path)).unwrap();
        assert!(page.contains(&outcome.resources[0].hosted_url));
        assert!(page.contains(r#"src="/broken.png""#));
    }
}
