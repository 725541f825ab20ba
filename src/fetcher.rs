//! HTTP(S) retrieval of pages and resources with bounded retries.
//!
//! The module uses a trait-based design so the pipeline can be driven by
//! any byte source:
//! - [`Fetch`]: Core trait, one URL in, one body out
//! - [`HttpFetcher`]: `reqwest` implementation with timeout, redirect cap and
//!   a hard size limit enforced while streaming
//! - [`RetryFetch`]: Decorator that retries transient failures of any
//!   [`Fetch`] implementation
//!
//! # Retry Strategy
//!
//! - Only transient causes are retried (network errors, timeouts, broken
//!   bodies, 5xx); 4xx answers and oversize bodies fail immediately
//! - Exponential backoff from `base_delay`, capped at 30 seconds
//! - Random jitter (0-250ms by default) added to each delay

use crate::config::FetchSettings;
use crate::error::{FetchCause, PreserveError};
use futures::StreamExt;
use rand::{Rng, rng};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, redirect};
use std::fmt;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, instrument, warn};

/// A fetched body and what the origin said about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    /// The URL that was requested.
    pub url: String,
    /// The URL after redirects.
    pub final_url: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Trait for retrieving the bytes behind an absolute URL.
pub trait Fetch {
    async fn fetch(&self, url: &str) -> Result<Fetched, PreserveError>;
}

impl<T: Fetch> Fetch for &T {
    async fn fetch(&self, url: &str) -> Result<Fetched, PreserveError> {
        (**self).fetch(url).await
    }
}

/// `reqwest`-backed fetcher.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    max_bytes: usize,
}

impl HttpFetcher {
    /// Build the HTTP client from `settings` (timeout, redirect cap, user
    /// agent and body size limit).
    ///
    /// # Errors
    ///
    /// [`PreserveError::Config`] if the TLS backend cannot be initialised.
    pub fn new(settings: &FetchSettings) -> Result<Self, PreserveError> {
        let client = Client::builder()
            .timeout(settings.timeout())
            .redirect(redirect::Policy::limited(settings.max_redirects))
            .user_agent(settings.user_agent.as_str())
            .build()
            .map_err(|e| PreserveError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            max_bytes: settings.max_bytes,
        })
    }
}

fn classify(e: &reqwest::Error) -> FetchCause {
    if e.is_timeout() {
        FetchCause::Timeout
    } else if e.is_redirect() {
        FetchCause::TooManyRedirects
    } else if e.is_body() || e.is_decode() {
        FetchCause::Body(e.to_string())
    } else {
        FetchCause::Network(e.to_string())
    }
}

impl Fetch for HttpFetcher {
    #[instrument(level = "debug", skip(self))]
    async fn fetch(&self, url: &str) -> Result<Fetched, PreserveError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PreserveError::fetch_failed(url, classify(&e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PreserveError::fetch_failed(url, FetchCause::Status(status.as_u16())));
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        // Refuse early when the origin announces an oversize body.
        let expected = response.content_length().unwrap_or(0);
        if expected > self.max_bytes as u64 {
            return Err(PreserveError::fetch_failed(
                url,
                FetchCause::TooLarge { limit: self.max_bytes },
            ));
        }

        let mut bytes = Vec::with_capacity(expected as usize);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| PreserveError::fetch_failed(url, classify(&e)))?;
            if bytes.len() + chunk.len() > self.max_bytes {
                return Err(PreserveError::fetch_failed(
                    url,
                    FetchCause::TooLarge { limit: self.max_bytes },
                ));
            }
            bytes.extend_from_slice(&chunk);
        }

        debug!(%final_url, bytes = bytes.len(), ?content_type, "Fetched");
        Ok(Fetched {
            url: url.to_string(),
            final_url,
            content_type,
            bytes,
        })
    }
}

/// Wrapper that adds exponential backoff retries to any [`Fetch`] implementation.
///
/// ```text
/// delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..max_jitter)
/// ```
pub struct RetryFetch<T> {
    inner: T,
    /// Retries after the first attempt.
    max_retries: usize,
    base_delay: Duration,
    max_delay: Duration,
    max_jitter: Duration,
}

impl<T: Fetch> RetryFetch<T> {
    /// Wrap `inner` with retry-on-transient-failure.
    ///
    /// # Arguments
    ///
    /// * `inner` - The fetcher doing the actual work
    /// * `max_retries` - Attempts after the first one; 0 disables retrying
    /// * `base_delay` - Delay before the first retry, doubled for each one after
    ///
    /// # Returns
    ///
    /// A decorator with a 30 s delay cap and up to 250 ms of jitter. Use
    /// [`RetryFetch::with_max_jitter`] to change the jitter.
    pub fn new(inner: T, max_retries: usize, base_delay: Duration) -> Self {
        Self {
            inner,
            max_retries,
            base_delay,
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::from_millis(250),
        }
    }

    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    fn delay_for(&self, attempt: usize) -> Duration {
        let shift = (attempt - 1).min(16) as u32;
        let delay = self.base_delay.saturating_mul(1 << shift).min(self.max_delay);
        let jitter_ms = self.max_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            delay
        } else {
            delay + Duration::from_millis(rng().random_range(0..=jitter_ms))
        }
    }
}

impl<T> fmt::Debug for RetryFetch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryFetch")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

impl<T: Fetch> Fetch for RetryFetch<T> {
    #[instrument(level = "debug", skip(self))]
    async fn fetch(&self, url: &str) -> Result<Fetched, PreserveError> {
        let total_t0 = Instant::now();
        let mut attempt = 0usize;

        loop {
            match self.inner.fetch(url).await {
                Ok(fetched) => return Ok(fetched),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        error!(
                            attempt,
                            max = self.max_retries,
                            elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                            error = %e,
                            "fetch exhausted retries"
                        );
                        return Err(e);
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt,
                        max = self.max_retries,
                        ?delay,
                        error = %e,
                        "fetch attempt failed; backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

/// The fetcher the binary uses: HTTP with retries, configured from settings.
///
/// # Errors
///
/// Same as [`HttpFetcher::new`].
pub fn build_fetcher(settings: &FetchSettings) -> Result<RetryFetch<HttpFetcher>, PreserveError> {
    Ok(RetryFetch::new(
        HttpFetcher::new(settings)?,
        settings.max_retries,
        settings.base_delay(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails with `cause` for the first `failures` calls, then succeeds.
    struct Flaky {
        calls: AtomicUsize,
        failures: usize,
        cause: FetchCause,
    }

    impl Fetch for Flaky {
        async fn fetch(&self, url: &str) -> Result<Fetched, PreserveError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(PreserveError::fetch_failed(url, self.cause.clone()));
            }
            Ok(Fetched {
                url: url.to_string(),
                final_url: url.to_string(),
                content_type: None,
                bytes: b"ok".to_vec(),
            })
        }
    }

    fn flaky(failures: usize, cause: FetchCause) -> RetryFetch<Flaky> {
        RetryFetch::new(
            Flaky {
                calls: AtomicUsize::new(0),
                failures,
                cause,
            },
            3,
            Duration::from_millis(1),
        )
        .with_max_jitter(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let fetcher = flaky(2, FetchCause::Timeout);
        let fetched = fetcher.fetch("https://a.com/x").await.unwrap();
        assert_eq!(fetched.bytes, b"ok");
        assert_eq!(fetcher.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let fetcher = flaky(10, FetchCause::Network("connection reset".into()));
        let err = fetcher.fetch("https://a.com/x").await.unwrap_err();
        assert!(matches!(err, PreserveError::FetchFailed { .. }));
        assert_eq!(fetcher.inner().calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_does_not_retry_client_errors() {
        let fetcher = flaky(10, FetchCause::Status(404));
        assert!(fetcher.fetch("https://a.com/x").await.is_err());
        assert_eq!(fetcher.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_is_capped() {
        let fetcher = flaky(0, FetchCause::Timeout);
        assert_eq!(fetcher.delay_for(1), Duration::from_millis(1));
        assert_eq!(fetcher.delay_for(3), Duration::from_millis(4));
        let slow = RetryFetch::new(fetcher.inner, 3, Duration::from_secs(20))
            .with_max_jitter(Duration::ZERO);
        assert_eq!(slow.delay_for(4), Duration::from_secs(30));
    }

    fn settings(max_bytes: usize) -> FetchSettings {
        FetchSettings {
            max_bytes,
            ..FetchSettings::default()
        }
    }

    #[tokio::test]
    async fn test_http_fetch_returns_body_and_content_type() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/img/logo.png")
            .with_status(200)
            .with_header("content-type", "image/png")
            .with_body(vec![0x89, b'P', b'N', b'G'])
            .create_async()
            .await;

        let fetcher = HttpFetcher::new(&settings(1024)).unwrap();
        let url = format!("{}/img/logo.png", server.url());
        let fetched = fetcher.fetch(&url).await.unwrap();

        mock.assert_async().await;
        assert_eq!(fetched.bytes, vec![0x89, b'P', b'N', b'G']);
        assert_eq!(fetched.content_type.as_deref(), Some("image/png"));
        assert_eq!(fetched.final_url, url);
    }

    #[tokio::test]
    async fn test_http_fetch_follows_redirects() {
        let mut server = mockito::Server::new_async().await;
        let target = format!("{}/new", server.url());
        server
            .mock("GET", "/old")
            .with_status(301)
            .with_header("location", &target)
            .create_async()
            .await;
        server
            .mock("GET", "/new")
            .with_status(200)
            .with_body("moved")
            .create_async()
            .await;

        let fetcher = HttpFetcher::new(&settings(1024)).unwrap();
        let fetched = fetcher.fetch(&format!("{}/old", server.url())).await.unwrap();
        assert_eq!(fetched.final_url, target);
        assert_eq!(fetched.bytes, b"moved");
    }

    #[tokio::test]
    async fn test_http_fetch_rejects_oversize_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/big")
            .with_status(200)
            .with_body("x".repeat(2048))
            .create_async()
            .await;

        let fetcher = HttpFetcher::new(&settings(1024)).unwrap();
        let err = fetcher.fetch(&format!("{}/big", server.url())).await.unwrap_err();
        assert!(matches!(
            err,
            PreserveError::FetchFailed { cause: FetchCause::TooLarge { limit: 1024 }, .. }
        ));
    }

    #[tokio::test]
    async fn test_http_404_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/gone")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let fetcher = RetryFetch::new(
            HttpFetcher::new(&settings(1024)).unwrap(),
            3,
            Duration::from_millis(1),
        );
        let err = fetcher.fetch(&format!("{}/gone", server.url())).await.unwrap_err();
        mock.assert_async().await;
        assert!(matches!(
            err,
            PreserveError::FetchFailed { cause: FetchCause::Status(404), .. }
        ));
    }

    #[tokio::test]
    async fn test_redirect_loop_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("GET", "/a")
            .with_status(302)
            .with_header("location", "/b")
            .expect(1)
            .create_async()
            .await;
        let second = server
            .mock("GET", "/b")
            .with_status(302)
            .with_header("location", "/a")
            .expect(1)
            .create_async()
            .await;

        let fetcher = RetryFetch::new(
            HttpFetcher::new(&FetchSettings {
                max_redirects: 1,
                ..FetchSettings::default()
            })
            .unwrap(),
            3,
            Duration::from_millis(1),
        );
        let err = fetcher.fetch(&format!("{}/a", server.url())).await.unwrap_err();

        first.assert_async().await;
        second.assert_async().await;
        assert!(!err.is_transient());
        assert!(matches!(
            err,
            PreserveError::FetchFailed { cause: FetchCause::TooManyRedirects, .. }
        ));
    }
}
