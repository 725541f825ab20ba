//! # Article Vault
//!
//! Preserve feed articles together with the resources their pages embed,
//! so that a snapshot stays readable after the origin site changes or
//! disappears.
//!
//! ## Architecture
//!
//! For every article of a batch the pipeline:
//! 1. **Scrapes** the page and lists embedded images, fonts and stylesheets
//! 2. **Fetches** each resource (bounded concurrency, retry with backoff)
//! 3. **Stores** it under `<feed>/<slug>/<kind>/<name>` and computes its hosted URL
//! 4. **Processes stylesheets**, hosting the fonts and images they reference
//! 5. **Rewrites** the page onto the hosted URLs and stores it
//!
//! The [`orchestrator`] wraps this in the preservation state machine
//! (`NOT_PRESERVED -> PRESERVING -> {PRESERVE, NO_PRESERVE}`) kept by the
//! [`catalog`].

pub mod catalog;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod resolver;
pub mod rewriter;
pub mod scrapers;
pub mod storage;
pub mod stylesheet;
pub mod utils;

pub use catalog::{Catalog, EligibilityPolicy, TagPolicy};
pub use config::Settings;
pub use error::{FetchCause, PreserveError};
pub use fetcher::{Fetch, HttpFetcher, RetryFetch, build_fetcher};
pub use models::{Article, ArticleId, PreservationState, ArchivingState, ResourceKind, Tag};
pub use orchestrator::{BatchReport, Orchestrator};
pub use pipeline::{ArticleOutcome, Preserver};
pub use storage::{FsStore, Hosting, ObjectStore, ResourceStore};
