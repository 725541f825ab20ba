//! Markup scrapers.
//!
//! | Module | Input | Output |
//! |--------|-------|--------|
//! | [`page`] | Article URL | Page bytes plus embedded resources |
//!
//! Scrapers only discover; fetching and storing the discovered resources is
//! the pipeline's job.

pub mod page;

pub use page::{ScrapedPage, extract_resources, scrape_page};
