//! Article page scraper.
//!
//! Fetches an article page and lists the resources its markup embeds:
//! images (`src` and `srcset`), icons, stylesheets, preloaded fonts and the
//! `url(...)` references of inline `<style>` blocks and `style` attributes.
//! References are resolved against `<base href>` when present, otherwise
//! against the page URL after redirects.

use crate::error::PreserveError;
use crate::fetcher::Fetch;
use crate::models::{DiscoveredResource, ResourceKind};
use crate::resolver::{is_skippable, resolve_reference};
use crate::stylesheet::scan_references;
use crate::utils::truncate_for_log;
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info, instrument, warn};

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("hardcoded selector is valid")
}

static BASE_SELECTOR: Lazy<Selector> = Lazy::new(|| selector("base[href]"));
static IMG_SELECTOR: Lazy<Selector> = Lazy::new(|| selector("img[src]"));
static SRCSET_SELECTOR: Lazy<Selector> = Lazy::new(|| selector("img[srcset], source[srcset]"));
static LINK_SELECTOR: Lazy<Selector> = Lazy::new(|| selector("link[href]"));
static STYLE_SELECTOR: Lazy<Selector> = Lazy::new(|| selector("style"));
static STYLE_ATTR_SELECTOR: Lazy<Selector> = Lazy::new(|| selector("[style]"));

/// A fetched article page and the resources it embeds.
#[derive(Debug, Clone)]
pub struct ScrapedPage {
    pub url: String,
    /// URL after redirects.
    pub final_url: String,
    pub content: Vec<u8>,
    /// Unique by absolute URL, in document order.
    pub resources: Vec<DiscoveredResource>,
}

/// Fetch `url` and discover the resources of the returned markup.
///
/// Fails with [`PreserveError::ScrapeFailed`] when the page cannot be
/// fetched, is not HTML, or is not UTF-8.
#[instrument(level = "info", skip(fetcher))]
pub async fn scrape_page<F: Fetch>(fetcher: &F, url: &str) -> Result<ScrapedPage, PreserveError> {
    let fetched = fetcher
        .fetch(url)
        .await
        .map_err(|e| PreserveError::scrape_failed(url, e))?;

    if let Some(content_type) = fetched.content_type.as_deref() {
        if !is_markup(content_type) {
            return Err(PreserveError::scrape_failed(
                url,
                format!("not markup: {content_type}"),
            ));
        }
    }
    let html = std::str::from_utf8(&fetched.bytes).map_err(|e| {
        PreserveError::scrape_failed(
            url,
            format!(
                "page is not UTF-8 ({e}): {}",
                truncate_for_log(&String::from_utf8_lossy(&fetched.bytes), 80)
            ),
        )
    })?;

    let resources = extract_resources(html, &fetched.final_url);
    info!(
        final_url = %fetched.final_url,
        bytes = fetched.bytes.len(),
        resources = resources.len(),
        "Scraped page"
    );

    Ok(ScrapedPage {
        url: url.to_string(),
        final_url: fetched.final_url,
        content: fetched.bytes,
        resources,
    })
}

fn is_markup(content_type: &str) -> bool {
    let mime = content_type.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    matches!(mime.as_str(), "text/html" | "application/xhtml+xml")
}

/// List the resources embedded in `html`, resolved against `page_url`.
pub fn extract_resources(html: &str, page_url: &str) -> Vec<DiscoveredResource> {
    let document = Html::parse_document(html);

    let base = document
        .select(&BASE_SELECTOR)
        .next()
        .and_then(|el| el.value().attr("href"))
        .and_then(|href| resolve_reference(page_url, href).ok())
        .unwrap_or_else(|| page_url.to_string());

    let mut found = Vec::new();
    let mut add = |reference: &str, kind: ResourceKind| {
        if is_skippable(reference) {
            return;
        }
        match resolve_reference(&base, reference) {
            Ok(url) => found.push(DiscoveredResource::new(url, reference.trim(), kind)),
            Err(e) => warn!(%reference, error = %e, "Skipping unresolvable page reference"),
        }
    };

    for element in document.select(&IMG_SELECTOR) {
        if let Some(src) = element.value().attr("src") {
            add(src, ResourceKind::Image);
        }
    }

    for element in document.select(&SRCSET_SELECTOR) {
        if let Some(srcset) = element.value().attr("srcset") {
            for candidate in srcset_candidates(srcset) {
                add(candidate, ResourceKind::Image);
            }
        }
    }

    for element in document.select(&LINK_SELECTOR) {
        if let (Some(kind), Some(href)) = (link_kind(&element), element.value().attr("href")) {
            add(href, kind);
        }
    }

    let inline_css = document
        .select(&STYLE_SELECTOR)
        .map(|el| el.text().collect::<String>())
        .chain(
            document
                .select(&STYLE_ATTR_SELECTOR)
                .filter_map(|el| el.value().attr("style").map(str::to_string)),
        );
    for css in inline_css {
        let (refs, failures) = scan_references(&css, &base);
        for failure in failures {
            debug!(url = %failure.url, error = %failure.error, "Skipping inline style reference");
        }
        found.extend(refs);
    }

    DiscoveredResource::dedup(found)
}

/// Resource kind of a `<link>`, or `None` for links that are not resources
/// (alternate, canonical, preconnect, ...).
fn link_kind(element: &ElementRef<'_>) -> Option<ResourceKind> {
    let rel = element.value().attr("rel").unwrap_or_default().to_ascii_lowercase();
    let rels: Vec<&str> = rel.split_ascii_whitespace().collect();
    let as_attr = element.value().attr("as").unwrap_or_default().to_ascii_lowercase();

    if rels.contains(&"stylesheet") || as_attr == "style" {
        Some(ResourceKind::Style)
    } else if as_attr == "font" {
        Some(ResourceKind::Font)
    } else if as_attr == "image" || rels.iter().any(|r| *r == "icon" || *r == "apple-touch-icon") {
        Some(ResourceKind::Image)
    } else {
        None
    }
}

/// URLs of a `srcset` value (`a.png 1x, b.png 2x`).
fn srcset_candidates(srcset: &str) -> impl Iterator<Item = &str> {
    srcset
        .split(',')
        .filter_map(|candidate| candidate.split_whitespace().next())
        .filter(|url| !url.is_empty())
}
