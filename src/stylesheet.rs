//! Stylesheet processing: host the fonts and images a stylesheet pulls in.
//!
//! References are found by scanning the raw text (`url(...)` in any quoting
//! style and `@import "..."`), resolved against the stylesheet's own URL and
//! handed to a [`Harvest`] implementation that fetches and stores them.
//! Harvested sub-resources are stored as they are: an imported stylesheet
//! is kept but not scanned in turn.

use crate::error::PreserveError;
use crate::models::{Article, DiscoveredResource, ResourceFailure, ResourceKind, StoredResource};
use crate::resolver::{classify_by_extension, is_skippable, resolve_reference};
use crate::rewriter::{hosted_mapping, rewrite};
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use std::ops::Range;
use tracing::{debug, error, info, instrument, warn};

static URL_RX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)url\(\s*(?:"([^"]*)"|'([^']*)'|([^)"'\s]*))\s*\)"#)
        .expect("hardcoded url() pattern is valid")
});

static IMPORT_RX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)@import\s+(?:url\(\s*)?(?:"([^"]*)"|'([^']*)'|([^)"'\s;]+))"#)
        .expect("hardcoded @import pattern is valid")
});

static FONT_FACE_RX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)@font-face\s*\{[^}]*\}").expect("hardcoded @font-face pattern is valid")
});

/// Capability to fetch and store one sub-resource for an article.
pub trait Harvest {
    async fn harvest(
        &self,
        article: &Article,
        resource: &DiscoveredResource,
    ) -> Result<StoredResource, PreserveError>;
}

/// What processing a stylesheet produced.
#[derive(Debug, Default)]
pub struct StylesheetOutcome {
    /// The rewritten stylesheet (the input when nothing could be rewritten).
    pub content: Vec<u8>,
    pub stored: Vec<StoredResource>,
    pub failures: Vec<ResourceFailure>,
}

fn first_group(caps: &regex::Captures<'_>) -> Option<String> {
    (1..=3).find_map(|i| caps.get(i)).map(|m| m.as_str().trim().to_string())
}

/// Find the sub-resources referenced by stylesheet `text`, resolved against
/// `base`. Unresolvable references come back as failures.
pub fn scan_references(text: &str, base: &str) -> (Vec<DiscoveredResource>, Vec<ResourceFailure>) {
    let font_faces: Vec<Range<usize>> = FONT_FACE_RX.find_iter(text).map(|m| m.range()).collect();
    let in_font_face = |pos: usize| font_faces.iter().any(|r| r.contains(&pos));

    let mut found = Vec::new();
    let mut failures = Vec::new();
    let mut import_spans: Vec<Range<usize>> = Vec::new();

    for caps in IMPORT_RX.captures_iter(text) {
        let Some(reference) = first_group(&caps) else { continue };
        if let Some(m) = caps.get(0) {
            import_spans.push(m.range());
        }
        push_reference(&mut found, &mut failures, base, &reference, Some(ResourceKind::Style));
    }

    for caps in URL_RX.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        // `@import url(...)` was already taken as a stylesheet.
        if import_spans.iter().any(|span| span.contains(&whole.start())) {
            continue;
        }
        let Some(reference) = first_group(&caps) else { continue };
        let hint = in_font_face(whole.start()).then_some(ResourceKind::Font);
        push_reference(&mut found, &mut failures, base, &reference, hint);
    }

    (DiscoveredResource::dedup(found), failures)
}

fn push_reference(
    found: &mut Vec<DiscoveredResource>,
    failures: &mut Vec<ResourceFailure>,
    base: &str,
    reference: &str,
    hint: Option<ResourceKind>,
) {
    if is_skippable(reference) {
        return;
    }
    match resolve_reference(base, reference) {
        Ok(url) => {
            let by_extension = classify_by_extension(&url);
            let kind = match (hint, by_extension) {
                (Some(ResourceKind::Style), _) => ResourceKind::Style,
                (Some(hint), ResourceKind::Other) => hint,
                (_, kind) => kind,
            };
            found.push(DiscoveredResource::new(url, reference, kind));
        }
        Err(e) => {
            warn!(%reference, error = %e, "Skipping unresolvable stylesheet reference");
            failures.push(ResourceFailure::new(reference, hint.unwrap_or(ResourceKind::Other), &e));
        }
    }
}

/// Host everything `content` references and rewrite it to point at the
/// stored copies. A sub-resource that fails is recorded and its reference
/// left as it was.
#[instrument(level = "info", skip_all, fields(article = article.id, stylesheet = %stylesheet_url))]
pub async fn process_stylesheet<H: Harvest>(
    harvester: &H,
    article: &Article,
    stylesheet_url: &str,
    content: &[u8],
    concurrency: usize,
) -> StylesheetOutcome {
    let Ok(text) = std::str::from_utf8(content) else {
        warn!("Stylesheet is not UTF-8; storing it unchanged");
        return StylesheetOutcome {
            content: content.to_vec(),
            ..StylesheetOutcome::default()
        };
    };

    let (references, mut failures) = scan_references(text, stylesheet_url);
    debug!(count = references.len(), "Found stylesheet references");

    let results: Vec<_> = stream::iter(references.iter())
        .map(|found| async move { (found, harvester.harvest(article, found).await) })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut hosted = Vec::new();
    for (found, result) in results {
        match result {
            Ok(stored) => hosted.push((found, stored)),
            Err(e) => {
                warn!(url = %found.url, kind = %found.kind, error = %e, "Sub-resource not preserved");
                failures.push(ResourceFailure::new(&found.url, found.kind, &e));
            }
        }
    }

    let mapping = hosted_mapping(hosted.iter().map(|(found, stored)| (*found, stored)));
    let content = match rewrite(text, &mapping) {
        Ok(rewritten) => rewritten.into_bytes(),
        Err(e) => {
            error!(error = %e, "Could not rewrite stylesheet; storing it unchanged");
            content.to_vec()
        }
    };

    info!(stored = hosted.len(), failed = failures.len(), "Processed stylesheet");
    StylesheetOutcome {
        content,
        stored: hosted.into_iter().map(|(_, stored)| stored).collect(),
        failures,
    }
}
