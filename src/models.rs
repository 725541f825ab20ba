//! Data models for feeds, articles and their preserved resources.
//!
//! This module defines the core data structures used throughout the crate:
//! - [`Feed`]: A subscribed source yielding article URLs
//! - [`Article`]: One page targeted for preservation, with its two state machines
//! - [`Tag`]: Typed annotations read by the eligibility policy
//! - [`ResourceKind`], [`DiscoveredResource`], [`StoredResource`]: What the
//!   pipeline finds in a page and what it leaves in durable storage
//!
//! Serialized enums use `SCREAMING_SNAKE_CASE` so catalog files read the same
//! as the state names used in logs (`NOT_PRESERVED`, `PRESERVING`, ...).

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use url::Url;

pub type ArticleId = u64;

/// A subscribed source of article URLs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Feed {
    /// Unique feed name; first segment of every storage path.
    pub name: String,
    /// The feed (or account) URL.
    pub url: String,
    /// Inactive feeds are kept but not polled.
    pub active: bool,
}

/// Preservation state machine: `NOT_PRESERVED -> PRESERVING -> {PRESERVE, NO_PRESERVE}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PreservationState {
    #[default]
    NotPreserved,
    Preserving,
    Preserve,
    NoPreserve,
}

impl PreservationState {
    /// `PRESERVE` and `NO_PRESERVE` are final within this crate.
    pub fn is_final(self) -> bool {
        matches!(self, PreservationState::Preserve | PreservationState::NoPreserve)
    }
}

/// Archiving state machine: `NOT_ARCHIVED -> ARCHIVING -> ARCHIVED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArchivingState {
    #[default]
    NotArchived,
    Archiving,
    Archived,
}

impl fmt::Display for PreservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PreservationState::NotPreserved => "NOT_PRESERVED",
            PreservationState::Preserving => "PRESERVING",
            PreservationState::Preserve => "PRESERVE",
            PreservationState::NoPreserve => "NO_PRESERVE",
        };
        f.write_str(s)
    }
}

impl fmt::Display for ArchivingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArchivingState::NotArchived => "NOT_ARCHIVED",
            ArchivingState::Archiving => "ARCHIVING",
            ArchivingState::Archived => "ARCHIVED",
        };
        f.write_str(s)
    }
}

/// A typed annotation on an article, written by the tagging subsystem.
///
/// Only the presence of a tag matters to the eligibility predicates; the
/// carried value is informational.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Tag {
    Priority(bool),
    ReleaseDate(DateTime<Utc>),
    NotFoundOnly(bool),
}

impl Tag {
    pub fn is_preservation_tag(&self) -> bool {
        matches!(self, Tag::Priority(_) | Tag::ReleaseDate(_))
    }
}

/// One crawlable page belonging to a [`Feed`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Article {
    pub id: ArticleId,
    pub url: String,
    /// Name of the owning feed.
    pub feed: String,
    /// Derived from the URL path at creation, see [`slugify_article_url`].
    pub slug: String,
    #[serde(default)]
    pub preservation_state: PreservationState,
    #[serde(default)]
    pub archiving_state: ArchivingState,
    /// Set once a preservation run has finished with this article.
    #[serde(default)]
    pub stored: bool,
    #[serde(default)]
    pub tags: Vec<Tag>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub crawled_at: Option<DateTime<Utc>>,
}

impl Article {
    pub fn new(id: ArticleId, feed: &str, url: &str) -> Self {
        Self {
            id,
            url: url.to_string(),
            feed: feed.to_string(),
            slug: slugify_article_url(url),
            preservation_state: PreservationState::default(),
            archiving_state: ArchivingState::default(),
            stored: false,
            tags: Vec::new(),
            created_at: Utc::now(),
            crawled_at: None,
        }
    }

    /// Directory holding everything stored for this article: `<feed>/<slug>`.
    pub fn resources_dir(&self) -> String {
        format!("{}/{}", self.feed, self.slug)
    }

    pub fn has_release_date(&self) -> bool {
        self.tags.iter().any(|t| matches!(t, Tag::ReleaseDate(_)))
    }

    pub fn has_priority(&self) -> bool {
        self.tags.iter().any(|t| matches!(t, Tag::Priority(_)))
    }

    pub fn is_not_found_only(&self) -> bool {
        self.tags.iter().any(|t| matches!(t, Tag::NotFoundOnly(_)))
    }

    /// Tags the eligibility policy looks at.
    pub fn preservation_tags(&self) -> Vec<&Tag> {
        self.tags.iter().filter(|t| t.is_preservation_tag()).collect()
    }
}

/// A URL recorded by the external archival service for an article.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ArchivedArticle {
    pub article: ArticleId,
    pub url: String,
    pub archived_at: DateTime<Utc>,
}

/// Closed set of resource kinds. Only [`ResourceKind::Style`] goes through
/// the stylesheet processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// The rewritten article page itself.
    Page,
    Image,
    Font,
    Style,
    Other,
}

impl ResourceKind {
    /// Directory name under the article's resources directory. Part of the
    /// public storage layout; do not rename.
    pub fn subdir(self) -> &'static str {
        match self {
            ResourceKind::Page => "page",
            ResourceKind::Image => "image",
            ResourceKind::Font => "font",
            ResourceKind::Style => "style",
            ResourceKind::Other => "other",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.subdir())
    }
}

/// A resource reference found in markup or in a stylesheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredResource {
    /// Absolute URL, used for fetching and as the dedup key.
    pub url: String,
    /// Every spelling the reference had where it was found, in order.
    pub references: Vec<String>,
    pub kind: ResourceKind,
}

impl DiscoveredResource {
    pub fn new(url: String, reference: &str, kind: ResourceKind) -> Self {
        Self {
            url,
            references: vec![reference.to_string()],
            kind,
        }
    }

    /// Remove duplicates by exact URL, keeping first-seen order and kind and
    /// merging the spellings of later occurrences into the first one.
    pub fn dedup(found: Vec<DiscoveredResource>) -> Vec<DiscoveredResource> {
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut unique: Vec<DiscoveredResource> = Vec::with_capacity(found.len());
        for resource in found {
            match index.get(&resource.url) {
                Some(&i) => unique[i].references.extend(resource.references),
                None => {
                    index.insert(resource.url.clone(), unique.len());
                    unique.push(resource);
                }
            }
        }
        for resource in &mut unique {
            resource.references = std::mem::take(&mut resource.references).into_iter().unique().collect();
        }
        unique
    }
}

/// A resource that could not be preserved; the reference stays unresolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceFailure {
    pub url: String,
    pub kind: ResourceKind,
    pub error: String,
}

impl ResourceFailure {
    pub fn new(url: &str, kind: ResourceKind, error: &impl fmt::Display) -> Self {
        Self {
            url: url.to_string(),
            kind,
            error: error.to_string(),
        }
    }
}

/// A resource persisted in durable storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredResource {
    pub original_url: String,
    pub kind: ResourceKind,
    /// Path relative to the storage root.
    pub path: String,
    pub hosted_url: String,
}

/// Derive an article slug from the path of its URL.
///
/// The extension of the last path segment is dropped, runs of
/// non-alphanumeric characters collapse into one hyphen and the result is
/// lower-cased. A URL with an empty path falls back to its host.
///
/// ```ignore
/// assert_eq!(slugify_article_url("http://fakeurl.com/a/fake/url/example.html"), "a-fake-url-example");
/// ```
pub fn slugify_article_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => {
            let slug = slugify(parsed.path());
            if slug.is_empty() {
                collapse(parsed.host_str().unwrap_or_default())
            } else {
                slug
            }
        }
        Err(_) => slugify(url),
    }
}

/// Slugify arbitrary text. Idempotent: `slugify(&slugify(x)) == slugify(x)`.
pub fn slugify(text: &str) -> String {
    collapse(strip_extension(text))
}

fn collapse(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_sep = false;
    for c in text.chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('-');
            }
            pending_sep = false;
            slug.push(c);
        } else {
            pending_sep = true;
        }
    }
    slug
}

fn strip_extension(text: &str) -> &str {
    let last_segment_start = text.rfind('/').map(|i| i + 1).unwrap_or(0);
    match text[last_segment_start..].rfind('.') {
        Some(dot) if dot > 0 => &text[..last_segment_start + dot],
        _ => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_article_url() {
        assert_eq!(
            slugify_article_url("http://fakeurl.com/a/fake/url/example.html"),
            "a-fake-url-example"
        );
        assert_eq!(slugify_article_url("http://fakeurl.com/1/"), "1");
        assert_eq!(slugify_article_url("https://News.example.org/"), "news-example-org");
        assert_eq!(
            slugify_article_url("https://x.com/2017/11/Big_Story--Part.2.php?id=4"),
            "2017-11-big-story-part-2"
        );
    }

    #[test]
    fn test_slugify_is_idempotent() {
        for input in [
            "http://fakeurl.com/a/fake/url/example.html",
            "/Some Path/with.dots/file.tar.gz",
            "already-a-slug",
            "--Ünïcode__Title--",
            "",
        ] {
            let once = slugify(input);
            assert_eq!(slugify(&once), once, "input: {input}");
        }
        let slug = slugify_article_url("http://fakeurl.com/a/fake/url/example.html");
        assert_eq!(slugify(&slug), slug);
    }

    #[test]
    fn test_resources_dir() {
        let article = Article::new(1, "toutenrab", "http://fakeurl.com/1/");
        assert_eq!(article.resources_dir(), "toutenrab/1");
    }

    #[test]
    fn test_preservation_tags() {
        let mut article = Article::new(1, "feed", "http://fakeurl.com/1/");
        article.tags.push(Tag::Priority(false));
        article.tags.push(Tag::ReleaseDate(Utc::now()));
        article.tags.push(Tag::NotFoundOnly(false));
        assert_eq!(article.preservation_tags().len(), 2);
        assert!(article.has_priority());
        assert!(article.has_release_date());
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&PreservationState::NoPreserve).unwrap();
        assert_eq!(json, "\"NO_PRESERVE\"");
        let state: ArchivingState = serde_json::from_str("\"ARCHIVING\"").unwrap();
        assert_eq!(state, ArchivingState::Archiving);
        assert_eq!(PreservationState::Preserving.to_string(), "PRESERVING");
    }

    #[test]
    fn test_dedup_keeps_order_and_merges_spellings() {
        let found = vec![
            DiscoveredResource::new("https://a.com/a.png".into(), "a.png", ResourceKind::Image),
            DiscoveredResource::new("https://a.com/b.css".into(), "/b.css", ResourceKind::Style),
            DiscoveredResource::new("https://a.com/a.png".into(), "/a.png", ResourceKind::Image),
            DiscoveredResource::new("https://a.com/a.png".into(), "a.png", ResourceKind::Image),
        ];
        let unique = DiscoveredResource::dedup(found);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].url, "https://a.com/a.png");
        assert_eq!(unique[0].references, vec!["a.png".to_string(), "/a.png".to_string()]);
        assert_eq!(unique[1].kind, ResourceKind::Style);
    }

    #[test]
    fn test_article_roundtrips_through_json() {
        let mut article = Article::new(7, "feed", "https://x.com/story.html");
        article.tags.push(Tag::NotFoundOnly(true));
        let json = serde_json::to_string(&article).unwrap();
        let back: Article = serde_json::from_str(&json).unwrap();
        assert_eq!(back, article);
    }
}
