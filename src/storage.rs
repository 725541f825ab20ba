//! Durable storage of preserved resources.
//!
//! Objects live under `<feed-name>/<article-slug>/<kind>/<name>[-<suffix>]`.
//! That layout is what the serving layer maps back to hosted URLs, so it is
//! part of the public contract.
//!
//! Writes are create-only: an object is never modified in place. With
//! `uniq` naming a short random suffix is inserted before the extension and
//! a collision retries with a new suffix; without it a collision is an error.

use crate::error::PreserveError;
use crate::models::{Article, ResourceKind, StoredResource};
use rand::distr::Alphanumeric;
use rand::{Rng, rng};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};
use url::Url;

const SUFFIX_LEN: usize = 7;
const MAX_NAME_ATTEMPTS: usize = 5;
const MAX_NAME_LEN: usize = 120;

/// Backend the [`ResourceStore`] writes objects to.
pub trait ObjectStore {
    /// Write `bytes` at `path`, failing with `AlreadyExists` if an object is
    /// already there. A failed write must not leave a partial object behind.
    async fn create(&self, path: &str, bytes: &[u8]) -> std::io::Result<()>;
}

/// Filesystem-backed object store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }
}

impl ObjectStore for FsStore {
    async fn create(&self, path: &str, bytes: &[u8]) -> std::io::Result<()> {
        let full = self.root.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&full)
            .await?;
        let written = async {
            file.write_all(bytes).await?;
            file.sync_all().await
        }
        .await;
        if let Err(e) = written {
            drop(file);
            if let Err(cleanup) = fs::remove_file(&full).await {
                warn!(path = %full.display(), error = %cleanup, "Could not remove partial object");
            }
            return Err(e);
        }
        Ok(())
    }
}

/// Turns stored paths into public URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hosting {
    pub site_domain: String,
    pub custom_domain: Option<String>,
}

impl Hosting {
    pub fn new(site_domain: impl Into<String>, custom_domain: Option<String>) -> Self {
        Self {
            site_domain: site_domain.into(),
            custom_domain: custom_domain.filter(|d| !d.is_empty()),
        }
    }

    /// `https://<custom-domain>/<path>[?<query>]` when a custom domain is
    /// configured, else `<site-domain>/<path>[?<query>]`. Absolute URLs are
    /// returned as they are, with the query appended.
    pub fn hosted_url(&self, path: &str, query: Option<&str>) -> String {
        let mut url = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            let base = match &self.custom_domain {
                Some(domain) => format!("https://{}", domain.trim_end_matches('/')),
                None => self.site_domain.trim_end_matches('/').to_string(),
            };
            format!("{base}/{}", path.trim_start_matches('/'))
        };
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        url
    }
}

/// The resource store: naming, writing and hosting of one article's objects.
#[derive(Debug, Clone)]
pub struct ResourceStore<S> {
    backend: S,
    hosting: Hosting,
}

impl<S: ObjectStore> ResourceStore<S> {
    /// # Arguments
    ///
    /// * `backend` - Where the bytes go
    /// * `hosting` - How stored paths turn into public URLs
    pub fn new(backend: S, hosting: Hosting) -> Self {
        Self { backend, hosting }
    }

    pub fn hosting(&self) -> &Hosting {
        &self.hosting
    }

    pub fn backend(&self) -> &S {
        &self.backend
    }

    /// Persist `bytes` for `article` and return where they ended up.
    ///
    /// # Arguments
    ///
    /// * `article` - Owner; gives the `<feed>/<slug>` prefix
    /// * `original_url` - Where the bytes came from. Its basename becomes the
    ///   object name unless `name` is given, and its query string is carried
    ///   over to the hosted URL
    /// * `name` - Explicit object name
    /// * `kind` - Selects the `<kind>` directory
    /// * `bytes` - Object content
    /// * `uniq` - Insert a random suffix before the extension, drawing a new
    ///   one when the name is taken
    ///
    /// # Returns
    ///
    /// The storage path and hosted URL of the new object.
    ///
    /// # Errors
    ///
    /// [`PreserveError::StoreWriteFailed`] when the backend write fails, or
    /// when every suffix drawn is already taken.
    #[instrument(level = "debug", skip(self, article, bytes), fields(article = article.id, len = bytes.len()))]
    pub async fn store(
        &self,
        article: &Article,
        original_url: &str,
        name: Option<&str>,
        kind: ResourceKind,
        bytes: &[u8],
        uniq: bool,
    ) -> Result<StoredResource, PreserveError> {
        let name = match name {
            Some(name) => sanitize_name(name, kind),
            None => name_from_url(original_url, kind),
        };
        let query = Url::parse(original_url)
            .ok()
            .and_then(|u| u.query().map(str::to_string));

        let attempts = if uniq { MAX_NAME_ATTEMPTS } else { 1 };
        let mut last_err = None;
        for _ in 0..attempts {
            let path = resource_path(article, kind, &name, uniq.then(uniq_suffix).as_deref());
            match self.backend.create(&path, bytes).await {
                Ok(()) => {
                    let hosted_url = self.hosting.hosted_url(&path, query.as_deref());
                    debug!(%path, %hosted_url, "Stored resource");
                    return Ok(StoredResource {
                        original_url: original_url.to_string(),
                        kind,
                        path,
                        hosted_url,
                    });
                }
                Err(e) if uniq && e.kind() == ErrorKind::AlreadyExists => {
                    debug!(%path, "Name taken; drawing a new suffix");
                    last_err = Some(PreserveError::StoreWriteFailed { path, source: e });
                }
                Err(e) => return Err(PreserveError::StoreWriteFailed { path, source: e }),
            }
        }
        Err(last_err.unwrap_or_else(|| PreserveError::StoreWriteFailed {
            path: resource_path(article, kind, &name, None),
            source: std::io::Error::from(ErrorKind::AlreadyExists),
        }))
    }
}

/// `<feed>/<slug>/<kind>/<name>`, with `suffix` inserted before the extension.
pub fn resource_path(article: &Article, kind: ResourceKind, name: &str, suffix: Option<&str>) -> String {
    let name = match suffix {
        Some(suffix) => with_suffix(name, suffix),
        None => name.to_string(),
    };
    format!("{}/{}/{}", article.resources_dir(), kind.subdir(), name)
}

fn with_suffix(name: &str, suffix: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}-{suffix}.{ext}"),
        _ => format!("{name}-{suffix}"),
    }
}

fn uniq_suffix() -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

/// Object name for a resource: the percent-decoded basename of its URL path.
pub fn name_from_url(url: &str, kind: ResourceKind) -> String {
    if kind == ResourceKind::Page {
        return "index.html".to_string();
    }
    let basename = Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .unwrap_or_default();
    let decoded = urlencoding::decode(&basename)
        .map(|s| s.into_owned())
        .unwrap_or(basename);
    sanitize_name(&decoded, kind)
}

/// Reduce a name to one safe path segment; empty names become the kind name.
fn sanitize_name(name: &str, kind: ResourceKind) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_matches(|c: char| c == '.' || c.is_whitespace());
    if cleaned.is_empty() {
        return kind.subdir().to_string();
    }
    if cleaned.len() <= MAX_NAME_LEN {
        return cleaned.to_string();
    }
    // Keep the extension when cutting long names.
    let ext = cleaned.rsplit_once('.').map(|(_, e)| e).filter(|e| e.len() <= 10);
    let budget = MAX_NAME_LEN - ext.map(|e| e.len() + 1).unwrap_or(0);
    let mut cut = budget;
    while !cleaned.is_char_boundary(cut) {
        cut -= 1;
    }
    match ext {
        Some(ext) => format!("{}.{ext}", &cleaned[..cut]),
        None => cleaned[..cut].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn article() -> Article {
        Article::new(1, "toutenrab", "http://fakeurl.com/a/fake/url/example.html")
    }

    fn store(dir: &tempfile::TempDir) -> ResourceStore<FsStore> {
        ResourceStore::new(
            FsStore::new(dir.path()),
            Hosting::new("https://archive.example.org", None),
        )
    }

    #[test]
    fn test_resource_path_layout() {
        assert_eq!(
            resource_path(&article(), ResourceKind::Font, "a.woff2", None),
            "toutenrab/a-fake-url-example/font/a.woff2"
        );
        assert_eq!(
            resource_path(&article(), ResourceKind::Image, "logo.png", Some("k3x9a2b")),
            "toutenrab/a-fake-url-example/image/logo-k3x9a2b.png"
        );
        assert_eq!(with_suffix(".htaccess", "abc"), ".htaccess-abc");
        assert_eq!(with_suffix("README", "abc"), "README-abc");
    }

    #[test]
    fn test_names_from_urls() {
        assert_eq!(name_from_url("https://a.com/img/My%20Logo.png?v=3", ResourceKind::Image), "My Logo.png");
        assert_eq!(name_from_url("https://a.com/fonts/", ResourceKind::Font), "font");
        assert_eq!(name_from_url("https://a.com/story/", ResourceKind::Page), "index.html");
        assert_eq!(name_from_url("https://a.com/x/..%2F..%2Fetc", ResourceKind::Other), "_.._etc");
        let long = format!("https://a.com/{}.png", "a".repeat(300));
        let name = name_from_url(&long, ResourceKind::Image);
        assert_eq!(name.len(), MAX_NAME_LEN);
        assert!(name.ends_with(".png"));
    }

    #[test]
    fn test_hosted_url_prefers_custom_domain() {
        let site = Hosting::new("https://archive.example.org/", None);
        assert_eq!(
            site.hosted_url("feed/slug/image/a.png", Some("v=2")),
            "https://archive.example.org/feed/slug/image/a.png?v=2"
        );
        let cdn = Hosting::new("https://archive.example.org", Some("cdn.example.org".into()));
        assert_eq!(
            cdn.hosted_url("/feed/slug/image/a.png", None),
            "https://cdn.example.org/feed/slug/image/a.png"
        );
        assert_eq!(cdn.hosted_url("https://elsewhere.org/x", Some("q=1")), "https://elsewhere.org/x?q=1");
    }

    #[tokio::test]
    async fn test_store_writes_bytes_and_keeps_query() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let stored = store
            .store(&article(), "https://a.com/img/logo.png?w=300", None, ResourceKind::Image, b"png", false)
            .await
            .unwrap();
        assert_eq!(stored.path, "toutenrab/a-fake-url-example/image/logo.png");
        assert_eq!(
            stored.hosted_url,
            "https://archive.example.org/toutenrab/a-fake-url-example/image/logo.png?w=300"
        );
        assert_eq!(std::fs::read(dir.path().join(&stored.path)).unwrap(), b"png");
    }

    #[tokio::test]
    async fn test_uniq_names_never_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let a = store
            .store(&article(), "https://a.com/logo.png", None, ResourceKind::Image, b"first", true)
            .await
            .unwrap();
        let b = store
            .store(&article(), "https://b.com/logo.png", None, ResourceKind::Image, b"second", true)
            .await
            .unwrap();
        assert_ne!(a.path, b.path);
        assert_eq!(std::fs::read(dir.path().join(&a.path)).unwrap(), b"first");
        assert_eq!(std::fs::read(dir.path().join(&b.path)).unwrap(), b"second");
        let paths: HashSet<_> = [a.path, b.path].into_iter().collect();
        assert_eq!(paths.len(), 2);
    }

    #[tokio::test]
    async fn test_collision_without_uniq_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store
            .store(&article(), "https://a.com/logo.png", None, ResourceKind::Image, b"first", false)
            .await
            .unwrap();
        let err = store
            .store(&article(), "https://a.com/logo.png", None, ResourceKind::Image, b"second", false)
            .await
            .unwrap_err();
        assert!(matches!(err, PreserveError::StoreWriteFailed { .. }));
        let kept = dir.path().join("toutenrab/a-fake-url-example/image/logo.png");
        assert_eq!(std::fs::read(kept).unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_unwritable_root_is_store_write_failed() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let store = ResourceStore::new(FsStore::new(&blocker), Hosting::new("https://h.org", None));
        let err = store
            .store(&article(), "https://a.com/a.css", None, ResourceKind::Style, b"body{}", true)
            .await
            .unwrap_err();
        assert!(matches!(err, PreserveError::StoreWriteFailed { .. }));
    }
}
