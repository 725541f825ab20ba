//! Feed, article, tag and archived-URL catalog.
//!
//! A JSON-file backed stand-in for the relational layer the pipeline reports
//! to. All state lives behind one mutex so that each batch transition
//! (`set_preserving`, `set_crawled`, ...) is a single critical section:
//! either every id of the batch changes or none does.
//!
//! Across processes the catalog file is guarded by an exclusive lock on a
//! sibling `<catalog>.lock` file: [`Catalog::update`] holds it for one
//! load/change/save cycle, and [`CatalogFile`] uses it so that a batch
//! claim is on disk before any fetch work starts.

use crate::error::PreserveError;
use crate::models::{
    ArchivedArticle, ArchivingState, Article, ArticleId, Feed, PreservationState, Tag,
};
use chrono::Utc;
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::fs;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Hosts whose account pages are accepted as feeds.
const SOCIAL_HOSTS: &[&str] = &[
    "twitter.com",
    "x.com",
    "facebook.com",
    "instagram.com",
    "youtube.com",
];

const FEED_EXTENSIONS: &[&str] = &[".xml", ".rss", ".atom"];
const FEED_SEGMENTS: &[&str] = &["rss", "feed", "feeds", "atom"];

/// Whether `url` names something a feed poller can follow: a social
/// account page or a syndication document.
///
/// ```ignore
/// assert!(valid_feed_url("https://twitter.com/toutenrab"));
/// assert!(!valid_feed_url("https://twitter.com/"));
/// ```
pub fn valid_feed_url(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.trim_start_matches("www.").trim_start_matches("mobile.");
    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();

    if SOCIAL_HOSTS.contains(&host) {
        return !segments.is_empty();
    }
    segments.iter().any(|seg| {
        let seg = seg.to_ascii_lowercase();
        FEED_SEGMENTS.contains(&seg.as_str()) || FEED_EXTENSIONS.iter().any(|ext| seg.ends_with(ext))
    })
}

/// Tag predicate shared by preservation and archiving selection: release
/// date or priority known, and not flagged as "not found only".
pub fn tagged_for_preservation(article: &Article) -> bool {
    (article.has_release_date() || article.has_priority()) && !article.is_not_found_only()
}

/// Decides whether an article should be picked up by a preservation run.
pub trait EligibilityPolicy {
    fn is_eligible(&self, article: &Article) -> bool;
}

/// The tag-driven policy: tagged for preservation and not stored yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct TagPolicy;

impl EligibilityPolicy for TagPolicy {
    fn is_eligible(&self, article: &Article) -> bool {
        tagged_for_preservation(article) && !article.stored
    }
}

/// Where a preservation run commits its two batch transitions.
///
/// `claim` must be durable before it returns: it is what keeps a second
/// run away from the same articles.
pub trait BatchLedger {
    /// Select the eligible, idle articles among `ids`, mark them
    /// `PRESERVING` and return them.
    async fn claim(
        &self,
        ids: &[ArticleId],
        policy: &impl EligibilityPolicy,
    ) -> Result<Vec<Article>, PreserveError>;

    /// Stamp `ids` as crawled and stored.
    async fn finish(&self, ids: &[ArticleId]) -> Result<(), PreserveError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogData {
    #[serde(default)]
    feeds: Vec<Feed>,
    #[serde(default)]
    articles: BTreeMap<ArticleId, Article>,
    #[serde(default)]
    archived: Vec<ArchivedArticle>,
    #[serde(default)]
    next_id: ArticleId,
}

impl CatalogData {
    /// Fail with the first id that is not in the catalog.
    fn check_known(&self, ids: &[ArticleId]) -> Result<(), PreserveError> {
        match ids.iter().find(|id| !self.articles.contains_key(id)) {
            Some(&id) => Err(PreserveError::UnknownArticle(id)),
            None => Ok(()),
        }
    }

    /// Apply `change` to every article of `ids`, or to none of them.
    fn update_all(
        &mut self,
        ids: &[ArticleId],
        mut change: impl FnMut(&mut Article),
    ) -> Result<(), PreserveError> {
        self.check_known(ids)?;
        for id in ids {
            if let Some(article) = self.articles.get_mut(id) {
                change(article);
            }
        }
        Ok(())
    }

    fn set_crawled(&mut self, ids: &[ArticleId]) -> Result<(), PreserveError> {
        let now = Utc::now();
        self.update_all(ids, |article| {
            article.preservation_state = if article.has_release_date() {
                PreservationState::Preserve
            } else {
                PreservationState::NoPreserve
            };
            article.crawled_at = Some(now);
        })
    }

    fn set_stored(&mut self, ids: &[ArticleId]) -> Result<(), PreserveError> {
        self.update_all(ids, |article| article.stored = true)
    }
}

/// In-process catalog of feeds and articles.
#[derive(Debug, Default)]
pub struct Catalog {
    data: Mutex<CatalogData>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn data(&self) -> MutexGuard<'_, CatalogData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load a catalog file. A missing file is an empty catalog.
    #[instrument(level = "info", skip_all, fields(path = %path.display()))]
    pub async fn load(path: &Path) -> Result<Self, PreserveError> {
        let raw = match fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No catalog yet; starting empty");
                return Ok(Self::new());
            }
            Err(e) => return Err(PreserveError::Catalog(format!("reading {}: {e}", path.display()))),
        };
        let data: CatalogData = serde_json::from_str(&raw)
            .map_err(|e| PreserveError::Catalog(format!("parsing {}: {e}", path.display())))?;
        info!(feeds = data.feeds.len(), articles = data.articles.len(), "Loaded catalog");
        Ok(Self {
            data: Mutex::new(data),
        })
    }

    /// Write the catalog as pretty JSON, creating parent directories. The
    /// file is replaced in one rename, so readers never see a partial write.
    #[instrument(level = "info", skip_all, fields(path = %path.display()))]
    pub async fn save(&self, path: &Path) -> Result<(), PreserveError> {
        let json = {
            let data = self.data();
            serde_json::to_string_pretty(&*data)
                .map_err(|e| PreserveError::Catalog(format!("serializing catalog: {e}")))?
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| PreserveError::Catalog(format!("creating {}: {e}", parent.display())))?;
        }
        let tmp = sibling(path, ".tmp");
        fs::write(&tmp, json)
            .await
            .map_err(|e| PreserveError::Catalog(format!("writing {}: {e}", tmp.display())))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| PreserveError::Catalog(format!("replacing {}: {e}", path.display())))?;
        debug!("Saved catalog");
        Ok(())
    }

    /// Run `change` against the on-disk catalog at `path` while holding the
    /// catalog lock, and save the result.
    ///
    /// # Arguments
    ///
    /// * `path` - Catalog file; a missing file starts empty
    /// * `change` - Mutation to apply; its error aborts without saving
    ///
    /// # Returns
    ///
    /// Whatever `change` returned, once the catalog is saved.
    ///
    /// # Errors
    ///
    /// [`PreserveError::Catalog`] when the lock, load or save fails, or the
    /// error of `change`.
    pub async fn update<T>(
        path: &Path,
        change: impl FnOnce(&Catalog) -> Result<T, PreserveError>,
    ) -> Result<T, PreserveError> {
        let _lock = CatalogLock::acquire(path).await?;
        let catalog = Catalog::load(path).await?;
        let out = change(&catalog)?;
        catalog.save(path).await?;
        Ok(out)
    }

    // ---- feeds ----

    /// Register a feed, or update the URL and activity of an existing one.
    pub fn add_feed(&self, name: &str, url: &str, active: bool) -> Result<Feed, PreserveError> {
        if !valid_feed_url(url) {
            return Err(PreserveError::InvalidFeedUrl(url.to_string()));
        }
        let feed = Feed {
            name: name.to_string(),
            url: url.to_string(),
            active,
        };
        let mut data = self.data();
        match data.feeds.iter_mut().find(|f| f.name == name) {
            Some(existing) => *existing = feed.clone(),
            None => data.feeds.push(feed.clone()),
        }
        info!(feed = %name, %url, active, "Registered feed");
        Ok(feed)
    }

    pub fn active_feeds(&self) -> Vec<Feed> {
        self.data().feeds.iter().filter(|f| f.active).cloned().collect()
    }

    // ---- articles ----

    /// Create articles for the `(feed, url)` pairs not in the catalog yet.
    /// Duplicates, within the input or against stored articles, are no-ops.
    pub fn save_urls(&self, urls: &[(String, String)]) -> Result<Vec<Article>, PreserveError> {
        let mut data = self.data();
        if let Some((feed, _)) = urls.iter().find(|(feed, _)| !data.feeds.iter().any(|f| &f.name == feed)) {
            return Err(PreserveError::UnknownFeed(feed.clone()));
        }

        let mut seen: HashSet<(String, String)> = data
            .articles
            .values()
            .map(|a| (a.feed.clone(), a.url.clone()))
            .collect();
        let mut created = Vec::new();
        for (feed, url) in urls {
            if !seen.insert((feed.clone(), url.clone())) {
                continue;
            }
            data.next_id += 1;
            let article = Article::new(data.next_id, feed, url);
            data.articles.insert(article.id, article.clone());
            created.push(article);
        }
        info!(given = urls.len(), created = created.len(), "Saved article URLs");
        Ok(created)
    }

    pub fn get(&self, id: ArticleId) -> Option<Article> {
        self.data().articles.get(&id).cloned()
    }

    /// Every article, by id.
    pub fn all(&self) -> Vec<Article> {
        self.data().articles.values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<ArticleId> {
        self.data().articles.keys().copied().collect()
    }

    // ---- tags ----

    pub fn add_tag(&self, id: ArticleId, tag: Tag) -> Result<(), PreserveError> {
        let mut data = self.data();
        let article = data
            .articles
            .get_mut(&id)
            .ok_or(PreserveError::UnknownArticle(id))?;
        article.tags.push(tag);
        Ok(())
    }

    fn select(&self, predicate: impl Fn(&Article) -> bool) -> Vec<ArticleId> {
        self.data()
            .articles
            .values()
            .filter(|a| predicate(a))
            .map(|a| a.id)
            .collect()
    }

    pub fn release_date_tagged(&self) -> Vec<ArticleId> {
        self.select(Article::has_release_date)
    }

    pub fn priority_tagged(&self) -> Vec<ArticleId> {
        self.select(Article::has_priority)
    }

    pub fn not_found_only_tagged(&self) -> Vec<ArticleId> {
        self.select(Article::is_not_found_only)
    }

    pub fn preservation_tags(&self, id: ArticleId) -> Result<Vec<Tag>, PreserveError> {
        let data = self.data();
        let article = data.articles.get(&id).ok_or(PreserveError::UnknownArticle(id))?;
        Ok(article.preservation_tags().into_iter().cloned().collect())
    }

    // ---- eligibility ----

    pub fn should_be_preserved(&self) -> Vec<ArticleId> {
        self.select(tagged_for_preservation)
    }

    pub fn should_be_archived(&self) -> Vec<ArticleId> {
        self.select(|a| tagged_for_preservation(a) && a.archiving_state == ArchivingState::NotArchived)
    }

    // ---- state mutations ----

    /// Mark a batch `PRESERVING`. Articles already in a final preservation
    /// state reject the whole batch.
    pub fn set_preserving(&self, ids: &[ArticleId]) -> Result<(), PreserveError> {
        let mut data = self.data();
        data.check_known(ids)?;
        if let Some(article) = ids
            .iter()
            .filter_map(|id| data.articles.get(id))
            .find(|a| a.preservation_state.is_final())
        {
            return Err(PreserveError::Catalog(format!(
                "article {} is already {}",
                article.id, article.preservation_state
            )));
        }
        data.update_all(ids, |a| a.preservation_state = PreservationState::Preserving)
    }

    pub fn set_stored(&self, ids: &[ArticleId]) -> Result<(), PreserveError> {
        self.data().set_stored(ids)
    }

    /// Stamp a batch as crawled: `PRESERVE` when a release date is known,
    /// `NO_PRESERVE` otherwise.
    pub fn set_crawled(&self, ids: &[ArticleId]) -> Result<(), PreserveError> {
        self.data().set_crawled(ids)
    }

    pub fn set_archiving(&self, ids: &[ArticleId]) -> Result<(), PreserveError> {
        self.data()
            .update_all(ids, |a| a.archiving_state = ArchivingState::Archiving)
    }

    pub fn set_archived(&self, ids: &[ArticleId]) -> Result<(), PreserveError> {
        self.data()
            .update_all(ids, |a| a.archiving_state = ArchivingState::Archived)
    }

    /// Select the eligible, idle articles among `ids` and mark them
    /// `PRESERVING` in one step. Returns the claimed ids; unknown ids are
    /// skipped.
    pub fn claim_for_preservation(
        &self,
        ids: &[ArticleId],
        policy: &impl EligibilityPolicy,
    ) -> Vec<ArticleId> {
        let mut data = self.data();
        let mut claimed = Vec::new();
        for id in ids {
            let Some(article) = data.articles.get_mut(id) else {
                warn!(article = id, "Unknown article in preservation batch");
                continue;
            };
            let idle = article.preservation_state == PreservationState::NotPreserved;
            if idle && policy.is_eligible(article) && !claimed.contains(id) {
                article.preservation_state = PreservationState::Preserving;
                claimed.push(*id);
            }
        }
        claimed
    }

    /// `set_crawled` and `set_stored` as one transition.
    pub fn finish_preservation(&self, ids: &[ArticleId]) -> Result<(), PreserveError> {
        let mut data = self.data();
        data.check_known(ids)?;
        data.set_crawled(ids)?;
        data.set_stored(ids)
    }

    // ---- archived URLs ----

    pub fn add_archived_url(&self, id: ArticleId, url: &str) -> Result<ArchivedArticle, PreserveError> {
        let mut data = self.data();
        data.check_known(&[id])?;
        let archived = ArchivedArticle {
            article: id,
            url: url.to_string(),
            archived_at: Utc::now(),
        };
        data.archived.push(archived.clone());
        Ok(archived)
    }

    pub fn archived_urls(&self, ids: &[ArticleId]) -> Vec<ArchivedArticle> {
        self.data()
            .archived
            .iter()
            .filter(|a| ids.contains(&a.article))
            .cloned()
            .collect()
    }

    /// Delete the archived URLs of `ids`; returns how many were removed.
    pub fn delete_archived_urls(&self, ids: &[ArticleId]) -> usize {
        let mut data = self.data();
        let before = data.archived.len();
        data.archived.retain(|a| !ids.contains(&a.article));
        before - data.archived.len()
    }
}

impl BatchLedger for Catalog {
    async fn claim(
        &self,
        ids: &[ArticleId],
        policy: &impl EligibilityPolicy,
    ) -> Result<Vec<Article>, PreserveError> {
        let claimed = self.claim_for_preservation(ids, policy);
        Ok(claimed.iter().filter_map(|id| self.get(*id)).collect())
    }

    async fn finish(&self, ids: &[ArticleId]) -> Result<(), PreserveError> {
        self.finish_preservation(ids)
    }
}

/// A catalog file shared between processes.
///
/// Every transition reloads the file under the catalog lock, applies the
/// change and saves before releasing it, so concurrent runs neither claim
/// the same article nor overwrite each other's updates.
#[derive(Debug, Clone)]
pub struct CatalogFile {
    path: PathBuf,
}

impl CatalogFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BatchLedger for CatalogFile {
    async fn claim(
        &self,
        ids: &[ArticleId],
        policy: &impl EligibilityPolicy,
    ) -> Result<Vec<Article>, PreserveError> {
        Catalog::update(&self.path, |catalog| {
            let claimed = catalog.claim_for_preservation(ids, policy);
            Ok(claimed.iter().filter_map(|id| catalog.get(*id)).collect())
        })
        .await
    }

    async fn finish(&self, ids: &[ArticleId]) -> Result<(), PreserveError> {
        Catalog::update(&self.path, |catalog| catalog.finish_preservation(ids)).await
    }
}

/// `<path><suffix>` next to `path`.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Exclusive lock on `<catalog>.lock`, released when dropped.
struct CatalogLock {
    _file: std::fs::File,
}

impl CatalogLock {
    async fn acquire(catalog: &Path) -> Result<Self, PreserveError> {
        let path = sibling(catalog, ".lock");
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| PreserveError::Catalog(format!("creating {}: {e}", parent.display())))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| PreserveError::Catalog(format!("opening {}: {e}", path.display())))?;
        // Waiting happens on the blocking pool so other tasks keep running.
        let file = tokio::task::spawn_blocking(move || file.lock_exclusive().map(|()| file))
            .await
            .map_err(|e| PreserveError::Catalog(format!("waiting for catalog lock: {e}")))?
            .map_err(|e| PreserveError::Catalog(format!("locking {}: {e}", path.display())))?;
        debug!(path = %path.display(), "Acquired catalog lock");
        Ok(Self { _file: file })
    }
}
