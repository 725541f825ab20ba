//! Command-line interface definitions for Article Vault.
//!
//! Global options locate the catalog and override the YAML settings; each
//! subcommand maps onto one catalog or orchestrator operation.

use chrono::{DateTime, Utc};
use clap::{ArgGroup, Args, Parser, Subcommand};
use std::path::PathBuf;

/// Command-line arguments for Article Vault.
///
/// # Examples
///
/// ```sh
/// article_vault add-feed --name toutenrab --url https://twitter.com/toutenrab
/// article_vault add-urls --feed toutenrab https://example.com/2017/story.html
/// article_vault tag --id 1 --release-date 2017-11-05T12:00:00Z
/// article_vault --storage-root ./vault preserve
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to the JSON catalog of feeds and articles
    #[arg(long, env = "ARTICLE_VAULT_CATALOG", default_value = "catalog.json", global = true)]
    pub catalog: PathBuf,

    /// Optional path to config.yaml file
    #[arg(short, long, env = "ARTICLE_VAULT_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Root directory of the resource store
    #[arg(long, env = "ARTICLE_VAULT_STORAGE_ROOT", global = true)]
    pub storage_root: Option<PathBuf>,

    /// Public base URL of the hosting site
    #[arg(long, env = "ARTICLE_VAULT_SITE_DOMAIN", global = true)]
    pub site_domain: Option<String>,

    /// Custom hosting domain; takes precedence over the site domain
    #[arg(long, env = "ARTICLE_VAULT_CUSTOM_DOMAIN", global = true)]
    pub custom_domain: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Register (or update) a feed
    AddFeed {
        #[arg(long)]
        name: String,
        #[arg(long)]
        url: String,
        /// Keep the feed but do not poll it
        #[arg(long)]
        inactive: bool,
    },
    /// Create articles for new URLs of a feed
    AddUrls {
        #[arg(long)]
        feed: String,
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Tag an article
    Tag(TagArgs),
    /// Preserve articles (every article of the catalog when no id is given)
    Preserve { ids: Vec<u64> },
    /// Mark articles as being archived
    SetArchiving {
        #[arg(required = true)]
        ids: Vec<u64>,
    },
    /// Record the archived URL of an article and mark it archived
    Archived {
        #[arg(long)]
        id: u64,
        #[arg(long)]
        url: String,
    },
    /// Print the state of every article
    Status,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("tag").required(true).args(["priority", "release_date", "not_found_only"])))]
pub struct TagArgs {
    #[arg(long)]
    pub id: u64,
    #[arg(long)]
    pub priority: bool,
    /// RFC 3339 timestamp, e.g. 2017-11-05T12:00:00Z
    #[arg(long)]
    pub release_date: Option<DateTime<Utc>>,
    #[arg(long)]
    pub not_found_only: bool,
}
