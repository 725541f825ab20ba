//! # Article Vault
//!
//! Command-line driver for the preservation pipeline.
//!
//! ## Usage
//!
//! ```sh
//! article_vault --config config.yaml preserve        # every eligible article
//! article_vault preserve 3 4 5                       # a given batch
//! RUST_LOG=article_vault=debug article_vault status
//! ```

use article_vault::catalog::{Catalog, CatalogFile};
use article_vault::config::Settings;
use article_vault::fetcher::build_fetcher;
use article_vault::models::Tag;
use article_vault::orchestrator::Orchestrator;
use article_vault::pipeline::Preserver;
use article_vault::storage::{FsStore, Hosting, ResourceStore};
use article_vault::utils::ensure_writable_dir;
use clap::Parser;
use std::error::Error;
use tracing::{debug, error, info, instrument};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod cli;

use cli::{Cli, Command, TagArgs};

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    let args = Cli::parse();
    debug!(?args, "Parsed CLI arguments");

    let settings = load_settings(&args).await?;
    let catalog_path = args.catalog.as_path();

    // Mutating commands reload and save under the catalog lock, so
    // concurrent invocations never overwrite each other.
    match args.command {
        Command::AddFeed { name, url, inactive } => {
            Catalog::update(catalog_path, |catalog| catalog.add_feed(&name, &url, !inactive)).await?;
        }
        Command::AddUrls { feed, urls } => {
            let pairs: Vec<(String, String)> = urls.into_iter().map(|u| (feed.clone(), u)).collect();
            let created = Catalog::update(catalog_path, |catalog| catalog.save_urls(&pairs)).await?;
            for article in created {
                println!("{}\t{}", article.id, article.url);
            }
        }
        Command::Tag(TagArgs {
            id,
            priority,
            release_date,
            not_found_only,
        }) => {
            Catalog::update(catalog_path, |catalog| {
                if priority {
                    catalog.add_tag(id, Tag::Priority(true))?;
                }
                if let Some(date) = release_date {
                    catalog.add_tag(id, Tag::ReleaseDate(date))?;
                }
                if not_found_only {
                    catalog.add_tag(id, Tag::NotFoundOnly(true))?;
                }
                Ok(())
            })
            .await?;
        }
        Command::Preserve { ids } => {
            let ids = if ids.is_empty() {
                Catalog::load(catalog_path).await?.ids()
            } else {
                ids
            };
            if let Err(e) = ensure_writable_dir(&settings.storage_root).await {
                error!(
                    path = %settings.storage_root.display(),
                    error = %e,
                    "Storage root is not writable (fix perms or choose a different path)"
                );
                return Err(e);
            }

            let store = ResourceStore::new(
                FsStore::new(&settings.storage_root),
                Hosting::new(settings.site_domain.clone(), settings.custom_domain.clone()),
            );
            let preserver = Preserver::new(build_fetcher(&settings.fetch)?, store, settings.resource_concurrency);
            let ledger = CatalogFile::new(catalog_path);
            let orchestrator = Orchestrator::new(&ledger, &preserver, settings.article_concurrency);

            let done = orchestrator.crawl_resources(ids).await;
            println!("{}", done.iter().map(u64::to_string).collect::<Vec<_>>().join(" "));
        }
        Command::SetArchiving { ids } => {
            Catalog::update(catalog_path, |catalog| catalog.set_archiving(&ids)).await?;
        }
        Command::Archived { id, url } => {
            Catalog::update(catalog_path, |catalog| {
                catalog.add_archived_url(id, &url)?;
                catalog.set_archived(&[id])
            })
            .await?;
        }
        Command::Status => {
            for article in Catalog::load(catalog_path).await?.all() {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    article.id,
                    article.preservation_state,
                    article.archiving_state,
                    article.resources_dir(),
                    article.url
                );
            }
            return Ok(());
        }
    }

    let elapsed = start_time.elapsed();
    info!(?elapsed, "Execution complete");
    Ok(())
}

/// YAML settings with the command-line overrides applied.
async fn load_settings(args: &Cli) -> Result<Settings, Box<dyn Error>> {
    let mut settings = Settings::load(args.config.as_deref()).await?;
    if let Some(root) = &args.storage_root {
        settings.storage_root = root.clone();
    }
    if let Some(domain) = &args.site_domain {
        settings.site_domain = domain.clone();
    }
    if let Some(domain) = &args.custom_domain {
        settings.custom_domain = Some(domain.clone());
    }
    settings.validate()?;
    Ok(settings)
}
