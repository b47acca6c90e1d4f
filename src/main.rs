#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::cargo)]
#![warn(clippy::perf)]
#![warn(clippy::complexity)]
#![warn(clippy::style)]
#![allow(clippy::multiple_crate_versions)]

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use browser::{ChromeInstance, ChromeOptions};
use catalog::{Catalog, backup_catalog, prune_backups, render_playlist};
use channel::{filter_channels, load_channels};
use chrono::TimeDelta;
use clap::Parser;
use extractor::{DEFAULT_TRIGGER_SELECTOR, EndpointMatcher, ExtractionConfig, extract_pooled};
use pool::InstancePool;
use probe::ManifestProbe;
use scheduler::{SchedulePolicy, Scheduler};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use util::spawn_ct_watcher;

pub mod browser;
pub mod catalog;
pub mod channel;
pub mod extractor;
pub mod pool;
pub mod probe;
pub mod scheduler;
pub mod util;

/// Ten years, well inside what `TimeDelta::hours` accepts
const MAX_BACKUP_RETENTION_HOURS: i64 = 24 * 365 * 10;

/// Finds the live HLS endpoint of every channel and updates the channel catalog
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Only scout these channel ids (defaults to every channel in the list)
    channels: Vec<String>,

    /// Directory holding the channel list, catalog and backups
    #[arg(long, env = "STREAM_SCOUT_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Channel list to scout [default: <DATA_DIR>/as.json]
    #[arg(long, env = "STREAM_SCOUT_CHANNEL_LIST")]
    channel_list: Option<PathBuf>,

    /// Catalog to update [default: <DATA_DIR>/channels.json]
    #[arg(long, env = "STREAM_SCOUT_CATALOG")]
    catalog: Option<PathBuf>,

    /// Number of browser instances kept running
    #[arg(long, env = "STREAM_SCOUT_POOL_SIZE", default_value_t = 2, value_parser = clap::value_parser!(u16).range(1..))]
    pool_size: u16,

    /// Channels processed at once in the first pass
    #[arg(short, long, env = "STREAM_SCOUT_CONCURRENCY", default_value_t = 4, value_parser = clap::value_parser!(u16).range(1..))]
    concurrency: u16,

    /// Channels processed at once when retrying failures
    #[arg(long, env = "STREAM_SCOUT_RETRY_CONCURRENCY", default_value_t = 2, value_parser = clap::value_parser!(u16).range(1..))]
    retry_concurrency: u16,

    /// Seconds to wait for a channel page to load
    #[arg(long, env = "STREAM_SCOUT_NAVIGATION_TIMEOUT", default_value_t = 20)]
    navigation_timeout: u64,

    /// Seconds to look for a play button
    #[arg(long, env = "STREAM_SCOUT_TRIGGER_WAIT", default_value_t = 5)]
    trigger_wait: u64,

    /// Milliseconds to wait after clicking play
    #[arg(long, env = "STREAM_SCOUT_CLICK_SETTLE_MS", default_value_t = 1000)]
    click_settle_ms: u64,

    /// Seconds to watch network traffic for an endpoint
    #[arg(long, env = "STREAM_SCOUT_OBSERVE", default_value_t = 10)]
    observe: u64,

    /// Milliseconds between two reads of the network traffic
    #[arg(long, env = "STREAM_SCOUT_POLL_INTERVAL_MS", default_value_t = 500)]
    poll_interval_ms: u64,

    /// Regex an endpoint URL has to match
    #[arg(long, env = "STREAM_SCOUT_ENDPOINT_PATTERN", default_value = r"\.m3u8")]
    endpoint_pattern: String,

    /// Host (or parent domain) endpoints have to be served from
    #[arg(long, env = "STREAM_SCOUT_ENDPOINT_ORIGIN", default_value = "thetvapp.to")]
    endpoint_origin: String,

    /// CSS selector of the element that starts playback
    #[arg(long, env = "STREAM_SCOUT_TRIGGER_SELECTOR", default_value = DEFAULT_TRIGGER_SELECTOR)]
    trigger_selector: String,

    /// Chromium executable (searched on PATH when omitted)
    #[arg(long, env = "STREAM_SCOUT_CHROME")]
    chrome: Option<PathBuf>,

    /// Fetch every endpoint found and reject it unless it is a valid HLS playlist
    #[arg(long, env = "STREAM_SCOUT_PROBE")]
    probe: bool,

    /// Do not back up the catalog before rewriting it
    #[arg(long)]
    no_backup: bool,

    /// Hours a catalog backup is kept
    #[arg(long, env = "STREAM_SCOUT_BACKUP_RETENTION_HOURS", default_value_t = 24, value_parser = clap::value_parser!(i64).range(1..=MAX_BACKUP_RETENTION_HOURS))]
    backup_retention_hours: i64,

    /// Also write the catalog as an M3U playlist to this path
    #[arg(long, env = "STREAM_SCOUT_PLAYLIST")]
    playlist: Option<PathBuf>,
}

impl Args {
    fn channel_list_path(&self) -> PathBuf {
        self.channel_list
            .clone()
            .unwrap_or_else(|| self.data_dir.join("as.json"))
    }

    fn catalog_path(&self) -> PathBuf {
        self.catalog
            .clone()
            .unwrap_or_else(|| self.data_dir.join("channels.json"))
    }

    fn backup_dir(&self) -> PathBuf {
        self.data_dir.join("channels.backups")
    }

    fn extraction_config(&self) -> Result<ExtractionConfig> {
        let matcher = EndpointMatcher::new(&self.endpoint_pattern, &self.endpoint_origin)?;
        let mut config = ExtractionConfig::new(matcher);
        config.navigation_timeout = Duration::from_secs(self.navigation_timeout);
        config.trigger_selector.clone_from(&self.trigger_selector);
        config.trigger_wait = Duration::from_secs(self.trigger_wait);
        config.click_settle = Duration::from_millis(self.click_settle_ms);
        config.observation_window = Duration::from_secs(self.observe);
        config.poll_interval = Duration::from_millis(self.poll_interval_ms.max(1));
        if self.probe {
            config.probe = Some(ManifestProbe::new(Duration::from_secs(self.navigation_timeout))?);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let started = Instant::now();

    let channels = load_channels(&args.channel_list_path()).await?;
    let channels = filter_channels(channels, &args.channels);
    info!("Scouting {} channel(s)", channels.len());

    let catalog_path = args.catalog_path();
    let mut catalog = Catalog::load(&catalog_path).await;

    let config = Arc::new(args.extraction_config()?);
    let policy = SchedulePolicy::new(args.concurrency.into(), args.retry_concurrency.into())?;

    let chrome = ChromeOptions {
        executable: args.chrome.clone(),
        request_timeout: config.navigation_timeout,
    };
    let pool = InstancePool::launch(args.pool_size.into(), |index| {
        let chrome = chrome.clone();
        async move { ChromeInstance::launch(index, &chrome).await }
    })
    .await
    .context("Unable to start browser pool")?;

    let ct = CancellationToken::new();
    spawn_ct_watcher(ct.clone());

    let report = {
        let pool = Arc::clone(&pool);
        Scheduler::new(policy, ct)
            .with_progress()
            .run(channels, move |channel, attempt| {
                extract_pooled(Arc::clone(&pool), channel, Arc::clone(&config), attempt)
            })
            .await
    };
    pool.shutdown().await;

    for outcome in report.outcomes.iter().filter(|o| !o.is_success()) {
        if let Some(reason) = outcome.error() {
            warn!("Failed: {} ({reason})", outcome.name);
        }
    }

    let updated = catalog.reconcile(&report.outcomes);

    if !args.no_backup {
        let backup_dir = args.backup_dir();
        backup_catalog(&catalog_path, &backup_dir).await?;
        prune_backups(&backup_dir, TimeDelta::hours(args.backup_retention_hours)).await?;
    }
    catalog
        .save(&catalog_path)
        .await
        .context("Saving catalog")?;

    if let Some(playlist) = &args.playlist {
        tokio::fs::write(playlist, render_playlist(&catalog))
            .await
            .with_context(|| format!("Writing playlist {}", playlist.display()))?;
        info!("Playlist written to {}", playlist.display());
    }

    info!(
        "{} succeeded, {} failed after retry ({} failed initially)",
        report.succeeded(),
        report.final_failures,
        report.initial_failures
    );
    info!("Updated {updated} channel(s) in {}", catalog_path.display());
    info!("Total time: {:.2} seconds", started.elapsed().as_secs_f64());

    Ok(())
}
