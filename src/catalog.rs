use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::channel::ExtractionOutcome;

const BACKUP_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S-%3fZ";

/// Last known good endpoint of one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub logo: Option<String>,
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Fields written by other tools, kept as is
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

const fn default_success() -> bool {
    true
}

impl CatalogEntry {
    fn from_outcome(outcome: &ExtractionOutcome, endpoint: &str) -> Self {
        Self {
            id: outcome.id.clone(),
            name: outcome.name.clone(),
            url: Some(endpoint.to_string()),
            logo: outcome.logo.clone(),
            success: true,
            updated_at: Some(Utc::now()),
            extra: Map::new(),
        }
    }
}

/// Channel id to catalog entry, in file order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
    index: HashMap<String, usize>,
}

impl Catalog {
    /// Builds a catalog, keying entries without an id by their name
    ///
    /// Later duplicates replace earlier ones in place.
    #[must_use]
    pub fn from_entries(entries: Vec<CatalogEntry>) -> Self {
        let mut catalog = Self::default();
        for mut entry in entries {
            if entry.id.is_empty() {
                if entry.name.is_empty() {
                    warn!("Dropping catalog entry without id or name");
                    continue;
                }
                entry.id.clone_from(&entry.name);
            }

            match catalog.index.get(&entry.id) {
                Some(&i) => catalog.entries[i] = entry,
                None => catalog.push(entry),
            }
        }
        catalog
    }

    /// Reads the catalog at `path`
    ///
    /// A missing, unreadable or malformed file yields an empty catalog.
    #[instrument]
    pub async fn load(path: &Path) -> Self {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No catalog at {}, starting fresh", path.display());
                return Self::default();
            }
            Err(e) => {
                warn!("Unable to read catalog {}: {e}. Starting fresh", path.display());
                return Self::default();
            }
        };

        match serde_json::from_slice::<Vec<CatalogEntry>>(&raw) {
            Ok(entries) => {
                let catalog = Self::from_entries(entries);
                debug!("Loaded {} catalog entries", catalog.len());
                catalog
            }
            Err(e) => {
                warn!("Catalog {} is invalid ({e}). Starting fresh", path.display());
                Self::default()
            }
        }
    }

    /// Writes the catalog to `path` through a temporary sibling file
    ///
    /// # Errors
    /// Errors when the file cannot be serialized, written or moved into place
    #[instrument(skip(self))]
    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.entries).context("Serializing catalog")?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Creating {}", parent.display()))?;
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Replacing {}", path.display()))?;

        Ok(())
    }

    /// Folds successful outcomes into the catalog and returns how many entries
    /// were added or changed
    ///
    /// Failed outcomes and channels absent from `outcomes` leave their entries alone.
    pub fn reconcile(&mut self, outcomes: &[ExtractionOutcome]) -> usize {
        let mut changed = 0;
        for outcome in outcomes {
            let Some(endpoint) = outcome.endpoint() else {
                continue;
            };

            match self.index.get(&outcome.id) {
                Some(&i) => {
                    let entry = &mut self.entries[i];
                    if entry.url.as_deref() != Some(endpoint) {
                        debug!("Updating {}: {:?} -> {endpoint}", entry.id, entry.url);
                        entry.url = Some(endpoint.to_string());
                        entry.success = true;
                        entry.updated_at = Some(Utc::now());
                        changed += 1;
                    }
                }
                None => {
                    debug!("Adding {} -> {endpoint}", outcome.id);
                    self.push(CatalogEntry::from_outcome(outcome, endpoint));
                    changed += 1;
                }
            }
        }
        changed
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&CatalogEntry> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    #[must_use]
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, entry: CatalogEntry) {
        self.index.insert(entry.id.clone(), self.entries.len());
        self.entries.push(entry);
    }
}

/// Copies the current catalog file into `backup_dir` under a timestamped name
///
/// Returns `None` when there is no catalog file to back up yet.
///
/// # Errors
/// Errors when the backup directory cannot be created or the copy fails
#[instrument]
pub async fn backup_catalog(path: &Path, backup_dir: &Path) -> Result<Option<PathBuf>> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(None);
    }

    tokio::fs::create_dir_all(backup_dir)
        .await
        .with_context(|| format!("Creating {}", backup_dir.display()))?;

    let name = format!("channels.{}.json", Utc::now().format(BACKUP_TIMESTAMP_FORMAT));
    let target = backup_dir.join(name);
    tokio::fs::copy(path, &target)
        .await
        .with_context(|| format!("Backing up {} to {}", path.display(), target.display()))?;

    info!("Backup created: {}", target.display());
    Ok(Some(target))
}

/// Deletes backups whose timestamp is older than `max_age`, returning how many
///
/// Files not named like a backup are left alone.
///
/// # Errors
/// Errors when the directory cannot be listed or a backup cannot be removed
#[instrument]
pub async fn prune_backups(backup_dir: &Path, max_age: TimeDelta) -> Result<usize> {
    let mut dir = match tokio::fs::read_dir(backup_dir).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("Listing {}", backup_dir.display())),
    };

    let cutoff = Utc::now() - max_age;
    let mut removed = 0;
    while let Some(file) = dir.next_entry().await? {
        let name = file.file_name();
        let Some(taken_at) = name.to_str().and_then(backup_timestamp) else {
            continue;
        };
        if taken_at < cutoff {
            tokio::fs::remove_file(file.path())
                .await
                .with_context(|| format!("Removing {}", file.path().display()))?;
            removed += 1;
        }
    }

    if removed > 0 {
        info!("Deleted {removed} old catalog backup(s)");
    }
    Ok(removed)
}

fn backup_timestamp(file_name: &str) -> Option<DateTime<Utc>> {
    let stamp = file_name.strip_prefix("channels.")?.strip_suffix(".json")?;
    NaiveDateTime::parse_from_str(stamp, BACKUP_TIMESTAMP_FORMAT)
        .ok()
        .map(|t| t.and_utc())
}

/// Renders the catalog as an extended M3U playlist
#[must_use]
pub fn render_playlist(catalog: &Catalog) -> String {
    let mut lines = vec!["#EXTM3U".to_string()];
    for entry in catalog.entries() {
        let Some(url) = &entry.url else {
            continue;
        };
        lines.push(format!(
            "#EXTINF:-1 tvg-id=\"{}\" tvg-name=\"{}\" tvg-logo=\"{}\",{}",
            playlist_attr(&entry.id),
            playlist_attr(&entry.name),
            playlist_attr(entry.logo.as_deref().unwrap_or_default()),
            single_line(&entry.name)
        ));
        lines.push(single_line(url));
    }
    lines.join("\n")
}

/// M3U has no escape syntax, so a double quote would end the attribute early
fn playlist_attr(value: &str) -> String {
    single_line(value).replace('"', "'")
}

fn single_line(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}
