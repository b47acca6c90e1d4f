use std::{collections::HashSet, fmt, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{instrument, warn};

/// A channel to scout, as listed in the channel list file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "channel", alias = "name")]
    pub name: String,
    /// Page hosting the channel's player
    pub url: String,
    #[serde(
        default,
        rename = "thumb",
        alias = "logo",
        skip_serializing_if = "Option::is_none"
    )]
    pub logo: Option<String>,
}

impl ChannelDescriptor {
    /// Identity of the channel within a run. Falls back to the display name.
    #[must_use]
    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.name)
    }
}

/// Reads the channel list, keeping the first occurrence of every id
///
/// # Errors
/// Errors when the file cannot be read or is not a JSON list of channels
#[instrument]
pub async fn load_channels(path: &Path) -> Result<Vec<ChannelDescriptor>> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("Reading channel list {}", path.display()))?;
    let channels = serde_json::from_slice::<Vec<ChannelDescriptor>>(&raw)
        .with_context(|| format!("Parsing channel list {}", path.display()))?;

    Ok(dedup_channels(channels))
}

/// Drops channels whose id was already seen earlier in the list
#[must_use]
pub fn dedup_channels(channels: Vec<ChannelDescriptor>) -> Vec<ChannelDescriptor> {
    let mut seen = HashSet::new();
    channels
        .into_iter()
        .filter(|c| {
            let fresh = seen.insert(c.id().to_string());
            if !fresh {
                warn!("Duplicate channel `{}` in channel list, ignoring", c.id());
            }
            fresh
        })
        .collect()
}

/// Keeps only the channels named in `only`. An empty filter keeps everything.
#[must_use]
pub fn filter_channels(channels: Vec<ChannelDescriptor>, only: &[String]) -> Vec<ChannelDescriptor> {
    if only.is_empty() {
        return channels;
    }

    for wanted in only {
        if !channels.iter().any(|c| c.id() == wanted) {
            warn!("Channel `{wanted}` is not in the channel list");
        }
    }

    channels
        .into_iter()
        .filter(|c| only.iter().any(|w| w == c.id()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Initial,
    Retry,
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => f.write_str("initial"),
            Self::Retry => f.write_str("retry"),
        }
    }
}

/// Why a single extraction attempt did not produce an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("navigation timed out after {0}s")]
    NavigationTimeout(u64),
    #[error("no endpoint found")]
    NoEndpoint,
    #[error("endpoint {url} is not a playable manifest: {detail}")]
    InvalidManifest { url: String, detail: String },
    #[error("unexpected error: {0}")]
    Unexpected(String),
    #[error("no browser instance available: {0}")]
    PoolUnavailable(String),
    #[error("cancelled before the attempt started")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeStatus {
    Found {
        endpoint: String,
    },
    /// Carries the descriptor so the channel can be resubmitted as is
    Failed {
        reason: FailureReason,
        channel: ChannelDescriptor,
    },
}

/// Result of one extraction attempt for one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionOutcome {
    pub id: String,
    pub name: String,
    pub logo: Option<String>,
    pub attempt: Attempt,
    pub status: OutcomeStatus,
}

impl ExtractionOutcome {
    #[must_use]
    pub fn found(channel: &ChannelDescriptor, attempt: Attempt, endpoint: String) -> Self {
        debug_assert!(!endpoint.is_empty());
        Self {
            id: channel.id().to_string(),
            name: channel.name.clone(),
            logo: channel.logo.clone(),
            attempt,
            status: OutcomeStatus::Found { endpoint },
        }
    }

    #[must_use]
    pub fn failed(channel: ChannelDescriptor, attempt: Attempt, reason: FailureReason) -> Self {
        Self {
            id: channel.id().to_string(),
            name: channel.name.clone(),
            logo: channel.logo.clone(),
            attempt,
            status: OutcomeStatus::Failed { reason, channel },
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.status, OutcomeStatus::Found { .. })
    }

    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        match &self.status {
            OutcomeStatus::Found { endpoint } => Some(endpoint),
            OutcomeStatus::Failed { .. } => None,
        }
    }

    #[must_use]
    pub const fn error(&self) -> Option<&FailureReason> {
        match &self.status {
            OutcomeStatus::Found { .. } => None,
            OutcomeStatus::Failed { reason, .. } => Some(reason),
        }
    }

    /// The descriptor the attempt was made for, present only on failures
    #[must_use]
    pub const fn retry_descriptor(&self) -> Option<&ChannelDescriptor> {
        match &self.status {
            OutcomeStatus::Found { .. } => None,
            OutcomeStatus::Failed { channel, .. } => Some(channel),
        }
    }
}
