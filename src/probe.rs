use std::time::Duration;

use anyhow::{Context, Result, anyhow, ensure};
use m3u8_rs::Playlist;
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::{debug, instrument};

/// Fetches a discovered endpoint and checks it actually serves an HLS playlist
#[derive(Debug, Clone)]
pub struct ManifestProbe {
    client: reqwest::Client,
}

impl ManifestProbe {
    /// # Errors
    /// Errors when the HTTP client cannot be built
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: init_http_client(timeout)?,
        })
    }

    /// # Errors
    /// Errors when the endpoint is unreachable, answers with a non-success
    /// status, or does not serve a usable playlist
    #[instrument(skip(self))]
    pub async fn verify(&self, url: &str) -> Result<()> {
        let res = self
            .client
            .get(url)
            .send()
            .await
            .context("Fetching manifest")?;
        ensure!(
            res.status().is_success(),
            "Manifest request returned {}",
            res.status()
        );

        let body = res.bytes().await.context("Reading manifest body")?;
        check_playlist(&body)
    }
}

/// Accepts a master playlist with at least one variant, or a media playlist
/// with at least one segment
///
/// # Errors
/// Errors when the bytes are not an HLS playlist or the playlist is empty
pub fn check_playlist(body: &[u8]) -> Result<()> {
    let playlist = m3u8_rs::parse_playlist_res(body)
        .map_err(|e| anyhow!("Not an HLS playlist: {e:?}"))?;

    match playlist {
        Playlist::MasterPlaylist(master) => {
            debug!("Master playlist with {} variant(s)", master.variants.len());
            ensure!(!master.variants.is_empty(), "Master playlist has no variants");
        }
        Playlist::MediaPlaylist(media) => {
            debug!("Media playlist with {} segment(s)", media.segments.len());
            ensure!(!media.segments.is_empty(), "Media playlist has no segments");
        }
    }

    Ok(())
}

fn init_http_client(timeout: Duration) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(
        "User-Agent",
        HeaderValue::from_str(&format!(
            "{}/{} (+{})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("CARGO_PKG_REPOSITORY")
        ))?,
    );

    reqwest::Client::builder()
        .default_headers(headers)
        .connect_timeout(Duration::from_secs(10))
        .timeout(timeout)
        .build()
        .context("Building HTTP client")
}
