use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use regex::Regex;
use reqwest::Url;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    browser::BrowserInstance,
    channel::{Attempt, ChannelDescriptor, ExtractionOutcome, FailureReason},
    pool::InstancePool,
    probe::ManifestProbe,
};

pub const DEFAULT_TRIGGER_SELECTOR: &str = "video, .play-button, [aria-label*='play' i]";

/// Decides whether an observed request URL is the channel's streaming manifest
#[derive(Debug, Clone)]
pub struct EndpointMatcher {
    pattern: Regex,
    origin: String,
}

impl EndpointMatcher {
    /// # Errors
    /// Errors when `pattern` is not a valid regular expression
    pub fn new(pattern: &str, origin: &str) -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(pattern)
                .with_context(|| format!("Compiling endpoint pattern `{pattern}`"))?,
            origin: origin.trim_start_matches('.').to_ascii_lowercase(),
        })
    }

    /// True when `url` matches the pattern and is served from the origin host
    /// or one of its subdomains
    #[must_use]
    pub fn matches(&self, url: &str) -> bool {
        if !self.pattern.is_match(url) {
            return false;
        }
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        parsed.host_str().is_some_and(|host| {
            let host = host.to_ascii_lowercase();
            host == self.origin
                || host
                    .strip_suffix(&self.origin)
                    .is_some_and(|rest| rest.ends_with('.'))
        })
    }
}

/// Timing and matching knobs of the extraction protocol
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub navigation_timeout: Duration,
    pub trigger_selector: String,
    pub trigger_wait: Duration,
    pub trigger_poll_interval: Duration,
    /// Pause after clicking the trigger so the player can start requesting
    pub click_settle: Duration,
    pub observation_window: Duration,
    pub poll_interval: Duration,
    pub matcher: EndpointMatcher,
    pub probe: Option<ManifestProbe>,
}

impl ExtractionConfig {
    #[must_use]
    pub fn new(matcher: EndpointMatcher) -> Self {
        Self {
            navigation_timeout: Duration::from_secs(20),
            trigger_selector: DEFAULT_TRIGGER_SELECTOR.to_string(),
            trigger_wait: Duration::from_secs(5),
            trigger_poll_interval: Duration::from_millis(250),
            click_settle: Duration::from_secs(1),
            observation_window: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
            matcher,
            probe: None,
        }
    }
}

/// Borrows an instance from `pool`, runs one attempt on it and hands it back
///
/// The loan is a guard, so the instance returns to the pool on every exit path.
/// A configured manifest check runs after the instance is back in the pool.
pub async fn extract_pooled<B: BrowserInstance>(
    pool: Arc<InstancePool<B>>,
    channel: ChannelDescriptor,
    config: Arc<ExtractionConfig>,
    attempt: Attempt,
) -> ExtractionOutcome {
    let outcome = {
        let mut instance = match pool.acquire().await {
            Ok(instance) => instance,
            Err(e) => {
                error!("{}: {e:#}", channel.name);
                return ExtractionOutcome::failed(
                    channel,
                    attempt,
                    FailureReason::PoolUnavailable(format!("{e:#}")),
                );
            }
        };
        extract_endpoint(&mut *instance, channel.clone(), &config, attempt).await
    };

    match &config.probe {
        Some(probe) => verify_endpoint(probe, channel, outcome).await,
        None => outcome,
    }
}

/// Turns a found endpoint into an `InvalidManifest` failure unless it serves a
/// playable playlist. Failed outcomes pass through untouched.
pub async fn verify_endpoint(
    probe: &ManifestProbe,
    channel: ChannelDescriptor,
    outcome: ExtractionOutcome,
) -> ExtractionOutcome {
    let Some(endpoint) = outcome.endpoint() else {
        return outcome;
    };

    match probe.verify(endpoint).await {
        Ok(()) => outcome,
        Err(e) => {
            let reason = FailureReason::InvalidManifest {
                url: endpoint.to_string(),
                detail: format!("{e:#}"),
            };
            warn!("{}: {reason}", channel.name);
            ExtractionOutcome::failed(channel, outcome.attempt, reason)
        }
    }
}

/// Runs the extraction protocol for one channel on a borrowed instance
///
/// Never fails: every problem is reported in the returned outcome.
#[instrument(skip_all, fields(channel = %channel.name, %attempt))]
pub async fn extract_endpoint<B: BrowserInstance + ?Sized>(
    instance: &mut B,
    channel: ChannelDescriptor,
    config: &ExtractionConfig,
    attempt: Attempt,
) -> ExtractionOutcome {
    match attempt {
        Attempt::Initial => info!("Loading {}", channel.url),
        Attempt::Retry => info!("Retrying {}", channel.url),
    }

    match run_protocol(instance, &channel, config).await {
        Ok(endpoint) => {
            info!("{} -> {endpoint}", channel.name);
            ExtractionOutcome::found(&channel, attempt, endpoint)
        }
        Err(reason) => {
            match &reason {
                FailureReason::NoEndpoint => warn!("{}: no endpoint found", channel.name),
                FailureReason::Unexpected(_) => error!("{}: {reason}", channel.name),
                _ => warn!("{}: {reason}", channel.name),
            }
            ExtractionOutcome::failed(channel, attempt, reason)
        }
    }
}

async fn run_protocol<B: BrowserInstance + ?Sized>(
    instance: &mut B,
    channel: &ChannelDescriptor,
    config: &ExtractionConfig,
) -> Result<String, FailureReason> {
    match timeout(config.navigation_timeout, instance.navigate(&channel.url)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(FailureReason::Navigation(format!("{e:#}"))),
        Err(_) => {
            return Err(FailureReason::NavigationTimeout(
                config.navigation_timeout.as_secs(),
            ));
        }
    }

    trigger_playback(instance, channel, config).await;

    observe_traffic(instance, config)
        .await
        .map_err(|e| FailureReason::Unexpected(format!("{e:#}")))?
        .ok_or(FailureReason::NoEndpoint)
}

/// Clicks the first visible playback trigger, if one shows up within the wait
///
/// Lookup and click errors are logged and observation goes ahead regardless.
async fn trigger_playback<B: BrowserInstance + ?Sized>(
    instance: &mut B,
    channel: &ChannelDescriptor,
    config: &ExtractionConfig,
) {
    let deadline = Instant::now() + config.trigger_wait;
    let element = loop {
        match instance.find_element(&config.trigger_selector).await {
            Ok(Some(element)) => break Some(element),
            Ok(None) => {}
            Err(e) => {
                warn!("{}: looking for play button failed: {e:#}", channel.name);
                break None;
            }
        }
        if Instant::now() >= deadline {
            warn!("{}: video / play button not found", channel.name);
            break None;
        }
        sleep(config.trigger_poll_interval).await;
    };

    match element {
        Some(element) if element.visible => {
            match instance.click(&config.trigger_selector).await {
                Ok(()) => {
                    info!("Clicked play for {}", channel.name);
                    sleep(config.click_settle).await;
                }
                Err(e) => warn!("{}: clicking play failed: {e:#}", channel.name),
            }
        }
        Some(_) => debug!("{}: play trigger is hidden, not clicking", channel.name),
        None => {}
    }
}

/// Polls the traffic log until a manifest request shows up or the window closes
async fn observe_traffic<B: BrowserInstance + ?Sized>(
    instance: &mut B,
    config: &ExtractionConfig,
) -> Result<Option<String>> {
    let deadline = Instant::now() + config.observation_window;
    loop {
        let requests = instance.read_traffic_log().await?;
        if let Some(hit) = requests.into_iter().find(|url| config.matcher.matches(url)) {
            return Ok(Some(hit));
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        sleep(config.poll_interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{
        browser::fake::FakeBrowser,
        channel::OutcomeStatus,
    };

    const HIT: &str = "https://cdn.thetvapp.to/hls/b/index.m3u8?token=abc";

    fn config() -> ExtractionConfig {
        ExtractionConfig::new(EndpointMatcher::new(r"\.m3u8", "thetvapp.to").unwrap())
    }

    fn channel() -> ChannelDescriptor {
        ChannelDescriptor {
            id: Some("B".into()),
            name: "Channel B".into(),
            url: "http://site/b".into(),
            logo: Some("http://img/b.png".into()),
        }
    }

    #[test]
    fn matcher_restricts_to_origin() {
        let m = EndpointMatcher::new(r"\.m3u8", "thetvapp.to").unwrap();

        assert!(m.matches("https://thetvapp.to/live/a.m3u8"));
        assert!(m.matches("https://edge-1.thetvapp.to/live/a.m3u8?x=1"));
        assert!(!m.matches("https://thetvapp.to/live/a.ts"));
        assert!(!m.matches("https://ads.example.com/pre.m3u8?ref=thetvapp.to"));
        assert!(!m.matches("https://notthetvapp.to/live/a.m3u8"));
        assert!(!m.matches("not a url .m3u8"));
    }

    #[test]
    fn matcher_rejects_bad_pattern() {
        assert!(EndpointMatcher::new("(", "thetvapp.to").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn clicks_play_and_finds_endpoint() {
        let mut browser = FakeBrowser::new(0)
            .with_trigger(true)
            .with_traffic(Duration::from_millis(200), "https://thetvapp.to/player.js")
            .with_traffic(Duration::from_secs(3), HIT);

        let outcome = extract_endpoint(&mut browser, channel(), &config(), Attempt::Initial).await;

        assert_eq!(outcome.endpoint(), Some(HIT));
        assert_eq!(outcome.id, "B");
        assert_eq!(outcome.logo.as_deref(), Some("http://img/b.png"));
        assert_eq!(browser.stats.clicks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_trigger_is_not_fatal() {
        let mut browser = FakeBrowser::new(0).with_traffic(Duration::from_secs(1), HIT);
        let started = Instant::now();

        let outcome = extract_endpoint(&mut browser, channel(), &config(), Attempt::Initial).await;

        assert!(outcome.is_success());
        assert_eq!(browser.stats.clicks.load(Ordering::SeqCst), 0);
        // the trigger wait is spent before traffic is read
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_trigger_is_not_clicked() {
        let mut browser = FakeBrowser::new(0)
            .with_trigger(false)
            .with_traffic(Duration::ZERO, HIT);

        let outcome = extract_endpoint(&mut browser, channel(), &config(), Attempt::Initial).await;

        assert!(outcome.is_success());
        assert_eq!(browser.stats.clicks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn click_failure_still_observes_traffic() {
        let mut browser = FakeBrowser::new(0)
            .with_trigger(true)
            .with_traffic(Duration::from_secs(2), HIT);
        browser.click_error = Some("element not interactable".into());

        let outcome = extract_endpoint(&mut browser, channel(), &config(), Attempt::Initial).await;

        assert_eq!(outcome.endpoint(), Some(HIT));
        assert_eq!(browser.stats.clicks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_lookup_failure_still_observes_traffic() {
        let mut browser = FakeBrowser::new(0).with_traffic(Duration::from_secs(1), HIT);
        browser.lookup_error = Some("Execution context was destroyed".into());

        let outcome = extract_endpoint(&mut browser, channel(), &config(), Attempt::Initial).await;

        assert_eq!(outcome.endpoint(), Some(HIT));
        assert_eq!(browser.stats.clicks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn previous_page_traffic_is_not_reported() {
        let stale = "https://cdn.thetvapp.to/hls/a/index.m3u8?token=old";
        let mut browser = FakeBrowser::new(0)
            .with_trigger(true)
            .with_traffic(Duration::from_secs(2), HIT);
        browser.late_request = Some(("http://site/a".into(), stale.into()));

        let outcome = extract_endpoint(&mut browser, channel(), &config(), Attempt::Initial).await;

        assert_eq!(outcome.endpoint(), Some(HIT));
    }

    #[tokio::test(start_paused = true)]
    async fn no_match_within_window_fails_with_descriptor() {
        let mut browser = FakeBrowser::new(0)
            .with_trigger(true)
            .with_traffic(Duration::from_secs(1), "https://thetvapp.to/hls/b/seg1.ts")
            .with_traffic(Duration::from_secs(2), "https://ads.example.com/ad.m3u8")
            .with_traffic(Duration::from_secs(30), HIT);
        let cfg = config();
        let started = Instant::now();

        let outcome = extract_endpoint(&mut browser, channel(), &cfg, Attempt::Initial).await;

        assert_eq!(outcome.error(), Some(&FailureReason::NoEndpoint));
        assert_eq!(outcome.error().unwrap().to_string(), "no endpoint found");
        assert_eq!(outcome.retry_descriptor(), Some(&channel()));

        let spent = started.elapsed();
        let bound = cfg.click_settle + cfg.observation_window;
        assert!(spent >= bound);
        assert!(spent < bound + cfg.poll_interval);
    }

    #[tokio::test(start_paused = true)]
    async fn navigation_timeout_fails_without_observing() {
        let mut browser = FakeBrowser::new(0).with_traffic(Duration::ZERO, HIT);
        browser.navigation_delay = Duration::from_secs(60);

        let outcome = extract_endpoint(&mut browser, channel(), &config(), Attempt::Initial).await;

        assert_eq!(outcome.error(), Some(&FailureReason::NavigationTimeout(20)));
        assert!(outcome.retry_descriptor().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn navigation_error_becomes_failure() {
        let mut browser = FakeBrowser::new(0);
        browser.navigation_error = Some("net::ERR_NAME_NOT_RESOLVED".into());

        let outcome = extract_endpoint(&mut browser, channel(), &config(), Attempt::Retry).await;

        match outcome.status {
            OutcomeStatus::Failed {
                reason: FailureReason::Navigation(detail),
                ..
            } => assert!(detail.contains("ERR_NAME_NOT_RESOLVED")),
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(outcome.attempt, Attempt::Retry);
    }

    #[tokio::test(start_paused = true)]
    async fn pooled_attempt_returns_instance_on_failure() {
        let pool = InstancePool::launch(1, |i| async move {
            let mut browser = FakeBrowser::new(i);
            browser.navigation_error = Some("boom".into());
            Ok(browser)
        })
        .await
        .unwrap();
        let cfg = Arc::new(config());

        for _ in 0..3 {
            let outcome =
                extract_pooled(Arc::clone(&pool), channel(), Arc::clone(&cfg), Attempt::Initial).await;
            assert!(!outcome.is_success());
            assert_eq!(pool.available(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pooled_attempt_after_shutdown_fails_cleanly() {
        let pool = InstancePool::launch(1, |i| async move { Ok(FakeBrowser::new(i)) })
            .await
            .unwrap();
        pool.shutdown().await;

        let outcome = extract_pooled(pool, channel(), Arc::new(config()), Attempt::Initial).await;

        assert!(matches!(outcome.error(), Some(FailureReason::PoolUnavailable(_))));
    }

    #[tokio::test]
    async fn instance_is_back_in_the_pool_while_the_endpoint_is_verified() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!(
            "http://127.0.0.1:{}/live/index.m3u8",
            listener.local_addr().unwrap().port()
        );
        let (accepted_tx, accepted_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            accepted_tx.send(()).ok();
            // never answers
            sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let traffic = endpoint.clone();
        let pool = InstancePool::launch(1, move |i| {
            let browser = FakeBrowser::new(i).with_traffic(Duration::ZERO, &traffic);
            async move { Ok(browser) }
        })
        .await
        .unwrap();
        let mut cfg = ExtractionConfig::new(EndpointMatcher::new(r"\.m3u8", "127.0.0.1").unwrap());
        cfg.trigger_wait = Duration::ZERO;
        cfg.probe = Some(ManifestProbe::new(Duration::from_millis(500)).unwrap());

        let task = tokio::spawn(extract_pooled(
            Arc::clone(&pool),
            channel(),
            Arc::new(cfg),
            Attempt::Initial,
        ));
        timeout(Duration::from_secs(5), accepted_rx).await.unwrap().unwrap();
        assert_eq!(pool.available(), 1);

        let outcome = task.await.unwrap();
        match outcome.error() {
            Some(FailureReason::InvalidManifest { url, .. }) => assert_eq!(*url, endpoint),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(outcome.retry_descriptor(), Some(&channel()));
    }
}
