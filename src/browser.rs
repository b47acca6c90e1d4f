use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chromiumoxide::{
    Page,
    browser::{Browser, BrowserConfig},
    cdp::browser_protocol::network::{EnableParams, EventRequestWillBeSent},
};
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

/// Returns whether the element (`this`) takes up space on screen
const VISIBILITY_PROBE_FN: &str = indoc::indoc! {"
    function() {
        const rect = this.getBoundingClientRect();
        const style = window.getComputedStyle(this);
        return rect.width > 0 && rect.height > 0
            && style.visibility !== 'hidden' && style.display !== 'none';
    }
"};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementInfo {
    pub visible: bool,
}

/// A single headless browser session
///
/// This is the whole surface the extraction protocol needs from a browser, which
/// keeps it testable without a real Chromium.
#[async_trait]
pub trait BrowserInstance: Send + 'static {
    /// Loads `url`, forgetting any traffic recorded so far. Requests the previous
    /// page issues after this call are never reported.
    async fn navigate(&mut self, url: &str) -> Result<()>;

    /// Looks up the first element matching a CSS selector right now, without waiting
    async fn find_element(&mut self, selector: &str) -> Result<Option<ElementInfo>>;

    async fn click(&mut self, selector: &str) -> Result<()>;

    /// Drains the request URLs issued since the previous read, oldest first
    async fn read_traffic_log(&mut self) -> Result<Vec<String>>;

    async fn shutdown(&mut self) -> Result<()>;
}

/// Request URLs issued by the page currently loaded
///
/// Every document seen before a [`TrafficLog::reset`] is retired, and requests a
/// retired document issues afterwards are dropped, however late their event arrives.
#[derive(Debug, Default)]
pub struct TrafficLog {
    urls: Vec<String>,
    documents: HashSet<String>,
    retired: HashSet<String>,
}

impl TrafficLog {
    pub fn record(&mut self, document_url: &str, url: &str) {
        if self.retired.contains(document_url) {
            return;
        }
        if !document_url.is_empty() {
            self.documents.insert(document_url.to_string());
        }
        self.urls.push(url.to_string());
    }

    /// Forgets the recorded URLs before loading `target`
    ///
    /// `target` itself is never retired, so reloading the same page keeps its traffic.
    pub fn reset(&mut self, target: &str) {
        self.urls.clear();
        self.retired.extend(self.documents.drain());
        self.retired.remove(target);
    }

    pub fn drain(&mut self) -> Vec<String> {
        std::mem::take(&mut self.urls)
    }
}

#[derive(Debug, Clone)]
pub struct ChromeOptions {
    pub executable: Option<PathBuf>,
    pub request_timeout: Duration,
}

/// Chromium driven over CDP, one browser process per instance
pub struct ChromeInstance {
    browser: Browser,
    page: Page,
    traffic: Arc<Mutex<TrafficLog>>,
    handler_task: JoinHandle<()>,
    listener_task: JoinHandle<()>,
}

impl ChromeInstance {
    /// Launches a fresh headless Chromium with its own profile directory
    ///
    /// # Errors
    /// Errors when Chromium cannot be found or launched, or when the network
    /// listener cannot be attached
    #[instrument(skip(options))]
    pub async fn launch(index: usize, options: &ChromeOptions) -> Result<Self> {
        let profile_dir =
            std::env::temp_dir().join(format!("stream-scout-{}-{index}", std::process::id()));

        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .user_data_dir(profile_dir)
            .request_timeout(options.request_timeout)
            .args([
                "--mute-audio",
                "--disable-gpu",
                "--disable-dev-shm-usage",
                "--disable-notifications",
                "--blink-settings=imagesEnabled=false",
            ]);
        if let Some(path) = &options.executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder
            .build()
            .map_err(|e| anyhow!("Building browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("Launching Chromium")?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler error: {e}");
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .context("Opening browser page")?;

        if let Err(e) = page.execute(EnableParams::default()).await {
            warn!("Unable to enable network domain: {e}");
        }

        let mut requests = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .context("Subscribing to network requests")?;

        let traffic = Arc::new(Mutex::new(TrafficLog::default()));
        let sink = Arc::clone(&traffic);
        let listener_task = tokio::spawn(async move {
            while let Some(event) = requests.next().await {
                sink.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record(&event.document_url, &event.request.url);
            }
        });

        debug!("Browser instance {index} ready");
        Ok(Self {
            browser,
            page,
            traffic,
            handler_task,
            listener_task,
        })
    }

    fn traffic(&self) -> std::sync::MutexGuard<'_, TrafficLog> {
        self.traffic.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BrowserInstance for ChromeInstance {
    async fn navigate(&mut self, url: &str) -> Result<()> {
        // Unloads the previous page so its player stops issuing requests
        if let Err(e) = self.page.goto("about:blank").await {
            debug!("Unable to blank the page before {url}: {e}");
        }
        self.traffic().reset(url);
        self.page
            .goto(url)
            .await
            .with_context(|| format!("Navigating to {url}"))?;
        Ok(())
    }

    async fn find_element(&mut self, selector: &str) -> Result<Option<ElementInfo>> {
        // chromiumoxide reports a missing node as an error
        let Ok(element) = self.page.find_element(selector).await else {
            return Ok(None);
        };

        let visible = element
            .call_js_fn(VISIBILITY_PROBE_FN, false)
            .await
            .context("Checking element visibility")?
            .result
            .value
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        Ok(Some(ElementInfo { visible }))
    }

    async fn click(&mut self, selector: &str) -> Result<()> {
        self.page
            .find_element(selector)
            .await
            .with_context(|| format!("Locating `{selector}`"))?
            .click()
            .await
            .with_context(|| format!("Clicking `{selector}`"))?;
        Ok(())
    }

    async fn read_traffic_log(&mut self) -> Result<Vec<String>> {
        Ok(self.traffic().drain())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.listener_task.abort();
        let closed = self.browser.close().await.context("Closing Chromium");
        if let Err(e) = self.browser.wait().await {
            warn!("Waiting for Chromium to exit: {e}");
        }
        self.handler_task.abort();
        closed.map(|_| ())
    }
}
