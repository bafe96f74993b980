use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use argus_core::error::AppError;
use argus_core::models::FetchedPage;
use argus_core::pool::IdentityLease;
use argus_core::traits::PageFetcher;
use chromiumoxide::cdp::browser_protocol::emulation::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::sync::Mutex;

use crate::session;

/// Headless-browser fetcher using Chromium via the Chrome DevTools Protocol.
///
/// Unlike [`super::ReqwestFetcher`], this renders JavaScript before returning
/// the HTML and attaches a full-page PNG screenshot, which feeds the OCR
/// strategy.
///
/// Chromium takes its proxy per process, so one browser is launched lazily
/// per proxy endpoint and shared across clones. Each fetch opens a tab,
/// applies the identity's user agent and cookies, navigates, captures, and
/// closes the tab.
///
/// # Example
///
/// ```rust,no_run
/// use argus_client::BrowserFetcher;
/// use argus_core::pool::{IdentityPool, PoolConfig};
/// use argus_core::traits::PageFetcher;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let fetcher = BrowserFetcher::new();
/// let pool = IdentityPool::direct(1, PoolConfig::default());
/// let lease = pool.acquire("example.com").await?;
/// let page = fetcher.fetch("https://example.com", &lease).await?;
/// println!("{} bytes, screenshot: {}", page.html.len(), page.screenshot.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct BrowserFetcher {
    browsers: Arc<Mutex<HashMap<Option<String>, Arc<Browser>>>>,
    timeout: Duration,
    screenshots: bool,
}

impl BrowserFetcher {
    /// Fetcher with a **30 s** navigation timeout. No browser is launched
    /// until the first fetch.
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            browsers: Arc::new(Mutex::new(HashMap::new())),
            timeout,
            screenshots: true,
        }
    }

    /// Skip screenshot capture; the OCR strategy will then abstain.
    pub fn without_screenshots(mut self) -> Self {
        self.screenshots = false;
        self
    }

    async fn browser_for(&self, proxy: Option<&str>) -> Result<Arc<Browser>, AppError> {
        let key = proxy.map(str::to_string);
        let mut browsers = self.browsers.lock().await;
        if let Some(browser) = browsers.get(&key) {
            return Ok(Arc::clone(browser));
        }
        let browser = Arc::new(Self::launch(proxy).await?);
        browsers.insert(key, Arc::clone(&browser));
        Ok(browser)
    }

    async fn launch(proxy: Option<&str>) -> Result<Browser, AppError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();

        // Snap-packaged Chromium exposes a wrapper that rejects standard
        // Chrome CLI flags, so prefer a real binary when one is found.
        if let Some(bin) = Self::find_chrome_binary() {
            tracing::info!("Using Chrome binary: {}", bin.display());
            builder = builder.chrome_executable(bin);
        }

        builder = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--no-first-run")
            .window_size(1366, 2000);
        if let Some(endpoint) = proxy {
            builder = builder.arg(format!("--proxy-server={endpoint}"));
        }

        let config = builder
            .build()
            .map_err(|e| AppError::Generic(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::Generic(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled continuously for the connection to work.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::warn!("Browser CDP handler error: {event:?}");
                    break;
                }
            }
        });

        tracing::info!(proxy = proxy.unwrap_or("direct"), "Launched headless browser");
        Ok(browser)
    }

    /// Tries to locate the real Chrome/Chromium binary.
    ///
    /// `CHROME_BIN` wins; then the binary inside a snap, then well-known
    /// system paths. `None` lets `chromiumoxide` do its own lookup.
    fn find_chrome_binary() -> Option<PathBuf> {
        let candidates: &[&str] = &[
            "/snap/chromium/current/usr/lib/chromium-browser/chrome",
            "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
        ];

        if let Ok(p) = std::env::var("CHROME_BIN") {
            let path = PathBuf::from(&p);
            if path.exists() {
                return Some(path);
            }
        }

        candidates.iter().map(PathBuf::from).find(|p| p.exists())
    }

    async fn render(
        &self,
        browser: &Browser,
        url: &str,
        lease: &IdentityLease,
    ) -> Result<FetchedPage, AppError> {
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to open tab: {e}")))?;

        let result = self.render_in(&page, url, lease).await;
        let _ = page.close().await;
        result
    }

    async fn render_in(
        &self,
        page: &Page,
        url: &str,
        lease: &IdentityLease,
    ) -> Result<FetchedPage, AppError> {
        page.set_user_agent(SetUserAgentOverrideParams::new(lease.user_agent()))
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to set user agent: {e}")))?;

        let stored = session::cookies_for(lease.session_state(), lease.domain());
        if !stored.is_empty() {
            let params: Vec<CookieParam> = stored
                .iter()
                .filter_map(|(name, value)| {
                    CookieParam::builder()
                        .name(name.clone())
                        .value(value.clone())
                        .url(url)
                        .build()
                        .ok()
                })
                .collect();
            page.set_cookies(params)
                .await
                .map_err(|e| AppError::HttpError(format!("Failed to restore cookies: {e}")))?;
        }

        page.goto(url)
            .await
            .map_err(|e| AppError::NetworkError(format!("Failed to navigate to {url}: {e}")))?;

        // <body> present is the minimal signal that the page has rendered.
        page.find_element("body")
            .await
            .map_err(|e| AppError::HttpError(format!("Page did not render body: {e}")))?;

        let html = page
            .content()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to read page content: {e}")))?;
        let final_url = page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| url.to_string());

        let mut fetched = FetchedPage::new(final_url, html);

        if self.screenshots {
            match page
                .screenshot(ScreenshotParams::builder().full_page(true).build())
                .await
            {
                Ok(png) => fetched = fetched.with_screenshot(png),
                Err(e) => tracing::warn!(%url, error = %e, "Screenshot failed"),
            }
        }

        if let Ok(cookies) = page.get_cookies().await {
            let domain = lease.domain();
            let updates = cookies
                .into_iter()
                .filter(|c| c.domain.trim_start_matches('.').ends_with(domain))
                .map(|c| (c.name, Some(c.value)));
            if let Some(state) = session::merge_cookies(lease.session_state(), domain, updates) {
                fetched = fetched.with_session_state(state);
            }
        }

        Ok(fetched)
    }
}

impl Default for BrowserFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl PageFetcher for BrowserFetcher {
    async fn fetch(&self, url: &str, lease: &IdentityLease) -> Result<FetchedPage, AppError> {
        let browser = self.browser_for(lease.proxy_endpoint()).await?;
        let timeout = self.timeout;

        match tokio::time::timeout(timeout, self.render(&browser, url, lease)).await {
            Ok(inner) => inner,
            Err(_) => Err(AppError::Timeout(timeout)),
        }
    }
}
