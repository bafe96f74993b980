use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use argus_core::error::AppError;
use argus_core::models::FetchedPage;
use argus_core::pool::IdentityLease;
use argus_core::traits::PageFetcher;
use reqwest::Client;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, COOKIE, HeaderMap, SET_COOKIE, USER_AGENT};
use url::Url;

use crate::robots::RobotsGuard;
use crate::session;

/// Agent name used for robots.txt lookups. Page requests carry the leased
/// identity's own user agent instead.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// HTTP page fetcher using reqwest.
///
/// Requests go out through the proxy of the leased identity, carrying that
/// identity's user agent and its cookies for the target domain. Cookies set
/// by the response are returned as the new session state on the [`FetchedPage`].
///
/// One reqwest client is built per proxy endpoint and reused. SSRF protection
/// is **enabled** by default; see [`allow_private_urls`](Self::allow_private_urls).
#[derive(Clone)]
pub struct ReqwestFetcher {
    timeout: Duration,
    ssrf_protection: bool,
    robots: Option<RobotsGuard>,
    clients: Arc<Mutex<HashMap<Option<String>, Client>>>,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let fetcher = Self {
            timeout,
            ssrf_protection: true,
            robots: None,
            clients: Arc::new(Mutex::new(HashMap::new())),
        };
        // Fail early on a broken TLS backend rather than on the first task.
        fetcher.client_for(None)?;
        Ok(fetcher)
    }

    /// Check robots.txt before every fetch.
    pub fn with_robots(mut self, robots: RobotsGuard) -> Self {
        self.robots = Some(robots);
        self
    }

    /// Disable SSRF protection, allowing requests to private/reserved IPs.
    ///
    /// Only use this for CLI usage where the user controls the machine.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    fn lock_clients(&self) -> MutexGuard<'_, HashMap<Option<String>, Client>> {
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn client_for(&self, proxy: Option<&str>) -> Result<Client, AppError> {
        let key = proxy.map(str::to_string);
        if let Some(client) = self.lock_clients().get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder().timeout(self.timeout);
        if let Some(endpoint) = proxy {
            let proxy = reqwest::Proxy::all(endpoint)
                .map_err(|e| AppError::NetworkError(format!("Invalid proxy {endpoint}: {e}")))?;
            builder = builder.proxy(proxy);
        } else {
            builder = builder.no_proxy();
        }
        let client = builder
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        self.lock_clients().insert(key, client.clone());
        Ok(client)
    }

    fn map_send_error(&self, e: reqwest::Error, proxy: Option<&str>) -> AppError {
        if e.is_timeout() {
            AppError::Timeout(self.timeout)
        } else if e.is_connect() {
            match proxy {
                Some(p) => AppError::NetworkError(format!("Connection via proxy {p} failed: {e}")),
                None => AppError::NetworkError(format!("Connection failed: {e}")),
            }
        } else {
            AppError::HttpError(e.to_string())
        }
    }
}

impl PageFetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str, lease: &IdentityLease) -> Result<FetchedPage, AppError> {
        if self.ssrf_protection {
            validate_url(url).await?;
        }
        if let Some(robots) = &self.robots {
            robots.check(url).await?;
        }

        let proxy = lease.proxy_endpoint();
        let client = self.client_for(proxy)?;
        let mut request = client
            .get(url)
            .header(USER_AGENT, lease.user_agent())
            .header(ACCEPT, "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8")
            .header(ACCEPT_LANGUAGE, "fa-IR,fa;q=0.9,en-US;q=0.8,en;q=0.7");
        if let Some(cookies) = session::cookie_header(lease.session_state(), lease.domain()) {
            request = request.header(COOKIE, cookies);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.map_send_error(e, proxy))?;

        let status = response.status();
        let final_url = response.url().to_string();
        let headers = response.headers().clone();
        let session_state = session::merge_cookies(
            lease.session_state(),
            lease.domain(),
            headers
                .get_all(SET_COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .filter_map(session::parse_set_cookie),
        );

        if !status.is_success() {
            tracing::debug!(
                %url,
                status = status.as_u16(),
                identity = lease.identity_id(),
                "Non-success response"
            );
            return Err(AppError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let html = response.text().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.timeout)
            } else {
                AppError::HttpError(format!("Failed to read response body: {e}"))
            }
        })?;

        let mut page = FetchedPage::new(final_url, html).with_status(status.as_u16());
        page.headers = flatten_headers(&headers);
        if let Some(state) = session_state {
            page = page.with_session_state(state);
        }
        Ok(page)
    }
}

fn flatten_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut flat: HashMap<String, String> = HashMap::new();
    for (name, value) in headers {
        if name == SET_COOKIE {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        flat.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    flat
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Validate a URL to prevent server-side request forgery (SSRF).
///
/// 1. Only allow `http` and `https` schemes.
/// 2. Resolve the hostname via DNS.
/// 3. Reject if any resolved IP is private/reserved.
async fn validate_url(url: &str) -> Result<(), AppError> {
    let parsed = Url::parse(url).map_err(|e| AppError::InvalidUrl(format!("{url}: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::InvalidUrl(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::InvalidUrl(format!("{url} has no host")))?;

    // IP literals are checked directly; brackets are kept by host_str for v6.
    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(AppError::InvalidUrl(format!(
                "SSRF blocked: {host} resolves to private/reserved IP"
            )));
        }
        return Ok(());
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| AppError::NetworkError(format!("DNS resolution failed for {host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(AppError::NetworkError(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }

    for socket_addr in &addrs {
        if is_private_ip(socket_addr.ip()) {
            return Err(AppError::InvalidUrl(format!(
                "SSRF blocked: {host} resolves to private/reserved IP {}",
                socket_addr.ip()
            )));
        }
    }

    Ok(())
}

/// Check if an IP address is in a private/reserved/link-local range.
fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local() // 169.254.0.0/16, cloud metadata
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64 // 100.64.0.0/10 (CGN)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xFFC0) == 0xFE80 // fe80::/10
                || (v6.segments()[0] & 0xFE00) == 0xFC00 // fc00::/7
                || match v6.to_ipv4_mapped() {
                    Some(v4) => is_private_ip(IpAddr::V4(v4)),
                    None => false,
                }
        }
    }
}
