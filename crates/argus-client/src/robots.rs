use std::sync::Arc;
use std::time::Duration;

use argus_core::error::AppError;
use moka::future::Cache;
use reqwest::Client;
use robotstxt::DefaultMatcher;
use url::Url;

const DEFAULT_TTL: Duration = Duration::from_secs(3600);
const DEFAULT_CAPACITY: u64 = 10_000;

/// robots.txt gate with a per-origin TTL cache.
///
/// A missing, unreachable or non-2xx robots.txt allows everything. Files are
/// fetched directly, never through a proxy identity.
#[derive(Clone)]
pub struct RobotsGuard {
    client: Client,
    user_agent: String,
    cache: Cache<String, Arc<str>>,
}

impl RobotsGuard {
    pub fn new(user_agent: impl Into<String>) -> Result<Self, AppError> {
        Self::with_ttl(user_agent, DEFAULT_TTL)
    }

    pub fn with_ttl(user_agent: impl Into<String>, ttl: Duration) -> Result<Self, AppError> {
        let user_agent = user_agent.into();
        let client = Client::builder()
            .user_agent(&user_agent)
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            user_agent,
            cache: Cache::builder()
                .max_capacity(DEFAULT_CAPACITY)
                .time_to_live(ttl)
                .build(),
        })
    }

    /// Fails with [`AppError::RobotsDisallowed`] if robots.txt forbids `url`.
    pub async fn check(&self, url: &str) -> Result<(), AppError> {
        let parsed = Url::parse(url).map_err(|e| AppError::InvalidUrl(format!("{url}: {e}")))?;
        let origin = parsed.origin().ascii_serialization();

        let body = self
            .cache
            .get_with(origin.clone(), self.download(origin))
            .await;

        if is_allowed(&body, &self.user_agent, url) {
            Ok(())
        } else {
            tracing::info!(%url, "Blocked by robots.txt");
            Err(AppError::RobotsDisallowed(url.to_string()))
        }
    }

    async fn download(&self, origin: String) -> Arc<str> {
        let robots_url = format!("{origin}/robots.txt");
        let body = match self.client.get(&robots_url).send().await {
            Ok(resp) if resp.status().is_success() => resp.text().await.unwrap_or_default(),
            Ok(resp) => {
                tracing::debug!(url = %robots_url, status = resp.status().as_u16(), "No robots.txt");
                String::new()
            }
            Err(e) => {
                tracing::debug!(url = %robots_url, error = %e, "robots.txt unreachable");
                String::new()
            }
        };
        Arc::from(body)
    }
}

fn is_allowed(robots_body: &str, user_agent: &str, url: &str) -> bool {
    if robots_body.trim().is_empty() {
        return true;
    }
    // The matcher wants the product token, not the full UA string.
    let agent = user_agent.split('/').next().unwrap_or(user_agent);
    DefaultMatcher::default().one_agent_allowed_by_robots(robots_body, agent, url)
}
