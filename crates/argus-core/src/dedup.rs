//! URL canonicalization and the recently-seen cache that suppresses duplicate enqueues.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use scraper::{Html, Selector};
use serde::Serialize;
use url::Url;

use crate::error::AppError;
use crate::models::compute_hash;

/// Query parameters that only carry campaign attribution.
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "ref", "source", "yclid", "mc_cid", "mc_eid"];

/// Normalizes a URL so that equivalent product links compare equal.
///
/// Lowercases scheme and host, drops the fragment and default port, removes
/// tracking parameters (`utm_*`, `fbclid`, ...), sorts what remains of the
/// query and strips a trailing slash from non-root paths.
pub fn canonicalize_url(raw: &str) -> Result<String, AppError> {
    let mut url =
        Url::parse(raw.trim()).map_err(|e| AppError::InvalidUrl(format!("{raw}: {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::InvalidUrl(format!(
                "{raw}: scheme '{scheme}' is not fetchable"
            )));
        }
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(AppError::InvalidUrl(format!("{raw}: missing host")));
    }

    url.set_fragment(None);

    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    params.sort();
    if params.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(params);
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    Ok(url.to_string())
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

/// SHA-256 of the canonical URL, used as the dedup key.
pub fn url_hash(canonical: &str) -> String {
    compute_hash(canonical)
}

/// Host of a canonical URL, used for per-domain admission and identity affinity.
pub fn domain_of(canonical: &str) -> Result<String, AppError> {
    Url::parse(canonical)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .ok_or_else(|| AppError::InvalidUrl(format!("{canonical}: missing host")))
}

/// The page's own idea of its canonical address (`<link rel="canonical">`, then `og:url`).
pub fn canonical_link(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let candidates = [
        ("link[rel=\"canonical\"]", "href"),
        ("meta[property=\"og:url\"]", "content"),
    ];
    candidates.iter().find_map(|(css, attr)| {
        let selector = Selector::parse(css).ok()?;
        document
            .select(&selector)
            .find_map(|el| el.value().attr(attr))
            .map(str::trim)
            .filter(|href| !href.is_empty())
            .and_then(|href| canonicalize_url(href).ok())
    })
}

/// One canonical URL seen at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DedupEntry {
    pub url_hash: String,
    pub canonical_url: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub visit_count: u64,
}

/// In-memory dedup cache with a freshness window.
#[derive(Debug)]
pub struct DedupCache {
    entries: HashMap<String, DedupEntry>,
    window: TimeDelta,
}

impl DedupCache {
    pub fn new(window: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            window: TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Records a sighting of `canonical` and reports whether it was already
    /// seen within the freshness window.
    pub fn observe(&mut self, canonical: &str, now: DateTime<Utc>) -> bool {
        let hash = url_hash(canonical);
        match self.entries.get_mut(&hash) {
            Some(entry) => {
                let fresh = now - entry.last_seen < self.window;
                entry.last_seen = now;
                entry.visit_count += 1;
                fresh
            }
            None => {
                self.entries.insert(
                    hash.clone(),
                    DedupEntry {
                        url_hash: hash,
                        canonical_url: canonical.to_string(),
                        first_seen: now,
                        last_seen: now,
                        visit_count: 1,
                    },
                );
                false
            }
        }
    }

    pub fn get(&self, canonical: &str) -> Option<&DedupEntry> {
        self.entries.get(&url_hash(canonical))
    }

    /// Drops entries not seen since `cutoff`. Returns how many were removed.
    pub fn evict_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.last_seen >= cutoff);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_lowercases_and_strips_tracking() {
        let canonical = canonicalize_url(
            "HTTPS://Shop.Example.COM/product/42/?utm_source=tg&b=2&a=1&fbclid=xyz#reviews",
        )
        .unwrap();
        assert_eq!(canonical, "https://shop.example.com/product/42?a=1&b=2");
    }

    #[test]
    fn canonicalize_keeps_root_slash_and_drops_default_port() {
        assert_eq!(
            canonicalize_url("http://example.com:80").unwrap(),
            "http://example.com/"
        );
        assert_eq!(
            canonicalize_url("https://example.com:8443/p/").unwrap(),
            "https://example.com:8443/p"
        );
    }

    #[test]
    fn equivalent_urls_share_a_hash() {
        let a = canonicalize_url("https://example.com/p/1?ref=home").unwrap();
        let b = canonicalize_url("https://EXAMPLE.com/p/1/").unwrap();
        assert_eq!(url_hash(&a), url_hash(&b));
    }

    #[test]
    fn canonicalize_rejects_unfetchable() {
        assert!(matches!(
            canonicalize_url("not a url"),
            Err(AppError::InvalidUrl(_))
        ));
        assert!(matches!(
            canonicalize_url("ftp://example.com/file"),
            Err(AppError::InvalidUrl(_))
        ));
        assert!(matches!(
            canonicalize_url("mailto:sales@example.com"),
            Err(AppError::InvalidUrl(_))
        ));
    }

    #[test]
    fn domain_of_returns_host() {
        assert_eq!(
            domain_of("https://www.digikala.com/product/dkp-1").unwrap(),
            "www.digikala.com"
        );
    }

    #[test]
    fn canonical_link_prefers_link_tag() {
        let html = r#"<html><head>
            <meta property="og:url" content="https://shop.example/og">
            <link rel="canonical" href="https://shop.example/p/9/">
        </head></html>"#;
        assert_eq!(
            canonical_link(html).as_deref(),
            Some("https://shop.example/p/9")
        );
        assert_eq!(canonical_link("<html></html>"), None);
    }

    #[test]
    fn cache_reports_fresh_duplicates_within_window() {
        let mut cache = DedupCache::new(Duration::from_secs(3600));
        let now = Utc::now();
        assert!(!cache.observe("https://example.com/p/1", now));
        assert!(cache.observe("https://example.com/p/1", now + TimeDelta::minutes(5)));

        let entry = cache.get("https://example.com/p/1").unwrap();
        assert_eq!(entry.visit_count, 2);
        assert_eq!(entry.first_seen, now);
    }

    #[test]
    fn cache_allows_revisit_after_window() {
        let mut cache = DedupCache::new(Duration::from_secs(60));
        let now = Utc::now();
        cache.observe("https://example.com/p/1", now);
        assert!(!cache.observe("https://example.com/p/1", now + TimeDelta::minutes(2)));
    }

    #[test]
    fn cache_eviction() {
        let mut cache = DedupCache::new(Duration::from_secs(60));
        let now = Utc::now();
        cache.observe("https://example.com/old", now - TimeDelta::hours(2));
        cache.observe("https://example.com/new", now);
        assert_eq!(cache.evict_older_than(now - TimeDelta::hours(1)), 1);
        assert_eq!(cache.len(), 1);
    }
}
