//! Bot-wall and CAPTCHA detection on fetched pages.
//!
//! A block status always counts. Content signals (challenge widgets and
//! block phrases) are ignored on pages that carry structured product data,
//! since a real product page may embed a CAPTCHA-protected newsletter or
//! review form.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};

use crate::cascade::structured;
use crate::error::AppError;
use crate::models::FetchedPage;

/// Statuses that targets use to turn bots away.
const BLOCK_STATUSES: &[u16] = &[403, 429];

/// Elements that only appear on challenge pages.
const CAPTCHA_SELECTORS: &[&str] = &[
    ".g-recaptcha",
    "[data-sitekey]",
    ".h-captcha",
    "#challenge-form",
    "#cf-challenge-running",
    "iframe[src*='recaptcha']",
    "iframe[src*='hcaptcha']",
    "iframe[src*='challenges.cloudflare.com']",
];

/// Visible-text phrases of block and challenge pages (English and Persian).
const BLOCK_PHRASES: &[&str] = &[
    "verify you are human",
    "not a robot",
    "human verification",
    "prove you are human",
    "access denied",
    "checking your browser",
    "unusual traffic",
    "مسدود",
    "کپچا",
    "دسترسی غیرمجاز",
];

/// Challenge pages are short; product pages that merely mention a phrase are not.
const MAX_CHALLENGE_TEXT_CHARS: usize = 3000;

static NON_VISIBLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b.*?</script>|<style\b.*?</style>|<noscript\b.*?</noscript>")
        .expect("static regex")
});

/// Why a page was classified as blocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockSignal {
    Status(u16),
    CaptchaElement(String),
    Phrase(String),
}

impl fmt::Display for BlockSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockSignal::Status(code) => write!(f, "HTTP {code}"),
            BlockSignal::CaptchaElement(sel) => write!(f, "captcha element {sel}"),
            BlockSignal::Phrase(phrase) => write!(f, "block phrase '{phrase}'"),
        }
    }
}

/// Inspects a fetched page for block signals.
pub fn detect_block(page: &FetchedPage) -> Option<BlockSignal> {
    if BLOCK_STATUSES.contains(&page.status_code) {
        return Some(BlockSignal::Status(page.status_code));
    }

    let document = Html::parse_document(&page.html);
    if structured::has_product(&document) {
        return None;
    }
    for css in CAPTCHA_SELECTORS {
        let Ok(selector) = Selector::parse(css) else {
            continue;
        };
        if document.select(&selector).next().is_some() {
            return Some(BlockSignal::CaptchaElement((*css).to_string()));
        }
    }

    let visible = visible_text(&page.html);
    if visible.chars().count() > MAX_CHALLENGE_TEXT_CHARS {
        return None;
    }
    let lowered = visible.to_lowercase();
    BLOCK_PHRASES
        .iter()
        .find(|phrase| lowered.contains(*phrase))
        .map(|phrase| BlockSignal::Phrase((*phrase).to_string()))
}

/// Fails with [`AppError::Blocked`] if the page carries a block signal.
pub fn ensure_not_blocked(page: &FetchedPage) -> Result<(), AppError> {
    match detect_block(page) {
        Some(signal) => Err(AppError::Blocked {
            reason: signal.to_string(),
        }),
        None => Ok(()),
    }
}

fn visible_text(html: &str) -> String {
    let stripped = NON_VISIBLE.replace_all(html, " ");
    let document = Html::parse_document(&stripped);
    document
        .root_element()
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(html: &str) -> FetchedPage {
        FetchedPage::new("https://shop.example/p/1", html)
    }

    #[test]
    fn block_status_is_detected() {
        let p = page("<html><body>nope</body></html>").with_status(429);
        assert_eq!(detect_block(&p), Some(BlockSignal::Status(429)));
    }

    #[test]
    fn recaptcha_widget_is_detected() {
        let p = page(r#"<html><body><div class="g-recaptcha" data-sitekey="abc"></div></body></html>"#);
        assert!(matches!(
            detect_block(&p),
            Some(BlockSignal::CaptchaElement(_))
        ));
    }

    #[test]
    fn product_page_with_captcha_form_is_not_blocked() {
        let p = page(
            r#"<html><head><script type="application/ld+json">
            {"@type":"Product","name":"Widget X","offers":{"price":"199000","priceCurrency":"IRT"}}
            </script></head><body><h1>Widget X</h1>
            <form class="newsletter"><div class="g-recaptcha" data-sitekey="k"></div></form>
            </body></html>"#,
        );
        assert_eq!(detect_block(&p), None);

        // Still blocked when the status says so.
        assert_eq!(detect_block(&p.with_status(403)), Some(BlockSignal::Status(403)));
    }

    #[test]
    fn challenge_with_product_name_but_no_price_is_blocked() {
        let p = page(
            r#"<html><head><script type="application/ld+json">{"@type":"Product","name":"Widget X"}</script>
            </head><body><div class="h-captcha" data-sitekey="k"></div></body></html>"#,
        );
        assert!(matches!(
            detect_block(&p),
            Some(BlockSignal::CaptchaElement(_))
        ));
    }

    #[test]
    fn persian_block_phrase_is_detected() {
        let p = page("<html><body><h1>دسترسی شما مسدود شده است</h1></body></html>");
        assert_eq!(
            detect_block(&p),
            Some(BlockSignal::Phrase("مسدود".to_string()))
        );
    }

    #[test]
    fn phrases_inside_scripts_are_ignored() {
        let p = page(
            "<html><head><script>var msg = 'verify you are human';</script></head>\
             <body><h1>Widget X</h1><span>199,000 تومان</span></body></html>",
        );
        assert_eq!(detect_block(&p), None);
    }

    #[test]
    fn long_product_page_mentioning_captcha_passes() {
        let filler = "Great product with many reviews. ".repeat(200);
        let html = format!("<html><body><p>{filler}</p><p>Access denied to coupons</p></body></html>");
        assert_eq!(detect_block(&page(&html)), None);
    }

    #[test]
    fn ensure_not_blocked_maps_to_error() {
        let p = page("<html></html>").with_status(403);
        let err = ensure_not_blocked(&p).unwrap_err();
        assert!(matches!(err, AppError::Blocked { .. }));
        assert!(ensure_not_blocked(&page("<html><body>ok</body></html>")).is_ok());
    }
}
