//! Selector-based extraction with per-domain rules and generic fallbacks.

use std::collections::HashMap;
use std::path::Path;

use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};

use super::price::{
    detect_currency, is_plausible, looks_like_product_id, normalize_currency, parse_price,
};
use super::{Candidate, CascadeConfig};
use crate::dedup::domain_of;
use crate::error::AppError;
use crate::models::{FetchedPage, ProductFields};

/// Fields the DOM strategy is scored on.
const EXPECTED_FIELDS: usize = 3;

const GENERIC_TITLE: &[&str] = &[
    "h1",
    r#"[data-testid="pdp-title"]"#,
    r#"meta[property="og:title"]"#,
];

const GENERIC_PRICE: &[&str] = &[
    r#"span[data-testid="price-no-discount"]"#,
    r#"span[data-testid="price-single"]"#,
    r#"span[data-testid="price-final"]"#,
    ".price-final",
    ".product-price",
    ".special-price",
    ".sale-price",
    r#"[itemprop="price"]"#,
    r#"meta[property="product:price:amount"]"#,
    r#"div[class*="price"]"#,
    r#"span[class*="price"]"#,
    "[data-price]",
];

const GENERIC_ORIGINAL_PRICE: &[&str] = &[
    r#"[data-testid="price-before-discount"]"#,
    ".old-price",
    ".price-before-discount",
    "del",
    "s",
    "strike",
    r#"[style*="line-through"]"#,
];

const GENERIC_CURRENCY: &[&str] = &[
    r#"meta[itemprop="priceCurrency"]"#,
    r#"meta[property="product:price:currency"]"#,
    "[data-currency]",
];

const GENERIC_IMAGES: &[&str] = &[r#"meta[property="og:image"]"#];

const STRUCK_CLASSES: &[&str] = &["old-price", "price-old", "line-through", "before-discount"];

/// CSS selectors for one site. Empty lists fall through to the generic selectors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorSet {
    pub title: Vec<String>,
    pub price: Vec<String>,
    pub original_price: Vec<String>,
    pub currency: Vec<String>,
    pub images: Vec<String>,
}

/// Per-domain selector rules, keyed by host name.
///
/// Loaded from a JSON object such as
/// `{"shop.example": {"title": ["h1.name"], "price": [".amount"]}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomRules {
    domains: HashMap<String, SelectorSet>,
}

impl DomRules {
    pub fn new(domains: HashMap<String, SelectorSet>) -> Self {
        Self { domains }
    }

    pub fn load_file(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!("Failed to read selector rules {}: {e}", path.display()))
        })?;
        let rules: Self = serde_json::from_str(&raw).map_err(|e| {
            AppError::ConfigError(format!("Invalid selector rules {}: {e}", path.display()))
        })?;
        for (domain, set) in &rules.domains {
            let all = set
                .title
                .iter()
                .chain(&set.price)
                .chain(&set.original_price)
                .chain(&set.currency)
                .chain(&set.images);
            for css in all {
                Selector::parse(css).map_err(|e| {
                    AppError::ConfigError(format!("Bad selector '{css}' for {domain}: {e}"))
                })?;
            }
        }
        Ok(rules)
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Rules for `domain`, also matching `www.` and other subdomains of a
    /// configured host. The most specific configured host wins.
    pub fn for_domain(&self, domain: &str) -> Option<&SelectorSet> {
        std::iter::successors(Some(domain), |&host| host.split_once('.').map(|(_, parent)| parent))
            .find_map(|host| self.domains.get(host))
    }
}

pub fn extract(page: &FetchedPage, rules: &DomRules, config: &CascadeConfig) -> Option<Candidate> {
    let document = Html::parse_document(&page.html);
    let site = domain_of(&page.url)
        .ok()
        .and_then(|d| rules.for_domain(&d).cloned())
        .unwrap_or_default();

    let title = candidates(&document, &site.title, GENERIC_TITLE)
        .find_map(|el| non_empty(element_value(el)));

    let mut currency = None;
    let price = candidates(&document, &site.price, GENERIC_PRICE)
        .filter(|el| !is_struck(*el))
        .find_map(|el| {
            let text = price_text(el);
            if looks_like_product_id(&text, &page.url) {
                return None;
            }
            let found = detect_currency(&text).or_else(|| {
                el.parent()
                    .and_then(ElementRef::wrap)
                    .and_then(|p| detect_currency(&p.text().collect::<String>()))
            });
            let value = parse_price(&text)?;
            is_plausible(value, found.as_deref()).then(|| {
                currency = found;
                value
            })
        });

    if currency.is_none() {
        currency = candidates(&document, &site.currency, GENERIC_CURRENCY)
            .find_map(|el| element_value(el).and_then(|c| normalize_currency(&c)));
    }

    let original_price = price.and_then(|current| {
        candidates(&document, &site.original_price, GENERIC_ORIGINAL_PRICE)
            .filter_map(|el| parse_price(&element_value(el)?))
            .find(|old| *old > current)
    });

    let images: Vec<String> = candidates(&document, &site.images, GENERIC_IMAGES)
        .filter_map(element_value)
        .collect();

    let found = [title.is_some(), price.is_some(), currency.is_some()]
        .into_iter()
        .filter(|f| *f)
        .count();
    if found == 0 {
        return None;
    }
    let confidence = (config.dom_ceiling * found as f64 / EXPECTED_FIELDS as f64)
        .clamp(config.dom_floor, config.dom_ceiling);

    Some(Candidate::new(
        ProductFields {
            title,
            price,
            currency,
            original_price,
            images,
            ..Default::default()
        },
        confidence,
    ))
}

/// Elements matched by the site selectors first, then by the generic ones.
fn candidates<'a>(
    document: &'a Html,
    site: &'a [String],
    generic: &'a [&'a str],
) -> impl Iterator<Item = ElementRef<'a>> + 'a {
    site.iter()
        .map(String::as_str)
        .chain(generic.iter().copied())
        .filter_map(|css| Selector::parse(css).ok())
        .flat_map(move |sel| document.select(&sel).collect::<Vec<_>>())
}

/// `content`/`data-*` attribute, or the element's collapsed text.
fn element_value(el: ElementRef<'_>) -> Option<String> {
    let attr = ["content", "data-price", "data-currency"]
        .iter()
        .find_map(|a| el.value().attr(a));
    let text = match attr {
        Some(value) => value.to_string(),
        None => el.text().collect::<Vec<_>>().join(" "),
    };
    non_empty(Some(text.split_whitespace().collect::<Vec<_>>().join(" ")))
}

/// Like [`element_value`], but skipping text inside struck-through descendants.
fn price_text(el: ElementRef<'_>) -> String {
    if let Some(attr) = el.value().attr("content").or(el.value().attr("data-price")) {
        return attr.to_string();
    }
    el.descendants()
        .filter_map(|node| node.value().as_text().map(|text| (node, text)))
        .filter(|(node, _)| {
            !node
                .ancestors()
                .take_while(|a| a.id() != el.id())
                .filter_map(ElementRef::wrap)
                .any(is_struck_element)
        })
        .map(|(_, text)| text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_struck(el: ElementRef<'_>) -> bool {
    is_struck_element(el) || el.ancestors().filter_map(ElementRef::wrap).any(is_struck_element)
}

fn is_struck_element(el: ElementRef<'_>) -> bool {
    let value = el.value();
    matches!(value.name(), "del" | "s" | "strike")
        || value
            .attr("style")
            .is_some_and(|s| s.replace(' ', "").contains("line-through"))
        || value
            .attr("class")
            .is_some_and(|c| STRUCK_CLASSES.iter().any(|m| c.contains(m)))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://shop.example/product/dkp-7788";

    fn run(html: &str) -> Option<Candidate> {
        extract(&FetchedPage::new(URL, html), &DomRules::default(), &CascadeConfig::default())
    }

    #[test]
    fn title_price_and_currency_score_the_ceiling() {
        let c = run(r#"<html><body><h1>گوشی موبایل</h1>
            <div class="product-price"><del>۲۵۰,۰۰۰</del> ۱۹۹,۰۰۰ تومان</div></body></html>"#)
        .unwrap();
        assert_eq!(c.fields.title.as_deref(), Some("گوشی موبایل"));
        assert_eq!(c.fields.price, Some(199_000.0));
        assert_eq!(c.fields.currency.as_deref(), Some("IRT"));
        assert_eq!(c.fields.original_price, Some(250_000.0));
        assert!((c.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn two_of_three_fields() {
        let c = run(r#"<html><body><h1>Widget X</h1><span class="product-price">199,000</span></body></html>"#)
            .unwrap();
        assert_eq!(c.fields.price, Some(199_000.0));
        assert_eq!(c.fields.currency, None);
        assert!((c.confidence - 0.8 * 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn title_only_is_clamped_to_floor() {
        let c = run("<html><body><h1>Widget X</h1></body></html>").unwrap();
        assert!((c.confidence - 0.3).abs() < 1e-9);
    }

    #[test]
    fn nothing_found_abstains() {
        assert!(run("<html><body><p>hello</p></body></html>").is_none());
    }

    #[test]
    fn installments_and_product_ids_are_skipped() {
        let c = run(r#"<html><body><h1>TV</h1>
            <span class="price-installment">ماهانه ۵۰۰,۰۰۰ تومان</span>
            <span class="product-code price-ref">7788</span>
            <span class="price">۲۴,۹۰۰,۰۰۰ تومان</span></body></html>"#)
        .unwrap();
        assert_eq!(c.fields.price, Some(24_900_000.0));
    }

    #[test]
    fn struck_prices_are_not_current() {
        let c = run(r#"<html><body><h1>Lamp</h1>
            <span class="old-price">$80.00</span>
            <span class="price">$59.99</span></body></html>"#)
        .unwrap();
        assert_eq!(c.fields.price, Some(59.99));
        assert_eq!(c.fields.original_price, Some(80.0));
        assert_eq!(c.fields.currency.as_deref(), Some("USD"));
    }

    #[test]
    fn domain_rules_take_precedence() {
        let mut domains = HashMap::new();
        domains.insert(
            "shop.example".to_string(),
            SelectorSet {
                title: vec![".name".into()],
                price: vec![".amount".into()],
                ..Default::default()
            },
        );
        let rules = DomRules::new(domains);
        let page = FetchedPage::new(
            "https://www.shop.example/item/1",
            r#"<html><body><h1>Site banner</h1><div class="name">Real Name</div>
               <b class="amount">1,250,000 ریال</b></body></html>"#,
        );
        let c = extract(&page, &rules, &CascadeConfig::default()).unwrap();
        assert_eq!(c.fields.title.as_deref(), Some("Real Name"));
        assert_eq!(c.fields.price, Some(1_250_000.0));
        assert_eq!(c.fields.currency.as_deref(), Some("IRR"));
    }

    #[test]
    fn most_specific_host_rules_win() {
        let set = |css: &str| SelectorSet {
            price: vec![css.to_string()],
            ..Default::default()
        };
        let rules = DomRules::new(HashMap::from([
            ("example.com".to_string(), set(".base")),
            ("shop.example.com".to_string(), set(".shop")),
            ("a.shop.example.com".to_string(), set(".a")),
        ]));

        let price_of = |domain: &str| rules.for_domain(domain).map(|s| s.price[0].as_str());
        assert_eq!(price_of("a.shop.example.com"), Some(".a"));
        assert_eq!(price_of("www.a.shop.example.com"), Some(".a"));
        assert_eq!(price_of("b.shop.example.com"), Some(".shop"));
        assert_eq!(price_of("blog.example.com"), Some(".base"));
        assert_eq!(price_of("notexample.com"), None);
    }

    #[test]
    fn load_rules_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, r#"{"shop.example": {"price": [".amount"]}}"#).unwrap();
        let rules = DomRules::load_file(&path).unwrap();
        assert_eq!(rules.len(), 1);
        assert!(rules.for_domain("shop.example").is_some());
        assert!(rules.for_domain("other.example").is_none());

        std::fs::write(&path, r#"{"shop.example": {"price": ["[[["]}}"#).unwrap();
        assert!(DomRules::load_file(&path).is_err());
    }
}
