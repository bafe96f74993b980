use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// The extraction strategies, in their default cascade order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    StructuredData,
    DomHeuristic,
    LlmAssisted,
    OcrFallback,
}

impl StrategyKind {
    pub const DEFAULT_ORDER: [StrategyKind; 4] = [
        StrategyKind::StructuredData,
        StrategyKind::DomHeuristic,
        StrategyKind::LlmAssisted,
        StrategyKind::OcrFallback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::StructuredData => "structured_data",
            StrategyKind::DomHeuristic => "dom_heuristic",
            StrategyKind::LlmAssisted => "llm_assisted",
            StrategyKind::OcrFallback => "ocr_fallback",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "structured_data" => Ok(StrategyKind::StructuredData),
            "dom_heuristic" => Ok(StrategyKind::DomHeuristic),
            "llm_assisted" => Ok(StrategyKind::LlmAssisted),
            "ocr_fallback" => Ok(StrategyKind::OcrFallback),
            _ => Err(format!("Unknown strategy: {s}")),
        }
    }
}

/// One purchasable variant of a product (size, colour, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability: Option<String>,
}

/// Structured product fields produced by a single strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductFields {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub original_price: Option<f64>,
    #[serde(default)]
    pub availability: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub variants: Vec<Variant>,
}

impl ProductFields {
    /// True when a non-blank title and a positive price are present.
    pub fn has_required(&self) -> bool {
        self.title.as_deref().is_some_and(|t| !t.trim().is_empty())
            && self.price.is_some_and(|p| p > 0.0)
    }

    /// Number of optional fields left empty.
    pub fn missing_optional_count(&self) -> usize {
        [
            self.currency.is_none(),
            self.original_price.is_none(),
            self.availability.is_none(),
            self.product_id.is_none(),
            self.brand.is_none(),
            self.description.is_none(),
            self.images.is_empty(),
            self.variants.is_empty(),
        ]
        .into_iter()
        .filter(|missing| *missing)
        .count()
    }

    /// Percentage off the original price, rounded to one decimal.
    ///
    /// Returns `None` unless the original price is strictly above the current one.
    pub fn discount_percent(&self) -> Option<f64> {
        let price = self.price?;
        let original = self.original_price?;
        if original <= price || original <= 0.0 {
            return None;
        }
        Some(((original - price) / original * 1000.0).round() / 10.0)
    }
}

/// The accepted output of the extraction cascade for one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub strategy_used: StrategyKind,
    pub confidence: f64,
    pub fields: ProductFields,
    /// Strategies tried before the accepted one (or all tried, if none met the threshold).
    pub fallback_count: u32,
}

/// Raw page content returned by a fetch capability.
#[derive(Debug, Clone, Default)]
pub struct FetchedPage {
    /// Final URL after redirects.
    pub url: String,
    pub html: String,
    /// PNG screenshot, when the fetcher captures one.
    pub screenshot: Option<Vec<u8>>,
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    /// Updated session state (cookies) to hand back to the identity pool.
    pub session_state: Option<serde_json::Value>,
}

impl FetchedPage {
    pub fn new(url: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            html: html.into(),
            status_code: 200,
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = status;
        self
    }

    pub fn with_screenshot(mut self, png: Vec<u8>) -> Self {
        self.screenshot = Some(png);
        self
    }

    pub fn with_session_state(mut self, state: serde_json::Value) -> Self {
        self.session_state = Some(state);
        self
    }
}

/// A persisted extraction result.
#[derive(Debug, Clone, Serialize)]
pub struct StoredResult {
    pub id: Uuid,
    pub task_id: Uuid,
    pub url: String,
    /// `<link rel="canonical">` of the page, when it differs from the task URL.
    pub canonical_link: Option<String>,
    pub result: ExtractionResult,
    /// SHA-256 of the fetched HTML.
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

/// DTO for inserting a new result.
#[derive(Debug, Clone)]
pub struct NewResult {
    pub task_id: Uuid,
    pub url: String,
    pub canonical_link: Option<String>,
    pub result: ExtractionResult,
    pub content_hash: String,
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
