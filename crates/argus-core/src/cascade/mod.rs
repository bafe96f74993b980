//! Extraction strategy cascade.
//!
//! Strategies run in the configured order. Each one either abstains or
//! produces a [`Candidate`] with a confidence score; the first candidate at
//! or above the acceptance threshold wins. If none reaches it, the most
//! confident candidate is returned instead. Fields are never merged across
//! strategies.

pub mod dom;
pub mod llm;
pub mod ocr;
pub mod price;
pub mod structured;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::AppError;
use crate::models::{ExtractionResult, FetchedPage, ProductFields, StrategyKind};
use crate::traits::{Cleaner, LlmOracle, OcrEngine};

pub use dom::{DomRules, SelectorSet};

/// Tuning for the cascade. Hot-reloadable: every run reads the current snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    pub order: Vec<StrategyKind>,
    pub acceptance_threshold: f64,
    pub structured_ceiling: f64,
    /// Subtracted from `structured_ceiling` per missing optional field.
    pub optional_field_penalty: f64,
    pub dom_ceiling: f64,
    pub dom_floor: f64,
    pub llm_ceiling: f64,
    pub ocr_ceiling: f64,
    #[serde(with = "crate::config::millis")]
    pub llm_timeout: Duration,
    #[serde(with = "crate::config::millis")]
    pub ocr_timeout: Duration,
    /// Cleaned text beyond this many characters is not sent to the oracle.
    pub max_llm_chars: usize,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            order: StrategyKind::DEFAULT_ORDER.to_vec(),
            acceptance_threshold: 0.75,
            structured_ceiling: 0.9,
            optional_field_penalty: 0.02,
            dom_ceiling: 0.8,
            dom_floor: 0.3,
            llm_ceiling: 0.85,
            ocr_ceiling: 0.5,
            llm_timeout: Duration::from_secs(30),
            ocr_timeout: Duration::from_secs(20),
            max_llm_chars: 12_000,
        }
    }
}

impl CascadeConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.order.is_empty() {
            return Err(AppError::ConfigError(
                "cascade order must name at least one strategy".into(),
            ));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.order.iter().find(|k| !seen.insert(**k)) {
            return Err(AppError::ConfigError(format!(
                "strategy {dup} appears twice in cascade order"
            )));
        }
        let scores = [
            ("acceptance_threshold", self.acceptance_threshold),
            ("structured_ceiling", self.structured_ceiling),
            ("optional_field_penalty", self.optional_field_penalty),
            ("dom_ceiling", self.dom_ceiling),
            ("dom_floor", self.dom_floor),
            ("llm_ceiling", self.llm_ceiling),
            ("ocr_ceiling", self.ocr_ceiling),
        ];
        for (name, value) in scores {
            if !(0.0..=1.0).contains(&value) {
                return Err(AppError::ConfigError(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.dom_floor > self.dom_ceiling {
            return Err(AppError::ConfigError(
                "dom_floor must not exceed dom_ceiling".into(),
            ));
        }
        Ok(())
    }
}

/// A strategy's proposal for one page.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub fields: ProductFields,
    pub confidence: f64,
}

impl Candidate {
    pub fn new(fields: ProductFields, confidence: f64) -> Self {
        Self { fields, confidence }
    }
}

/// Runs the extraction strategies against fetched pages.
#[derive(Clone)]
pub struct Cascade<C, O, R> {
    cleaner: C,
    oracle: O,
    ocr: R,
    dom_rules: Arc<DomRules>,
    llm_breaker: CircuitBreaker,
    ocr_breaker: CircuitBreaker,
}

impl<C, O, R> Cascade<C, O, R>
where
    C: Cleaner,
    O: LlmOracle,
    R: OcrEngine,
{
    pub fn new(cleaner: C, oracle: O, ocr: R, breaker: CircuitBreakerConfig) -> Self {
        Self {
            cleaner,
            oracle,
            ocr,
            dom_rules: Arc::new(DomRules::default()),
            llm_breaker: CircuitBreaker::new("llm", breaker.clone()),
            ocr_breaker: CircuitBreaker::new("ocr", breaker),
        }
    }

    /// Use per-domain selector rules for the DOM strategy.
    pub fn with_dom_rules(mut self, rules: DomRules) -> Self {
        self.dom_rules = Arc::new(rules);
        self
    }

    pub fn llm_breaker(&self) -> &CircuitBreaker {
        &self.llm_breaker
    }

    pub fn ocr_breaker(&self) -> &CircuitBreaker {
        &self.ocr_breaker
    }

    /// Extracts product fields from `page`.
    ///
    /// Fails with [`AppError::NoExtractableData`] when every strategy abstains.
    pub async fn run(
        &self,
        page: &FetchedPage,
        config: &CascadeConfig,
    ) -> Result<ExtractionResult, AppError> {
        let mut best: Option<(StrategyKind, Candidate)> = None;
        let mut attempted: u32 = 0;

        for (index, kind) in config.order.iter().copied().enumerate() {
            attempted += 1;
            let Some(candidate) = self.attempt(kind, page, config).await else {
                tracing::debug!(url = %page.url, strategy = %kind, "Strategy abstained");
                continue;
            };
            tracing::debug!(
                url = %page.url,
                strategy = %kind,
                confidence = candidate.confidence,
                "Strategy produced candidate"
            );

            if candidate.confidence >= config.acceptance_threshold {
                return Ok(ExtractionResult {
                    strategy_used: kind,
                    confidence: candidate.confidence,
                    fields: candidate.fields,
                    fallback_count: index as u32,
                });
            }
            if best
                .as_ref()
                .is_none_or(|(_, b)| candidate.confidence > b.confidence)
            {
                best = Some((kind, candidate));
            }
        }

        match best {
            Some((kind, candidate)) => {
                tracing::info!(
                    url = %page.url,
                    strategy = %kind,
                    confidence = candidate.confidence,
                    "No strategy met the acceptance threshold, using best candidate"
                );
                Ok(ExtractionResult {
                    strategy_used: kind,
                    confidence: candidate.confidence,
                    fields: candidate.fields,
                    fallback_count: attempted,
                })
            }
            None => Err(AppError::NoExtractableData(page.url.clone())),
        }
    }

    async fn attempt(
        &self,
        kind: StrategyKind,
        page: &FetchedPage,
        config: &CascadeConfig,
    ) -> Option<Candidate> {
        let candidate = match kind {
            StrategyKind::StructuredData => structured::extract(&page.html, config),
            StrategyKind::DomHeuristic => dom::extract(page, &self.dom_rules, config),
            StrategyKind::LlmAssisted => {
                llm::extract(&self.cleaner, &self.oracle, &self.llm_breaker, page, config).await
            }
            StrategyKind::OcrFallback => {
                ocr::extract(&self.ocr, &self.ocr_breaker, page, config).await
            }
        }?;
        candidate.confidence.is_finite().then_some(candidate)
    }
}
