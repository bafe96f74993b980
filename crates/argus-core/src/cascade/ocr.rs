//! Last-resort extraction from the page screenshot.

use super::price::{detect_currency, is_plausible, parse_price};
use super::{Candidate, CascadeConfig};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::error::AppError;
use crate::models::{FetchedPage, ProductFields};
use crate::traits::{OcrEngine, TextRegion};

/// Fields OCR looks for: title and price.
const EXPECTED_FIELDS: usize = 2;

pub(crate) async fn extract<R: OcrEngine>(
    ocr: &R,
    breaker: &CircuitBreaker,
    page: &FetchedPage,
    config: &CascadeConfig,
) -> Option<Candidate> {
    let image = page.screenshot.as_deref()?;
    let deadline = config.ocr_timeout;
    let outcome = breaker
        .call(|| async {
            match tokio::time::timeout(deadline, ocr.recognize(image)).await {
                Ok(result) => result,
                Err(_) => Err(AppError::Timeout(deadline)),
            }
        })
        .await;

    let regions = match outcome {
        Ok(regions) => regions,
        Err(CircuitBreakerError::Open { .. }) => {
            tracing::debug!(url = %page.url, "OCR circuit open, skipping");
            return None;
        }
        Err(CircuitBreakerError::Inner(e)) => {
            tracing::warn!(url = %page.url, error = %e, "OCR call failed");
            return None;
        }
    };
    let regions: Vec<&TextRegion> = regions
        .iter()
        .filter(|r| !r.text.trim().is_empty() && r.confidence.is_finite())
        .collect();

    let price_index = find_price(&regions);
    let title_index = find_title(&regions, price_index);

    let found: Vec<&TextRegion> = [title_index, price_index]
        .into_iter()
        .flatten()
        .map(|i| regions[i])
        .collect();
    if found.is_empty() {
        return None;
    }
    let mean = found.iter().map(|r| r.confidence.clamp(0.0, 1.0)).sum::<f64>() / found.len() as f64;
    let fraction = found.len() as f64 / EXPECTED_FIELDS as f64;

    let price_region = price_index.map(|i| regions[i]);
    let fields = ProductFields {
        title: title_index.map(|i| regions[i].text.trim().to_string()),
        price: price_region.and_then(|r| parse_price(&r.text)),
        currency: price_region.and_then(|r| detect_currency(&r.text)),
        ..Default::default()
    };

    Some(Candidate::new(fields, (mean * fraction).min(config.ocr_ceiling)))
}

/// A region naming a currency wins; otherwise a mostly-numeric one.
fn find_price(regions: &[&TextRegion]) -> Option<usize> {
    let priced = |r: &TextRegion| {
        let currency = detect_currency(&r.text);
        parse_price(&r.text)
            .filter(|p| is_plausible(*p, currency.as_deref()))
            .map(|_| currency.is_some())
    };
    regions
        .iter()
        .position(|r| priced(*r) == Some(true))
        .or_else(|| {
            regions
                .iter()
                .position(|r| priced(*r) == Some(false) && mostly_digits(&r.text))
        })
}

/// The tallest wordy region that is not the price.
fn find_title(regions: &[&TextRegion], price: Option<usize>) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, region) in regions.iter().enumerate() {
        if Some(i) == price || !wordy(&region.text) {
            continue;
        }
        let height = region.height();
        if best.is_none_or(|(_, h)| height > h) {
            best = Some((i, height));
        }
    }
    best.map(|(i, _)| i)
}

fn mostly_digits(text: &str) -> bool {
    let chars: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    let digits = chars.iter().filter(|c| c.is_numeric()).count();
    !chars.is_empty() && digits * 2 >= chars.len()
}

fn wordy(text: &str) -> bool {
    let letters = text.chars().filter(|c| c.is_alphabetic()).count();
    let digits = text.chars().filter(|c| c.is_numeric()).count();
    letters >= 3 && letters > digits
}
