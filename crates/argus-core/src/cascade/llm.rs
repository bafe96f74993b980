//! LLM-assisted extraction: cleaned page text goes to the oracle, whose
//! answer is schema-checked before it may become a candidate.

use std::sync::LazyLock;

use serde_json::{Value, json};

use super::price::normalize_currency;
use super::{Candidate, CascadeConfig};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::error::AppError;
use crate::models::{FetchedPage, ProductFields};
use crate::traits::{Cleaner, LlmOracle};

static PRODUCT_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
    let nullable_string = json!({"type": ["string", "null"]});
    let nullable_price = json!({"type": ["number", "null"], "exclusiveMinimum": 0});
    json!({
        "type": "object",
        "required": ["title", "price"],
        "properties": {
            "title": {"type": "string", "minLength": 1},
            "price": {"type": "number", "exclusiveMinimum": 0},
            "currency": nullable_string,
            "original_price": nullable_price,
            "availability": nullable_string,
            "product_id": nullable_string,
            "brand": nullable_string,
            "description": nullable_string,
            "images": {"type": "array", "items": {"type": "string"}},
            "variants": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": nullable_string,
                        "sku": nullable_string,
                        "price": nullable_price,
                        "availability": nullable_string
                    }
                }
            }
        }
    })
});

static VALIDATOR: LazyLock<jsonschema::Validator> =
    LazyLock::new(|| jsonschema::validator_for(product_schema_hint()).expect("static product schema"));

/// JSON schema of the product fields, sent to the oracle as its output contract.
pub fn product_schema_hint() -> &'static Value {
    &PRODUCT_SCHEMA
}

pub(crate) async fn extract<C, O>(
    cleaner: &C,
    oracle: &O,
    breaker: &CircuitBreaker,
    page: &FetchedPage,
    config: &CascadeConfig,
) -> Option<Candidate>
where
    C: Cleaner,
    O: LlmOracle,
{
    let cleaned = match cleaner.clean(&page.html) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(url = %page.url, error = %e, "Cleaner failed, skipping oracle");
            return None;
        }
    };
    let text: String = cleaned.trim().chars().take(config.max_llm_chars).collect();
    if text.is_empty() {
        return None;
    }

    let deadline = config.llm_timeout;
    let outcome = breaker
        .call(|| async {
            match tokio::time::timeout(deadline, oracle.extract(&text, product_schema_hint())).await {
                Ok(result) => result,
                Err(_) => Err(AppError::Timeout(deadline)),
            }
        })
        .await;

    let response = match outcome {
        Ok(Some(response)) => response,
        Ok(None) => {
            tracing::debug!(url = %page.url, "Oracle abstained");
            return None;
        }
        Err(CircuitBreakerError::Open { retry_after, .. }) => {
            tracing::debug!(
                url = %page.url,
                retry_after_secs = retry_after.as_secs(),
                "LLM circuit open, skipping oracle"
            );
            return None;
        }
        Err(CircuitBreakerError::Inner(e)) => {
            tracing::warn!(url = %page.url, error = %e, "Oracle call failed");
            return None;
        }
    };

    if !response.confidence.is_finite() {
        return None;
    }
    if let Err(e) = VALIDATOR.validate(&response.fields) {
        tracing::warn!(url = %page.url, error = %e, "Oracle output failed schema validation");
        return None;
    }
    let mut fields: ProductFields = match serde_json::from_value(response.fields) {
        Ok(fields) => fields,
        Err(e) => {
            tracing::warn!(url = %page.url, error = %e, "Oracle output did not deserialize");
            return None;
        }
    };
    fields.currency = fields.currency.as_deref().and_then(normalize_currency);
    if !fields.has_required() {
        return None;
    }

    Some(Candidate::new(
        fields,
        response.confidence.clamp(0.0, config.llm_ceiling),
    ))
}
