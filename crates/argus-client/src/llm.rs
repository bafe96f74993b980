use std::time::Duration;

use argus_core::error::AppError;
use argus_core::traits::{LlmOracle, OracleResponse};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_CONFIDENCE: f64 = 0.7;
const DEFAULT_SYSTEM_PROMPT: &str = "You extract product data from e-commerce pages. \
Read the page text and fill the product object according to the schema. Prices are plain \
numbers without separators; keep the currency the page shows (e.g. IRT for Toman, IRR for \
Rial). If the page is not a single product page, set found to false and product to null. \
Set confidence between 0 and 1 to reflect how sure you are. Respond ONLY with JSON.";

/// OpenAI-compatible LLM oracle for product extraction.
///
/// Works with any OpenAI-compatible chat completions API, including:
/// - OpenAI directly (`https://api.openai.com/v1`)
/// - Ollama (`http://localhost:11434/v1`)
/// - Gemini via compatibility layer (`https://generativelanguage.googleapis.com/v1beta/openai`)
///
/// The model answers with `{found, confidence, product}`; `found: false`
/// becomes an abstention.
#[derive(Clone)]
pub struct OpenAiOracle {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
    temperature: f32,
    default_confidence: f64,
    system_prompt: String,
}

impl OpenAiOracle {
    pub fn new(api_key: &str, model: &str) -> Result<Self, AppError> {
        Self::with_base_url(api_key, model, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, model: &str, base_url: &str) -> Result<Self, AppError> {
        Self::build(api_key, model, base_url, DEFAULT_LLM_TIMEOUT)
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, AppError> {
        let rebuilt = Self::build(&self.api_key, &self.model, &self.base_url, timeout)?;
        Ok(Self {
            client: rebuilt.client,
            timeout,
            ..self
        })
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Confidence assumed when the model omits one.
    pub fn with_default_confidence(mut self, confidence: f64) -> Self {
        self.default_confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    fn build(
        api_key: &str,
        model: &str,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout,
            temperature: 0.0,
            default_confidence: DEFAULT_CONFIDENCE,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        })
    }

    fn answer_schema(product: &Value) -> Value {
        json!({
            "type": "object",
            "required": ["found", "confidence", "product"],
            "properties": {
                "found": {"type": "boolean"},
                "confidence": {"type": "number", "minimum": 0, "maximum": 1},
                "product": {"anyOf": [product, {"type": "null"}]}
            }
        })
    }

    /// Turns the model's message content into an oracle response.
    fn parse_answer(&self, content: &str) -> Result<Option<OracleResponse>, AppError> {
        let answer: Value = serde_json::from_str(strip_code_fence(content)).map_err(|e| {
            AppError::SchemaValidationError(format!("LLM returned invalid JSON: {e}. Raw: {content}"))
        })?;

        if answer.get("found").and_then(Value::as_bool) == Some(false) {
            return Ok(None);
        }
        let fields = match answer.get("product") {
            Some(Value::Object(map)) if !map.is_empty() => Value::Object(map.clone()),
            Some(Value::Null) => return Ok(None),
            // Some models answer with the bare product object.
            None if answer.get("title").is_some() => answer.clone(),
            _ => return Ok(None),
        };
        let confidence = answer
            .get("confidence")
            .and_then(Value::as_f64)
            .filter(|c| c.is_finite())
            .unwrap_or(self.default_confidence)
            .clamp(0.0, 1.0);

        Ok(Some(OracleResponse { fields, confidence }))
    }
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

// ---- OpenAI API types ----

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_schema: Option<JsonSchemaWrapper>,
}

#[derive(Serialize)]
struct JsonSchemaWrapper {
    name: String,
    strict: bool,
    schema: Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

impl LlmOracle for OpenAiOracle {
    async fn extract(
        &self,
        text: &str,
        schema_hint: &Value,
    ) -> Result<Option<OracleResponse>, AppError> {
        let url = format!("{}/chat/completions", self.base_url);
        let schema = Self::answer_schema(schema_hint);

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: self.system_prompt.clone(),
                },
                Message {
                    role: "user".to_string(),
                    content: format!(
                        "Answer according to this JSON schema:\n```json\n{}\n```\n\nPage text:\n\n{}",
                        serde_json::to_string_pretty(&schema)?,
                        text
                    ),
                },
            ],
            temperature: self.temperature,
            // Strict mode would force every optional product field to be required.
            response_format: Some(ResponseFormat {
                format_type: "json_schema".to_string(),
                json_schema: Some(JsonSchemaWrapper {
                    name: "product_extraction".to_string(),
                    strict: false,
                    schema,
                }),
            }),
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(self.timeout)
                } else if e.is_connect() {
                    AppError::NetworkError(format!("Connection failed: {e}"))
                } else {
                    AppError::HttpError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            if status_code == 429 {
                return Err(AppError::RateLimitExceeded);
            }
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("HTTP {status_code}: {body}"));

            return Err(AppError::LlmError {
                message,
                status_code,
                retryable: status_code >= 500,
            });
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to parse LLM response: {e}")))?;

        let content = chat_response
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .ok_or_else(|| AppError::LlmError {
                message: "Empty response from LLM".into(),
                status_code: 200,
                retryable: false,
            })?;

        let answer = self.parse_answer(content)?;
        tracing::debug!(
            model = %self.model,
            found = answer.is_some(),
            confidence = answer.as_ref().map(|a| a.confidence),
            "Oracle answered"
        );
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    fn oracle() -> OpenAiOracle {
        OpenAiOracle::with_base_url("sk-test", "test-model", "http://localhost:1/v1/").unwrap()
    }

    /// Answers one request with `status` and a JSON `body`; returns the base URL.
    async fn mock_api(status: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64 * 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
        });
        format!("http://{addr}/v1")
    }

    fn chat_body(content: &str) -> String {
        json!({"choices": [{"message": {"content": content}}]}).to_string()
    }

    #[test]
    fn test_base_url_is_normalized() {
        assert_eq!(oracle().base_url, "http://localhost:1/v1");
    }

    #[test]
    fn test_parse_found_product() {
        let answer = oracle()
            .parse_answer(r#"{"found": true, "confidence": 0.8, "product": {"title": "Widget X", "price": 199000}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(answer.fields["title"], "Widget X");
        assert_eq!(answer.confidence, 0.8);
    }

    #[test]
    fn test_parse_abstention() {
        let o = oracle();
        assert!(o.parse_answer(r#"{"found": false, "confidence": 0.9, "product": null}"#).unwrap().is_none());
        assert!(o.parse_answer(r#"{"found": true, "confidence": 0.9, "product": null}"#).unwrap().is_none());
        assert!(o.parse_answer(r#"{"found": true, "confidence": 0.9, "product": {}}"#).unwrap().is_none());
    }

    #[test]
    fn test_parse_defaults_and_clamps_confidence() {
        let o = oracle().with_default_confidence(0.6);
        let answer = o
            .parse_answer(r#"{"found": true, "product": {"title": "A", "price": 1}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(answer.confidence, 0.6);

        let answer = o
            .parse_answer(r#"{"found": true, "confidence": 7, "product": {"title": "A", "price": 1}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(answer.confidence, 1.0);
    }

    #[test]
    fn test_parse_bare_product_in_code_fence() {
        let answer = oracle()
            .parse_answer("```json\n{\"title\": \"Widget X\", \"price\": 5}\n```")
            .unwrap()
            .unwrap();
        assert_eq!(answer.fields["price"], 5);
        assert_eq!(answer.confidence, DEFAULT_CONFIDENCE);
    }

    #[test]
    fn test_parse_garbage_is_schema_error() {
        let err = oracle().parse_answer("I think the price is 5").unwrap_err();
        assert!(matches!(err, AppError::SchemaValidationError(_)));
    }

    #[tokio::test]
    async fn test_extract_round_trip() {
        let content = r#"{"found": true, "confidence": 0.8, "product": {"title": "Widget X", "price": 199000, "currency": "IRT"}}"#;
        let base = mock_api("200 OK", chat_body(content)).await;
        let oracle = OpenAiOracle::with_base_url("sk-test", "m", &base).unwrap();

        let answer = oracle
            .extract("Widget X 199,000 Toman", &json!({"type": "object"}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer.fields["currency"], "IRT");
        assert_eq!(answer.confidence, 0.8);
    }

    #[tokio::test]
    async fn test_rate_limit_maps_to_error() {
        let base = mock_api("429 Too Many Requests", "{}".into()).await;
        let oracle = OpenAiOracle::with_base_url("sk-test", "m", &base).unwrap();
        let err = oracle.extract("text", &json!({})).await.unwrap_err();
        assert!(matches!(err, AppError::RateLimitExceeded));
        assert!(err.should_trip_circuit());
    }

    #[tokio::test]
    async fn test_server_error_is_retryable_llm_error() {
        let body = json!({"error": {"message": "model overloaded"}}).to_string();
        let base = mock_api("503 Service Unavailable", body).await;
        let oracle = OpenAiOracle::with_base_url("sk-test", "m", &base).unwrap();
        match oracle.extract("text", &json!({})).await.unwrap_err() {
            AppError::LlmError {
                message,
                status_code,
                retryable,
            } => {
                assert_eq!(message, "model overloaded");
                assert_eq!(status_code, 503);
                assert!(retryable);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
