use std::time::Duration;

use argus_core::error::AppError;
use argus_core::traits::{OcrEngine, TextRegion};
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for a PaddleOCR HTTP service.
///
/// Posts the screenshot as multipart field `image` to `{base_url}/ocr` and
/// reads back `{success, text_blocks: [{text, confidence, bbox}], full_text}`.
#[derive(Clone)]
pub struct PaddleOcrClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct OcrResponse {
    success: bool,
    #[serde(default)]
    text_blocks: Vec<TextBlock>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct TextBlock {
    text: String,
    confidence: f64,
    #[serde(default)]
    bbox: Vec<[f64; 2]>,
}

impl PaddleOcrClient {
    pub fn new(base_url: &str) -> Result<Self, AppError> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    /// `GET {base_url}/health`.
    pub async fn health_check(&self) -> Result<(), AppError> {
        let resp = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(|e| AppError::OcrError(format!("OCR service unreachable: {e}")))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(AppError::OcrError(format!(
                "OCR health check returned HTTP {}",
                resp.status().as_u16()
            )))
        }
    }
}

impl OcrEngine for PaddleOcrClient {
    async fn recognize(&self, image: &[u8]) -> Result<Vec<TextRegion>, AppError> {
        // The service checks the file extension.
        let part = Part::bytes(image.to_vec())
            .file_name("screenshot.png")
            .mime_str("image/png")
            .map_err(|e| AppError::OcrError(e.to_string()))?;
        let form = Form::new().part("image", part);

        let response = self
            .client
            .post(format!("{}/ocr", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(self.timeout)
                } else {
                    AppError::OcrError(format!("OCR request failed: {e}"))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::OcrError(format!("Failed to read OCR response: {e}")))?;
        let parsed: OcrResponse = serde_json::from_str(&body).map_err(|e| {
            AppError::OcrError(format!("Unexpected OCR response (HTTP {}): {e}", status.as_u16()))
        })?;

        if !status.is_success() || !parsed.success {
            return Err(AppError::OcrError(
                parsed
                    .error
                    .unwrap_or_else(|| format!("OCR failed with HTTP {}", status.as_u16())),
            ));
        }

        tracing::debug!(blocks = parsed.text_blocks.len(), "OCR recognized text");
        Ok(parsed
            .text_blocks
            .into_iter()
            .map(|b| TextRegion {
                text: b.text,
                confidence: b.confidence,
                bbox: b.bbox,
            })
            .collect())
    }
}
