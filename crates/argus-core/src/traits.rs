use std::future::Future;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{FetchedPage, NewResult, StoredResult};
use crate::pool::IdentityLease;

/// Fetches a page through the network identity held by `lease`.
///
/// Implementations report a bot wall as [`AppError::Blocked`], a non-success
/// status as [`AppError::HttpStatus`], and their own deadline as
/// [`AppError::Timeout`]. The worker also wraps every call in a deadline.
pub trait PageFetcher: Send + Sync + Clone {
    fn fetch(
        &self,
        url: &str,
        lease: &IdentityLease,
    ) -> impl Future<Output = Result<FetchedPage, AppError>> + Send;
}

/// Converts raw HTML into clean Markdown text.
pub trait Cleaner: Send + Sync + Clone {
    fn clean(&self, html: &str) -> Result<String, AppError>;
}

/// Structured answer from an LLM oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleResponse {
    /// Raw JSON fields; validated against the product schema before use.
    pub fields: serde_json::Value,
    /// The oracle's self-reported confidence in `[0, 1]`.
    pub confidence: f64,
}

/// Extracts product fields from page text. `Ok(None)` means the oracle abstains.
pub trait LlmOracle: Send + Sync + Clone {
    fn extract(
        &self,
        text: &str,
        schema_hint: &serde_json::Value,
    ) -> impl Future<Output = Result<Option<OracleResponse>, AppError>> + Send;
}

/// A recognized text block in a screenshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRegion {
    pub text: String,
    pub confidence: f64,
    /// Four `[x, y]` corners, clockwise from top-left.
    #[serde(default)]
    pub bbox: Vec<[f64; 2]>,
}

impl TextRegion {
    pub fn new(text: impl Into<String>, confidence: f64) -> Self {
        Self {
            text: text.into(),
            confidence,
            bbox: Vec::new(),
        }
    }

    /// Height of the bounding box, or 0 when no box was reported.
    pub fn height(&self) -> f64 {
        let ys = self.bbox.iter().map(|p| p[1]);
        let (min, max) = ys.fold((f64::MAX, f64::MIN), |(lo, hi), y| (lo.min(y), hi.max(y)));
        if self.bbox.is_empty() { 0.0 } else { max - min }
    }
}

/// Recognizes text in an image.
pub trait OcrEngine: Send + Sync + Clone {
    fn recognize(
        &self,
        image: &[u8],
    ) -> impl Future<Output = Result<Vec<TextRegion>, AppError>> + Send;
}

/// Persists and retrieves extraction results.
pub trait ResultStore: Send + Sync + Clone {
    /// Save a new result. Returns the generated UUID.
    fn save(&self, result: &NewResult) -> impl Future<Output = Result<Uuid, AppError>> + Send;

    fn get(&self, id: Uuid) -> impl Future<Output = Result<Option<StoredResult>, AppError>> + Send;

    /// Most recent result for a canonical URL.
    fn latest_for_url(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<Option<StoredResult>, AppError>> + Send;
}

/// A no-op ResultStore for use when persistence is not needed.
#[derive(Debug, Clone)]
pub struct NullStore;

impl ResultStore for NullStore {
    async fn save(&self, _result: &NewResult) -> Result<Uuid, AppError> {
        Ok(Uuid::new_v4())
    }

    async fn get(&self, _id: Uuid) -> Result<Option<StoredResult>, AppError> {
        Ok(None)
    }

    async fn latest_for_url(&self, _url: &str) -> Result<Option<StoredResult>, AppError> {
        Ok(None)
    }
}

/// Oracle used when no LLM endpoint is configured. Always abstains.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOracle;

impl LlmOracle for NoOracle {
    async fn extract(
        &self,
        _text: &str,
        _schema_hint: &serde_json::Value,
    ) -> Result<Option<OracleResponse>, AppError> {
        Ok(None)
    }
}

/// OCR engine used when no OCR service is configured. Finds nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOcr;

impl OcrEngine for NoOcr {
    async fn recognize(&self, _image: &[u8]) -> Result<Vec<TextRegion>, AppError> {
        Ok(Vec::new())
    }
}

/// An unconfigured oracle abstains.
impl<O: LlmOracle> LlmOracle for Option<O> {
    async fn extract(
        &self,
        text: &str,
        schema_hint: &serde_json::Value,
    ) -> Result<Option<OracleResponse>, AppError> {
        match self {
            Some(oracle) => oracle.extract(text, schema_hint).await,
            None => Ok(None),
        }
    }
}

/// An unconfigured OCR engine finds nothing.
impl<R: OcrEngine> OcrEngine for Option<R> {
    async fn recognize(&self, image: &[u8]) -> Result<Vec<TextRegion>, AppError> {
        match self {
            Some(ocr) => ocr.recognize(image).await,
            None => Ok(Vec::new()),
        }
    }
}
