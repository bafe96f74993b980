//! Test utilities: mock implementations of the core capability traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{FetchedPage, NewResult, StoredResult};
use crate::pool::IdentityLease;
use crate::traits::{
    Cleaner, LlmOracle, OcrEngine, OracleResponse, PageFetcher, ResultStore, TextRegion,
};
use crate::worker::{WorkerEvent, WorkerReporter};

/// URL used by [`make_page`].
pub const PAGE_URL: &str = "https://shop.example/product/42";

/// A 200 page at [`PAGE_URL`] with the given HTML.
pub fn make_page(html: &str) -> FetchedPage {
    FetchedPage::new(PAGE_URL, html)
}

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher that returns queued pages.
#[derive(Clone, Default)]
pub struct MockFetcher {
    /// Queue of responses. Each call pops the first element.
    /// If empty, returns a bare page for the requested URL.
    responses: Arc<Mutex<Vec<Result<FetchedPage, AppError>>>>,
    /// `(url, identity_id)` per call.
    requests: Arc<Mutex<Vec<(String, String)>>>,
    delay: Option<Duration>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pages(responses: Vec<Result<FetchedPage, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            ..Default::default()
        }
    }

    pub fn with_error(error: AppError) -> Self {
        Self::with_pages(vec![Err(error)])
    }

    /// Sleeps before answering, to exercise deadlines.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requested(&self) -> Vec<(String, String)> {
        self.requests.lock().unwrap().clone()
    }
}

impl PageFetcher for MockFetcher {
    async fn fetch(&self, url: &str, lease: &IdentityLease) -> Result<FetchedPage, AppError> {
        self.requests
            .lock()
            .unwrap()
            .push((url.to_string(), lease.identity_id().to_string()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(FetchedPage::new(url, "<html><body>default</body></html>"))
        } else {
            responses.remove(0)
        }
    }
}

// ---------------------------------------------------------------------------
// MockCleaner
// ---------------------------------------------------------------------------

/// Mock cleaner that passes HTML through unchanged.
#[derive(Clone, Default)]
pub struct MockCleaner {
    fail: bool,
}

impl MockCleaner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error() -> Self {
        Self { fail: true }
    }
}

impl Cleaner for MockCleaner {
    fn clean(&self, html: &str) -> Result<String, AppError> {
        if self.fail {
            Err(AppError::CleanerError("mock cleaner error".into()))
        } else {
            Ok(html.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// MockOracle
// ---------------------------------------------------------------------------

/// Mock LLM oracle. Abstains once its queue is empty.
#[derive(Clone, Default)]
pub struct MockOracle {
    responses: Arc<Mutex<Vec<Result<Option<OracleResponse>, AppError>>>>,
    /// Text passed to each call.
    received: Arc<Mutex<Vec<String>>>,
    delay: Option<Duration>,
}

impl MockOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: Vec<Result<Option<OracleResponse>, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

impl LlmOracle for MockOracle {
    async fn extract(
        &self,
        text: &str,
        _schema_hint: &serde_json::Value,
    ) -> Result<Option<OracleResponse>, AppError> {
        self.received.lock().unwrap().push(text.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(None)
        } else {
            responses.remove(0)
        }
    }
}

// ---------------------------------------------------------------------------
// MockOcr
// ---------------------------------------------------------------------------

/// Mock OCR engine that recognizes the same regions on every call.
#[derive(Clone, Default)]
pub struct MockOcr {
    regions: Vec<TextRegion>,
    calls: Arc<Mutex<usize>>,
    delay: Option<Duration>,
}

impl MockOcr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_regions(regions: Vec<TextRegion>) -> Self {
        Self {
            regions,
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl OcrEngine for MockOcr {
    async fn recognize(&self, _image: &[u8]) -> Result<Vec<TextRegion>, AppError> {
        *self.calls.lock().unwrap() += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.regions.clone())
    }
}

// ---------------------------------------------------------------------------
// MockResultStore
// ---------------------------------------------------------------------------

/// Mock result store that records saved results in memory.
#[derive(Clone, Default)]
pub struct MockResultStore {
    saved: Arc<Mutex<Vec<(Uuid, NewResult)>>>,
}

impl MockResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved(&self) -> Vec<(Uuid, NewResult)> {
        self.saved.lock().unwrap().clone()
    }

    fn to_stored(id: Uuid, new: &NewResult) -> StoredResult {
        StoredResult {
            id,
            task_id: new.task_id,
            url: new.url.clone(),
            canonical_link: new.canonical_link.clone(),
            result: new.result.clone(),
            content_hash: new.content_hash.clone(),
            created_at: Utc::now(),
        }
    }
}

impl ResultStore for MockResultStore {
    async fn save(&self, result: &NewResult) -> Result<Uuid, AppError> {
        let id = Uuid::new_v4();
        self.saved.lock().unwrap().push((id, result.clone()));
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<StoredResult>, AppError> {
        let saved = self.saved.lock().unwrap();
        Ok(saved
            .iter()
            .find(|(saved_id, _)| *saved_id == id)
            .map(|(id, new)| Self::to_stored(*id, new)))
    }

    async fn latest_for_url(&self, url: &str) -> Result<Option<StoredResult>, AppError> {
        let saved = self.saved.lock().unwrap();
        Ok(saved
            .iter()
            .rev()
            .find(|(_, new)| new.url == url)
            .map(|(id, new)| Self::to_stored(*id, new)))
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Reporter that records a short label per worker event.
#[derive(Clone, Default)]
pub struct MockReporter {
    events: Arc<Mutex<Vec<&'static str>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }

    pub fn saw(&self, label: &str) -> bool {
        self.events.lock().unwrap().contains(&label)
    }
}

impl WorkerReporter for MockReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        let label = match event {
            WorkerEvent::Started { .. } => "started",
            WorkerEvent::Polling { .. } => "polling",
            WorkerEvent::TaskClaimed { .. } => "claimed",
            WorkerEvent::TaskDeferred { .. } => "deferred",
            WorkerEvent::TaskStarted { .. } => "task_started",
            WorkerEvent::TaskCompleted { .. } => "completed",
            WorkerEvent::TaskFailed { .. } => "failed",
            WorkerEvent::LeasesReaped { .. } => "reaped",
            WorkerEvent::StaleTasksRecovered { .. } => "stale_recovered",
            WorkerEvent::ShuttingDown { .. } => "shutting_down",
            WorkerEvent::Stopped { .. } => "stopped",
        };
        self.events.lock().unwrap().push(label);
    }
}
