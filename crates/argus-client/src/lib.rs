pub mod cleaner;
pub mod fetcher;
pub mod llm;
pub mod ocr;
pub mod robots;
pub mod session;

#[cfg(feature = "browser")]
pub mod browser_fetcher;

#[cfg(feature = "browser")]
pub use browser_fetcher::BrowserFetcher;
pub use cleaner::HtmdCleaner;
pub use fetcher::ReqwestFetcher;
pub use llm::OpenAiOracle;
pub use ocr::PaddleOcrClient;
pub use robots::RobotsGuard;
