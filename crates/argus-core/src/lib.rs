pub mod cascade;
pub mod circuit_breaker;
pub mod config;
pub mod dedup;
pub mod detect;
pub mod error;
pub mod memory_store;
pub mod models;
pub mod pool;
pub mod task;
pub mod task_store;
pub mod throttle;
pub mod traits;
pub mod user_agent;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use cascade::{Cascade, CascadeConfig, DomRules};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
pub use config::{EngineConfig, SharedConfig};
pub use dedup::canonicalize_url;
pub use error::{AppError, FailureKind};
pub use memory_store::{InMemoryResultStore, InMemoryTaskStore};
pub use models::{ExtractionResult, FetchedPage, ProductFields, StrategyKind, compute_hash};
pub use pool::{IdentityLease, IdentityPool, IdentitySpec, LeaseOutcome, PoolConfig};
pub use task::{EnqueueOutcome, EnqueueRequest, Task, TaskStatus};
pub use task_store::{StoreConfig, TaskStore};
pub use throttle::{DomainThrottle, ThrottleConfig};
pub use traits::{Cleaner, LlmOracle, OcrEngine, PageFetcher, ResultStore};
pub use worker::{TracingWorkerReporter, WorkerConfig, WorkerPool, WorkerReporter};
