//! # Jobline Queue
//!
//! Job queueing with admission control and result caching.
//!
//! Features:
//! - Job state machine with bounded retries
//! - Content fingerprints for dedup and cached outputs
//! - Pluggable limiters (concurrency, delay, sliding window, composite)
//! - Pluggable backend (Memory here, SQLite in `jobline-persist`)
//! - Poll loop with completion events

pub mod backend;
pub mod config;
pub mod fingerprint;
pub mod job;
pub mod limiter;
pub mod memory;
pub mod queue;
pub mod registry;

pub use backend::{QueueBackend, QueueError};
pub use config::QueueConfig;
pub use fingerprint::{fingerprint, fingerprint_of};
pub use job::{Job, JobId, JobOutcome, JobStatus, NewJob};
pub use limiter::{
    CompositeLimiter, ConcurrencyLimiter, DelayLimiter, Limiter, NullLimiter, RateLimiter,
};
pub use memory::MemoryQueueBackend;
pub use queue::{CompletionEvent, JobQueue, Submission};
pub use registry::{TaskRegistry, TaskRunner};
