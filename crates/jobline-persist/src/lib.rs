//! # Jobline Persistence
//!
//! Durable storage for job queues.
//!
//! Supports:
//! - SQLite (single file, shared by any number of pollers)

pub mod queue;
pub mod sqlite;

pub use queue::SqliteQueueBackend;
pub use sqlite::{connect, migrate, SqliteConfig};
