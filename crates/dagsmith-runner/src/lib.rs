//! Node execution and scheduling
//!
//! This crate handles:
//! - Materialization statement sequences (view, table, incremental, seed,
//!   snapshot, test)
//! - The run-scoped relation cache and per-relation locks
//! - Bounded, dependency-ordered scheduling with skip propagation
//! - Run lifecycle observers
//! - [`RunTask`]: select, compile, execute, report

pub mod cache;
pub mod materialization;
pub mod observer;
pub mod scheduler;
pub mod seed;
pub mod task;

pub use cache::{RelationCache, RelationLocks};
pub use materialization::{ExecutionSettings, NodeError, NodeExecutor, EPHEMERAL_STATUS};
pub use observer::{LoggingObserver, NoopObserver, RunObserver, RunStart};
pub use scheduler::Scheduler;
pub use seed::{SeedError, SeedTable};
pub use task::{RunConfig, RunError, RunTask};
