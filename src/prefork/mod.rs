//! Forked worker processes for parallel requirement compilation.
//!
//! # Architecture
//!
//! ```text
//!                     ┌──────────────────┐
//!                     │    Scheduler     │
//!                     │ queue · dedup set│
//!                     └────────┬─────────┘
//!                              │ poll_events / dispatch
//!                     ┌────────▼─────────┐
//!                     │    WorkerPool    │
//!                     └────────┬─────────┘
//!               ┌──────────────┼──────────────┐
//!               │              │              │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Worker 0  │  │ Worker 1  │  │ Worker N  │
//!         │  (fork)   │  │  (fork)   │  │  (fork)   │
//!         └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! Each worker is linked to the scheduler by two pipes carrying
//! length-prefixed JSON frames. Workers compile one requirement at a time
//! and report what they found; only the scheduler owns the queue and the
//! set of requirements already dispatched.

mod ipc;
mod pool;
mod proc;
mod protocol;
mod scheduler;
mod signals;
mod worker_main;

pub use pool::{DEFAULT_GROWTH_ODDS, PoolEvent, PoolOptions, PoolStats, WorkerPool};
pub use proc::{Entrypoint, Role, Worker};
pub use protocol::Message;
pub use scheduler::{RunSummary, Scheduler, WorkItem};
pub use signals::TerminationReason;
pub use worker_main::compile_loop;

/// Serializes tests that fork.
///
/// A child forked by one test would otherwise inherit the pipe ends of
/// workers belonging to a concurrently running test and hold them open.
#[cfg(test)]
pub(crate) fn fork_guard() -> std::sync::MutexGuard<'static, ()> {
    static FORK_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    FORK_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
