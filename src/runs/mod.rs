//! Run state machine and DAG executor.
//!
//! A [`Run`] is the per-execution state advanced by the [`Executor`]: the
//! compiled step order, a cursor, the accumulated payload, and the lifecycle
//! state. Every transition the executor makes is durably recorded on the
//! run's branch via the event log before the in-memory cache moves on; the
//! run object is always reconstructible by replaying its branch
//! ([`Run::replay`]).
//!
//! Concurrency model: runs execute concurrently and independently. Each
//! run's slot carries a `tokio::Mutex`, so `advance` is the only code path
//! mutating a given run and two advances can never overlap. A paused run
//! holds no task or worker; resumption re-enters the loop under the same
//! mutex.

pub mod executor;
pub mod run;

pub use executor::{EngineError, Executor};
pub use run::{ReplayError, ResumePayload, Run, RunView};
