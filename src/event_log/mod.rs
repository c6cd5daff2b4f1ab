//! Append-only event log and branch index.
//!
//! Every state-changing fact in the engine is an immutable [`Event`] linked
//! to a parent event and a branch. Branches are head pointers into the
//! shared event graph: forking installs a new head at any historical event
//! in O(1) without copying history, and divergence is expressed purely
//! through subsequent appends.
//!
//! # Ordering
//!
//! Events within a branch are totally ordered by parent-chain linkage,
//! never by wall-clock timestamp (clocks may skew). Two branches have no
//! relative order.
//!
//! # Concurrency
//!
//! [`EventLog::append`] is the only shared-write surface. Head updates are
//! serialized per branch via optimistic concurrency: the caller presents
//! the head it observed, and a stale head fails with
//! [`LogError::HeadConflict`] carrying the current head for retry.
//! Unrelated branches append fully in parallel.

pub mod errors;
pub mod event;
pub mod log;

pub use errors::LogError;
pub use event::{Event, EventType};
pub use log::{BranchDiff, BranchSummary, EventLog};
