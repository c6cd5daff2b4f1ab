//! # Branchloom: Event-sourced Workflow Execution Engine
//!
//! Branchloom runs directed acyclic graphs of typed steps (context-gathering,
//! transforms, human checkpoints, effectful calls, branching logic) and records
//! every state transition as an immutable event on a branch. Any historical
//! event can be forked into an alternate timeline without disturbing the
//! original; the state implied by any branch is a deterministic projection of
//! its event chain.
//!
//! ## Core Concepts
//!
//! - **Events**: Append-only facts, each linked to a parent event and a branch
//! - **Branches**: Independent lines of history sharing a common ancestor prefix
//! - **Definitions**: Validated step graphs compiled to a topological order
//! - **Runs**: Per-execution state machines advanced by the executor, pausable
//!   indefinitely at human checkpoints
//! - **Projection**: Deterministic replay of an event chain into subject state
//!
//! ## Quick Start
//!
//! ```
//! use branchloom::definitions::{Definition, Edge, Step, StepKind};
//!
//! // A linear workflow: gather context, pause for a human, then execute.
//! let def = Definition::builder("review")
//!     .step(Step::new("gather", StepKind::context(["dossier"], "research")))
//!     .step(Step::new("approve", StepKind::human()))
//!     .step(Step::new(
//!         "draft",
//!         StepKind::generate("Write a draft using {research}", "draft"),
//!     ))
//!     .edge(Edge::new("gather", "approve"))
//!     .edge(Edge::new("approve", "draft"))
//!     .build();
//! assert_eq!(def.steps.len(), 3);
//! ```
//!
//! Runs are driven through [`engine::Engine`]: `start` creates a branch and
//! advances until the first human checkpoint or a terminal state, `resume`
//! merges caller input and continues, `fork` opens an alternate timeline from
//! any recorded event.
//!
//! ## Consistency Model
//!
//! The event log is the sole source of truth. The in-memory run held by the
//! executor is a cache that can always be rebuilt by replaying the run's
//! branch ([`runs::Run::replay`]). Appends use optimistic concurrency: a
//! caller that loses a head race gets a conflict error and retries with the
//! refreshed head, so exactly one of two racing appends wins.
//!
//! ## Module Guide
//!
//! - [`event_log`] - Append-only event log and branch index
//! - [`projection`] - Deterministic state projection with snapshot caching
//! - [`definitions`] - Step graph model, validation, and CRUD store
//! - [`steps`] - Category handlers and model resolution
//! - [`runs`] - Run state machine and DAG executor
//! - [`engine`] - Public control surface (runs, branches, streaming)
//! - [`collaborators`] - Generation service and entity store boundaries
//! - [`stream`] - Push channel emitting run snapshots on every transition

pub mod collaborators;
pub mod config;
pub mod definitions;
pub mod engine;
pub mod event_log;
pub mod projection;
pub mod runs;
pub mod steps;
pub mod stream;
pub mod telemetry;
pub mod types;
