//! Proctor check execution engine: a declarative runner for
//! code-review and workflow automation checks.
//!
//! A catalog of checks (AI reviews, shell commands, HTTP calls,
//! in-process scripts, memory operations, nested workflows) with
//! declared dependencies, triggers, guard conditions, and routing
//! directives is planned into a layered topological order, executed in
//! waves with bounded parallelism, journalled append-only, and routed
//! through conditional `goto` / `run` / `on_finish` edges until a fixed
//! point is reached.

#![warn(clippy::pedantic)]
#![allow(clippy::result_large_err)]

pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod expr;
pub mod journal;
pub mod planner;
pub mod provider;
pub mod providers;
pub mod results;
pub mod retry;
pub mod routing;
pub mod runtime;
pub mod scope;
pub mod session;
pub mod spec;
pub mod types;

pub use config::{EngineOptions, LoadedConfig, load_str};
pub use engine::{EngineConfig, RunOptions, run, run_document};
pub use error::{EngineError, EngineResult};
pub use journal::{Journal, JournalEntry};
pub use results::{RunResult, RunStatistics};
pub use scope::Scope;
pub use spec::CheckSpec;
pub use types::*;
