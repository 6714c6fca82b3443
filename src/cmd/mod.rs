// src/cmd/mod.rs

//! Atomic external commands and pipelines.
//!
//! - [`atomic`] defines [`AtomicCommand`]: one process invocation with
//!   templated arguments and declared file/stream bindings.
//! - [`pipeline`] defines [`CommandPipeline`]: an ordered set of commands
//!   started together and connected via pipes, with whole-pipeline exit
//!   status aggregation.
//! - [`format`] renders pipelines for error messages and diagnostics.

pub mod atomic;
pub mod format;
pub mod pipeline;

pub use atomic::{AtomicCommand, AtomicCommandBuilder, Binding, StderrSpec, StdinSpec, StdoutSpec};
pub use pipeline::{CommandPipeline, RunningPipeline};
