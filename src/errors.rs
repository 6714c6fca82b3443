// src/errors.rs

//! Crate-wide error taxonomy.
//!
//! The hierarchy mirrors the node lifecycle: [`NodeError`] is the generic
//! node failure, with [`CmdNodeError`] (external process problems) and
//! [`MetaNodeError`] (illegal operation on an aggregator node) folding into
//! it. Errors raised by custom node phases that are not part of this
//! taxonomy are wrapped in [`NodeError::Unhandled`] so the coordinating
//! process can report worker failures uniformly.

use std::path::PathBuf;

use thiserror::Error;

/// Generic node failure: missing files, bad arguments, temp dir problems.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("missing {kind} files for node '{node}':\n\t- {}", join_paths(files))]
    MissingFiles {
        kind: &'static str,
        node: String,
        files: Vec<PathBuf>,
    },

    #[error("executable(s) not found for node '{node}': {}", executables.join(", "))]
    MissingExecutables {
        node: String,
        executables: Vec<String>,
    },

    #[error("node '{node}' must use at least one thread")]
    InvalidThreads { node: String },

    #[error("invalid (empty) {kind} file path for node '{node}'")]
    InvalidPath { kind: &'static str, node: String },

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error(transparent)]
    Cmd(#[from] CmdNodeError),

    #[error(transparent)]
    Meta(#[from] MetaNodeError),

    #[error(transparent)]
    Command(#[from] CmdError),

    #[error("temp dir error at {path:?}: {source}")]
    TempDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("I/O error for {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Wraps any error raised inside setup/run/teardown that is not a
    /// recognized `NodeError`. The message contains the full error chain.
    #[error("unhandled error in node '{node}':\n{message}")]
    Unhandled { node: String, message: String },
}

/// Failure of the external processes owned by a command node, or a mismatch
/// between declared and produced temp files.
#[derive(Error, Debug)]
pub enum CmdNodeError {
    #[error(
        "error(s) running node:\n\treturn-codes: {return_codes:?}\n\ttemporary directory: {temp:?}\n\n{description}"
    )]
    NonZeroExit {
        return_codes: Vec<i32>,
        temp: PathBuf,
        description: String,
    },

    #[error(
        "required files not created in temporary directory {temp:?}:\n\t- {}", files.join("\n\t- ")
    )]
    MissingTempFiles { temp: PathBuf, files: Vec<String> },

    #[error(
        "unexpected files found in temporary directory {temp:?}:\n\t- {}", files.join("\n\t- ")
    )]
    UnexpectedTempFiles { temp: PathBuf, files: Vec<String> },
}

/// Illegal operation on a meta node, which aggregates subnodes but has no
/// work or outputs of its own.
#[derive(Error, Debug)]
#[error("called '{operation}' on a meta node")]
pub struct MetaNodeError {
    pub operation: &'static str,
}

/// Construction-time or spawn-time error for atomic commands and pipelines.
#[derive(Error, Debug)]
pub enum CmdError {
    #[error("empty argument list passed to command")]
    EmptyCommand,

    #[error("empty command list passed to pipeline")]
    EmptyPipeline,

    #[error("unresolved placeholder in argument {token:?}")]
    UnresolvedPlaceholder { token: String },

    #[error("temp-relative name {name:?} must not contain path separators")]
    BadTempName { name: String },

    #[error("multiple output files would be written to temp file {name:?}")]
    OverlappingOutputs { name: String },

    #[error("fifo {name:?} cannot be bound to a standard stream")]
    FifoOnStdio { name: String },

    #[error("command {consumer} pipes stdin from command {from}, which is not an earlier command")]
    BadPipeRef { consumer: usize, from: usize },

    #[error(
        "command {consumer} pipes stdin from command {from}, whose stdout is not the pipe sentinel"
    )]
    StdoutNotPipe { consumer: usize, from: usize },

    #[error("stdout pipe of command {index} is never consumed")]
    UnconsumedPipe { index: usize },

    #[error("stdout pipe of command {from} is consumed more than once")]
    PipeConsumedTwice { from: usize },

    #[error("failed to spawn {program:?}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("failed to create fifo {path:?}: {message}")]
    Fifo { path: PathBuf, message: String },

    #[error("failed to redirect {stream} for {program:?}: {source}")]
    Redirect {
        stream: &'static str,
        program: String,
        source: std::io::Error,
    },
}

/// External tool version requirement failure.
#[derive(Error, Debug, Clone)]
pub enum VersionError {
    #[error("could not probe version of '{name}': {message}")]
    Probe { name: String, message: String },

    #[error("could not determine version of '{name}', searching for {pattern:?} in {output:?}")]
    NoMatch {
        name: String,
        pattern: String,
        output: String,
    },

    #[error("version requirement not met for '{name}': expected {expected}, found {found}")]
    NotMet {
        name: String,
        expected: String,
        found: String,
    },
}

/// Error detected while assembling or checking the node graph, before any
/// node is dispatched.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("cycle detected in node graph involving '{node}'")]
    Cycle { node: String },

    #[error(
        "multiple nodes create the same (clobber) output file {file:?}:\n\t- {}",
        nodes.join("\n\t- ")
    )]
    OutputClobber { file: PathBuf, nodes: Vec<String> },

    #[error(
        "required file {file:?} does not exist and is not created by a dependency of:\n\t- {}",
        nodes.join("\n\t- ")
    )]
    MissingInput { file: PathBuf, nodes: Vec<String> },

    #[error("required executables are missing:\n\t- {}", executables.join("\n\t- "))]
    MissingExecutables { executables: Vec<String> },
}

/// Top-level pipeline error.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Command(#[from] CmdError),

    #[error("node '{node}' requires {threads} threads but the budget is {budget}")]
    ThreadBudget {
        node: String,
        threads: usize,
        budget: usize,
    },

    #[error("{} node(s) failed:\n\t- {}", failed.len(), failed.join("\n\t- "))]
    NodesFailed { failed: Vec<String> },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

fn join_paths(files: &[PathBuf]) -> String {
    files
        .iter()
        .map(|p| format!("{p:?}"))
        .collect::<Vec<_>>()
        .join("\n\t- ")
}
