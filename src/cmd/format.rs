// src/cmd/format.rs

//! Human-readable rendering of command pipelines for error reports.

use std::fmt::Write as _;
use std::path::Path;

use crate::cmd::atomic::{AtomicCommand, StderrSpec, StdinSpec, StdoutSpec};
use crate::cmd::pipeline::CommandPipeline;

/// Render every command of a pipeline with resolved arguments and stream
/// redirections. When the temp directory is unknown, temp-relative paths are
/// shown under a `${TEMP_DIR}` prefix. Auto-generated stream captures are
/// marked with `*`.
pub fn pformat(pipeline: &CommandPipeline, temp: Option<&Path>) -> String {
    let placeholder = Path::new("${TEMP_DIR}");
    let temp = temp.unwrap_or(placeholder);

    let mut out = String::from("Commands executed in parallel:\n");
    for (index, command) in pipeline.commands().iter().enumerate() {
        let _ = writeln!(
            out,
            "  - <{index:02}> Command = {:?}",
            command.resolve_argv(temp)
        );
        let _ = writeln!(out, "         STDIN{}", format_stdin(command, temp));
        let _ = writeln!(out, "         STDOUT{}", format_stdout(command, index, temp));
        let _ = writeln!(out, "         STDERR{}", format_stderr(command, index, temp));
        if command.set_cwd() {
            let _ = writeln!(out, "         CWD     = {:?}", temp);
        }
    }
    out
}

fn format_stdin(command: &AtomicCommand, temp: &Path) -> String {
    match command.stdin() {
        StdinSpec::Null => "   = <null>".to_string(),
        StdinSpec::File(path) => format!("   = {path:?}"),
        StdinSpec::TempFile(name) => format!("   = {:?}", temp.join(name)),
        StdinSpec::Piped { from } => format!("   = <pipe from {from:02}>"),
    }
}

fn format_stdout(command: &AtomicCommand, index: usize, temp: &Path) -> String {
    match command.stdout() {
        StdoutSpec::Capture => {
            format!("*  = {:?}", temp.join(capture_name(command, index, "stdout")))
        }
        StdoutSpec::File(path) => {
            let name = path.file_name().unwrap_or(path.as_os_str());
            format!("   = {:?}", temp.join(name))
        }
        StdoutSpec::TempFile(name) => format!("   = {:?}", temp.join(name)),
        StdoutSpec::Pipe => "   = <pipe>".to_string(),
    }
}

fn format_stderr(command: &AtomicCommand, index: usize, temp: &Path) -> String {
    match command.stderr() {
        StderrSpec::Capture => {
            format!("*  = {:?}", temp.join(capture_name(command, index, "stderr")))
        }
        StderrSpec::File(path) => {
            let name = path.file_name().unwrap_or(path.as_os_str());
            format!("   = {:?}", temp.join(name))
        }
        StderrSpec::TempFile(name) => format!("   = {:?}", temp.join(name)),
    }
}

fn capture_name(command: &AtomicCommand, index: usize, extension: &str) -> String {
    let program = Path::new(command.program())
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| command.program().to_string());
    format!("pipe_{program}_{index:02}.{extension}")
}
