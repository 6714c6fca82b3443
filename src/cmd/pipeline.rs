// src/cmd/pipeline.rs

//! Ordered sets of atomic commands run as one unit.
//!
//! All commands in a [`CommandPipeline`] share the node's temp directory and
//! succeed or fail together. Commands are spawned in list order, which makes
//! the launch order deterministic; stdout-to-stdin pipes always flow from an
//! earlier command to a later one. Named pipes (fifos) are created on disk
//! before the first spawn and are referenced by path only, so commands that
//! stream through a fifo must be ordered with the reader no later than the
//! writer.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cmd::atomic::{AtomicCommand, StdinSpec, StdoutSpec};
use crate::errors::CmdError;
use crate::fileset::FileSet;
use crate::version::Requirement;

/// A validated, ordered set of commands executed in parallel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPipeline {
    commands: Vec<AtomicCommand>,
}

impl CommandPipeline {
    /// Validate and assemble a pipeline. Pipe references must point at an
    /// earlier command whose stdout is [`StdoutSpec::Pipe`], every pipe must
    /// be consumed exactly once, and no two commands may write the same
    /// temp-relative name.
    pub fn new(commands: Vec<AtomicCommand>) -> Result<Self, CmdError> {
        if commands.is_empty() {
            return Err(CmdError::EmptyPipeline);
        }

        let mut consumers: BTreeMap<usize, usize> = BTreeMap::new();
        for (index, command) in commands.iter().enumerate() {
            if let StdinSpec::Piped { from } = command.stdin() {
                if *from >= index {
                    return Err(CmdError::BadPipeRef {
                        consumer: index,
                        from: *from,
                    });
                }
                if !matches!(commands[*from].stdout(), StdoutSpec::Pipe) {
                    return Err(CmdError::StdoutNotPipe {
                        consumer: index,
                        from: *from,
                    });
                }
                if consumers.insert(*from, index).is_some() {
                    return Err(CmdError::PipeConsumedTwice { from: *from });
                }
            }
        }
        for (index, command) in commands.iter().enumerate() {
            if matches!(command.stdout(), StdoutSpec::Pipe) && !consumers.contains_key(&index) {
                return Err(CmdError::UnconsumedPipe { index });
            }
        }

        // Written temp names must be unique pipeline-wide; fifo names may be
        // shared (reader and writer both declare the fifo) but must not
        // collide with written files.
        let fifos: BTreeSet<String> = commands.iter().flat_map(AtomicCommand::fifo_names).collect();
        let mut written = BTreeSet::new();
        for command in &commands {
            for name in command.produced_temp_names() {
                if fifos.contains(&name) || !written.insert(name.clone()) {
                    return Err(CmdError::OverlappingOutputs { name });
                }
            }
        }

        Ok(Self { commands })
    }

    /// Pipeline containing exactly one command.
    pub fn single(command: AtomicCommand) -> Result<Self, CmdError> {
        Self::new(vec![command])
    }

    pub fn commands(&self) -> &[AtomicCommand] {
        &self.commands
    }

    pub fn input_files(&self) -> FileSet {
        self.aggregate(AtomicCommand::input_files)
    }

    pub fn output_files(&self) -> FileSet {
        self.aggregate(AtomicCommand::output_files)
    }

    pub fn executables(&self) -> FileSet {
        self.aggregate(AtomicCommand::executables)
    }

    pub fn auxiliary_files(&self) -> FileSet {
        self.aggregate(AtomicCommand::auxiliary_files)
    }

    pub fn requirements(&self) -> Vec<Requirement> {
        let mut requirements = Vec::new();
        for command in &self.commands {
            for requirement in command.requirements() {
                if !requirements.contains(requirement) {
                    requirements.push(requirement.clone());
                }
            }
        }
        requirements
    }

    /// Temp names that must exist when the pipeline succeeds.
    pub fn required_temp_files(&self) -> BTreeSet<String> {
        self.commands
            .iter()
            .flat_map(AtomicCommand::required_temp_files)
            .collect()
    }

    /// Temp names that may exist and are removed at commit.
    pub fn optional_temp_files(&self) -> BTreeSet<String> {
        self.commands
            .iter()
            .enumerate()
            .flat_map(|(index, command)| command.optional_temp_files(index))
            .collect()
    }

    /// Temp name to final path for every committable output.
    pub fn committable_outputs(&self) -> BTreeMap<String, PathBuf> {
        self.commands
            .iter()
            .flat_map(AtomicCommand::committable_outputs)
            .collect()
    }

    pub fn fifo_names(&self) -> BTreeSet<String> {
        self.commands
            .iter()
            .flat_map(AtomicCommand::fifo_names)
            .collect()
    }

    /// Create the declared fifos and spawn every command, in list order.
    pub fn start(&self, temp: &Path) -> Result<RunningPipeline, CmdError> {
        for name in self.fifo_names() {
            let path = temp.join(&name);
            make_fifo(&path)?;
            debug!(path = ?path, "created fifo");
        }

        let mut pipe_outputs: BTreeMap<usize, ChildStdout> = BTreeMap::new();
        let mut children = Vec::with_capacity(self.commands.len());
        for (index, command) in self.commands.iter().enumerate() {
            let stdin_pipe = match command.stdin() {
                StdinSpec::Piped { from } => pipe_outputs.remove(from),
                _ => None,
            };

            let mut child = command.spawn(index, temp, stdin_pipe)?;
            debug!(program = command.program(), index, "spawned command");
            if matches!(command.stdout(), StdoutSpec::Pipe) {
                if let Some(stdout) = child.stdout.take() {
                    pipe_outputs.insert(index, stdout);
                }
            }
            children.push((command.program().to_string(), child));
        }

        Ok(RunningPipeline { children })
    }

    fn aggregate(&self, per_command: impl Fn(&AtomicCommand) -> FileSet) -> FileSet {
        let mut set = FileSet::empty();
        for command in &self.commands {
            set.merge(&per_command(command));
        }
        set
    }
}

/// Handle to the spawned processes of a started pipeline.
#[derive(Debug)]
pub struct RunningPipeline {
    children: Vec<(String, Child)>,
}

impl RunningPipeline {
    /// Wait for every process and collect exit codes in spawn order. A
    /// process killed by a signal reports -1.
    pub fn wait(mut self) -> std::io::Result<Vec<i32>> {
        let mut return_codes = Vec::with_capacity(self.children.len());
        for (program, child) in &mut self.children {
            let status = child.wait()?;
            let code = status.code().unwrap_or(-1);
            debug!(program = program.as_str(), code, "command finished");
            return_codes.push(code);
        }
        Ok(return_codes)
    }
}

#[cfg(unix)]
fn make_fifo(path: &Path) -> Result<(), CmdError> {
    use nix::sys::stat::Mode;

    nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o644)).map_err(|errno| CmdError::Fifo {
        path: path.to_path_buf(),
        message: errno.to_string(),
    })
}

#[cfg(not(unix))]
fn make_fifo(path: &Path) -> Result<(), CmdError> {
    Err(CmdError::Fifo {
        path: path.to_path_buf(),
        message: "fifos are only supported on unix".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::atomic::{Binding, StderrSpec};

    fn plain(program: &str) -> AtomicCommand {
        AtomicCommand::build([program]).done().unwrap()
    }

    #[test]
    fn rejects_empty_pipeline() {
        assert!(matches!(
            CommandPipeline::new(Vec::new()),
            Err(CmdError::EmptyPipeline)
        ));
    }

    #[test]
    fn rejects_forward_pipe_reference() {
        let consumer = AtomicCommand::build(["wc"])
            .stdin(StdinSpec::Piped { from: 1 })
            .done()
            .unwrap();
        let producer = AtomicCommand::build(["cat"])
            .stdout(StdoutSpec::Pipe)
            .done()
            .unwrap();

        assert!(matches!(
            CommandPipeline::new(vec![consumer, producer]),
            Err(CmdError::BadPipeRef { consumer: 0, from: 1 })
        ));
    }

    #[test]
    fn rejects_pipe_from_non_pipe_stdout() {
        let producer = plain("cat");
        let consumer = AtomicCommand::build(["wc"])
            .stdin(StdinSpec::Piped { from: 0 })
            .done()
            .unwrap();

        assert!(matches!(
            CommandPipeline::new(vec![producer, consumer]),
            Err(CmdError::StdoutNotPipe { consumer: 1, from: 0 })
        ));
    }

    #[test]
    fn rejects_unconsumed_pipe() {
        let producer = AtomicCommand::build(["cat"])
            .stdout(StdoutSpec::Pipe)
            .done()
            .unwrap();

        assert!(matches!(
            CommandPipeline::single(producer),
            Err(CmdError::UnconsumedPipe { index: 0 })
        ));
    }

    #[test]
    fn rejects_doubly_consumed_pipe() {
        let producer = AtomicCommand::build(["cat"])
            .stdout(StdoutSpec::Pipe)
            .done()
            .unwrap();
        let first = AtomicCommand::build(["wc"])
            .stdin(StdinSpec::Piped { from: 0 })
            .done()
            .unwrap();
        let second = AtomicCommand::build(["md5sum"])
            .stdin(StdinSpec::Piped { from: 0 })
            .done()
            .unwrap();

        assert!(matches!(
            CommandPipeline::new(vec![producer, first, second]),
            Err(CmdError::PipeConsumedTwice { from: 0 })
        ));
    }

    #[test]
    fn rejects_cross_command_output_overlap() {
        let first = AtomicCommand::build(["a", "{OUT}"])
            .bind("OUT", Binding::OutputFile("/x/result".into()))
            .done()
            .unwrap();
        let second = AtomicCommand::build(["b", "{OUT}"])
            .bind("OUT", Binding::OutputFile("/y/result".into()))
            .done()
            .unwrap();

        assert!(matches!(
            CommandPipeline::new(vec![first, second]),
            Err(CmdError::OverlappingOutputs { .. })
        ));
    }

    #[test]
    fn shared_fifo_names_are_allowed() {
        let writer = AtomicCommand::build(["producer", "{STREAM}"])
            .bind("STREAM", Binding::TempFifo("stream".to_string()))
            .done()
            .unwrap();
        let reader = AtomicCommand::build(["consumer", "{STREAM}"])
            .bind("STREAM", Binding::TempFifo("stream".to_string()))
            .done()
            .unwrap();

        let pipeline = CommandPipeline::new(vec![reader, writer]).unwrap();
        assert_eq!(pipeline.fifo_names().len(), 1);
    }

    #[test]
    fn aggregates_file_sets_across_commands() {
        let first = AtomicCommand::build(["a", "{IN}"])
            .bind("IN", Binding::InputFile("in.txt".into()))
            .stdout(StdoutSpec::Pipe)
            .done()
            .unwrap();
        let second = AtomicCommand::build(["b", "{OUT}"])
            .bind("OUT", Binding::OutputFile("/final/out.txt".into()))
            .stdin(StdinSpec::Piped { from: 0 })
            .done()
            .unwrap();

        let pipeline = CommandPipeline::new(vec![first, second]).unwrap();
        assert!(pipeline.input_files().contains("in.txt"));
        assert!(pipeline.output_files().contains("/final/out.txt"));
        assert!(pipeline.executables().contains("a"));
        assert!(pipeline.executables().contains("b"));
    }

    #[test]
    fn runs_piped_commands_and_collects_exit_codes() {
        let dir = tempfile::tempdir().unwrap();
        let producer = AtomicCommand::build(["echo", "one two three"])
            .stdout(StdoutSpec::Pipe)
            .done()
            .unwrap();
        let consumer = AtomicCommand::build(["wc", "-w"])
            .stdin(StdinSpec::Piped { from: 0 })
            .stdout(StdoutSpec::TempFile("count.txt".to_string()))
            .stderr(StderrSpec::Capture)
            .done()
            .unwrap();

        let pipeline = CommandPipeline::new(vec![producer, consumer]).unwrap();
        let running = pipeline.start(dir.path()).unwrap();
        assert_eq!(running.wait().unwrap(), vec![0, 0]);

        let count = std::fs::read_to_string(dir.path().join("count.txt")).unwrap();
        assert_eq!(count.trim(), "3");
    }

    #[test]
    fn failing_command_reports_nonzero_code() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = CommandPipeline::single(plain("false")).unwrap();
        let codes = pipeline.start(dir.path()).unwrap().wait().unwrap();
        assert_eq!(codes, vec![1]);
    }

    #[test]
    fn creates_fifos_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        // `cat` reads the fifo while `cp` writes it; reader listed first.
        let reader = AtomicCommand::build(["cat", "{STREAM}"])
            .bind("STREAM", Binding::TempFifo("stream".to_string()))
            .stdout(StdoutSpec::TempFile("copy.txt".to_string()))
            .done()
            .unwrap();
        let writer = AtomicCommand::build(["sh", "-c", "echo hello > {STREAM}"])
            .bind("STREAM", Binding::TempFifo("stream".to_string()))
            .done()
            .unwrap();

        let pipeline = CommandPipeline::new(vec![reader, writer]).unwrap();
        let codes = pipeline.start(dir.path()).unwrap().wait().unwrap();
        assert_eq!(codes, vec![0, 0]);
        assert!(dir.path().join("copy.txt").exists());
    }
}
