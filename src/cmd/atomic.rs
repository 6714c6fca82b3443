// src/cmd/atomic.rs

//! A single external process invocation with declared file bindings.
//!
//! An [`AtomicCommand`] is plain data: an argument template, a table of
//! named bindings, and stream specifications. Arguments may contain `{KEY}`
//! placeholders that resolve to the bound paths at spawn time, once the
//! node's temp directory is known. Every placeholder must be bound at
//! construction time; the only builtin key is `TEMP_DIR`.
//!
//! Output files are written temp-relative and only reach their final paths
//! through the pipeline commit in
//! [`CommandRunner`](crate::node::command::CommandRunner).

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

use serde::{Deserialize, Serialize};

use crate::errors::CmdError;
use crate::fileset::FileSet;
use crate::version::Requirement;

/// The builtin placeholder resolving to the node's temp directory.
pub const TEMP_DIR_KEY: &str = "TEMP_DIR";

/// What a `{KEY}` placeholder stands for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Binding {
    /// Pre-existing input file, resolved to the declared path.
    InputFile(PathBuf),
    /// Final output path; the command writes to its basename inside the
    /// temp directory, and the commit moves it to the declared path.
    OutputFile(PathBuf),
    /// Auxiliary file: required to exist, but not an input for staleness.
    AuxFile(PathBuf),
    /// Temp-relative file produced by an earlier command in the pipeline.
    TempInput(String),
    /// Temp-relative scratch file, deleted at commit.
    TempOutput(String),
    /// Named pipe inside the temp directory, created before any command in
    /// the pipeline is spawned and deleted at commit. Fifos are passed to
    /// processes as path arguments only, never opened by this process.
    TempFifo(String),
    /// Executable name substituted verbatim and checked during setup.
    Executable(String),
}

/// Where the process reads stdin from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StdinSpec {
    #[default]
    Null,
    /// Read from a pre-existing file; counts as an input file.
    File(PathBuf),
    /// Read from a temp-relative file produced by an earlier command.
    TempFile(String),
    /// Read from the stdout pipe of an earlier command in the pipeline.
    Piped { from: usize },
}

/// Where the process writes stdout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StdoutSpec {
    /// Captured to `pipe_<program>_<index>.stdout` in the temp directory.
    /// The capture is an optional temp file, removed at commit.
    #[default]
    Capture,
    /// Final output path; written temp-relative, committed by basename.
    File(PathBuf),
    /// Temp-relative scratch file, deleted at commit.
    TempFile(String),
    /// Connected to the stdin of a later command in the pipeline.
    Pipe,
}

/// Where the process writes stderr.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StderrSpec {
    /// Captured to `pipe_<program>_<index>.stderr` in the temp directory.
    #[default]
    Capture,
    File(PathBuf),
    TempFile(String),
}

/// One external process invocation with declared files and streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicCommand {
    argv: Vec<String>,
    bindings: BTreeMap<String, Binding>,
    stdin: StdinSpec,
    stdout: StdoutSpec,
    stderr: StderrSpec,
    set_cwd: bool,
    requirements: Vec<Requirement>,
}

pub struct AtomicCommandBuilder {
    argv: Vec<String>,
    bindings: BTreeMap<String, Binding>,
    stdin: StdinSpec,
    stdout: StdoutSpec,
    stderr: StderrSpec,
    set_cwd: bool,
    requirements: Vec<Requirement>,
}

impl AtomicCommand {
    pub fn build(argv: impl IntoIterator<Item = impl Into<String>>) -> AtomicCommandBuilder {
        AtomicCommandBuilder {
            argv: argv.into_iter().map(Into::into).collect(),
            bindings: BTreeMap::new(),
            stdin: StdinSpec::default(),
            stdout: StdoutSpec::default(),
            stderr: StderrSpec::default(),
            set_cwd: false,
            requirements: Vec::new(),
        }
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// The program name as invoked (unresolved).
    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    pub fn stdin(&self) -> &StdinSpec {
        &self.stdin
    }

    pub fn stdout(&self) -> &StdoutSpec {
        &self.stdout
    }

    pub fn stderr(&self) -> &StderrSpec {
        &self.stderr
    }

    pub fn set_cwd(&self) -> bool {
        self.set_cwd
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    /// The program plus any `Executable` bindings.
    pub fn executables(&self) -> FileSet {
        let mut set = FileSet::from(self.program());
        for binding in self.bindings.values() {
            if let Binding::Executable(name) = binding {
                set.insert(name);
            }
        }
        set
    }

    /// Pre-existing files this command reads, including a file-backed stdin.
    pub fn input_files(&self) -> FileSet {
        let mut set = FileSet::empty();
        for binding in self.bindings.values() {
            if let Binding::InputFile(path) = binding {
                set.insert(path);
            }
        }
        if let StdinSpec::File(path) = &self.stdin {
            set.insert(path);
        }
        set
    }

    /// Final output paths this command is responsible for.
    pub fn output_files(&self) -> FileSet {
        let mut set = FileSet::empty();
        for binding in self.bindings.values() {
            if let Binding::OutputFile(path) = binding {
                set.insert(path);
            }
        }
        if let StdoutSpec::File(path) = &self.stdout {
            set.insert(path);
        }
        if let StderrSpec::File(path) = &self.stderr {
            set.insert(path);
        }
        set
    }

    pub fn auxiliary_files(&self) -> FileSet {
        let mut set = FileSet::empty();
        for binding in self.bindings.values() {
            if let Binding::AuxFile(path) = binding {
                set.insert(path);
            }
        }
        set
    }

    /// Temp-relative names this command must produce (basenames of final
    /// outputs, including file-directed stdout/stderr).
    pub fn required_temp_files(&self) -> BTreeSet<String> {
        self.output_files()
            .iter()
            .filter_map(|path| path.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect()
    }

    /// Temp-relative names this command may produce but need not: scratch
    /// outputs, fifos, and default stream captures. All are deleted at
    /// commit. `index` is the command's position in its pipeline.
    pub fn optional_temp_files(&self, index: usize) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for binding in self.bindings.values() {
            match binding {
                Binding::TempOutput(name) | Binding::TempFifo(name) => {
                    names.insert(name.clone());
                }
                _ => {}
            }
        }
        match &self.stdout {
            StdoutSpec::Capture => {
                names.insert(self.default_stream_name(index, "stdout"));
            }
            StdoutSpec::TempFile(name) => {
                names.insert(name.clone());
            }
            _ => {}
        }
        match &self.stderr {
            StderrSpec::Capture => {
                names.insert(self.default_stream_name(index, "stderr"));
            }
            StderrSpec::TempFile(name) => {
                names.insert(name.clone());
            }
            _ => {}
        }
        names
    }

    /// Temp name to final path, for the commit.
    pub fn committable_outputs(&self) -> BTreeMap<String, PathBuf> {
        self.output_files()
            .iter()
            .filter_map(|path| {
                path.file_name()
                    .map(|name| (name.to_string_lossy().into_owned(), path.to_path_buf()))
            })
            .collect()
    }

    pub fn fifo_names(&self) -> BTreeSet<String> {
        self.bindings
            .values()
            .filter_map(|binding| match binding {
                Binding::TempFifo(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Substitute every `{KEY}` placeholder against the given temp directory.
    pub fn resolve_argv(&self, temp: &Path) -> Vec<String> {
        self.argv
            .iter()
            .map(|token| {
                let mut resolved = token.clone();
                for key in placeholder_keys(token) {
                    let needle = format!("{{{key}}}");
                    resolved = resolved.replace(&needle, &self.resolve_key(&key, temp));
                }
                resolved
            })
            .collect()
    }

    fn resolve_key(&self, key: &str, temp: &Path) -> String {
        if key == TEMP_DIR_KEY {
            return temp.to_string_lossy().into_owned();
        }

        // Construction guarantees the key is bound.
        let Some(binding) = self.bindings.get(key) else {
            return format!("{{{key}}}");
        };

        match binding {
            Binding::InputFile(path) | Binding::AuxFile(path) => {
                if self.set_cwd {
                    std::path::absolute(path)
                        .unwrap_or_else(|_| path.clone())
                        .to_string_lossy()
                        .into_owned()
                } else {
                    path.to_string_lossy().into_owned()
                }
            }
            Binding::OutputFile(path) => {
                let name = path.file_name().unwrap_or(path.as_os_str());
                if self.set_cwd {
                    name.to_string_lossy().into_owned()
                } else {
                    temp.join(name).to_string_lossy().into_owned()
                }
            }
            Binding::TempInput(name) | Binding::TempOutput(name) | Binding::TempFifo(name) => {
                if self.set_cwd {
                    name.clone()
                } else {
                    temp.join(name).to_string_lossy().into_owned()
                }
            }
            Binding::Executable(name) => name.clone(),
        }
    }

    fn default_stream_name(&self, index: usize, extension: &str) -> String {
        let program = Path::new(self.program())
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program().to_string());
        format!("pipe_{program}_{index:02}.{extension}")
    }

    /// Spawn the process against `temp`. `stdin_pipe` carries the producer's
    /// stdout when this command's stdin is [`StdinSpec::Piped`].
    pub(crate) fn spawn(
        &self,
        index: usize,
        temp: &Path,
        stdin_pipe: Option<ChildStdout>,
    ) -> Result<Child, CmdError> {
        let argv = self.resolve_argv(temp);
        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]);
        if self.set_cwd {
            command.current_dir(temp);
        }

        let stdin = match &self.stdin {
            StdinSpec::Null => Stdio::null(),
            StdinSpec::File(path) => Stdio::from(self.open_input(path, "stdin")?),
            StdinSpec::TempFile(name) => {
                Stdio::from(self.open_input(&temp.join(name), "stdin")?)
            }
            StdinSpec::Piped { from } => match stdin_pipe {
                Some(producer_stdout) => Stdio::from(producer_stdout),
                None => return Err(CmdError::BadPipeRef { consumer: index, from: *from }),
            },
        };
        command.stdin(stdin);

        let stdout = match &self.stdout {
            StdoutSpec::Capture => {
                let name = self.default_stream_name(index, "stdout");
                Stdio::from(self.create_output(&temp.join(name), "stdout")?)
            }
            StdoutSpec::File(path) => {
                let name = path.file_name().unwrap_or(path.as_os_str());
                Stdio::from(self.create_output(&temp.join(name), "stdout")?)
            }
            StdoutSpec::TempFile(name) => {
                Stdio::from(self.create_output(&temp.join(name), "stdout")?)
            }
            StdoutSpec::Pipe => Stdio::piped(),
        };
        command.stdout(stdout);

        let stderr = match &self.stderr {
            StderrSpec::Capture => {
                let name = self.default_stream_name(index, "stderr");
                Stdio::from(self.create_output(&temp.join(name), "stderr")?)
            }
            StderrSpec::File(path) => {
                let name = path.file_name().unwrap_or(path.as_os_str());
                Stdio::from(self.create_output(&temp.join(name), "stderr")?)
            }
            StderrSpec::TempFile(name) => {
                Stdio::from(self.create_output(&temp.join(name), "stderr")?)
            }
        };
        command.stderr(stderr);

        command.spawn().map_err(|source| CmdError::Spawn {
            program: argv[0].clone(),
            source,
        })
    }

    fn open_input(&self, path: &Path, stream: &'static str) -> Result<File, CmdError> {
        File::open(path).map_err(|source| CmdError::Redirect {
            stream,
            program: self.program().to_string(),
            source,
        })
    }

    fn create_output(&self, path: &Path, stream: &'static str) -> Result<File, CmdError> {
        File::create(path).map_err(|source| CmdError::Redirect {
            stream,
            program: self.program().to_string(),
            source,
        })
    }
}

impl AtomicCommandBuilder {
    pub fn bind(mut self, key: impl Into<String>, binding: Binding) -> Self {
        self.bindings.insert(key.into(), binding);
        self
    }

    pub fn stdin(mut self, spec: StdinSpec) -> Self {
        self.stdin = spec;
        self
    }

    pub fn stdout(mut self, spec: StdoutSpec) -> Self {
        self.stdout = spec;
        self
    }

    pub fn stderr(mut self, spec: StderrSpec) -> Self {
        self.stderr = spec;
        self
    }

    /// Run the process with the temp directory as its working directory.
    /// Input paths then resolve to absolute paths, temp-relative names to
    /// bare names.
    pub fn set_cwd(mut self) -> Self {
        self.set_cwd = true;
        self
    }

    pub fn requirement(mut self, requirement: Requirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    pub fn done(self) -> Result<AtomicCommand, CmdError> {
        if self.argv.is_empty() || self.argv[0].is_empty() {
            return Err(CmdError::EmptyCommand);
        }

        let command = AtomicCommand {
            argv: self.argv,
            bindings: self.bindings,
            stdin: self.stdin,
            stdout: self.stdout,
            stderr: self.stderr,
            set_cwd: self.set_cwd,
            requirements: self.requirements,
        };
        command.validate()?;
        Ok(command)
    }
}

impl AtomicCommand {
    fn validate(&self) -> Result<(), CmdError> {
        for binding in self.bindings.values() {
            match binding {
                Binding::TempInput(name)
                | Binding::TempOutput(name)
                | Binding::TempFifo(name) => check_temp_name(name)?,
                Binding::OutputFile(path) => {
                    if path.file_name().is_none() {
                        return Err(CmdError::BadTempName {
                            name: path.to_string_lossy().into_owned(),
                        });
                    }
                }
                _ => {}
            }
        }

        for name in self.stream_temp_names() {
            check_temp_name(&name)?;
        }

        // Streams must never point at a fifo: opening one from this process
        // would block until the peer appears.
        let fifos = self.fifo_names();
        for name in self.stream_temp_names() {
            if fifos.contains(&name) {
                return Err(CmdError::FifoOnStdio { name });
            }
        }

        // Every temp-relative name written by this command must be unique.
        let mut seen = BTreeSet::new();
        for name in self.produced_temp_names() {
            if fifos.contains(&name) || !seen.insert(name.clone()) {
                return Err(CmdError::OverlappingOutputs { name });
            }
        }

        // Every placeholder must be bound; TEMP_DIR is the only builtin.
        for token in &self.argv {
            for key in placeholder_keys(token) {
                if key != TEMP_DIR_KEY && !self.bindings.contains_key(&key) {
                    return Err(CmdError::UnresolvedPlaceholder {
                        token: token.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Temp names written via stdio redirection (excluding default captures,
    /// whose generated names cannot collide with user names).
    fn stream_temp_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let StdinSpec::TempFile(name) = &self.stdin {
            names.push(name.clone());
        }
        if let StdoutSpec::TempFile(name) = &self.stdout {
            names.push(name.clone());
        }
        if let StderrSpec::TempFile(name) = &self.stderr {
            names.push(name.clone());
        }
        names
    }

    /// Temp names this command writes: required outputs plus scratch
    /// outputs and stream files, but not fifos and not default captures.
    /// Duplicates are kept so overlap validation can see them; two final
    /// outputs sharing a basename would otherwise collapse into one temp
    /// file.
    pub(crate) fn produced_temp_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .output_files()
            .iter()
            .filter_map(|path| path.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect();
        for binding in self.bindings.values() {
            if let Binding::TempOutput(name) = binding {
                names.push(name.clone());
            }
        }
        if let StdoutSpec::TempFile(name) = &self.stdout {
            names.push(name.clone());
        }
        if let StderrSpec::TempFile(name) = &self.stderr {
            names.push(name.clone());
        }
        names
    }
}

fn check_temp_name(name: &str) -> Result<(), CmdError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && Path::new(name).file_name() == Some(std::ffi::OsStr::new(name));
    if valid {
        Ok(())
    } else {
        Err(CmdError::BadTempName {
            name: name.to_string(),
        })
    }
}

/// Extract `{KEY}` placeholder names from one argument token.
fn placeholder_keys(token: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut rest = token;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                keys.push(after[..end].to_string());
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_argv() {
        let argv: Vec<String> = Vec::new();
        assert!(matches!(
            AtomicCommand::build(argv).done(),
            Err(CmdError::EmptyCommand)
        ));
    }

    #[test]
    fn rejects_unbound_placeholder() {
        let err = AtomicCommand::build(["cat", "{IN_FILE}"]).done().unwrap_err();
        assert!(matches!(err, CmdError::UnresolvedPlaceholder { .. }));
    }

    #[test]
    fn temp_dir_is_builtin() {
        AtomicCommand::build(["cat", "{TEMP_DIR}"]).done().unwrap();
    }

    #[test]
    fn rejects_temp_names_with_separators() {
        let err = AtomicCommand::build(["touch", "{OUT}"])
            .bind("OUT", Binding::TempOutput("sub/dir.txt".to_string()))
            .done()
            .unwrap_err();
        assert!(matches!(err, CmdError::BadTempName { .. }));
    }

    #[test]
    fn rejects_overlapping_outputs() {
        let err = AtomicCommand::build(["gen", "{A}", "{B}"])
            .bind("A", Binding::OutputFile("/out/x/result.txt".into()))
            .bind("B", Binding::OutputFile("/out/y/result.txt".into()))
            .done()
            .unwrap_err();
        assert!(matches!(err, CmdError::OverlappingOutputs { .. }));
    }

    #[test]
    fn rejects_fifo_bound_to_stream() {
        let err = AtomicCommand::build(["sort", "{FIFO}"])
            .bind("FIFO", Binding::TempFifo("stream".to_string()))
            .stdout(StdoutSpec::TempFile("stream".to_string()))
            .done()
            .unwrap_err();
        assert!(matches!(err, CmdError::FifoOnStdio { .. }));
    }

    #[test]
    fn resolves_bindings_against_temp_dir() {
        let cmd = AtomicCommand::build(["tool", "{IN}", "{OUT}", "{SCRATCH}"])
            .bind("IN", Binding::InputFile("data/in.txt".into()))
            .bind("OUT", Binding::OutputFile("/final/out.txt".into()))
            .bind("SCRATCH", Binding::TempOutput("scratch.bin".to_string()))
            .done()
            .unwrap();

        let argv = cmd.resolve_argv(Path::new("/tmp/node_1"));
        assert_eq!(
            argv,
            [
                "tool",
                "data/in.txt",
                "/tmp/node_1/out.txt",
                "/tmp/node_1/scratch.bin",
            ]
        );
    }

    #[test]
    fn set_cwd_resolves_inputs_absolute_and_outputs_bare() {
        let cmd = AtomicCommand::build(["tool", "{IN}", "{OUT}"])
            .bind("IN", Binding::InputFile("data/in.txt".into()))
            .bind("OUT", Binding::OutputFile("/final/out.txt".into()))
            .set_cwd()
            .done()
            .unwrap();

        let argv = cmd.resolve_argv(Path::new("/tmp/node_1"));
        assert!(Path::new(&argv[1]).is_absolute());
        assert_eq!(argv[2], "out.txt");
    }

    #[test]
    fn derives_file_sets_from_bindings_and_streams() {
        let cmd = AtomicCommand::build(["tool", "{IN}", "{OUT}", "{REF}"])
            .bind("IN", Binding::InputFile("in.txt".into()))
            .bind("OUT", Binding::OutputFile("/final/out.txt".into()))
            .bind("REF", Binding::AuxFile("ref.idx".into()))
            .bind("HELPER", Binding::Executable("gzip".to_string()))
            .stdin(StdinSpec::File("stdin.txt".into()))
            .stderr(StderrSpec::File("/final/log.txt".into()))
            .done()
            .unwrap();

        assert!(cmd.input_files().contains("in.txt"));
        assert!(cmd.input_files().contains("stdin.txt"));
        assert!(cmd.output_files().contains("/final/out.txt"));
        assert!(cmd.output_files().contains("/final/log.txt"));
        assert!(cmd.auxiliary_files().contains("ref.idx"));
        assert!(cmd.executables().contains("tool"));
        assert!(cmd.executables().contains("gzip"));
    }

    #[test]
    fn required_and_optional_temp_files() {
        let cmd = AtomicCommand::build(["tool", "{OUT}", "{SCRATCH}"])
            .bind("OUT", Binding::OutputFile("/final/out.txt".into()))
            .bind("SCRATCH", Binding::TempOutput("scratch.bin".to_string()))
            .done()
            .unwrap();

        let required = cmd.required_temp_files();
        assert!(required.contains("out.txt"));
        assert_eq!(required.len(), 1);

        let optional = cmd.optional_temp_files(0);
        assert!(optional.contains("scratch.bin"));
        assert!(optional.contains("pipe_tool_00.stdout"));
        assert!(optional.contains("pipe_tool_00.stderr"));
    }

    #[test]
    fn committable_outputs_map_temp_names_to_final_paths() {
        let cmd = AtomicCommand::build(["tool", "{OUT}"])
            .bind("OUT", Binding::OutputFile("/final/out.txt".into()))
            .done()
            .unwrap();

        let outputs = cmd.committable_outputs();
        assert_eq!(outputs.get("out.txt"), Some(&PathBuf::from("/final/out.txt")));
    }
}
