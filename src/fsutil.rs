// src/fsutil.rs

//! Filesystem helpers shared by the node lifecycle and the commit protocol.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use crate::errors::NodeError;
use crate::fileset::FileSet;

/// Returns the declared paths that do not exist on disk. Zero-byte files
/// count as existing; no distinction is made between files and directories.
pub fn missing_files(files: &FileSet) -> Vec<PathBuf> {
    files
        .iter()
        .filter(|path| !path.exists())
        .map(Path::to_path_buf)
        .collect()
}

/// Returns true if any of the `younger` files has been modified after any of
/// the `older` files, based on modification timestamps.
///
/// Both sets must be non-empty and every file must exist; callers are
/// expected to have established this via `is_done` first.
pub fn modified_after(younger: &FileSet, older: &FileSet) -> Result<bool, NodeError> {
    let younger_time = mtimes(younger)?.into_iter().max();
    let older_time = mtimes(older)?.into_iter().min();

    match (younger_time, older_time) {
        (Some(y), Some(o)) => Ok(y > o),
        _ => Ok(false),
    }
}

fn mtimes(files: &FileSet) -> Result<Vec<SystemTime>, NodeError> {
    files
        .iter()
        .map(|path| {
            fs::metadata(path)
                .and_then(|meta| meta.modified())
                .map_err(|source| NodeError::Io {
                    path: path.to_path_buf(),
                    source,
                })
        })
        .collect()
}

/// Returns true if `name` refers to an executable file, either via an
/// explicit path or by lookup on the current `PATH`.
pub fn executable_exists(name: &str) -> bool {
    let path = Path::new(name);
    if path.parent().is_some_and(|p| !p.as_os_str().is_empty()) {
        return is_executable(path);
    }

    let Some(search_path) = std::env::var_os("PATH") else {
        return false;
    };

    std::env::split_paths(&search_path).any(|dir| is_executable(&dir.join(name)))
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path)
            .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

/// Returns the declared executables that cannot be resolved.
pub fn missing_executables(executables: &FileSet) -> Vec<String> {
    executables
        .iter()
        .map(|path| path.to_string_lossy().into_owned())
        .filter(|name| !executable_exists(name))
        .collect()
}

static TEMP_DIR_SEQ: AtomicU64 = AtomicU64::new(0);

/// Creates a fresh, uniquely named directory under `root`.
///
/// The name combines the process id, a process-wide counter, and a clock
/// reading, and creation is retried on the (unlikely) collision, so
/// concurrently running nodes never share a temp directory.
pub fn create_temp_dir(root: &Path) -> Result<PathBuf, NodeError> {
    fs::create_dir_all(root).map_err(|source| NodeError::TempDir {
        path: root.to_path_buf(),
        source,
    })?;

    loop {
        let seq = TEMP_DIR_SEQ.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let path = root.join(format!("node_{}_{}_{:08x}", std::process::id(), seq, nanos));

        match fs::create_dir(&path) {
            Ok(()) => return Ok(path),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(source) => return Err(NodeError::TempDir { path, source }),
        }
    }
}

/// Moves `source` to `destination` via rename, creating the destination's
/// parent directory if needed. Rename keeps the commit atomic per file: the
/// destination either does not exist or is fully formed.
pub fn move_file(source: &Path, destination: &Path) -> std::io::Result<()> {
    if let Some(parent) = destination.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::rename(source, destination)
}

/// Removes a file, returning whether it existed. Errors other than
/// "not found" are propagated.
pub fn try_remove(path: &Path) -> std::io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}
