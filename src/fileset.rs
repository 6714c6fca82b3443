// src/fileset.rs

//! Canonical ordered sets of file paths.
//!
//! Every place the node API accepts "files" goes through [`FileSet`], which
//! normalizes a single path, an ordered sequence, or a set into one ordered
//! set type at the boundary. Iteration order is the sorted path order, so
//! diagnostics and dispatch decisions are deterministic.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// An ordered, de-duplicated set of file paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSet(BTreeSet<PathBuf>);

impl FileSet {
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self(paths.into_iter().map(Into::into).collect())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.0.iter().map(PathBuf::as_path)
    }

    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.0.contains(path.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>) {
        self.0.insert(path.into());
    }

    /// Merge another set into this one (used when aggregating the file sets
    /// of every command in a pipeline).
    pub fn merge(&mut self, other: &FileSet) {
        self.0.extend(other.0.iter().cloned());
    }

    /// Returns true if any declared path is malformed (empty).
    pub fn has_invalid_paths(&self) -> bool {
        self.0.iter().any(|p| p.as_os_str().is_empty())
    }

    /// Sorted paths, for error messages and the diagnostic log.
    pub fn sorted(&self) -> Vec<PathBuf> {
        self.0.iter().cloned().collect()
    }
}

impl From<&str> for FileSet {
    fn from(path: &str) -> Self {
        Self::new([path])
    }
}

impl From<PathBuf> for FileSet {
    fn from(path: PathBuf) -> Self {
        Self::new([path])
    }
}

impl From<&Path> for FileSet {
    fn from(path: &Path) -> Self {
        Self::new([path.to_path_buf()])
    }
}

impl<P: Into<PathBuf>> FromIterator<P> for FileSet {
    fn from_iter<I: IntoIterator<Item = P>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl<'a> IntoIterator for &'a FileSet {
    type Item = &'a PathBuf;
    type IntoIter = std::collections::btree_set::Iter<'a, PathBuf>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
