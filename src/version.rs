// src/version.rs

//! Version requirements for external tools.
//!
//! A [`Requirement`] describes how to probe a tool ("run `bwa` and search
//! its output for `Version: (\d+)\.(\d+)\.(\d+)`") and the minimum version
//! that satisfies the node. Requirements are plain data, so nodes carrying
//! them stay dispatchable to workers; probing happens lazily on first check
//! and the result is cached in the [`VersionCache`] owned by the pipeline
//! configuration.

use std::collections::HashMap;
use std::process::Command;
use std::sync::Mutex;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::VersionError;

/// A declared version requirement on an external tool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Requirement {
    /// Descriptive name, used in error messages.
    pub name: String,
    /// Probe invocation; stdout and stderr are searched as one string.
    pub argv: Vec<String>,
    /// Regular expression whose capture groups are the version fields.
    pub search: String,
    /// Lowest acceptable version, compared field by field.
    pub minimum: Vec<u32>,
}

impl Requirement {
    /// Build a requirement, validating the search pattern up front so that a
    /// malformed regex is a construction-time error rather than a probe-time
    /// surprise.
    pub fn new(
        name: impl Into<String>,
        argv: impl IntoIterator<Item = impl Into<String>>,
        search: impl Into<String>,
        minimum: impl Into<Vec<u32>>,
    ) -> Result<Self, VersionError> {
        let name = name.into();
        let search = search.into();

        Regex::new(&search).map_err(|err| VersionError::Probe {
            name: name.clone(),
            message: format!("invalid version pattern {search:?}: {err}"),
        })?;

        Ok(Self {
            name,
            argv: argv.into_iter().map(Into::into).collect(),
            search,
            minimum: minimum.into(),
        })
    }

    /// Check the requirement against the cached (or freshly probed) version.
    pub fn check(&self, cache: &VersionCache) -> Result<(), VersionError> {
        let found = cache.version_of(self)?;
        if found >= self.minimum {
            Ok(())
        } else {
            Err(VersionError::NotMet {
                name: self.name.clone(),
                expected: format!("at least {}", pretty_version(&self.minimum)),
                found: pretty_version(&found),
            })
        }
    }

    fn probe(&self) -> Result<Vec<u32>, VersionError> {
        debug!(name = %self.name, argv = ?self.argv, "probing tool version");

        let output = match self.argv.split_first() {
            Some((program, args)) => Command::new(program)
                .args(args)
                .output()
                .map_err(|err| VersionError::Probe {
                    name: self.name.clone(),
                    message: err.to_string(),
                })?,
            None => {
                return Err(VersionError::Probe {
                    name: self.name.clone(),
                    message: "empty probe invocation".to_string(),
                });
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        // Pattern validity was checked at construction time.
        let regex = Regex::new(&self.search).map_err(|err| VersionError::Probe {
            name: self.name.clone(),
            message: err.to_string(),
        })?;

        let captures = regex.captures(&text).ok_or_else(|| VersionError::NoMatch {
            name: self.name.clone(),
            pattern: self.search.clone(),
            output: text.clone(),
        })?;

        let mut fields = Vec::new();
        for group in captures.iter().skip(1).flatten() {
            let value = group.as_str().parse::<u32>().map_err(|_| VersionError::NoMatch {
                name: self.name.clone(),
                pattern: self.search.clone(),
                output: text.clone(),
            })?;
            fields.push(value);
        }

        if fields.is_empty() {
            return Err(VersionError::NoMatch {
                name: self.name.clone(),
                pattern: self.search.clone(),
                output: text,
            });
        }

        Ok(fields)
    }
}

/// Cache of probed tool versions, keyed by the full requirement.
///
/// Populated on first check, never invalidated within a run. Owned by the
/// pipeline [`Config`](crate::config::Config) and shared across nodes.
#[derive(Debug, Default)]
pub struct VersionCache {
    inner: Mutex<HashMap<Requirement, Result<Vec<u32>, VersionError>>>,
}

impl VersionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn version_of(&self, requirement: &Requirement) -> Result<Vec<u32>, VersionError> {
        let mut cache = self.inner.lock().expect("version cache poisoned");
        if let Some(cached) = cache.get(requirement) {
            return cached.clone();
        }

        let result = requirement.probe();
        cache.insert(requirement.clone(), result.clone());
        result
    }
}

fn pretty_version(fields: &[u32]) -> String {
    format!(
        "v{}",
        fields
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(".")
    )
}
