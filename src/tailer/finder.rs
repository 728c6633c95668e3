// SPDX-License-Identifier: Apache-2.0

use glob::{Pattern, glob};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// FileMatcher expands include globs into files and drops ignored paths.
///
/// Bad patterns and unreadable directory entries are skipped, so resolving
/// never fails; at worst it returns an empty list.
#[derive(Debug, Clone)]
pub struct FileMatcher {
    include: Vec<String>,
    ignore: Vec<Pattern>,
}

impl FileMatcher {
    pub fn new(include: Vec<String>, ignore: &[String]) -> Self {
        let ignore = ignore
            .iter()
            .filter_map(|p| match Pattern::new(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    debug!(pattern = %p, error = %e, "Skipping invalid ignore pattern");
                    None
                }
            })
            .collect();

        Self { include, ignore }
    }

    /// All regular files matched by an include pattern and no ignore pattern.
    pub fn resolve(&self) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        let mut paths = Vec::new();

        for pattern in &self.include {
            let matches = match glob(pattern) {
                Ok(m) => m,
                Err(e) => {
                    debug!(pattern = %pattern, error = %e, "Skipping invalid include pattern");
                    continue;
                }
            };

            for entry in matches {
                let path = match entry {
                    Ok(p) => p,
                    Err(e) => {
                        debug!(error = %e, "Skipping unreadable glob entry");
                        continue;
                    }
                };

                if path.is_dir() {
                    continue;
                }

                let path = std::path::absolute(&path).unwrap_or(path);
                if seen.insert(path.clone()) {
                    paths.push(path);
                }
            }
        }

        self.retain_not_ignored(paths)
    }

    /// Remove every path matched by an ignore pattern.
    pub fn retain_not_ignored(&self, mut paths: Vec<PathBuf>) -> Vec<PathBuf> {
        paths.retain(|p| !self.is_ignored(p));
        paths
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        self.ignore.iter().any(|pattern| pattern.matches_path(path))
    }
}

/// Expand `patterns` and drop anything matching `ignore`.
pub fn resolve(patterns: &[String], ignore: &[String]) -> Vec<PathBuf> {
    FileMatcher::new(patterns.to_vec(), ignore).resolve()
}
