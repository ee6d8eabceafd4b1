// SPDX-License-Identifier: Apache-2.0

use glob::{Pattern, glob};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::debug;

use crate::error::{Error, Result};

/// Resolves include globs to regular files, minus anything an exclude glob matches.
#[derive(Debug, Clone)]
pub struct FileFinder {
    include: Vec<String>,
    exclude: Vec<Pattern>,
}

impl FileFinder {
    /// Patterns are validated here so a bad glob is reported at startup
    /// rather than on the first scan.
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Result<Self> {
        for pattern in &include {
            Pattern::new(pattern)
                .map_err(|e| Error::InvalidGlob(format!("{}: {}", pattern, e)))?;
        }
        let exclude = exclude
            .iter()
            .map(|p| Pattern::new(p).map_err(|e| Error::InvalidGlob(format!("{}: {}", p, e))))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { include, exclude })
    }

    /// Matching files in pattern order, each path once. Matching nothing is
    /// not an error. Entries that cannot be inspected are skipped.
    pub fn find_files(&self) -> Result<Vec<PathBuf>> {
        let mut seen = HashSet::new();
        let mut paths = Vec::new();

        for pattern in &self.include {
            let matches = glob(pattern).map_err(|e| Error::InvalidGlob(e.to_string()))?;

            for entry in matches {
                let path = match entry {
                    Ok(path) => path,
                    Err(e) => {
                        debug!(path = ?e.path(), error = %e.error(), "Skipping unreadable glob entry");
                        continue;
                    }
                };

                if !path.is_file() {
                    continue;
                }
                if self.exclude.iter().any(|p| p.matches_path(&path)) {
                    continue;
                }
                if seen.insert(path.clone()) {
                    paths.push(path);
                }
            }
        }

        Ok(paths)
    }
}
