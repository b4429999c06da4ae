//! Adaptive test-class selection.
//!
//! Every eligible file is a test source that carries the test marker and is
//! longer than the current threshold. While more than `max_classes` files
//! qualify, the threshold is raised by a fixed increment and the filter is
//! rerun. Raising the threshold can only shrink the eligible set, and once
//! it passes the longest file the set is empty, so the loop terminates.

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::SelectorConfig;

/// Classes chosen for a project and the threshold that produced them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionOutcome {
    pub classes: Vec<String>,
    pub threshold: usize,
}

struct TestSource {
    path: PathBuf,
    length: usize,
    has_marker: bool,
}

pub struct CandidateSelector {
    config: SelectorConfig,
}

impl CandidateSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self { config }
    }

    fn scan(&self, dir: &Path) -> Vec<TestSource> {
        let mut sources = Vec::new();
        for entry in WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(self.config.extension.as_str())
            {
                continue;
            }
            match std::fs::read_to_string(path) {
                Ok(content) => sources.push(TestSource {
                    path: path.to_path_buf(),
                    length: content.chars().count(),
                    has_marker: content.contains(self.config.marker.as_str()),
                }),
                Err(e) => log::debug!("Skipping unreadable {}: {}", path.display(), e),
            }
        }
        sources
    }

    /// Select from the test sources under `dir`, starting at the configured threshold
    pub fn select(&self, dir: &Path) -> SelectionOutcome {
        self.select_from(dir, self.config.initial_threshold)
    }

    pub fn select_from(&self, dir: &Path, initial_threshold: usize) -> SelectionOutcome {
        let sources = self.scan(dir);
        let increment = self.config.increment.max(1);
        let mut threshold = initial_threshold;

        loop {
            let eligible: Vec<&TestSource> = sources
                .iter()
                .filter(|s| s.has_marker && s.length > threshold)
                .collect();

            if eligible.len() > self.config.max_classes {
                log::debug!(
                    "{} classes over cap {} at threshold {}",
                    eligible.len(),
                    self.config.max_classes,
                    threshold
                );
                threshold += increment;
                continue;
            }

            let classes = eligible
                .iter()
                .filter_map(|s| s.path.file_stem())
                .map(|stem| stem.to_string_lossy().into_owned())
                .collect::<Vec<_>>();

            log::info!(
                "Selected {} test classes under {} (threshold {})",
                classes.len(),
                dir.display(),
                threshold
            );
            return SelectionOutcome { classes, threshold };
        }
    }
}
