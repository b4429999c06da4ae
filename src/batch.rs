//! Batch mode: run named test lists class by class without patching.
//!
//! A mode names a test list `{ "<top>": [ { "project": .., "classList": [..] } ] }`.
//! Projects with an empty class list get their classes from the
//! [`CandidateSelector`] and always collect coverage; listed classes collect
//! coverage only when the mode asks for it. Every class run is snapshotted
//! into a timestamped directory under the mode's save directory.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::catalog::Catalog;
use crate::config::{BatchMode, EvalConfig, PathMapping};
use crate::coverage::CoverageMapper;
use crate::error::{EvalError, Result};
use crate::runner::BuildTool;
use crate::selector::CandidateSelector;
use crate::store;
use crate::types::{TrialResult, TrialStatus};

pub const COVERED_FUNCTIONS_FILE: &str = "coveredLogsFunctions.json";
pub const COVERAGE_FILE: &str = "jacoco.xml";
pub const LOGS_FILE: &str = "logs.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectEntry {
    pub project: String,
    #[serde(default)]
    pub class_list: Vec<String>,
    /// Starting selector threshold for this project
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<usize>,
}

pub type TestList = BTreeMap<String, Vec<ProjectEntry>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub projects: usize,
    pub classes: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct BatchRunner<B: BuildTool> {
    config: EvalConfig,
    name: String,
    mode: BatchMode,
    build: B,
    selector: CandidateSelector,
    mapper: CoverageMapper,
    mapping: PathMapping,
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(|e| EvalError::io(format!("walking {}", from.display()), e.into()))?;
        let Ok(relative) = entry.path().strip_prefix(from) else {
            continue;
        };
        let target = to.join(relative);
        let result = if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
        } else {
            fs::copy(entry.path(), &target).map(|_| ())
        };
        result.map_err(|e| EvalError::io(format!("copying into {}", target.display()), e))?;
    }
    Ok(())
}

fn copy_file(from: &Path, to: &Path) -> Result<()> {
    fs::copy(from, to)
        .map(|_| ())
        .map_err(|e| EvalError::io(format!("copying {} to {}", from.display(), to.display()), e))
}

/// Snapshot directory name: class name plus an ISO timestamp with `:` replaced
pub fn snapshot_name(class: &str) -> String {
    let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    format!("{}{}", class, stamp.replace(':', "-"))
}

impl<B: BuildTool> BatchRunner<B> {
    pub fn new(config: EvalConfig, name: &str, build: B) -> Result<Self> {
        let mode = config
            .batch
            .resolve(name)
            .cloned()
            .ok_or_else(|| EvalError::Config(format!("unknown batch mode `{}`", name)))?;
        let selector = CandidateSelector::new(config.selector.clone());
        let mapper = CoverageMapper::new(&config.coverage);
        let mapping = config.path_mapping();
        Ok(Self {
            config,
            name: name.to_string(),
            mode,
            build,
            selector,
            mapper,
            mapping,
        })
    }

    pub fn save_dir(&self) -> PathBuf {
        self.config.batch.save_root.join(&self.name)
    }

    pub async fn run(&self) -> Result<BatchSummary> {
        let (catalog, list) = tokio::try_join!(
            store::read_json_async(&self.config.paths.catalog),
            store::read_json_async::<TestList>(&self.mode.test_list),
        )?;
        let catalog = Catalog::new(catalog);

        let mut summary = BatchSummary::default();
        for (top, projects) in &list {
            for entry in projects {
                log::info!("Process project {} / {}", top, entry.project);
                summary.projects += 1;
                for result in self.run_project(top, entry, &catalog).await? {
                    summary.classes += 1;
                    match result.status {
                        TrialStatus::Success => summary.succeeded += 1,
                        TrialStatus::Failed => summary.failed += 1,
                    }
                }
            }
        }
        log::info!(
            "All done: {} classes in {} projects, {} succeeded, {} failed",
            summary.classes,
            summary.projects,
            summary.succeeded,
            summary.failed
        );
        Ok(summary)
    }

    async fn run_project(&self, top: &str, entry: &ProjectEntry, catalog: &Catalog) -> Result<Vec<TrialResult>> {
        let project_dir = self.config.paths.source_root.join(top).join(&entry.project);
        let save_dir = self.save_dir().join(&entry.project);
        fs::create_dir_all(&save_dir)
            .map_err(|e| EvalError::io(format!("creating {}", save_dir.display()), e))?;

        let selected = entry.class_list.is_empty();
        let classes = if selected {
            let tests = project_dir.join(&self.config.artifacts.test_sources);
            let start = entry.rules.unwrap_or(self.config.selector.initial_threshold);
            let outcome = self.selector.select_from(&tests, start);
            log::info!("{} / {}: threshold is {}", top, entry.project, outcome.threshold);
            outcome.classes
        } else {
            entry.class_list.clone()
        };
        let collect = selected || self.mode.collect_coverage;
        log::info!("Project {}: {} test classes, coverage {}", entry.project, classes.len(), collect);

        let mut logs = Vec::with_capacity(classes.len());
        for class in &classes {
            let result = self
                .run_class(&entry.project, class, &project_dir, &save_dir, collect, catalog)
                .await;
            logs.push(result);
            store::write_json_atomic(&save_dir.join(LOGS_FILE), &logs)?;
        }
        Ok(logs)
    }

    async fn run_class(
        &self,
        project: &str,
        class: &str,
        project_dir: &Path,
        save_dir: &Path,
        collect: bool,
        catalog: &Catalog,
    ) -> TrialResult {
        let command = self.build.test_command(class);
        log::info!("Process class {}", class);

        if let Err(err) = self.build.test(class, project_dir).await {
            log::error!("Error in test {}: {}", class, err);
            return TrialResult::failed(project, class, command, err.diagnostic());
        }

        match self.collect_class(class, project_dir, save_dir, collect, catalog) {
            Ok(Some(reason)) => {
                log::warn!("{} for {}", reason, class);
                TrialResult::failed(project, class, command, reason)
            }
            Ok(None) => {
                log::info!("Process class {}: done", class);
                TrialResult::success(project, class, command, project_dir.to_path_buf())
            }
            Err(err) => {
                log::error!("Collecting artifacts for {} failed: {}", class, err);
                TrialResult::failed(project, class, command, err.to_string())
            }
        }
    }

    /// Copy and map artifacts for a passed class. `Ok(Some(reason))` is a
    /// soft failure recorded against the class.
    fn collect_class(
        &self,
        class: &str,
        project_dir: &Path,
        save_dir: &Path,
        collect: bool,
        catalog: &Catalog,
    ) -> Result<Option<String>> {
        let artifacts = &self.config.artifacts;
        let covered_file = save_dir.join(COVERED_FUNCTIONS_FILE);
        let coverage_copy = save_dir.join(COVERAGE_FILE);

        if collect {
            let report = project_dir.join(&artifacts.coverage_report);
            if !report.exists() {
                return Err(EvalError::MissingArtifact { path: report });
            }
            copy_file(&report, &coverage_copy)?;
            let base = project_dir.join(&artifacts.main_sources);
            let covered = self.mapper.map(&coverage_copy, &base, catalog, &self.mapping)?;
            if !CoverageMapper::write_covered(&covered_file, &covered)? {
                return Ok(Some(format!("No {} file", COVERED_FUNCTIONS_FILE)));
            }
        }

        let reports = project_dir.join(&artifacts.reports_dir);
        if !reports.is_dir() {
            return Ok(Some("No logs file".to_string()));
        }

        let snapshot = save_dir.join(snapshot_name(class));
        copy_dir(&reports, &snapshot)?;
        if collect {
            copy_file(&covered_file, &snapshot.join(COVERED_FUNCTIONS_FILE))?;
            copy_file(&coverage_copy, &snapshot.join(COVERAGE_FILE))?;
            fs::remove_file(&covered_file)
                .map_err(|e| EvalError::io(format!("removing {}", covered_file.display()), e))?;
        }
        Ok(None)
    }
}
