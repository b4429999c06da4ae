//! Build and test invocation plus compile-failure classification.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::catalog::Catalog;
use crate::config::{BuildConfig, PathMapping};
use crate::error::{EvalError, Result};
use crate::process::ProcessRunner;
use crate::types::ErrorAttribution;

/// External build driver for one checkout
#[async_trait]
pub trait BuildTool: Send + Sync {
    /// Build with tests skipped
    async fn compile(&self, project_dir: &Path) -> Result<()>;

    /// Run one test class, returning wall-clock time on success
    async fn test(&self, class: &str, project_dir: &Path) -> Result<Duration>;

    /// Command line recorded in trial results for `class`
    fn test_command(&self, class: &str) -> String;
}

/// Maven-style build driven through [`ProcessRunner`]
pub struct MavenRunner {
    config: BuildConfig,
    test_args: Vec<String>,
    process: ProcessRunner,
}

impl MavenRunner {
    /// Runner for full evaluation (`test_args`)
    pub fn new(config: BuildConfig) -> Self {
        let test_args = config.test_args.clone();
        Self::with_test_args(config, test_args)
    }

    /// Runner for batch mode (`batch_test_args`)
    pub fn for_batch(config: BuildConfig) -> Self {
        let test_args = config.batch_test_args.clone();
        Self::with_test_args(config, test_args)
    }

    fn with_test_args(config: BuildConfig, test_args: Vec<String>) -> Self {
        let process = ProcessRunner::new(config.max_output_bytes);
        Self {
            config,
            test_args,
            process,
        }
    }

    fn class_args(&self, class: &str) -> Vec<String> {
        self.test_args
            .iter()
            .map(|a| a.replace("{class}", class))
            .collect()
    }
}

#[async_trait]
impl BuildTool for MavenRunner {
    async fn compile(&self, project_dir: &Path) -> Result<()> {
        let output = self
            .process
            .run(
                &self.config.program,
                &self.config.compile_args,
                project_dir,
                self.config.compile_timeout(),
            )
            .await?;

        let combined = output.combined();
        if !output.success() || combined.contains(&self.config.build_failure_marker) {
            return Err(EvalError::CompileError { output: combined });
        }
        log::debug!("Compiled {} in {:?}", project_dir.display(), output.elapsed);
        Ok(())
    }

    async fn test(&self, class: &str, project_dir: &Path) -> Result<Duration> {
        let output = self
            .process
            .run(
                &self.config.program,
                &self.class_args(class),
                project_dir,
                self.config.test_timeout(),
            )
            .await?;

        if !output.success() {
            return Err(EvalError::TestExecutionError {
                class: class.to_string(),
                output: output.combined(),
            });
        }
        log::info!("[TEST TIME] {}: {:.3}s", class, output.elapsed.as_secs_f64());
        Ok(output.elapsed)
    }

    fn test_command(&self, class: &str) -> String {
        std::iter::once(self.config.program.clone())
            .chain(self.class_args(class))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// One `[ERROR] File.java:[line,col] message` line
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompileErrorLine {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub message: String,
}

/// Parses compiler diagnostics out of build output
pub struct ErrorClassifier {
    ansi: Regex,
    error_line: Regex,
    marker: String,
}

impl ErrorClassifier {
    pub fn new(compile_error_marker: impl Into<String>) -> Result<Self> {
        let ansi = Regex::new(r"\x1b\[[0-9;]*[A-Za-z]")
            .map_err(|e| EvalError::Config(format!("ansi pattern: {}", e)))?;
        let error_line = Regex::new(r"\[ERROR\]\s+(\S+?\.java):\[(\d+),(\d+)\]\s*(.*)$")
            .map_err(|e| EvalError::Config(format!("error-line pattern: {}", e)))?;
        Ok(Self {
            ansi,
            error_line,
            marker: compile_error_marker.into(),
        })
    }

    pub fn has_compile_errors(&self, output: &str) -> bool {
        output.contains(&self.marker)
    }

    /// Distinct error lines in first-seen order
    pub fn parse(&self, output: &str) -> Vec<CompileErrorLine> {
        let mut seen = HashSet::new();
        let mut errors = Vec::new();
        for raw in output.lines() {
            let line = self.ansi.replace_all(raw, "");
            let Some(caps) = self.error_line.captures(line.trim_end()) else {
                continue;
            };
            let (Ok(line_no), Ok(column)) = (caps[2].parse::<u32>(), caps[3].parse::<u32>()) else {
                continue;
            };
            let error = CompileErrorLine {
                file: caps[1].to_string(),
                line: line_no,
                column,
                message: caps[4].trim().to_string(),
            };
            if seen.insert(error.clone()) {
                errors.push(error);
            }
        }
        errors
    }

    /// Charge each distinct error line to the catalog function containing it.
    /// Unmatched errors are left unattributed.
    pub fn attribute(
        &self,
        output: &str,
        catalog: &mut Catalog,
        mapping: &PathMapping,
        candidate: Option<&str>,
    ) -> Vec<ErrorAttribution> {
        if !self.has_compile_errors(output) {
            return Vec::new();
        }

        let mut attributed = Vec::new();
        for error in self.parse(output) {
            let Some(desc) = catalog.find_for_error_mut(mapping, &error.file, error.line) else {
                log::debug!("No catalog function for {}:{}", error.file, error.line);
                continue;
            };
            desc.record_compile_error();
            log::warn!(
                "Error function: {} {} {}",
                desc.function_position,
                desc.function_name,
                desc.attribution_range()
            );
            attributed.push(ErrorAttribution {
                function_name: desc.function_name.clone(),
                function_position: desc.function_position.clone(),
                lines: desc.attribution_range(),
                error_file: error.file,
                error_line: error.line,
                message: error.message,
                candidate: candidate.map(str::to_string),
            });
        }
        attributed
    }
}

/// Each marker line followed by the next `lines - 1` lines
pub fn error_excerpt(output: &str, marker: &str, lines: usize) -> String {
    let all: Vec<&str> = output.lines().collect();
    let mut excerpt = String::new();
    for (i, line) in all.iter().enumerate() {
        if !line.contains(marker) {
            continue;
        }
        for l in all.iter().skip(i).take(lines) {
            excerpt.push_str(l);
            excerpt.push('\n');
        }
    }
    excerpt
}
