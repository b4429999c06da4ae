//! Run configuration.
//!
//! Everything has a default so an empty TOML file is a valid config. Paths
//! that differ between the machine that produced the catalog and the
//! checkout being tested are handled by [`PathMapping`], resolved once at
//! startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{EvalError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    pub paths: PathsConfig,
    pub build: BuildConfig,
    pub artifacts: ArtifactConfig,
    pub selector: SelectorConfig,
    pub coverage: CoverageConfig,
    pub batch: BatchConfig,
    /// Skip candidates that already have a recorded outcome
    pub resume: bool,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            build: BuildConfig::default(),
            artifacts: ArtifactConfig::default(),
            selector: SelectorConfig::default(),
            coverage: CoverageConfig::default(),
            batch: BatchConfig::default(),
            resume: true,
        }
    }
}

impl EvalConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EvalConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EvalError::io(format!("reading config {}", path.display()), e))?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.build.program.trim().is_empty() {
            return Err(EvalError::Config("build.program is empty".into()));
        }
        if self.build.compile_timeout_secs == 0 || self.build.test_timeout_secs == 0 {
            return Err(EvalError::Config("build timeouts must be positive".into()));
        }
        if self.build.max_output_bytes == 0 {
            return Err(EvalError::Config("build.max_output_bytes must be positive".into()));
        }
        if self.selector.increment == 0 {
            return Err(EvalError::Config("selector.increment must be positive".into()));
        }
        Ok(())
    }

    pub fn path_mapping(&self) -> PathMapping {
        PathMapping::new(self.paths.mappings.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Checkout that holds the module groups under test
    pub source_root: PathBuf,
    /// Root of per-tool data directories
    pub data_root: PathBuf,
    /// Descriptor catalog JSON
    pub catalog: PathBuf,
    pub mappings: Vec<PathRule>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            source_root: PathBuf::from("hadoop"),
            data_root: PathBuf::from("data"),
            catalog: PathBuf::from("data/hadoop-cleaned.json"),
            mappings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub program: String,
    pub compile_args: Vec<String>,
    /// `{class}` is replaced with the test class name
    pub test_args: Vec<String>,
    pub batch_test_args: Vec<String>,
    pub compile_timeout_secs: u64,
    pub test_timeout_secs: u64,
    pub max_output_bytes: usize,
    pub build_failure_marker: String,
    pub compile_error_marker: String,
    pub error_excerpt_lines: usize,
    /// Also keep the full build output next to the excerpt
    pub record_full_output: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            program: "mvn".to_string(),
            compile_args: vec!["clean".into(), "install".into(), "-DskipTests".into()],
            test_args: vec!["test".into(), "-Ptest-only".into(), "-Dtest={class}".into()],
            batch_test_args: vec!["clean".into(), "test".into(), "-Dtest={class}".into()],
            compile_timeout_secs: 30 * 60,
            test_timeout_secs: 15 * 60,
            max_output_bytes: 100 * 1024 * 1024,
            build_failure_marker: "BUILD FAILURE".to_string(),
            compile_error_marker: "COMPILATION ERROR :".to_string(),
            error_excerpt_lines: 10,
            record_full_output: false,
        }
    }
}

impl BuildConfig {
    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    pub reports_dir: PathBuf,
    pub output_suffix: String,
    pub output_tag: String,
    pub coverage_report: PathBuf,
    pub main_sources: PathBuf,
    pub test_sources: PathBuf,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            reports_dir: PathBuf::from("target/surefire-reports"),
            output_suffix: "-output.txt".to_string(),
            output_tag: "[SUPER TAG]".to_string(),
            coverage_report: PathBuf::from("target/site/jacoco/jacoco.xml"),
            main_sources: PathBuf::from("src/main/java"),
            test_sources: PathBuf::from("src/test"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub marker: String,
    pub extension: String,
    pub initial_threshold: usize,
    pub increment: usize,
    pub max_classes: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            marker: "@Test".to_string(),
            extension: "java".to_string(),
            initial_threshold: 0,
            increment: 500,
            max_classes: 66,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageConfig {
    /// Case-insensitive prefix of a logging call
    pub log_prefix: String,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            log_prefix: "log.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Directory that holds per-mode save directories
    pub save_root: PathBuf,
    /// Checked in order; the first match wins
    pub modes: Vec<BatchMode>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            save_root: PathBuf::from("data"),
            modes: vec![
                BatchMode::exact("newTest", "data/breakPoiint.json"),
                BatchMode::exact("secondTest", "afterTest/coveredFuntionTestUnits.json"),
                BatchMode::exact("predictionTest", "afterTest/avaliableTestList.json"),
                BatchMode::prefixed("tagTest", "afterTest/coveredFunctionTestUnits.json"),
                BatchMode::prefixed("errorTest", "afterTest/coveredFunctionTestUnitsMAX.json"),
                BatchMode {
                    collect_coverage: true,
                    ..BatchMode::prefixed("sameOutputTest", "A_tagHashTest/mapNew.json")
                },
                BatchMode::prefixed("hashTag", "A_tagHashTest/mapNew.json"),
            ],
        }
    }
}

impl BatchConfig {
    pub fn resolve(&self, name: &str) -> Option<&BatchMode> {
        self.modes.iter().find(|m| m.matches(name))
    }
}

/// A named test-selection mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMode {
    /// Mode name, or its prefix unless `exact` is set
    pub prefix: String,
    /// Match the whole name only
    #[serde(default)]
    pub exact: bool,
    /// JSON test list: `{ "<top>": [ { "project": .., "classList": [..] } ] }`
    pub test_list: PathBuf,
    /// Collect coverage even for explicitly listed classes
    #[serde(default)]
    pub collect_coverage: bool,
}

impl BatchMode {
    pub fn exact(name: &str, test_list: &str) -> Self {
        Self {
            prefix: name.to_string(),
            exact: true,
            test_list: PathBuf::from(test_list),
            collect_coverage: false,
        }
    }

    pub fn prefixed(prefix: &str, test_list: &str) -> Self {
        Self {
            exact: false,
            ..Self::exact(prefix, test_list)
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        if self.exact {
            name == self.prefix
        } else {
            name.starts_with(&self.prefix)
        }
    }
}

/// Prefix rewrite between catalog paths and the local checkout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRule {
    pub catalog: String,
    pub local: String,
}

#[derive(Debug, Clone, Default)]
pub struct PathMapping {
    rules: Vec<PathRule>,
}

impl PathMapping {
    pub fn new(rules: Vec<PathRule>) -> Self {
        Self { rules }
    }

    /// Translate a catalog path into the checkout
    pub fn to_local(&self, catalog_path: &str) -> PathBuf {
        for rule in &self.rules {
            if let Some(rest) = catalog_path.strip_prefix(&rule.catalog) {
                return PathBuf::from(format!("{}{}", rule.local, rest));
            }
        }
        PathBuf::from(catalog_path)
    }

    /// Translate a checkout path back into catalog form
    pub fn to_catalog(&self, local_path: &str) -> String {
        for rule in &self.rules {
            if let Some(rest) = local_path.strip_prefix(&rule.local) {
                return format!("{}{}", rule.catalog, rest);
            }
        }
        local_path.to_string()
    }

    /// Catalog path with any known root removed, for suffix matching
    pub fn relative<'a>(&self, catalog_path: &'a str) -> &'a str {
        for rule in &self.rules {
            if let Some(rest) = catalog_path.strip_prefix(&rule.catalog) {
                return rest;
            }
        }
        catalog_path
    }
}
