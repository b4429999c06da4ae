//! Core data structures for patch trials, coverage attribution and results.
//!
//! Field names on the wire follow the JSON produced by the candidate and
//! catalog generators (`function_lines`, `uuidMap`, `unitTest`, ...), so the
//! result files can be fed back into the same tooling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::EvalError;

/// Inclusive, 1-indexed line span written as `"start-end"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

impl LineRange {
    pub fn new(start: u32, end: u32) -> Result<Self, EvalError> {
        if start == 0 || end < start {
            return Err(EvalError::InvalidLineRange(format!("{}-{}", start, end)));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, line: u32) -> bool {
        self.start <= line && line <= self.end
    }

    pub fn len(&self) -> usize {
        (self.end - self.start + 1) as usize
    }
}

impl FromStr for LineRange {
    type Err = EvalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| EvalError::InvalidLineRange(s.to_string()))?;
        let start = start
            .trim()
            .parse::<u32>()
            .map_err(|_| EvalError::InvalidLineRange(s.to_string()))?;
        let end = end
            .trim()
            .parse::<u32>()
            .map_err(|_| EvalError::InvalidLineRange(s.to_string()))?;
        Self::new(start, end)
    }
}

impl TryFrom<String> for LineRange {
    type Error = EvalError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LineRange> for String {
    fn from(range: LineRange) -> Self {
        range.to_string()
    }
}

impl fmt::Display for LineRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// A known logging-related function from the static catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    pub function_name: String,
    /// Source file path as written in the catalog
    pub function_position: String,
    pub function_lines: LineRange,
    /// Line span after the candidate body was installed, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_function_lines: Option<LineRange>,
    #[serde(default, rename = "errorNums", skip_serializing_if = "is_zero")]
    error_count: u32,
    #[serde(default, alias = "complied", skip_serializing_if = "Option::is_none")]
    pub compiled: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl FunctionDescriptor {
    pub fn new(
        function_name: impl Into<String>,
        function_position: impl Into<String>,
        function_lines: LineRange,
    ) -> Self {
        Self {
            function_name: function_name.into(),
            function_position: function_position.into(),
            function_lines,
            new_function_lines: None,
            error_count: 0,
            compiled: None,
            extra: Map::new(),
        }
    }

    /// Dedup key used by coverage attribution
    pub fn key(&self) -> (String, String) {
        (self.function_name.clone(), self.function_position.clone())
    }

    /// Span compile errors are matched against
    pub fn attribution_range(&self) -> LineRange {
        self.new_function_lines.unwrap_or(self.function_lines)
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    /// Count one compile error against this function. The counter never decreases.
    pub fn record_compile_error(&mut self) {
        self.error_count = self.error_count.saturating_add(1);
        self.compiled = Some(false);
    }
}

/// One proposed replacement for a function body, awaiting a trial
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub uuid: String,
    pub function_position: String,
    #[serde(rename = "function_lines")]
    pub line_range: LineRange,
    pub prediction: String,
    #[serde(rename = "uuidMap")]
    pub uuid_map: UuidMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Candidate {
    pub fn is_recorded(&self) -> bool {
        self.successful.is_some()
    }

    pub fn unit_count(&self) -> usize {
        self.uuid_map.projects.iter().map(|p| p.unit_tests.len()).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UuidMap {
    /// Module group, e.g. `hadoop-common-project_hadoop-common.json`
    pub top: String,
    #[serde(default)]
    pub projects: Vec<ProjectTests>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectTests {
    pub name: String,
    #[serde(default, rename = "unitTest")]
    pub unit_tests: Vec<UnitTest>,
}

/// Outcome of one test class run for one candidate
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitTest {
    /// Test class name
    pub name: String,
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predict_output: Option<String>,
    /// Seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_time: Option<f64>,
    /// Bytes of tagged output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prediction_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub covered_functions: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Persisted patch state for one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchState {
    Applied,
    Reversed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceItem {
    /// Original text
    pub target: String,
    /// Candidate text
    pub replacement: String,
    pub lines: LineRange,
}

/// Durable audit record; the only source of truth for reversal
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceLogEntry {
    pub candidate: String,
    pub state: PatchState,
    pub file_path: PathBuf,
    pub replace_list: Vec<ReplaceItem>,
    /// BLAKE3 of the file before patching
    pub original_hash: String,
    pub applied_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reversed_at: Option<DateTime<Utc>>,
}

/// A covered source line that is a logging call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageRecord {
    pub line_number: u32,
    pub log_line: String,
    pub position: PathBuf,
}

/// Catalog function with the covered log lines attributed to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoveredFunction {
    #[serde(flatten)]
    pub descriptor: FunctionDescriptor,
    #[serde(rename = "coveredLog")]
    pub covered_log: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialStatus {
    Success,
    Failed,
}

/// One record of the run-scoped result log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialResult {
    pub project: String,
    pub class_name: String,
    pub status: TrialStatus,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mvn_test_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl TrialResult {
    pub fn success(
        project: impl Into<String>,
        class_name: impl Into<String>,
        command: impl Into<String>,
        test_dir: PathBuf,
    ) -> Self {
        Self {
            project: project.into(),
            class_name: class_name.into(),
            status: TrialStatus::Success,
            command: command.into(),
            error: None,
            mvn_test_dir: Some(test_dir),
            candidate: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn failed(
        project: impl Into<String>,
        class_name: impl Into<String>,
        command: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            class_name: class_name.into(),
            status: TrialStatus::Failed,
            command: command.into(),
            error: Some(error.into()),
            mvn_test_dir: None,
            candidate: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn for_candidate(mut self, uuid: impl Into<String>) -> Self {
        self.candidate = Some(uuid.into());
        self
    }
}

/// Per-candidate life cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialState {
    Pending,
    Patched,
    Compiled,
    CompileFailed,
    Tested,
    Reversed,
    Recorded,
}

impl TrialState {
    /// Whether `next` is a legal successor of `self`
    pub fn can_advance(self, next: TrialState) -> bool {
        use TrialState::*;
        match (self, next) {
            (Pending, Patched) => true,
            (Patched, Compiled) | (Patched, CompileFailed) => true,
            (Compiled, Tested) | (Tested, Tested) => true,
            // reversal is reachable from every state that may hold a patch
            (Patched | Compiled | CompileFailed | Tested, Reversed) => true,
            // a candidate whose patch never landed goes straight to recording
            (Pending | Reversed, Recorded) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TrialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrialState::Pending => "PENDING",
            TrialState::Patched => "PATCHED",
            TrialState::Compiled => "COMPILED",
            TrialState::CompileFailed => "COMPILE_FAILED",
            TrialState::Tested => "TESTED",
            TrialState::Reversed => "REVERSED",
            TrialState::Recorded => "RECORDED",
        };
        f.write_str(s)
    }
}

/// A compile error pinned to a catalog function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorAttribution {
    pub function_name: String,
    pub function_position: String,
    pub lines: LineRange,
    pub error_file: String,
    pub error_line: u32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
}

/// Aggregate threaded through a full-evaluation run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub processed: usize,
    pub skipped: usize,
    pub compiled: usize,
    pub compile_failed: usize,
    pub patch_failed: usize,
    /// Candidates whose artifacts could not be recorded while patched
    pub trial_errors: usize,
    pub units_passed: usize,
    pub units_failed: usize,
    pub recovered: Vec<String>,
    pub restore_mismatches: Vec<String>,
    pub error_functions: Vec<ErrorAttribution>,
}

impl RunSummary {
    pub fn record_unit(&mut self, passed: bool) {
        if passed {
            self.units_passed += 1;
        } else {
            self.units_failed += 1;
        }
    }
}
