//! Error taxonomy for dynamic evaluation.
//!
//! Per-candidate errors are caught at the orchestrator boundary and turned
//! into failed trial records; only catalog/candidate loading errors abort a run.

use std::path::PathBuf;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, EvalError>;

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    /// External build failed; output kept for attribution and excerpts
    #[error("compilation failed")]
    CompileError { output: String },

    /// Test invocation exited nonzero
    #[error("test execution failed for {class}")]
    TestExecutionError { class: String, output: String },

    /// Expected report or log artifact absent after a run
    #[error("missing artifact: {}", path.display())]
    MissingArtifact { path: PathBuf },

    /// Reversal of an entry that is already consumed
    #[error("replace log {id} already reversed")]
    ReversalConflict { id: String },

    /// Patch target is not unique in its file
    #[error("ambiguous replacement in {}: {occurrences} occurrences", path.display())]
    AmbiguousReplacement { path: PathBuf, occurrences: usize },

    #[error("`{command}` timed out after {}s", after.as_secs())]
    Timeout { command: String, after: Duration },

    #[error("`{command}` produced more than {limit} bytes of output")]
    OutputOverflow { command: String, limit: usize },

    #[error("no replace log for candidate {id}")]
    NoSuchLog { id: String },

    #[error("invalid line range `{0}`")]
    InvalidLineRange(String),

    #[error("invalid candidate {id}: {reason}")]
    InvalidCandidate { id: String, reason: String },

    #[error("malformed coverage report {}: {reason}", path.display())]
    CoverageReport { path: PathBuf, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("json error in {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl EvalError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            context: context.into(),
            source,
        }
    }

    /// Short stable tag recorded in trial results
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CompileError { .. } => "compile_error",
            Self::TestExecutionError { .. } => "test_execution_error",
            Self::MissingArtifact { .. } => "missing_artifact",
            Self::ReversalConflict { .. } => "reversal_conflict",
            Self::AmbiguousReplacement { .. } => "ambiguous_replacement",
            Self::Timeout { .. } => "timeout",
            Self::OutputOverflow { .. } => "output_overflow",
            Self::NoSuchLog { .. } => "no_such_log",
            Self::InvalidLineRange(_) => "invalid_line_range",
            Self::InvalidCandidate { .. } => "invalid_candidate",
            Self::CoverageReport { .. } => "coverage_report",
            Self::Config(_) => "config",
            Self::Io { .. } => "io",
            Self::Json { .. } => "json",
            Self::Toml(_) => "toml",
        }
    }

    /// Raw diagnostic text for trial records (captured output where there is one)
    pub fn diagnostic(&self) -> String {
        match self {
            Self::CompileError { output } => output.clone(),
            Self::TestExecutionError { output, .. } => output.clone(),
            other => other.to_string(),
        }
    }
}
