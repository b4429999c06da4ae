//! # dyneval - dynamic evaluation of generated logging code
//!
//! Installs machine-generated function bodies into a Java checkout one at a
//! time, builds and tests them with the project's own build, attributes
//! covered logging statements to known functions, and always puts the
//! original source back.
//!
//! ## Architecture
//!
//! - **CandidateSelector**: narrows a project's test classes to a bounded set
//! - **PatchEngine**: reversible literal patching backed by a durable replace log
//! - **BuildTool / MavenRunner**: compile and per-class test runs with bounded output and time
//! - **CoverageMapper**: JaCoCo line coverage to catalog functions
//! - **TrialOrchestrator**: patch, build, test, reverse, record, one candidate at a time
//! - **BatchRunner**: named test-list modes without patching
//!
//! ## Example
//!
//! ```no_run
//! use dyneval::{EvalConfig, MavenRunner, TrialOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EvalConfig::default();
//!     let build = MavenRunner::new(config.build.clone());
//!     let orchestrator = TrialOrchestrator::new(config, "unilog", build)?;
//!
//!     let summary = orchestrator.run().await?;
//!     println!("{} candidates compiled", summary.compiled);
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod catalog;
pub mod config;
pub mod coverage;
pub mod error;
pub mod orchestrator;
pub mod patch;
pub mod process;
pub mod runner;
pub mod selector;
pub mod store;
pub mod types;

pub use batch::{BatchRunner, BatchSummary};
pub use catalog::Catalog;
pub use config::{EvalConfig, PathMapping};
pub use coverage::{CoverageMapper, CoverageReport};
pub use error::{EvalError, Result};
pub use orchestrator::{EvalLayout, TrialOrchestrator};
pub use patch::{PatchEngine, ReverseOutcome};
pub use process::ProcessRunner;
pub use runner::{BuildTool, ErrorClassifier, MavenRunner};
pub use selector::{CandidateSelector, SelectionOutcome};
pub use types::*;
