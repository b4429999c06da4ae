//! dyneval CLI
//!
//! `batch` runs a named test-selection mode, `evaluate` runs every candidate
//! of one tool end to end, `recover` only puts back interrupted patches.
//! `select` and `coverage` expose the selector and the coverage mapper on
//! their own for inspecting a checkout.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use dyneval::{
    BatchRunner, CandidateSelector, Catalog, CoverageMapper, EvalConfig, EvalLayout, MavenRunner,
    PatchEngine, TrialOrchestrator,
};

#[derive(Parser)]
#[command(name = "dyneval")]
#[command(about = "Dynamic evaluation of generated logging code", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a named test-selection mode (e.g. newTest, tagTest2, sameOutputTest)
    Batch {
        mode: String,
    },

    /// Patch, build and test every candidate of a tool
    ///
    /// Reads `<save_dir>/<tool>/test/<tool>.json` and writes result/, output/,
    /// error/ and coverage/ next to it.
    Evaluate {
        /// Data root holding per-tool directories
        save_dir: PathBuf,
        /// Tool or model identifier
        tool: String,
    },

    /// Reverse patches left applied by an interrupted run
    Recover {
        save_dir: PathBuf,
        tool: String,
    },

    /// Print the test classes the selector would run
    Select {
        /// Test source directory
        dir: PathBuf,

        /// Starting content-length threshold
        #[arg(long)]
        threshold: Option<usize>,

        /// Maximum number of classes
        #[arg(long)]
        cap: Option<usize>,
    },

    /// Print covered-function entries for a JaCoCo report
    Coverage {
        /// jacoco.xml
        report: PathBuf,
        /// Main source root the report's packages are relative to
        base_dir: PathBuf,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<EvalConfig> {
    match path {
        Some(path) => {
            log::info!("Loading config from: {}", path.display());
            EvalConfig::load(path).with_context(|| format!("loading {}", path.display()))
        }
        None => Ok(EvalConfig::default()),
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    // RUST_LOG still wins over the default level
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Batch { mode } => {
            let build = MavenRunner::for_batch(config.build.clone());
            let runner = BatchRunner::new(config, &mode, build)?;
            let summary = runner.run().await.context("batch run failed")?;
            println!(
                "{} classes: {} succeeded, {} failed",
                summary.classes, summary.succeeded, summary.failed
            );
        }

        Commands::Evaluate { save_dir, tool } => {
            config.paths.data_root = save_dir;
            let build = MavenRunner::new(config.build.clone());
            let orchestrator = TrialOrchestrator::new(config, &tool, build)?;
            let summary = orchestrator
                .run()
                .await
                .with_context(|| format!("evaluating {}", tool))?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        Commands::Recover { save_dir, tool } => {
            let layout = EvalLayout::new(&save_dir, &tool);
            let engine = PatchEngine::new(layout.replace_logs())?;
            let recovery = engine.recover()?;
            println!("Reversed {} patch(es)", recovery.reversed.len());
            for id in &recovery.mismatched {
                println!("restored content differs from original: {}", id);
            }
        }

        Commands::Select { dir, threshold, cap } => {
            if let Some(cap) = cap {
                config.selector.max_classes = cap;
            }
            let selector = CandidateSelector::new(config.selector.clone());
            let outcome = selector.select_from(&dir, threshold.unwrap_or(config.selector.initial_threshold));
            println!("threshold: {}", outcome.threshold);
            for class in outcome.classes {
                println!("{}", class);
            }
        }

        Commands::Coverage { report, base_dir } => {
            let catalog = Catalog::load(&config.paths.catalog)?;
            let mapper = CoverageMapper::new(&config.coverage);
            let covered = mapper.map(&report, &base_dir, &catalog, &config.path_mapping())?;
            println!("{}", serde_json::to_string_pretty(&covered)?);
        }
    }

    Ok(())
}
