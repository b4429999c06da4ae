//! Full-evaluation mode: one trial per candidate, strictly in sequence.
//!
//! Each candidate is patched into the shared checkout, built, tested per
//! declared unit, and reversed before the next one starts. Outcomes are
//! written back into the candidate list, which is persisted after every
//! candidate together with an append-only trial log.

use std::fs;
use std::path::{Path, PathBuf};

use crate::catalog::Catalog;
use crate::config::{EvalConfig, PathMapping};
use crate::coverage::CoverageMapper;
use crate::error::{EvalError, Result};
use crate::patch::{PatchEngine, Recovery, ReverseOutcome};
use crate::runner::{error_excerpt, BuildTool, ErrorClassifier};
use crate::store::{self, TrialLog};
use crate::types::{Candidate, RunSummary, TrialResult, TrialState, UnitTest};

/// `hadoop-tools_hadoop-aws.json` -> `hadoop-tools/hadoop-aws`
pub fn module_group_dir(top: &str) -> String {
    let top = top.strip_suffix(".json").unwrap_or(top);
    top.replace('_', "/")
}

/// Per-tool directory tree under the data root
#[derive(Debug, Clone)]
pub struct EvalLayout {
    root: PathBuf,
    tool: String,
}

impl EvalLayout {
    pub fn new(data_root: &Path, tool: &str) -> Self {
        Self {
            root: data_root.join(tool),
            tool: tool.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn candidates(&self) -> PathBuf {
        self.root.join("test").join(format!("{}.json", self.tool))
    }

    pub fn replace_logs(&self) -> PathBuf {
        self.root.join("replaceLogs")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    pub fn error_dir(&self) -> PathBuf {
        self.root.join("error")
    }

    pub fn coverage_dir(&self) -> PathBuf {
        self.root.join("coverage")
    }

    pub fn results(&self) -> PathBuf {
        self.root.join("result").join(format!("{}.json", self.tool))
    }

    pub fn trial_log(&self) -> PathBuf {
        self.root.join("result").join("trials.jsonl")
    }

    pub fn error_functions(&self) -> PathBuf {
        self.root.join("result").join("error_functions.json")
    }

    /// Catalog functions implicated by compile errors, most errors first
    pub fn error_ranking(&self) -> PathBuf {
        self.root.join("result").join("error_ranking.json")
    }

    pub fn create_dirs(&self) -> Result<()> {
        for dir in [
            self.replace_logs(),
            self.output_dir(),
            self.error_dir(),
            self.coverage_dir(),
            self.root.join("result"),
        ] {
            fs::create_dir_all(&dir)
                .map_err(|e| EvalError::io(format!("creating {}", dir.display()), e))?;
        }
        Ok(())
    }
}

/// Life-cycle tracker for one candidate
struct Trial<'a> {
    id: &'a str,
    state: TrialState,
}

impl<'a> Trial<'a> {
    fn new(id: &'a str) -> Self {
        Self {
            id,
            state: TrialState::Pending,
        }
    }

    fn advance(&mut self, next: TrialState) {
        if !self.state.can_advance(next) {
            log::error!("{}: unexpected transition {} -> {}", self.id, self.state, next);
        }
        log::debug!("{}: {} -> {}", self.id, self.state, next);
        self.state = next;
    }
}

/// Mutable state threaded through a run
struct RunContext {
    catalog: Catalog,
    trials: TrialLog,
    summary: RunSummary,
}

pub struct TrialOrchestrator<B: BuildTool> {
    config: EvalConfig,
    layout: EvalLayout,
    build: B,
    patch: PatchEngine,
    classifier: ErrorClassifier,
    mapper: CoverageMapper,
    mapping: PathMapping,
}

/// Tagged lines from every output file in `reports`, or `None` when the
/// test wrote no output files
fn collect_tagged_lines(reports: &Path, suffix: &str, tag: &str) -> Result<Option<Vec<String>>> {
    let listing = fs::read_dir(reports)
        .map_err(|e| EvalError::io(format!("listing {}", reports.display()), e))?;
    let mut files: Vec<PathBuf> = listing
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().ends_with(suffix))
                .unwrap_or(false)
        })
        .collect();
    if files.is_empty() {
        return Ok(None);
    }
    files.sort();

    let mut tagged = Vec::new();
    for file in files {
        let bytes = fs::read(&file).map_err(|e| EvalError::io(format!("reading {}", file.display()), e))?;
        let content = String::from_utf8_lossy(&bytes);
        tagged.extend(content.split('\n').filter(|l| l.contains(tag)).map(str::to_string));
    }
    Ok(Some(tagged))
}

impl<B: BuildTool> TrialOrchestrator<B> {
    pub fn new(config: EvalConfig, tool: &str, build: B) -> Result<Self> {
        let layout = EvalLayout::new(&config.paths.data_root, tool);
        layout.create_dirs()?;
        let patch = PatchEngine::new(layout.replace_logs())?;
        let classifier = ErrorClassifier::new(config.build.compile_error_marker.clone())?;
        let mapper = CoverageMapper::new(&config.coverage);
        let mapping = config.path_mapping();
        Ok(Self {
            config,
            layout,
            build,
            patch,
            classifier,
            mapper,
            mapping,
        })
    }

    pub fn layout(&self) -> &EvalLayout {
        &self.layout
    }

    /// Put back any patch left applied by an interrupted run
    pub fn recover(&self) -> Result<Recovery> {
        let recovery = self.patch.recover()?;
        if !recovery.reversed.is_empty() {
            log::warn!(
                "Recovered {} interrupted patch(es): {}",
                recovery.reversed.len(),
                recovery.reversed.join(", ")
            );
        }
        Ok(recovery)
    }

    /// Catalog and candidate list, read concurrently; either failing is fatal
    pub async fn load_inputs(&self) -> Result<(Catalog, Vec<Candidate>)> {
        let catalog_path = self.config.paths.catalog.clone();
        let candidates_path = self.layout.candidates();
        let (descriptors, candidates) = tokio::try_join!(
            store::read_json_async(&catalog_path),
            store::read_json_async::<Vec<Candidate>>(&candidates_path),
        )?;
        let catalog = Catalog::new(descriptors);
        log::info!(
            "Loaded {} function descriptors and {} candidates",
            catalog.len(),
            candidates.len()
        );
        Ok((catalog, candidates))
    }

    /// Carry recorded outcomes from a previous run's result file
    fn merge_previous(&self, candidates: &mut [Candidate]) -> Result<usize> {
        let path = self.layout.results();
        if !self.config.resume || !path.exists() {
            return Ok(0);
        }
        let previous: Vec<Candidate> = store::read_json(&path)?;
        let mut merged = 0;
        for candidate in candidates.iter_mut() {
            if let Some(done) = previous
                .iter()
                .find(|p| p.uuid == candidate.uuid && p.is_recorded())
            {
                *candidate = done.clone();
                merged += 1;
            }
        }
        log::info!("Resuming: {} candidates already recorded", merged);
        Ok(merged)
    }

    fn project_dir(&self, top: &str, project: &str) -> PathBuf {
        self.config
            .paths
            .source_root
            .join(module_group_dir(top))
            .join(project)
    }

    /// Process every candidate end to end
    pub async fn run(&self) -> Result<RunSummary> {
        let recovery = self.recover()?;
        let (catalog, mut candidates) = self.load_inputs().await?;
        self.merge_previous(&mut candidates)?;

        let mut ctx = RunContext {
            catalog,
            trials: TrialLog::open(&self.layout.trial_log())?,
            summary: RunSummary {
                total: candidates.len(),
                recovered: recovery.reversed,
                restore_mismatches: recovery.mismatched,
                ..RunSummary::default()
            },
        };

        let total = candidates.len();
        log::info!("Total number of candidates: {}", total);
        for i in 0..total {
            if candidates[i].is_recorded() {
                ctx.summary.skipped += 1;
                continue;
            }
            log::info!("[eval] candidate {}/{}: {}", i + 1, total, candidates[i].uuid);
            self.run_trial(&mut candidates[i], &mut ctx).await?;
            ctx.summary.processed += 1;
            store::write_json_atomic(&self.layout.results(), &candidates)?;
        }

        store::write_json_atomic(&self.layout.error_functions(), &ctx.summary.error_functions)?;
        store::write_json_atomic(&self.layout.error_ranking(), &ctx.catalog.ranked_errors())?;
        log::info!(
            "Run complete: {} processed, {} skipped, {} compiled, {} compile failures, {} patch failures, {} trial errors, units {} passed / {} failed",
            ctx.summary.processed,
            ctx.summary.skipped,
            ctx.summary.compiled,
            ctx.summary.compile_failed,
            ctx.summary.patch_failed,
            ctx.summary.trial_errors,
            ctx.summary.units_passed,
            ctx.summary.units_failed
        );
        Ok(ctx.summary)
    }

    /// One candidate through patch, build, tests and reversal. Only a failed
    /// reversal is returned as an error: the checkout can no longer be trusted.
    async fn run_trial(&self, candidate: &mut Candidate, ctx: &mut RunContext) -> Result<()> {
        let id = candidate.uuid.clone();
        let mut trial = Trial::new(&id);

        let Some(first_project) = candidate.uuid_map.projects.first().map(|p| p.name.clone()) else {
            let err = EvalError::InvalidCandidate {
                id: id.clone(),
                reason: "no projects in uuidMap".to_string(),
            };
            return self.record_unpatched(candidate, &mut trial, ctx, "", err);
        };

        let file = self.mapping.to_local(&candidate.function_position);
        if let Err(err) = self.patch.apply(candidate, &file) {
            return self.record_unpatched(candidate, &mut trial, ctx, &first_project, err);
        }
        trial.advance(TrialState::Patched);

        if let Err(err) = self.run_patched(candidate, &first_project, &mut trial, ctx).await {
            log::error!("Trial {} failed while patched: {}", id, err);
            candidate.successful = Some(false);
            ctx.summary.trial_errors += 1;
            let result = TrialResult::failed(&first_project, "", "trial", format!("{}: {}", err.kind(), err));
            if let Err(e) = ctx.trials.append(&result.for_candidate(&id)) {
                log::error!("Recording trial failure for {} failed: {}", id, e);
            }
        }

        if let ReverseOutcome::Restored { verified: false } = self.patch.reverse(&id)? {
            ctx.summary.restore_mismatches.push(id.clone());
        }
        trial.advance(TrialState::Reversed);
        trial.advance(TrialState::Recorded);
        Ok(())
    }

    /// Compile and test with the patch in place. Errors here never skip reversal.
    async fn run_patched(
        &self,
        candidate: &mut Candidate,
        first_project: &str,
        trial: &mut Trial<'_>,
        ctx: &mut RunContext,
    ) -> Result<()> {
        let id = candidate.uuid.clone();
        let top = candidate.uuid_map.top.clone();
        let compile_dir = self.project_dir(&top, first_project);
        log::info!("Compile project {}", compile_dir.display());

        match self.build.compile(&compile_dir).await {
            Ok(()) => {
                trial.advance(TrialState::Compiled);
                log::info!("Compile done: {}", top);
                candidate.successful = Some(true);
                ctx.summary.compiled += 1;

                for project in candidate.uuid_map.projects.iter_mut() {
                    let project_dir = self.project_dir(&top, &project.name);
                    for unit in project.unit_tests.iter_mut() {
                        let result = self.run_unit(&project.name, &project_dir, unit, &ctx.catalog).await;
                        trial.advance(TrialState::Tested);
                        ctx.summary.record_unit(unit.successful == Some(true));
                        ctx.trials.append(&result.for_candidate(&id))?;
                    }
                }
            }
            Err(err) => {
                trial.advance(TrialState::CompileFailed);
                log::error!("[COMPILE FAIL] {} candidate {}: {}", top, id, err);
                candidate.successful = Some(false);
                ctx.summary.compile_failed += 1;
                self.record_compile_failure(&id, &err, ctx)?;
                let result = TrialResult::failed(
                    first_project,
                    "",
                    self.compile_command(),
                    format!("{}: {}", err.kind(), err.diagnostic()),
                );
                ctx.trials.append(&result.for_candidate(&id))?;
            }
        }
        Ok(())
    }

    fn compile_command(&self) -> String {
        std::iter::once(self.config.build.program.as_str())
            .chain(self.config.build.compile_args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Candidate rejected before its patch landed
    fn record_unpatched(
        &self,
        candidate: &mut Candidate,
        trial: &mut Trial<'_>,
        ctx: &mut RunContext,
        project: &str,
        err: EvalError,
    ) -> Result<()> {
        log::error!("Patch failed for {}: {}", candidate.uuid, err);
        candidate.successful = Some(false);
        ctx.summary.patch_failed += 1;
        let result = TrialResult::failed(project, "", "patch", format!("{}: {}", err.kind(), err));
        ctx.trials.append(&result.for_candidate(&candidate.uuid))?;
        trial.advance(TrialState::Recorded);
        Ok(())
    }

    /// Excerpt, optional full log, and attribution for a failed build
    fn record_compile_failure(&self, id: &str, err: &EvalError, ctx: &mut RunContext) -> Result<()> {
        let excerpt_path = self.layout.error_dir().join(format!("{}.txt", id));
        let EvalError::CompileError { output } = err else {
            return store::write_atomic(&excerpt_path, err.to_string().as_bytes());
        };

        let excerpt = error_excerpt(
            output,
            &self.config.build.compile_error_marker,
            self.config.build.error_excerpt_lines,
        );
        store::write_atomic(&excerpt_path, excerpt.as_bytes())?;
        if self.config.build.record_full_output {
            let full = self.layout.error_dir().join(format!("{}.log", id));
            store::write_atomic(&full, output.as_bytes())?;
        }

        let attributed = self
            .classifier
            .attribute(output, &mut ctx.catalog, &self.mapping, Some(id));
        ctx.summary.error_functions.extend(attributed);
        Ok(())
    }

    /// Run one declared test class and fill in its outcome
    async fn run_unit(
        &self,
        project: &str,
        project_dir: &Path,
        unit: &mut UnitTest,
        catalog: &Catalog,
    ) -> TrialResult {
        let class = unit.name.clone();
        let command = self.build.test_command(&class);
        log::info!("Process class {} in {} ({})", class, project, unit.uuid);

        let elapsed = match self.build.test(&class, project_dir).await {
            Ok(elapsed) => elapsed,
            Err(err) => {
                log::error!("Test {} failed: {}", class, err);
                unit.successful = Some(false);
                unit.error = Some(err.kind().to_string());
                return TrialResult::failed(project, &class, command, err.diagnostic());
            }
        };

        let reports = project_dir.join(&self.config.artifacts.reports_dir);
        if !reports.is_dir() {
            let err = EvalError::MissingArtifact { path: reports };
            log::warn!("No logs file for {}: {}", class, err);
            unit.successful = Some(false);
            unit.error = Some(err.kind().to_string());
            return TrialResult::failed(project, &class, command, "No logs file");
        }

        let stem = format!("{}_{}_{}", project, class, unit.uuid);
        let artifacts = &self.config.artifacts;
        let outcome = collect_tagged_lines(&reports, &artifacts.output_suffix, &artifacts.output_tag)
            .and_then(|tagged| match tagged {
                None => Ok((String::new(), 0)),
                Some(lines) => {
                    let path = self.layout.output_dir().join(format!("{}.txt", stem));
                    let body = lines.join("\n");
                    store::write_atomic(&path, body.as_bytes())?;
                    Ok((path.display().to_string(), body.len() as u64))
                }
            });
        let (output_path, size) = match outcome {
            Ok(written) => written,
            Err(err) => {
                log::error!("Collecting output for {} failed: {}", class, err);
                unit.successful = Some(false);
                unit.error = Some(err.kind().to_string());
                return TrialResult::failed(project, &class, command, err.to_string());
            }
        };

        unit.successful = Some(true);
        unit.predict_output = Some(output_path);
        unit.test_time = Some(elapsed.as_secs_f64());
        unit.prediction_size = Some(size);

        let report = project_dir.join(&artifacts.coverage_report);
        if report.exists() {
            let base = project_dir.join(&artifacts.main_sources);
            match self.mapper.map(&report, &base, catalog, &self.mapping) {
                Ok(covered) => {
                    let path = self.layout.coverage_dir().join(format!("{}.json", stem));
                    if let Err(err) = CoverageMapper::write_covered(&path, &covered) {
                        log::warn!("Writing {} failed: {}", path.display(), err);
                    }
                    unit.covered_functions = Some(covered.len());
                }
                Err(err) => {
                    log::warn!("Coverage for {} unusable: {}", class, err);
                    unit.error = Some(err.kind().to_string());
                }
            }
        }

        TrialResult::success(project, &class, command, project_dir.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FunctionDescriptor, LineRange, PatchState, ProjectTests, UuidMap};
    use async_trait::async_trait;
    use serde_json::Map;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records calls and snapshots the patched file at compile time
    struct FakeBuild {
        watched: PathBuf,
        fail_compile: bool,
        compile_timeout: bool,
        failing_classes: Vec<String>,
        /// Pass without writing any reports
        silent_classes: Vec<String>,
        timeout_classes: Vec<String>,
        seen_at_compile: Mutex<Vec<String>>,
        tests_run: Mutex<Vec<String>>,
    }

    impl FakeBuild {
        fn new(watched: PathBuf) -> Self {
            Self {
                watched,
                fail_compile: false,
                compile_timeout: false,
                failing_classes: Vec::new(),
                silent_classes: Vec::new(),
                timeout_classes: Vec::new(),
                seen_at_compile: Mutex::new(Vec::new()),
                tests_run: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BuildTool for FakeBuild {
        async fn compile(&self, _project_dir: &Path) -> Result<()> {
            let content = fs::read_to_string(&self.watched).unwrap();
            self.seen_at_compile.lock().unwrap().push(content.clone());
            if self.compile_timeout {
                return Err(EvalError::Timeout {
                    command: "fake compile".to_string(),
                    after: Duration::from_secs(1800),
                });
            }
            if self.fail_compile {
                let file = self.watched.display();
                return Err(EvalError::CompileError {
                    output: format!(
                        "[ERROR] COMPILATION ERROR :\n[ERROR] {}:[2,1] cannot find symbol\n[INFO] BUILD FAILURE\n",
                        file
                    ),
                });
            }
            Ok(())
        }

        async fn test(&self, class: &str, project_dir: &Path) -> Result<Duration> {
            self.tests_run.lock().unwrap().push(class.to_string());
            if self.failing_classes.iter().any(|c| c == class) {
                return Err(EvalError::TestExecutionError {
                    class: class.to_string(),
                    output: "Tests run: 1, Failures: 1".to_string(),
                });
            }
            if self.timeout_classes.iter().any(|c| c == class) {
                return Err(EvalError::Timeout {
                    command: self.test_command(class),
                    after: Duration::from_secs(900),
                });
            }
            if self.silent_classes.iter().any(|c| c == class) {
                return Ok(Duration::from_millis(10));
            }
            let reports = project_dir.join("target/surefire-reports");
            fs::create_dir_all(&reports).unwrap();
            fs::write(
                reports.join(format!("{}-output.txt", class)),
                format!("noise\n[SUPER TAG] {} ran\nmore noise\n", class),
            )
            .unwrap();
            Ok(Duration::from_millis(1500))
        }

        fn test_command(&self, class: &str) -> String {
            format!("fake test {}", class)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        config: EvalConfig,
        source: PathBuf,
        project_dir: PathBuf,
    }

    const ORIGINAL: &str = "a();\nfoo();\nb();\n";

    fn fixture(candidates: &[Candidate]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let source_root = dir.path().join("hadoop");
        let project_dir = source_root.join("hadoop-common-project/hadoop-common");
        let source = project_dir.join("src/main/java/org/a/A.java");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, ORIGINAL).unwrap();

        let data_root = dir.path().join("data");
        let catalog = data_root.join("catalog.json");
        store::write_json_atomic(
            &catalog,
            &vec![FunctionDescriptor::new(
                "foo",
                source.display().to_string(),
                LineRange::new(1, 3).unwrap(),
            )],
        )
        .unwrap();
        store::write_json_atomic(&data_root.join("unilog/test/unilog.json"), candidates).unwrap();

        let mut config = EvalConfig::default();
        config.paths.source_root = source_root;
        config.paths.data_root = data_root;
        config.paths.catalog = catalog;
        Fixture {
            _dir: dir,
            config,
            source,
            project_dir,
        }
    }

    fn candidate(id: &str, source: &Path, classes: &[&str]) -> Candidate {
        Candidate {
            uuid: id.to_string(),
            function_position: source.display().to_string(),
            line_range: LineRange::new(2, 2).unwrap(),
            prediction: "bar();".to_string(),
            uuid_map: UuidMap {
                top: "hadoop-common-project.json".to_string(),
                projects: vec![ProjectTests {
                    name: "hadoop-common".to_string(),
                    unit_tests: classes
                        .iter()
                        .enumerate()
                        .map(|(i, c)| UnitTest {
                            name: c.to_string(),
                            uuid: format!("u{}", i),
                            ..UnitTest::default()
                        })
                        .collect(),
                }],
            },
            successful: None,
            extra: Map::new(),
        }
    }

    /// Candidates must point at the fixture's source file, which only
    /// exists once the fixture is built
    fn setup(ids: &[(&str, &[&str])]) -> Fixture {
        let placeholder = fixture(&[]);
        let candidates: Vec<Candidate> = ids
            .iter()
            .map(|(id, classes)| candidate(id, &placeholder.source, classes))
            .collect();
        store::write_json_atomic(
            &placeholder.config.paths.data_root.join("unilog/test/unilog.json"),
            &candidates,
        )
        .unwrap();
        placeholder
    }

    #[test]
    fn test_module_group_dir() {
        assert_eq!(module_group_dir("hadoop-tools_hadoop-aws.json"), "hadoop-tools/hadoop-aws");
        assert_eq!(module_group_dir("hadoop-common-project"), "hadoop-common-project");
    }

    #[tokio::test]
    async fn test_successful_trial() {
        let fx = setup(&[("c1", &["TestConf"])]);
        let build = FakeBuild::new(fx.source.clone());
        let orchestrator = TrialOrchestrator::new(fx.config.clone(), "unilog", build).unwrap();

        let summary = orchestrator.run().await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.compiled, 1);
        assert_eq!(summary.units_passed, 1);
        assert!(summary.restore_mismatches.is_empty());

        assert_eq!(
            orchestrator.build.seen_at_compile.lock().unwrap()[0],
            "a();\nbar();\nb();\n"
        );
        assert_eq!(fs::read_to_string(&fx.source).unwrap(), ORIGINAL);

        let results: Vec<Candidate> = store::read_json(&orchestrator.layout().results()).unwrap();
        assert_eq!(results[0].successful, Some(true));
        let unit = &results[0].uuid_map.projects[0].unit_tests[0];
        assert_eq!(unit.successful, Some(true));
        assert_eq!(unit.test_time, Some(1.5));
        assert_eq!(unit.prediction_size, Some("[SUPER TAG] TestConf ran".len() as u64));

        let output = orchestrator
            .layout()
            .output_dir()
            .join("hadoop-common_TestConf_u0.txt");
        assert_eq!(fs::read_to_string(output).unwrap(), "[SUPER TAG] TestConf ran");

        let trials = TrialLog::read_all(&orchestrator.layout().trial_log()).unwrap();
        assert_eq!(trials.len(), 1);
        assert_eq!(trials[0].candidate.as_deref(), Some("c1"));
        assert_eq!(trials[0].mvn_test_dir.as_deref(), Some(fx.project_dir.as_path()));
    }

    #[tokio::test]
    async fn test_failing_unit_does_not_stop_others() {
        let fx = setup(&[("c1", &["TestBroken", "TestConf"])]);
        let mut build = FakeBuild::new(fx.source.clone());
        build.failing_classes = vec!["TestBroken".to_string()];
        let orchestrator = TrialOrchestrator::new(fx.config.clone(), "unilog", build).unwrap();

        let summary = orchestrator.run().await.unwrap();
        assert_eq!(summary.units_failed, 1);
        assert_eq!(summary.units_passed, 1);
        assert_eq!(
            *orchestrator.build.tests_run.lock().unwrap(),
            vec!["TestBroken".to_string(), "TestConf".to_string()]
        );

        let results: Vec<Candidate> = store::read_json(&orchestrator.layout().results()).unwrap();
        let units = &results[0].uuid_map.projects[0].unit_tests;
        assert_eq!(units[0].successful, Some(false));
        assert_eq!(units[0].error.as_deref(), Some("test_execution_error"));
        assert_eq!(units[1].successful, Some(true));
        assert_eq!(fs::read_to_string(&fx.source).unwrap(), ORIGINAL);
    }

    #[tokio::test]
    async fn test_compile_failure_is_attributed_and_reversed() {
        let fx = setup(&[("c1", &["TestConf"]), ("c2", &["TestConf"])]);
        let mut build = FakeBuild::new(fx.source.clone());
        build.fail_compile = true;
        let orchestrator = TrialOrchestrator::new(fx.config.clone(), "unilog", build).unwrap();

        let summary = orchestrator.run().await.unwrap();
        assert_eq!(summary.compile_failed, 2);
        assert_eq!(summary.error_functions.len(), 2);
        assert_eq!(summary.error_functions[0].function_name, "foo");
        assert!(orchestrator.build.tests_run.lock().unwrap().is_empty());
        assert_eq!(fs::read_to_string(&fx.source).unwrap(), ORIGINAL);

        let excerpt = fs::read_to_string(orchestrator.layout().error_dir().join("c1.txt")).unwrap();
        assert!(excerpt.starts_with("[ERROR] COMPILATION ERROR :"));

        let results: Vec<Candidate> = store::read_json(&orchestrator.layout().results()).unwrap();
        assert!(results.iter().all(|c| c.successful == Some(false)));
        assert!(orchestrator.layout().error_functions().exists());

        let ranking: Vec<FunctionDescriptor> =
            store::read_json(&orchestrator.layout().error_ranking()).unwrap();
        assert_eq!(ranking.len(), 1);
        assert_eq!(ranking[0].error_count(), 2);
    }

    #[tokio::test]
    async fn test_artifact_write_failure_still_reverses() {
        let fx = setup(&[("c1", &["TestConf"]), ("c2", &["TestConf"])]);
        let mut build = FakeBuild::new(fx.source.clone());
        build.fail_compile = true;
        let orchestrator = TrialOrchestrator::new(fx.config.clone(), "unilog", build).unwrap();

        // a directory where c1's excerpt should go makes the write fail
        fs::create_dir_all(orchestrator.layout().error_dir().join("c1.txt")).unwrap();

        let summary = orchestrator.run().await.unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.trial_errors, 1);
        assert_eq!(summary.compile_failed, 2);
        assert_eq!(orchestrator.build.seen_at_compile.lock().unwrap().len(), 2);
        assert_eq!(fs::read_to_string(&fx.source).unwrap(), ORIGINAL);
        assert_eq!(orchestrator.patch.state("c1").unwrap(), Some(PatchState::Reversed));

        let results: Vec<Candidate> = store::read_json(&orchestrator.layout().results()).unwrap();
        assert_eq!(results[0].successful, Some(false));

        let trials = TrialLog::read_all(&orchestrator.layout().trial_log()).unwrap();
        let c1: Vec<_> = trials
            .iter()
            .filter(|t| t.candidate.as_deref() == Some("c1"))
            .collect();
        assert_eq!(c1.len(), 1);
        assert!(c1[0].error.as_deref().unwrap().starts_with("io: "));
        assert!(orchestrator.layout().error_dir().join("c2.txt").is_file());
    }

    #[tokio::test]
    async fn test_missing_reports_fails_only_that_unit() {
        let fx = setup(&[("c1", &["TestSilent", "TestConf"])]);
        let mut build = FakeBuild::new(fx.source.clone());
        build.silent_classes = vec!["TestSilent".to_string()];
        let orchestrator = TrialOrchestrator::new(fx.config.clone(), "unilog", build).unwrap();

        let summary = orchestrator.run().await.unwrap();
        assert_eq!(summary.units_failed, 1);
        assert_eq!(summary.units_passed, 1);
        assert_eq!(
            *orchestrator.build.tests_run.lock().unwrap(),
            vec!["TestSilent".to_string(), "TestConf".to_string()]
        );

        let results: Vec<Candidate> = store::read_json(&orchestrator.layout().results()).unwrap();
        assert_eq!(results[0].successful, Some(true));
        let units = &results[0].uuid_map.projects[0].unit_tests;
        assert_eq!(units[0].successful, Some(false));
        assert_eq!(units[0].error.as_deref(), Some("missing_artifact"));
        assert_eq!(units[1].successful, Some(true));

        let trials = TrialLog::read_all(&orchestrator.layout().trial_log()).unwrap();
        assert_eq!(trials[0].error.as_deref(), Some("No logs file"));
        assert_eq!(fs::read_to_string(&fx.source).unwrap(), ORIGINAL);
    }

    #[tokio::test]
    async fn test_timeouts_are_recorded_and_reversed() {
        let fx = setup(&[("c1", &["TestSlow", "TestConf"])]);
        let mut build = FakeBuild::new(fx.source.clone());
        build.timeout_classes = vec!["TestSlow".to_string()];
        let orchestrator = TrialOrchestrator::new(fx.config.clone(), "unilog", build).unwrap();

        let summary = orchestrator.run().await.unwrap();
        assert_eq!(summary.units_failed, 1);
        assert_eq!(summary.units_passed, 1);
        let results: Vec<Candidate> = store::read_json(&orchestrator.layout().results()).unwrap();
        let units = &results[0].uuid_map.projects[0].unit_tests;
        assert_eq!(units[0].error.as_deref(), Some("timeout"));
        assert_eq!(fs::read_to_string(&fx.source).unwrap(), ORIGINAL);

        let fx = setup(&[("c1", &["TestConf"])]);
        let mut build = FakeBuild::new(fx.source.clone());
        build.compile_timeout = true;
        let orchestrator = TrialOrchestrator::new(fx.config.clone(), "unilog", build).unwrap();

        let summary = orchestrator.run().await.unwrap();
        assert_eq!(summary.compile_failed, 1);
        assert!(orchestrator.build.tests_run.lock().unwrap().is_empty());
        assert_eq!(fs::read_to_string(&fx.source).unwrap(), ORIGINAL);

        let trials = TrialLog::read_all(&orchestrator.layout().trial_log()).unwrap();
        assert!(trials[0].error.as_deref().unwrap().starts_with("timeout: "));
        let excerpt = fs::read_to_string(orchestrator.layout().error_dir().join("c1.txt")).unwrap();
        assert!(excerpt.contains("timed out after 1800s"));
    }

    #[tokio::test]
    async fn test_resume_and_recovery() {
        let fx = setup(&[("c1", &["TestConf"]), ("c2", &["TestConf"])]);

        // an interrupted trial left c2 applied
        let layout = EvalLayout::new(&fx.config.paths.data_root, "unilog");
        let engine = PatchEngine::new(layout.replace_logs()).unwrap();
        engine
            .apply(&candidate("c2", &fx.source, &["TestConf"]), &fx.source)
            .unwrap();

        // and c1 was already recorded
        let mut done = candidate("c1", &fx.source, &["TestConf"]);
        done.successful = Some(true);
        store::write_json_atomic(&layout.results(), &vec![done]).unwrap();

        let build = FakeBuild::new(fx.source.clone());
        let orchestrator = TrialOrchestrator::new(fx.config.clone(), "unilog", build).unwrap();
        let summary = orchestrator.run().await.unwrap();

        assert_eq!(summary.recovered, vec!["c2".to_string()]);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.processed, 1);
        assert_eq!(
            orchestrator.build.seen_at_compile.lock().unwrap().len(),
            1,
            "only the re-queued candidate is built"
        );
        assert_eq!(fs::read_to_string(&fx.source).unwrap(), ORIGINAL);
    }

    #[tokio::test]
    async fn test_patch_failure_is_recorded() {
        let fx = setup(&[("c1", &["TestConf"])]);
        let mut candidates: Vec<Candidate> = store::read_json(
            &fx.config.paths.data_root.join("unilog/test/unilog.json"),
        )
        .unwrap();
        candidates[0].line_range = LineRange::new(7, 9).unwrap();
        store::write_json_atomic(&fx.config.paths.data_root.join("unilog/test/unilog.json"), &candidates)
            .unwrap();

        let build = FakeBuild::new(fx.source.clone());
        let orchestrator = TrialOrchestrator::new(fx.config.clone(), "unilog", build).unwrap();
        let summary = orchestrator.run().await.unwrap();

        assert_eq!(summary.patch_failed, 1);
        assert!(orchestrator.build.seen_at_compile.lock().unwrap().is_empty());
        let trials = TrialLog::read_all(&orchestrator.layout().trial_log()).unwrap();
        assert!(trials[0].error.as_deref().unwrap().starts_with("invalid_line_range"));
    }

    #[tokio::test]
    async fn test_missing_candidate_list_is_fatal() {
        let fx = fixture(&[]);
        fs::remove_file(fx.config.paths.data_root.join("unilog/test/unilog.json")).unwrap();
        let orchestrator =
            TrialOrchestrator::new(fx.config.clone(), "unilog", FakeBuild::new(fx.source.clone())).unwrap();
        assert!(matches!(orchestrator.run().await, Err(EvalError::Io { .. })));
    }
}
