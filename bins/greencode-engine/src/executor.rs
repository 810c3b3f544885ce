/// Submission Executor - High-Level Orchestration
///
/// **Responsibility:**
/// Drive one submission through its stages and always produce a verdict.
///
/// **Stages:**
/// `Created → Preparing → Running → Gathering → Reporting → CleanedUp`
/// Any stage may fail; the failure carries the stage it happened in.
///
/// **Architecture:**
/// 1. Preparer populates a sandbox directory (prepare.rs)
/// 2. Scheduler grants a CPU and the backend runs the sandbox (scheduler.rs, engine.rs)
/// 3. Gatherer grades the artifacts (gather.rs)
/// 4. Verdict goes to the result sink (upstream.rs)
/// 5. Sandbox directory is removed on every path
///
/// This module is the glue layer. It is the single place where failures are
/// logged and mapped to a reason code.

use crate::config::LanguageRegistry;
use crate::context::{RunContext, SandboxDir};
use crate::engine::ContainerBackend;
use crate::error::{EngineError, Result};
use crate::gather;
use crate::prepare::Preparer;
use crate::scheduler::Scheduler;
use crate::upstream::ResultSink;
use futures_util::FutureExt;
use greencode_common::types::{ErrorReason, RunMetrics, SubmissionRequest, SubmissionResult};
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Created,
    Preparing,
    Running,
    Gathering,
    Reporting,
    CleanedUp,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Created => "created",
            Stage::Preparing => "preparing",
            Stage::Running => "running",
            Stage::Gathering => "gathering",
            Stage::Reporting => "reporting",
            Stage::CleanedUp => "cleaned_up",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct StageFailure {
    stage: Stage,
    error: EngineError,
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> std::result::Result<T, StageFailure>;
}

impl<T> AtStage<T> for Result<T> {
    fn at(self, stage: Stage) -> std::result::Result<T, StageFailure> {
        self.map_err(|error| StageFailure { stage, error })
    }
}

/// State that must survive a panic inside the pipeline
struct Progress {
    stage: Stage,
    sandbox: Option<SandboxDir>,
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}

#[derive(Clone)]
pub struct Executor {
    registry: Arc<LanguageRegistry>,
    preparer: Arc<Preparer>,
    scheduler: Scheduler,
    backend: Arc<dyn ContainerBackend>,
    sink: Arc<dyn ResultSink>,
}

impl Executor {
    pub fn new(
        registry: Arc<LanguageRegistry>,
        preparer: Arc<Preparer>,
        scheduler: Scheduler,
        backend: Arc<dyn ContainerBackend>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            registry,
            preparer,
            scheduler,
            backend,
            sink,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Execute one submission end to end and return the verdict that was
    /// reported. Never fails: every problem becomes a failure verdict.
    #[instrument(
        skip(self, submission),
        fields(
            submission_id = %submission.submission_uuid,
            problem_id = submission.problem_id,
            language = %submission.language
        )
    )]
    pub async fn entry(&self, submission: SubmissionRequest) -> SubmissionResult {
        let submission_id = submission.submission_uuid;
        info!(code_bytes = submission.code.len(), "Submission received");

        let profile = match self.registry.resolve(submission.language) {
            Ok(profile) => profile,
            Err(e) => {
                error!(
                    submission_id = %submission_id,
                    stage = %Stage::Created,
                    cause = %e,
                    "Submission failed"
                );
                let verdict = SubmissionResult::failure(submission_id, e.reason(), None);
                self.report(&verdict).await;
                return verdict;
            }
        };

        let mut ctx = RunContext::new(Arc::new(submission), profile);
        let mut progress = Progress {
            stage: Stage::Created,
            sandbox: None,
        };

        let outcome = AssertUnwindSafe(self.execute(&mut ctx, &mut progress))
            .catch_unwind()
            .await;

        let verdict = match outcome {
            Ok(Ok(metrics)) => {
                info!(
                    runtime_ms = metrics.runtime_ms,
                    mem_usage_mb = metrics.mem_usage_mb,
                    energy_usage_kwh = metrics.energy_usage_kwh,
                    "Submission passed"
                );
                SubmissionResult::success(submission_id, metrics)
            }
            Ok(Err(StageFailure { stage, error })) => {
                if error.is_submission_fault() {
                    info!(
                        submission_id = %submission_id,
                        stage = %stage,
                        reason = %error.reason(),
                        cause = %error,
                        "Submission failed"
                    );
                } else {
                    error!(
                        submission_id = %submission_id,
                        stage = %stage,
                        reason = %error.reason(),
                        cause = %error,
                        "Submission failed"
                    );
                }
                SubmissionResult::failure(submission_id, error.reason(), error.user_message())
            }
            Err(panic) => {
                error!(
                    submission_id = %submission_id,
                    stage = %progress.stage,
                    cause = panic_message(panic.as_ref()),
                    "Submission pipeline panicked"
                );
                SubmissionResult::failure(submission_id, ErrorReason::InternalError, None)
            }
        };

        self.report(&verdict).await;

        if let Some(sandbox) = progress.sandbox.take() {
            let path = sandbox.path().to_path_buf();
            if let Err(e) = sandbox.remove().await {
                warn!(
                    submission_id = %submission_id,
                    stage = %Stage::CleanedUp,
                    dir = %path.display(),
                    cause = %e,
                    "Failed to remove sandbox directory"
                );
            }
        }
        debug!(stage = %Stage::CleanedUp, successful = verdict.successful(), "Submission done");

        verdict
    }

    async fn execute(
        &self,
        ctx: &mut RunContext,
        progress: &mut Progress,
    ) -> std::result::Result<RunMetrics, StageFailure> {
        progress.stage = Stage::Preparing;
        let sandbox = self.preparer.prepare(ctx).await.at(Stage::Preparing)?;
        let dir = sandbox.path().to_path_buf();
        progress.sandbox = Some(sandbox);

        progress.stage = Stage::Running;
        let backend = &self.backend;
        self.scheduler
            .schedule(ctx, |ctx| async move { backend.run(ctx).await?.into_result() })
            .await
            .at(Stage::Running)?;

        progress.stage = Stage::Gathering;
        let report = tokio::task::spawn_blocking(move || gather::gather(&dir))
            .await
            .map_err(|e| EngineError::internal(format!("gather task failed: {}", e)))
            .and_then(|report| report)
            .at(Stage::Gathering)?;

        progress.stage = Stage::Reporting;
        Ok(report.metrics())
    }

    /// At-most-once delivery; a failure is logged and otherwise ignored
    async fn report(&self, verdict: &SubmissionResult) {
        if let Err(e) = self.sink.report(verdict).await {
            error!(
                submission_id = %verdict.submission_uuid(),
                stage = %Stage::Reporting,
                cause = %e,
                "Failed to report verdict"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SandboxOutcome;
    use crate::gather::tests::write_passing_run;
    use crate::gather::{COMPILE_STDERR_FILE, FAILED_FILE, RUN_STDOUT_FILE};
    use crate::test_support::{
        self, complete_bundle, dir_entries, FakeBackend, RecordingSink, StaticBundles,
    };
    use greencode_common::types::Language;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    struct Harness {
        executor: Executor,
        backend: Arc<FakeBackend>,
        sink: Arc<RecordingSink>,
        tmp: TempDir,
    }

    impl Harness {
        fn new(backend: FakeBackend) -> Self {
            Self::build(backend, StaticBundles::new(python_bundle()), RecordingSink::default(), 2)
        }

        fn build(
            backend: FakeBackend,
            bundles: StaticBundles,
            sink: RecordingSink,
            cpus: usize,
        ) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let backend = Arc::new(backend);
            let sink = Arc::new(sink);
            let preparer = Preparer::new(
                backend.clone(),
                Arc::new(bundles),
                tmp.path().to_path_buf(),
                None,
            );
            let executor = Executor::new(
                Arc::new(LanguageRegistry::builtin()),
                Arc::new(preparer),
                Scheduler::new(cpus),
                backend.clone(),
                sink.clone(),
            );
            Self {
                executor,
                backend,
                sink,
                tmp,
            }
        }

        async fn submit(&self) -> SubmissionResult {
            self.executor
                .entry(test_support::submission(Language::Python, "print(2 * int(input()))"))
                .await
        }

        /// Properties every finished submission must leave behind
        fn assert_settled(&self, verdict: &SubmissionResult) {
            assert_eq!(verdict.successful(), verdict.error_reason().is_none());
            assert_eq!(self.sink.verdicts(), vec![verdict.clone()]);
            assert_eq!(dir_entries(self.tmp.path()), 0, "sandbox directory left behind");
            let scheduler = self.executor.scheduler();
            assert_eq!(scheduler.available(), scheduler.capacity());
        }
    }

    fn python_bundle() -> Vec<u8> {
        let profile = LanguageRegistry::builtin().resolve(Language::Python).unwrap();
        complete_bundle(&profile)
    }

    fn passing(dir: &Path) -> Result<SandboxOutcome> {
        write_passing_run(dir);
        Ok(SandboxOutcome::Success)
    }

    #[tokio::test]
    async fn test_successful_submission() {
        let harness = Harness::new(FakeBackend::new(passing));

        let verdict = harness.submit().await;

        assert!(verdict.successful());
        let metrics = verdict.metrics();
        assert!((metrics.runtime_ms - 4600.0).abs() < 1e-9);
        assert!((metrics.mem_usage_mb - 1.804).abs() < 1e-9);
        assert_eq!(harness.backend.cpus.lock().len(), 1);
        assert!(harness.backend.cpus.lock()[0] < 2);
        harness.assert_settled(&verdict);
    }

    #[tokio::test]
    async fn test_compile_error_carries_compiler_output() {
        let harness = Harness::new(FakeBackend::new(|dir| {
            fs::write(dir.join(FAILED_FILE), "compile\n").unwrap();
            fs::write(dir.join(COMPILE_STDERR_FILE), "SyntaxError: invalid syntax").unwrap();
            Ok(SandboxOutcome::Success)
        }));

        let verdict = harness.submit().await;

        assert_eq!(verdict.error_reason(), Some(ErrorReason::CompileError));
        assert_eq!(verdict.error_msg(), Some("SyntaxError: invalid syntax"));
        harness.assert_settled(&verdict);
    }

    #[tokio::test]
    async fn test_wrong_answer() {
        let harness = Harness::new(FakeBackend::new(|dir| {
            write_passing_run(dir);
            fs::write(dir.join(RUN_STDOUT_FILE), "2\n5\n").unwrap();
            Ok(SandboxOutcome::Success)
        }));

        let verdict = harness.submit().await;

        assert_eq!(verdict.error_reason(), Some(ErrorReason::TestsFailed));
        assert!(verdict
            .error_msg()
            .unwrap()
            .contains("Test 1: Input: 2, Expected: 4 but got: 5"));
        assert_eq!(verdict.metrics(), RunMetrics::default());
        harness.assert_settled(&verdict);
    }

    #[tokio::test]
    async fn test_sandbox_outcomes_map_to_reasons() {
        let cases = [
            (SandboxOutcome::Timeout, ErrorReason::Timeout),
            (SandboxOutcome::MemoryLimitExceeded, ErrorReason::MemLimit),
            (
                SandboxOutcome::InternalError("container create failed".into()),
                ErrorReason::InternalError,
            ),
        ];

        for (outcome, reason) in cases {
            let harness = Harness::new(FakeBackend::new(move |_| Ok(outcome.clone())));
            let verdict = harness.submit().await;

            assert_eq!(verdict.error_reason(), Some(reason));
            assert_eq!(verdict.error_msg(), None);
            harness.assert_settled(&verdict);
        }
    }

    #[tokio::test]
    async fn test_cpu_out_of_range_is_internal() {
        let harness = Harness::new(FakeBackend::new(|_| Err(EngineError::CpuOutOfRange(7))));

        let verdict = harness.submit().await;

        assert_eq!(verdict.error_reason(), Some(ErrorReason::InternalError));
        assert_eq!(verdict.error_msg(), None);
        harness.assert_settled(&verdict);
    }

    #[tokio::test]
    async fn test_preparation_failure() {
        let harness = Harness::build(
            FakeBackend::new(passing),
            StaticBundles::failing(),
            RecordingSink::default(),
            1,
        );

        let verdict = harness.submit().await;

        assert_eq!(verdict.error_reason(), Some(ErrorReason::InternalError));
        assert!(harness.backend.cpus.lock().is_empty());
        harness.assert_settled(&verdict);
    }

    #[tokio::test]
    async fn test_missing_image_is_internal() {
        let harness = Harness::new(FakeBackend::missing_image());

        let verdict = harness.submit().await;

        assert_eq!(verdict.error_reason(), Some(ErrorReason::InternalError));
        harness.assert_settled(&verdict);
    }

    #[tokio::test]
    async fn test_gather_failure_is_internal() {
        // The sandbox ran but left no failed.txt behind
        let harness = Harness::new(FakeBackend::new(|_| Ok(SandboxOutcome::Success)));

        let verdict = harness.submit().await;

        assert_eq!(verdict.error_reason(), Some(ErrorReason::InternalError));
        assert_eq!(verdict.error_msg(), None);
        harness.assert_settled(&verdict);
    }

    #[tokio::test]
    async fn test_panic_still_reports_and_cleans_up() {
        let harness = Harness::new(FakeBackend::new(|_| panic!("backend bug")));

        let verdict = harness.submit().await;

        assert_eq!(verdict.error_reason(), Some(ErrorReason::InternalError));
        harness.assert_settled(&verdict);
    }

    #[tokio::test]
    async fn test_report_failure_still_cleans_up() {
        let harness = Harness::build(
            FakeBackend::new(passing),
            StaticBundles::new(python_bundle()),
            RecordingSink::failing(),
            1,
        );

        let verdict = harness.submit().await;

        assert!(verdict.successful());
        harness.assert_settled(&verdict);
    }

    #[tokio::test]
    async fn test_unregistered_language_reports_internal_error() {
        let only_c = r#"{"languages": [{"name": "c", "image": "runner_c", "file_extension": "c"}]}"#;
        let backend = Arc::new(FakeBackend::new(passing));
        let sink = Arc::new(RecordingSink::default());
        let tmp = tempfile::tempdir().unwrap();
        let preparer = Preparer::new(
            backend.clone(),
            Arc::new(StaticBundles::new(python_bundle())),
            tmp.path().to_path_buf(),
            None,
        );
        let executor = Executor::new(
            Arc::new(LanguageRegistry::from_json(only_c).unwrap()),
            Arc::new(preparer),
            Scheduler::new(1),
            backend.clone(),
            sink.clone(),
        );

        let submission = test_support::submission(Language::Python, "print(1)");
        let id = submission.submission_uuid;
        let verdict = executor.entry(submission).await;

        assert_eq!(verdict.submission_uuid(), id);
        assert_eq!(verdict.error_reason(), Some(ErrorReason::InternalError));
        assert_eq!(sink.verdicts().len(), 1);
        assert_eq!(backend.images_ensured.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(dir_entries(tmp.path()), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submissions_share_cpus() {
        let harness = Harness::build(
            FakeBackend::new(|dir| {
                std::thread::sleep(std::time::Duration::from_millis(5));
                passing(dir)
            }),
            StaticBundles::new(python_bundle()),
            RecordingSink::default(),
            2,
        );

        let runs = (0..12).map(|_| harness.submit());
        let verdicts = futures_util::future::join_all(runs).await;

        assert!(verdicts.iter().all(SubmissionResult::successful));
        assert_eq!(harness.sink.verdicts().len(), 12);
        assert!(harness.backend.cpus.lock().iter().all(|&cpu| cpu < 2));
        assert_eq!(dir_entries(harness.tmp.path()), 0);
        assert_eq!(harness.executor.scheduler().available(), 2);
    }
}
