/// Test Harness - runs a submission against a list of test cases
///
/// **Core Responsibility:**
/// Prepare the code once, run it once per case with that case's input, and
/// decide pass/fail from normalized output.
///
/// **Rules:**
/// - Cases run strictly in order, one at a time
/// - A timeout or output overflow fails that case only; the next case still runs
/// - Compile failure, cancellation and fatal spawn errors stop the run; cases
///   never reached keep `passed == None`
/// - Every case starts from a reset verdict, so results from a previous
///   evaluation can't leak through
use crate::adapter::{Preparation, RuntimeAdapter};
use crate::diagnostics::DiagnosticExtractor;
use crate::error::ExecutionError;
use crate::supervisor::{ProcessSupervisor, RunLimits};
use chrono::{DateTime, Utc};
use runlab_common::config::ExecutionLimits;
use runlab_common::types::{
    CodeEditorDiagnostic, ExecutionOutcome, ExecutionResult, TestCase,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Normalize program output for comparison.
///
/// Trailing whitespace on each line is ignored (this also absorbs `\r\n`), and
/// exactly one trailing newline is dropped. Leading whitespace and additional
/// trailing blank lines still count.
pub fn normalize_output(output: &str) -> String {
    let joined = output
        .split('\n')
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");

    match joined.strip_suffix('\n') {
        Some(stripped) => stripped.to_string(),
        None => joined,
    }
}

pub fn outputs_match(actual: &str, expected: &str) -> bool {
    normalize_output(actual) == normalize_output(expected)
}

/// Progress notifications emitted while an evaluation runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HarnessEvent {
    Preparing,
    CompileFailed {
        diagnostics: usize,
    },
    CaseStarted {
        index: usize,
        total: usize,
    },
    CaseFinished {
        index: usize,
        passed: bool,
        outcome: ExecutionOutcome,
    },
    Finished {
        passed: usize,
        total: usize,
    },
}

pub type ProgressSender = mpsc::UnboundedSender<HarnessEvent>;

/// Raw result behind a case verdict
#[derive(Debug, Clone, Serialize)]
pub struct CaseRun {
    pub test_id: Uuid,
    pub index: usize,
    pub result: ExecutionResult,
}

#[derive(Debug)]
pub enum EvaluationOutcome {
    /// Every case ran (pass or fail)
    Completed,
    CompileFailed,
    Cancelled,
    /// The runtime could not be started at all
    Fatal(ExecutionError),
}

impl EvaluationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationOutcome::Completed => "completed",
            EvaluationOutcome::CompileFailed => "compile_failed",
            EvaluationOutcome::Cancelled => "cancelled",
            EvaluationOutcome::Fatal(_) => "fatal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EvaluationSummary {
    pub passed: usize,
    pub failed: usize,
    pub unset: usize,
    pub total: usize,
}

#[derive(Debug)]
pub struct Evaluation {
    pub cases: Vec<TestCase>,
    pub runs: Vec<CaseRun>,
    /// From the compile error, or else the first runtime failure
    pub diagnostics: Vec<CodeEditorDiagnostic>,
    /// Set when preparation was rejected
    pub compile_result: Option<ExecutionResult>,
    pub outcome: EvaluationOutcome,
    pub finished_at: DateTime<Utc>,
}

impl Evaluation {
    pub fn summary(&self) -> EvaluationSummary {
        let passed = self.cases.iter().filter(|c| c.passed == Some(true)).count();
        let failed = self.cases.iter().filter(|c| c.passed == Some(false)).count();
        EvaluationSummary {
            passed,
            failed,
            unset: self.cases.len() - passed - failed,
            total: self.cases.len(),
        }
    }

    pub fn all_passed(&self) -> bool {
        let summary = self.summary();
        matches!(self.outcome, EvaluationOutcome::Completed)
            && summary.failed == 0
            && summary.unset == 0
    }
}

/// Borrowed view of everything one evaluation needs
pub struct TestHarness<'a> {
    adapter: &'a RuntimeAdapter,
    extractor: &'a DiagnosticExtractor,
    supervisor: &'a ProcessSupervisor,
    limits: ExecutionLimits,
}

impl<'a> TestHarness<'a> {
    pub fn new(
        adapter: &'a RuntimeAdapter,
        extractor: &'a DiagnosticExtractor,
        supervisor: &'a ProcessSupervisor,
        limits: ExecutionLimits,
    ) -> Self {
        Self {
            adapter,
            extractor,
            supervisor,
            limits,
        }
    }

    #[instrument(skip_all, fields(language = %self.adapter.language(), cases = cases.len()))]
    pub async fn evaluate(
        &self,
        code: &str,
        cases: &[TestCase],
        cancel: &CancellationToken,
        progress: Option<&ProgressSender>,
    ) -> Evaluation {
        let mut cases: Vec<TestCase> = cases.iter().map(TestCase::pending).collect();
        let mut runs = Vec::with_capacity(cases.len());

        emit(progress, HarnessEvent::Preparing);
        let program = match self
            .adapter
            .prepare(code, &self.limits, self.supervisor, cancel)
            .await
        {
            Ok(Preparation::Ready(program)) => program,
            Ok(Preparation::Rejected(result)) if result.was_cancelled() => {
                info!("Cancelled before any case ran");
                return finish(cases, runs, Vec::new(), Some(result), EvaluationOutcome::Cancelled, progress);
            }
            Ok(Preparation::Rejected(result)) => {
                let diagnostics = self.extractor.extract(result.error(), code);
                info!(
                    exit_code = result.exit_code(),
                    diagnostics = diagnostics.len(),
                    "Preparation rejected, marking no case"
                );
                emit(
                    progress,
                    HarnessEvent::CompileFailed {
                        diagnostics: diagnostics.len(),
                    },
                );
                return finish(cases, runs, diagnostics, Some(result), EvaluationOutcome::CompileFailed, progress);
            }
            Err(e) => {
                warn!(error = %e, "Could not prepare program");
                return finish(cases, runs, Vec::new(), None, EvaluationOutcome::Fatal(e), progress);
            }
        };

        let invocation = self.adapter.invocation(&program);
        let run_limits = RunLimits {
            timeout: self.limits.timeout(),
            output_limit: self.limits.output_limit_bytes,
        };
        let total = cases.len();
        let mut outcome = EvaluationOutcome::Completed;

        for (index, case) in cases.iter_mut().enumerate() {
            if cancel.is_cancelled() {
                outcome = EvaluationOutcome::Cancelled;
                break;
            }
            emit(progress, HarnessEvent::CaseStarted { index, total });

            let result = if case.input.len() > self.limits.max_input_bytes {
                ExecutionResult::failure(format!(
                    "Test input exceeds maximum size of {} bytes",
                    self.limits.max_input_bytes
                ))
            } else {
                match self
                    .supervisor
                    .run(&invocation, &case.input, run_limits, cancel, None)
                    .await
                {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(test_index = index, error = %e, "Runtime failed to start");
                        outcome = EvaluationOutcome::Fatal(e);
                        break;
                    }
                }
            };

            if result.was_cancelled() {
                info!(test_index = index, "Cancelled mid-case");
                runs.push(CaseRun {
                    test_id: case.id,
                    index,
                    result,
                });
                outcome = EvaluationOutcome::Cancelled;
                break;
            }

            let actual = normalize_output(result.output());
            let passed = result.is_success() && actual == normalize_output(&case.expected_output);
            debug!(
                test_index = index,
                passed,
                outcome = ?result.outcome(),
                execution_ms = result.execution_time_ms(),
                "Case finished"
            );

            case.actual_output = Some(actual);
            case.passed = Some(passed);
            emit(
                progress,
                HarnessEvent::CaseFinished {
                    index,
                    passed,
                    outcome: result.outcome(),
                },
            );
            runs.push(CaseRun {
                test_id: case.id,
                index,
                result,
            });
        }

        // Workspace goes away before the verdicts are handed back
        drop(program);

        let diagnostics = runs
            .iter()
            .map(|run| &run.result)
            .find(|result| {
                result.outcome() == ExecutionOutcome::RuntimeFailure && !result.error().trim().is_empty()
            })
            .map(|result| self.extractor.extract(result.error(), code))
            .unwrap_or_default();

        finish(cases, runs, diagnostics, None, outcome, progress)
    }
}

fn emit(progress: Option<&ProgressSender>, event: HarnessEvent) {
    if let Some(sender) = progress {
        // Nobody listening is fine
        let _ = sender.send(event);
    }
}

fn finish(
    cases: Vec<TestCase>,
    runs: Vec<CaseRun>,
    diagnostics: Vec<CodeEditorDiagnostic>,
    compile_result: Option<ExecutionResult>,
    outcome: EvaluationOutcome,
    progress: Option<&ProgressSender>,
) -> Evaluation {
    let evaluation = Evaluation {
        cases,
        runs,
        diagnostics,
        compile_result,
        outcome,
        finished_at: Utc::now(),
    };

    let summary = evaluation.summary();
    info!(
        passed = summary.passed,
        failed = summary.failed,
        unset = summary.unset,
        total = summary.total,
        outcome = ?evaluation.outcome,
        "Evaluation finished"
    );
    emit(
        progress,
        HarnessEvent::Finished {
            passed: summary.passed,
            total: summary.total,
        },
    );
    evaluation
}
