/// Code Execution Service - High-Level Orchestration
///
/// **Responsibility:**
/// Front door for callers. Routes a submission to the right adapter, runs it
/// through the supervisor or the test harness, and owns cancellation.
///
/// This module is the glue layer - it knows nothing about:
/// - How a process is started or stopped (supervisor's job)
/// - How a language is compiled (adapter's job)
/// - How outputs are compared (harness's job)
///
/// One submission runs at a time; a second concurrent call gets
/// [`ExecutionError::Busy`] instead of queueing.
use crate::adapter::{Preparation, RuntimeAdapter};
use crate::config::LanguageConfigManager;
use crate::diagnostics::DiagnosticExtractor;
use crate::error::ExecutionError;
use crate::harness::{Evaluation, ProgressSender, TestHarness};
use crate::supervisor::{lock_unpoisoned, OutputSink, ProcessSupervisor, RunLimits};
use anyhow::{Context, Result};
use runlab_common::types::{
    CodeEditorDiagnostic, ExecutionRequest, ExecutionResult, Language, TestCase,
};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

struct LanguageRuntime {
    adapter: RuntimeAdapter,
    extractor: DiagnosticExtractor,
}

pub struct CodeExecutionService {
    config: LanguageConfigManager,
    supervisor: ProcessSupervisor,
    runtimes: HashMap<Language, LanguageRuntime>,
    submission: Mutex<Option<CancellationToken>>,
}

impl CodeExecutionService {
    pub fn new(config: LanguageConfigManager) -> Result<Self> {
        let mut runtimes = HashMap::new();
        for language in config.list_languages() {
            let Some(language_config) = config.get_config(&language) else {
                continue;
            };
            let adapter = RuntimeAdapter::from_config(language_config)
                .with_context(|| format!("Invalid toolchain for {}", language))?;
            let extractor = DiagnosticExtractor::new(language, &language_config.diagnostic_patterns())
                .with_context(|| format!("Invalid diagnostic pattern for {}", language))?
                .with_source_file(adapter.source_file());
            runtimes.insert(language, LanguageRuntime { adapter, extractor });
        }

        info!(
            languages = runtimes.len(),
            timeout_ms = config.limits().timeout_ms,
            output_limit = config.limits().output_limit_bytes,
            "Execution service ready"
        );

        Ok(Self {
            supervisor: ProcessSupervisor::new(config.limits().grace_period()),
            config,
            runtimes,
            submission: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &LanguageConfigManager {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        lock_unpoisoned(&self.submission).is_some()
    }

    /// Compile if needed and run once with `input`
    pub async fn execute(
        &self,
        code: &str,
        language: Language,
        input: &str,
    ) -> Result<ExecutionResult, ExecutionError> {
        self.execute_request(&ExecutionRequest::new(code, language, input), None)
            .await
    }

    /// Same as [`CodeExecutionService::execute`], optionally streaming output
    /// chunks to `sink` while the program runs.
    #[instrument(skip(self, request, sink), fields(language = %request.language))]
    pub async fn execute_request(
        &self,
        request: &ExecutionRequest,
        sink: Option<OutputSink>,
    ) -> Result<ExecutionResult, ExecutionError> {
        let runtime = self.runtime(request.language)?;
        let submission = self.begin_submission()?;
        let limits = self.config.limits();

        if request.input.len() > limits.max_input_bytes {
            return Ok(ExecutionResult::failure(format!(
                "Input exceeds maximum size of {} bytes",
                limits.max_input_bytes
            )));
        }

        let program = match runtime
            .adapter
            .prepare(&request.code, &limits, &self.supervisor, &submission.token)
            .await?
        {
            Preparation::Ready(program) => program,
            Preparation::Rejected(result) => return Ok(result),
        };

        let run_limits = RunLimits {
            timeout: limits.timeout(),
            output_limit: limits.output_limit_bytes,
        };
        let result = self
            .supervisor
            .run(
                &runtime.adapter.invocation(&program),
                &request.input,
                run_limits,
                &submission.token,
                sink,
            )
            .await?;

        info!(
            exit_code = result.exit_code(),
            outcome = ?result.outcome(),
            execution_ms = result.execution_time_ms(),
            "Execution finished"
        );
        Ok(result)
    }

    /// Run `code` against every case; see [`TestHarness`] for the rules
    pub async fn evaluate(
        &self,
        code: &str,
        language: Language,
        cases: &[TestCase],
    ) -> Result<Evaluation, ExecutionError> {
        self.evaluate_inner(code, language, cases, None).await
    }

    /// Like [`CodeExecutionService::evaluate`], reporting each step to `progress`
    pub async fn evaluate_with_progress(
        &self,
        code: &str,
        language: Language,
        cases: &[TestCase],
        progress: ProgressSender,
    ) -> Result<Evaluation, ExecutionError> {
        self.evaluate_inner(code, language, cases, Some(&progress))
            .await
    }

    async fn evaluate_inner(
        &self,
        code: &str,
        language: Language,
        cases: &[TestCase],
        progress: Option<&ProgressSender>,
    ) -> Result<Evaluation, ExecutionError> {
        let runtime = self.runtime(language)?;
        let submission = self.begin_submission()?;

        let harness = TestHarness::new(
            &runtime.adapter,
            &runtime.extractor,
            &self.supervisor,
            self.config.limits(),
        );
        Ok(harness
            .evaluate(code, cases, &submission.token, progress)
            .await)
    }

    /// Stop whatever is running. Safe to call at any time, any number of
    /// times; returns without waiting for the child to exit.
    pub fn cancel_execution(&self) {
        if let Some(token) = lock_unpoisoned(&self.submission).as_ref() {
            info!("Cancellation requested");
            token.cancel();
        }
        self.supervisor.cancel();
    }

    /// Parse raw error text into editor diagnostics
    pub fn diagnostics(
        &self,
        language: Language,
        error_output: &str,
        code: &str,
    ) -> Result<Vec<CodeEditorDiagnostic>, ExecutionError> {
        Ok(self.runtime(language)?.extractor.extract(error_output, code))
    }

    fn runtime(&self, language: Language) -> Result<&LanguageRuntime, ExecutionError> {
        self.runtimes
            .get(&language)
            .ok_or(ExecutionError::LanguageNotConfigured(language))
    }

    fn begin_submission(&self) -> Result<Submission<'_>, ExecutionError> {
        let mut slot = lock_unpoisoned(&self.submission);
        if slot.is_some() {
            return Err(ExecutionError::Busy);
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        Ok(Submission {
            slot: &self.submission,
            token,
        })
    }
}

/// Releases the submission slot on every exit path
struct Submission<'a> {
    slot: &'a Mutex<Option<CancellationToken>>,
    token: CancellationToken,
}

impl Drop for Submission<'_> {
    fn drop(&mut self) {
        *lock_unpoisoned(self.slot) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LanguageConfig;
    use runlab_common::config::ExecutionLimits;

    fn python_only() -> CodeExecutionService {
        let config = LanguageConfigManager::from_parts(
            ExecutionLimits::default(),
            vec![LanguageConfig::default_for(Language::Python)],
        )
        .unwrap();
        CodeExecutionService::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_unconfigured_language_is_rejected() {
        let service = python_only();
        let result = service.execute("print(1)", Language::Swift, "").await;
        assert!(matches!(
            result,
            Err(ExecutionError::LanguageNotConfigured(Language::Swift))
        ));
    }

    #[test]
    fn test_cancel_when_idle_is_noop() {
        let service = python_only();
        service.cancel_execution();
        service.cancel_execution();
        assert!(!service.is_running());
    }

    #[test]
    fn test_second_submission_is_busy() {
        let service = python_only();
        let _first = service.begin_submission().unwrap();
        assert!(service.is_running());
        assert!(matches!(service.begin_submission(), Err(ExecutionError::Busy)));
    }

    #[test]
    fn test_submission_slot_released_on_drop() {
        let service = python_only();
        drop(service.begin_submission().unwrap());
        assert!(!service.is_running());
        assert!(service.begin_submission().is_ok());
    }

    #[test]
    fn test_diagnostics_use_configured_source_file() {
        let service = python_only();
        let stderr = "Traceback (most recent call last):\n  File \"/tmp/runlab-x/main.py\", line 2, in <module>\n    y = x + 1\nNameError: name 'x' is not defined\n";
        let diagnostics = service
            .diagnostics(Language::Python, stderr, "a = 1\ny = x + 1\n")
            .unwrap();

        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].line, 2);
        assert_eq!(diagnostics[0].message, "NameError: name 'x' is not defined");
    }
}
