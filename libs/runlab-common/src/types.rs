use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const TIMEOUT_MESSAGE: &str = "Execution timed out";
pub const CANCELLED_MESSAGE: &str = "Execution stopped by user";
pub const OUTPUT_LIMIT_MESSAGE: &str = "Output limit exceeded";

/// Languages the engine is allowed to shell out to.
///
/// The set is closed: every variant maps to one vetted toolchain, and adding a
/// language means adding a variant plus its runtime adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Swift,
    Python,
}

impl Language {
    pub const ALL: [Language; 2] = [Language::Swift, Language::Python];

    /// Whether a separate compile step runs before the program can be invoked
    pub fn is_compiled(&self) -> bool {
        matches!(self, Language::Swift)
    }

    pub fn file_extension(&self) -> &'static str {
        match self {
            Language::Swift => "swift",
            Language::Python => "py",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Swift => "swift",
            Language::Python => "python",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLanguage(pub String);

impl fmt::Display for UnknownLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported language: {}", self.0)
    }
}

impl std::error::Error for UnknownLanguage {}

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "swift" => Ok(Language::Swift),
            "python" | "python3" | "py" => Ok(Language::Python),
            other => Err(UnknownLanguage(other.to_string())),
        }
    }
}

/// One ad-hoc run: source, language and the stdin fed to the program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: Language,
    pub input: String,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>, language: Language, input: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language,
            input: input.into(),
        }
    }
}

/// Primary classification of an [`ExecutionResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    RuntimeFailure,
    TimedOut,
    OutputLimitExceeded,
    Cancelled,
}

/// Raw result of one compile or run.
///
/// Fields are private: results are built through the constructors below so a
/// timed-out or cancelled result can never carry a zero exit code.
/// Deserialization enforces the same rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ExecutionResultRecord")]
pub struct ExecutionResult {
    output: String,
    error: String,
    exit_code: i32,
    timed_out: bool,
    was_cancelled: bool,
    output_limit_exceeded: bool,
    execution_time_ms: u64,
}

/// Wire shape of [`ExecutionResult`], checked before it becomes one
#[derive(Deserialize)]
struct ExecutionResultRecord {
    output: String,
    error: String,
    exit_code: i32,
    timed_out: bool,
    was_cancelled: bool,
    #[serde(default)]
    output_limit_exceeded: bool,
    #[serde(default)]
    execution_time_ms: u64,
}

impl TryFrom<ExecutionResultRecord> for ExecutionResult {
    type Error = String;

    fn try_from(record: ExecutionResultRecord) -> Result<Self, Self::Error> {
        let stopped = record.timed_out || record.was_cancelled || record.output_limit_exceeded;
        if stopped && record.exit_code == 0 {
            return Err("a stopped run cannot have exit code 0".to_string());
        }
        Ok(Self {
            output: record.output,
            error: record.error,
            exit_code: record.exit_code,
            timed_out: record.timed_out,
            was_cancelled: record.was_cancelled,
            output_limit_exceeded: record.output_limit_exceeded,
            execution_time_ms: record.execution_time_ms,
        })
    }
}

impl ExecutionResult {
    /// A process that ran to completion on its own
    pub fn exited(output: String, error: String, exit_code: i32) -> Self {
        Self {
            output,
            error,
            exit_code,
            timed_out: false,
            was_cancelled: false,
            output_limit_exceeded: false,
            execution_time_ms: 0,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self::exited(String::new(), reason.into(), -1)
    }

    pub fn timeout() -> Self {
        Self {
            timed_out: true,
            ..Self::failure(TIMEOUT_MESSAGE)
        }
    }

    pub fn cancelled() -> Self {
        Self {
            was_cancelled: true,
            ..Self::failure(CANCELLED_MESSAGE)
        }
    }

    pub fn limit_exceeded() -> Self {
        Self {
            output_limit_exceeded: true,
            ..Self::failure(OUTPUT_LIMIT_MESSAGE)
        }
    }

    /// Attach whatever the process wrote before it was stopped. Captured stderr
    /// goes in front of the status message.
    pub fn with_captured(mut self, stdout: String, stderr: String) -> Self {
        self.output = stdout;
        let stderr = stderr.trim_end();
        if !stderr.is_empty() {
            self.error = if self.error.is_empty() {
                stderr.to_string()
            } else {
                format!("{}\n{}", stderr, self.error)
            };
        }
        self
    }

    /// Append an annotation line to the error text
    pub fn with_note(mut self, note: &str) -> Self {
        if self.error.is_empty() {
            self.error = note.to_string();
        } else {
            self.error = format!("{}\n[{}]", self.error.trim_end(), note);
        }
        self
    }

    pub fn with_elapsed(mut self, execution_time_ms: u64) -> Self {
        self.execution_time_ms = execution_time_ms;
        self
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn error(&self) -> &str {
        &self.error
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn was_cancelled(&self) -> bool {
        self.was_cancelled
    }

    pub fn output_limit_exceeded(&self) -> bool {
        self.output_limit_exceeded
    }

    pub fn execution_time_ms(&self) -> u64 {
        self.execution_time_ms
    }

    /// Cancellation outranks every other condition, then timeout, then the
    /// output cap, then the exit status.
    pub fn outcome(&self) -> ExecutionOutcome {
        if self.was_cancelled {
            ExecutionOutcome::Cancelled
        } else if self.timed_out {
            ExecutionOutcome::TimedOut
        } else if self.output_limit_exceeded {
            ExecutionOutcome::OutputLimitExceeded
        } else if self.exit_code == 0 {
            ExecutionOutcome::Success
        } else {
            ExecutionOutcome::RuntimeFailure
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome() == ExecutionOutcome::Success
    }
}

/// A single `(input, expected output)` pair and, once evaluated, its verdict.
///
/// `passed` stays `None` until the harness has actually compared output for
/// this case; cases skipped by a fatal error or cancellation keep `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub input: String,
    pub expected_output: String,
    #[serde(default)]
    pub actual_output: Option<String>,
    #[serde(default)]
    pub passed: Option<bool>,
}

impl TestCase {
    pub fn new(input: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            input: input.into(),
            expected_output: expected_output.into(),
            actual_output: None,
            passed: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.passed.is_none()
    }

    /// Copy of this case with any previous verdict discarded
    pub fn pending(&self) -> Self {
        Self {
            actual_output: None,
            passed: None,
            ..self.clone()
        }
    }
}

/// Region of a source line the editor should underline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnderlineSpan {
    /// The whole line
    Line,
    /// `length` characters starting at 1-based column `start`
    Columns { start: usize, length: usize },
}

/// Structured location extracted from compiler or interpreter error text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodeEditorDiagnostic {
    /// 1-based
    pub line: usize,
    /// 1-based
    pub column: Option<usize>,
    pub message: String,
    pub span: UnderlineSpan,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_parsing() {
        assert_eq!("swift".parse::<Language>(), Ok(Language::Swift));
        assert_eq!(" Python ".parse::<Language>(), Ok(Language::Python));
        assert_eq!("python3".parse::<Language>(), Ok(Language::Python));
        assert_eq!("py".parse::<Language>(), Ok(Language::Python));
        assert!("ruby".parse::<Language>().is_err());
        assert_eq!(Language::Swift.to_string(), "swift");
        assert!(Language::Swift.is_compiled());
        assert!(!Language::Python.is_compiled());
    }

    #[test]
    fn test_language_serde_roundtrip_names() {
        let json = serde_json::to_string(&Language::Python).unwrap();
        assert_eq!(json, "\"python\"");
        let parsed: Language = serde_json::from_str("\"swift\"").unwrap();
        assert_eq!(parsed, Language::Swift);
    }

    #[test]
    fn test_factories_have_single_primary_outcome() {
        assert_eq!(ExecutionResult::exited("ok".into(), String::new(), 0).outcome(), ExecutionOutcome::Success);
        assert_eq!(ExecutionResult::exited(String::new(), "boom".into(), 1).outcome(), ExecutionOutcome::RuntimeFailure);
        assert_eq!(ExecutionResult::failure("nope").outcome(), ExecutionOutcome::RuntimeFailure);
        assert_eq!(ExecutionResult::timeout().outcome(), ExecutionOutcome::TimedOut);
        assert_eq!(ExecutionResult::cancelled().outcome(), ExecutionOutcome::Cancelled);
        assert_eq!(ExecutionResult::limit_exceeded().outcome(), ExecutionOutcome::OutputLimitExceeded);
    }

    #[test]
    fn test_failure_states_are_never_success() {
        for result in [
            ExecutionResult::timeout(),
            ExecutionResult::cancelled(),
            ExecutionResult::limit_exceeded(),
            ExecutionResult::failure("x"),
        ] {
            assert!(!result.is_success());
            assert_ne!(result.exit_code(), 0);
        }
    }

    #[test]
    fn test_success_ignores_stderr_warnings() {
        let result = ExecutionResult::exited("7\n".into(), "warning: unused".into(), 0);
        assert!(result.is_success());
    }

    #[test]
    fn test_with_captured_keeps_partial_output() {
        let result = ExecutionResult::timeout()
            .with_captured("partial".into(), "trace\n".into())
            .with_elapsed(2000);

        assert_eq!(result.output(), "partial");
        assert_eq!(result.error(), "trace\nExecution timed out");
        assert!(result.timed_out());
        assert_eq!(result.execution_time_ms(), 2000);
    }

    #[test]
    fn test_with_note_appends_annotation() {
        let result = ExecutionResult::exited(String::new(), "crash".into(), 139).with_note("Segmentation fault");
        assert_eq!(result.error(), "crash\n[Segmentation fault]");

        let bare = ExecutionResult::exited(String::new(), String::new(), 137).with_note("Killed");
        assert_eq!(bare.error(), "Killed");
    }

    #[test]
    fn test_test_case_pending_discards_verdict() {
        let mut case = TestCase::new("1 2", "3");
        assert!(case.is_pending());

        case.actual_output = Some("3".into());
        case.passed = Some(true);

        let fresh = case.pending();
        assert_eq!(fresh.id, case.id);
        assert!(fresh.is_pending());
        assert!(fresh.actual_output.is_none());
    }

    #[test]
    fn test_test_case_deserializes_without_id() {
        let case: TestCase = serde_json::from_str(r#"{"input": "3\n4", "expected_output": "7"}"#).unwrap();
        assert_eq!(case.input, "3\n4");
        assert!(case.passed.is_none());
    }

    #[test]
    fn test_result_deserialization_rejects_stopped_success() {
        let forged = r#"{"output":"","error":"","exit_code":0,"timed_out":true,"was_cancelled":false}"#;
        assert!(serde_json::from_str::<ExecutionResult>(forged).is_err());

        let forged = r#"{"output":"","error":"","exit_code":0,"timed_out":false,"was_cancelled":false,"output_limit_exceeded":true}"#;
        assert!(serde_json::from_str::<ExecutionResult>(forged).is_err());
    }

    #[test]
    fn test_result_survives_serialization() {
        let timeout = ExecutionResult::timeout().with_elapsed(300);
        let json = serde_json::to_string(&timeout).unwrap();
        assert_eq!(serde_json::from_str::<ExecutionResult>(&json).unwrap(), timeout);

        let legacy: ExecutionResult =
            serde_json::from_str(r#"{"output":"7\n","error":"","exit_code":0,"timed_out":false,"was_cancelled":false}"#)
                .unwrap();
        assert!(legacy.is_success());
        assert_eq!(legacy.output(), "7\n");
    }
}
