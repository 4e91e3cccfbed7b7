//! Local code execution engine: compiles or interprets a submission, runs it
//! under a supervisor with time and output limits, and grades it against test
//! cases.
pub mod adapter;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod harness;
pub mod service;
pub mod supervisor;

pub use config::LanguageConfigManager;
pub use error::ExecutionError;
pub use harness::{Evaluation, EvaluationOutcome, HarnessEvent};
pub use service::CodeExecutionService;
