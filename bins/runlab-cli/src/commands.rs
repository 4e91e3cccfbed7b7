// CLI commands backed by the execution engine
use anyhow::{Context, Result};
use runlab_common::types::{
    CodeEditorDiagnostic, ExecutionRequest, ExecutionResult, Language, TestCase, UnderlineSpan,
};
use runlab_engine::config::ToolchainConfig;
use runlab_engine::harness::{Evaluation, EvaluationOutcome, HarnessEvent};
use runlab_engine::supervisor::{OutputChunk, OutputStream};
use runlab_engine::{CodeExecutionService, LanguageConfigManager};
use serde_json::json;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// Cancel whatever the service is running when Ctrl-C arrives
fn cancel_on_interrupt(service: &Arc<CodeExecutionService>) -> JoinHandle<()> {
    let service = service.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping execution");
            service.cancel_execution();
        }
    })
}

/// Run a program once. Returns whether it succeeded.
pub async fn run_program(
    service: Arc<CodeExecutionService>,
    language: Language,
    file: &Path,
    input_file: Option<&Path>,
    stream: bool,
) -> Result<bool> {
    let code = read_file(file)?;
    let input = match input_file {
        Some(path) => read_file(path)?,
        None => String::new(),
    };

    let (sink, printer) = if stream {
        let (tx, rx) = mpsc::unbounded_channel();
        (Some(tx), Some(tokio::spawn(print_chunks(rx))))
    } else {
        (None, None)
    };

    let interrupt = cancel_on_interrupt(&service);
    let request = ExecutionRequest::new(code, language, input);
    let result = service.execute_request(&request, sink).await;
    interrupt.abort();
    if let Some(printer) = printer {
        let _ = printer.await;
    }
    let result = result?;

    if !stream {
        print!("{}", result.output());
        io::stdout().flush()?;
        if !result.error().is_empty() {
            eprintln!("{}", result.error().trim_end());
        }
    }
    eprintln!("{}", status_line(&result));

    if !result.is_success() {
        let diagnostics = service.diagnostics(language, result.error(), &request.code)?;
        for diagnostic in &diagnostics {
            eprintln!("{}", render_diagnostic(&request.code, diagnostic));
        }
    }

    Ok(result.is_success())
}

async fn print_chunks(mut rx: mpsc::UnboundedReceiver<OutputChunk>) {
    while let Some(chunk) = rx.recv().await {
        match chunk.stream {
            OutputStream::Stdout => {
                print!("{}", chunk.text);
                let _ = io::stdout().flush();
            }
            OutputStream::Stderr => eprint!("{}", chunk.text),
        }
    }
}

fn status_line(result: &ExecutionResult) -> String {
    format!(
        "--- {:?} (exit code {}, {} ms)",
        result.outcome(),
        result.exit_code(),
        result.execution_time_ms()
    )
}

/// Grade a program against the cases in `cases_file` and print the evaluation
/// as JSON. Returns whether every case passed.
pub async fn submit(
    service: Arc<CodeExecutionService>,
    language: Language,
    file: &Path,
    cases_file: &Path,
) -> Result<bool> {
    let code = read_file(file)?;
    let cases: Vec<TestCase> = serde_json::from_str(&read_file(cases_file)?)
        .with_context(|| format!("Failed to parse test cases from {}", cases_file.display()))?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let progress = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                HarnessEvent::CaseFinished { index, passed, outcome } => {
                    eprintln!(
                        "case {}: {} ({:?})",
                        index + 1,
                        if passed { "PASS" } else { "FAIL" },
                        outcome
                    );
                }
                HarnessEvent::CompileFailed { diagnostics } => {
                    eprintln!("compilation failed ({} diagnostics)", diagnostics);
                }
                _ => {}
            }
        }
    });

    let interrupt = cancel_on_interrupt(&service);
    let evaluation = service
        .evaluate_with_progress(&code, language, &cases, tx)
        .await;
    interrupt.abort();
    let _ = progress.await;
    let evaluation = evaluation?;

    println!("{}", serde_json::to_string_pretty(&evaluation_report(&evaluation))?);
    Ok(evaluation.all_passed())
}

fn evaluation_report(evaluation: &Evaluation) -> serde_json::Value {
    let error = match &evaluation.outcome {
        EvaluationOutcome::Fatal(e) => Some(e.to_string()),
        _ => None,
    };

    json!({
        "outcome": evaluation.outcome.as_str(),
        "error": error,
        "summary": evaluation.summary(),
        "cases": evaluation.cases,
        "runs": evaluation.runs,
        "compile_result": evaluation.compile_result,
        "diagnostics": evaluation.diagnostics,
        "finished_at": evaluation.finished_at,
    })
}

/// Print diagnostics extracted from a saved stderr capture as JSON
pub fn diagnose(
    service: &CodeExecutionService,
    language: Language,
    file: &Path,
    stderr_file: &Path,
) -> Result<()> {
    let code = read_file(file)?;
    let error_output = read_file(stderr_file)?;

    let diagnostics = service.diagnostics(language, &error_output, &code)?;
    println!("{}", serde_json::to_string_pretty(&diagnostics)?);
    Ok(())
}

pub fn list_languages(config: &LanguageConfigManager) {
    let limits = config.limits();
    println!(
        "Limits: run {} ms, compile {} ms, output {} bytes, grace {} ms",
        limits.timeout_ms, limits.compile_timeout_ms, limits.output_limit_bytes, limits.grace_period_ms
    );

    for language in config.list_languages() {
        let Some(language_config) = config.get_config(&language) else {
            continue;
        };
        let kind = match language_config.toolchain {
            ToolchainConfig::Compiled { .. } => "compiled",
            ToolchainConfig::Interpreted { .. } => "interpreted",
        };
        let version = if language_config.version.is_empty() {
            "-"
        } else {
            language_config.version.as_str()
        };
        println!(
            "  {:<8} {:<12} {:<8} {}",
            language,
            kind,
            version,
            language_config.toolchain.executable()
        );
    }
}

/// Editor-style rendering: location, source line, underline
fn render_diagnostic(code: &str, diagnostic: &CodeEditorDiagnostic) -> String {
    let source = code
        .lines()
        .nth(diagnostic.line.saturating_sub(1))
        .unwrap_or("")
        .trim_end();
    let marker = match diagnostic.span {
        UnderlineSpan::Line => "~".repeat(source.chars().count().max(1)),
        UnderlineSpan::Columns { start, length } => {
            format!("{}{}", " ".repeat(start.saturating_sub(1)), "^".repeat(length))
        }
    };
    let location = match diagnostic.column {
        Some(column) => format!("{}:{}", diagnostic.line, column),
        None => diagnostic.line.to_string(),
    };

    format!("line {}: {}\n    {}\n    {}", location, diagnostic.message, source, marker)
}
