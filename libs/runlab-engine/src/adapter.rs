/// Language Runtime Adapters - source text to a runnable invocation
///
/// **Core Responsibility:**
/// Write the submission into a fresh workspace, compile it when the language
/// needs it, and describe how to run the result.
///
/// **Rules:**
/// - Every prepare gets its own temporary directory; it is removed when the
///   `PreparedProgram` is dropped
/// - Compile failures are results, never errors: the caller sees a non-zero
///   exit and the compiler output prefixed with `Compilation error:`
/// - An argument template without `{source}` gets the source path appended
use crate::config::{LanguageConfig, ToolchainConfig};
use crate::error::ExecutionError;
use crate::supervisor::{Invocation, ProcessSupervisor, RunLimits};
use runlab_common::config::ExecutionLimits;
use runlab_common::types::{ExecutionResult, Language};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub const COMPILATION_ERROR_PREFIX: &str = "Compilation error:";

const WORKSPACE_PREFIX: &str = "runlab-";
const ARTIFACT_NAME: &str = "main";

/// Compilers are chatty; give them more room than the program under test.
const MIN_COMPILER_OUTPUT_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledToolchain {
    compiler: PathBuf,
    compile_args: Vec<String>,
    run_args: Vec<String>,
    source_file: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpretedToolchain {
    interpreter: PathBuf,
    run_args: Vec<String>,
    source_file: String,
}

/// One variant per supported language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeAdapter {
    Swift(CompiledToolchain),
    Python(InterpretedToolchain),
}

/// A workspace holding ready-to-run code
#[derive(Debug)]
pub struct PreparedProgram {
    workspace: TempDir,
    source_path: PathBuf,
    /// Compiled binary, or the source file for interpreted languages
    artifact: PathBuf,
}

impl PreparedProgram {
    pub fn workspace(&self) -> &Path {
        self.workspace.path()
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }
}

#[derive(Debug)]
pub enum Preparation {
    Ready(PreparedProgram),
    /// The program can't run; the result says why (compile error, empty
    /// source, cancelled while compiling ...)
    Rejected(ExecutionResult),
}

impl RuntimeAdapter {
    pub fn from_config(config: &LanguageConfig) -> Result<Self, ExecutionError> {
        let source_file = config.source_file_name();
        match (config.name, &config.toolchain) {
            (
                Language::Swift,
                ToolchainConfig::Compiled {
                    compiler,
                    compile_args,
                    run_args,
                },
            ) => Ok(RuntimeAdapter::Swift(CompiledToolchain {
                compiler: PathBuf::from(compiler),
                compile_args: compile_args.clone(),
                run_args: run_args.clone(),
                source_file,
            })),
            (
                Language::Python,
                ToolchainConfig::Interpreted {
                    interpreter,
                    run_args,
                },
            ) => Ok(RuntimeAdapter::Python(InterpretedToolchain {
                interpreter: PathBuf::from(interpreter),
                run_args: run_args.clone(),
                source_file,
            })),
            (language, _) => Err(ExecutionError::LanguageNotConfigured(language)),
        }
    }

    pub fn language(&self) -> Language {
        match self {
            RuntimeAdapter::Swift(_) => Language::Swift,
            RuntimeAdapter::Python(_) => Language::Python,
        }
    }

    pub fn source_file(&self) -> &str {
        match self {
            RuntimeAdapter::Swift(toolchain) => &toolchain.source_file,
            RuntimeAdapter::Python(toolchain) => &toolchain.source_file,
        }
    }

    /// Write `code` into a new workspace and compile it if needed
    #[instrument(skip(self, code, limits, supervisor, cancel), fields(language = %self.language()))]
    pub async fn prepare(
        &self,
        code: &str,
        limits: &ExecutionLimits,
        supervisor: &ProcessSupervisor,
        cancel: &CancellationToken,
    ) -> Result<Preparation, ExecutionError> {
        if code.trim().is_empty() {
            return Ok(Preparation::Rejected(ExecutionResult::failure(
                "Source code is empty",
            )));
        }
        if code.len() > limits.max_source_bytes {
            return Ok(Preparation::Rejected(ExecutionResult::failure(format!(
                "Source code exceeds maximum size of {} bytes",
                limits.max_source_bytes
            ))));
        }
        if cancel.is_cancelled() {
            return Ok(Preparation::Rejected(ExecutionResult::cancelled()));
        }

        let workspace = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir()
            .map_err(ExecutionError::Workspace)?;
        let source_path = workspace.path().join(self.source_file());
        tokio::fs::write(&source_path, code)
            .await
            .map_err(ExecutionError::Workspace)?;

        debug!(
            workspace = %workspace.path().display(),
            source_bytes = code.len(),
            "Wrote source to workspace"
        );

        match self {
            RuntimeAdapter::Python(_) => Ok(Preparation::Ready(PreparedProgram {
                workspace,
                artifact: source_path.clone(),
                source_path,
            })),
            RuntimeAdapter::Swift(toolchain) => {
                toolchain
                    .compile(workspace, source_path, limits, supervisor, cancel)
                    .await
            }
        }
    }

    /// How to run a prepared program
    pub fn invocation(&self, program: &PreparedProgram) -> Invocation {
        let workdir = program.workspace();
        match self {
            RuntimeAdapter::Swift(toolchain) => Invocation {
                program: program.artifact.clone(),
                args: expand_args(&toolchain.run_args, &program.source_path, &program.artifact, workdir, false),
                working_dir: workdir.to_path_buf(),
            },
            RuntimeAdapter::Python(toolchain) => Invocation {
                program: toolchain.interpreter.clone(),
                args: expand_args(&toolchain.run_args, &program.source_path, &program.artifact, workdir, true),
                working_dir: workdir.to_path_buf(),
            },
        }
    }
}

impl CompiledToolchain {
    async fn compile(
        &self,
        workspace: TempDir,
        source_path: PathBuf,
        limits: &ExecutionLimits,
        supervisor: &ProcessSupervisor,
        cancel: &CancellationToken,
    ) -> Result<Preparation, ExecutionError> {
        let artifact = workspace.path().join(ARTIFACT_NAME);
        let invocation = Invocation {
            program: self.compiler.clone(),
            args: expand_args(&self.compile_args, &source_path, &artifact, workspace.path(), true),
            working_dir: workspace.path().to_path_buf(),
        };
        let compile_limits = RunLimits {
            timeout: limits.compile_timeout(),
            output_limit: limits.output_limit_bytes.max(MIN_COMPILER_OUTPUT_BYTES),
        };

        info!(compiler = %self.compiler.display(), "Compiling");
        let result = supervisor
            .run(&invocation, "", compile_limits, cancel, None)
            .await?;

        if result.was_cancelled() || result.timed_out() {
            warn!(outcome = ?result.outcome(), "Compilation did not finish");
            return Ok(Preparation::Rejected(result));
        }

        if !result.is_success() {
            info!(exit_code = result.exit_code(), "Compilation failed");
            return Ok(Preparation::Rejected(compile_failure(&result)));
        }

        if !artifact.exists() {
            warn!(artifact = %artifact.display(), "Compiler succeeded without producing an executable");
            return Ok(Preparation::Rejected(ExecutionResult::failure(format!(
                "{COMPILATION_ERROR_PREFIX}\ncompiler produced no executable"
            ))));
        }

        debug!(compile_ms = result.execution_time_ms(), "Compilation succeeded");
        Ok(Preparation::Ready(PreparedProgram {
            workspace,
            source_path,
            artifact,
        }))
    }
}

/// Compiler diagnostics normally arrive on stderr, but some toolchains print
/// to stdout; keep both.
fn compile_failure(result: &ExecutionResult) -> ExecutionResult {
    let mut details = result.error().trim_end().to_string();
    let stdout = result.output().trim_end();
    if !stdout.is_empty() {
        if !details.is_empty() {
            details.push('\n');
        }
        details.push_str(stdout);
    }

    let exit_code = match result.exit_code() {
        0 => 1,
        code => code,
    };

    ExecutionResult::exited(
        String::new(),
        format!("{COMPILATION_ERROR_PREFIX}\n{details}"),
        exit_code,
    )
    .with_elapsed(result.execution_time_ms())
}

fn expand_args(
    templates: &[String],
    source: &Path,
    output: &Path,
    workdir: &Path,
    needs_source: bool,
) -> Vec<String> {
    let source_str = source.to_string_lossy();
    let output_str = output.to_string_lossy();
    let workdir_str = workdir.to_string_lossy();

    let mut args: Vec<String> = templates
        .iter()
        .map(|arg| {
            arg.replace("{source}", &source_str)
                .replace("{output}", &output_str)
                .replace("{workdir}", &workdir_str)
        })
        .collect();

    if needs_source && !templates.iter().any(|arg| arg.contains("{source}")) {
        args.push(source_str.into_owned());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn python_adapter() -> RuntimeAdapter {
        RuntimeAdapter::from_config(&LanguageConfig::default_for(Language::Python)).unwrap()
    }

    #[test]
    fn test_expand_args_substitutes_placeholders() {
        let args = expand_args(
            &["-o".to_string(), "{output}".to_string(), "{source}".to_string(), "-I{workdir}".to_string()],
            Path::new("/tmp/ws/main.swift"),
            Path::new("/tmp/ws/main"),
            Path::new("/tmp/ws"),
            true,
        );
        assert_eq!(args, vec!["-o", "/tmp/ws/main", "/tmp/ws/main.swift", "-I/tmp/ws"]);
    }

    #[test]
    fn test_expand_args_appends_missing_source() {
        let args = expand_args(&["-u".to_string()], Path::new("/w/main.py"), Path::new("/w/main.py"), Path::new("/w"), true);
        assert_eq!(args, vec!["-u", "/w/main.py"]);

        let args = expand_args(&[], Path::new("/w/main.swift"), Path::new("/w/main"), Path::new("/w"), false);
        assert!(args.is_empty());
    }

    #[test]
    fn test_from_config_rejects_kind_mismatch() {
        let mut config = LanguageConfig::default_for(Language::Swift);
        config.toolchain = ToolchainConfig::Interpreted {
            interpreter: "/usr/bin/swift".to_string(),
            run_args: Vec::new(),
        };

        assert!(matches!(
            RuntimeAdapter::from_config(&config),
            Err(ExecutionError::LanguageNotConfigured(Language::Swift))
        ));
    }

    #[test]
    fn test_compile_failure_keeps_exit_and_prefixes_output() {
        let result = ExecutionResult::exited(
            "note: from stdout\n".to_string(),
            "main.swift:1:1: error: boom\n".to_string(),
            1,
        );
        let failure = compile_failure(&result);

        assert_eq!(failure.exit_code(), 1);
        assert!(failure.output().is_empty());
        assert_eq!(
            failure.error(),
            "Compilation error:\nmain.swift:1:1: error: boom\nnote: from stdout"
        );
    }

    #[tokio::test]
    async fn test_prepare_rejects_empty_source() {
        let adapter = python_adapter();
        let supervisor = ProcessSupervisor::default();

        let preparation = adapter
            .prepare("  \n", &ExecutionLimits::default(), &supervisor, &CancellationToken::new())
            .await
            .unwrap();

        match preparation {
            Preparation::Rejected(result) => {
                assert!(!result.is_success());
                assert_eq!(result.error(), "Source code is empty");
            }
            Preparation::Ready(_) => panic!("empty source must not be runnable"),
        }
    }

    #[tokio::test]
    async fn test_prepare_rejects_oversized_source() {
        let adapter = python_adapter();
        let limits = ExecutionLimits {
            max_source_bytes: 8,
            ..ExecutionLimits::default()
        };

        let preparation = adapter
            .prepare("print('too long')", &limits, &ProcessSupervisor::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(preparation, Preparation::Rejected(r) if r.error().contains("maximum size")));
    }

    #[tokio::test]
    async fn test_prepare_interpreted_writes_source_and_cleans_up() {
        let adapter = python_adapter();
        let preparation = adapter
            .prepare(
                "print('hi')\n",
                &ExecutionLimits::default(),
                &ProcessSupervisor::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let Preparation::Ready(program) = preparation else {
            panic!("interpreted source should be ready without a compile step");
        };
        let workspace = program.workspace().to_path_buf();
        assert_eq!(std::fs::read_to_string(program.source_path()).unwrap(), "print('hi')\n");

        let invocation = adapter.invocation(&program);
        assert_eq!(invocation.program, PathBuf::from("/usr/bin/python3"));
        assert_eq!(
            invocation.args,
            vec!["-u".to_string(), program.source_path().to_string_lossy().into_owned()]
        );
        assert_eq!(invocation.working_dir, workspace);

        drop(program);
        assert!(!workspace.exists());
    }

    #[tokio::test]
    async fn test_prepare_after_cancel_is_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let preparation = python_adapter()
            .prepare("print(1)", &ExecutionLimits::default(), &ProcessSupervisor::default(), &cancel)
            .await
            .unwrap();

        assert!(matches!(preparation, Preparation::Rejected(r) if r.was_cancelled()));
    }
}
