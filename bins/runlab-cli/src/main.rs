mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use runlab_common::types::Language;
use runlab_engine::{CodeExecutionService, LanguageConfigManager};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;

#[derive(Parser)]
#[command(name = "runlab")]
#[command(about = "RunLab - compile, run and grade code submissions locally", long_about = None)]
struct Cli {
    /// Language config file (defaults to $RUNLAB_LANGUAGES, then config/languages.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log as JSON
    #[arg(long, global = true, default_value = "false")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile if needed and run a program once
    Run {
        /// Language (swift, python)
        #[arg(short, long)]
        lang: Language,

        /// Source file
        #[arg(short, long)]
        file: PathBuf,

        /// File fed to the program's stdin
        #[arg(short, long)]
        input_file: Option<PathBuf>,

        /// Print output while the program runs
        #[arg(long, default_value = "false")]
        stream: bool,
    },

    /// Grade a program against test cases
    Submit {
        /// Language (swift, python)
        #[arg(short, long)]
        lang: Language,

        /// Source file
        #[arg(short, long)]
        file: PathBuf,

        /// JSON array of {"input", "expected_output"}
        #[arg(short, long)]
        cases: PathBuf,
    },

    /// Extract editor diagnostics from saved error output
    Diagnose {
        /// Language (swift, python)
        #[arg(short, long)]
        lang: Language,

        /// Source file the errors refer to
        #[arg(short, long)]
        file: PathBuf,

        /// Captured compiler or interpreter stderr
        #[arg(short, long)]
        stderr_file: PathBuf,
    },

    /// List configured languages and limits
    Languages,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = match &cli.config {
        Some(path) => LanguageConfigManager::load(path),
        None => LanguageConfigManager::load_default(),
    }
    .map_err(|e| {
        error!("Failed to load language configurations: {:#}", e);
        e
    })?;

    let success = match cli.command {
        Commands::Languages => {
            commands::list_languages(&config);
            true
        }
        Commands::Diagnose {
            lang,
            file,
            stderr_file,
        } => {
            let service = CodeExecutionService::new(config)?;
            commands::diagnose(&service, lang, &file, &stderr_file)?;
            true
        }
        Commands::Run {
            lang,
            file,
            input_file,
            stream,
        } => {
            let service = Arc::new(CodeExecutionService::new(config)?);
            commands::run_program(service, lang, &file, input_file.as_deref(), stream).await?
        }
        Commands::Submit { lang, file, cases } => {
            let service = Arc::new(CodeExecutionService::new(config)?);
            commands::submit(service, lang, &file, &cases).await?
        }
    };

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

/// Logs go to stderr; stdout is reserved for program output and reports
fn init_tracing(json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
