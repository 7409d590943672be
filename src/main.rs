use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod agent;
mod commands;
mod config;
mod refine;
mod report;
mod sandbox;
mod session;
mod templates;
mod workspace;

#[derive(Parser)]
#[command(name = "refinery")]
#[command(
    author,
    version,
    about = "Generate code, test it in a sandbox, and refine it until it passes"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project root (defaults to the current directory)
    #[arg(long, global = true, env = "REFINERY_ROOT")]
    root: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write refinery.toml and a runner Dockerfile into the project
    Init {
        /// Force overwrite existing files
        #[arg(short, long)]
        force: bool,
    },

    /// Generate code for a requirement and refine it until tests pass
    Run {
        /// What to build, in plain language
        #[arg(short, long)]
        requirement: String,

        /// Refactor attempts after the first failing run (overrides config and env)
        #[arg(short, long)]
        max_attempts: Option<u32>,

        /// Part of the project the agents work on, relative to the root
        #[arg(long)]
        codebase_path: Option<String>,
    },

    /// Run the test command on existing files in the sandbox
    Exec {
        /// Files or directories to copy into the sandbox (default: the whole project)
        paths: Vec<String>,

        /// Test path to pass to the command (repeatable)
        #[arg(short, long = "test")]
        tests: Vec<String>,

        /// Command to run instead of [sandbox].command
        #[arg(short, long)]
        command: Option<String>,

        /// Report format: pytest or tap
        #[arg(long)]
        format: Option<report::ReportKind>,

        /// Print the raw result and outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the last saved session
    Status,

    /// Remove leftover sandbox containers
    Clean {
        /// Also remove the saved session
        #[arg(long)]
        state: bool,
    },
}

fn init_logging(cli: &Cli) -> Result<Option<WorkerGuard>> {
    let default_filter = if cli.verbose {
        "refinery=debug"
    } else {
        "refinery=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let console = if cli.log_json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    let (file, guard) = match &cli.log_file {
        Some(path) => {
            let name = path
                .file_name()
                .context("--log-file must name a file")?;
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = fmt::layer()
                .json()
                .with_timer(fmt::time::ChronoUtc::rfc_3339())
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();

    Ok(guard)
}

fn exit_code(passed: bool) -> ExitCode {
    if passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli)?;

    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let code = match cli.command {
        Commands::Init { force } => {
            commands::init::run(&root, force)?;
            ExitCode::SUCCESS
        }
        Commands::Run {
            requirement,
            max_attempts,
            codebase_path,
        } => {
            let options = commands::run::RunOptions {
                requirement,
                max_attempts,
                codebase_path,
            };
            exit_code(commands::run::run(&root, options).await?)
        }
        Commands::Exec {
            paths,
            tests,
            command,
            format,
            json,
        } => {
            let options = commands::exec::ExecOptions {
                paths,
                tests,
                command,
                format,
                json,
            };
            exit_code(commands::exec::run(&root, options).await?)
        }
        Commands::Status => {
            commands::status::run(&root)?;
            ExitCode::SUCCESS
        }
        Commands::Clean { state } => {
            commands::clean::run(&root, state).await?;
            ExitCode::SUCCESS
        }
    };

    Ok(code)
}
