//! clausewright - editing feedback for contract template projects
//!
//! `clausewright lsp` runs the language server over stdio.
//! `clausewright check <dir>` validates one template project and prints what it found.

use clap::{Parser, Subcommand};
use clausewright::config::{default_config_path, find_workspace_root, load_config_or_default};
use clausewright::output::{CheckReport, OutputFormat, render_report};
use clausewright::toolchain::ToolchainServices;
use clausewright::{RecordingSink, Validator};
use eyre::{Result, WrapErr};
use owo_colors::OwoColorize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Editing feedback for contract template projects
#[derive(Debug, Parser)]
#[command(name = "clausewright", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the language server over stdio
    Lsp {
        /// Workspace root (default: the one the editor announces)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Path to config file (default: .config/clausewright/config.yaml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Validate a template project once and print its diagnostics
    Check {
        /// Template project directory (the one holding package.json)
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Path to config file (default: .config/clausewright/config.yaml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

fn init_tracing() {
    // stdout carries the LSP protocol, so logs go to stderr.
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("CLAUSEWRIGHT_LOG")
                .unwrap_or_else(|_| EnvFilter::new("clausewright=info,clausewright_core=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    match args.command {
        Command::Lsp { root, config } => clausewright::lsp::run(root, config).await,
        Command::Check {
            dir,
            config,
            format,
        } => {
            let failed = run_check(dir, config, format).await?;
            if failed {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

/// Returns whether any error was found.
async fn run_check(dir: PathBuf, config_path: Option<PathBuf>, format: OutputFormat) -> Result<bool> {
    let dir = dir
        .canonicalize()
        .wrap_err_with(|| format!("Failed to resolve {}", dir.display()))?;
    let config_path = match config_path {
        Some(path) => path,
        None => default_config_path(&find_workspace_root(&dir)),
    };
    let config = load_config_or_default(&config_path);

    let sink = Arc::new(RecordingSink::new());
    let services = Arc::new(ToolchainServices::new(&config.toolchain));
    let validator = Validator::new(&config, services, sink.clone())?;

    let marker = dir.join(&config.conventions.marker_file);
    let root = validator.revalidate(&marker).await;
    if root.is_none() {
        validator.submit(&marker).await;
        eprintln!(
            "{} {} is not a template project (no `{}` with an `{}` key)",
            "!".red().bold(),
            dir.display(),
            config.conventions.marker_file,
            config.conventions.project_key
        );
    }
    validator.wait_idle().await;

    let stages = match &root {
        Some(root) => validator.last_report(root).await,
        None => None,
    };
    let report = CheckReport {
        root: root.unwrap_or(dir),
        stages,
        diagnostics: sink.snapshot(),
    };
    print!("{}", render_report(&report, format));

    Ok(report.error_count() > 0 || report.stages.is_none())
}
