mod classify;
mod config;
mod context;
mod error;
mod mutants;
mod sandbox;
mod session;
mod source;
mod synth;
mod verify;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::session::{ProgressEvent, Session, SessionReport};
use crate::synth::{ModelClient, OllamaClient};

#[derive(Parser)]
#[command(name = "testforge")]
#[command(version)]
#[command(about = "Mutation-guided test generation for Python projects")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Find coverage gaps and generate tests that close them
    Run {
        /// Project root the test command runs from
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Source directory, relative to the project root
        #[arg(long, default_value = "src")]
        source_dir: PathBuf,

        /// Test directory, relative to the project root
        #[arg(long, default_value = "tests")]
        test_dir: PathBuf,

        /// Model API URL (overrides config)
        #[arg(long)]
        model_url: Option<String>,

        /// Model name (overrides config)
        #[arg(long)]
        model: Option<String>,

        /// Test suite command (overrides config)
        #[arg(long)]
        test_command: Option<String>,

        /// Cap on surviving mutants taken through generation
        #[arg(long)]
        max_mutants: Option<usize>,

        /// Wall-clock budget for the whole session, in seconds
        #[arg(long)]
        max_seconds: Option<u64>,

        /// Emit the report as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.general.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            root,
            source_dir,
            test_dir,
            model_url,
            model,
            test_command,
            max_mutants,
            max_seconds,
            json,
        } => {
            if let Some(url) = model_url {
                config.model.url = url;
            }
            if let Some(name) = model {
                config.model.name = name;
            }
            if let Some(command) = test_command {
                config.run.test_command = command;
            }
            if let Some(cap) = max_mutants {
                config.budget.max_mutants = cap;
            }
            if let Some(seconds) = max_seconds {
                config.budget.max_session_seconds = seconds;
            }

            let client = OllamaClient::new(&config.model.url, &config.model.name);
            if !client.is_available().await {
                tracing::warn!(
                    "model endpoint {} is not answering; generation attempts will fail",
                    config.model.url
                );
            }

            let mut session = Session::new(
                &root,
                &source_dir,
                &test_dir,
                config,
                ModelClient::Ollama(client),
            );

            let mut events = session.progress_events();
            let progress_logger = tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match event {
                        ProgressEvent::StateChanged(_) => {}
                        ProgressEvent::ClassificationFinished { killed, survived } => {
                            tracing::info!(
                                "classification finished: {} killed, {} survived",
                                killed,
                                survived
                            );
                        }
                        ProgressEvent::MutantResolved {
                            mutant_id,
                            candidate_id,
                        } => {
                            tracing::info!(
                                "mutant {} resolved by candidate {}",
                                &mutant_id[..12.min(mutant_id.len())],
                                candidate_id
                            );
                        }
                        ProgressEvent::MutantUnresolved { mutant_id } => {
                            tracing::info!(
                                "mutant {} left unresolved (possibly equivalent)",
                                &mutant_id[..12.min(mutant_id.len())]
                            );
                        }
                    }
                }
            });

            let report = session.run().await?;
            progress_logger.abort();

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_summary(&report);
            }
        }
    }

    Ok(())
}

fn print_summary(report: &SessionReport) {
    println!("Mutants:     {} total", report.mutants_total);
    println!(
        "             {} killed, {} survived, {} timed out, {} errored, {} not run",
        report.killed, report.survived, report.timed_out, report.errored, report.pending
    );
    println!(
        "Generation:  {} targeted, {} resolved",
        report.targeted, report.resolved
    );
    if let Some(path) = &report.merged_test_file {
        println!("New tests:   {}", path.display());
    }
    for mutant in report.mutants.iter().filter(|m| {
        m.status == crate::mutants::MutantStatus::Survived && !m.resolved
    }) {
        println!(
            "Unresolved:  {} at {}:{} ({})",
            mutant.operator, mutant.unit_id, mutant.line, mutant.description
        );
    }
    if report.budget_exhausted {
        println!("Note:        session budget was exhausted before all work finished");
    }
    for warning in &report.warnings {
        println!("Warning:     {}", warning);
    }
    println!(
        "Elapsed:     {} ms (completed {})",
        report.elapsed_ms, report.completed_at
    );
}
