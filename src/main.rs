use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{self, EnvFilter};

use stresslab::config::Config;
use stresslab::pipeline::{Executor, ParamAnalysis, PassSelection, RunOutcome, WorkflowSpec};
use stresslab::sim::dry_run::DryRunSimulator;
use stresslab::sim::terminal::TerminalSimulator;
use stresslab::sim::{ProgressSink, Simulator};
use stresslab::store::RunStore;
use stresslab::{aggregate, pipeline};

#[derive(Parser)]
#[command(name = "stresslab", about = "Automated robustness studies for expert advisors")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Use the in-memory simulator instead of a real terminal install.
    #[arg(long, global = true)]
    dry_run: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a workflow; runs until the param-analysis pause.
    Run {
        ea_path: PathBuf,
        #[arg(long, default_value = "EURUSD")]
        symbol: String,
        #[arg(long, default_value = "H1")]
        timeframe: String,
    },
    /// Start workflows for several EAs, one after another.
    Batch {
        ea_paths: Vec<PathBuf>,
        #[arg(long, default_value = "EURUSD")]
        symbol: String,
        #[arg(long, default_value = "H1")]
        timeframe: String,
    },
    /// Resume a paused workflow with a parameter-analysis payload (JSON file).
    ResumeParams {
        workflow_id: String,
        payload: PathBuf,
    },
    /// Resume a paused workflow with a pass-selection payload (JSON file).
    ResumePasses {
        workflow_id: String,
        payload: PathBuf,
    },
    /// Restart a workflow from the top after an external EA fix.
    RestartAfterFix { workflow_id: String },
    /// Run child workflows recorded by a parent's multi-pair stage.
    RunChildren { workflow_id: String },
    /// List stored workflows.
    List,
    /// Rebuild the leaderboard and boards index from stored state.
    Leaderboard,
}

/// Progress sink backed by an indicatif spinner.
struct SpinnerProgress {
    bar: ProgressBar,
}

impl SpinnerProgress {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner} {msg}").unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        Self { bar }
    }
}

impl ProgressSink for SpinnerProgress {
    fn update(&self, message: &str) {
        self.bar.set_message(message.to_string());
        self.bar.tick();
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let store = RunStore::new(config.runs_dir.clone());
    let progress: Arc<dyn ProgressSink> = Arc::new(SpinnerProgress::new());
    let simulator = build_simulator(&config, cli.dry_run, &progress)?;

    match cli.command {
        Command::Run {
            ea_path,
            symbol,
            timeframe,
        } => {
            let spec = WorkflowSpec {
                ea_path,
                symbol,
                timeframe,
            };
            let mut executor = Executor::new(
                config,
                store,
                simulator,
                Arc::clone(&progress),
                &spec,
            )?;
            let outcome = executor.run()?;
            report_outcome(executor.state().workflow_id.as_str(), outcome);
        }
        Command::Batch {
            ea_paths,
            symbol,
            timeframe,
        } => {
            let specs: Vec<WorkflowSpec> = ea_paths
                .into_iter()
                .map(|ea_path| WorkflowSpec {
                    ea_path,
                    symbol: symbol.clone(),
                    timeframe: timeframe.clone(),
                })
                .collect();
            let outcomes =
                pipeline::executor::run_batch(&config, &store, &simulator, &progress, &specs)?;
            for (workflow_id, outcome) in outcomes {
                report_outcome(&workflow_id, outcome);
            }
        }
        Command::ResumeParams {
            workflow_id,
            payload,
        } => {
            let payload: ParamAnalysis = read_payload(&payload)?;
            let mut executor =
                Executor::load(config, store, simulator, Arc::clone(&progress), &workflow_id)?;
            let outcome = executor.resume_with_params(payload)?;
            report_outcome(&workflow_id, outcome);
        }
        Command::ResumePasses {
            workflow_id,
            payload,
        } => {
            let payload: PassSelection = read_payload(&payload)?;
            let mut executor =
                Executor::load(config, store, simulator, Arc::clone(&progress), &workflow_id)?;
            let outcome = executor.resume_with_passes(payload)?;
            report_outcome(&workflow_id, outcome);
        }
        Command::RestartAfterFix { workflow_id } => {
            let mut executor =
                Executor::load(config, store, simulator, Arc::clone(&progress), &workflow_id)?;
            let outcome = executor.restart_after_fix()?;
            report_outcome(&workflow_id, outcome);
        }
        Command::RunChildren { workflow_id } => {
            let executor =
                Executor::load(config, store, simulator, Arc::clone(&progress), &workflow_id)?;
            let children = executor.spawn_children()?;
            if children.is_empty() {
                println!("no child workflows recorded for {workflow_id}");
            }
            // Sequential on purpose: the simulator install is single-owner
            for mut child in children {
                let outcome = child.run()?;
                report_outcome(child.state().workflow_id.as_str(), outcome);
            }
        }
        Command::List => {
            for summary in store.list() {
                println!(
                    "{:<44} {:<10} {:<4} {:>6} {:?}",
                    summary.workflow_id,
                    summary.symbol,
                    summary.timeframe,
                    summary
                        .composite_score
                        .map_or_else(|| "-".to_string(), |s| format!("{s:.1}")),
                    summary.status,
                );
            }
        }
        Command::Leaderboard => {
            let leaderboard = aggregate::generate_leaderboard(&store, &config)?;
            let boards = aggregate::generate_boards(&store)?;
            println!("leaderboard: {}", leaderboard.display());
            println!("boards: {}", boards.display());
        }
    }

    Ok(())
}

fn build_simulator(
    config: &Config,
    dry_run: bool,
    progress: &Arc<dyn ProgressSink>,
) -> Result<Arc<dyn Simulator>> {
    if dry_run {
        return Ok(Arc::new(DryRunSimulator::new()));
    }
    let Some(install) = config.terminal() else {
        bail!("no terminal installs configured; add one to the config or pass --dry-run");
    };
    let dates = config.backtest_dates(chrono::Local::now().date_naive());
    Ok(Arc::new(TerminalSimulator::new(
        install.clone(),
        config.tester.clone(),
        dates,
        Arc::clone(progress),
        std::time::Duration::from_secs(config.progress_interval_s),
    )))
}

fn read_payload<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<T> {
    let raw = std::fs::read(path)
        .with_context(|| format!("reading payload {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parsing payload {}", path.display()))
}

fn report_outcome(workflow_id: &str, outcome: RunOutcome) {
    match outcome {
        RunOutcome::Paused(status) => {
            println!("{workflow_id}: paused ({status:?})");
        }
        RunOutcome::Finished(status) => {
            println!("{workflow_id}: finished ({status:?})");
        }
    }
}
