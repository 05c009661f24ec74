//! Autonomous worker supervisor.
//!
//! Runs a worker command in loops against a project (`warden run`) or across
//! a dependency graph of repos (`warden orchestrate run`), guarded by a
//! circuit breaker and a retry engine. State lives under `.warden/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use warden::circuit::CircuitBreakerService;
use warden::core::classifier::KeywordClassifier;
use warden::exit_codes;
use warden::io::config::{WardenConfig, load_config};
use warden::io::init::{InitOptions, WardenPaths, init_warden};
use warden::io::store::FileStore;
use warden::io::worker::CommandWorker;
use warden::logging;
use warden::orchestrate::{
    OrchestrationRequest, orchestration_status, run_orchestration, unblock, validate_orchestration,
};
use warden::retry::{RetryEngine, ThreadSleeper};
use warden::supervise::{Job, SuperviseStop, supervise};

#[derive(Parser)]
#[command(
    name = "warden",
    version,
    about = "Supervise an autonomous worker with retries and a circuit breaker"
)]
struct Cli {
    /// Project root containing `.warden/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    /// Debug-level diagnostics on stderr (overridden by `RUST_LOG`).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.warden/` with a default config and prompt.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Run the worker against the project until it completes or is stopped.
    Run {
        /// Override `supervise.max_loops` from the config.
        #[arg(long)]
        max_loops: Option<u32>,
    },
    /// Inspect or reset the retry table.
    #[command(subcommand)]
    Retry(RetryCommand),
    /// Inspect or reset the circuit breaker.
    #[command(subcommand)]
    Circuit(CircuitCommand),
    /// Schedule jobs across several repos in dependency order.
    #[command(subcommand)]
    Orchestrate(OrchestrateCommand),
}

#[derive(Subcommand)]
enum RetryCommand {
    /// Print tracked error signatures and attempt counts.
    Status,
    /// Forget every tracked error signature.
    Reset,
}

#[derive(Subcommand)]
enum CircuitCommand {
    /// Print the breaker state and counters.
    Status,
    /// Force the breaker closed and clear its counters.
    Reset {
        #[arg(long, default_value = "manual reset")]
        reason: String,
    },
}

#[derive(Subcommand)]
enum OrchestrateCommand {
    /// Check a repo declaration and print the execution order.
    Validate { config: PathBuf },
    /// Run every repo's job in dependency order.
    Run {
        config: PathBuf,
        /// Ignore persisted progress and start over.
        #[arg(long)]
        fresh: bool,
    },
    /// Print per-repo status of the last orchestration.
    Status,
    /// Return a blocked repo to pending.
    Unblock { name: String },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let paths = WardenPaths::new(&cli.root);
    match cli.command {
        Command::Init { force } => cmd_init(&cli.root, force),
        Command::Run { max_loops } => cmd_run(&paths, max_loops),
        Command::Retry(command) => cmd_retry(&paths, command),
        Command::Circuit(command) => cmd_circuit(&paths, command),
        Command::Orchestrate(command) => cmd_orchestrate(&paths, command),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_warden(root, &InitOptions { force })?;
    println!("initialized {}", paths.warden_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_run(paths: &WardenPaths, max_loops: Option<u32>) -> Result<i32> {
    let mut config = load(paths)?;
    if let Some(max_loops) = max_loops {
        config.supervise.max_loops = max_loops;
        config.validate()?;
    }
    let task = fs::read_to_string(&paths.prompt_path)
        .with_context(|| format!("read {}", paths.prompt_path.display()))?;

    let store = FileStore::for_paths(paths);
    let engine = RetryEngine::new(&store, &ThreadSleeper, config.retry);
    let breaker = CircuitBreakerService::new(&store, config.circuit);
    let worker = CommandWorker::new(config.worker.clone())?;
    let job = Job {
        name: None,
        workdir: &paths.root,
        task: &task,
    };

    let outcome = supervise(
        &job,
        &worker,
        &KeywordClassifier,
        &engine,
        &breaker,
        &config.supervise,
        |report| {
            let action = report.action.as_ref().map_or("-", |action| action.as_str());
            eprintln!(
                "loop {}: files_changed={} action={}",
                report.outcome.loop_number, report.outcome.files_changed, action
            );
            if let Some(transition) = &report.transition {
                eprintln!(
                    "  circuit {} -> {}: {}",
                    transition.from_state, transition.to_state, transition.reason
                );
            }
        },
    )?;

    println!(
        "{} after {} loops (${:.2})",
        outcome.stop.describe(),
        outcome.loops,
        outcome.cost_usd
    );
    Ok(match outcome.stop {
        SuperviseStop::Completed => exit_codes::OK,
        SuperviseStop::CircuitOpen { .. } => exit_codes::CIRCUIT_OPEN,
        SuperviseStop::Escalated { .. } | SuperviseStop::MaxLoops { .. } => exit_codes::HALTED,
    })
}

fn cmd_retry(paths: &WardenPaths, command: RetryCommand) -> Result<i32> {
    let config = load(paths)?;
    let store = FileStore::for_paths(paths);
    let engine = RetryEngine::new(&store, &ThreadSleeper, config.retry);
    match command {
        RetryCommand::Status => {
            let table = engine.table()?;
            if table.signatures.is_empty() {
                println!("no tracked errors");
            }
            for (signature, state) in &table.signatures {
                println!(
                    "{signature}  {}  attempts={}  last_loop={}",
                    state.category, state.attempt_count, state.last_loop
                );
            }
        }
        RetryCommand::Reset => {
            engine.reset_retry_state()?;
            println!("retry state cleared");
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_circuit(paths: &WardenPaths, command: CircuitCommand) -> Result<i32> {
    let config = load(paths)?;
    let store = FileStore::for_paths(paths);
    let breaker = CircuitBreakerService::new(&store, config.circuit);
    match command {
        CircuitCommand::Status => {
            let status = breaker.status()?;
            println!("state: {}", status.state);
            println!("loop: {}", status.current_loop);
            println!("consecutive_no_progress: {}", status.consecutive_no_progress);
            println!("consecutive_same_error: {}", status.consecutive_same_error);
            println!("output_decline_pct: {}", status.output_decline_pct);
            println!(
                "consecutive_permission_denials: {}",
                status.consecutive_permission_denials
            );
            if let Some(reason) = &status.last_transition_reason {
                println!("last_transition: {reason}");
            }
        }
        CircuitCommand::Reset { reason } => {
            let transition = breaker.reset(&reason, Utc::now())?;
            println!("circuit {} -> {}", transition.from_state, transition.to_state);
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_orchestrate(paths: &WardenPaths, command: OrchestrateCommand) -> Result<i32> {
    match command {
        OrchestrateCommand::Validate { config } => {
            let (_, order) = validate_orchestration(&config)?;
            for (index, name) in order.iter().enumerate() {
                println!("{}. {name}", index + 1);
            }
            Ok(exit_codes::OK)
        }
        OrchestrateCommand::Run { config, fresh } => {
            let settings = load(paths)?;
            let task = fs::read_to_string(&paths.prompt_path)
                .with_context(|| format!("read {}", paths.prompt_path.display()))?;
            let worker = CommandWorker::new(settings.worker.clone())?;
            let request = OrchestrationRequest {
                root: &paths.root,
                repo_config: &config,
                task: &task,
                config: &settings,
                fresh,
            };
            let report = run_orchestration(
                &request,
                &worker,
                &KeywordClassifier,
                &ThreadSleeper,
                |event| match (&event.repo, &event.detail) {
                    (Some(repo), Some(detail)) => {
                        eprintln!("{:?} {repo}: {detail}", event.event);
                    }
                    (Some(repo), None) => eprintln!("{:?} {repo}", event.event),
                    (None, Some(detail)) => eprintln!("{:?}: {detail}", event.event),
                    (None, None) => eprintln!("{:?}", event.event),
                },
            )?;
            print_repos(&report.state);
            let waiting = report.waiting();
            if !waiting.is_empty() {
                println!("waiting on blocked dependencies: {}", waiting.join(", "));
            }
            Ok(if report.all_completed() {
                exit_codes::OK
            } else {
                exit_codes::BLOCKED
            })
        }
        OrchestrateCommand::Status => {
            let store = FileStore::for_paths(paths);
            match orchestration_status(&store)? {
                Some(state) => print_repos(&state),
                None => println!("no orchestration state"),
            }
            Ok(exit_codes::OK)
        }
        OrchestrateCommand::Unblock { name } => {
            let settings = load(paths)?;
            unblock(&paths.root, &name, &settings)?;
            println!("{name} unblocked");
            Ok(exit_codes::OK)
        }
    }
}

fn print_repos(state: &warden::core::orchestration::OrchestrationState) {
    let summary = state.summary();
    for (name, repo) in &state.repos {
        match &repo.block_reason {
            Some(reason) => println!("{name}: {} ({reason})", repo.status),
            None => println!(
                "{name}: {} ({} loops, ${:.2})",
                repo.status, repo.loops, repo.cost_usd
            ),
        }
    }
    println!(
        "{}/{} completed, {} blocked, total ${:.2}",
        summary.completed, summary.total, summary.blocked, summary.total_cost_usd
    );
}

fn load(paths: &WardenPaths) -> Result<WardenConfig> {
    load_config(&paths.config_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["warden", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
        assert_eq!(cli.root, PathBuf::from("."));
    }

    #[test]
    fn parse_run_with_global_flags() {
        let cli = Cli::parse_from(["warden", "run", "--max-loops", "5", "--root", "/tmp/x", "-v"]);
        assert!(matches!(
            cli.command,
            Command::Run {
                max_loops: Some(5)
            }
        ));
        assert_eq!(cli.root, PathBuf::from("/tmp/x"));
        assert!(cli.verbose);
    }

    #[test]
    fn parse_orchestrate_run_fresh() {
        let cli = Cli::parse_from(["warden", "orchestrate", "run", "repos.json", "--fresh"]);
        match cli.command {
            Command::Orchestrate(OrchestrateCommand::Run { config, fresh }) => {
                assert_eq!(config, PathBuf::from("repos.json"));
                assert!(fresh);
            }
            _ => panic!("expected orchestrate run"),
        }
    }

    #[test]
    fn parse_circuit_reset_default_reason() {
        let cli = Cli::parse_from(["warden", "circuit", "reset"]);
        match cli.command {
            Command::Circuit(CircuitCommand::Reset { reason }) => {
                assert_eq!(reason, "manual reset");
            }
            _ => panic!("expected circuit reset"),
        }
    }
}
