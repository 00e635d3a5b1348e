//! Fleet orchestrator CLI.
//!
//! Runs an agent over many repositories at once: each repository is
//! preflighted, planned by an agent session, validated by guardrails, and
//! only then mutated by the orchestrator itself.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleet::core::preflight::Verdict;
use fleet::core::types::{ExecMode, PushPolicy, TaskKind};
use fleet::error::FleetError;
use fleet::exit_codes;
use fleet::io::config::{FleetConfig, load_config};
use fleet::io::session::tmux::TmuxDriver;
use fleet::io::signals::{self, Interrupt};
use fleet::preflight::inspect_all;
use fleet::run::{self, RunOptions, UsageError};

const DEFAULT_STATE_DIR: &str = ".fleet";

#[derive(Parser)]
#[command(
    name = "fleet",
    version,
    about = "Run a coding agent across a fleet of git repositories, safely"
)]
struct Cli {
    /// More log output (-v info, -vv debug). `RUST_LOG` overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct StateArgs {
    /// State directory (checkpoint, queue, ledger, audit trail).
    #[arg(long, value_name = "DIR")]
    state_dir: Option<PathBuf>,
    /// Config file (default: `<state-dir>/config.toml`).
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Process repositories: preflight, plan, validate, execute.
    Run {
        /// Repository paths.
        repos: Vec<PathBuf>,
        /// File with one repository path per line (`#` comments allowed).
        #[arg(long, value_name = "FILE")]
        repos_file: Option<PathBuf>,
        #[arg(long)]
        task: Option<TaskKind>,
        #[arg(long)]
        mode: Option<ExecMode>,
        /// Concurrent workers.
        #[arg(short = 'j', long = "parallel", value_name = "N")]
        parallel: Option<usize>,
        #[arg(long)]
        push: Option<PushPolicy>,
        /// Continue the unfinished run in the state directory.
        #[arg(long, conflicts_with = "restart")]
        resume: bool,
        /// Discard the unfinished run and start over.
        #[arg(long)]
        restart: bool,
        #[command(flatten)]
        state: StateArgs,
    },
    /// Report whether each repository is safe to process, without agents.
    Preflight {
        repos: Vec<PathBuf>,
        #[command(flatten)]
        state: StateArgs,
    },
    /// Show the checkpoint and backoff state.
    Status {
        #[command(flatten)]
        state: StateArgs,
    },
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                exit(exit_codes::INVALID_ARGS)
            } else {
                exit(exit_codes::OK)
            };
        }
    };
    fleet::logging::init(cli.verbose);
    match dispatch(cli.command) {
        Ok(code) => exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            exit(error_code(&err))
        }
    }
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn error_code(err: &anyhow::Error) -> i32 {
    if err.chain().any(|cause| cause.downcast_ref::<UsageError>().is_some()) {
        return exit_codes::INVALID_ARGS;
    }
    match FleetError::find(err) {
        Some(FleetError::DependencyMissing(_)) => exit_codes::DEPENDENCY_MISSING,
        Some(FleetError::Interrupted) => exit_codes::INTERRUPTED,
        _ => exit_codes::PARTIAL_FAILURE,
    }
}

fn dispatch(command: Command) -> Result<i32> {
    match command {
        Command::Run {
            repos,
            repos_file,
            task,
            mode,
            parallel,
            push,
            resume,
            restart,
            state,
        } => {
            let mut config = load(&state)?;
            if let Some(task) = task {
                config.task = task;
            }
            if let Some(mode) = mode {
                config.mode = mode;
            }
            if let Some(parallel) = parallel {
                config.parallelism = parallel;
            }
            if let Some(push) = push {
                config.push = push;
            }
            config
                .validate()
                .map_err(|err| UsageError(format!("{err:#}")))?;

            let mut repos = repos;
            if let Some(file) = repos_file {
                repos.extend(read_repos_file(&file)?);
            }
            let options = RunOptions {
                repos,
                resume,
                restart,
                dequeue_delay: None,
            };
            cmd_run(&config, &options)
        }
        Command::Preflight { repos, state } => {
            let config = load(&state)?;
            cmd_preflight(&config, &repos)
        }
        Command::Status { state } => {
            let config = load(&state)?;
            print!("{}", run::status(&config.state_dir, &config.lock.shared())?);
            Ok(exit_codes::OK)
        }
    }
}

/// Load the config file; `--state-dir` beats the file's `state_dir`.
fn load(state: &StateArgs) -> Result<FleetConfig> {
    let state_dir = state
        .state_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));
    let path = state
        .config
        .clone()
        .unwrap_or_else(|| state_dir.join("config.toml"));
    if state.config.is_some() && !path.exists() {
        return Err(UsageError(format!("config file {} not found", path.display())).into());
    }
    let mut config = load_config(&path)?;
    if state.state_dir.is_some() || config.state_dir.as_os_str().is_empty() {
        config.state_dir = state_dir;
    }
    Ok(config)
}

fn read_repos_file(path: &Path) -> Result<Vec<PathBuf>> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(PathBuf::from)
        .collect())
}

fn cmd_run(config: &FleetConfig, options: &RunOptions) -> Result<i32> {
    let interrupt = Interrupt::default();
    signals::install(&interrupt)?;
    let driver = TmuxDriver::new(&config.agent);
    let summary = run::execute(config, options, &driver, &interrupt)?;
    print!("{}", run::render_summary(&summary));
    Ok(summary.exit_code())
}

fn cmd_preflight(config: &FleetConfig, repos: &[PathBuf]) -> Result<i32> {
    if repos.is_empty() {
        return Err(UsageError("no repositories given".into()).into());
    }
    let mut all_safe = true;
    for (target, inspection) in inspect_all(repos, config) {
        match inspection {
            Ok(inspection) => match inspection.verdict {
                Verdict::Safe => println!("safe     {}", target.id),
                Verdict::Unsafe {
                    reason,
                    detail,
                    remediation,
                } => {
                    all_safe = false;
                    println!("unsafe   {}  [{reason}] {detail}", target.id);
                    if let Some(hint) = remediation {
                        println!("         fix: {hint}");
                    }
                }
            },
            Err(err) => {
                all_safe = false;
                println!("error    {}  {err:#}", target.id);
            }
        }
    }
    Ok(if all_safe {
        exit_codes::OK
    } else {
        exit_codes::PARTIAL_FAILURE
    })
}
