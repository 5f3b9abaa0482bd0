//! Sequential pipeline orchestrator for coding agents.
//!
//! Reads `.pilot/pipeline.toml`, prepares a work branch, and runs the
//! pipeline steps in order. Progress survives interruption: re-running skips
//! completed steps, and `--from` restarts at a named step.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing::debug;

use pilot::cancel::CancelToken;
use pilot::core::runtime::RuntimeContext;
use pilot::engine::Engine;
use pilot::error::{is_cancelled, is_security_violation};
use pilot::exit_codes;
use pilot::io::config::{DEFAULT_CONFIG_PATH, PilotConfig, PilotPaths, load_config};
use pilot::io::doctor;
use pilot::io::git::{Git, derive_branch_name, diff_command};
use pilot::io::session::Session;
use pilot::logging;

const DEFAULT_DEBUG_WIDTH: usize = 80;
const DEFAULT_INPUT_FILE: &str = "input.md";

#[derive(Parser, Debug)]
#[command(
    name = "pilot",
    version,
    about = "Sequential pipeline orchestrator for coding agents"
)]
struct Cli {
    /// Pipeline definition file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute the pipeline, skipping steps completed by an earlier run.
    Run(RunArgs),
    /// Load and validate the pipeline definition.
    Validate,
    /// Print the pipeline step tree with resolved agent settings.
    Steps,
    /// List named agents from the pipeline file and the agent library.
    Agents,
    /// Check the config, task directory, repository and agent tools.
    Doctor,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Start at this top-level step; earlier steps are ignored.
    #[arg(long = "from", value_name = "STEP")]
    from_step: Option<String>,

    /// Branch to create when starting on the default branch.
    #[arg(long, conflicts_with = "no_branch")]
    branch: Option<String>,

    /// Run on the current branch without creating one.
    #[arg(long)]
    no_branch: bool,

    /// Log template variables before each step, truncated to WIDTH characters (0 = full).
    #[arg(long, value_name = "WIDTH", num_args = 0..=1)]
    debug: Option<Option<usize>>,

    /// Print what would run without executing anything.
    #[arg(long)]
    dry_run: bool,
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match dispatch(cli) {
        Ok(()) => exit_codes::OK,
        Err(err) => report(&err),
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => cmd_run(&cli.config, args),
        Command::Validate => cmd_validate(&cli.config),
        Command::Steps => cmd_steps(&cli.config),
        Command::Agents => cmd_agents(&cli.config),
        Command::Doctor => cmd_doctor(&cli.config),
    }
}

fn report(err: &anyhow::Error) -> i32 {
    if is_cancelled(err) {
        eprintln!("pilot: cancelled");
        return exit_codes::CANCELLED;
    }
    eprintln!("pilot: {err:#}");
    if is_security_violation(err) {
        exit_codes::SECURITY
    } else {
        exit_codes::FAILED
    }
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    println!("✓ Valid: {} steps", config.pipeline.len());
    Ok(())
}

fn cmd_steps(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let paths = PilotPaths::locate(config_path)?;
    for line in config.describe_steps(Some(&paths.config_dir)) {
        println!("{line}");
    }
    Ok(())
}

fn cmd_agents(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    for line in config.describe_agents() {
        println!("{line}");
    }
    Ok(())
}

fn cmd_doctor(config_path: &Path) -> Result<()> {
    let checks = doctor::run_checks(config_path, |program| which::which(program).is_ok());
    println!("pilot doctor");
    for check in &checks {
        println!("{}", check.render());
    }
    let failed = checks.iter().filter(|check| !check.ok).count();
    if failed > 0 {
        bail!("{failed} of {} checks failed", checks.len());
    }
    Ok(())
}

fn cmd_run(config_path: &Path, args: RunArgs) -> Result<()> {
    let config = load_config(config_path)?;
    let paths = PilotPaths::locate(config_path)?;
    let git = Git::new(&paths.project_dir);
    let default_branch = git.default_branch();
    let started = Utc::now().timestamp();

    let runtime = RuntimeContext {
        project_dir: paths.project_dir.clone(),
        config_dir: paths.config_dir.clone(),
        session_dir: paths.session_dir.clone(),
        progress_path: paths.session_dir.join(format!("progress-{started}.log")),
        diff_command: diff_command(&default_branch),
        default_branch: default_branch.clone(),
        debug: debug_width(
            args.debug,
            env::var("PILOT_DEBUG").ok(),
            env::var("PILOT_DEBUG_TRUNCATE").ok(),
        ),
        ..RuntimeContext::default()
    };
    let input_path = paths.config_dir.join(
        config
            .inputs
            .get("input_file")
            .map_or(DEFAULT_INPUT_FILE, String::as_str),
    );
    let branch = resolve_branch(&git, &args, &default_branch, &input_path, started);

    if args.dry_run {
        print_dry_run(&git, &config, &paths, branch.as_deref(), &default_branch);
        return Ok(());
    }

    fs::create_dir_all(&paths.session_dir)
        .with_context(|| format!("create session dir {}", paths.session_dir.display()))?;
    let branch = prepare_branch(&git, &paths.session_dir, branch, &default_branch)?;

    println!();
    println!("  branch: {}", branch.as_deref().unwrap_or(&default_branch));
    println!("  progress: {}", runtime.progress_path.display());
    println!(
        "  pipeline: {} steps, delay={}ms",
        config.pipeline.len(),
        config.iteration_delay_ms
    );
    println!();

    let cancel = CancelToken::new();
    install_interrupt_handler(&cancel)?;

    let mut engine = Engine::new(config, runtime, cancel)?;
    match args.from_step {
        Some(step) => engine.resume_from(&step),
        None => engine.run(),
    }
}

/// Branch the run should use; `None` disables branching (`--no-branch`, or
/// not a git checkout). An existing feature branch is kept as is.
fn resolve_branch(
    git: &Git,
    args: &RunArgs,
    default_branch: &str,
    input_path: &Path,
    unix_secs: i64,
) -> Option<String> {
    if args.no_branch {
        return None;
    }
    let current = git.current_branch()?;
    if current != default_branch {
        return Some(current);
    }
    if let Some(branch) = &args.branch {
        return Some(branch.clone());
    }
    Some(derive_branch_name(input_path, unix_secs))
}

/// Create the branch when still on the default branch and record it in the
/// session. A failed checkout is reported and the run stays where it is.
fn prepare_branch(
    git: &Git,
    session_dir: &Path,
    branch: Option<String>,
    default_branch: &str,
) -> Result<Option<String>> {
    let Some(branch) = branch else {
        return Ok(None);
    };
    let mut session = Session::load(session_dir)?;
    if git.current_branch().as_deref() == Some(default_branch) {
        if let Err(err) = git.checkout_new_branch(&branch) {
            eprintln!("Warning: could not create branch '{branch}': {err:#}");
            return Ok(git.current_branch());
        }
        debug!(branch = %branch, "created work branch");
    }
    session.set_branch(&branch)?;
    Ok(Some(branch))
}

fn print_dry_run(
    git: &Git,
    config: &PilotConfig,
    paths: &PilotPaths,
    branch: Option<&str>,
    default_branch: &str,
) {
    println!("Dry run — steps that would execute:\n");
    match branch {
        Some(branch) if git.current_branch().as_deref() == Some(branch) && branch != default_branch => {
            println!("Branch: {branch} (already on feature branch)");
        }
        Some(branch) => println!("Branch: {branch} (will create)"),
        None => println!("Branch: disabled"),
    }
    println!();
    if !config.inputs.is_empty() {
        println!("Inputs:");
        for (name, value) in &config.inputs {
            println!("  {name}: {value}");
        }
    }
    println!(
        "Defaults: tool={} model={} retry={}",
        config.defaults.tool, config.defaults.model, config.defaults.retry
    );
    if !config.error_patterns.is_empty() {
        println!("Error patterns: {}", config.error_patterns.join(", "));
    }
    println!("Iteration delay: {}ms", config.iteration_delay_ms);
    println!();
    for line in config.describe_steps(Some(&paths.config_dir)) {
        println!("{line}");
    }
}

/// First interrupt cancels the run; a second one exits immediately (a
/// prompt waiting for input cannot observe the token).
fn install_interrupt_handler(cancel: &CancelToken) -> Result<()> {
    let cancel = cancel.clone();
    let interrupted = AtomicBool::new(false);
    ctrlc::set_handler(move || {
        if interrupted.swap(true, Ordering::SeqCst) {
            eprintln!("\npilot: cancelled");
            std::process::exit(exit_codes::CANCELLED);
        }
        eprintln!("\npilot: stopping (interrupt again to exit now)");
        cancel.cancel();
    })
    .context("install interrupt handler")
}

/// Debug width from `--debug [WIDTH]`, else from `PILOT_DEBUG` /
/// `PILOT_DEBUG_TRUNCATE`. `None` disables the debug snapshot.
fn debug_width(
    flag: Option<Option<usize>>,
    pilot_debug: Option<String>,
    truncate: Option<String>,
) -> Option<usize> {
    let env_width = || {
        truncate
            .as_deref()
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(DEFAULT_DEBUG_WIDTH)
    };
    match flag {
        Some(Some(width)) => Some(width),
        Some(None) => Some(env_width()),
        None if pilot_debug.as_deref().is_some_and(|value| !value.is_empty()) => Some(env_width()),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_defaults() {
        let cli = Cli::parse_from(["pilot", "run"]);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.from_step.is_none());
        assert!(args.debug.is_none());
        assert!(!args.dry_run);
    }

    #[test]
    fn parse_run_flags() {
        let cli = Cli::parse_from([
            "pilot",
            "run",
            "--config",
            "other/pipeline.toml",
            "--from",
            "review",
            "--debug",
            "120",
            "--no-branch",
        ]);
        assert_eq!(cli.config, PathBuf::from("other/pipeline.toml"));
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.from_step.as_deref(), Some("review"));
        assert_eq!(args.debug, Some(Some(120)));
        assert!(args.no_branch);
    }

    #[test]
    fn bare_debug_flag_has_no_width() {
        let cli = Cli::parse_from(["pilot", "run", "--debug"]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.debug, Some(None));
    }

    #[test]
    fn parse_inspection_commands() {
        let cli = Cli::parse_from(["pilot", "agents", "--config", "x/pipeline.toml"]);
        assert!(matches!(cli.command, Command::Agents));
        assert_eq!(cli.config, PathBuf::from("x/pipeline.toml"));
        assert!(matches!(
            Cli::parse_from(["pilot", "doctor"]).command,
            Command::Doctor
        ));
    }

    #[test]
    fn branch_conflicts_with_no_branch() {
        let parsed = Cli::try_parse_from(["pilot", "run", "--branch", "x", "--no-branch"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn debug_width_resolution() {
        assert_eq!(debug_width(None, None, None), None);
        assert_eq!(debug_width(None, Some(String::new()), None), None);
        assert_eq!(debug_width(None, Some("1".to_string()), None), Some(80));
        assert_eq!(
            debug_width(None, Some("1".to_string()), Some("0".to_string())),
            Some(0)
        );
        assert_eq!(debug_width(Some(None), None, Some("40".to_string())), Some(40));
        assert_eq!(debug_width(Some(Some(10)), None, Some("40".to_string())), Some(10));
    }
}
