//! Natural-language task runner.
//!
//! Turns an instruction into a sequence of validated shell commands executed
//! in one persistent bash session.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use shellpilot::controller::{LoopEvent, LoopOutcome, LoopStop, StepController};
use shellpilot::exit_codes;
use shellpilot::io::backend::Backend;
use shellpilot::io::config::{
    DEFAULT_CONFIG_FILE, Provider, ShellpilotConfig, load_config, write_config,
};
use shellpilot::io::shell::ShellSession;
use shellpilot::io::transcript::{Transcript, generate_run_id};
use shellpilot::logging;
use tracing::info;

const OUTPUT_PREVIEW_LINES: usize = 20;

#[derive(Parser)]
#[command(
    name = "shellpilot",
    version,
    about = "Plan, validate, and run shell commands for a natural-language task"
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Carry out an instruction step by step.
    Run {
        /// What to accomplish, in plain language.
        instruction: String,

        /// Reasoning backend (overrides the config file).
        #[arg(short, long, value_enum)]
        provider: Option<Provider>,

        /// Model name passed to the backend.
        #[arg(short, long)]
        model: Option<String>,

        /// Stop after this many iterations.
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Write a JSON transcript of every iteration under this directory.
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Run {
            instruction,
            provider,
            model,
            max_iterations,
            log_dir,
        } => {
            let mut cfg = load_config(&cli.config)?;
            if let Some(provider) = provider {
                cfg.backend.provider = provider;
            }
            if let Some(model) = model {
                cfg.backend.model = model;
            }
            if let Some(max_iterations) = max_iterations {
                cfg.max_iterations = max_iterations;
            }
            cfg.validate().context("invalid options")?;
            cmd_run(&cfg, &instruction, log_dir.as_deref())
        }
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &ShellpilotConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(cfg: &ShellpilotConfig, instruction: &str, log_dir: Option<&Path>) -> Result<i32> {
    let backend = Backend::from_settings(&cfg.backend).context("configure backend")?;
    let transcript = log_dir
        .map(|dir| Transcript::create(dir, &generate_run_id()))
        .transpose()?;
    let shell = ShellSession::spawn(cfg.shell_options()).context("start shell")?;
    info!(
        provider = %backend.provider(),
        model = backend.model().unwrap_or("default"),
        "starting run"
    );

    let mut controller = StepController::new(&backend, &backend, shell, cfg.controller());
    let mut transcript_error = None;
    let result = controller.run(instruction, |event| {
        print_event(event);
        if let (Some(transcript), LoopEvent::Rejected { entry } | LoopEvent::Executed { entry }) =
            (&transcript, event)
            && let Err(err) = transcript.write_entry(entry)
        {
            transcript_error.get_or_insert(err);
        }
    });

    if let Some(transcript) = &transcript {
        let path = transcript.write_state(controller.state())?;
        println!("transcript: {}", path.display());
    }
    controller.into_runner().close();

    if let Some(err) = transcript_error {
        return Err(err.context("write transcript"));
    }
    let outcome = result.context("run aborted")?;
    print_summary(&outcome);
    Ok(match outcome.stop {
        LoopStop::Completed => exit_codes::OK,
        LoopStop::MaxIterationsExceeded { .. } => exit_codes::INCOMPLETE,
    })
}

fn print_event(event: &LoopEvent<'_>) {
    match event {
        LoopEvent::Planning { iteration } => println!("\n[{iteration}] planning"),
        LoopEvent::Proposed { step, .. } => {
            println!("  step:    {}", step.step);
            println!("  command: {}", step.command);
            if !step.reason.is_empty() {
                println!("  reason:  {}", step.reason);
            }
        }
        LoopEvent::Validating { .. } => {}
        LoopEvent::Rejected { entry } => {
            println!("  rejected: {}", entry.validation.feedback);
            if let Some(suggested) = entry
                .validation
                .modification
                .as_deref()
                .filter(|m| !m.trim().is_empty())
            {
                println!("  suggested: {suggested}");
            }
        }
        LoopEvent::Executing {
            command, timeout, ..
        } => {
            println!("  running: {command} (timeout {}s)", timeout.as_secs());
        }
        LoopEvent::Executed { entry } => {
            let Some(result) = &entry.result else {
                return;
            };
            for line in result.output.lines().take(OUTPUT_PREVIEW_LINES) {
                println!("  | {line}");
            }
            let hidden = result.output.lines().count().saturating_sub(OUTPUT_PREVIEW_LINES);
            if hidden > 0 {
                println!("  | ... {hidden} more lines");
            }
            let status = if result.success { "ok" } else { "failed" };
            println!("  exit {} ({status})", result.exit_code);
        }
    }
}

fn print_summary(outcome: &LoopOutcome) {
    println!();
    match &outcome.stop {
        LoopStop::Completed => {
            println!("completed after {} iterations", outcome.iterations);
        }
        LoopStop::MaxIterationsExceeded { max_iterations, .. } => {
            println!("stopped: reached the limit of {max_iterations} iterations");
        }
    }
    for entry in outcome.state.executed() {
        let code = entry.result.as_ref().map_or(0, |r| r.exit_code);
        println!("  {:>3}. [{code}] {}", entry.iteration, entry.command);
    }
}
