#![forbid(unsafe_code)]

//! `ladder-sim run` executes a campaign across many seeds.
//! `ladder-sim replay` replays one seed with its step trace.

use std::env;
use std::process;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use ladder_sim::campaign::{self, CampaignConfig};
use serde::Serialize;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "ladder-sim", version, about = "Deterministic simulation of the ladder sync engine")]
struct Cli {
    #[command(subcommand)]
    command: SimCommand,

    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputMode::Text, global = true)]
    format: OutputMode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputMode {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum SimCommand {
    /// Run a campaign across multiple seeds.
    #[command(after_help = "EXAMPLES:\n    # Run 100 seeds with defaults\n    ladder-sim run --seeds 100\n\n\
                            # Noisier stores\n    ladder-sim run --seeds 200 --steps 400 --faults 0.3\n\n\
                            # Machine-readable output\n    ladder-sim run --seeds 100 --format json")]
    Run(RunArgs),

    /// Replay a single seed with full trace.
    #[command(after_help = "EXAMPLES:\n    # Replay seed 42\n    ladder-sim replay --seed 42\n\n\
                            # Print every step\n    ladder-sim replay --seed 42 --steps 50 --trace")]
    Replay(ReplayArgs),
}

/// Parameters shared by both subcommands.
#[derive(Args, Debug)]
struct SessionArgs {
    /// Steps per seed.
    #[arg(long, default_value = "200")]
    steps: u64,

    /// Distinct accounts the session signs in as.
    #[arg(long, default_value = "2")]
    users: usize,

    /// Overall fault probability between 0.0 and 1.0 (scales every fault rate).
    #[arg(long, default_value = "0.1")]
    faults: f64,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Number of seeds to run.
    #[arg(long, default_value = "100")]
    seeds: u64,

    /// Starting seed value.
    #[arg(long, default_value = "0")]
    seed_start: u64,

    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Args, Debug)]
struct ReplayArgs {
    /// Seed to replay.
    #[arg(long)]
    seed: u64,

    /// Print every step of the trace.
    #[arg(long)]
    trace: bool,

    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Debug, Serialize)]
struct ReplayOutput<'a> {
    seed: u64,
    steps: usize,
    passed: bool,
    violations: &'a [String],
    final_task_count: usize,
    interesting_state_reached: bool,
    trace_fingerprint: u64,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let passed = match &cli.command {
        SimCommand::Run(args) => run(args, cli.format)?,
        SimCommand::Replay(args) => replay(args, cli.format)?,
    };
    if !passed {
        process::exit(1);
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("LADDER_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "ladder=debug,info"
        } else {
            "ladder_sim=info,error"
        })
    });
    let registry = tracing_subscriber::registry().with(filter);
    match env::var("LADDER_LOG_FORMAT").as_deref() {
        Ok("json") => registry
            .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
            .init(),
        _ => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init(),
    }
}

fn campaign_config(seed_start: u64, seeds: u64, session: &SessionArgs) -> CampaignConfig {
    CampaignConfig::with_faults(
        seed_start..seed_start.saturating_add(seeds),
        session.steps,
        session.users,
        session.faults,
    )
}

fn run(args: &RunArgs, format: OutputMode) -> Result<bool> {
    let config = campaign_config(args.seed_start, args.seeds, &args.session);
    let report = campaign::run_campaign(&config)?;

    match format {
        OutputMode::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputMode::Text => {
            println!(
                "campaign seeds_run={} steps={} users={} faults_pct={:.0}",
                report.seeds_run,
                args.session.steps,
                args.session.users,
                args.session.faults * 100.0
            );
            println!(
                "result passed={} failed={} interesting={} all_passed={}",
                report.seeds_passed,
                report.failures.len(),
                report.interesting_states_reached,
                report.all_passed()
            );
            for failure in &report.failures {
                for violation in &failure.violations {
                    println!("failure seed={} {violation}", failure.seed);
                }
            }
            if let Some(seed) = report.first_failure {
                println!(
                    "replay: ladder-sim replay --seed {seed} --steps {} --users {} --faults {}",
                    args.session.steps, args.session.users, args.session.faults
                );
            }
        }
    }
    Ok(report.all_passed())
}

fn replay(args: &ReplayArgs, format: OutputMode) -> Result<bool> {
    let config = campaign_config(args.seed, 1, &args.session);
    let trace = campaign::replay_seed(args.seed, &config)?;
    let out = ReplayOutput {
        seed: args.seed,
        steps: trace.result.trace.len(),
        passed: trace.passed(),
        violations: &trace.violations,
        final_task_count: trace.result.final_task_count,
        interesting_state_reached: trace.result.interesting_state_reached,
        trace_fingerprint: trace.result.trace_fingerprint(),
    };

    match format {
        OutputMode::Json => {
            if args.trace {
                let full = serde_json::json!({ "summary": &out, "trace": &trace.result.trace });
                println!("{}", serde_json::to_string_pretty(&full)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&out)?);
            }
        }
        OutputMode::Text => {
            println!(
                "replay seed={} steps={} passed={} tasks={} interesting={} fingerprint={:016x}",
                out.seed,
                out.steps,
                out.passed,
                out.final_task_count,
                out.interesting_state_reached,
                out.trace_fingerprint
            );
            if args.trace {
                for event in &trace.result.trace {
                    println!(
                        "step={:<5} phase={:<24} tasks={:<4} outcome={:<20} action={}",
                        event.step,
                        event.phase,
                        event.task_count,
                        event.outcome,
                        serde_json::to_string(&event.action)?
                    );
                }
            }
            for violation in out.violations {
                println!("violation={violation}");
            }
        }
    }
    Ok(out.passed)
}
