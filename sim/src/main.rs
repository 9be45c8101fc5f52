//! BEACONNAV SIM: replay recorded BLE scans and step/heading samples through the localization engine.
//!
//! The program has three commands:
//!
//! - `replay`: bootstrap (or manually seed) a session from a scenario file and replay one or more recordings
//!   tick by tick, writing the committed node, confidence and diagnostics of every tick to CSV. Recorded
//!   signals can be degraded with seeded noise and dropout to test robustness.
//! - `bootstrap`: run only the floor and starting node estimation on the first ticks of a recording.
//! - `config`: write a template localization configuration with every default spelled out.
//!
//! Recordings are long-format CSV files with the columns `tick,elapsed_s,steps,heading_rad,beacon_id,rssi_dbm`,
//! one row per beacon reading.

mod common;

use clap::{Args, Parser, Subcommand};
use common::{get_recordings, init_logger, output_path_for, prepare_output, validate_input_path};
use log::{error, info, warn};
use rayon::prelude::*;
use std::error::Error;
use std::path::{Path, PathBuf};

use beaconnav::bootstrap::bootstrap;
use beaconnav::config::LocalizationConfig;
use beaconnav::sim::{LocalizationRecord, Scenario, SignalDegradation, TickInput, TickRecord, replay};
use beaconnav::SignalSnapshot;

const LONG_ABOUT: &str = "BEACONNAV SIM: replay recorded BLE scans and step/heading samples through the beaconnav localization engine.

A scenario file (TOML/JSON/YAML) describes the floors (navigation graph and beacon positions) and the localization configuration. Recordings are CSV files with one row per beacon reading:

    tick,elapsed_s,steps,heading_rad,beacon_id,rssi_dbm

Each replay starts from a bootstrap estimate on the first ticks of the recording unless a start node is given.";

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "Replay tool for the beaconnav indoor localization engine.", long_about = LONG_ABOUT)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Replay recordings in parallel when processing a directory
    #[arg(long, global = true)]
    parallel: bool,
}

#[derive(Subcommand, Clone)]
enum Command {
    #[command(
        name = "replay",
        about = "Replay recordings through a localization session",
        long_about = "Replay one recording, or every CSV recording in a directory, through a localization session. The session is seeded from a bootstrap estimate over the first ticks, or from --start-node when given. One output CSV is written per recording."
    )]
    Replay(ReplayArgs),
    #[command(
        name = "bootstrap",
        about = "Estimate the starting floor and node of a recording"
    )]
    Bootstrap(BootstrapArgs),
    #[command(name = "config", about = "Generate a template localization configuration file")]
    CreateConfig(CreateConfigArgs),
}

#[derive(Args, Clone, Debug)]
struct ReplayArgs {
    /// Scenario file (TOML/JSON/YAML) with floors and configuration
    #[arg(short, long, value_parser)]
    scenario: PathBuf,
    /// Recording CSV file or directory of recordings
    #[arg(short, long, value_parser)]
    input: PathBuf,
    /// Output CSV file (single recording) or directory
    #[arg(short, long, value_parser)]
    output: PathBuf,
    /// Localization configuration overriding the scenario's
    #[arg(long)]
    config: Option<PathBuf>,
    /// Start node; skips the bootstrap
    #[arg(long)]
    start_node: Option<String>,
    /// Floor of the start node
    #[arg(long, requires = "start_node")]
    start_floor: Option<String>,
    #[command(flatten)]
    degradation: DegradationArgs,
}

#[derive(Args, Clone, Debug)]
struct DegradationArgs {
    /// Standard deviation of additive RSSI noise in dB
    #[arg(long, default_value_t = 0.0)]
    noise_std_db: f64,
    /// Probability of dropping each beacon reading
    #[arg(long, default_value_t = 0.0)]
    dropout: f64,
    /// Random seed for the degradation
    #[arg(long, default_value_t = 42)]
    seed: u64,
}
impl From<&DegradationArgs> for SignalDegradation {
    fn from(args: &DegradationArgs) -> Self {
        SignalDegradation {
            noise_std_db: args.noise_std_db,
            dropout_probability: args.dropout,
            seed: args.seed,
        }
    }
}

#[derive(Args, Clone, Debug)]
struct BootstrapArgs {
    /// Scenario file (TOML/JSON/YAML) with floors
    #[arg(short, long, value_parser)]
    scenario: PathBuf,
    /// Recording CSV file
    #[arg(short, long, value_parser)]
    input: PathBuf,
    /// Number of leading ticks aggregated into the scan window
    #[arg(long, default_value_t = 3)]
    ticks: usize,
}

#[derive(Args, Clone, Debug)]
struct CreateConfigArgs {
    /// Output path; the extension selects TOML, JSON or YAML
    #[arg(short, long, value_parser, default_value = "beaconnav.toml")]
    output: PathBuf,
}

/// Replay a single recording and write its results.
fn replay_recording(
    scenario: &Scenario,
    degradation: &SignalDegradation,
    recording: &Path,
    output: &Path,
) -> Result<(), Box<dyn Error>> {
    let records = TickRecord::from_csv(recording)?;
    let mut ticks = TickInput::group(&records);
    info!("Read {} ticks from {}", ticks.len(), recording.display());
    if !degradation.is_identity() {
        info!("Applying {}", degradation);
        ticks = degradation.apply(&ticks)?;
    }
    let outcome = replay(scenario, &ticks)?;
    if let Some(result) = &outcome.bootstrap {
        info!(
            "Bootstrap: floor {} node {} confidence {:.2}",
            result.floor_id, result.node_id, result.confidence
        );
    }
    let starved = outcome.records.iter().filter(|r| r.signal_starved).count();
    if starved > 0 {
        warn!("{} of {} ticks were signal starved", starved, outcome.records.len());
    }
    LocalizationRecord::to_csv(&outcome.records, output)?;
    info!(
        "Final position {} @ {} (p = {:.3}), results written to {}",
        outcome.floor_id,
        outcome.final_state.committed.as_deref().unwrap_or("-"),
        outcome.final_state.confidence,
        output.display()
    );
    Ok(())
}

fn run_replay(args: &ReplayArgs, parallel: bool) -> Result<(), Box<dyn Error>> {
    validate_input_path(&args.input)?;
    let mut scenario = Scenario::from_file(&args.scenario)?;
    if let Some(config_path) = &args.config {
        scenario.config = LocalizationConfig::from_file(config_path)?;
    }
    if args.start_node.is_some() {
        scenario.start_node = args.start_node.clone();
        scenario.start_floor = args.start_floor.clone();
    }
    scenario.config.validate()?;
    let degradation = SignalDegradation::from(&args.degradation);

    let recordings = get_recordings(&args.input)?;
    let single = recordings.len() == 1;
    prepare_output(&args.output)?;
    info!(
        "Replaying {} recording(s) over {} floor(s)",
        recordings.len(),
        scenario.floors.len()
    );

    let run = |recording: &PathBuf| -> Result<(), String> {
        let output = output_path_for(recording, &args.output, single);
        replay_recording(&scenario, &degradation, recording, &output)
            .map_err(|e| format!("{}: {}", recording.display(), e))
    };
    let failures: Vec<String> = if parallel {
        recordings.par_iter().filter_map(|r| run(r).err()).collect()
    } else {
        recordings.iter().filter_map(|r| run(r).err()).collect()
    };
    for failure in &failures {
        error!("{}", failure);
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(format!("{} of {} recordings failed", failures.len(), recordings.len()).into())
    }
}

fn run_bootstrap(args: &BootstrapArgs) -> Result<(), Box<dyn Error>> {
    validate_input_path(&args.input)?;
    let scenario = Scenario::from_file(&args.scenario)?;
    let floors = scenario.load_floors()?;
    let ticks = TickInput::group(&TickRecord::from_csv(&args.input)?);
    let window: Vec<SignalSnapshot> = ticks
        .iter()
        .take(args.ticks.max(1))
        .map(|input| input.snapshot.clone())
        .collect();
    let aggregate = SignalSnapshot::aggregate(&window);
    match bootstrap(&aggregate, &floors) {
        Some(result) => {
            println!(
                "floor: {}\nnode: {}\nconfidence: {:.3}\nfloor score: {:.2} ({} matches, {} mismatches)\nbeacons: {}",
                result.floor_id,
                result.node_id,
                result.confidence,
                result.floor_score.score,
                result.floor_score.matches,
                result.floor_score.mismatches,
                result
                    .beacons
                    .iter()
                    .map(|b| b.id.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            Ok(())
        }
        None => Err(format!(
            "Bootstrap failed on {} beacons over {} ticks; start manually with --start-node",
            aggregate.len(),
            window.len()
        )
        .into()),
    }
}

fn create_config_file(args: &CreateConfigArgs) -> Result<(), Box<dyn Error>> {
    LocalizationConfig::default().to_file(&args.output)?;
    info!("Template configuration written to {}", args.output.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;

    match &cli.command {
        Command::Replay(args) => {
            info!(
                "Running replay of {} with scenario {}",
                args.input.display(),
                args.scenario.display()
            );
            run_replay(args, cli.parallel)
        }
        Command::Bootstrap(args) => run_bootstrap(args),
        Command::CreateConfig(args) => create_config_file(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_replay_args() {
        let cli = Cli::try_parse_from([
            "beaconnav-sim",
            "replay",
            "-s",
            "scenario.toml",
            "-i",
            "walk.csv",
            "-o",
            "out",
            "--start-node",
            "n1",
            "--noise-std-db",
            "2.5",
        ])
        .unwrap();
        let Command::Replay(args) = cli.command else {
            panic!("expected replay command");
        };
        assert_eq!(args.start_node.as_deref(), Some("n1"));
        let degradation = SignalDegradation::from(&args.degradation);
        assert_eq!(degradation.noise_std_db, 2.5);
        assert_eq!(degradation.seed, 42);
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_start_floor_requires_start_node() {
        let result = Cli::try_parse_from([
            "beaconnav-sim",
            "replay",
            "-s",
            "scenario.toml",
            "-i",
            "walk.csv",
            "-o",
            "out",
            "--start-floor",
            "L1",
        ]);
        assert!(result.is_err());
    }
}
