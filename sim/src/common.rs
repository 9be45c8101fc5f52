//! Common utility functions for the replay CLI.
//!
//! This module contains:
//! - Logger initialization
//! - Path validation and recording discovery

use std::error::Error;
use std::path::{Path, PathBuf};

/// Initialize the logger for a replay run.
///
/// `log_level` sets the default for every module. A `RUST_LOG` value in the environment is applied on top, so a
/// single module can be turned up (`RUST_LOG=beaconnav::hmm=trace`) without flooding the rest.
///
/// # Errors
/// Returns an error if the log file cannot be opened or a logger is already installed.
pub fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    use std::io::Write;

    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.format(|buf, record| {
        // library modules without the crate prefix keep tick lines narrow
        let module = record.target().trim_start_matches("beaconnav::");
        writeln!(
            buf,
            "{} {:<5} {:<10} {}",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            record.level(),
            module,
            record.args()
        )
    });
    if let Some(log_path) = log_file {
        builder.target(env_logger::Target::Pipe(Box::new(open_log_file(log_path)?)));
    }
    builder.try_init()?;
    Ok(())
}

/// Open `path` for appending, creating missing parent directories.
pub fn open_log_file(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}

/// Validate that an input path exists and is a file or directory.
pub fn validate_input_path(input: &Path) -> Result<(), Box<dyn Error>> {
    if !input.exists() {
        return Err(format!("Input path '{}' does not exist.", input.display()).into());
    }
    if !input.is_file() && !input.is_dir() {
        return Err(format!(
            "Input path '{}' is neither a file nor a directory.",
            input.display()
        )
        .into());
    }
    Ok(())
}

/// Collect recordings: a single CSV file, or every CSV in a directory sorted by name.
///
/// # Errors
/// Returns an error if the file is not a CSV or the directory holds no CSV files.
pub fn get_recordings(input: &Path) -> Result<Vec<PathBuf>, Box<dyn Error>> {
    if input.is_file() {
        if !is_csv(input) {
            return Err(format!("Recording '{}' is not a CSV file.", input.display()).into());
        }
        return Ok(vec![input.to_path_buf()]);
    }
    let mut recordings: Vec<PathBuf> = std::fs::read_dir(input)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_csv(path))
        .collect();
    if recordings.is_empty() {
        return Err(format!("No CSV recordings found in '{}'.", input.display()).into());
    }
    recordings.sort();
    Ok(recordings)
}

/// Output path for a recording's localization results: `<output>/<stem>_localization.csv`.
///
/// When `output` names a CSV file and only one recording is processed, it is used as is.
pub fn output_path_for(recording: &Path, output: &Path, single: bool) -> PathBuf {
    if single && is_csv(output) {
        return output.to_path_buf();
    }
    let stem = recording
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("recording");
    output.join(format!("{stem}_localization.csv"))
}

/// Create the output directory (or the parent of an output CSV) if missing.
pub fn prepare_output(output: &Path) -> Result<(), Box<dyn Error>> {
    let dir = if is_csv(output) {
        output.parent().unwrap_or(Path::new(""))
    } else {
        output
    };
    if !dir.as_os_str().is_empty() && !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

fn is_csv(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
}
