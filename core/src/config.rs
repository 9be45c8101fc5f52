//! Named numeric parameters of the localization engine.
//!
//! All values have defaults, so a configuration file only needs to list what it overrides. Files are read and
//! written as JSON, YAML or TOML depending on the extension.
//!
//! ## Example
//!
//! ```
//! use beaconnav::config::LocalizationConfig;
//!
//! let config: LocalizationConfig = toml::from_str("hysteresis_k = 3\ntick_rate_hz = 1.0").unwrap();
//! assert_eq!(config.hysteresis_k, 3);
//! assert_eq!(config.rank_weight, 3.0);
//! assert!(config.validate().is_ok());
//! ```
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use anyhow::{Result, bail};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalizationConfig {
    /// Session tick rate in Hz
    pub tick_rate_hz: f64,
    /// Consecutive ticks a new arg-max must win before it is committed
    pub hysteresis_k: u32,
    /// Candidate search radius around the committed node on large graphs (meters)
    pub search_radius_m: f64,
    /// Graphs with at most this many nodes are searched exhaustively every tick
    pub small_graph_nodes: usize,

    /// Weight of the Spearman rank term
    pub rank_weight: f64,
    /// Weight of the pairwise consistency term
    pub pairwise_weight: f64,
    /// Slope of the distance-ratio path loss proxy (dB per decade)
    pub distance_ratio_slope: f64,
    /// Scale of the logistic applied to pairwise residuals (dB)
    pub pair_residual_scale_db: f64,

    /// Fastest feasible walking speed; edges needing more are gated (m/s)
    pub max_walking_speed_mps: f64,
    /// Exponential preference for heading-aligned edges
    pub forward_bias_lambda: f64,
    /// Raw self-transition weight when no steps were detected
    pub stationary_self_weight: f64,
    /// Raw self-transition weight when steps were detected
    pub moving_self_weight: f64,
    /// Raw base weight of a neighbor transition
    pub neighbor_base_weight: f64,

    /// Enables self-training of per-beacon biases on confident ticks
    pub calibration_enabled: bool,
    /// Minimum filter confidence for a tick to update calibration
    pub calibration_confidence_threshold: f64,
    /// Exponential smoothing factor for calibration updates
    pub calibration_learning_rate: f64,
    /// Calibration biases are clamped to +/- this value (dB)
    pub calibration_clamp_db: f64,

    /// Minimum visible beacons for the filter to run on a tick
    pub min_visible_beacons: usize,
    /// Per-tick confidence multiplier while signal starved
    pub starved_decay: f64,
    /// Upper bound of the reported confidence while signal starved
    pub starved_confidence_ceiling: f64,
    /// Top-2 posterior gap under which a position is flagged as a contested junction
    pub junction_margin: f64,
    /// Number of committed positions kept for diagnostics
    pub path_history_capacity: usize,
}
impl Default for LocalizationConfig {
    fn default() -> Self {
        LocalizationConfig {
            tick_rate_hz: 0.5,
            hysteresis_k: 2,
            search_radius_m: 30.0,
            small_graph_nodes: 500,
            rank_weight: 3.0,
            pairwise_weight: 1.0,
            distance_ratio_slope: 8.0,
            pair_residual_scale_db: 5.0,
            max_walking_speed_mps: 1.8,
            forward_bias_lambda: 1.5,
            stationary_self_weight: 5.0,
            moving_self_weight: 1.0,
            neighbor_base_weight: 2.0,
            calibration_enabled: false,
            calibration_confidence_threshold: 0.8,
            calibration_learning_rate: 0.05,
            calibration_clamp_db: 50.0,
            min_visible_beacons: 2,
            starved_decay: 0.9,
            starved_confidence_ceiling: 0.3,
            junction_margin: 0.15,
            path_history_capacity: 10,
        }
    }
}
impl LocalizationConfig {
    /// Duration of one tick in seconds
    pub fn tick_duration_s(&self) -> f64 {
        1.0 / self.tick_rate_hz
    }
    /// Reject values that would make the models meaningless.
    pub fn validate(&self) -> Result<()> {
        if !(self.tick_rate_hz.is_finite() && self.tick_rate_hz > 0.0) {
            bail!("tick_rate_hz must be positive, got {}", self.tick_rate_hz);
        }
        if self.hysteresis_k == 0 {
            bail!("hysteresis_k must be at least 1");
        }
        if !(self.search_radius_m.is_finite() && self.search_radius_m > 0.0) {
            bail!("search_radius_m must be positive, got {}", self.search_radius_m);
        }
        for (name, value) in [
            ("rank_weight", self.rank_weight),
            ("pairwise_weight", self.pairwise_weight),
            ("distance_ratio_slope", self.distance_ratio_slope),
            ("forward_bias_lambda", self.forward_bias_lambda),
            ("calibration_clamp_db", self.calibration_clamp_db),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                bail!("{} must be non-negative, got {}", name, value);
            }
        }
        for (name, value) in [
            ("pair_residual_scale_db", self.pair_residual_scale_db),
            ("max_walking_speed_mps", self.max_walking_speed_mps),
            ("stationary_self_weight", self.stationary_self_weight),
            ("moving_self_weight", self.moving_self_weight),
            ("neighbor_base_weight", self.neighbor_base_weight),
        ] {
            if !(value.is_finite() && value > 0.0) {
                bail!("{} must be positive, got {}", name, value);
            }
        }
        for (name, value) in [
            ("calibration_confidence_threshold", self.calibration_confidence_threshold),
            ("calibration_learning_rate", self.calibration_learning_rate),
            ("starved_decay", self.starved_decay),
            ("starved_confidence_ceiling", self.starved_confidence_ceiling),
            ("junction_margin", self.junction_margin),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("{} must lie in [0, 1], got {}", name, value);
            }
        }
        if self.path_history_capacity == 0 {
            bail!("path_history_capacity must be at least 1");
        }
        Ok(())
    }
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        write_structured(self, path)
    }
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        read_structured(path)
    }
}

/// Write any serializable value, choosing the format by extension (.json/.yaml/.yml/.toml)
pub fn write_structured<T: Serialize, P: AsRef<Path>>(value: &T, path: P) -> io::Result<()> {
    let p = path.as_ref();
    let text = match extension(p).as_deref() {
        Some("json") => serde_json::to_string_pretty(value).map_err(io::Error::other)?,
        Some("yaml") | Some("yml") => serde_yaml::to_string(value).map_err(io::Error::other)?,
        Some("toml") => toml::to_string(value).map_err(io::Error::other)?,
        _ => return Err(unsupported_extension(p)),
    };
    let mut file = File::create(p)?;
    file.write_all(text.as_bytes())
}

/// Read any deserializable value, choosing the format by extension (.json/.yaml/.yml/.toml)
pub fn read_structured<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> io::Result<T> {
    let p = path.as_ref();
    let format = extension(p);
    match format.as_deref() {
        Some("json") => serde_json::from_reader(File::open(p)?).map_err(io::Error::other),
        Some("yaml") | Some("yml") => serde_yaml::from_reader(File::open(p)?).map_err(io::Error::other),
        Some("toml") => {
            let mut s = String::new();
            File::open(p)?.read_to_string(&mut s)?;
            toml::from_str(&s).map_err(io::Error::other)
        }
        _ => Err(unsupported_extension(p)),
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

fn unsupported_extension(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("unsupported file extension: {}", path.display()),
    )
}
