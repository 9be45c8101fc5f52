//! Scenario replay and CSV data loading for offline evaluation.
//!
//! This module provides:
//! - [`Scenario`]: the floors (graph + beacons) and configuration of a replay, read from JSON/YAML/TOML
//! - [`TickRecord`]: the long-format CSV rows of a recorded session, one row per beacon reading
//! - [`TickInput`]: rows grouped back into the per-tick snapshot and motion sample
//! - [`SignalDegradation`]: seeded noise and dropout injection on recorded signals
//! - [`replay`]: bootstrap followed by a tick-by-tick session run, producing [`LocalizationRecord`]s
use std::path::Path;
use std::{fmt, io};

use anyhow::{Context, Result, bail};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::beacon::{Floor, FloorData};
use crate::bootstrap::{BootstrapResult, bootstrap};
use crate::config::{LocalizationConfig, read_structured, write_structured};
use crate::session::{LocalizationSession, SessionState};
use crate::{MotionSample, NodeId, SignalSnapshot};

fn default_bootstrap_ticks() -> usize {
    3
}

/// Everything needed to replay a recording besides the recording itself.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub floors: Vec<FloorData>,
    #[serde(default)]
    pub config: LocalizationConfig,
    /// Number of leading ticks aggregated for the bootstrap scan window
    #[serde(default = "default_bootstrap_ticks")]
    pub bootstrap_ticks: usize,
    /// Manual start node; skips the bootstrap when set
    #[serde(default)]
    pub start_node: Option<NodeId>,
    /// Floor of the manual start node; searched for when omitted
    #[serde(default)]
    pub start_floor: Option<String>,
}
impl Scenario {
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        read_structured(path)
    }
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        write_structured(self, path)
    }
    /// Validate and index every floor
    pub fn load_floors(&self) -> Result<Vec<Floor>> {
        self.floors
            .iter()
            .cloned()
            .map(Floor::try_from)
            .collect()
    }
}

/// A single row of a recorded session.
///
/// Rows sharing a `tick` form one tick. Motion columns are read from the first row of the tick; each row with
/// both `beacon_id` and `rssi_dbm` contributes one reading. A tick without readings is a single row with empty
/// beacon columns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TickRecord {
    pub tick: u64,
    /// Seconds since the start of the recording
    pub elapsed_s: f64,
    pub steps: u32,
    pub heading_rad: Option<f64>,
    pub beacon_id: Option<String>,
    pub rssi_dbm: Option<f64>,
}
impl TickRecord {
    /// Reads a CSV file and returns its rows in file order.
    ///
    /// # Arguments
    /// * `path` - Path to the CSV file to read.
    ///
    /// # Returns
    /// * `Ok(Vec<TickRecord>)` if successful.
    /// * `Err` if the file cannot be read or parsed.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        let path = path.as_ref();
        let mut rdr = csv::Reader::from_path(path)
            .with_context(|| format!("cannot open tick recording {}", path.display()))?;
        let mut records = Vec::new();
        for (row, result) in rdr.deserialize().enumerate() {
            let record: Self = result.with_context(|| format!("malformed row {} in {}", row + 1, path.display()))?;
            records.push(record);
        }
        Ok(records)
    }
    /// Writes rows to a CSV file with a header.
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// One tick of input, as handed to the session.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TickInput {
    pub tick: u64,
    pub elapsed_s: f64,
    pub snapshot: SignalSnapshot,
    pub motion: MotionSample,
}
impl TickInput {
    /// Group consecutive rows with the same tick index
    pub fn group(records: &[TickRecord]) -> Vec<TickInput> {
        let mut ticks: Vec<TickInput> = Vec::new();
        for record in records {
            let start_new = ticks.last().is_none_or(|last| last.tick != record.tick);
            if start_new {
                ticks.push(TickInput {
                    tick: record.tick,
                    elapsed_s: record.elapsed_s,
                    snapshot: SignalSnapshot::new(),
                    motion: MotionSample::new(record.steps, record.heading_rad),
                });
            }
            if let (Some(current), Some(id), Some(rssi)) =
                (ticks.last_mut(), record.beacon_id.as_ref(), record.rssi_dbm)
            {
                current.snapshot.insert(id.clone(), rssi);
            }
        }
        ticks
    }
    /// Flatten ticks back into CSV rows
    pub fn to_records(ticks: &[TickInput]) -> Vec<TickRecord> {
        let mut records = Vec::new();
        for input in ticks {
            let row = |beacon_id: Option<String>, rssi_dbm: Option<f64>| TickRecord {
                tick: input.tick,
                elapsed_s: input.elapsed_s,
                steps: input.motion.steps,
                heading_rad: input.motion.heading,
                beacon_id,
                rssi_dbm,
            };
            if input.snapshot.is_empty() {
                records.push(row(None, None));
            }
            for (id, rssi) in input.snapshot.iter() {
                records.push(row(Some(id.to_string()), Some(rssi)));
            }
        }
        records
    }
}

fn default_seed() -> u64 {
    42
}

/// Seeded corruption of recorded signals: Gaussian RSSI noise plus random reading dropout.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalDegradation {
    /// Standard deviation of additive RSSI noise (dB)
    #[serde(default)]
    pub noise_std_db: f64,
    /// Probability in [0, 1] that any single reading is dropped
    #[serde(default)]
    pub dropout_probability: f64,
    /// Use the same seed to repeat a degraded run exactly
    #[serde(default = "default_seed")]
    pub seed: u64,
}
impl fmt::Display for SignalDegradation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SignalDegradation {{ noise: {:.1} dB, dropout: {:.2}, seed: {} }}",
            self.noise_std_db, self.dropout_probability, self.seed
        )
    }
}
impl SignalDegradation {
    pub fn is_identity(&self) -> bool {
        self.noise_std_db == 0.0 && self.dropout_probability == 0.0
    }
    /// Degrade every snapshot of `ticks`, leaving motion untouched.
    pub fn apply(&self, ticks: &[TickInput]) -> Result<Vec<TickInput>> {
        if !(0.0..=1.0).contains(&self.dropout_probability) {
            bail!("dropout probability must lie in [0, 1], got {}", self.dropout_probability);
        }
        let noise = Normal::new(0.0, self.noise_std_db)
            .with_context(|| format!("invalid noise standard deviation {}", self.noise_std_db))?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let degraded = ticks
            .iter()
            .map(|input| {
                let mut snapshot = SignalSnapshot::new();
                for (id, rssi) in input.snapshot.iter() {
                    if rng.random_bool(self.dropout_probability) {
                        continue;
                    }
                    snapshot.insert(id, rssi + noise.sample(&mut rng));
                }
                TickInput {
                    snapshot,
                    ..input.clone()
                }
            })
            .collect();
        Ok(degraded)
    }
}

/// One row of replay output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalizationRecord {
    pub tick: u64,
    pub elapsed_s: f64,
    pub floor_id: String,
    pub committed: Option<NodeId>,
    pub confidence: f64,
    pub raw_best: Option<NodeId>,
    pub visible_beacons: usize,
    pub signal_starved: bool,
    pub junction_ambiguous: bool,
    pub processing_us: u64,
}
impl LocalizationRecord {
    pub fn new(input: &TickInput, state: &SessionState) -> LocalizationRecord {
        LocalizationRecord {
            tick: input.tick,
            elapsed_s: input.elapsed_s,
            floor_id: state.floor_id.clone(),
            committed: state.committed.clone(),
            confidence: state.confidence,
            raw_best: state.diagnostics.raw_best.clone(),
            visible_beacons: state.diagnostics.visible_beacons,
            signal_starved: state.diagnostics.signal_starved,
            junction_ambiguous: state.diagnostics.junction_ambiguous,
            processing_us: state.diagnostics.processing_time.as_micros() as u64,
        }
    }
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            records.push(result?);
        }
        Ok(records)
    }
}

/// Result of [`replay`].
#[derive(Clone, Debug)]
pub struct ReplayOutcome {
    /// `None` when the run was started manually
    pub bootstrap: Option<BootstrapResult>,
    pub floor_id: String,
    pub records: Vec<LocalizationRecord>,
    pub final_state: SessionState,
}

/// Build the session a replay starts from, either manually or by bootstrapping on the first ticks.
pub fn start_session(
    scenario: &Scenario,
    floors: &[Floor],
    ticks: &[TickInput],
) -> Result<(LocalizationSession, Option<BootstrapResult>)> {
    let config = scenario.config.clone();
    if let Some(node) = scenario.start_node.as_deref() {
        let floor = match scenario.start_floor.as_deref() {
            Some(id) => floors.iter().find(|floor| floor.id == id),
            None => floors.iter().find(|floor| floor.graph.contains(node)),
        };
        let Some(floor) = floor else {
            bail!("no loaded floor contains start node '{}'", node);
        };
        let session = LocalizationSession::with_start(floor.clone(), config, Some(node))?;
        return Ok((session, None));
    }
    let window: Vec<SignalSnapshot> = ticks
        .iter()
        .take(scenario.bootstrap_ticks.max(1))
        .map(|input| input.snapshot.clone())
        .collect();
    let aggregate = SignalSnapshot::aggregate(&window);
    let Some(result) = bootstrap(&aggregate, floors) else {
        bail!(
            "bootstrap failed on {} beacons over {} ticks; provide a start node",
            aggregate.len(),
            window.len()
        );
    };
    let session = LocalizationSession::from_bootstrap(&result, floors, config)?;
    Ok((session, Some(result)))
}

/// Replay recorded ticks through a localization session.
///
/// The tick duration passed to the filter is the difference between consecutive `elapsed_s` values, falling
/// back to the configured tick duration for the first tick or a non-increasing clock.
pub fn replay(scenario: &Scenario, ticks: &[TickInput]) -> Result<ReplayOutcome> {
    let floors = scenario.load_floors()?;
    if floors.is_empty() {
        bail!("scenario has no floors");
    }
    let (mut session, bootstrap) = start_session(scenario, &floors, ticks)?;
    info!(
        "Replaying {} ticks on floor {} from {:?}",
        ticks.len(),
        session.floor_id(),
        session.state().committed
    );
    let nominal_dt = session.config().tick_duration_s();
    let mut previous_elapsed: Option<f64> = None;
    let mut records = Vec::with_capacity(ticks.len());
    for input in ticks {
        let dt = match previous_elapsed {
            Some(previous) if input.elapsed_s > previous => input.elapsed_s - previous,
            Some(_) => {
                warn!("tick {} does not advance the clock, using nominal duration", input.tick);
                nominal_dt
            }
            None => nominal_dt,
        };
        previous_elapsed = Some(input.elapsed_s);
        let state = session.tick_with_duration(&input.snapshot, &input.motion, dt);
        records.push(LocalizationRecord::new(input, state));
    }
    Ok(ReplayOutcome {
        bootstrap,
        floor_id: session.floor_id().to_string(),
        records,
        final_state: session.state().clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::Beacon;
    use crate::graph::{Edge, Graph, Node};
    use crate::observation::expected_rssi;
    use crate::Position;
    use tempfile::tempdir;

    fn corridor() -> FloorData {
        FloorData {
            id: "L1".to_string(),
            graph: Graph::new(
                vec![
                    Node::new("a", 0.0, 0.0),
                    Node::new("b", 3.0, 0.0),
                    Node::new("c", 6.0, 0.0),
                ],
                vec![Edge::new("a", "b", 3.0), Edge::new("b", "c", 3.0)],
            ),
            beacons: vec![
                Beacon::new("ba", 0.0, 1.0),
                Beacon::new("bb", 3.0, 1.0),
                Beacon::new("bc", 6.0, 1.0),
            ],
        }
    }
    fn standing_ticks(at: Position, count: u64) -> Vec<TickInput> {
        let beacons = corridor().beacons;
        (0..count)
            .map(|tick| TickInput {
                tick,
                elapsed_s: tick as f64 * 2.0,
                snapshot: beacons
                    .iter()
                    .map(|b| (b.id.clone(), expected_rssi(b.position().distance_to(&at))))
                    .collect(),
                motion: MotionSample::stationary(),
            })
            .collect()
    }

    #[test]
    fn group_rows_into_ticks() {
        let rows = vec![
            TickRecord { tick: 0, elapsed_s: 0.0, steps: 0, heading_rad: None, beacon_id: Some("x".into()), rssi_dbm: Some(-60.0) },
            TickRecord { tick: 0, elapsed_s: 0.0, steps: 0, heading_rad: None, beacon_id: Some("y".into()), rssi_dbm: Some(-70.0) },
            TickRecord { tick: 1, elapsed_s: 2.0, steps: 3, heading_rad: Some(0.5), beacon_id: None, rssi_dbm: None },
        ];
        let ticks = TickInput::group(&rows);
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].snapshot.len(), 2);
        assert!(ticks[1].snapshot.is_empty());
        assert_eq!(ticks[1].motion, MotionSample::new(3, Some(0.5)));
        assert_eq!(TickInput::to_records(&ticks), rows);
    }
    #[test]
    fn tick_csv_file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ticks.csv");
        let mut ticks = standing_ticks(Position::new(3.0, 0.0), 2);
        ticks[1].motion = MotionSample::new(2, Some(1.0));
        TickRecord::to_csv(&TickInput::to_records(&ticks), &path).unwrap();
        let read = TickInput::group(&TickRecord::from_csv(&path).unwrap());
        assert_eq!(read.len(), 2);
        assert_eq!(read[1].motion, ticks[1].motion);
        assert_eq!(read[0].snapshot.len(), 3);
    }
    #[test]
    fn degradation_is_seeded() {
        let ticks = standing_ticks(Position::new(0.0, 0.0), 5);
        let degradation = SignalDegradation {
            noise_std_db: 3.0,
            dropout_probability: 0.3,
            seed: 7,
        };
        let first = degradation.apply(&ticks).unwrap();
        let second = degradation.apply(&ticks).unwrap();
        assert_eq!(first, second);
        assert_ne!(first, ticks);
        let blackout = SignalDegradation {
            dropout_probability: 1.0,
            ..SignalDegradation::default()
        };
        assert!(blackout.apply(&ticks).unwrap().iter().all(|t| t.snapshot.is_empty()));
        assert!(SignalDegradation::default().is_identity());
        let invalid = SignalDegradation {
            dropout_probability: 2.0,
            ..SignalDegradation::default()
        };
        assert!(invalid.apply(&ticks).is_err());
    }
    #[test]
    fn replay_with_bootstrap() {
        let scenario = Scenario {
            floors: vec![corridor()],
            bootstrap_ticks: 2,
            ..Scenario::default()
        };
        let ticks = standing_ticks(Position::new(6.0, 0.0), 4);
        let outcome = replay(&scenario, &ticks).unwrap();
        let bootstrap = outcome.bootstrap.unwrap();
        assert_eq!(bootstrap.node_id, "c");
        assert_eq!(outcome.records.len(), 4);
        assert!(outcome.records.iter().all(|r| r.committed.as_deref() == Some("c")));
        assert_eq!(outcome.final_state.path_history, vec!["c".to_string()]);
    }
    #[test]
    fn replay_manual_start_and_failures() {
        let mut scenario = Scenario {
            floors: vec![corridor()],
            start_node: Some("a".to_string()),
            ..Scenario::default()
        };
        let ticks = standing_ticks(Position::new(0.0, 0.0), 2);
        let outcome = replay(&scenario, &ticks).unwrap();
        assert!(outcome.bootstrap.is_none());
        assert_eq!(outcome.records[0].committed.as_deref(), Some("a"));

        scenario.start_node = Some("zz".to_string());
        assert!(replay(&scenario, &ticks).is_err());
        scenario.start_node = None;
        let silent = vec![TickInput::default()];
        assert!(replay(&scenario, &silent).is_err());
    }
    #[test]
    fn scenario_and_output_files() {
        let dir = tempdir().unwrap();
        let scenario = Scenario {
            floors: vec![corridor()],
            bootstrap_ticks: 3,
            ..Scenario::default()
        };
        let path = dir.path().join("scenario.yaml");
        scenario.to_file(&path).unwrap();
        let read = Scenario::from_file(&path).unwrap();
        assert_eq!(read, scenario);

        let outcome = replay(&read, &standing_ticks(Position::new(3.0, 0.0), 3)).unwrap();
        let out = dir.path().join("out.csv");
        LocalizationRecord::to_csv(&outcome.records, &out).unwrap();
        let back = LocalizationRecord::from_csv(&out).unwrap();
        assert_eq!(back.len(), 3);
        assert_eq!(back[2].committed.as_deref(), Some("b"));
    }
}
