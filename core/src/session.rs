//! Localization session: the tick loop around the recursive filter.
//!
//! [`LocalizationSession`] performs one tick at a time and is the unit of state ownership: the filter, its belief
//! and hysteresis counters, and the published [`SessionState`] all belong to exactly one session. It applies
//! the controller-level policies that sit on top of the filter:
//!
//! - signal starvation: with fewer than `min_visible_beacons` readings the filter is skipped and the reported
//!   confidence decays geometrically, capped at a low ceiling,
//! - optional self-calibration of the observation model on confident ticks,
//! - junction ambiguity: the top two posteriors differ by less than `junction_margin`.
//!
//! [`SessionRunner`] drives a session periodically on its own thread. Cancellation is cooperative and only
//! observed between ticks, so a belief update is never interrupted half way. Configuration swaps stop the loop,
//! rebuild the models, and restart it.
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, info, warn};

use crate::beacon::Floor;
use crate::bootstrap::BootstrapResult;
use crate::config::LocalizationConfig;
use crate::hmm::HmmFilter;
use crate::{MotionSample, NodeId, SignalSnapshot};

/// Longest single sleep of the runner loop, bounding how late a stop request is noticed
const POLL_SLICE: Duration = Duration::from_millis(20);

/// Source of smoothed signal snapshots, typically the BLE scanner.
///
/// Implementations hand over an owned snapshot so the engine never sees data change mid-tick.
pub trait SignalSource: Send {
    fn snapshot(&mut self) -> SignalSnapshot;
}
/// Source of per-tick motion samples, typically the step detector and compass.
pub trait MotionSource: Send {
    fn sample(&mut self) -> MotionSample;
}
impl<F> SignalSource for F
where
    F: FnMut() -> SignalSnapshot + Send,
{
    fn snapshot(&mut self) -> SignalSnapshot {
        self()
    }
}
impl<F> MotionSource for F
where
    F: FnMut() -> MotionSample + Send,
{
    fn sample(&mut self) -> MotionSample {
        self()
    }
}

/// Per-tick diagnostic fields.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Diagnostics {
    /// 1-based index of the tick that produced this state, 0 before the first tick
    pub tick: u64,
    pub visible_beacons: usize,
    /// Too few beacons were visible and the filter did not run
    pub signal_starved: bool,
    /// The filter ran but could not produce a usable belief
    pub belief_degenerate: bool,
    /// The top two posteriors are within the junction margin
    pub junction_ambiguous: bool,
    /// The observation model was recalibrated this tick
    pub calibrated: bool,
    /// Raw arg-max of the belief before hysteresis
    pub raw_best: Option<NodeId>,
    pub candidates: usize,
    pub processing_time: Duration,
}

/// Externally observable state after a tick.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionState {
    pub floor_id: String,
    /// The hysteresis-stabilized "you are here" node
    pub committed: Option<NodeId>,
    /// In [0, 1]
    pub confidence: f64,
    /// Belief of the last filtered tick as (node, probability), highest first
    pub belief: Vec<(NodeId, f64)>,
    /// Most recent committed nodes, oldest first
    pub path_history: Vec<NodeId>,
    pub diagnostics: Diagnostics,
}
impl Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[tick {}] {} @ {} (p = {:.3}, beacons = {}{}{})",
            self.diagnostics.tick,
            self.floor_id,
            self.committed.as_deref().unwrap_or("-"),
            self.confidence,
            self.diagnostics.visible_beacons,
            if self.diagnostics.signal_starved { ", starved" } else { "" },
            if self.diagnostics.junction_ambiguous { ", junction" } else { "" },
        )
    }
}

/// A single-floor localization session.
#[derive(Clone, Debug)]
pub struct LocalizationSession {
    floor: Floor,
    config: LocalizationConfig,
    filter: HmmFilter,
    state: SessionState,
}
impl LocalizationSession {
    /// Start a session whose first tick commits the best node of a uniform belief.
    pub fn new(floor: Floor, config: LocalizationConfig) -> Result<LocalizationSession> {
        LocalizationSession::with_start(floor, config, None)
    }
    /// Start a session, optionally pinned to a known node.
    pub fn with_start(
        floor: Floor,
        config: LocalizationConfig,
        start: Option<&str>,
    ) -> Result<LocalizationSession> {
        config.validate().context("invalid localization configuration")?;
        if floor.graph.is_empty() {
            bail!("floor '{}' has no navigation nodes", floor.id);
        }
        let mut filter = HmmFilter::for_floor(&floor, &config);
        match start {
            Some(node) => filter.initialize_at(node)?,
            None => filter.initialize_uniform(),
        }
        let state = SessionState {
            floor_id: floor.id.clone(),
            committed: filter.committed().map(|id| id.to_string()),
            confidence: filter.last_confidence(),
            belief: filter.belief(),
            path_history: filter.history().to_vec(),
            diagnostics: Diagnostics::default(),
        };
        info!("Session started on {} with start {:?}", floor, start);
        Ok(LocalizationSession {
            floor,
            config,
            filter,
            state,
        })
    }
    /// Start from a bootstrap result, picking its floor out of `floors`.
    pub fn from_bootstrap(
        result: &BootstrapResult,
        floors: &[Floor],
        config: LocalizationConfig,
    ) -> Result<LocalizationSession> {
        let floor = floors
            .iter()
            .find(|floor| floor.id == result.floor_id)
            .ok_or_else(|| anyhow!("bootstrap floor '{}' is not loaded", result.floor_id))?;
        LocalizationSession::with_start(floor.clone(), config, Some(&result.node_id))
    }
    pub fn floor(&self) -> &Floor {
        &self.floor
    }
    pub fn floor_id(&self) -> &str {
        &self.floor.id
    }
    pub fn config(&self) -> &LocalizationConfig {
        &self.config
    }
    pub fn filter(&self) -> &HmmFilter {
        &self.filter
    }
    pub fn state(&self) -> &SessionState {
        &self.state
    }
    /// Run one tick with the configured tick duration.
    pub fn tick(&mut self, snapshot: &SignalSnapshot, motion: &MotionSample) -> &SessionState {
        let dt = self.config.tick_duration_s();
        self.tick_with_duration(snapshot, motion, dt)
    }
    /// Run one tick with an explicit elapsed time, used when replaying recorded data.
    ///
    /// Never fails: insufficient or degenerate input holds the committed node, decays the confidence and publishes
    /// an empty belief.
    pub fn tick_with_duration(
        &mut self,
        snapshot: &SignalSnapshot,
        motion: &MotionSample,
        dt_s: f64,
    ) -> &SessionState {
        let started = Instant::now();
        let visible = snapshot.len();
        let mut diagnostics = Diagnostics {
            tick: self.state.diagnostics.tick + 1,
            visible_beacons: visible,
            ..Diagnostics::default()
        };

        if visible < self.config.min_visible_beacons {
            if !self.state.diagnostics.signal_starved {
                warn!(
                    "Signal starved: {} beacons visible, holding {:?}",
                    visible, self.state.committed
                );
            }
            diagnostics.signal_starved = true;
            self.state.confidence = self.decayed_confidence();
            self.state.belief.clear();
        } else {
            let estimate = self.filter.update(snapshot, motion, dt_s);
            diagnostics.raw_best = estimate.best.clone();
            diagnostics.candidates = estimate.candidates;
            if estimate.is_degenerate() {
                debug!("Degenerate belief on tick {}", diagnostics.tick);
                diagnostics.belief_degenerate = true;
                self.state.confidence = self.decayed_confidence();
                self.state.belief.clear();
            } else {
                if self.config.calibration_enabled {
                    diagnostics.calibrated = self.filter.calibrate(
                        snapshot,
                        self.config.calibration_confidence_threshold,
                        self.config.calibration_learning_rate,
                    );
                }
                diagnostics.junction_ambiguous = match estimate.top_two() {
                    (Some(first), Some(second)) => first - second < self.config.junction_margin,
                    _ => false,
                };
                self.state.confidence = estimate.confidence.clamp(0.0, 1.0);
                self.state.belief = estimate.belief;
            }
            self.state.committed = estimate.committed;
        }
        self.state.path_history = self.filter.history().to_vec();
        diagnostics.processing_time = started.elapsed();
        self.state.diagnostics = diagnostics;
        debug!("{}", self.state);
        &self.state
    }
    /// Swap in a new floor and configuration.
    ///
    /// The models are rebuilt and the filter reinitialized, seeded with the last committed node when the new
    /// floor still contains it. On error the session is left untouched.
    pub fn reconfigure(&mut self, floor: Floor, config: LocalizationConfig) -> Result<()> {
        let seed = self
            .state
            .committed
            .clone()
            .filter(|node| floor.graph.contains(node));
        let previous = self.floor.id.clone();
        let tick = self.state.diagnostics.tick;
        let mut rebuilt = LocalizationSession::with_start(floor, config, seed.as_deref())?;
        rebuilt.state.diagnostics.tick = tick;
        *self = rebuilt;
        info!(
            "Session reconfigured from floor {} to {}, seeded at {:?}",
            previous, self.floor.id, seed
        );
        Ok(())
    }
    /// Drop all belief and history and start again from a uniform belief.
    pub fn reset(&mut self) {
        self.filter.reset();
        self.filter.initialize_uniform();
        self.state = SessionState {
            floor_id: self.floor.id.clone(),
            ..SessionState::default()
        };
    }
    fn decayed_confidence(&self) -> f64 {
        (self.state.confidence * self.config.starved_decay).min(self.config.starved_confidence_ceiling)
    }
}

/// Handle of a session ticking periodically on a background thread.
pub struct SessionRunner<S, M> {
    running: Arc<AtomicBool>,
    state: Arc<RwLock<SessionState>>,
    handle: Option<JoinHandle<(LocalizationSession, S, M)>>,
}
impl<S, M> SessionRunner<S, M>
where
    S: SignalSource + 'static,
    M: MotionSource + 'static,
{
    /// Spawn the tick loop at the session's configured tick rate.
    pub fn spawn(session: LocalizationSession, signals: S, motion: M) -> Result<SessionRunner<S, M>> {
        let running = Arc::new(AtomicBool::new(true));
        let state = Arc::new(RwLock::new(session.state().clone()));
        let name = format!("beaconnav-{}", session.floor_id());
        let handle = {
            let running = Arc::clone(&running);
            let state = Arc::clone(&state);
            thread::Builder::new()
                .name(name)
                .spawn(move || run_session_loop(session, signals, motion, running, state))
                .context("failed to spawn session thread")?
        };
        Ok(SessionRunner {
            running,
            state,
            handle: Some(handle),
        })
    }
    /// Shared handle to the published state
    pub fn state(&self) -> Arc<RwLock<SessionState>> {
        Arc::clone(&self.state)
    }
    /// Copy of the most recently published state
    pub fn latest(&self) -> SessionState {
        match self.state.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
            && self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }
    /// Request the loop to stop after the current tick.
    pub fn cancel(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
    /// Stop the loop and get the session and sources back.
    pub fn stop(mut self) -> Result<(LocalizationSession, S, M)> {
        self.cancel();
        let handle = self
            .handle
            .take()
            .ok_or_else(|| anyhow!("session thread already joined"))?;
        handle
            .join()
            .map_err(|_| anyhow!("session thread panicked"))
    }
    /// Stop, rebuild the session for a new floor and configuration, and restart.
    ///
    /// On failure the loop stays stopped and the error is returned.
    pub fn reconfigure(self, floor: Floor, config: LocalizationConfig) -> Result<SessionRunner<S, M>> {
        let (mut session, signals, motion) = self.stop()?;
        session.reconfigure(floor, config)?;
        SessionRunner::spawn(session, signals, motion)
    }
}
impl<S, M> Drop for SessionRunner<S, M> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

fn run_session_loop<S: SignalSource, M: MotionSource>(
    mut session: LocalizationSession,
    mut signals: S,
    mut motion: M,
    running: Arc<AtomicBool>,
    published: Arc<RwLock<SessionState>>,
) -> (LocalizationSession, S, M) {
    let loop_interval = Duration::from_secs_f64(session.config().tick_duration_s());
    info!(
        "Session loop running at {}Hz ({}ms interval)",
        session.config().tick_rate_hz,
        loop_interval.as_millis()
    );
    while running.load(Ordering::Relaxed) {
        let loop_start = Instant::now();
        let snapshot = signals.snapshot();
        let sample = motion.sample();
        let state = session.tick(&snapshot, &sample).clone();
        match published.write() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
        // wait out the rest of the tick, waking regularly to notice a stop request
        while running.load(Ordering::Relaxed) {
            let elapsed = loop_start.elapsed();
            if elapsed >= loop_interval {
                break;
            }
            thread::sleep((loop_interval - elapsed).min(POLL_SLICE));
        }
    }
    info!(
        "Session loop on {} stopped after {} ticks",
        session.floor_id(),
        session.state().diagnostics.tick
    );
    (session, signals, motion)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::{Beacon, BeaconRoster};
    use crate::graph::{Edge, Graph, NavGraph, Node};
    use crate::observation::expected_rssi;
    use crate::Position;
    use assert_approx_eq::assert_approx_eq;

    fn hallway() -> Floor {
        let graph = NavGraph::new(Graph::new(
            vec![
                Node::new("w", 0.0, 0.0),
                Node::new("m", 3.0, 0.0),
                Node::new("e", 6.0, 0.0),
            ],
            vec![Edge::new("w", "m", 3.0), Edge::new("m", "e", 3.0)],
        ))
        .unwrap();
        let roster = BeaconRoster::new(vec![
            Beacon::new("bw", 0.0, 1.0),
            Beacon::new("bm", 3.0, 1.0),
            Beacon::new("be", 6.0, 1.0),
        ])
        .unwrap();
        Floor::new("G", graph, roster)
    }
    fn signal_at(floor: &Floor, at: Position) -> SignalSnapshot {
        floor
            .roster
            .iter()
            .map(|b| (b.id.clone(), expected_rssi(b.position().distance_to(&at))))
            .collect()
    }

    #[test]
    fn starved_ticks_decay_confidence() {
        let floor = hallway();
        let mut session =
            LocalizationSession::with_start(floor, LocalizationConfig::default(), Some("m")).unwrap();
        assert_approx_eq!(session.state().confidence, 1.0);
        let one: SignalSnapshot = vec![("bm", -55.0)].into_iter().collect();
        let state = session.tick(&one, &MotionSample::stationary()).clone();
        assert!(state.diagnostics.signal_starved);
        assert_eq!(state.diagnostics.visible_beacons, 1);
        assert_approx_eq!(state.confidence, 0.3);
        assert_eq!(state.committed.as_deref(), Some("m"));
        assert!(state.belief.is_empty());
        let state = session.tick(&one, &MotionSample::stationary()).clone();
        assert_approx_eq!(state.confidence, 0.27);
        assert_eq!(state.diagnostics.tick, 2);
    }
    #[test]
    fn filtered_tick_publishes_belief() {
        let floor = hallway();
        let snapshot = signal_at(&floor, Position::new(3.0, 0.0));
        let mut session = LocalizationSession::new(floor, LocalizationConfig::default()).unwrap();
        let state = session.tick(&snapshot, &MotionSample::stationary());
        assert_eq!(state.committed.as_deref(), Some("m"));
        assert!(!state.diagnostics.signal_starved);
        assert_eq!(state.diagnostics.raw_best.as_deref(), Some("m"));
        let total: f64 = state.belief.iter().map(|(_, p)| p).sum();
        assert_approx_eq!(total, 1.0, 1e-9);
        assert_eq!(state.path_history, vec!["m".to_string()]);
    }
    #[test]
    fn junction_flag_on_close_posteriors() {
        let floor = hallway();
        // equidistant from w and m, weakly informative
        let snapshot: SignalSnapshot = vec![("bw", -60.0), ("bm", -60.0)].into_iter().collect();
        let config = LocalizationConfig {
            junction_margin: 1.0,
            ..LocalizationConfig::default()
        };
        let mut session = LocalizationSession::new(floor, config).unwrap();
        let state = session.tick(&snapshot, &MotionSample::stationary());
        assert!(state.diagnostics.junction_ambiguous);
    }
    #[test]
    fn junction_flag_clear_on_decisive_belief() {
        let floor = hallway();
        let at_m = signal_at(&floor, Position::new(3.0, 0.0));
        let mut session =
            LocalizationSession::with_start(floor, LocalizationConfig::default(), Some("m")).unwrap();
        let state = session.tick(&at_m, &MotionSample::stationary());
        let (first, second) = (state.belief[0].1, state.belief.get(1).map_or(0.0, |(_, p)| *p));
        assert!(first - second >= 0.15);
        assert!(!state.diagnostics.junction_ambiguous);
        assert_eq!(state.committed.as_deref(), Some("m"));
    }
    #[test]
    fn reconfigure_seeds_last_committed_node() {
        let floor = hallway();
        let mut session =
            LocalizationSession::with_start(floor.clone(), LocalizationConfig::default(), Some("e")).unwrap();
        let config = LocalizationConfig {
            hysteresis_k: 4,
            ..LocalizationConfig::default()
        };
        session.reconfigure(floor, config).unwrap();
        assert_eq!(session.state().committed.as_deref(), Some("e"));
        assert_eq!(session.config().hysteresis_k, 4);

        let other = Floor::new(
            "H",
            NavGraph::new(Graph::new(vec![Node::new("x", 0.0, 0.0)], Vec::new())).unwrap(),
            BeaconRoster::default(),
        );
        session.reconfigure(other, LocalizationConfig::default()).unwrap();
        assert_eq!(session.floor_id(), "H");
        assert!(session.state().committed.is_none());

        let bad = LocalizationConfig {
            tick_rate_hz: -1.0,
            ..LocalizationConfig::default()
        };
        assert!(session.reconfigure(hallway(), bad).is_err());
        assert_eq!(session.floor_id(), "H");
    }
    #[test]
    fn start_at_unknown_node_fails() {
        assert!(
            LocalizationSession::with_start(hallway(), LocalizationConfig::default(), Some("nowhere")).is_err()
        );
    }
    #[test]
    fn runner_ticks_and_stops_between_ticks() {
        let floor = hallway();
        let snapshot = signal_at(&floor, Position::new(0.0, 0.0));
        let config = LocalizationConfig {
            tick_rate_hz: 50.0,
            ..LocalizationConfig::default()
        };
        let session = LocalizationSession::new(floor, config).unwrap();
        let signals = move || snapshot.clone();
        let motion = MotionSample::stationary;
        let runner = SessionRunner::spawn(session, signals, motion).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while runner.latest().diagnostics.tick < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(runner.is_running());
        let published = runner.latest();
        assert_eq!(published.committed.as_deref(), Some("w"));
        let (session, _, _) = runner.stop().unwrap();
        assert!(session.state().diagnostics.tick >= 3);
        assert_eq!(session.state().committed.as_deref(), Some("w"));
    }
}
