//! End-to-end tests of the localization engine on small synthetic buildings.
//!
//! Signals are generated from the same log-distance formula the bootstrap estimator uses, so a device "standing"
//! at a position produces exactly the expected RSSI of every beacon. The observation model only looks at relative
//! consistency, so these snapshots are informative without being trivially perfect for it.
//!
//! ## Test Structure
//!
//! The tests verify that:
//! 1. The filter only moves the belief along graph edges and respects the speed gate
//! 2. The committed node never changes without `K` consecutive ticks of agreement
//! 3. Bootstrap picks the right floor and a nearby node, and a session can start from it
//! 4. Configuration swaps keep the last committed node when the new floor still has it
//! 5. The background runner ticks, publishes and stops cleanly
use std::thread;
use std::time::{Duration, Instant};

use beaconnav::beacon::{Beacon, BeaconRoster, Floor, FloorData};
use beaconnav::bootstrap::bootstrap;
use beaconnav::config::LocalizationConfig;
use beaconnav::graph::{Edge, Graph, NavGraph, Node};
use beaconnav::observation::expected_rssi;
use beaconnav::session::{LocalizationSession, SessionRunner};
use beaconnav::{MotionSample, Position, SignalSnapshot};

use assert_approx_eq::assert_approx_eq;
use tempfile::tempdir;

/// n1 - n2 - n3 along the x axis with 5 m edges, one beacon 2 m beside each node
fn line_floor() -> Floor {
    let graph = NavGraph::new(Graph::new(
        vec![
            Node::new("n1", 0.0, 0.0),
            Node::new("n2", 5.0, 0.0),
            Node::new("n3", 10.0, 0.0),
        ],
        vec![Edge::new("n1", "n2", 5.0), Edge::new("n2", "n3", 5.0)],
    ))
    .unwrap();
    let roster = BeaconRoster::new(vec![
        Beacon::new("b1", 0.0, 2.0),
        Beacon::new("b2", 5.0, 2.0),
        Beacon::new("b3", 10.0, 2.0),
    ])
    .unwrap();
    Floor::new("line", graph, roster)
}

fn signals_at(roster: &BeaconRoster, at: Position) -> SignalSnapshot {
    roster
        .iter()
        .map(|beacon| {
            (
                beacon.id.clone(),
                expected_rssi(beacon.position().distance_to(&at)),
            )
        })
        .collect()
}

/// Two floors of the same footprint with disjoint beacon sets
fn two_storey() -> Vec<FloorData> {
    let graph = |prefix: &str| {
        Graph::new(
            vec![
                Node::new(format!("{prefix}-lobby"), 0.0, 0.0),
                Node::new(format!("{prefix}-hall"), 8.0, 0.0),
                Node::new(format!("{prefix}-stairs"), 8.0, 8.0),
            ],
            vec![
                Edge::new(format!("{prefix}-lobby"), format!("{prefix}-hall"), 8.0),
                Edge::new(format!("{prefix}-hall"), format!("{prefix}-stairs"), 8.0),
            ],
        )
    };
    vec![
        FloorData {
            id: "ground".to_string(),
            graph: graph("g"),
            beacons: vec![
                Beacon::new("g:01", 0.0, 1.0),
                Beacon::new("g:02", 8.0, 1.0),
                Beacon::new("g:03", 8.0, 9.0),
            ],
        },
        FloorData {
            id: "first".to_string(),
            graph: graph("f"),
            beacons: vec![
                Beacon::new("f:01", 0.0, 1.0),
                Beacon::new("f:02", 8.0, 1.0),
                Beacon::new("f:03", 8.0, 9.0),
            ],
        },
    ]
}

#[test]
fn test_walk_along_line_follows_edges() {
    let floor = line_floor();
    let at_n3 = signals_at(&floor.roster, Position::new(10.0, 0.0));
    // 4 s ticks: a 5 m edge needs 1.25 m/s, within the speed gate
    let config = LocalizationConfig {
        tick_rate_hz: 0.25,
        ..LocalizationConfig::default()
    };
    let mut session = LocalizationSession::with_start(floor, config, Some("n1")).unwrap();
    let walking_east = MotionSample::new(2, Some(0.0));

    let first = session.tick(&at_n3, &walking_east).clone();
    assert_eq!(first.diagnostics.raw_best.as_deref(), Some("n2"));
    assert!(first.belief.iter().all(|(id, _)| id != "n3"));
    assert_eq!(first.committed.as_deref(), Some("n1"));

    let mut committed = Vec::new();
    for _ in 0..4 {
        let state = session.tick(&at_n3, &walking_east);
        let total: f64 = state.belief.iter().map(|(_, p)| p).sum();
        assert_approx_eq!(total, 1.0, 1e-9);
        committed.push(state.committed.clone().unwrap());
    }
    assert_eq!(committed.last().map(|id| id.as_str()), Some("n3"));
    // the reported position never skips n2, even once the belief has moved on to n3
    assert_eq!(session.state().path_history, vec!["n1", "n2", "n3"]);
}

#[test]
fn test_speed_gate_holds_position() {
    let floor = line_floor();
    let at_n3 = signals_at(&floor.roster, Position::new(10.0, 0.0));
    // 1 s ticks: every 5 m edge would need 5 m/s
    let config = LocalizationConfig {
        tick_rate_hz: 1.0,
        ..LocalizationConfig::default()
    };
    let mut session = LocalizationSession::with_start(floor, config, Some("n1")).unwrap();
    for _ in 0..6 {
        let state = session.tick(&at_n3, &MotionSample::new(3, Some(0.0)));
        assert_eq!(state.committed.as_deref(), Some("n1"));
        assert_eq!(state.belief.len(), 1);
        assert_approx_eq!(state.confidence, 1.0);
    }
}

#[test]
fn test_commit_requires_k_consecutive_wins() {
    let floor = line_floor();
    let positions = [
        Position::new(0.0, 0.0),
        Position::new(5.0, 0.0),
        Position::new(0.0, 0.0),
        Position::new(5.0, 0.0),
        Position::new(5.0, 0.0),
        Position::new(5.0, 0.0),
        Position::new(10.0, 0.0),
        Position::new(5.0, 0.0),
        Position::new(10.0, 0.0),
        Position::new(10.0, 0.0),
        Position::new(10.0, 0.0),
    ];
    for k in 1..=3u32 {
        let config = LocalizationConfig {
            tick_rate_hz: 0.25,
            hysteresis_k: k,
            ..LocalizationConfig::default()
        };
        let mut session = LocalizationSession::with_start(floor.clone(), config, Some("n1")).unwrap();
        let mut raw_history: Vec<String> = Vec::new();
        let mut previous = "n1".to_string();
        for at in positions {
            let state = session
                .tick(&signals_at(&floor.roster, at), &MotionSample::new(1, None))
                .clone();
            raw_history.push(state.diagnostics.raw_best.clone().unwrap());
            let committed = state.committed.clone().unwrap();
            if committed != previous {
                // a change of committed node needs one raw best for the last k ticks, and moves one edge
                // toward it
                let target = raw_history.last().unwrap();
                assert!(raw_history.len() >= k as usize);
                assert!(
                    raw_history
                        .iter()
                        .rev()
                        .take(k as usize)
                        .all(|best| best == target),
                    "k = {}: committed {} after raw bests {:?}",
                    k,
                    committed,
                    raw_history
                );
                assert!(
                    floor.graph.neighbors(&previous).iter().any(|(id, _)| *id == committed),
                    "k = {}: committed {} is not next to {}",
                    k,
                    committed,
                    previous
                );
            }
            previous = committed;
        }
    }
}

#[test]
fn test_bootstrap_then_track() {
    let floors: Vec<Floor> = two_storey()
        .into_iter()
        .map(|data| Floor::try_from(data).unwrap())
        .collect();
    let first = &floors[1];
    let near_stairs = Position::new(8.0, 7.0);
    let burst: Vec<SignalSnapshot> = (0..3)
        .map(|_| signals_at(&first.roster, near_stairs))
        .collect();
    let mut aggregate = SignalSnapshot::aggregate(&burst);
    // a faint beacon from the floor below leaks through
    aggregate.insert("g:03", -92.0);

    let result = bootstrap(&aggregate, &floors).unwrap();
    assert_eq!(result.floor_id, "first");
    assert_eq!(result.node_id, "f-stairs");
    assert_eq!(result.floor_score.mismatches, 1);
    assert!((0.0..=1.0).contains(&result.confidence));

    let config = LocalizationConfig {
        tick_rate_hz: 0.2,
        ..LocalizationConfig::default()
    };
    let mut session = LocalizationSession::from_bootstrap(&result, &floors, config).unwrap();
    assert_eq!(session.floor_id(), "first");
    let state = session.tick(&signals_at(&first.roster, near_stairs), &MotionSample::stationary());
    assert_eq!(state.committed.as_deref(), Some("f-stairs"));
    assert!(!state.diagnostics.signal_starved);
}

#[test]
fn test_bootstrap_refuses_to_guess() {
    let floors: Vec<Floor> = two_storey()
        .into_iter()
        .map(|data| Floor::try_from(data).unwrap())
        .collect();
    assert!(bootstrap(&SignalSnapshot::new(), &floors).is_none());
    let unknown: SignalSnapshot = vec![("zz:99", -40.0)].into_iter().collect();
    assert!(bootstrap(&unknown, &floors).is_none());
    let balanced: SignalSnapshot = vec![("g:01", -70.0), ("f:01", -70.0)].into_iter().collect();
    assert!(bootstrap(&balanced, &floors).is_none());
}

#[test]
fn test_signal_starvation_then_recovery() {
    let floor = line_floor();
    let at_n2 = signals_at(&floor.roster, Position::new(5.0, 0.0));
    let config = LocalizationConfig {
        tick_rate_hz: 0.25,
        ..LocalizationConfig::default()
    };
    let mut session = LocalizationSession::with_start(floor, config, Some("n2")).unwrap();
    let confident = session.tick(&at_n2, &MotionSample::stationary()).confidence;
    assert!(confident > 0.3);

    let lone: SignalSnapshot = vec![("b2", -55.0)].into_iter().collect();
    let mut last = f64::INFINITY;
    for _ in 0..5 {
        let state = session.tick(&lone, &MotionSample::stationary());
        assert!(state.diagnostics.signal_starved);
        assert_eq!(state.committed.as_deref(), Some("n2"));
        assert!(state.confidence <= 0.3);
        assert!(state.confidence < last);
        assert!(state.belief.is_empty());
        last = state.confidence;
    }
    let empty = session.tick(&SignalSnapshot::new(), &MotionSample::stationary());
    assert!(empty.diagnostics.signal_starved);
    assert_eq!(empty.diagnostics.visible_beacons, 0);
    assert!(empty.belief.is_empty());

    let recovered = session.tick(&at_n2, &MotionSample::stationary());
    assert!(!recovered.diagnostics.signal_starved);
    assert_eq!(recovered.committed.as_deref(), Some("n2"));
    assert!(recovered.confidence > last);
    let total: f64 = recovered.belief.iter().map(|(_, p)| p).sum();
    assert_approx_eq!(total, 1.0, 1e-9);
}

#[test]
fn test_config_file_drives_session() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("localization.toml");
    let config = LocalizationConfig {
        tick_rate_hz: 0.25,
        hysteresis_k: 3,
        calibration_enabled: true,
        calibration_confidence_threshold: 0.5,
        ..LocalizationConfig::default()
    };
    config.to_file(&path).unwrap();
    let loaded = LocalizationConfig::from_file(&path).unwrap();
    assert_eq!(loaded, config);

    let floor = line_floor();
    // a phone reading every beacon 6 dB hot
    let at_n1: SignalSnapshot = signals_at(&floor.roster, Position::new(0.0, 0.0))
        .iter()
        .map(|(id, rssi)| (id, rssi + 6.0))
        .collect();
    let mut session = LocalizationSession::with_start(floor, loaded, Some("n1")).unwrap();
    let state = session.tick(&at_n1, &MotionSample::stationary()).clone();
    assert!(state.confidence > 0.5);
    assert!(state.diagnostics.calibrated);
    assert_approx_eq!(session.filter().observation().bias("b1"), 0.05 * 6.0, 1e-9);
}

#[test]
fn test_reconfigure_across_floors() {
    let floors: Vec<Floor> = two_storey()
        .into_iter()
        .map(|data| Floor::try_from(data).unwrap())
        .collect();
    let mut session =
        LocalizationSession::with_start(floors[0].clone(), LocalizationConfig::default(), Some("g-hall"))
            .unwrap();
    // same floor, new configuration: the committed node survives
    let tuned = LocalizationConfig {
        search_radius_m: 12.0,
        ..LocalizationConfig::default()
    };
    session.reconfigure(floors[0].clone(), tuned).unwrap();
    assert_eq!(session.state().committed.as_deref(), Some("g-hall"));
    assert_eq!(session.filter().history().to_vec(), vec!["g-hall".to_string()]);
    // different floor: nothing to seed from
    session
        .reconfigure(floors[1].clone(), LocalizationConfig::default())
        .unwrap();
    assert!(session.state().committed.is_none());
    let state = session.tick(
        &signals_at(&floors[1].roster, Position::new(0.0, 0.0)),
        &MotionSample::stationary(),
    );
    assert_eq!(state.committed.as_deref(), Some("f-lobby"));
}

#[test]
fn test_runner_reconfigure_and_stop() {
    let floor = line_floor();
    let roster = floor.roster.clone();
    let config = LocalizationConfig {
        tick_rate_hz: 40.0,
        ..LocalizationConfig::default()
    };
    let session = LocalizationSession::with_start(floor.clone(), config.clone(), Some("n2")).unwrap();
    let signals = move || signals_at(&roster, Position::new(5.0, 0.0));
    let runner = SessionRunner::spawn(session, signals, MotionSample::stationary).unwrap();

    let wait_for_ticks = |runner: &SessionRunner<_, _>, ticks: u64| {
        let deadline = Instant::now() + Duration::from_secs(5);
        while runner.latest().diagnostics.tick < ticks && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    };
    wait_for_ticks(&runner, 2);
    assert_eq!(runner.latest().committed.as_deref(), Some("n2"));

    let slower = LocalizationConfig {
        hysteresis_k: 5,
        ..config
    };
    let runner = runner.reconfigure(floor, slower).unwrap();
    let ticks_before = runner.latest().diagnostics.tick;
    wait_for_ticks(&runner, ticks_before + 2);
    let state = runner.state();
    assert_eq!(state.read().unwrap().committed.as_deref(), Some("n2"));

    let (session, _, _) = runner.stop().unwrap();
    assert_eq!(session.config().hysteresis_k, 5);
    assert!(session.state().diagnostics.tick >= ticks_before + 2);
}
