//! One-shot floor and starting node estimation from a single scan burst.
//!
//! The bootstrap estimator runs once, before steady-state tracking, on an aggregated snapshot collected over a
//! multi-second window (see [`SignalSnapshot::aggregate`]). It works in two stages:
//!
//! 1. Floor selection. Each floor is scored by how many visible beacons belong to it, how loud they are, and how
//!    many visible beacons belong elsewhere:
//!
//!    $$
//!    S_{floor} = 10 m + \frac{\bar{s} + 100}{10} - 2 u
//!    $$
//!
//!    where $m$ counts matching beacons, $\bar{s}$ is their mean RSSI and $u$ counts mismatches.
//! 2. Node estimation on the chosen floor with a quick absolute-RSSI score
//!
//!    $$
//!    q(n) = -\sum_b \frac{|s_b - s(d_{b,n})|}{10}
//!    $$
//!
//!    using the log-distance formula [`expected_rssi`].
//!
//! Any failure (nothing observed, no distinguishable floor, empty graph) yields `None`. The caller is expected
//! to fall back to a manual start rather than guess.
use log::{debug, info, warn};

use crate::beacon::{Beacon, BeaconRoster, Floor};
use crate::graph::{NavGraph, Node};
use crate::observation::expected_rssi;
use crate::{NodeId, SignalSnapshot};

/// Weight of each matching beacon in the floor score
pub const MATCH_WEIGHT: f64 = 10.0;
/// Penalty of each visible beacon that belongs to another floor
pub const MISMATCH_PENALTY: f64 = 2.0;
/// Floor scores closer than this are treated as a tie
pub const FLOOR_TIE_TOLERANCE: f64 = 1e-9;
/// Confidence reported when fewer than two nodes could be scored
pub const MIDPOINT_CONFIDENCE: f64 = 0.5;

/// Evidence for one floor.
#[derive(Clone, Debug, PartialEq)]
pub struct FloorScore {
    pub floor_id: String,
    /// Visible beacons on this floor's roster
    pub matches: usize,
    /// Visible beacons not on this floor's roster
    pub mismatches: usize,
    /// Mean RSSI of the matching beacons
    pub mean_rssi: Option<f64>,
    pub score: f64,
}

/// Score a single floor against an aggregated snapshot.
pub fn score_floor(snapshot: &SignalSnapshot, floor: &Floor) -> FloorScore {
    let matched: Vec<f64> = floor.roster.matched(snapshot).map(|(_, rssi)| rssi).collect();
    let matches = matched.len();
    let mismatches = snapshot.len() - matches;
    let mean_rssi = if matched.is_empty() {
        None
    } else {
        Some(matched.iter().sum::<f64>() / matches as f64)
    };
    let signal_term = mean_rssi.map_or(0.0, |mean| (mean + 100.0) / 10.0);
    let score = MATCH_WEIGHT * matches as f64 + signal_term - MISMATCH_PENALTY * mismatches as f64;
    FloorScore {
        floor_id: floor.id.clone(),
        matches,
        mismatches,
        mean_rssi,
        score,
    }
}

/// Pick the floor with the highest score.
///
/// # Returns
/// * `None` when the snapshot is empty, no floor matches any visible beacon, or the two best floors tie.
pub fn select_floor<'a>(snapshot: &SignalSnapshot, floors: &'a [Floor]) -> Option<(&'a Floor, FloorScore)> {
    if snapshot.is_empty() {
        warn!("Bootstrap floor selection: empty snapshot");
        return None;
    }
    let mut scored: Vec<(&Floor, FloorScore)> = floors
        .iter()
        .map(|floor| (floor, score_floor(snapshot, floor)))
        .collect();
    for (_, score) in &scored {
        debug!(
            "floor {}: {} matches, {} mismatches, mean {:?} -> score {:.2}",
            score.floor_id, score.matches, score.mismatches, score.mean_rssi, score.score
        );
    }
    scored.sort_by(|a, b| b.1.score.total_cmp(&a.1.score));
    let mut ranked = scored.into_iter();
    let (floor, best) = ranked.next()?;
    if best.matches == 0 {
        warn!("Bootstrap floor selection: no visible beacon belongs to any floor");
        return None;
    }
    if let Some((_, runner_up)) = ranked.next() {
        if (best.score - runner_up.score).abs() < FLOOR_TIE_TOLERANCE {
            warn!(
                "Bootstrap floor selection: floors {} and {} tie at {:.2}",
                best.floor_id, runner_up.floor_id, best.score
            );
            return None;
        }
    }
    Some((floor, best))
}

/// Quick absolute-RSSI score of a node, `None` if no observed beacon is on the roster
pub fn quick_score(node: &Node, snapshot: &SignalSnapshot, roster: &BeaconRoster) -> Option<f64> {
    let position = node.position();
    let mut total = 0.0;
    let mut used = 0;
    for (beacon, rssi) in roster.matched(snapshot) {
        let expected = expected_rssi(beacon.position().distance_to(&position));
        total -= (rssi - expected).abs() / 10.0;
        used += 1;
    }
    if used == 0 { None } else { Some(total) }
}

/// Best starting node on a floor.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeEstimate {
    pub node_id: NodeId,
    pub score: f64,
    /// In [0, 1], see [`estimate_node`]
    pub confidence: f64,
}

/// Estimate the starting node on `graph` from the quick score.
///
/// Confidence is the gap between the best and second best score divided by the magnitude of the best, clamped to
/// [0, 1]. It is [`MIDPOINT_CONFIDENCE`] when fewer than two nodes could be scored and 0 when fewer than two
/// beacons were observed.
pub fn estimate_node(snapshot: &SignalSnapshot, graph: &NavGraph, roster: &BeaconRoster) -> Option<NodeEstimate> {
    if snapshot.is_empty() || graph.is_empty() || roster.is_empty() {
        return None;
    }
    let mut scored: Vec<(&Node, f64)> = graph
        .nodes()
        .filter_map(|node| quick_score(node, snapshot, roster).map(|score| (node, score)))
        .filter(|(_, score)| score.is_finite())
        .collect();
    // stable sort keeps graph order among equal scores
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    let (best_node, best) = *scored.first()?;
    let confidence = if snapshot.len() < 2 {
        0.0
    } else if scored.len() < 2 {
        MIDPOINT_CONFIDENCE
    } else {
        let gap = best - scored[1].1;
        (gap / best.abs().max(f64::EPSILON)).clamp(0.0, 1.0)
    };
    Some(NodeEstimate {
        node_id: best_node.id.clone(),
        score: best,
        confidence,
    })
}

/// Outcome of a successful bootstrap.
#[derive(Clone, Debug)]
pub struct BootstrapResult {
    pub floor_id: String,
    pub node_id: NodeId,
    pub confidence: f64,
    pub floor_score: FloorScore,
    /// Roster beacons that contributed to the estimate
    pub beacons: Vec<Beacon>,
}

/// Run floor selection followed by node estimation.
///
/// # Arguments
/// * `snapshot` - Aggregated snapshot of the initial scan window.
/// * `floors` - Every floor the device could be on.
///
/// # Returns
/// * `None` on any failure; the caller must start manually.
pub fn bootstrap(snapshot: &SignalSnapshot, floors: &[Floor]) -> Option<BootstrapResult> {
    let (floor, floor_score) = select_floor(snapshot, floors)?;
    if floor.graph.is_empty() {
        warn!("Bootstrap aborted: floor {} has an empty graph", floor.id);
        return None;
    }
    let Some(estimate) = estimate_node(snapshot, &floor.graph, &floor.roster) else {
        warn!("Bootstrap aborted: no node on floor {} could be scored", floor.id);
        return None;
    };
    let beacons: Vec<Beacon> = floor
        .roster
        .matched(snapshot)
        .map(|(beacon, _)| beacon.clone())
        .collect();
    info!(
        "Bootstrap selected floor {} node {} (confidence {:.2}, {} beacons)",
        floor.id,
        estimate.node_id,
        estimate.confidence,
        beacons.len()
    );
    Some(BootstrapResult {
        floor_id: floor.id.clone(),
        node_id: estimate.node_id,
        confidence: estimate.confidence,
        floor_score,
        beacons,
    })
}
