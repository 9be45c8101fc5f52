//! Observation (measurement) model for BLE signal snapshots.
//!
//! Absolute RSSI is a poor range estimate indoors: transmit power differs between beacons, bodies and walls
//! attenuate unevenly, and phones disagree on calibration. The model therefore scores a candidate node by
//! _relative_ consistency between geometry and signal, using two complementary terms.
//!
//! ### Rank term
//!
//! The matched beacons are ranked by true distance to the node (ascending) and independently by observed signal
//! strength (descending). Spearman's rank correlation $\rho$ between the two rankings rewards nodes whose
//! nearest beacons are also the loudest:
//!
//! $$
//! \ell_{rank} = \alpha \rho
//! $$
//!
//! ### Pairwise term
//!
//! For every ordered pair $(i, j)$ of matched beacons a log-distance path loss proxy predicts the signal
//! difference from the distance ratio, and the residual against the observed difference is passed through a
//! logistic:
//!
//! $$
//! r_{ij} = (s_i - s_j) - \kappa \log_{10}\frac{d_j}{d_i}, \quad
//! \ell_{pair} = \beta \sum_{i \neq j} \log\left(\max\left(\sigma(r_{ij} / \tau), \epsilon\right)\right)
//! $$
//!
//! Since $r_{ji} = -r_{ij}$, each unordered pair contributes $\log\sigma(r/\tau) + \log\sigma(-r/\tau)$, which
//! peaks when the residual is zero.
//!
//! When none of the observed identifiers are on the roster (for example before the name-to-address mapping has
//! resolved), the model switches to an explicit [`ObservationMode::FallbackProxy`] that only looks at the mean
//! signal strength.
use std::collections::HashMap;

use log::{debug, trace};

use crate::beacon::{Beacon, BeaconRoster};
use crate::config::LocalizationConfig;
use crate::graph::Node;
use crate::{BeaconId, SignalSnapshot};

/// Reference RSSI at one meter for the log-distance path loss formula (dBm)
pub const REFERENCE_RSSI_DBM: f64 = -50.0;
/// Path loss slope for the log-distance formula (dB per decade)
pub const PATH_LOSS_SLOPE_DB: f64 = 20.0;
/// Floor applied to every pairwise consistency score before taking its log
pub const PAIR_EPSILON: f64 = 1e-9;
/// Distances are floored to this value before any logarithm (meters)
pub const MIN_DISTANCE_M: f64 = 0.5;
/// Signal range mapped linearly onto the fallback score
pub const FALLBACK_RSSI_RANGE_DBM: (f64, f64) = (-100.0, -30.0);
/// Upper end of the fallback score
pub const FALLBACK_MAX_SCORE: f64 = 7.0;

/// Expected RSSI at `distance` meters from a beacon under the simple log-distance model
///
/// $$
/// s(d) = -50 - 20 \log_{10}(\max(d, 1))
/// $$
pub fn expected_rssi(distance: f64) -> f64 {
    REFERENCE_RSSI_DBM - PATH_LOSS_SLOPE_DB * distance.max(1.0).log10()
}

/// How a snapshot is interpreted against the roster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObservationMode {
    /// At least one observed identifier is a known beacon; geometry is used
    ResolvedIdentity,
    /// No observed identifier is known; only the mean signal strength is used
    FallbackProxy,
    /// Nothing was observed
    Empty,
}

#[derive(Clone, Debug)]
pub struct ObservationModel {
    roster: BeaconRoster,
    /// Rank weight $\alpha$
    pub rank_weight: f64,
    /// Pairwise weight $\beta$
    pub pairwise_weight: f64,
    /// Distance-ratio slope $\kappa$
    pub distance_ratio_slope: f64,
    /// Logistic scale $\tau$ for pairwise residuals
    pub pair_residual_scale_db: f64,
    /// Bound on the magnitude of calibration biases
    pub calibration_clamp_db: f64,
    biases: HashMap<BeaconId, f64>,
}
impl ObservationModel {
    /// Create a model with the default weights ($\alpha = 3$, $\beta = 1$, $\kappa = 8$)
    pub fn new(roster: BeaconRoster) -> ObservationModel {
        ObservationModel::from_config(roster, &LocalizationConfig::default())
    }
    pub fn from_config(roster: BeaconRoster, config: &LocalizationConfig) -> ObservationModel {
        ObservationModel {
            roster,
            rank_weight: config.rank_weight,
            pairwise_weight: config.pairwise_weight,
            distance_ratio_slope: config.distance_ratio_slope,
            pair_residual_scale_db: config.pair_residual_scale_db,
            calibration_clamp_db: config.calibration_clamp_db,
            biases: HashMap::new(),
        }
    }
    pub fn with_weights(mut self, rank_weight: f64, pairwise_weight: f64, slope: f64) -> Self {
        self.rank_weight = rank_weight;
        self.pairwise_weight = pairwise_weight;
        self.distance_ratio_slope = slope;
        self
    }
    pub fn roster(&self) -> &BeaconRoster {
        &self.roster
    }
    pub fn mode(&self, snapshot: &SignalSnapshot) -> ObservationMode {
        if snapshot.is_empty() {
            ObservationMode::Empty
        } else if self.roster.count_matched(snapshot) > 0 {
            ObservationMode::ResolvedIdentity
        } else {
            ObservationMode::FallbackProxy
        }
    }
    /// Current calibration bias of a beacon in dB (0 until learned)
    pub fn bias(&self, id: &str) -> f64 {
        self.biases.get(id).copied().unwrap_or(0.0)
    }
    pub fn reset_calibration(&mut self) {
        self.biases.clear();
    }
    /// Unnormalized log-likelihood that a device observing `snapshot` is at `node`.
    ///
    /// # Returns
    /// * `-inf` for an empty snapshot, a finite value for any non-empty snapshot.
    pub fn log_likelihood(&self, node: &Node, snapshot: &SignalSnapshot) -> f64 {
        match self.mode(snapshot) {
            ObservationMode::Empty => f64::NEG_INFINITY,
            ObservationMode::FallbackProxy => fallback_score(snapshot),
            ObservationMode::ResolvedIdentity => {
                let readings = self.corrected_readings(node, snapshot);
                let rank = self.rank_weight * spearman_rho(&readings);
                let pairwise = self.pairwise_weight * self.pairwise_log_consistency(&readings);
                trace!(
                    "node {}: rank term {:.3}, pairwise term {:.3}",
                    node.id, rank, pairwise
                );
                rank + pairwise
            }
        }
    }
    /// Nudge per-beacon biases toward the residual observed at `node`.
    ///
    /// The residual is the observed RSSI minus [`expected_rssi`] at the beacon's distance. Each bias is smoothed
    /// exponentially with `learning_rate` and clamped to `±calibration_clamp_db`. Only the filter may call this,
    /// and only on ticks whose confidence exceeds the configured threshold.
    pub fn update_calibration(&mut self, node: &Node, snapshot: &SignalSnapshot, learning_rate: f64) {
        if !learning_rate.is_finite() {
            return;
        }
        let rate = learning_rate.clamp(0.0, 1.0);
        let clamp = self.calibration_clamp_db;
        let position = node.position();
        let updates: Vec<(BeaconId, f64)> = self
            .roster
            .matched(snapshot)
            .map(|(beacon, rssi)| {
                let residual = rssi - expected_rssi(beacon.position().distance_to(&position));
                (beacon.id.clone(), residual)
            })
            .collect();
        for (id, residual) in updates {
            let bias = self.biases.entry(id).or_insert(0.0);
            *bias = (*bias + rate * (residual - *bias)).clamp(-clamp, clamp);
        }
        debug!(
            "Calibration updated at {} from {} beacons",
            node.id,
            self.roster.count_matched(snapshot)
        );
    }
    /// Matched beacons with (distance to node, bias-corrected RSSI)
    fn corrected_readings<'a>(
        &'a self,
        node: &Node,
        snapshot: &'a SignalSnapshot,
    ) -> Vec<(&'a Beacon, f64, f64)> {
        let position = node.position();
        self.roster
            .matched(snapshot)
            .map(|(beacon, rssi)| {
                let distance = beacon.position().distance_to(&position).max(MIN_DISTANCE_M);
                (beacon, distance, rssi - self.bias(&beacon.id))
            })
            .collect()
    }
    fn pairwise_log_consistency(&self, readings: &[(&Beacon, f64, f64)]) -> f64 {
        let scale = self.pair_residual_scale_db;
        let mut total = 0.0;
        for (i, (_, dist_i, rssi_i)) in readings.iter().enumerate() {
            for (j, (_, dist_j, rssi_j)) in readings.iter().enumerate() {
                if i == j {
                    continue;
                }
                let expected = self.distance_ratio_slope * (dist_j / dist_i).log10();
                let residual = (rssi_i - rssi_j) - expected;
                total += logistic(residual / scale).max(PAIR_EPSILON).ln();
            }
        }
        total
    }
}

fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Mean signal strength mapped linearly onto [0, 7]
fn fallback_score(snapshot: &SignalSnapshot) -> f64 {
    let (low, high) = FALLBACK_RSSI_RANGE_DBM;
    match snapshot.mean_rssi() {
        Some(mean) => ((mean - low) / (high - low)).clamp(0.0, 1.0) * FALLBACK_MAX_SCORE,
        None => f64::NEG_INFINITY,
    }
}

/// Fractional (average for ties) ranks, 1-based, of `values` sorted ascending
fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    let mut ranks = vec![0.0; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start;
        while end + 1 < order.len() && values[order[end + 1]] == values[order[start]] {
            end += 1;
        }
        let rank = (start + end) as f64 / 2.0 + 1.0;
        for &idx in &order[start..=end] {
            ranks[idx] = rank;
        }
        start = end + 1;
    }
    ranks
}

/// Spearman correlation between distance rank (ascending) and signal rank (descending).
///
/// Computed as the Pearson correlation of the fractional ranks so that ties are handled. Fewer than two
/// readings, or a ranking with no spread, yields 0.
fn spearman_rho(readings: &[(&Beacon, f64, f64)]) -> f64 {
    if readings.len() < 2 {
        return 0.0;
    }
    let distances: Vec<f64> = readings.iter().map(|(_, d, _)| *d).collect();
    // stronger = closer, so rank the negated signal ascending
    let signals: Vec<f64> = readings.iter().map(|(_, _, s)| -*s).collect();
    let distance_ranks = average_ranks(&distances);
    let signal_ranks = average_ranks(&signals);
    let n = readings.len() as f64;
    let mean = (n + 1.0) / 2.0;
    let mut covariance = 0.0;
    let mut var_d = 0.0;
    let mut var_s = 0.0;
    for (rd, rs) in distance_ranks.iter().zip(signal_ranks.iter()) {
        covariance += (rd - mean) * (rs - mean);
        var_d += (rd - mean).powi(2);
        var_s += (rs - mean).powi(2);
    }
    let denominator = (var_d * var_s).sqrt();
    if denominator <= f64::EPSILON {
        0.0
    } else {
        covariance / denominator
    }
}
