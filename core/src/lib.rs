//! Indoor localization toolbox for BLE beacon and step/heading fusion
//!
//! This crate estimates which node of an indoor navigation graph a pedestrian currently occupies. It fuses two
//! noisy data streams, a smoothed map of beacon received-signal-strength (RSSI) values and a per-tick sample of
//! detected steps and heading, using a discrete hidden Markov model over the graph nodes. The output is a node
//! identifier (the finest position granularity of the graph) together with a confidence score, not a metric
//! trajectory.
//!
//! As with any Bayesian estimator the engine is split into a small number of independent pieces:
//!
//! - [`graph`]: the immutable navigation graph and its adjacency index.
//! - [`observation`]: the measurement model, scoring how well a node's geometry explains an RSSI snapshot.
//! - [`transition`]: the motion model, scoring how plausible a move along an edge is given steps and heading.
//! - [`hmm`]: the recursive filter that combines both models with an online max-product (Viterbi) recursion and
//!   a hysteresis rule that suppresses jitter in the reported position.
//! - [`bootstrap`]: a one-shot estimator that picks a starting floor and node from a single scan burst.
//! - [`session`]: the tick loop that feeds live sensor streams into the filter and publishes the belief state.
//!
//! Supporting modules provide the beacon roster ([`beacon`]), configuration ([`config`]) and CSV based scenario
//! replay ([`sim`]).
//!
//! This crate does not scan for beacons, does not read inertial sensors, and does not perform any network or
//! disk I/O inside the tick path. The signal snapshot is assumed to be _already_ time-windowed and smoothed by
//! the scanner, and the motion sample is assumed to be _already_ debounced by the step detector. Both are handed
//! to the engine as owned values, so the filter never observes data mutating mid-computation.
//!
//! ## Coordinate conventions
//!
//! Node and beacon positions are 2-D coordinates in meters in a floor-local frame. Headings are in radians,
//! measured counter-clockwise from the positive x axis of the same frame, so that the heading of an edge from
//! $p_a$ to $p_b$ is
//!
//! $$
//! \psi = \operatorname{atan2}(y_b - y_a, x_b - x_a)
//! $$
//!
//! ## Log domain arithmetic
//!
//! All likelihoods and beliefs are carried as natural logarithms. Normalization uses the usual max-shift
//! stabilization:
//!
//! $$
//! \log p_i = w_i - \left( m + \log \sum_j e^{w_j - m} \right), \quad m = \max_j w_j
//! $$
//!
//! which is implemented once in [`log_normalize`] and shared by the transition model and the filter.

pub mod beacon;
pub mod bootstrap;
pub mod config;
pub mod graph;
pub mod hmm;
pub mod observation;
pub mod session;
pub mod sim;
pub mod transition;

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};

/// Identifier of a navigation graph node
pub type NodeId = String;
/// Identifier of a beacon, ideally its hardware address
pub type BeaconId = String;

/// A 2-D position in the floor-local metric frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// x coordinate in meters
    pub x: f64,
    /// y coordinate in meters
    pub y: f64,
}
impl Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.2}, {:.2})", self.x, self.y)
    }
}
impl From<(f64, f64)> for Position {
    fn from(tuple: (f64, f64)) -> Self {
        Position::new(tuple.0, tuple.1)
    }
}
impl Position {
    pub fn new(x: f64, y: f64) -> Position {
        Position { x, y }
    }
    pub fn to_point(&self) -> Point2<f64> {
        Point2::new(self.x, self.y)
    }
    /// Planar Euclidean distance in meters
    pub fn distance_to(&self, other: &Position) -> f64 {
        nalgebra::distance(&self.to_point(), &other.to_point())
    }
    /// Heading in radians of the vector from `self` to `other`.
    ///
    /// Returns `None` when both positions coincide, as the direction is undefined.
    pub fn heading_to(&self, other: &Position) -> Option<f64> {
        let delta: Vector2<f64> = other.to_point() - self.to_point();
        if delta.norm() <= f64::EPSILON {
            None
        } else {
            Some(delta.y.atan2(delta.x))
        }
    }
}

/// A smoothed map of beacon identifier to received signal strength (dBm).
///
/// Produced once per tick by the external scanner. Non-finite readings are dropped on insertion so that every
/// value held by a snapshot is usable. A `BTreeMap` is used to keep iteration order, and therefore floating
/// point summation order, deterministic.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalSnapshot {
    readings: BTreeMap<BeaconId, f64>,
}
impl Display for SignalSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignalSnapshot {{")?;
        for (i, (id, rssi)) in self.readings.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, " {}: {:.1}", id, rssi)?;
        }
        write!(f, " }}")
    }
}
impl FromIterator<(BeaconId, f64)> for SignalSnapshot {
    fn from_iter<I: IntoIterator<Item = (BeaconId, f64)>>(iter: I) -> Self {
        let mut snapshot = SignalSnapshot::new();
        for (id, rssi) in iter {
            snapshot.insert(id, rssi);
        }
        snapshot
    }
}
impl<'a> FromIterator<(&'a str, f64)> for SignalSnapshot {
    fn from_iter<I: IntoIterator<Item = (&'a str, f64)>>(iter: I) -> Self {
        iter.into_iter()
            .map(|(id, rssi)| (id.to_string(), rssi))
            .collect()
    }
}
impl SignalSnapshot {
    pub fn new() -> SignalSnapshot {
        SignalSnapshot {
            readings: BTreeMap::new(),
        }
    }
    /// Insert or replace a reading. Non-finite values are ignored.
    pub fn insert(&mut self, id: impl Into<BeaconId>, rssi: f64) {
        if rssi.is_finite() {
            self.readings.insert(id.into(), rssi);
        }
    }
    pub fn get(&self, id: &str) -> Option<f64> {
        self.readings.get(id).copied()
    }
    pub fn contains(&self, id: &str) -> bool {
        self.readings.contains_key(id)
    }
    pub fn len(&self) -> usize {
        self.readings.len()
    }
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.readings.iter().map(|(id, rssi)| (id.as_str(), *rssi))
    }
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.readings.keys().map(|id| id.as_str())
    }
    /// Mean RSSI over all readings, `None` for an empty snapshot
    pub fn mean_rssi(&self) -> Option<f64> {
        if self.readings.is_empty() {
            return None;
        }
        Some(self.readings.values().sum::<f64>() / self.readings.len() as f64)
    }
    /// Average several snapshots beacon by beacon.
    ///
    /// Used to build the aggregated multi-second scan window consumed by the bootstrap estimator. A beacon's
    /// average only includes the snapshots in which it was actually seen.
    pub fn aggregate(snapshots: &[SignalSnapshot]) -> SignalSnapshot {
        let mut sums: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
        for snapshot in snapshots {
            for (id, rssi) in snapshot.iter() {
                let entry = sums.entry(id).or_insert((0.0, 0));
                entry.0 += rssi;
                entry.1 += 1;
            }
        }
        sums.into_iter()
            .map(|(id, (sum, count))| (id, sum / count as f64))
            .collect()
    }
}

/// Steps and heading accumulated by the motion tracker since the previous tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    /// Steps detected since the last tick
    pub steps: u32,
    /// Heading in radians, `None` while the heading estimate has not converged
    pub heading: Option<f64>,
}
impl Display for MotionSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.heading {
            Some(heading) => write!(
                f,
                "MotionSample {{ steps: {}, heading: {:.1}° }}",
                self.steps,
                heading.to_degrees()
            ),
            None => write!(f, "MotionSample {{ steps: {}, heading: none }}", self.steps),
        }
    }
}
impl MotionSample {
    pub fn new(steps: u32, heading: Option<f64>) -> MotionSample {
        // a NaN heading from an unconverged compass is the same as no heading
        let heading = heading.filter(|h| h.is_finite());
        MotionSample { steps, heading }
    }
    /// A sample with no detected steps and no heading
    pub fn stationary() -> MotionSample {
        MotionSample::default()
    }
    pub fn is_moving(&self) -> bool {
        self.steps > 0
    }
}

/// Normalize a set of unnormalized log-weights into log-probabilities.
///
/// Non-finite weights are discarded before normalization. The maximum weight is subtracted before
/// exponentiating to avoid overflow. When nothing finite remains, or the exponentiated sum is degenerate, the
/// result is empty and the caller must treat it as "no usable distribution".
///
/// # Arguments
/// * `weights` - Pairs of key and unnormalized log-weight.
///
/// # Returns
/// * The same keys with log-probabilities whose exponentials sum to one, or an empty vector.
///
/// # Example
/// ```rust
/// use beaconnav::log_normalize;
/// let normalized = log_normalize(vec![("a", 0.0), ("b", 0.0), ("c", f64::NAN)]);
/// assert_eq!(normalized.len(), 2);
/// assert!((normalized[0].1.exp() - 0.5).abs() < 1e-12);
/// ```
pub fn log_normalize<K>(weights: Vec<(K, f64)>) -> Vec<(K, f64)> {
    let finite: Vec<(K, f64)> = weights.into_iter().filter(|(_, w)| w.is_finite()).collect();
    let max = finite
        .iter()
        .map(|(_, w)| *w)
        .fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return Vec::new();
    }
    let sum: f64 = finite.iter().map(|(_, w)| (w - max).exp()).sum();
    if !sum.is_finite() || sum < MIN_NORMALIZATION_SUM {
        return Vec::new();
    }
    let log_total = max + sum.ln();
    finite
        .into_iter()
        .map(|(key, w)| (key, w - log_total))
        .collect()
}
/// Smallest exponentiated sum accepted by [`log_normalize`]
pub const MIN_NORMALIZATION_SUM: f64 = 1e-300;

/// Wrap an angle to the range $\pm\pi$ radians
///
/// # Example
/// ```rust
/// use beaconnav::wrap_to_pi;
/// use std::f64::consts::PI;
/// let wrapped_angle = wrap_to_pi(3.0 * PI / 2.0);
/// assert!((wrapped_angle + PI / 2.0).abs() < 1e-12);
/// ```
pub fn wrap_to_pi<T>(angle: T) -> T
where
    T: PartialOrd + Copy + std::ops::SubAssign + std::ops::AddAssign + From<f64>,
{
    let mut wrapped: T = angle;
    while wrapped > T::from(std::f64::consts::PI) {
        wrapped -= T::from(2.0 * std::f64::consts::PI);
    }
    while wrapped < T::from(-std::f64::consts::PI) {
        wrapped += T::from(2.0 * std::f64::consts::PI);
    }
    wrapped
}
/// Signed smallest difference `a - b` between two headings, in $\pm\pi$
pub fn angle_difference(a: f64, b: f64) -> f64 {
    if !a.is_finite() || !b.is_finite() {
        return f64::NAN;
    }
    wrap_to_pi(a - b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    #[test]
    fn test_wrap_to_pi() {
        assert_approx_eq!(wrap_to_pi(3.0 * PI), PI);
        assert_approx_eq!(wrap_to_pi(-3.0 * PI), -PI);
        assert_eq!(wrap_to_pi(0.0), 0.0);
        assert_approx_eq!(wrap_to_pi(1.5 * PI), -0.5 * PI);
    }
    #[test]
    fn test_angle_difference_wraps() {
        assert_approx_eq!(angle_difference(0.1, 2.0 * PI - 0.1), 0.2);
        assert_approx_eq!(angle_difference(PI / 2.0, 0.0), PI / 2.0);
        assert!(angle_difference(f64::NAN, 0.0).is_nan());
    }
    #[test]
    fn test_position_distance_and_heading() {
        let a = Position::new(0.0, 0.0);
        let b = Position::new(3.0, 4.0);
        assert_approx_eq!(a.distance_to(&b), 5.0);
        assert_approx_eq!(a.heading_to(&Position::new(0.0, 2.0)).unwrap(), PI / 2.0);
        assert!(a.heading_to(&a).is_none());
    }
    #[test]
    fn test_snapshot_drops_non_finite() {
        let mut snapshot = SignalSnapshot::new();
        snapshot.insert("a", -60.0);
        snapshot.insert("b", f64::NAN);
        snapshot.insert("c", f64::NEG_INFINITY);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("a"), Some(-60.0));
        assert!(!snapshot.contains("b"));
    }
    #[test]
    fn test_snapshot_mean_and_aggregate() {
        let first: SignalSnapshot = vec![("a", -60.0), ("b", -80.0)].into_iter().collect();
        let second: SignalSnapshot = vec![("a", -70.0)].into_iter().collect();
        assert_approx_eq!(first.mean_rssi().unwrap(), -70.0);
        assert!(SignalSnapshot::new().mean_rssi().is_none());
        let aggregate = SignalSnapshot::aggregate(&[first, second]);
        assert_approx_eq!(aggregate.get("a").unwrap(), -65.0);
        assert_approx_eq!(aggregate.get("b").unwrap(), -80.0);
    }
    #[test]
    fn test_motion_sample_nan_heading() {
        let sample = MotionSample::new(2, Some(f64::NAN));
        assert!(sample.heading.is_none());
        assert!(sample.is_moving());
        assert!(!MotionSample::stationary().is_moving());
    }
    #[test]
    fn test_log_normalize_sums_to_one() {
        let normalized = log_normalize(vec![(1, -1000.0), (2, -1001.0), (3, -1002.5)]);
        let total: f64 = normalized.iter().map(|(_, lp)| lp.exp()).sum();
        assert_approx_eq!(total, 1.0, 1e-12);
        assert!(normalized[0].1 > normalized[1].1);
    }
    #[test]
    fn test_log_normalize_degenerate() {
        let empty: Vec<(u8, f64)> = log_normalize(vec![(1, f64::NEG_INFINITY), (2, f64::NAN)]);
        assert!(empty.is_empty());
        let nothing: Vec<(u8, f64)> = log_normalize(Vec::new());
        assert!(nothing.is_empty());
    }
}
