//! Motion (transition) model over the navigation graph.
//!
//! From any node the pedestrian can either stay put or move to a graph neighbor. Raw weights are built in the
//! log domain:
//!
//! - self: $\log w_{stay}$, where $w_{stay}$ is larger when no steps were detected since the last tick,
//! - neighbor: $\log w_{base} + \lambda \cos(\psi_{user} - \psi_{edge}) + \log b$, where the heading term is
//!   only applied when a heading is available and $b$ is the edge's forward bias clamped away from zero.
//!
//! Neighbors that cannot be reached within one tick at the maximum walking speed are removed (speed gate) before
//! the weights are normalized with [`log_normalize`].
use std::collections::HashMap;

use log::trace;

use crate::config::LocalizationConfig;
use crate::graph::NavGraph;
use crate::{MotionSample, NodeId, angle_difference, log_normalize};

/// Lower clamp applied to an edge's forward bias before taking its log
pub const MIN_FORWARD_BIAS: f64 = 0.05;

#[derive(Clone, Debug)]
pub struct TransitionModel {
    /// Speed gate (m/s)
    pub max_walking_speed_mps: f64,
    /// Heading alignment strength $\lambda$
    pub forward_bias_lambda: f64,
    pub stationary_self_weight: f64,
    pub moving_self_weight: f64,
    pub neighbor_base_weight: f64,
}
impl Default for TransitionModel {
    fn default() -> Self {
        TransitionModel::from_config(&LocalizationConfig::default())
    }
}
impl TransitionModel {
    pub fn from_config(config: &LocalizationConfig) -> TransitionModel {
        TransitionModel {
            max_walking_speed_mps: config.max_walking_speed_mps,
            forward_bias_lambda: config.forward_bias_lambda,
            stationary_self_weight: config.stationary_self_weight,
            moving_self_weight: config.moving_self_weight,
            neighbor_base_weight: config.neighbor_base_weight,
        }
    }
    /// `true` when an edge of `length` meters can be walked within `dt_s` seconds
    pub fn is_feasible(&self, length: f64, dt_s: f64) -> bool {
        dt_s > 0.0 && dt_s.is_finite() && length / dt_s <= self.max_walking_speed_mps
    }
    /// Log-probabilities of moving from `from` to itself or any feasible neighbor within one tick.
    ///
    /// # Arguments
    /// * `graph` - The navigation graph.
    /// * `from` - Node the pedestrian is assumed to occupy at the previous tick.
    /// * `motion` - Steps and optional heading accumulated during the tick.
    /// * `dt_s` - Elapsed time of the tick in seconds.
    ///
    /// # Returns
    /// * A map whose exponentiated values sum to one. It always contains `from` itself unless `from` is unknown
    ///   or the weights are degenerate, in which case it is empty ("no feasible transition this tick").
    pub fn log_transitions(
        &self,
        graph: &NavGraph,
        from: &str,
        motion: &MotionSample,
        dt_s: f64,
    ) -> HashMap<NodeId, f64> {
        if !graph.contains(from) {
            return HashMap::new();
        }
        let self_weight = if motion.is_moving() {
            self.moving_self_weight
        } else {
            self.stationary_self_weight
        };
        let mut raw: Vec<(NodeId, f64)> = vec![(from.to_string(), self_weight.ln())];
        for (neighbor, edge) in graph.neighbors(from) {
            if !self.is_feasible(edge.length, dt_s) {
                trace!(
                    "speed gate: {} needs {:.2} m/s",
                    edge,
                    edge.length / dt_s
                );
                continue;
            }
            let mut log_weight = self.neighbor_base_weight.ln();
            if let (Some(heading), Some(edge_heading)) = (motion.heading, graph.edge_heading(edge)) {
                log_weight += self.forward_bias_lambda * angle_difference(heading, edge_heading).cos();
            }
            log_weight += edge.forward_bias.clamp(MIN_FORWARD_BIAS, 1.0).ln();
            raw.push((neighbor.clone(), log_weight));
        }
        // parallel edges to the same neighbor keep the stronger one
        let mut merged: HashMap<NodeId, f64> = HashMap::with_capacity(raw.len());
        for (id, w) in raw {
            merged
                .entry(id)
                .and_modify(|existing| *existing = existing.max(w))
                .or_insert(w);
        }
        log_normalize(merged.into_iter().collect()).into_iter().collect()
    }
}
