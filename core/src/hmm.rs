//! Recursive hidden Markov model filter over graph nodes.
//!
//! The filter keeps a log-domain belief over a candidate subset of nodes and advances it once per tick with a
//! single max-product (Viterbi) step:
//!
//! $$
//! b_t(n) = \log p(z_t \mid n) + \max_{m \in \{n\} \cup \mathcal{N}(n)} \left( b_{t-1}(m) + \log p(n \mid m, u_t) \right)
//! $$
//!
//! followed by normalization. Only the best path into each node survives, so the belief tracks the most likely
//! explanation rather than the marginal occupancy.
//!
//! The node reported to callers is not the raw arg-max of the belief. A hysteresis rule requires a new arg-max
//! to win `K` consecutive ticks before it displaces the committed node, which suppresses jitter from single
//! noisy scans.
//!
//! ## State machine
//!
//! ```text
//! Uninitialized --initialize_at / initialize_uniform / first update--> Tracking(commit state)
//! Tracking --reset--> Uninitialized
//! ```
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::{self, Display};

use anyhow::{Result, bail};
use log::{debug, info, trace};

use crate::beacon::Floor;
use crate::config::LocalizationConfig;
use crate::graph::{Edge, NavGraph};
use crate::observation::ObservationModel;
use crate::transition::TransitionModel;
use crate::{MotionSample, NodeId, SignalSnapshot, log_normalize};

/// Bounded FIFO of committed positions, kept for diagnostics only.
#[derive(Clone, Debug, PartialEq)]
pub struct PathHistory {
    entries: VecDeque<NodeId>,
    capacity: usize,
}
impl Default for PathHistory {
    fn default() -> Self {
        PathHistory::new(10)
    }
}
impl PathHistory {
    pub fn new(capacity: usize) -> PathHistory {
        let capacity = capacity.max(1);
        PathHistory {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }
    /// Append `id` unless it equals the most recent entry. The oldest entry drops off when full.
    pub fn push(&mut self, id: &str) -> bool {
        if self.entries.back().is_some_and(|last| last == id) {
            return false;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(id.to_string());
        true
    }
    pub fn last(&self) -> Option<&str> {
        self.entries.back().map(|id| id.as_str())
    }
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|id| id.as_str())
    }
    pub fn to_vec(&self) -> Vec<NodeId> {
        self.entries.iter().cloned().collect()
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    pub fn capacity(&self) -> usize {
        self.capacity
    }
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Committed node plus the pending challenger of the hysteresis rule.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommitState {
    pub committed: Option<NodeId>,
    pub pending: Option<NodeId>,
    pub pending_count: u32,
}
impl CommitState {
    pub fn pinned(node: &str) -> CommitState {
        CommitState {
            committed: Some(node.to_string()),
            pending: None,
            pending_count: 0,
        }
    }
    /// Apply the hysteresis rule for this tick's arg-max.
    ///
    /// - nothing committed yet: commit immediately,
    /// - `best` is the committed node: clear the pending slot,
    /// - `best` is the pending node: extend its streak,
    /// - otherwise `best` becomes the pending node with a streak of one.
    ///
    /// A pending node whose streak reaches `threshold` is committed.
    ///
    /// # Returns
    /// * `true` if the committed node changed.
    pub fn observe(&mut self, best: &str, threshold: u32) -> bool {
        self.observe_toward(best, threshold, |_, target| Some(target.to_string()))
    }
    /// Apply the hysteresis rule, moving the committed node at most one `step` per tick.
    ///
    /// `step(committed, target)` names the node to commit on the way to a confirmed `target`, or `None` when
    /// nothing reachable leads there. While the step falls short of `target` the challenger stays pending with
    /// its streak, so it is committed on the first tick it still wins and is one step away.
    pub fn observe_toward<F>(&mut self, best: &str, threshold: u32, step: F) -> bool
    where
        F: FnOnce(&str, &str) -> Option<NodeId>,
    {
        let current = match self.committed.as_deref() {
            None => {
                self.commit(best);
                return true;
            }
            Some(current) if current == best => {
                self.pending = None;
                self.pending_count = 0;
                return false;
            }
            Some(current) => current.to_string(),
        };
        if self.pending.as_deref() == Some(best) {
            self.pending_count += 1;
        } else {
            self.pending = Some(best.to_string());
            self.pending_count = 1;
        }
        if self.pending_count < threshold {
            return false;
        }
        match step(&current, best) {
            Some(next) if next == best => {
                self.commit(best);
                true
            }
            Some(next) if next != current => {
                self.committed = Some(next);
                true
            }
            _ => false,
        }
    }
    fn commit(&mut self, node: &str) {
        self.committed = Some(node.to_string());
        self.pending = None;
        self.pending_count = 0;
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub enum FilterState {
    #[default]
    Uninitialized,
    Tracking(CommitState),
}

/// Structural parameters of the filter itself.
#[derive(Clone, Debug)]
pub struct FilterSettings {
    pub hysteresis_k: u32,
    pub search_radius_m: f64,
    pub small_graph_nodes: usize,
    pub path_history_capacity: usize,
}
impl Default for FilterSettings {
    fn default() -> Self {
        FilterSettings::from_config(&LocalizationConfig::default())
    }
}
impl FilterSettings {
    pub fn from_config(config: &LocalizationConfig) -> FilterSettings {
        FilterSettings {
            hysteresis_k: config.hysteresis_k.max(1),
            search_radius_m: config.search_radius_m,
            small_graph_nodes: config.small_graph_nodes,
            path_history_capacity: config.path_history_capacity,
        }
    }
}

/// Result of one filter update.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TickEstimate {
    /// Hysteresis-stabilized position, the authoritative output
    pub committed: Option<NodeId>,
    /// Top posterior probability, 0 when no usable belief was produced
    pub confidence: f64,
    /// Raw arg-max of this tick's belief
    pub best: Option<NodeId>,
    /// Normalized belief as (node, probability), highest first; empty when degenerate
    pub belief: Vec<(NodeId, f64)>,
    /// Number of candidate nodes evaluated
    pub candidates: usize,
}
impl Display for TickEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TickEstimate {{ committed: {}, best: {}, confidence: {:.3}, candidates: {} }}",
            self.committed.as_deref().unwrap_or("-"),
            self.best.as_deref().unwrap_or("-"),
            self.confidence,
            self.candidates
        )
    }
}
impl TickEstimate {
    /// The two highest posterior probabilities, if present
    pub fn top_two(&self) -> (Option<f64>, Option<f64>) {
        (
            self.belief.first().map(|(_, p)| *p),
            self.belief.get(1).map(|(_, p)| *p),
        )
    }
    pub fn is_degenerate(&self) -> bool {
        self.belief.is_empty()
    }
}

/// Online Viterbi filter with hysteresis.
///
/// One instance owns all mutable localization state of a session (belief, hysteresis counters, path history).
/// Separate sessions need separate instances.
#[derive(Clone, Debug)]
pub struct HmmFilter {
    graph: NavGraph,
    observation: ObservationModel,
    transition: TransitionModel,
    settings: FilterSettings,
    state: FilterState,
    log_belief: HashMap<NodeId, f64>,
    history: PathHistory,
    last_confidence: f64,
}
impl HmmFilter {
    pub fn new(
        graph: NavGraph,
        observation: ObservationModel,
        transition: TransitionModel,
        settings: FilterSettings,
    ) -> HmmFilter {
        let history = PathHistory::new(settings.path_history_capacity);
        HmmFilter {
            graph,
            observation,
            transition,
            settings,
            state: FilterState::Uninitialized,
            log_belief: HashMap::new(),
            history,
            last_confidence: 0.0,
        }
    }
    /// Build the graph/observation/transition trio for a floor from a configuration
    pub fn for_floor(floor: &Floor, config: &LocalizationConfig) -> HmmFilter {
        HmmFilter::new(
            floor.graph.clone(),
            ObservationModel::from_config(floor.roster.clone(), config),
            TransitionModel::from_config(config),
            FilterSettings::from_config(config),
        )
    }
    pub fn graph(&self) -> &NavGraph {
        &self.graph
    }
    pub fn observation(&self) -> &ObservationModel {
        &self.observation
    }
    pub fn state(&self) -> &FilterState {
        &self.state
    }
    pub fn history(&self) -> &PathHistory {
        &self.history
    }
    pub fn committed(&self) -> Option<&str> {
        match &self.state {
            FilterState::Tracking(commit) => commit.committed.as_deref(),
            FilterState::Uninitialized => None,
        }
    }
    /// Confidence of the most recent non-degenerate update
    pub fn last_confidence(&self) -> f64 {
        self.last_confidence
    }
    /// Current belief as (node, probability), highest first
    pub fn belief(&self) -> Vec<(NodeId, f64)> {
        sorted_probabilities(&self.log_belief)
    }
    /// The two most probable nodes of the current belief
    pub fn top_two(&self) -> Vec<(NodeId, f64)> {
        let mut belief = self.belief();
        belief.truncate(2);
        belief
    }
    /// Pin the filter to a known starting node.
    pub fn initialize_at(&mut self, node: &str) -> Result<()> {
        if !self.graph.contains(node) {
            bail!("cannot initialize at unknown node '{}'", node);
        }
        self.log_belief.clear();
        self.log_belief.insert(node.to_string(), 0.0);
        self.state = FilterState::Tracking(CommitState::pinned(node));
        self.history.clear();
        self.history.push(node);
        self.last_confidence = 1.0;
        info!("Filter initialized at {}", node);
        Ok(())
    }
    /// Start from a uniform belief over every node with nothing committed.
    ///
    /// The first tick's arg-max is committed immediately. Path history starts over.
    pub fn initialize_uniform(&mut self) {
        let n = self.graph.len();
        self.log_belief = if n == 0 {
            HashMap::new()
        } else {
            let log_p = -(n as f64).ln();
            self.graph
                .node_ids()
                .map(|id| (id.to_string(), log_p))
                .collect()
        };
        self.state = FilterState::Tracking(CommitState::default());
        self.history.clear();
        self.last_confidence = 0.0;
        info!("Filter initialized with a uniform belief over {} nodes", n);
    }
    /// Return to `Uninitialized`, dropping belief, counters and history.
    pub fn reset(&mut self) {
        self.state = FilterState::Uninitialized;
        self.log_belief.clear();
        self.history.clear();
        self.last_confidence = 0.0;
    }
    /// Candidate nodes for this tick.
    ///
    /// Small graphs are searched exhaustively; on large graphs only nodes within the search radius of the
    /// committed node are considered, falling back to all nodes while nothing is committed.
    fn candidates(&self) -> Vec<NodeId> {
        let committed = self.committed();
        match committed {
            Some(node) if self.graph.len() > self.settings.small_graph_nodes => self
                .graph
                .nodes_within_radius_of(node, self.settings.search_radius_m)
                .into_iter()
                .map(|n| n.id.clone())
                .collect(),
            _ => self.graph.node_ids().map(|id| id.to_string()).collect(),
        }
    }
    /// Advance the belief by one tick.
    ///
    /// # Arguments
    /// * `snapshot` - Smoothed RSSI readings for this tick.
    /// * `motion` - Steps and heading since the previous tick.
    /// * `dt_s` - Tick duration in seconds, used by the speed gate.
    ///
    /// # Returns
    /// * The tick's estimate. Degenerate input (empty snapshot, no candidates, nothing normalizable) never
    ///   fails: the previous belief and committed node are held and the estimate reports confidence 0.
    pub fn update(
        &mut self,
        snapshot: &SignalSnapshot,
        motion: &MotionSample,
        dt_s: f64,
    ) -> TickEstimate {
        if self.state == FilterState::Uninitialized {
            debug!("update on an uninitialized filter, starting from a uniform belief");
            self.initialize_uniform();
        }
        if snapshot.is_empty() {
            return self.hold(0);
        }
        let candidates = self.candidates();
        if candidates.is_empty() {
            return self.hold(0);
        }
        let candidate_set: HashSet<&str> = candidates.iter().map(|id| id.as_str()).collect();

        // best predecessor score for each candidate reachable this tick
        let mut best_into: HashMap<&str, f64> = HashMap::with_capacity(candidates.len());
        let uniform_prior;
        let prior: &HashMap<NodeId, f64> = if self.log_belief.is_empty() {
            uniform_prior = candidates
                .iter()
                .map(|id| (id.clone(), 0.0))
                .collect::<HashMap<NodeId, f64>>();
            &uniform_prior
        } else {
            &self.log_belief
        };
        for (predecessor, prior_log) in prior {
            if !prior_log.is_finite() {
                continue;
            }
            let transitions = self
                .transition
                .log_transitions(&self.graph, predecessor, motion, dt_s);
            for (target, log_t) in transitions {
                let Some(&target) = candidate_set.get(target.as_str()) else {
                    continue;
                };
                let score = prior_log + log_t;
                best_into
                    .entry(target)
                    .and_modify(|best| *best = best.max(score))
                    .or_insert(score);
            }
        }

        let mut unnormalized: Vec<(NodeId, f64)> = Vec::with_capacity(best_into.len());
        for (id, path_score) in best_into {
            if let Some(node) = self.graph.node(id) {
                let obs = self.observation.log_likelihood(node, snapshot);
                unnormalized.push((id.to_string(), obs + path_score));
            }
        }
        let normalized = log_normalize(unnormalized);
        if normalized.is_empty() {
            debug!("belief degenerate this tick, holding {:?}", self.committed());
            return self.hold(candidates.len());
        }
        self.log_belief = normalized.into_iter().collect();
        let belief = sorted_probabilities(&self.log_belief);
        let (best, confidence) = match belief.first() {
            Some((id, p)) => (id.clone(), *p),
            None => return self.hold(candidates.len()),
        };

        let threshold = self.settings.hysteresis_k;
        let FilterState::Tracking(commit) = &mut self.state else {
            return self.hold(candidates.len());
        };
        let previous = commit.committed.clone();
        let step = |from: &str, target: &str| {
            step_toward(&self.graph, &self.transition, dt_s, &belief, from, target)
        };
        if commit.observe_toward(&best, threshold, step) {
            info!(
                "Committed position {} -> {} toward {} (p = {:.3})",
                previous.as_deref().unwrap_or("-"),
                commit.committed.as_deref().unwrap_or("-"),
                best,
                confidence
            );
        } else if let Some(pending) = &commit.pending {
            trace!("pending {} streak {}/{}", pending, commit.pending_count, threshold);
        }
        let committed = commit.committed.clone();
        if let Some(node) = committed.as_deref() {
            self.history.push(node);
        }
        self.last_confidence = confidence;
        TickEstimate {
            committed,
            confidence,
            best: Some(best),
            belief,
            candidates: candidates.len(),
        }
    }
    /// Self-train the observation model on the committed node.
    ///
    /// Skipped unless the last update's confidence exceeds `confidence_threshold`, so low-confidence ticks never
    /// corrupt the calibration.
    ///
    /// # Returns
    /// * `true` if calibration was updated.
    pub fn calibrate(
        &mut self,
        snapshot: &SignalSnapshot,
        confidence_threshold: f64,
        learning_rate: f64,
    ) -> bool {
        if self.last_confidence <= confidence_threshold || snapshot.is_empty() {
            return false;
        }
        let Some(node) = self.committed().and_then(|id| self.graph.node(id)).cloned() else {
            return false;
        };
        self.observation
            .update_calibration(&node, snapshot, learning_rate);
        true
    }
    fn hold(&self, candidates: usize) -> TickEstimate {
        TickEstimate {
            committed: self.committed().map(|id| id.to_string()),
            confidence: 0.0,
            best: None,
            belief: Vec::new(),
            candidates,
        }
    }
}

/// Exponentiate a log belief and sort by probability (descending), then id for determinism
fn sorted_probabilities(log_belief: &HashMap<NodeId, f64>) -> Vec<(NodeId, f64)> {
    let mut belief: Vec<(NodeId, f64)> = log_belief
        .iter()
        .map(|(id, lp)| (id.clone(), lp.exp()))
        .collect();
    belief.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    belief
}

/// Next node to commit when walking from `from` toward `target` within one tick.
///
/// `target` itself when it is `from` or a feasible neighbor. Otherwise the feasible neighbor on the shortest walk
/// to `target`, ties going to the more probable node of `belief`. `None` when no feasible edge gets closer.
fn step_toward(
    graph: &NavGraph,
    transition: &TransitionModel,
    dt_s: f64,
    belief: &[(NodeId, f64)],
    from: &str,
    target: &str,
) -> Option<NodeId> {
    if from == target {
        return Some(target.to_string());
    }
    let feasible: Vec<&(NodeId, Edge)> = graph
        .neighbors(from)
        .iter()
        .filter(|(_, edge)| transition.is_feasible(edge.length, dt_s))
        .collect();
    if feasible.iter().any(|(id, _)| id == target) {
        return Some(target.to_string());
    }
    let remaining = graph.path_lengths_from(target);
    let here = *remaining.get(from)?;
    let probability = |id: &str| {
        belief
            .iter()
            .find(|(node, _)| node == id)
            .map_or(0.0, |(_, p)| *p)
    };
    feasible
        .into_iter()
        .filter_map(|(id, _)| remaining.get(id.as_str()).map(|left| (id, *left)))
        .filter(|(_, left)| *left < here)
        .min_by(|a, b| {
            a.1.total_cmp(&b.1)
                .then_with(|| probability(b.0.as_str()).total_cmp(&probability(a.0.as_str())))
        })
        .map(|(id, _)| id.clone())
}
