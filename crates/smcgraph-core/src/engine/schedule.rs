//! Node sampling schedule and particle-value lifetimes.
//!
//! The schedule walks the graph in topological order and groups it into
//! steps. Each unobserved stochastic node opens a step (its *anchor*); the
//! unobserved logical nodes that follow are sampled in the same step; the
//! observed stochastic nodes met along the way become the step's likelihood
//! terms. Observed nodes met before the first anchor are dropped: they do not
//! depend on anything that will be sampled.
//!
//! [`LockTable`] derives, for every unobserved node, how many schedule steps
//! still read its value, so the forward pass can release particle values as
//! soon as their last consumer has run.

use smallvec::SmallVec;

use crate::engine::errors::SmcError;
use crate::engine::graph::{Graph, NodeId, NodeKind};

/// One step of the schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleStep {
    /// Unobserved stochastic node sampled first.
    pub anchor: NodeId,
    /// Unobserved logical nodes computed after the anchor, in topological order.
    pub logical: SmallVec<[NodeId; 4]>,
    /// Observed stochastic nodes whose likelihood enters at this step.
    pub observed: SmallVec<[NodeId; 4]>,
}

impl ScheduleStep {
    fn open(anchor: NodeId) -> Self {
        Self {
            anchor,
            logical: SmallVec::new(),
            observed: SmallVec::new(),
        }
    }

    /// Nodes given a value at this step: the anchor, then its logical nodes.
    pub fn sampled_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::once(self.anchor).chain(self.logical.iter().copied())
    }

    /// Nodes whose parents are read at this step.
    pub fn consumers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.sampled_nodes().chain(self.observed.iter().copied())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.anchor == id || self.logical.contains(&id) || self.observed.contains(&id)
    }
}

/// The ordered schedule of a graph.
#[derive(Debug, Clone)]
pub struct NodeSchedule {
    steps: Vec<ScheduleStep>,
    sampling_iteration: Vec<Option<usize>>,
    dropped_observations: Vec<NodeId>,
}

impl NodeSchedule {
    /// Builds the schedule from the graph's topological order.
    pub fn build(graph: &Graph) -> Result<Self, SmcError> {
        let mut steps: Vec<ScheduleStep> = Vec::new();
        let mut sampling_iteration = vec![None; graph.len()];
        let mut dropped_observations = Vec::new();

        for &id in graph.topological_order() {
            let node = graph.node(id)?;
            match (&node.kind, node.observed) {
                (NodeKind::Constant, _) | (NodeKind::Logical { .. }, true) => {}
                (NodeKind::Stochastic { .. }, false) => {
                    sampling_iteration[id.index()] = Some(steps.len());
                    steps.push(ScheduleStep::open(id));
                }
                (NodeKind::Logical { .. }, false) => {
                    let step = steps.last_mut().ok_or_else(|| {
                        SmcError::Logic(format!(
                            "schedule built out of order: logical node {} precedes every stochastic node",
                            id
                        ))
                    })?;
                    step.logical.push(id);
                    sampling_iteration[id.index()] = Some(steps.len() - 1);
                }
                (NodeKind::Stochastic { .. }, true) => match steps.last_mut() {
                    Some(step) => step.observed.push(id),
                    None => dropped_observations.push(id),
                },
            }
        }

        Ok(Self {
            steps,
            sampling_iteration,
            dropped_observations,
        })
    }

    pub fn steps(&self) -> &[ScheduleStep] {
        &self.steps
    }

    pub fn step(&self, iteration: usize) -> Result<&ScheduleStep, SmcError> {
        self.steps
            .get(iteration)
            .ok_or_else(|| SmcError::Logic(format!("no schedule step {}", iteration)))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step index at which `id` receives its value.
    ///
    /// Observed and constant nodes are never sampled and yield a logic error.
    pub fn sampling_iteration(&self, id: NodeId) -> Result<usize, SmcError> {
        self.sampling_iteration
            .get(id.index())
            .copied()
            .flatten()
            .ok_or_else(|| SmcError::Logic(format!("node {} is not sampled by the schedule", id)))
    }

    /// Observed nodes met before the first anchor; their likelihood is not used.
    pub fn dropped_observations(&self) -> &[NodeId] {
        &self.dropped_observations
    }
}

/// Per-node count of outstanding readers of particle values.
///
/// A node is locked once for the step that samples it and once for every
/// (step, consumer) pair that reads it as a parent. Finishing a step removes
/// that step's locks; nodes reaching zero can be released from every particle.
/// [`LockTable::pin`] adds a lock that is never removed.
#[derive(Debug, Clone)]
pub struct LockTable {
    counts: Vec<u32>,
    per_step: Vec<SmallVec<[NodeId; 8]>>,
}

impl LockTable {
    pub fn from_schedule(graph: &Graph, schedule: &NodeSchedule) -> Self {
        let mut counts = vec![0u32; graph.len()];
        let mut per_step = Vec::with_capacity(schedule.len());
        for step in schedule.steps() {
            let mut held: SmallVec<[NodeId; 8]> = SmallVec::new();
            for consumer in step.consumers() {
                if !graph.is_observed(consumer) {
                    held.push(consumer);
                }
                for parent in graph.parents(consumer) {
                    if !graph.is_observed(*parent) {
                        held.push(*parent);
                    }
                }
            }
            for id in &held {
                counts[id.index()] += 1;
            }
            per_step.push(held);
        }
        Self { counts, per_step }
    }

    pub fn count(&self, id: NodeId) -> u32 {
        self.counts.get(id.index()).copied().unwrap_or(0)
    }

    /// Keeps `id` alive for the rest of the run.
    pub fn pin(&mut self, id: NodeId) {
        if let Some(c) = self.counts.get_mut(id.index()) {
            *c += 1;
        }
    }

    /// Removes the locks held by `iteration` and returns the nodes now free.
    pub fn finish_step(&mut self, iteration: usize) -> Result<SmallVec<[NodeId; 8]>, SmcError> {
        let held = self.per_step.get(iteration).ok_or_else(|| {
            SmcError::Logic(format!("lock table has no step {}", iteration))
        })?;
        let mut released = SmallVec::new();
        for id in held {
            let count = &mut self.counts[id.index()];
            *count = count.checked_sub(1).ok_or_else(|| {
                SmcError::Logic(format!("lock count of node {} underflowed", id))
            })?;
            if *count == 0 {
                released.push(*id);
            }
        }
        Ok(released)
    }
}
