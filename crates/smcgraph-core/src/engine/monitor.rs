//! Weighted snapshots of particle values.
//!
//! A filter monitor is taken from the live population at the end of a
//! forward step. A smooth monitor shares the filter monitor's value columns
//! and carries the smoothed weights instead. Columns hold shared references
//! to node values, so a snapshot outlives the release of those values from
//! the particles.

use std::sync::{Arc, OnceLock};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::engine::errors::SmcError;
use crate::engine::graph::NodeId;
use crate::engine::value::NodeValue;
use crate::engine::weights::summarize;
use crate::stats::WeightedSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorKind {
    Filter,
    Smooth,
}

/// Values of one node across the population.
#[derive(Debug, Clone)]
pub enum NodeColumn {
    /// Observed or constant: one value read by every particle.
    Shared(Arc<NodeValue>),
    PerParticle(Vec<Arc<NodeValue>>),
}

impl NodeColumn {
    pub fn get(&self, particle: usize) -> Option<&Arc<NodeValue>> {
        match self {
            NodeColumn::Shared(v) => Some(v),
            NodeColumn::PerParticle(values) => values.get(particle),
        }
    }
}

pub(crate) type Columns = FxHashMap<NodeId, NodeColumn>;

/// Weighted population snapshot for one schedule step.
#[derive(Debug, Clone)]
pub struct Monitor {
    kind: MonitorKind,
    iteration: usize,
    nodes: SmallVec<[NodeId; 8]>,
    columns: Arc<Columns>,
    weights: Arc<[f64]>,
    ess: OnceLock<f64>,
}

impl Monitor {
    /// `nodes` are the monitored nodes; `columns` may hold extra context
    /// columns readable through [`Monitor::node_values`].
    pub(crate) fn filter(
        iteration: usize,
        nodes: SmallVec<[NodeId; 8]>,
        columns: Columns,
        weights: Arc<[f64]>,
    ) -> Self {
        Self {
            kind: MonitorKind::Filter,
            iteration,
            nodes,
            columns: Arc::new(columns),
            weights,
            ess: OnceLock::new(),
        }
    }

    /// Same values with `weights` substituted.
    pub(crate) fn smoothed(&self, weights: Arc<[f64]>) -> Self {
        Self {
            kind: MonitorKind::Smooth,
            iteration: self.iteration,
            nodes: self.nodes.clone(),
            columns: self.columns.clone(),
            weights,
            ess: OnceLock::new(),
        }
    }

    pub fn kind(&self) -> MonitorKind {
        self.kind
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn n_particles(&self) -> usize {
        self.weights.len()
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains(&id)
    }

    /// Unnormalized particle weights.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub(crate) fn shared_weights(&self) -> Arc<[f64]> {
        self.weights.clone()
    }

    /// Effective sample size of the weights, computed on first use.
    ///
    /// Only a successful result is cached; degenerate weights report the
    /// numerical error on every call.
    pub fn ess(&self) -> Result<f64, SmcError> {
        if let Some(ess) = self.ess.get() {
            return Ok(*ess);
        }
        let ess = summarize(self.weights.iter().copied())?.ess;
        Ok(*self.ess.get_or_init(|| ess))
    }

    /// Column of `id`: a monitored node or a stored context node.
    pub fn node_values(&self, id: NodeId) -> Result<&NodeColumn, SmcError> {
        self.columns.get(&id).ok_or_else(|| {
            SmcError::Logic(format!(
                "monitor of iteration {} holds no values for node {}",
                self.iteration, id
            ))
        })
    }

    /// Pushes `(value, weight)` for every particle into `sink`.
    ///
    /// With `component = None` the node must be scalar.
    pub fn accumulate(
        &self,
        id: NodeId,
        sink: &mut dyn WeightedSink,
        component: Option<usize>,
    ) -> Result<(), SmcError> {
        if !self.contains(id) {
            return Err(SmcError::Logic(format!(
                "node {} is not monitored at iteration {}",
                id, self.iteration
            )));
        }
        let column = self.node_values(id)?;
        for (i, w) in self.weights.iter().enumerate() {
            let value = column.get(i).ok_or_else(|| {
                SmcError::Logic(format!("monitor column of node {} is short", id))
            })?;
            let x = match component {
                None => value.as_scalar("accumulated node")?,
                Some(c) => value.component(c).ok_or_else(|| {
                    SmcError::Logic(format!(
                        "component {} out of range for node {} of length {}",
                        c,
                        id,
                        value.len()
                    ))
                })?,
            };
            sink.push(x, *w).map_err(|e| SmcError::at_node(id, e))?;
        }
        Ok(())
    }
}
