//! Forward-filtering backward-smoothing over retained filter monitors.
//!
//! Removing step t reweights the population of step t-1 with
//!
//! ```text
//! w_i <- wf_i * sum_j P[i, j] * w_j / sum_k wf_k * P[k, j]
//! ```
//!
//! where `wf` are the filter weights of step t-1, `w` the current smoothed
//! weights of step t and `P[i, j]` the prior density of the step-t anchor at
//! particle j's value given particle i's parent values. Each column of `P`
//! is scaled by its maximum in log space; the scaling cancels in the ratio.

use std::sync::Arc;

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use smallvec::SmallVec;

use crate::engine::errors::SmcError;
use crate::engine::graph::{Graph, NodeData, NodeId};
use crate::engine::monitor::{Monitor, NodeColumn};
use crate::engine::numeric::CompensatedSum;
use crate::engine::value::NodeValue;
use crate::engine::weights::summarize;
use crate::stats::WeightedSink;

/// Backward pass over the filter monitors of a completed forward run.
#[derive(Debug)]
pub struct BackwardSmoother {
    graph: Arc<Graph>,
    anchors: Vec<NodeId>,
    filters: Vec<Monitor>,
    current: Monitor,
    iteration: usize,
    sum: f64,
    ess: f64,
}

impl BackwardSmoother {
    /// Starts from the last filter monitor's weights.
    pub(crate) fn new(
        graph: Arc<Graph>,
        anchors: Vec<NodeId>,
        filters: Vec<Monitor>,
    ) -> Result<Self, SmcError> {
        let last = filters
            .last()
            .ok_or_else(|| SmcError::Logic("backward smoother needs a filter monitor".into()))?;
        if anchors.len() != filters.len() {
            return Err(SmcError::Logic(format!(
                "{} anchors for {} filter monitors",
                anchors.len(),
                filters.len()
            )));
        }
        let summary = summarize(last.weights().iter().copied())?;
        let current = last.smoothed(last.shared_weights());
        Ok(Self {
            graph,
            iteration: filters.len() - 1,
            anchors,
            current,
            filters,
            sum: summary.sum,
            ess: summary.ess,
        })
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn is_exhausted(&self) -> bool {
        self.iteration == 0
    }

    pub fn ess(&self) -> f64 {
        self.ess
    }

    pub fn sum_of_weights(&self) -> f64 {
        self.sum
    }

    /// Smoothed weights of the current iteration.
    pub fn weights(&self) -> &[f64] {
        self.current.weights()
    }

    /// Smooth monitor of the current iteration.
    pub fn monitor(&self) -> &Monitor {
        &self.current
    }

    /// Feeds smoothed values of a node monitored at the current iteration.
    pub fn accumulate(
        &self,
        id: NodeId,
        sink: &mut dyn WeightedSink,
        component: Option<usize>,
    ) -> Result<(), SmcError> {
        self.current.accumulate(id, sink, component)
    }

    /// Moves the smoothed weights one step back.
    pub fn iterate_back(&mut self) -> Result<&Monitor, SmcError> {
        if self.iteration == 0 || self.filters.len() < 2 {
            return Err(SmcError::Logic(
                "backward smoother has no earlier step".into(),
            ));
        }
        let t = self.iteration;
        let anchor = self.anchors[t];
        let newer = &self.filters[t];
        let older = &self.filters[t - 1];
        let node = self.graph.node(anchor)?;

        let log_p = transition_matrix(node, newer, older)
            .map_err(|e| SmcError::at_node(anchor, e))?;
        let weights = smoothing_update(&log_p, older.weights(), self.current.weights())
            .map_err(|e| SmcError::at_node(anchor, e))?;
        let summary = summarize(weights.iter().copied())?;

        let weights: Arc<[f64]> = weights.into();
        self.current = older.smoothed(weights);
        self.filters.truncate(t);
        self.iteration = t - 1;
        self.sum = summary.sum;
        self.ess = summary.ess;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "backward step {} -> {}: anchor {}, ess {:.3}",
            t,
            t - 1,
            anchor,
            summary.ess
        );
        Ok(&self.current)
    }
}

/// Row-major `log P[i, j]`: rows index the older population, columns the newer.
fn transition_matrix(
    node: &NodeData,
    newer: &Monitor,
    older: &Monitor,
) -> Result<Vec<f64>, SmcError> {
    let n = newer.n_particles();
    if older.n_particles() != n {
        return Err(SmcError::Logic(format!(
            "monitors of {} and {} particles",
            older.n_particles(),
            n
        )));
    }
    let targets = newer.node_values(node.id)?;
    let parents: SmallVec<[&NodeColumn; 4]> = node
        .parents
        .iter()
        .map(|p| older.node_values(*p))
        .collect::<Result<_, _>>()?;

    let row = |i: usize| -> Result<Vec<f64>, SmcError> {
        let parent_values: SmallVec<[&NodeValue; 4]> = parents
            .iter()
            .map(|c| c.get(i).map(Arc::as_ref))
            .collect::<Option<_>>()
            .ok_or_else(|| SmcError::Logic("parent column is short".into()))?;
        (0..n)
            .map(|j| {
                let x = targets
                    .get(j)
                    .ok_or_else(|| SmcError::Logic("anchor column is short".into()))?;
                node.log_density(x, &parent_values)
            })
            .collect()
    };

    #[cfg(feature = "parallel")]
    let rows: Vec<Vec<f64>> = (0..n).into_par_iter().map(row).collect::<Result<_, _>>()?;
    #[cfg(not(feature = "parallel"))]
    let rows: Vec<Vec<f64>> = (0..n).map(row).collect::<Result<_, _>>()?;
    Ok(rows.concat())
}

/// One backward recursion step on a row-major log transition matrix.
pub(crate) fn smoothing_update(
    log_p: &[f64],
    filter: &[f64],
    smoothed: &[f64],
) -> Result<Vec<f64>, SmcError> {
    let n = filter.len();
    if smoothed.len() != n || log_p.len() != n * n {
        return Err(SmcError::Logic("smoothing dimensions disagree".into()));
    }
    if log_p.iter().any(|v| v.is_nan()) {
        return Err(SmcError::numerical("transition density", "NaN log density"));
    }

    let mut column_max = vec![f64::NEG_INFINITY; n];
    for i in 0..n {
        for j in 0..n {
            column_max[j] = column_max[j].max(log_p[i * n + j]);
        }
    }
    let scaled = |i: usize, j: usize| -> f64 {
        if column_max[j].is_finite() {
            (log_p[i * n + j] - column_max[j]).exp()
        } else {
            0.0
        }
    };

    let mut ratio = vec![0.0; n];
    for j in 0..n {
        if smoothed[j] == 0.0 {
            continue;
        }
        let divisor: CompensatedSum = (0..n).map(|k| filter[k] * scaled(k, j)).collect();
        let divisor = divisor.total();
        if divisor == 0.0 {
            return Err(SmcError::numerical(
                "smoothing divisor",
                format!("particle {} is unreachable from the filter population", j),
            ));
        }
        ratio[j] = smoothed[j] / divisor;
    }

    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let total: CompensatedSum = (0..n).map(|j| scaled(i, j) * ratio[j]).collect();
        let w = filter[i] * total.total();
        if w.is_nan() {
            return Err(SmcError::numerical(
                "smoothed weight",
                format!("particle {}", i),
            ));
        }
        out.push(w);
    }
    Ok(out)
}
