//! A single particle: values of the unobserved nodes plus a log weight.

use std::sync::Arc;

use crate::engine::graph::{Graph, NodeId};
use crate::engine::value::NodeValue;

/// One candidate assignment of the unobserved nodes.
///
/// Slots are indexed by node id. Observed nodes are never stored here; they
/// are read from the graph. Cloning a particle shares the value buffers,
/// which are never mutated in place: writing a node replaces its slot.
#[derive(Debug, Clone)]
pub struct Particle {
    values: Vec<Option<Arc<NodeValue>>>,
    log_weight: f64,
}

impl Particle {
    pub fn new(n_nodes: usize) -> Self {
        Self {
            values: vec![None; n_nodes],
            log_weight: 0.0,
        }
    }

    pub fn log_weight(&self) -> f64 {
        self.log_weight
    }

    pub fn set_log_weight(&mut self, log_weight: f64) {
        self.log_weight = log_weight;
    }

    pub fn add_log_weight(&mut self, increment: f64) {
        self.log_weight += increment;
    }

    /// Value held by the particle itself (unobserved nodes only).
    pub fn own_value(&self, id: NodeId) -> Option<&Arc<NodeValue>> {
        self.values.get(id.index()).and_then(|v| v.as_ref())
    }

    /// Value of `id`, falling back to the graph for observed nodes.
    pub fn value<'a>(&'a self, graph: &'a Graph, id: NodeId) -> Option<&'a Arc<NodeValue>> {
        graph.value(id).or_else(|| self.own_value(id))
    }

    pub fn is_set(&self, id: NodeId) -> bool {
        self.own_value(id).is_some()
    }

    pub fn set_value(&mut self, id: NodeId, value: NodeValue) {
        self.set_shared(id, Arc::new(value));
    }

    pub fn set_shared(&mut self, id: NodeId, value: Arc<NodeValue>) {
        if let Some(slot) = self.values.get_mut(id.index()) {
            *slot = Some(value);
        }
    }

    pub fn release(&mut self, id: NodeId) {
        if let Some(slot) = self.values.get_mut(id.index()) {
            *slot = None;
        }
    }

    /// Number of node values currently held.
    pub fn n_held(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }
}
