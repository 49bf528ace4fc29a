//! # Probabilistic graphical model
//!
//! A directed acyclic graph of three node kinds:
//!
//! - **Constant**: a fixed value supplied at construction.
//! - **Logical**: a deterministic function of its parents.
//! - **Stochastic**: a draw from a distribution parameterized by its parents,
//!   optionally truncated by lower/upper bound parents, optionally observed.
//!
//! Nodes are identified by dense [`NodeId`]s assigned in insertion order.
//! [`GraphBuilder::finish`] validates the description, computes a
//! deterministic topological order and evaluates every value that does not
//! depend on an unobserved stochastic node. Those values are stored once and
//! shared read-only by every particle.
//!
//! ## Example
//!
//! ```rust
//! use smcgraph_core::engine::graph::GraphBuilder;
//! use smcgraph_core::engine::value::NodeValue;
//!
//! let mut b = GraphBuilder::new();
//! let mu = b.constant(NodeValue::scalar(0.0));
//! let tau = b.constant(NodeValue::scalar(1.0));
//! let x = b.stochastic("dnorm", &[mu, tau], None).unwrap();
//! let y = b.stochastic("dnorm", &[x, tau], Some(NodeValue::scalar(0.3))).unwrap();
//! let graph = b.finish().unwrap();
//! assert!(graph.is_observed(y));
//! assert!(!graph.is_observed(x));
//! ```

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;

use rand::RngCore;
use smallvec::SmallVec;

use crate::engine::distributions::{
    Bounds, DeterministicFn, DistributionFn, FunctionRegistry,
};
use crate::engine::errors::SmcError;
use crate::engine::value::NodeValue;

/// Dense identifier of a node in the graph.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeId(pub u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Parent lists are short; keep them inline.
pub type ParentList = SmallVec<[NodeId; 4]>;

/// Node kind with its kind-specific payload.
#[derive(Clone)]
pub enum NodeKind {
    Constant,
    Logical {
        func: Arc<dyn DeterministicFn>,
    },
    Stochastic {
        dist: Arc<dyn DistributionFn>,
        lower: Option<NodeId>,
        upper: Option<NodeId>,
    },
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Constant => write!(f, "Constant"),
            NodeKind::Logical { func } => write!(f, "Logical({})", func.name()),
            NodeKind::Stochastic { dist, lower, upper } => f
                .debug_struct("Stochastic")
                .field("dist", &dist.name())
                .field("lower", lower)
                .field("upper", upper)
                .finish(),
        }
    }
}

/// One node of the graph.
#[derive(Debug, Clone)]
pub struct NodeData {
    pub id: NodeId,
    pub kind: NodeKind,
    /// All parents: function arguments for logical nodes, distribution
    /// parameters followed by the lower then upper bound for stochastic nodes.
    pub parents: ParentList,
    pub observed: bool,
}

impl NodeData {
    pub fn is_stochastic(&self) -> bool {
        matches!(self.kind, NodeKind::Stochastic { .. })
    }

    pub fn is_logical(&self) -> bool {
        matches!(self.kind, NodeKind::Logical { .. })
    }

    /// Distribution parameter parents (bounds excluded).
    pub fn param_parents(&self) -> &[NodeId] {
        match &self.kind {
            NodeKind::Stochastic { dist, .. } => &self.parents[..dist.n_params()],
            _ => &self.parents,
        }
    }

    pub fn bounds(&self) -> (Option<NodeId>, Option<NodeId>) {
        match &self.kind {
            NodeKind::Stochastic { lower, upper, .. } => (*lower, *upper),
            _ => (None, None),
        }
    }

    pub fn is_bounded(&self) -> bool {
        matches!(self.bounds(), (Some(_), _) | (_, Some(_)))
    }

    pub fn distribution(&self) -> Option<&Arc<dyn DistributionFn>> {
        match &self.kind {
            NodeKind::Stochastic { dist, .. } => Some(dist),
            _ => None,
        }
    }

    pub fn function(&self) -> Option<&Arc<dyn DeterministicFn>> {
        match &self.kind {
            NodeKind::Logical { func } => Some(func),
            _ => None,
        }
    }

    /// Log density of a stochastic node at `x` given all parent values
    /// (parameters then bounds, in `parents` order).
    pub fn log_density(&self, x: &NodeValue, parent_values: &[&NodeValue]) -> Result<f64, SmcError> {
        match &self.kind {
            NodeKind::Stochastic { dist, .. } => {
                let (params, bound_values) = parent_values.split_at(dist.n_params());
                dist.log_density(x, params, bounds_from(self, bound_values))
            }
            _ => Err(SmcError::Logic(format!(
                "node {} is not stochastic and has no density",
                self.id
            ))),
        }
    }

    /// Draws a stochastic node or evaluates a logical one from parent values.
    pub fn realize(
        &self,
        parent_values: &[&NodeValue],
        rng: &mut dyn RngCore,
    ) -> Result<NodeValue, SmcError> {
        match &self.kind {
            NodeKind::Constant => Err(SmcError::Logic(format!(
                "constant {} cannot be realized",
                self.id
            ))),
            NodeKind::Logical { func } => func.eval(parent_values),
            NodeKind::Stochastic { dist, .. } => {
                let (params, bound_values) = parent_values.split_at(dist.n_params());
                dist.sample(params, bounds_from(self, bound_values), rng)
            }
        }
    }
}

#[derive(Debug, Clone)]
struct PendingNode {
    kind: NodeKind,
    parents: ParentList,
    value: Option<NodeValue>,
}

/// Incremental graph description; parents may be referenced before they are added.
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    registry: FunctionRegistry,
    nodes: Vec<PendingNode>,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::with_registry(FunctionRegistry::with_builtins())
    }

    pub fn with_registry(registry: FunctionRegistry) -> Self {
        Self {
            registry,
            nodes: Vec::new(),
        }
    }

    fn push(&mut self, node: PendingNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn constant(&mut self, value: NodeValue) -> NodeId {
        self.push(PendingNode {
            kind: NodeKind::Constant,
            parents: ParentList::new(),
            value: Some(value),
        })
    }

    pub fn add_logical(&mut self, func: Arc<dyn DeterministicFn>, args: &[NodeId]) -> NodeId {
        self.push(PendingNode {
            kind: NodeKind::Logical { func },
            parents: ParentList::from_slice(args),
            value: None,
        })
    }

    /// Adds a stochastic node; `observed` carries its data value, if any.
    pub fn add_stochastic(
        &mut self,
        dist: Arc<dyn DistributionFn>,
        params: &[NodeId],
        lower: Option<NodeId>,
        upper: Option<NodeId>,
        observed: Option<NodeValue>,
    ) -> NodeId {
        let mut parents = ParentList::from_slice(params);
        parents.extend(lower);
        parents.extend(upper);
        self.push(PendingNode {
            kind: NodeKind::Stochastic { dist, lower, upper },
            parents,
            value: observed,
        })
    }

    /// Adds a logical node by registered function name.
    pub fn logical(&mut self, name: &str, args: &[NodeId]) -> Result<NodeId, SmcError> {
        let func = self.registry.function(name)?;
        Ok(self.add_logical(func, args))
    }

    /// Adds an untruncated stochastic node by registered distribution name.
    pub fn stochastic(
        &mut self,
        name: &str,
        params: &[NodeId],
        observed: Option<NodeValue>,
    ) -> Result<NodeId, SmcError> {
        let dist = self.registry.distribution(name)?;
        Ok(self.add_stochastic(dist, params, None, None, observed))
    }

    /// Adds a truncated stochastic node by registered distribution name.
    pub fn truncated(
        &mut self,
        name: &str,
        params: &[NodeId],
        lower: Option<NodeId>,
        upper: Option<NodeId>,
        observed: Option<NodeValue>,
    ) -> Result<NodeId, SmcError> {
        let dist = self.registry.distribution(name)?;
        Ok(self.add_stochastic(dist, params, lower, upper, observed))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Validates the description and produces the immutable graph.
    pub fn finish(self) -> Result<Graph, SmcError> {
        let n = self.nodes.len();
        for (idx, node) in self.nodes.iter().enumerate() {
            let id = NodeId(idx as u32);
            for parent in &node.parents {
                if parent.index() >= n {
                    return Err(SmcError::Validation(format!(
                        "node {} references unknown parent {}",
                        id, parent
                    )));
                }
                if *parent == id {
                    return Err(SmcError::Validation(format!("node {} is its own parent", id)));
                }
            }
            match &node.kind {
                NodeKind::Constant if node.value.is_none() => {
                    return Err(SmcError::Validation(format!(
                        "constant node {} has no value",
                        id
                    )));
                }
                NodeKind::Logical { func } if func.n_args() != node.parents.len() => {
                    return Err(SmcError::Validation(format!(
                        "{}() at node {} takes {} arguments, got {}",
                        func.name(),
                        id,
                        func.n_args(),
                        node.parents.len()
                    )));
                }
                NodeKind::Stochastic { dist, lower, upper } => {
                    let n_bounds = lower.is_some() as usize + upper.is_some() as usize;
                    if dist.n_params() + n_bounds != node.parents.len() {
                        return Err(SmcError::Validation(format!(
                            "{} at node {} takes {} parameters, got {}",
                            dist.name(),
                            id,
                            dist.n_params(),
                            node.parents.len() - n_bounds
                        )));
                    }
                    if n_bounds > 0 && !dist.can_bound() {
                        return Err(SmcError::Validation(format!(
                            "{} at node {} cannot be truncated",
                            dist.name(),
                            id
                        )));
                    }
                }
                _ => {}
            }
        }

        let mut children: Vec<ParentList> = vec![ParentList::new(); n];
        for (idx, node) in self.nodes.iter().enumerate() {
            for parent in &node.parents {
                let child = NodeId(idx as u32);
                if !children[parent.index()].contains(&child) {
                    children[parent.index()].push(child);
                }
            }
        }

        let topo = topological_sort(&self.nodes, &children)?;

        // Evaluate everything that does not depend on an unobserved stochastic node.
        let mut values: Vec<Option<Arc<NodeValue>>> = vec![None; n];
        let mut nodes = Vec::with_capacity(n);
        for (idx, pending) in self.nodes.iter().enumerate() {
            nodes.push(NodeData {
                id: NodeId(idx as u32),
                kind: pending.kind.clone(),
                parents: pending.parents.clone(),
                observed: false,
            });
        }
        for &id in &topo {
            let pending = &self.nodes[id.index()];
            let value = match &pending.kind {
                NodeKind::Constant => pending.value.clone(),
                NodeKind::Stochastic { .. } => pending.value.clone(),
                NodeKind::Logical { func } => {
                    let args: Option<SmallVec<[&NodeValue; 4]>> = pending
                        .parents
                        .iter()
                        .map(|p| values[p.index()].as_deref())
                        .collect();
                    match args {
                        Some(args) => Some(
                            func.eval(&args)
                                .map_err(|e| SmcError::at_node(id, e))?,
                        ),
                        None => None,
                    }
                }
            };
            if let Some(value) = value {
                nodes[id.index()].observed = true;
                values[id.index()] = Some(Arc::new(value));
            }
        }

        let graph = Graph {
            nodes,
            children,
            topo,
            values,
        };
        graph.validate_observations()?;
        Ok(graph)
    }
}

/// Kahn's algorithm; ties broken by smallest id for a deterministic order.
fn topological_sort(nodes: &[PendingNode], children: &[ParentList]) -> Result<Vec<NodeId>, SmcError> {
    let n = nodes.len();
    let mut in_degree: Vec<usize> = nodes
        .iter()
        .map(|node| {
            let mut distinct = node.parents.clone();
            distinct.sort_unstable();
            distinct.dedup();
            distinct.len()
        })
        .collect();
    let mut ready: BinaryHeap<Reverse<NodeId>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(idx, _)| Reverse(NodeId(idx as u32)))
        .collect();

    let mut order = Vec::with_capacity(n);
    while let Some(Reverse(id)) = ready.pop() {
        order.push(id);
        for child in &children[id.index()] {
            in_degree[child.index()] -= 1;
            if in_degree[child.index()] == 0 {
                ready.push(Reverse(*child));
            }
        }
    }

    if order.len() != n {
        let on_cycle = in_degree
            .iter()
            .position(|d| *d > 0)
            .map(|idx| NodeId(idx as u32));
        return Err(SmcError::Validation(match on_cycle {
            Some(id) => format!("graph has a cycle through node {}", id),
            None => "graph has a cycle".into(),
        }));
    }
    Ok(order)
}

/// The immutable, validated graphical model.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<NodeData>,
    children: Vec<ParentList>,
    topo: Vec<NodeId>,
    /// Values of constant and observed nodes, shared by every particle.
    values: Vec<Option<Arc<NodeValue>>>,
}

impl Graph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Result<&NodeData, SmcError> {
        self.nodes
            .get(id.index())
            .ok_or_else(|| SmcError::Logic(format!("unknown node {}", id)))
    }

    pub fn nodes(&self) -> &[NodeData] {
        &self.nodes
    }

    pub fn parents(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(id.index())
            .map(|n| n.parents.as_slice())
            .unwrap_or(&[])
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.children
            .get(id.index())
            .map(|c| c.as_slice())
            .unwrap_or(&[])
    }

    pub fn topological_order(&self) -> &[NodeId] {
        &self.topo
    }

    /// True for constants, observed stochastic nodes and logical nodes whose
    /// value is fixed by those.
    pub fn is_observed(&self, id: NodeId) -> bool {
        self.nodes.get(id.index()).is_some_and(|n| n.observed)
    }

    /// Observed flags indexed by node id.
    pub fn observed(&self) -> Vec<bool> {
        self.nodes.iter().map(|n| n.observed).collect()
    }

    /// Shared value of an observed node.
    pub fn value(&self, id: NodeId) -> Option<&Arc<NodeValue>> {
        self.values.get(id.index()).and_then(|v| v.as_ref())
    }

    /// Ids of the unobserved stochastic nodes, in topological order.
    pub fn latent_stochastic_nodes(&self) -> Vec<NodeId> {
        self.topo
            .iter()
            .copied()
            .filter(|id| {
                let node = &self.nodes[id.index()];
                node.is_stochastic() && !node.observed
            })
            .collect()
    }

    /// Checks that every observed stochastic node with fixed parameters has
    /// valid parameters and a finite log density at its data value.
    fn validate_observations(&self) -> Result<(), SmcError> {
        for node in &self.nodes {
            let NodeKind::Stochastic { dist, .. } = &node.kind else {
                continue;
            };
            if !node.observed {
                continue;
            }
            let Some(parent_values) = node
                .parents
                .iter()
                .map(|p| self.value(*p).map(Arc::as_ref))
                .collect::<Option<SmallVec<[&NodeValue; 4]>>>()
            else {
                continue;
            };
            if !dist.check_params(&parent_values[..dist.n_params()]) {
                return Err(SmcError::at_node(
                    node.id,
                    SmcError::Validation(format!("invalid parameters for {}", dist.name())),
                ));
            }
            let x = self.values[node.id.index()]
                .as_deref()
                .ok_or_else(|| SmcError::Logic(format!("observed node {} has no value", node.id)))?;
            let log_density = node
                .log_density(x, &parent_values)
                .map_err(|e| SmcError::at_node(node.id, e))?;
            if !log_density.is_finite() {
                return Err(SmcError::at_node(
                    node.id,
                    SmcError::Validation(format!(
                        "observed value {:?} has zero density under {}",
                        x.values(),
                        dist.name()
                    )),
                ));
            }
        }
        Ok(())
    }

    /// Draws one prior realization of every node.
    ///
    /// Observed nodes keep their data values; unobserved stochastic nodes
    /// are drawn from their distributions in topological order.
    pub fn sample_values(&self, rng: &mut dyn RngCore) -> Result<Vec<Arc<NodeValue>>, SmcError> {
        let mut realized: Vec<Option<Arc<NodeValue>>> = self.values.clone();
        for &id in &self.topo {
            if realized[id.index()].is_some() {
                continue;
            }
            let node = &self.nodes[id.index()];
            let value = {
                let parent_values: SmallVec<[&NodeValue; 4]> = node
                    .parents
                    .iter()
                    .map(|p| {
                        realized[p.index()].as_deref().ok_or_else(|| {
                            SmcError::Logic(format!("parent {} of {} not realized", p, id))
                        })
                    })
                    .collect::<Result<_, _>>()?;
                node.realize(&parent_values, rng)
                    .map_err(|e| SmcError::at_node(id, e))?
            };
            realized[id.index()] = Some(Arc::new(value));
        }
        realized
            .into_iter()
            .enumerate()
            .map(|(idx, v)| {
                v.ok_or_else(|| SmcError::Logic(format!("node #{} not realized", idx)))
            })
            .collect()
    }
}

/// Pairs bound parent values with the node's declared bounds.
pub(crate) fn bounds_from<'a>(node: &NodeData, bound_values: &[&'a NodeValue]) -> Bounds<'a> {
    let (lower, upper) = node.bounds();
    let mut it = bound_values.iter();
    Bounds {
        lower: lower.and_then(|_| it.next().copied()),
        upper: upper.and_then(|_| it.next().copied()),
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn logical_nodes_of_constants_are_observed() {
        let mut b = GraphBuilder::new();
        let a = b.constant(NodeValue::scalar(2.0));
        let c = b.constant(NodeValue::scalar(3.0));
        let s = b.logical("add", &[a, c]).unwrap();
        let g = b.finish().unwrap();
        assert!(g.is_observed(s));
        assert_eq!(g.value(s).unwrap().values(), &[5.0]);
    }

    #[test]
    fn forward_references_are_sorted() {
        let mut b = GraphBuilder::new();
        // y depends on x which is added later
        let y = b.stochastic("dnorm", &[NodeId(3), NodeId(2)], None).unwrap();
        let mu = b.constant(NodeValue::scalar(0.0));
        let tau = b.constant(NodeValue::scalar(1.0));
        let x = b.stochastic("dnorm", &[mu, tau], None).unwrap();
        let g = b.finish().unwrap();
        let order = g.topological_order();
        let pos = |id: NodeId| order.iter().position(|n| *n == id).unwrap();
        assert!(pos(x) < pos(y));
        assert_eq!(g.latent_stochastic_nodes(), vec![x, y]);
    }

    #[test]
    fn cycle_is_rejected() {
        let mut b = GraphBuilder::new();
        let tau = b.constant(NodeValue::scalar(1.0));
        let _x = b.stochastic("dnorm", &[NodeId(2), tau], None).unwrap();
        let _y = b.logical("identity", &[NodeId(1)]).unwrap();
        let err = b.finish().unwrap_err();
        assert!(matches!(err, SmcError::Validation(msg) if msg.contains("cycle")));
    }

    #[test]
    fn arity_and_truncation_are_validated() {
        let mut b = GraphBuilder::new();
        let a = b.constant(NodeValue::scalar(0.5));
        b.stochastic("dnorm", &[a], None).unwrap();
        assert!(b.finish().is_err());

        let mut b = GraphBuilder::new();
        let a = b.constant(NodeValue::scalar(0.5));
        b.truncated("dbern", &[a], Some(a), None, None).unwrap();
        assert!(b.finish().is_err());
    }

    #[test]
    fn observation_with_zero_density_is_rejected() {
        let mut b = GraphBuilder::new();
        let p = b.constant(NodeValue::scalar(0.5));
        let y = b.stochastic("dbern", &[p], Some(NodeValue::scalar(2.0))).unwrap();
        let err = b.finish().unwrap_err();
        assert_eq!(err.node(), Some(y));
    }

    #[test]
    fn prior_realization_covers_every_node() {
        let mut b = GraphBuilder::new();
        let mu = b.constant(NodeValue::scalar(0.0));
        let tau = b.constant(NodeValue::scalar(1.0));
        let x = b.stochastic("dnorm", &[mu, tau], None).unwrap();
        let two = b.constant(NodeValue::scalar(2.0));
        let z = b.logical("mul", &[x, two]).unwrap();
        let g = b.finish().unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let values = g.sample_values(&mut rng).unwrap();
        assert_eq!(values.len(), g.len());
        let xv = values[x.index()].values()[0];
        assert_eq!(values[z.index()].values()[0], 2.0 * xv);
    }

    #[test]
    fn children_are_recorded() {
        let mut b = GraphBuilder::new();
        let mu = b.constant(NodeValue::scalar(0.0));
        let tau = b.constant(NodeValue::scalar(1.0));
        let x = b.stochastic("dnorm", &[mu, tau], None).unwrap();
        let g = b.finish().unwrap();
        assert_eq!(g.children(mu), &[x]);
        assert_eq!(g.parents(x), &[mu, tau]);
    }
}
