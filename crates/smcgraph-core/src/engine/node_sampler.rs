//! Per-node sampling strategies and their selection.
//!
//! A [`NodeSampler`] gives the anchor of a schedule step a value inside one
//! particle and returns the log incremental weight of that draw. Strategies
//! are chosen once per step when the forward sampler is built: an ordered
//! [`SamplerChain`] of [`NodeSamplerFactory`] values is asked in turn, and
//! the first factory whose capability check passes is bound to the step.
//! Steps no factory accepts use [`PriorSampler`].

use std::fmt;
use std::sync::Arc;

use rand::RngCore;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::engine::conjugate::ConjugateSamplerFactory;
use crate::engine::errors::SmcError;
use crate::engine::finite::FiniteSamplerFactory;
use crate::engine::graph::{Graph, NodeData, NodeId, NodeKind};
use crate::engine::particle::Particle;
use crate::engine::schedule::ScheduleStep;
use crate::engine::value::NodeValue;

/// Values of one node's parents, held for the duration of a computation.
pub type ParentValues = SmallVec<[Arc<NodeValue>; 4]>;

pub(crate) fn as_refs(values: &ParentValues) -> SmallVec<[&NodeValue; 4]> {
    values.iter().map(Arc::as_ref).collect()
}

/// Mutable view of one particle while one schedule step runs on it.
pub struct StepContext<'a> {
    graph: &'a Graph,
    step: &'a ScheduleStep,
    particle: &'a mut Particle,
}

impl<'a> StepContext<'a> {
    pub fn new(graph: &'a Graph, step: &'a ScheduleStep, particle: &'a mut Particle) -> Self {
        Self {
            graph,
            step,
            particle,
        }
    }

    pub fn graph(&self) -> &'a Graph {
        self.graph
    }

    pub fn step(&self) -> &'a ScheduleStep {
        self.step
    }

    pub fn anchor(&self) -> NodeId {
        self.step.anchor
    }

    /// Current value of `id` without computing anything.
    pub fn value(&self, id: NodeId) -> Result<Arc<NodeValue>, SmcError> {
        self.particle
            .value(self.graph, id)
            .cloned()
            .ok_or_else(|| SmcError::Logic(format!("node {} has no value in this particle", id)))
    }

    /// Value of `id`, computing not-yet-materialized logical ancestors on demand.
    pub fn resolve(&mut self, id: NodeId) -> Result<Arc<NodeValue>, SmcError> {
        if let Some(v) = self.particle.value(self.graph, id) {
            return Ok(v.clone());
        }
        let graph = self.graph;
        let node = graph.node(id)?;
        if !node.is_logical() {
            return Err(SmcError::Logic(format!(
                "stochastic node {} read before it was sampled",
                id
            )));
        }
        let parents = self.resolve_parents(id)?;
        let func = node
            .function()
            .ok_or_else(|| SmcError::Logic(format!("node {} has no function", id)))?;
        let value = Arc::new(
            func.eval(&as_refs(&parents))
                .map_err(|e| SmcError::at_node(id, e))?,
        );
        self.particle.set_shared(id, value.clone());
        Ok(value)
    }

    /// Values of every parent of `id`, resolving logical parents as needed.
    pub fn resolve_parents(&mut self, id: NodeId) -> Result<ParentValues, SmcError> {
        let graph = self.graph;
        graph
            .parents(id)
            .iter()
            .map(|p| self.resolve(*p))
            .collect()
    }

    pub fn set_value(&mut self, id: NodeId, value: NodeValue) {
        self.particle.set_value(id, value);
    }

    /// Drops the values computed for this step's logical nodes.
    ///
    /// Used by strategies that evaluate several candidate anchor values.
    pub fn clear_step_logical(&mut self) {
        for id in &self.step.logical {
            self.particle.release(*id);
        }
    }

    /// Log density of stochastic node `id` at its current value.
    pub fn log_density_at_current(&mut self, id: NodeId) -> Result<f64, SmcError> {
        let graph = self.graph;
        let node = graph.node(id)?;
        let x = self.value(id)?;
        let parents = self.resolve_parents(id)?;
        let refs = as_refs(&parents);
        node.log_density(&x, &refs)
            .map_err(|e| SmcError::at_node(id, e))
    }

    /// Sum of the log likelihoods of this step's observed nodes.
    pub fn observed_log_likelihood(&mut self) -> Result<f64, SmcError> {
        let step = self.step;
        let mut total = 0.0;
        for &id in &step.observed {
            total += self.log_density_at_current(id)?;
        }
        Ok(total)
    }

    /// Evaluates `id` as if the anchor had value `anchor_value`, without
    /// touching the particle.
    pub fn evaluate_with_anchor(
        &self,
        id: NodeId,
        anchor_value: &Arc<NodeValue>,
    ) -> Result<Arc<NodeValue>, SmcError> {
        let mut scratch: FxHashMap<NodeId, Arc<NodeValue>> = FxHashMap::default();
        scratch.insert(self.step.anchor, anchor_value.clone());
        self.evaluate_trial(id, &mut scratch)
    }

    fn evaluate_trial(
        &self,
        id: NodeId,
        scratch: &mut FxHashMap<NodeId, Arc<NodeValue>>,
    ) -> Result<Arc<NodeValue>, SmcError> {
        if let Some(v) = scratch.get(&id) {
            return Ok(v.clone());
        }
        if !self.step.logical.contains(&id) {
            return self.value(id);
        }
        let node = self.graph.node(id)?;
        let parents: ParentValues = node
            .parents
            .iter()
            .map(|p| self.evaluate_trial(*p, scratch))
            .collect::<Result<_, _>>()?;
        let func = node
            .function()
            .ok_or_else(|| SmcError::Logic(format!("node {} has no function", id)))?;
        let value = Arc::new(
            func.eval(&as_refs(&parents))
                .map_err(|e| SmcError::at_node(id, e))?,
        );
        scratch.insert(id, value.clone());
        Ok(value)
    }
}

/// A strategy giving the anchor of a step its value inside one particle.
pub trait NodeSampler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Samples the anchor and returns the log incremental weight, covering
    /// the likelihood of every observed node of the step.
    fn sample(&self, ctx: &mut StepContext<'_>, rng: &mut dyn RngCore) -> Result<f64, SmcError>;
}

/// Capability check plus constructor for a sampling strategy.
pub trait NodeSamplerFactory: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns a sampler when the strategy applies to `step`, `None` otherwise.
    fn bind(&self, graph: &Graph, step: &ScheduleStep) -> Option<Arc<dyn NodeSampler>>;
}

/// Draws the anchor from its prior and weights by the step's likelihood.
#[derive(Debug, Default, Clone, Copy)]
pub struct PriorSampler;

impl NodeSampler for PriorSampler {
    fn name(&self) -> &'static str {
        "prior"
    }

    fn sample(&self, ctx: &mut StepContext<'_>, rng: &mut dyn RngCore) -> Result<f64, SmcError> {
        let anchor = ctx.anchor();
        let parents = ctx.resolve_parents(anchor)?;
        let value = ctx
            .graph()
            .node(anchor)?
            .realize(&as_refs(&parents), rng)
            .map_err(|e| SmcError::at_node(anchor, e))?;
        ctx.set_value(anchor, value);
        ctx.observed_log_likelihood()
    }
}

/// Ordered list of strategy factories consulted per step.
#[derive(Clone, Default)]
pub struct SamplerChain {
    factories: Vec<Arc<dyn NodeSamplerFactory>>,
}

impl SamplerChain {
    /// Conjugate normal first, then finite-support enumeration.
    pub fn with_builtins() -> Self {
        let mut chain = Self::prior_only();
        chain.push(Arc::new(ConjugateSamplerFactory::normal_mean()));
        chain.push(Arc::new(FiniteSamplerFactory));
        chain
    }

    /// Empty chain: every step falls back to prior sampling.
    pub fn prior_only() -> Self {
        Self::default()
    }

    pub fn push(&mut self, factory: Arc<dyn NodeSamplerFactory>) {
        self.factories.push(factory);
    }

    pub fn factory_names(&self) -> Vec<&'static str> {
        self.factories.iter().map(|f| f.name()).collect()
    }

    /// First accepting factory's sampler, or the prior sampler.
    pub fn bind(&self, graph: &Graph, step: &ScheduleStep) -> Arc<dyn NodeSampler> {
        self.factories
            .iter()
            .find_map(|f| f.bind(graph, step))
            .unwrap_or_else(|| Arc::new(PriorSampler))
    }
}

impl fmt::Debug for SamplerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factory_names()).finish()
    }
}

/// How a node depends on the anchor of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependence {
    /// Does not depend on the anchor.
    Known,
    /// `c * anchor`.
    Scale,
    /// Affine in the anchor.
    Linear,
    Nonlinear,
}

impl Dependence {
    pub fn is_affine(self) -> bool {
        matches!(self, Dependence::Scale | Dependence::Linear)
    }
}

/// Classifies the anchor and the step's logical nodes by their dependence on
/// the anchor, using the functions' linearity capability checks.
pub fn anchor_dependence(graph: &Graph, step: &ScheduleStep) -> FxHashMap<NodeId, Dependence> {
    let mut deps = FxHashMap::default();
    deps.insert(step.anchor, Dependence::Scale);
    for &id in &step.logical {
        let Ok(node) = graph.node(id) else {
            deps.insert(id, Dependence::Nonlinear);
            continue;
        };
        let dep = classify_logical(node, &deps);
        deps.insert(id, dep);
    }
    deps
}

fn classify_logical(node: &NodeData, deps: &FxHashMap<NodeId, Dependence>) -> Dependence {
    let NodeKind::Logical { func } = &node.kind else {
        return Dependence::Nonlinear;
    };
    let arg_deps: SmallVec<[Dependence; 4]> = node
        .parents
        .iter()
        .map(|p| deps.get(p).copied().unwrap_or(Dependence::Known))
        .collect();
    let known: SmallVec<[bool; 4]> = arg_deps.iter().map(|d| *d == Dependence::Known).collect();
    if known.iter().all(|k| *k) {
        return Dependence::Known;
    }
    let scale: SmallVec<[bool; 4]> = arg_deps.iter().map(|d| *d == Dependence::Scale).collect();
    if func.is_scale(&scale, &known) {
        return Dependence::Scale;
    }
    let linear: SmallVec<[bool; 4]> = arg_deps.iter().map(|d| d.is_affine()).collect();
    if func.is_linear(&linear, &known) {
        Dependence::Linear
    } else {
        Dependence::Nonlinear
    }
}

/// Dependence of any node on the anchor given the step classification.
pub fn dependence_of(deps: &FxHashMap<NodeId, Dependence>, id: NodeId) -> Dependence {
    deps.get(&id).copied().unwrap_or(Dependence::Known)
}
