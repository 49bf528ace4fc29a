//! Exact sampling of discrete anchors by enumerating their support.
//!
//! For every candidate value the unnormalized posterior is the prior mass
//! times the likelihood of the step's observed nodes. The draw is taken from
//! the normalized candidates and the log incremental weight is the log of
//! their total, which is the same for every draw.

use std::sync::Arc;

use rand::distributions::{Distribution, WeightedIndex};
use rand::RngCore;

use crate::engine::errors::SmcError;
use crate::engine::graph::Graph;
use crate::engine::node_sampler::{as_refs, NodeSampler, NodeSamplerFactory, StepContext};
use crate::engine::numeric::log_sum_exp;
use crate::engine::schedule::ScheduleStep;
use crate::engine::value::NodeValue;

/// Accepts untruncated anchors whose distribution has finite support.
#[derive(Debug, Default, Clone, Copy)]
pub struct FiniteSamplerFactory;

impl NodeSamplerFactory for FiniteSamplerFactory {
    fn name(&self) -> &'static str {
        "finite"
    }

    fn bind(&self, graph: &Graph, step: &ScheduleStep) -> Option<Arc<dyn NodeSampler>> {
        let anchor = graph.node(step.anchor).ok()?;
        let dist = anchor.distribution()?;
        if !dist.is_discrete() || !dist.has_finite_support() || anchor.is_bounded() {
            return None;
        }
        Some(Arc::new(FiniteSampler))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FiniteSampler;

impl NodeSampler for FiniteSampler {
    fn name(&self) -> &'static str {
        "finite"
    }

    fn sample(&self, ctx: &mut StepContext<'_>, rng: &mut dyn RngCore) -> Result<f64, SmcError> {
        let anchor = ctx.anchor();
        let graph = ctx.graph();
        let node = graph.node(anchor)?;
        let dist = node
            .distribution()
            .ok_or_else(|| SmcError::Logic(format!("anchor {} is not stochastic", anchor)))?;
        let params = ctx.resolve_parents(anchor)?;
        let support = dist.finite_support(&as_refs(&params)).ok_or_else(|| {
            SmcError::at_node(
                anchor,
                SmcError::Logic(format!("{} has no finite support here", dist.name())),
            )
        })?;

        let mut log_mass = Vec::with_capacity(support.len());
        for &candidate in &support {
            ctx.clear_step_logical();
            ctx.set_value(anchor, NodeValue::scalar(candidate));
            let lp = ctx.log_density_at_current(anchor)? + ctx.observed_log_likelihood()?;
            if lp.is_nan() {
                return Err(SmcError::at_node(
                    anchor,
                    SmcError::numerical("candidate weight", format!("NaN at value {}", candidate)),
                ));
            }
            log_mass.push(lp);
        }

        let total = log_sum_exp(&log_mass);
        if !total.is_finite() {
            return Err(SmcError::at_node(
                anchor,
                SmcError::numerical(
                    "candidate weights",
                    "every value of the support has zero posterior mass",
                ),
            ));
        }

        let index = WeightedIndex::new(log_mass.iter().map(|lp| (lp - total).exp())).map_err(|e| {
            SmcError::at_node(anchor, SmcError::numerical("candidate weights", e.to_string()))
        })?;
        let chosen = index.sample(rng);

        ctx.clear_step_logical();
        ctx.set_value(anchor, NodeValue::scalar(support[chosen]));
        Ok(total)
    }
}
