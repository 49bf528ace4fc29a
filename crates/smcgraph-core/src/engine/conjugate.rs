//! Conjugate node samplers.
//!
//! A [`ConjugateStrategy`] describes one (prior family, likelihood family)
//! pair with a closed-form posterior. [`ConjugateSamplerFactory`] performs the
//! capability check shared by every such pair: the anchor's distribution must
//! be the prior family and untruncated, and every observed node of the step
//! that depends on the anchor must be an untruncated member of the likelihood
//! family whose linked parameter is affine in the anchor while its other
//! parameters do not depend on it. The bound sampler then draws from the
//! exact posterior and weights by the marginal likelihood ratio
//! `p(x) p(y | x) / q(x | y)`, which does not depend on the draw.

use std::sync::Arc;

use rand::RngCore;
use smallvec::SmallVec;

use crate::engine::distributions::{Bounds, DistributionFamily};
use crate::engine::errors::SmcError;
use crate::engine::graph::{Graph, NodeId};
use crate::engine::node_sampler::{
    anchor_dependence, as_refs, dependence_of, Dependence, NodeSampler, NodeSamplerFactory,
    StepContext,
};
use crate::engine::schedule::ScheduleStep;
use crate::engine::value::NodeValue;

/// One observation's contribution, with its linked parameter written as
/// `coefficient * anchor + offset`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearTerm {
    pub observed: f64,
    pub coefficient: f64,
    pub offset: f64,
    /// Remaining likelihood parameters in declaration order.
    pub other_params: SmallVec<[f64; 2]>,
}

/// A closed-form posterior update for one (prior, likelihood) pair.
pub trait ConjugateStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn prior_family(&self) -> DistributionFamily;

    fn likelihood_family(&self) -> DistributionFamily;

    /// Index of the likelihood parameter linked to the anchor.
    fn linked_param(&self) -> usize;

    /// Whether the link must be a pure scale (no offset).
    fn requires_scale(&self) -> bool {
        false
    }

    /// Posterior parameters in the prior distribution's parameterization.
    fn posterior(
        &self,
        prior_params: &[&NodeValue],
        terms: &[LinearTerm],
    ) -> Result<SmallVec<[NodeValue; 2]>, SmcError>;
}

/// Normal prior on the mean of normal observations with known precision.
///
/// ```text
/// tau_n = tau_0 + sum_k a_k^2 tau_k
/// mu_n  = (tau_0 mu_0 + sum_k a_k tau_k (y_k - b_k)) / tau_n
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct NormalMean;

impl ConjugateStrategy for NormalMean {
    fn name(&self) -> &'static str {
        "conjugate_normal"
    }

    fn prior_family(&self) -> DistributionFamily {
        DistributionFamily::Normal
    }

    fn likelihood_family(&self) -> DistributionFamily {
        DistributionFamily::Normal
    }

    fn linked_param(&self) -> usize {
        0
    }

    fn posterior(
        &self,
        prior_params: &[&NodeValue],
        terms: &[LinearTerm],
    ) -> Result<SmallVec<[NodeValue; 2]>, SmcError> {
        let (mu0, tau0) = match prior_params {
            [m, t] => (m.as_scalar("prior mean")?, t.as_scalar("prior precision")?),
            _ => return Err(SmcError::Logic("normal prior takes 2 parameters".into())),
        };
        let mut precision = tau0;
        let mut weighted = tau0 * mu0;
        for term in terms {
            let tau = term.other_params.first().copied().ok_or_else(|| {
                SmcError::Logic("normal likelihood term is missing its precision".into())
            })?;
            if !(tau.is_finite() && tau > 0.0) {
                return Err(SmcError::numerical(
                    "likelihood precision",
                    format!("precision {} is not positive", tau),
                ));
            }
            precision += term.coefficient * term.coefficient * tau;
            weighted += term.coefficient * tau * (term.observed - term.offset);
        }
        if !(precision.is_finite() && precision > 0.0) {
            return Err(SmcError::numerical(
                "posterior precision",
                format!("posterior precision {} is not positive definite", precision),
            ));
        }
        let mean = weighted / precision;
        if !mean.is_finite() {
            return Err(SmcError::numerical(
                "posterior mean",
                format!("posterior mean is {}", mean),
            ));
        }
        Ok(SmallVec::from_buf([
            NodeValue::scalar(mean),
            NodeValue::scalar(precision),
        ]))
    }
}

/// Factory binding a [`ConjugateStrategy`] to the steps it applies to.
#[derive(Clone)]
pub struct ConjugateSamplerFactory {
    strategy: Arc<dyn ConjugateStrategy>,
}

impl ConjugateSamplerFactory {
    pub fn new(strategy: Arc<dyn ConjugateStrategy>) -> Self {
        Self { strategy }
    }

    pub fn normal_mean() -> Self {
        Self::new(Arc::new(NormalMean))
    }

    fn link_ok(&self, dep: Dependence) -> bool {
        if self.strategy.requires_scale() {
            dep == Dependence::Scale
        } else {
            dep.is_affine()
        }
    }
}

impl NodeSamplerFactory for ConjugateSamplerFactory {
    fn name(&self) -> &'static str {
        self.strategy.name()
    }

    fn bind(&self, graph: &Graph, step: &ScheduleStep) -> Option<Arc<dyn NodeSampler>> {
        let anchor = graph.node(step.anchor).ok()?;
        let dist = anchor.distribution()?;
        if dist.family() != self.strategy.prior_family() || anchor.is_bounded() {
            return None;
        }

        let deps = anchor_dependence(graph, step);
        let linked_param = self.strategy.linked_param();
        let mut linked: SmallVec<[NodeId; 4]> = SmallVec::new();
        for &obs in &step.observed {
            let child = graph.node(obs).ok()?;
            if child
                .parents
                .iter()
                .all(|p| dependence_of(&deps, *p) == Dependence::Known)
            {
                continue;
            }
            let child_dist = child.distribution()?;
            if child_dist.family() != self.strategy.likelihood_family() || child.is_bounded() {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    "{}: node {} not bound, child {} is not an untruncated {:?}",
                    self.strategy.name(),
                    step.anchor,
                    obs,
                    self.strategy.likelihood_family()
                );
                return None;
            }
            for (k, parent) in child.param_parents().iter().enumerate() {
                let dep = dependence_of(&deps, *parent);
                let ok = if k == linked_param {
                    self.link_ok(dep)
                } else {
                    dep == Dependence::Known
                };
                if !ok {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        "{}: node {} not bound, parameter {} of child {} is {:?} in the anchor",
                        self.strategy.name(),
                        step.anchor,
                        k,
                        obs,
                        dep
                    );
                    return None;
                }
            }
            linked.push(obs);
        }
        if linked.is_empty() {
            return None;
        }
        Some(Arc::new(ConjugateSampler {
            strategy: self.strategy.clone(),
            linked,
        }))
    }
}

/// Exact posterior sampler produced by [`ConjugateSamplerFactory`].
pub struct ConjugateSampler {
    strategy: Arc<dyn ConjugateStrategy>,
    linked: SmallVec<[NodeId; 4]>,
}

impl ConjugateSampler {
    fn linear_term(&self, ctx: &mut StepContext<'_>, child: NodeId) -> Result<LinearTerm, SmcError> {
        let graph = ctx.graph();
        let node = graph.node(child)?;
        let linked_param = self.strategy.linked_param();
        let params = node.param_parents();
        let link = *params.get(linked_param).ok_or_else(|| {
            SmcError::Logic(format!("node {} has no parameter {}", child, linked_param))
        })?;

        let zero = Arc::new(NodeValue::scalar(0.0));
        let one = Arc::new(NodeValue::scalar(1.0));
        let offset = ctx.evaluate_with_anchor(link, &zero)?.as_scalar("linked parameter")?;
        let at_one = ctx.evaluate_with_anchor(link, &one)?.as_scalar("linked parameter")?;

        let mut other_params = SmallVec::new();
        for (k, p) in params.iter().enumerate() {
            if k != linked_param {
                other_params.push(ctx.resolve(*p)?.as_scalar("likelihood parameter")?);
            }
        }
        Ok(LinearTerm {
            observed: ctx.value(child)?.as_scalar("observation")?,
            coefficient: at_one - offset,
            offset,
            other_params,
        })
    }
}

impl NodeSampler for ConjugateSampler {
    fn name(&self) -> &'static str {
        self.strategy.name()
    }

    fn sample(&self, ctx: &mut StepContext<'_>, rng: &mut dyn RngCore) -> Result<f64, SmcError> {
        let anchor = ctx.anchor();
        let graph = ctx.graph();
        let node = graph.node(anchor)?;
        let dist = node
            .distribution()
            .ok_or_else(|| SmcError::Logic(format!("anchor {} is not stochastic", anchor)))?;
        if node.is_bounded() {
            return Err(SmcError::at_node(
                anchor,
                SmcError::Logic(format!("{} does not support truncation", self.name())),
            ));
        }

        let prior_params = ctx.resolve_parents(anchor)?;
        let mut terms = Vec::with_capacity(self.linked.len());
        for &child in &self.linked {
            terms.push(
                self.linear_term(ctx, child)
                    .map_err(|e| SmcError::at_node(child, e))?,
            );
        }

        let posterior = self
            .strategy
            .posterior(&as_refs(&prior_params), &terms)
            .map_err(|e| SmcError::at_node(anchor, e))?;
        let posterior_refs: SmallVec<[&NodeValue; 2]> = posterior.iter().collect();
        let x = dist
            .sample(&posterior_refs, Bounds::none(), rng)
            .map_err(|e| SmcError::at_node(anchor, e))?;
        let log_posterior = dist
            .log_density(&x, &posterior_refs, Bounds::none())
            .map_err(|e| SmcError::at_node(anchor, e))?;
        if !log_posterior.is_finite() {
            return Err(SmcError::at_node(
                anchor,
                SmcError::numerical("posterior density", "draw has zero posterior density"),
            ));
        }

        ctx.set_value(anchor, x);
        let log_prior = ctx.log_density_at_current(anchor)?;
        let log_likelihood = ctx.observed_log_likelihood()?;
        Ok(log_prior + log_likelihood - log_posterior)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::engine::graph::GraphBuilder;
    use crate::engine::numeric::normal_log_density;
    use crate::engine::particle::Particle;
    use crate::engine::schedule::NodeSchedule;

    /// x ~ N(0, 1); y ~ N(a x + b, tau_y) observed.
    fn linear_model(a: f64, b: f64, tau_y: f64, y: f64) -> (Graph, NodeId) {
        let mut g = GraphBuilder::new();
        let zero = g.constant(NodeValue::scalar(0.0));
        let one = g.constant(NodeValue::scalar(1.0));
        let x = g.stochastic("dnorm", &[zero, one], None).unwrap();
        let ca = g.constant(NodeValue::scalar(a));
        let cb = g.constant(NodeValue::scalar(b));
        let ax = g.logical("mul", &[ca, x]).unwrap();
        let mean = g.logical("add", &[ax, cb]).unwrap();
        let ty = g.constant(NodeValue::scalar(tau_y));
        g.stochastic("dnorm", &[mean, ty], Some(NodeValue::scalar(y)))
            .unwrap();
        (g.finish().unwrap(), x)
    }

    #[test]
    fn posterior_matches_closed_form() {
        let terms = [LinearTerm {
            observed: 2.0,
            coefficient: 1.0,
            offset: 0.0,
            other_params: SmallVec::from_slice(&[1.0]),
        }];
        let post = NormalMean
            .posterior(&[&NodeValue::scalar(0.0), &NodeValue::scalar(1.0)], &terms)
            .unwrap();
        assert!((post[0].values()[0] - 1.0).abs() < 1e-12);
        assert!((post[1].values()[0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn negative_precision_is_numerical_error() {
        let err = NormalMean
            .posterior(&[&NodeValue::scalar(0.0), &NodeValue::scalar(-3.0)], &[])
            .unwrap_err();
        assert!(err.is_numerical());
    }

    #[test]
    fn weight_is_the_marginal_likelihood() {
        let (a, b, tau_y, y) = (2.0, 0.5, 4.0, 1.7);
        let (g, x) = linear_model(a, b, tau_y, y);
        let schedule = NodeSchedule::build(&g).unwrap();
        let step = &schedule.steps()[0];
        let sampler = ConjugateSamplerFactory::normal_mean()
            .bind(&g, step)
            .expect("linear child should bind");
        assert_eq!(sampler.name(), "conjugate_normal");

        // y | marginal ~ N(b, 1/(a^2 + 1/tau_y))
        let marginal_var = a * a + 1.0 / tau_y;
        let expected = normal_log_density(y, b, 1.0 / marginal_var);
        for seed in 0..5 {
            let mut particle = Particle::new(g.len());
            let mut rng = StdRng::seed_from_u64(seed);
            let mut ctx = StepContext::new(&g, step, &mut particle);
            let w = sampler.sample(&mut ctx, &mut rng).unwrap();
            assert!((w - expected).abs() < 1e-9, "seed {}: {} vs {}", seed, w, expected);
            assert!(particle.is_set(x));
        }
    }

    #[test]
    fn nonlinear_child_is_not_bound() {
        let mut g = GraphBuilder::new();
        let zero = g.constant(NodeValue::scalar(0.0));
        let one = g.constant(NodeValue::scalar(1.0));
        let x = g.stochastic("dnorm", &[zero, one], None).unwrap();
        let ex = g.logical("exp", &[x]).unwrap();
        g.stochastic("dnorm", &[ex, one], Some(NodeValue::scalar(1.0)))
            .unwrap();
        let g = g.finish().unwrap();
        let s = NodeSchedule::build(&g).unwrap();
        assert!(ConjugateSamplerFactory::normal_mean()
            .bind(&g, &s.steps()[0])
            .is_none());
    }

    #[test]
    fn anchor_in_precision_is_not_bound() {
        let mut g = GraphBuilder::new();
        let one = g.constant(NodeValue::scalar(1.0));
        let x = g.stochastic("dnorm", &[one, one], None).unwrap();
        g.stochastic("dnorm", &[one, x], Some(NodeValue::scalar(1.0)))
            .unwrap();
        let g = g.finish().unwrap();
        let s = NodeSchedule::build(&g).unwrap();
        assert!(ConjugateSamplerFactory::normal_mean()
            .bind(&g, &s.steps()[0])
            .is_none());
    }

    #[test]
    fn truncated_anchor_is_not_bound() {
        let mut g = GraphBuilder::new();
        let zero = g.constant(NodeValue::scalar(0.0));
        let one = g.constant(NodeValue::scalar(1.0));
        let x = g
            .truncated("dnorm", &[zero, one], Some(zero), None, None)
            .unwrap();
        g.stochastic("dnorm", &[x, one], Some(NodeValue::scalar(1.0)))
            .unwrap();
        let g = g.finish().unwrap();
        let s = NodeSchedule::build(&g).unwrap();
        assert!(ConjugateSamplerFactory::normal_mean()
            .bind(&g, &s.steps()[0])
            .is_none());
    }
}
