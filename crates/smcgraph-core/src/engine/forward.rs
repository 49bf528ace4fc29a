//! Forward particle filter over the node schedule.
//!
//! ## Lifecycle
//!
//! `new` → [`ForwardSampler::build`] (schedule + sampler binding) →
//! [`ForwardSampler::initialize`] (population of N particles, step 0) →
//! [`ForwardSampler::iterate`] until the last step. Any failure while a step
//! runs leaves the sampler failed; only `initialize` restarts it.
//!
//! ## Step barrier
//!
//! Particles are independent while a step runs and may be processed in
//! parallel (`parallel` feature). Resampling, weight finalization, monitor
//! snapshots and value release happen between steps on the whole population.
//! Each particle draws from its own generator seeded from the master
//! generator at the barrier, so the parallel and sequential builds agree.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::engine::backward::BackwardSmoother;
use crate::engine::config::SmcConfig;
use crate::engine::errors::SmcError;
use crate::engine::graph::{Graph, NodeId};
use crate::engine::monitor::{Columns, Monitor, NodeColumn};
use crate::engine::node_sampler::{NodeSampler, SamplerChain, StepContext};
use crate::engine::particle::Particle;
use crate::engine::resampler::{counts_to_sources, Resampler};
use crate::engine::schedule::{LockTable, NodeSchedule, ScheduleStep};
use crate::engine::value::NodeValue;
use crate::engine::weights::{rescale_log_weights, summarize_log_weights};
use crate::stats::WeightedSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Unbuilt,
    Built,
    Initialized,
    AtEnd,
    Failed,
}

/// Bookkeeping of one finished forward step.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StepDiagnostics {
    pub iteration: usize,
    pub anchor: NodeId,
    pub ess: f64,
    /// Maximum log weight subtracted before the weights were summed.
    pub log_weight_shift: f64,
    /// Whether the population is resampled before the next step.
    pub resampled: bool,
    pub log_norm_const: f64,
}

/// Population state that exists once the sampler is initialized.
struct Population {
    config: SmcConfig,
    resampler: Box<dyn Resampler>,
    rng: StdRng,
    particles: Vec<Particle>,
    locks: LockTable,
    iteration: usize,
    resample_next: bool,
    prev_sum: f64,
    log_norm_const: f64,
    ess: f64,
}

/// Sequential Monte Carlo sampler walking the node schedule forward.
pub struct ForwardSampler {
    graph: Arc<Graph>,
    chain: SamplerChain,
    state: SamplerState,
    schedule: Option<NodeSchedule>,
    samplers: Vec<Arc<dyn NodeSampler>>,
    population: Option<Population>,
    pinned: Vec<NodeId>,
    requested: FxHashSet<usize>,
    monitors: BTreeMap<usize, Monitor>,
    current: Option<Monitor>,
    diagnostics: Vec<StepDiagnostics>,
}

impl ForwardSampler {
    pub fn new(graph: Arc<Graph>, chain: SamplerChain) -> Self {
        Self {
            graph,
            chain,
            state: SamplerState::Unbuilt,
            schedule: None,
            samplers: Vec::new(),
            population: None,
            pinned: Vec::new(),
            requested: FxHashSet::default(),
            monitors: BTreeMap::new(),
            current: None,
            diagnostics: Vec::new(),
        }
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    /// Computes the schedule and binds one node sampler per step.
    pub fn build(&mut self) -> Result<(), SmcError> {
        if self.state != SamplerState::Unbuilt {
            return Err(SmcError::Logic("forward sampler is already built".into()));
        }
        let schedule = NodeSchedule::build(&self.graph)?;
        if schedule.is_empty() {
            return Err(SmcError::Logic(
                "schedule is empty: the graph has no unobserved stochastic node".into(),
            ));
        }
        let samplers: Vec<Arc<dyn NodeSampler>> = schedule
            .steps()
            .iter()
            .map(|step| {
                let sampler = self.chain.bind(&self.graph, step);
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    "bound sampler '{}' to node {}",
                    sampler.name(),
                    step.anchor
                );
                sampler
            })
            .collect();
        self.schedule = Some(schedule);
        self.samplers = samplers;
        self.state = SamplerState::Built;
        Ok(())
    }

    fn schedule(&self) -> Result<&NodeSchedule, SmcError> {
        self.schedule
            .as_ref()
            .ok_or_else(|| SmcError::Logic("forward sampler is not built".into()))
    }

    fn population(&self) -> Result<&Population, SmcError> {
        self.population
            .as_ref()
            .ok_or_else(|| SmcError::Logic("forward sampler is not initialized".into()))
    }

    /// Allocates the population and runs schedule step 0.
    ///
    /// May be called again after a run (or a failure) to restart.
    pub fn initialize(&mut self, config: SmcConfig) -> Result<&Monitor, SmcError> {
        if self.state == SamplerState::Unbuilt {
            return Err(SmcError::Logic("initialize called before build".into()));
        }
        let config = config.validate()?;
        let schedule = self.schedule()?;
        let mut locks = LockTable::from_schedule(&self.graph, schedule);
        for id in &self.pinned {
            locks.pin(*id);
        }
        let n = config.n_particles;
        self.population = Some(Population {
            resampler: config.resampler.build(),
            rng: StdRng::seed_from_u64(config.seed),
            particles: vec![Particle::new(self.graph.len()); n],
            locks,
            iteration: 0,
            resample_next: false,
            prev_sum: n as f64,
            log_norm_const: 0.0,
            ess: n as f64,
            config,
        });
        self.monitors.clear();
        self.current = None;
        self.diagnostics.clear();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "initialize: {} particles, resampler {}",
            n,
            self.population()?.config.resampler
        );
        self.guarded(|s| s.run_step(0))?;
        self.current_monitor()
    }

    /// Advances one step: resample if flagged, sample, finalize.
    pub fn iterate(&mut self) -> Result<&Monitor, SmcError> {
        match self.state {
            SamplerState::Initialized => {}
            SamplerState::AtEnd => {
                return Err(SmcError::Logic("iterate called after the last step".into()))
            }
            SamplerState::Failed => {
                return Err(SmcError::Logic(
                    "iterate called after a failed step; initialize again".into(),
                ))
            }
            _ => return Err(SmcError::Logic("iterate called before initialize".into())),
        }
        let next = self.population()?.iteration + 1;
        self.guarded(|s| {
            if s.population()?.resample_next {
                s.resample()?;
            }
            s.run_step(next)
        })?;
        self.current_monitor()
    }

    /// Iterates until the last step.
    pub fn run(&mut self) -> Result<(), SmcError> {
        while self.state == SamplerState::Initialized {
            self.iterate()?;
        }
        Ok(())
    }

    fn guarded(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<(), SmcError>,
    ) -> Result<(), SmcError> {
        let result = f(self);
        if result.is_err() {
            self.state = SamplerState::Failed;
        }
        result
    }

    fn current_monitor(&self) -> Result<&Monitor, SmcError> {
        self.current
            .as_ref()
            .ok_or_else(|| SmcError::Logic("no step has been run".into()))
    }

    fn resample(&mut self) -> Result<(), SmcError> {
        let pop = self
            .population
            .as_mut()
            .ok_or_else(|| SmcError::Logic("forward sampler is not initialized".into()))?;
        let weights: Vec<f64> = pop.particles.iter().map(|p| p.log_weight().exp()).collect();
        let counts = pop.resampler.counts(&weights, pop.prev_sum, &mut pop.rng)?;
        let sources = counts_to_sources(&counts)?;
        for (slot, &source) in sources.iter().enumerate() {
            if source != slot {
                let replica = pop.particles[source].clone();
                pop.particles[slot] = replica;
            }
        }
        for particle in &mut pop.particles {
            particle.set_log_weight(0.0);
        }
        pop.prev_sum = pop.particles.len() as f64;
        Ok(())
    }

    fn run_step(&mut self, iteration: usize) -> Result<(), SmcError> {
        let schedule = self
            .schedule
            .as_ref()
            .ok_or_else(|| SmcError::Logic("forward sampler is not built".into()))?;
        let step = schedule.step(iteration)?;
        let sampler = self
            .samplers
            .get(iteration)
            .cloned()
            .ok_or_else(|| SmcError::Logic(format!("no sampler bound to step {}", iteration)))?;
        let pop = self
            .population
            .as_mut()
            .ok_or_else(|| SmcError::Logic("forward sampler is not initialized".into()))?;

        let seeds: Vec<u64> = (0..pop.particles.len()).map(|_| pop.rng.gen()).collect();
        let graph: &Graph = &self.graph;
        let work = |particle: &mut Particle, seed: u64| -> Result<(), SmcError> {
            sample_particle(graph, step, sampler.as_ref(), particle, seed)
        };
        #[cfg(feature = "parallel")]
        pop.particles
            .par_iter_mut()
            .zip(seeds.par_iter())
            .try_for_each(|(p, s)| work(p, *s))?;
        #[cfg(not(feature = "parallel"))]
        pop.particles
            .iter_mut()
            .zip(seeds)
            .try_for_each(|(p, s)| work(p, s))?;

        self.finalize(iteration)
    }

    fn finalize(&mut self, iteration: usize) -> Result<(), SmcError> {
        let schedule = self
            .schedule
            .as_ref()
            .ok_or_else(|| SmcError::Logic("forward sampler is not built".into()))?;
        let step = schedule.step(iteration)?;
        let pop = self
            .population
            .as_mut()
            .ok_or_else(|| SmcError::Logic("forward sampler is not initialized".into()))?;

        let mut log_weights: Vec<f64> = pop.particles.iter().map(Particle::log_weight).collect();
        let shift = rescale_log_weights(&mut log_weights);
        for (particle, lw) in pop.particles.iter_mut().zip(&log_weights) {
            particle.set_log_weight(*lw);
        }
        let summary = summarize_log_weights(&log_weights)?;
        let resampled = summary.ess < pop.config.ess_threshold_particles();
        let log_norm_const =
            pop.log_norm_const + summary.sum.ln() - pop.prev_sum.ln() + shift;
        if log_norm_const.is_nan() {
            return Err(SmcError::numerical(
                "log normalizing constant",
                format!("iteration {}", iteration),
            ));
        }
        pop.log_norm_const = log_norm_const;
        pop.prev_sum = summary.sum;
        pop.ess = summary.ess;
        pop.resample_next = resampled;
        pop.iteration = iteration;

        let retain = pop.config.retain_filter_monitors || self.requested.contains(&iteration);
        let next_anchor = schedule.steps().get(iteration + 1).map(|s| s.anchor);
        let context: SmallVec<[NodeId; 4]> = match next_anchor {
            Some(anchor) if pop.config.retain_filter_monitors => {
                self.graph.parents(anchor).iter().copied().collect()
            }
            _ => SmallVec::new(),
        };
        let weights: Arc<[f64]> = log_weights.iter().map(|lw| lw.exp()).collect();
        let monitor = snapshot(&self.graph, step, &context, &pop.particles, iteration, weights)?;

        for id in pop.locks.finish_step(iteration)? {
            for particle in &mut pop.particles {
                particle.release(id);
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "forward step {}: anchor {}, ess {:.3}, resample {}, logZ {:.6}",
            iteration,
            step.anchor,
            summary.ess,
            resampled,
            log_norm_const
        );

        self.diagnostics.push(StepDiagnostics {
            iteration,
            anchor: step.anchor,
            ess: summary.ess,
            log_weight_shift: shift,
            resampled,
            log_norm_const,
        });
        if retain {
            self.monitors.insert(iteration, monitor.clone());
        }
        self.current = Some(monitor);
        self.state = if iteration + 1 == schedule.len() {
            SamplerState::AtEnd
        } else {
            SamplerState::Initialized
        };
        Ok(())
    }

    /// Step index at which `id` is sampled.
    pub fn sampling_iteration(&self, id: NodeId) -> Result<usize, SmcError> {
        self.schedule()?.sampling_iteration(id)
    }

    /// Number of schedule steps (0 before `build`).
    pub fn n_iterations(&self) -> usize {
        self.schedule.as_ref().map_or(0, NodeSchedule::len)
    }

    /// Index of the last completed step.
    pub fn iteration(&self) -> Result<usize, SmcError> {
        Ok(self.population()?.iteration)
    }

    pub fn ess(&self) -> Result<f64, SmcError> {
        Ok(self.population()?.ess)
    }

    pub fn log_norm_const(&self) -> Result<f64, SmcError> {
        Ok(self.population()?.log_norm_const)
    }

    /// Current particle log weights, rescaled so the largest is 0.
    pub fn log_weights(&self) -> Result<Vec<f64>, SmcError> {
        Ok(self
            .population()?
            .particles
            .iter()
            .map(Particle::log_weight)
            .collect())
    }

    /// Anchor and bound sampler name of every step.
    pub fn node_samplers(&self) -> Vec<(NodeId, &'static str)> {
        match &self.schedule {
            Some(schedule) => schedule
                .steps()
                .iter()
                .zip(&self.samplers)
                .map(|(step, sampler)| (step.anchor, sampler.name()))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn diagnostics(&self) -> &[StepDiagnostics] {
        &self.diagnostics
    }

    /// Keeps the particle values of `id` until the end of the run.
    pub fn lock_node(&mut self, id: NodeId) -> Result<(), SmcError> {
        self.graph.node(id)?;
        if !self.pinned.contains(&id) {
            self.pinned.push(id);
            if let Some(pop) = self.population.as_mut() {
                pop.locks.pin(id);
            }
        }
        Ok(())
    }

    /// Retains the filter monitors of the steps sampling `ids`.
    pub fn monitor_nodes(&mut self, ids: &[NodeId]) -> Result<(), SmcError> {
        let iterations = ids
            .iter()
            .map(|id| self.sampling_iteration(*id))
            .collect::<Result<Vec<_>, _>>()?;
        self.requested.extend(iterations);
        Ok(())
    }

    /// Retained filter monitor of `iteration`, or the latest one.
    pub fn monitor(&self, iteration: usize) -> Option<&Monitor> {
        self.monitors
            .get(&iteration)
            .or_else(|| self.current.as_ref().filter(|m| m.iteration() == iteration))
    }

    /// Feeds the filtered values of `id` into `sink`.
    pub fn accumulate(
        &self,
        id: NodeId,
        sink: &mut dyn WeightedSink,
        component: Option<usize>,
    ) -> Result<(), SmcError> {
        if self.graph.is_observed(id) {
            return Err(SmcError::Logic(format!(
                "node {} is observed and has no filtered values",
                id
            )));
        }
        let iteration = self.sampling_iteration(id)?;
        let monitor = self.monitor(iteration).ok_or_else(|| {
            SmcError::Logic(format!(
                "no monitor retained for iteration {} (node {})",
                iteration, id
            ))
        })?;
        monitor.accumulate(id, sink, component)
    }

    /// Values of `id` held by every particle now.
    pub fn final_values(&self, id: NodeId) -> Result<Vec<Arc<NodeValue>>, SmcError> {
        let pop = self.population()?;
        pop.particles
            .iter()
            .map(|p| {
                p.value(&self.graph, id).cloned().ok_or_else(|| {
                    SmcError::Logic(format!(
                        "node {} has no value; it was released or not yet sampled",
                        id
                    ))
                })
            })
            .collect()
    }

    pub fn clear_monitors(&mut self) {
        self.monitors.clear();
    }

    /// Starts backward smoothing from the end of a completed run.
    pub fn init_backward_smoother(&self) -> Result<BackwardSmoother, SmcError> {
        if self.state != SamplerState::AtEnd {
            return Err(SmcError::Logic(
                "backward smoothing requires a completed forward pass".into(),
            ));
        }
        let schedule = self.schedule()?;
        if !self.population()?.config.retain_filter_monitors {
            return Err(SmcError::Logic(
                "backward smoothing requires retain_filter_monitors".into(),
            ));
        }
        let monitors = (0..schedule.len())
            .map(|t| {
                self.monitors.get(&t).cloned().ok_or_else(|| {
                    SmcError::Logic(format!("filter monitor of iteration {} was released", t))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let anchors = schedule.steps().iter().map(|s| s.anchor).collect();
        BackwardSmoother::new(self.graph.clone(), anchors, monitors)
    }
}

fn sample_particle(
    graph: &Graph,
    step: &ScheduleStep,
    sampler: &dyn NodeSampler,
    particle: &mut Particle,
    seed: u64,
) -> Result<(), SmcError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut ctx = StepContext::new(graph, step, particle);
    let increment = sampler
        .sample(&mut ctx, &mut rng)
        .map_err(|e| SmcError::at_node(step.anchor, e))?;
    for &id in &step.logical {
        ctx.resolve(id)?;
    }
    if increment.is_nan() {
        return Err(SmcError::at_node(
            step.anchor,
            SmcError::numerical("incremental weight", format!("{} returned NaN", sampler.name())),
        ));
    }
    particle.add_log_weight(increment);
    Ok(())
}

/// Filter monitor over the step's sampled and observed nodes plus `context`.
fn snapshot(
    graph: &Graph,
    step: &ScheduleStep,
    context: &[NodeId],
    particles: &[Particle],
    iteration: usize,
    weights: Arc<[f64]>,
) -> Result<Monitor, SmcError> {
    let nodes: SmallVec<[NodeId; 8]> = step.consumers().collect();
    let mut columns: Columns = FxHashMap::default();
    for &id in nodes.iter().chain(context) {
        if columns.contains_key(&id) {
            continue;
        }
        let column = match graph.value(id) {
            Some(shared) => NodeColumn::Shared(shared.clone()),
            None => NodeColumn::PerParticle(
                particles
                    .iter()
                    .map(|p| {
                        p.own_value(id).cloned().ok_or_else(|| {
                            SmcError::Logic(format!(
                                "node {} missing from a particle at iteration {}",
                                id, iteration
                            ))
                        })
                    })
                    .collect::<Result<_, _>>()?,
            ),
        };
        columns.insert(id, column);
    }
    Ok(Monitor::filter(iteration, nodes, columns, weights))
}
