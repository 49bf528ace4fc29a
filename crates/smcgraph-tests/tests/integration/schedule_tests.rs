use smcgraph_core::engine::schedule::{LockTable, NodeSchedule};
use smcgraph_core::{ForwardSampler, GraphBuilder, NodeValue, SamplerChain};

use crate::models::Lgssm;

#[test]
fn schedule_has_one_step_per_latent_node() {
    let model = Lgssm {
        a: 1.0,
        q: 1.0,
        r: 1.0,
    }
    .graph(6, Some(&[0.0; 6]));
    let mut f = ForwardSampler::new(model.graph.clone(), SamplerChain::prior_only());
    f.build().unwrap();
    assert_eq!(f.n_iterations(), 6);

    let schedule = NodeSchedule::build(&model.graph).unwrap();
    let anchors: Vec<_> = schedule.steps().iter().map(|s| s.anchor).collect();
    assert_eq!(anchors, model.xs);
    for (t, x) in model.xs.iter().enumerate() {
        assert_eq!(f.sampling_iteration(*x).unwrap(), t);
    }
    for y in &model.ys {
        assert!(f.sampling_iteration(*y).unwrap_err().is_logic());
    }
    // The transition means are logical nodes sampled with the previous state.
    for step in &schedule.steps()[..5] {
        assert_eq!(step.logical.len(), 1);
        let mean = step.logical[0];
        assert_eq!(
            f.sampling_iteration(mean).unwrap(),
            f.sampling_iteration(step.anchor).unwrap()
        );
    }
    assert!(schedule.steps()[5].logical.is_empty());
}

#[test]
fn leading_observation_is_dropped() {
    // y0 depends only on constants and precedes every latent node.
    let mut b = GraphBuilder::new();
    let zero = b.constant(NodeValue::scalar(0.0));
    let one = b.constant(NodeValue::scalar(1.0));
    let y0 = b
        .stochastic("dnorm", &[zero, one], Some(NodeValue::scalar(0.5)))
        .unwrap();
    let x = b.stochastic("dnorm", &[zero, one], None).unwrap();
    let y1 = b
        .stochastic("dnorm", &[x, one], Some(NodeValue::scalar(0.1)))
        .unwrap();
    let g = b.finish().unwrap();
    let schedule = NodeSchedule::build(&g).unwrap();
    assert_eq!(schedule.dropped_observations(), &[y0]);
    assert_eq!(schedule.steps()[0].observed.as_slice(), &[y1]);
}

#[test]
fn lock_counts_cover_every_reader() {
    let model = Lgssm {
        a: 0.5,
        q: 1.0,
        r: 1.0,
    }
    .graph(3, Some(&[0.0; 3]));
    let g = &model.graph;
    let schedule = NodeSchedule::build(g).unwrap();
    let mut locks = LockTable::from_schedule(g, &schedule);
    let mut released = Vec::new();
    for t in 0..schedule.len() {
        released.extend(locks.finish_step(t).unwrap());
    }
    // Every unobserved node is released exactly once by the end.
    let mut unobserved: Vec<_> = (0..g.len() as u32)
        .map(smcgraph_core::NodeId)
        .filter(|id| !g.is_observed(*id))
        .collect();
    released.sort();
    unobserved.sort();
    assert_eq!(released, unobserved);
    for id in unobserved {
        assert_eq!(locks.count(id), 0);
    }
}
