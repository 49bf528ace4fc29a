use smcgraph_core::{
    ForwardSampler, GraphBuilder, MonitorKind, NodeValue, SamplerChain, ScalarAccumulator,
    SmcConfig,
};
use std::sync::Arc;

use crate::models::Lgssm;

const MODEL: Lgssm = Lgssm {
    a: 0.8,
    q: 2.0,
    r: 1.5,
};

fn forward(steps: usize, n: usize, seed: u64) -> (ForwardSampler, Vec<smcgraph_core::NodeId>, Vec<f64>) {
    let data = MODEL.simulate(steps, seed);
    let model = MODEL.graph(steps, Some(&data));
    let mut f = ForwardSampler::new(model.graph, SamplerChain::with_builtins());
    f.build().unwrap();
    f.initialize(SmcConfig::new(n, seed).retaining_filter_monitors())
        .unwrap();
    f.run().unwrap();
    (f, model.xs, data)
}

#[test]
fn one_step_model_has_nothing_to_smooth() {
    let mut b = GraphBuilder::new();
    let zero = b.constant(NodeValue::scalar(0.0));
    let one = b.constant(NodeValue::scalar(1.0));
    let x = b.stochastic("dnorm", &[zero, one], None).unwrap();
    b.stochastic("dnorm", &[x, one], Some(NodeValue::scalar(0.4)))
        .unwrap();
    let mut f = ForwardSampler::new(Arc::new(b.finish().unwrap()), SamplerChain::prior_only());
    f.build().unwrap();
    f.initialize(SmcConfig::new(50, 8).retaining_filter_monitors())
        .unwrap();

    let mut smoother = f.init_backward_smoother().unwrap();
    assert_eq!(smoother.iteration(), 0);
    assert!(smoother.is_exhausted());
    assert_eq!(smoother.weights(), f.monitor(0).unwrap().weights());
    assert_eq!(smoother.monitor().kind(), MonitorKind::Smooth);
    assert!(smoother.iterate_back().unwrap_err().is_logic());
}

#[test]
fn smoothed_means_match_rts() {
    let steps = 5;
    let (f, xs, data) = forward(steps, 600, 31);
    let rts = MODEL.rts(&MODEL.kalman(&data));

    let mut smoother = f.init_backward_smoother().unwrap();
    assert_eq!(smoother.iteration(), steps - 1);
    let initial_sum = smoother.sum_of_weights();

    let mut acc = ScalarAccumulator::new();
    smoother.accumulate(xs[steps - 1], &mut acc, None).unwrap();
    assert!((acc.mean().unwrap() - rts[steps - 1]).abs() < 0.1);

    while !smoother.is_exhausted() {
        let monitor = smoother.iterate_back().unwrap();
        let t = monitor.iteration();
        assert_eq!(monitor.kind(), MonitorKind::Smooth);

        let mut acc = ScalarAccumulator::new();
        smoother.accumulate(xs[t], &mut acc, None).unwrap();
        let mean = acc.mean().unwrap();
        assert!(
            (mean - rts[t]).abs() < 0.15,
            "step {}: {} vs {}",
            t,
            mean,
            rts[t]
        );

        let ess = smoother.ess();
        assert!(ess > 0.0 && ess <= 600.0 + 1e-9);
        let relative = (smoother.sum_of_weights() - initial_sum).abs() / initial_sum;
        assert!(relative < 1e-9, "weight sum drifted by {}", relative);
    }
    assert_eq!(smoother.iteration(), 0);
    assert!(smoother.iterate_back().is_err());
}

#[test]
fn smoothing_does_not_touch_filter_monitors() {
    let (f, xs, _) = forward(3, 100, 4);
    let before: Vec<f64> = f.monitor(0).unwrap().weights().to_vec();
    let mut smoother = f.init_backward_smoother().unwrap();
    smoother.iterate_back().unwrap();
    smoother.iterate_back().unwrap();
    assert_eq!(f.monitor(0).unwrap().weights(), before.as_slice());

    // Values are shared with the filter snapshot; only the weights differ.
    let mut filtered = ScalarAccumulator::new();
    f.accumulate(xs[0], &mut filtered, None).unwrap();
    let mut smoothed = ScalarAccumulator::new();
    smoother.accumulate(xs[0], &mut smoothed, None).unwrap();
    assert_eq!(filtered.count(), smoothed.count());
}

#[test]
fn smoother_reads_only_current_iteration() {
    let (f, xs, _) = forward(3, 40, 12);
    let smoother = f.init_backward_smoother().unwrap();
    let mut acc = ScalarAccumulator::new();
    assert!(smoother.accumulate(xs[0], &mut acc, None).unwrap_err().is_logic());
}

#[test]
fn transition_from_two_steps_back_uses_context_columns() {
    // x2 depends on x0, sampled two steps before it.
    let (y0, y1, y2) = (0.8, -0.3, 1.9);
    let mut b = GraphBuilder::new();
    let zero = b.constant(NodeValue::scalar(0.0));
    let one = b.constant(NodeValue::scalar(1.0));
    let q = b.constant(NodeValue::scalar(2.0));
    let x0 = b.stochastic("dnorm", &[zero, one], None).unwrap();
    b.stochastic("dnorm", &[x0, one], Some(NodeValue::scalar(y0)))
        .unwrap();
    let x1 = b.stochastic("dnorm", &[zero, one], None).unwrap();
    b.stochastic("dnorm", &[x1, one], Some(NodeValue::scalar(y1)))
        .unwrap();
    let x2 = b.stochastic("dnorm", &[x0, q], None).unwrap();
    b.stochastic("dnorm", &[x2, one], Some(NodeValue::scalar(y2)))
        .unwrap();

    let mut f = ForwardSampler::new(Arc::new(b.finish().unwrap()), SamplerChain::with_builtins());
    f.build().unwrap();
    assert_eq!(f.sampling_iteration(x2).unwrap(), 2);
    f.initialize(SmcConfig::new(2000, 21).retaining_filter_monitors())
        .unwrap();
    f.run().unwrap();

    let mut smoother = f.init_backward_smoother().unwrap();
    let monitor = smoother.iterate_back().unwrap();
    assert_eq!(monitor.iteration(), 1);
    assert!(!monitor.contains(x0));
    let column = monitor.node_values(x0).unwrap();
    let (mut num, mut den) = (0.0, 0.0);
    for (i, w) in monitor.weights().iter().enumerate() {
        num += w * column.get(i).unwrap().values()[0];
        den += w;
    }
    // p(x0 | y0, y2): y2 - x0 has variance 1/2 + 1.
    let precision = 2.0 + 1.0 / 1.5;
    let expected = (y0 + y2 / 1.5) / precision;
    assert!(
        (num / den - expected).abs() < 0.06,
        "{} vs {}",
        num / den,
        expected
    );

    // x1 is independent of y2.
    let mut acc = ScalarAccumulator::new();
    smoother.accumulate(x1, &mut acc, None).unwrap();
    assert!((acc.mean().unwrap() - y1 / 2.0).abs() < 0.06);

    smoother.iterate_back().unwrap();
    assert!(smoother.is_exhausted());
}
