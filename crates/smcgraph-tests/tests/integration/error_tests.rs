use std::sync::Arc;

use smcgraph_core::{
    ForwardSampler, GraphBuilder, NodeValue, ResamplerKind, SamplerChain, SamplerState,
    ScalarAccumulator, SmcConfig, SmcError,
};

/// x ~ dbern(0.5); y ~ dbern(x * 0) observed 1: no particle can explain y.
fn impossible_model() -> (Arc<smcgraph_core::Graph>, smcgraph_core::NodeId) {
    let mut b = GraphBuilder::new();
    let half = b.constant(NodeValue::scalar(0.5));
    let zero = b.constant(NodeValue::scalar(0.0));
    let x = b.stochastic("dbern", &[half], None).unwrap();
    let p = b.logical("mul", &[x, zero]).unwrap();
    b.stochastic("dbern", &[p], Some(NodeValue::scalar(1.0)))
        .unwrap();
    (Arc::new(b.finish().unwrap()), x)
}

#[test]
fn zero_total_weight_is_numerical_and_fails_the_sampler() {
    let (g, _) = impossible_model();
    let mut f = ForwardSampler::new(g, SamplerChain::prior_only());
    f.build().unwrap();
    let err = f.initialize(SmcConfig::new(16, 0)).unwrap_err();
    assert!(err.is_numerical(), "{}", err);
    assert!(matches!(
        err,
        SmcError::Numerical {
            quantity: "sum of weights",
            ..
        }
    ));
    assert_eq!(f.state(), SamplerState::Failed);
    assert!(f.iterate().unwrap_err().is_logic());
}

#[test]
fn exact_sampler_failure_is_node_scoped() {
    let (g, x) = impossible_model();
    let mut f = ForwardSampler::new(g, SamplerChain::with_builtins());
    f.build().unwrap();
    assert_eq!(f.node_samplers(), vec![(x, "finite")]);
    let err = f.initialize(SmcConfig::new(4, 0)).unwrap_err();
    assert_eq!(err.node(), Some(x));
    assert!(err.is_numerical());
    assert!(err.to_string().starts_with(&format!("node {}", x)));
}

#[test]
fn wrong_state_calls_are_logic_errors() {
    let mut b = GraphBuilder::new();
    let zero = b.constant(NodeValue::scalar(0.0));
    let one = b.constant(NodeValue::scalar(1.0));
    let x = b.stochastic("dnorm", &[zero, one], None).unwrap();
    let mut f = ForwardSampler::new(Arc::new(b.finish().unwrap()), SamplerChain::prior_only());
    let mut acc = ScalarAccumulator::new();

    assert!(f.sampling_iteration(x).unwrap_err().is_logic());
    assert!(f.ess().unwrap_err().is_logic());
    assert!(f.log_norm_const().unwrap_err().is_logic());
    assert!(f.accumulate(x, &mut acc, None).unwrap_err().is_logic());
    assert!(f.init_backward_smoother().unwrap_err().is_logic());
    f.build().unwrap();
    assert!(f.iterate().unwrap_err().is_logic());
}

#[test]
fn invalid_configuration_is_rejected_before_running() {
    let mut b = GraphBuilder::new();
    let zero = b.constant(NodeValue::scalar(0.0));
    let one = b.constant(NodeValue::scalar(1.0));
    b.stochastic("dnorm", &[zero, one], None).unwrap();
    let mut f = ForwardSampler::new(Arc::new(b.finish().unwrap()), SamplerChain::prior_only());
    f.build().unwrap();
    let err = f.initialize(SmcConfig::new(0, 1)).unwrap_err();
    assert!(matches!(err, SmcError::Validation(_)));
    assert_eq!(f.state(), SamplerState::Built);
    assert!("stratified".parse::<ResamplerKind>().is_ok());
    assert!(matches!(
        "importance".parse::<ResamplerKind>(),
        Err(SmcError::Validation(_))
    ));
}

#[test]
fn invalid_graphs_fail_to_build() {
    // Cycle through forward references.
    let mut b = GraphBuilder::new();
    let one = b.constant(NodeValue::scalar(1.0));
    let a = b.logical("add", &[one, smcgraph_core::NodeId(2)]).unwrap();
    b.logical("add", &[a, one]).unwrap();
    let err = b.finish().unwrap_err();
    assert!(err.to_string().contains("cycle"), "{}", err);

    let mut b = GraphBuilder::new();
    let one = b.constant(NodeValue::scalar(1.0));
    assert!(b.stochastic("dgamma", &[one, one], None).is_err());
    assert!(b.stochastic("dnorm", &[one], None).and_then(|_| b.finish()).is_err());

    // Observed value outside the support.
    let mut b = GraphBuilder::new();
    let p = b.constant(NodeValue::scalar(0.3));
    b.stochastic("dbern", &[p], Some(NodeValue::scalar(2.0)))
        .unwrap();
    assert!(b.finish().is_err());
}

#[test]
fn truncated_prior_draws_respect_bounds() {
    let mut b = GraphBuilder::new();
    let zero = b.constant(NodeValue::scalar(0.0));
    let one = b.constant(NodeValue::scalar(1.0));
    let lower = b.constant(NodeValue::scalar(1.5));
    let x = b
        .truncated("dnorm", &[zero, one], Some(lower), None, None)
        .unwrap();
    b.stochastic("dnorm", &[x, one], Some(NodeValue::scalar(2.0)))
        .unwrap();
    let mut f = ForwardSampler::new(Arc::new(b.finish().unwrap()), SamplerChain::with_builtins());
    f.build().unwrap();
    // Truncation rules out the conjugate sampler.
    assert_eq!(f.node_samplers()[0].1, "prior");
    f.lock_node(x).unwrap();
    f.initialize(SmcConfig::new(200, 6)).unwrap();
    let values = f.final_values(x).unwrap();
    assert!(values.iter().all(|v| v.values()[0] >= 1.5));
}

#[test]
fn far_tail_truncations_run() {
    // Observed node truncated nine standard deviations above its prior mean.
    let mut b = GraphBuilder::new();
    let zero = b.constant(NodeValue::scalar(0.0));
    let one = b.constant(NodeValue::scalar(1.0));
    let nine = b.constant(NodeValue::scalar(9.0));
    let x = b.stochastic("dnorm", &[zero, one], None).unwrap();
    b.truncated("dnorm", &[x, one], Some(nine), None, Some(NodeValue::scalar(9.5)))
        .unwrap();
    let mut f = ForwardSampler::new(Arc::new(b.finish().unwrap()), SamplerChain::with_builtins());
    f.build().unwrap();
    f.initialize(SmcConfig::new(500, 2)).unwrap();
    assert!(f.log_norm_const().unwrap().is_finite());

    // Latent node truncated six standard deviations out.
    let mut b = GraphBuilder::new();
    let zero = b.constant(NodeValue::scalar(0.0));
    let one = b.constant(NodeValue::scalar(1.0));
    let six = b.constant(NodeValue::scalar(6.0));
    let x = b.truncated("dnorm", &[zero, one], Some(six), None, None).unwrap();
    b.stochastic("dnorm", &[x, one], Some(NodeValue::scalar(6.5)))
        .unwrap();
    let mut f = ForwardSampler::new(Arc::new(b.finish().unwrap()), SamplerChain::with_builtins());
    f.build().unwrap();
    f.lock_node(x).unwrap();
    f.initialize(SmcConfig::new(500, 2)).unwrap();
    let values = f.final_values(x).unwrap();
    assert!(values.iter().all(|v| v.values()[0] >= 6.0));
}
