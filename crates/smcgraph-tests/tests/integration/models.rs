//! Shared test models and closed-form references.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use smcgraph_core::{Graph, GraphBuilder, NodeId, NodeValue};

/// Scalar linear-Gaussian state space model:
/// `x_0 ~ N(0, 1)`, `x_t ~ N(a x_{t-1}, 1/q)`, `y_t ~ N(x_t, 1/r)`.
#[derive(Debug, Clone, Copy)]
pub struct Lgssm {
    pub a: f64,
    pub q: f64,
    pub r: f64,
}

pub struct LgssmGraph {
    pub graph: Arc<Graph>,
    pub xs: Vec<NodeId>,
    pub ys: Vec<NodeId>,
}

impl Lgssm {
    pub fn graph(&self, steps: usize, data: Option<&[f64]>) -> LgssmGraph {
        let mut b = GraphBuilder::new();
        let zero = b.constant(NodeValue::scalar(0.0));
        let one = b.constant(NodeValue::scalar(1.0));
        let a = b.constant(NodeValue::scalar(self.a));
        let q = b.constant(NodeValue::scalar(self.q));
        let r = b.constant(NodeValue::scalar(self.r));
        let mut xs = Vec::with_capacity(steps);
        let mut ys = Vec::with_capacity(steps);
        let mut prev: Option<NodeId> = None;
        for t in 0..steps {
            let x = match prev {
                None => b.stochastic("dnorm", &[zero, one], None).unwrap(),
                Some(p) => {
                    let mean = b.logical("mul", &[a, p]).unwrap();
                    b.stochastic("dnorm", &[mean, q], None).unwrap()
                }
            };
            let observed = data.map(|d| NodeValue::scalar(d[t]));
            let y = b.stochastic("dnorm", &[x, r], observed).unwrap();
            xs.push(x);
            ys.push(y);
            prev = Some(x);
        }
        LgssmGraph {
            graph: Arc::new(b.finish().unwrap()),
            xs,
            ys,
        }
    }

    /// Draws observations from the prior predictive.
    pub fn simulate(&self, steps: usize, seed: u64) -> Vec<f64> {
        let model = self.graph(steps, None);
        let mut rng = StdRng::seed_from_u64(seed);
        let values = model.graph.sample_values(&mut rng).unwrap();
        model
            .ys
            .iter()
            .map(|y| values[y.index()].values()[0])
            .collect()
    }

    pub fn kalman(&self, data: &[f64]) -> Kalman {
        let mut means = Vec::with_capacity(data.len());
        let mut variances = Vec::with_capacity(data.len());
        let mut log_likelihood = 0.0;
        let (mut m, mut p) = (0.0, 1.0);
        for (t, y) in data.iter().enumerate() {
            if t > 0 {
                m *= self.a;
                p = self.a * self.a * p + 1.0 / self.q;
            }
            let s = p + 1.0 / self.r;
            log_likelihood += -0.5 * ((2.0 * std::f64::consts::PI * s).ln() + (y - m).powi(2) / s);
            let k = p / s;
            m += k * (y - m);
            p *= 1.0 - k;
            means.push(m);
            variances.push(p);
        }
        Kalman {
            means,
            variances,
            log_likelihood,
        }
    }

    /// Rauch-Tung-Striebel smoothed means.
    pub fn rts(&self, filter: &Kalman) -> Vec<f64> {
        let n = filter.means.len();
        let mut smoothed = filter.means.clone();
        for t in (0..n.saturating_sub(1)).rev() {
            let predicted_mean = self.a * filter.means[t];
            let predicted_var = self.a * self.a * filter.variances[t] + 1.0 / self.q;
            let gain = filter.variances[t] * self.a / predicted_var;
            smoothed[t] = filter.means[t] + gain * (smoothed[t + 1] - predicted_mean);
        }
        smoothed
    }
}

pub struct Kalman {
    pub means: Vec<f64>,
    pub variances: Vec<f64>,
    pub log_likelihood: f64,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
