//! # smcgraph core
//!
//! Sequential Monte Carlo inference over directed probabilistic graphical
//! models: a particle filter that samples one unobserved stochastic node per
//! step, with conjugate and finite-support samplers replacing prior sampling
//! where they apply, and a backward smoother over the retained filter
//! snapshots.

pub mod engine;
pub mod stats;

// Re-export commonly used types
pub use engine::backward::BackwardSmoother;
pub use engine::config::{ResamplerKind, SmcConfig};
pub use engine::errors::SmcError;
pub use engine::forward::{ForwardSampler, SamplerState, StepDiagnostics};
pub use engine::graph::{Graph, GraphBuilder, NodeId};
pub use engine::monitor::{Monitor, MonitorKind};
pub use engine::node_sampler::SamplerChain;
pub use engine::value::NodeValue;
pub use stats::{DiscreteAccumulator, ScalarAccumulator, WeightedSink};
