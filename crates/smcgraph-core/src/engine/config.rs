//! Run configuration for the forward sampler.

use crate::engine::errors::SmcError;
pub use crate::engine::resampler::ResamplerKind;

/// Settings fixed when a forward pass is initialized.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SmcConfig {
    /// Population size N.
    pub n_particles: usize,
    /// Seed of the master random number generator.
    pub seed: u64,
    pub resampler: ResamplerKind,
    /// Resample when ESS drops below this. Values up to 1 are a fraction of N.
    pub ess_threshold: f64,
    /// Keep the filter monitor of every step (needed for backward smoothing).
    pub retain_filter_monitors: bool,
}

impl Default for SmcConfig {
    fn default() -> Self {
        Self {
            n_particles: 1000,
            seed: 0,
            resampler: ResamplerKind::Systematic,
            ess_threshold: 0.5,
            retain_filter_monitors: false,
        }
    }
}

impl SmcConfig {
    pub fn new(n_particles: usize, seed: u64) -> Self {
        Self {
            n_particles,
            seed,
            ..Self::default()
        }
    }

    pub fn with_resampler(mut self, resampler: ResamplerKind) -> Self {
        self.resampler = resampler;
        self
    }

    pub fn with_ess_threshold(mut self, ess_threshold: f64) -> Self {
        self.ess_threshold = ess_threshold;
        self
    }

    pub fn retaining_filter_monitors(mut self) -> Self {
        self.retain_filter_monitors = true;
        self
    }

    pub(crate) fn validate(self) -> Result<Self, SmcError> {
        if self.n_particles == 0 {
            return Err(SmcError::Validation(
                "initialize: n_particles must be > 0".into(),
            ));
        }
        if !self.ess_threshold.is_finite() || self.ess_threshold < 0.0 {
            return Err(SmcError::Validation(
                "initialize: ess_threshold must be finite and >= 0".into(),
            ));
        }
        if self.ess_threshold > 1.0 && self.ess_threshold > self.n_particles as f64 {
            return Err(SmcError::Validation(format!(
                "initialize: ess_threshold {} exceeds n_particles {}",
                self.ess_threshold, self.n_particles
            )));
        }
        Ok(self)
    }

    /// Threshold in particles.
    pub fn ess_threshold_particles(&self) -> f64 {
        if self.ess_threshold <= 1.0 {
            self.ess_threshold * self.n_particles as f64
        } else {
            self.ess_threshold
        }
    }
}
