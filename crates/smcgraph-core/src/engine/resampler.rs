//! Resampling algorithms.
//!
//! A resampler maps the current (unnormalized) weights to replication
//! counts: a vector of length N summing exactly to N whose i-th entry is, in
//! expectation, `N * w_i / sum(w)`. [`counts_to_sources`] turns the counts
//! into the slot assignment the forward sampler applies to its population.

use std::fmt;
use std::str::FromStr;

use rand::distributions::{Distribution, WeightedIndex};
use rand::{Rng, RngCore};

use crate::engine::errors::SmcError;

/// Computes replication counts from weights.
pub trait Resampler: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// `weights` are non-negative with positive finite total `sum`.
    fn counts(
        &self,
        weights: &[f64],
        sum: f64,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<usize>, SmcError>;
}

/// The built-in resampling algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ResamplerKind {
    Multinomial,
    Residual,
    Stratified,
    #[default]
    Systematic,
}

impl ResamplerKind {
    pub const ALL: [ResamplerKind; 4] = [
        ResamplerKind::Multinomial,
        ResamplerKind::Residual,
        ResamplerKind::Stratified,
        ResamplerKind::Systematic,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ResamplerKind::Multinomial => "multinomial",
            ResamplerKind::Residual => "residual",
            ResamplerKind::Stratified => "stratified",
            ResamplerKind::Systematic => "systematic",
        }
    }

    pub fn build(self) -> Box<dyn Resampler> {
        match self {
            ResamplerKind::Multinomial => Box::new(Multinomial),
            ResamplerKind::Residual => Box::new(Residual),
            ResamplerKind::Stratified => Box::new(Stratified),
            ResamplerKind::Systematic => Box::new(Systematic),
        }
    }
}

impl fmt::Display for ResamplerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ResamplerKind {
    type Err = SmcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResamplerKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| {
                SmcError::Validation(format!(
                    "unknown resampler '{}', expected one of multinomial, residual, stratified, systematic",
                    s
                ))
            })
    }
}

fn check_weights(weights: &[f64], sum: f64) -> Result<(), SmcError> {
    if weights.is_empty() {
        return Err(SmcError::Logic("cannot resample an empty population".into()));
    }
    if !(sum.is_finite() && sum > 0.0) {
        return Err(SmcError::numerical(
            "sum of weights",
            format!("resampling requires a positive finite sum, got {}", sum),
        ));
    }
    if let Some(w) = weights.iter().find(|w| !(w.is_finite() && **w >= 0.0)) {
        return Err(SmcError::numerical(
            "weight",
            format!("resampling requires non-negative finite weights, got {}", w),
        ));
    }
    Ok(())
}

fn multinomial_draws(
    weights: &[f64],
    draws: usize,
    counts: &mut [usize],
    rng: &mut dyn RngCore,
) -> Result<(), SmcError> {
    let index = WeightedIndex::new(weights).map_err(|e| {
        SmcError::numerical("resampling weights", format!("categorical draw failed: {}", e))
    })?;
    for _ in 0..draws {
        counts[index.sample(rng)] += 1;
    }
    Ok(())
}

/// Counts how many of the increasing `positions` in `[0, sum)` fall in each
/// particle's cumulative-weight interval.
fn counts_from_positions(
    weights: &[f64],
    positions: impl Iterator<Item = f64>,
) -> Vec<usize> {
    let n = weights.len();
    let mut counts = vec![0usize; n];
    // Last particle with positive weight absorbs positions pushed past the
    // final boundary by rounding.
    let last = weights.iter().rposition(|w| *w > 0.0).unwrap_or(n - 1);
    let mut i = 0;
    let mut upper = weights[0];
    for position in positions {
        while position >= upper && i < last {
            i += 1;
            upper += weights[i];
        }
        counts[i] += 1;
    }
    counts
}

/// N independent categorical draws.
#[derive(Debug, Default, Clone, Copy)]
pub struct Multinomial;

impl Resampler for Multinomial {
    fn name(&self) -> &'static str {
        "multinomial"
    }

    fn counts(
        &self,
        weights: &[f64],
        sum: f64,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<usize>, SmcError> {
        check_weights(weights, sum)?;
        let mut counts = vec![0; weights.len()];
        multinomial_draws(weights, weights.len(), &mut counts, rng)?;
        Ok(counts)
    }
}

/// Deterministic integer parts, then multinomial draws over the remainders.
#[derive(Debug, Default, Clone, Copy)]
pub struct Residual;

impl Resampler for Residual {
    fn name(&self) -> &'static str {
        "residual"
    }

    fn counts(
        &self,
        weights: &[f64],
        sum: f64,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<usize>, SmcError> {
        check_weights(weights, sum)?;
        let n = weights.len();
        let mut counts = Vec::with_capacity(n);
        let mut remainders = Vec::with_capacity(n);
        for w in weights {
            let expected = n as f64 * w / sum;
            let whole = expected.floor();
            counts.push(whole as usize);
            remainders.push(expected - whole);
        }
        let assigned: usize = counts.iter().sum();
        if assigned > n {
            return Err(SmcError::numerical(
                "residual counts",
                format!("integer parts sum to {} for {} particles", assigned, n),
            ));
        }
        let remaining = n - assigned;
        if remaining > 0 {
            if remainders.iter().all(|r| *r <= 0.0) {
                multinomial_draws(weights, remaining, &mut counts, rng)?;
            } else {
                multinomial_draws(&remainders, remaining, &mut counts, rng)?;
            }
        }
        Ok(counts)
    }
}

/// One independent uniform offset per stratum of width `sum / N`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stratified;

impl Resampler for Stratified {
    fn name(&self) -> &'static str {
        "stratified"
    }

    fn counts(
        &self,
        weights: &[f64],
        sum: f64,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<usize>, SmcError> {
        check_weights(weights, sum)?;
        let n = weights.len();
        let width = sum / n as f64;
        let offsets: Vec<f64> = (0..n).map(|_| rng.gen::<f64>()).collect();
        Ok(counts_from_positions(
            weights,
            offsets
                .into_iter()
                .enumerate()
                .map(|(k, u)| (k as f64 + u) * width),
        ))
    }
}

/// One uniform offset shared by every stratum.
#[derive(Debug, Default, Clone, Copy)]
pub struct Systematic;

impl Resampler for Systematic {
    fn name(&self) -> &'static str {
        "systematic"
    }

    fn counts(
        &self,
        weights: &[f64],
        sum: f64,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<usize>, SmcError> {
        systematic_counts_with_offset(weights, sum, rng.gen())
    }
}

/// Systematic resampling with a fixed offset `u` in `[0, 1)`, measured as a
/// fraction of the stratum width. Stratum k samples position
/// `(k + u) * sum / N`.
pub fn systematic_counts_with_offset(
    weights: &[f64],
    sum: f64,
    u: f64,
) -> Result<Vec<usize>, SmcError> {
    check_weights(weights, sum)?;
    if !(0.0..1.0).contains(&u) {
        return Err(SmcError::Logic(format!(
            "systematic offset {} is outside [0, 1)",
            u
        )));
    }
    let n = weights.len();
    let width = sum / n as f64;
    Ok(counts_from_positions(
        weights,
        (0..n).map(|k| (k as f64 + u) * width),
    ))
}

/// Maps replication counts to the source particle of every slot.
///
/// Slots with a positive count keep their own particle. Each extra copy of
/// a particle is written into a slot whose count is zero, so no particle
/// that is read is ever overwritten.
pub fn counts_to_sources(counts: &[usize]) -> Result<Vec<usize>, SmcError> {
    let n = counts.len();
    let total: usize = counts.iter().sum();
    if total != n {
        return Err(SmcError::Logic(format!(
            "replication counts sum to {} for {} particles",
            total, n
        )));
    }
    let mut sources: Vec<usize> = (0..n).collect();
    let mut empty = counts
        .iter()
        .enumerate()
        .filter(|(_, c)| **c == 0)
        .map(|(i, _)| i);
    for (i, &count) in counts.iter().enumerate() {
        for _ in 1..count.max(1) {
            let slot = empty
                .next()
                .ok_or_else(|| SmcError::Logic("no free slot for a replicated particle".into()))?;
            sources[slot] = i;
        }
    }
    Ok(sources)
}
