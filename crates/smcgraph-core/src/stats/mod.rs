//! Weighted statistics sinks fed by monitors.
//!
//! A monitor pushes one `(value, weight)` pair per particle; weights are the
//! unnormalized particle weights of the step, so every sink normalizes by
//! the total weight it has seen.
//!
//! Notes:
//! - Numeric stability: weighted incremental mean and variance (West's
//!   algorithm) with a compensated weight total.
//! - Zero-weight pairs are counted but do not move any estimate.

use std::collections::BTreeMap;

use crate::engine::errors::SmcError;
use crate::engine::numeric::CompensatedSum;

/// Receiver of weighted samples.
pub trait WeightedSink {
    fn push(&mut self, value: f64, weight: f64) -> Result<(), SmcError>;
}

fn check_pair(value: f64, weight: f64) -> Result<(), SmcError> {
    if !(weight.is_finite() && weight >= 0.0) {
        return Err(SmcError::numerical(
            "sample weight",
            format!("weight {} is not finite and non-negative", weight),
        ));
    }
    if value.is_nan() {
        return Err(SmcError::numerical("sample value", "value is NaN"));
    }
    Ok(())
}

/// Weighted mean and variance of a scalar quantity.
#[derive(Debug, Clone, Default)]
pub struct ScalarAccumulator {
    total_weight: CompensatedSum,
    weight_seen: f64,
    mean: f64,
    m2: f64,
    count: usize,
}

impl ScalarAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn sum_of_weights(&self) -> f64 {
        self.total_weight.total()
    }

    /// `None` until a sample with positive weight has been seen.
    pub fn mean(&self) -> Option<f64> {
        (self.weight_seen > 0.0).then_some(self.mean)
    }

    /// Weighted population variance.
    pub fn variance(&self) -> Option<f64> {
        (self.weight_seen > 0.0).then(|| self.m2 / self.weight_seen)
    }

    pub fn std_dev(&self) -> Option<f64> {
        self.variance().map(f64::sqrt)
    }
}

impl WeightedSink for ScalarAccumulator {
    fn push(&mut self, value: f64, weight: f64) -> Result<(), SmcError> {
        check_pair(value, weight)?;
        self.count += 1;
        if weight == 0.0 {
            return Ok(());
        }
        self.total_weight.add(weight);
        self.weight_seen += weight;
        let delta = value - self.mean;
        self.mean += (weight / self.weight_seen) * delta;
        self.m2 += weight * delta * (value - self.mean);
        Ok(())
    }
}

/// Weighted probability table over integer values.
#[derive(Debug, Clone, Default)]
pub struct DiscreteAccumulator {
    table: BTreeMap<i64, CompensatedSum>,
    total: CompensatedSum,
}

impl DiscreteAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probability(&self, value: i64) -> f64 {
        let total = self.total.total();
        if total <= 0.0 {
            return 0.0;
        }
        self.table.get(&value).map_or(0.0, |w| w.total() / total)
    }

    /// `(value, probability)` in increasing value order.
    pub fn table(&self) -> Vec<(i64, f64)> {
        let total = self.total.total();
        self.table
            .iter()
            .map(|(k, w)| (*k, if total > 0.0 { w.total() / total } else { 0.0 }))
            .collect()
    }

    /// Value with the highest probability, smallest first on ties.
    pub fn mode(&self) -> Option<i64> {
        self.table
            .iter()
            .fold(None, |best: Option<(i64, f64)>, (k, w)| match best {
                Some((_, bw)) if bw >= w.total() => best,
                _ => Some((*k, w.total())),
            })
            .map(|(k, _)| k)
    }
}

impl WeightedSink for DiscreteAccumulator {
    fn push(&mut self, value: f64, weight: f64) -> Result<(), SmcError> {
        check_pair(value, weight)?;
        if value.fract() != 0.0 || !value.is_finite() {
            return Err(SmcError::Validation(format!(
                "discrete accumulator received non-integer value {}",
                value
            )));
        }
        self.table.entry(value as i64).or_default().add(weight);
        self.total.add(weight);
        Ok(())
    }
}
