//! Weight normalization and effective sample size.

use crate::engine::errors::SmcError;
use crate::engine::numeric::CompensatedSum;

/// Population summary computed at a step barrier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightSummary {
    /// `sum(exp(log_w))` after rescaling.
    pub sum: f64,
    pub sum_squares: f64,
    pub ess: f64,
}

/// Subtracts the maximum from every log weight and returns it.
///
/// A non-finite maximum leaves the weights untouched and yields a shift of 0.
pub fn rescale_log_weights(log_weights: &mut [f64]) -> f64 {
    let max = log_weights
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return 0.0;
    }
    for lw in log_weights.iter_mut() {
        *lw -= max;
    }
    max
}

/// Sums and ESS of `exp(log_w)` in compensated precision.
pub fn summarize_log_weights(log_weights: &[f64]) -> Result<WeightSummary, SmcError> {
    summarize(log_weights.iter().map(|lw| lw.exp()))
}

/// Sums and ESS of linear weights.
pub fn summarize(weights: impl Iterator<Item = f64>) -> Result<WeightSummary, SmcError> {
    let mut sum = CompensatedSum::new();
    let mut sum_squares = CompensatedSum::new();
    for w in weights {
        sum.add(w);
        sum_squares.add(w * w);
    }
    let (sum, sum_squares) = (sum.total(), sum_squares.total());
    if sum == 0.0 {
        return Err(SmcError::numerical("sum of weights", "every particle has zero weight"));
    }
    if sum_squares == 0.0 {
        return Err(SmcError::numerical(
            "sum of squared weights",
            "squared weights underflow to zero",
        ));
    }
    let ess = (-sum_squares.ln() + 2.0 * sum.ln()).exp();
    if ess.is_nan() {
        return Err(SmcError::numerical(
            "ESS",
            format!("sum {} and sum of squares {}", sum, sum_squares),
        ));
    }
    Ok(WeightSummary {
        sum,
        sum_squares,
        ess,
    })
}
