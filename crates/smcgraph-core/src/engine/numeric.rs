//! Numeric helpers shared by the weight arithmetic and the distributions.

/// Neumaier-compensated running sum.
///
/// Used wherever many exponentiated weights are added; the compensation term
/// keeps the low-order bits that a plain `f64` accumulator loses.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompensatedSum {
    sum: f64,
    compensation: f64,
}

impl CompensatedSum {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(&mut self, value: f64) {
        let t = self.sum + value;
        if self.sum.abs() >= value.abs() {
            self.compensation += (self.sum - t) + value;
        } else {
            self.compensation += (value - t) + self.sum;
        }
        self.sum = t;
    }

    pub fn total(&self) -> f64 {
        self.sum + self.compensation
    }
}

impl FromIterator<f64> for CompensatedSum {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut acc = CompensatedSum::new();
        for v in iter {
            acc.add(v);
        }
        acc
    }
}

/// `ln(sum(exp(x)))` over a slice, stable for large magnitudes.
///
/// Returns `-inf` for an empty slice or when every term is `-inf`.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let m = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !m.is_finite() {
        return m;
    }
    let sum: CompensatedSum = values.iter().map(|v| (v - m).exp()).collect();
    m + sum.total().ln()
}

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

/// Log density of `N(mean, 1/precision)` at `x`.
#[inline]
pub fn normal_log_density(x: f64, mean: f64, precision: f64) -> f64 {
    let d = x - mean;
    0.5 * precision.ln() - LN_SQRT_2PI - 0.5 * precision * d * d
}

/// Above this `z` the upper tail comes from its asymptotic series.
const TAIL_SERIES_FROM: f64 = 30.0;

/// `ln P(Z > z)` for a standard normal `Z`, accurate far into the tail.
pub fn log_std_normal_upper_tail(z: f64) -> f64 {
    if z == f64::INFINITY {
        return f64::NEG_INFINITY;
    }
    if z < TAIL_SERIES_FROM {
        return (0.5 * libm::erfc(z / std::f64::consts::SQRT_2)).ln();
    }
    let r = (z * z).recip();
    -0.5 * z * z - z.ln() - LN_SQRT_2PI + (1.0 - r + 3.0 * r * r - 15.0 * r * r * r).ln()
}

/// `ln P(a < Z < b)` for a standard normal `Z`.
///
/// Both ends are taken as upper tails of the side further from zero, so
/// intervals deep in either tail keep their relative precision.
pub fn log_std_normal_interval(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() || a >= b {
        return f64::NEG_INFINITY;
    }
    if a + b < 0.0 {
        return log_std_normal_interval(-b, -a);
    }
    let from = log_std_normal_upper_tail(a);
    let beyond = log_std_normal_upper_tail(b);
    from + (-(beyond - from).exp()).ln_1p()
}
