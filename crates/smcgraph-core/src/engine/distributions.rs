//! Distribution and deterministic-function capability surface.
//!
//! Stochastic nodes reference a [`DistributionFn`], logical nodes a
//! [`DeterministicFn`]. Both are pure: they take parameter values and never
//! hold state. A [`FunctionRegistry`] maps the usual model-language names
//! (`dnorm`, `add`, ...) to built-in implementations and accepts custom ones.

use std::fmt;
use std::sync::Arc;

use rand::distributions::{Distribution, WeightedIndex};
use rand::{Rng, RngCore};
use rand_distr::{Bernoulli as BernoulliDist, Exp1, StandardNormal, Uniform as UniformDist};
use rustc_hash::FxHashMap;

use crate::engine::errors::SmcError;
use crate::engine::numeric::{log_std_normal_interval, normal_log_density};
use crate::engine::value::NodeValue;

/// Upper limit on rejection draws for truncated sampling.
const MAX_REJECTION_TRIES: usize = 100_000;

/// Width above which an interval holding zero is sampled by plain rejection.
const WIDE_INTERVAL: f64 = 2.5;

/// Families recognized by the conjugate strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionFamily {
    Normal,
    Uniform,
    Bernoulli,
    Categorical,
    Other,
}

/// Optional truncation bounds of a stochastic node.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bounds<'a> {
    pub lower: Option<&'a NodeValue>,
    pub upper: Option<&'a NodeValue>,
}

impl<'a> Bounds<'a> {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_bounded(&self) -> bool {
        self.lower.is_some() || self.upper.is_some()
    }

    fn scalar_limits(&self) -> Result<(f64, f64), SmcError> {
        let lower = match self.lower {
            Some(v) => v.as_scalar("lower bound")?,
            None => f64::NEG_INFINITY,
        };
        let upper = match self.upper {
            Some(v) => v.as_scalar("upper bound")?,
            None => f64::INFINITY,
        };
        if lower > upper {
            return Err(SmcError::Logic(format!(
                "lower bound {} exceeds upper bound {}",
                lower, upper
            )));
        }
        Ok((lower, upper))
    }
}

/// A probability distribution usable by stochastic nodes.
pub trait DistributionFn: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Number of parameter parents (bounds excluded).
    fn n_params(&self) -> usize;

    fn family(&self) -> DistributionFamily {
        DistributionFamily::Other
    }

    fn is_discrete(&self) -> bool;

    /// Whether lower/upper truncation bounds are supported.
    fn can_bound(&self) -> bool {
        false
    }

    fn check_params(&self, params: &[&NodeValue]) -> bool;

    fn sample(
        &self,
        params: &[&NodeValue],
        bounds: Bounds<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<NodeValue, SmcError>;

    /// Normalized log density (log mass for discrete distributions).
    fn log_density(
        &self,
        x: &NodeValue,
        params: &[&NodeValue],
        bounds: Bounds<'_>,
    ) -> Result<f64, SmcError>;

    /// Whether the support is finite for every valid parameter value.
    fn has_finite_support(&self) -> bool {
        false
    }

    /// Enumerates the support when it is finite for these parameters.
    fn finite_support(&self, _params: &[&NodeValue]) -> Option<Vec<f64>> {
        None
    }
}

/// A deterministic function usable by logical nodes.
///
/// The capability checks take one flag per argument: `linear[i]` means the
/// argument is an affine function of the node being sampled, `known[i]` means
/// it does not depend on it at all. Each check answers whether the output
/// keeps that property.
pub trait DeterministicFn: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn n_args(&self) -> usize;

    fn eval(&self, args: &[&NodeValue]) -> Result<NodeValue, SmcError>;

    fn is_linear(&self, _linear: &[bool], _known: &[bool]) -> bool {
        false
    }

    /// Output is `c * x` for the sampled node `x` (no offset).
    fn is_scale(&self, _scale: &[bool], _known: &[bool]) -> bool {
        false
    }
}

fn scalar_param(params: &[&NodeValue], index: usize) -> Option<f64> {
    params
        .get(index)
        .filter(|v| v.is_scalar())
        .map(|v| v.values()[0])
}

fn params_error(dist: &dyn DistributionFn) -> SmcError {
    SmcError::Logic(format!("invalid parameters for {}", dist.name()))
}

/// `dnorm(mean, precision)`, optionally truncated.
#[derive(Debug, Default, Clone, Copy)]
pub struct Normal;

impl Normal {
    fn mean_precision(&self, params: &[&NodeValue]) -> Result<(f64, f64), SmcError> {
        if !self.check_params(params) {
            return Err(params_error(self));
        }
        Ok((params[0].values()[0], params[1].values()[0]))
    }
}

impl DistributionFn for Normal {
    fn name(&self) -> &'static str {
        "dnorm"
    }

    fn n_params(&self) -> usize {
        2
    }

    fn family(&self) -> DistributionFamily {
        DistributionFamily::Normal
    }

    fn is_discrete(&self) -> bool {
        false
    }

    fn can_bound(&self) -> bool {
        true
    }

    fn check_params(&self, params: &[&NodeValue]) -> bool {
        match (scalar_param(params, 0), scalar_param(params, 1)) {
            (Some(mean), Some(precision)) => {
                mean.is_finite() && precision.is_finite() && precision > 0.0
            }
            _ => false,
        }
    }

    fn sample(
        &self,
        params: &[&NodeValue],
        bounds: Bounds<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<NodeValue, SmcError> {
        let (mean, precision) = self.mean_precision(params)?;
        let sd = precision.sqrt().recip();
        if !bounds.is_bounded() {
            let z: f64 = rng.sample(StandardNormal);
            return Ok(NodeValue::scalar(mean + sd * z));
        }
        let (lower, upper) = bounds.scalar_limits()?;
        let (a, b) = ((lower - mean) / sd, (upper - mean) / sd);
        if let Some(z) = sample_std_normal_interval(a, b, rng) {
            return Ok(NodeValue::scalar((mean + sd * z).clamp(lower, upper)));
        }
        Err(SmcError::numerical(
            "truncated mass",
            format!(
                "dnorm({}, {}) accepted none of {} draws in [{}, {}]",
                mean, precision, MAX_REJECTION_TRIES, lower, upper
            ),
        ))
    }

    fn log_density(
        &self,
        x: &NodeValue,
        params: &[&NodeValue],
        bounds: Bounds<'_>,
    ) -> Result<f64, SmcError> {
        let (mean, precision) = self.mean_precision(params)?;
        let x = x.as_scalar("dnorm")?;
        let log_density = normal_log_density(x, mean, precision);
        if !bounds.is_bounded() {
            return Ok(log_density);
        }
        let (lower, upper) = bounds.scalar_limits()?;
        if x < lower || x > upper {
            return Ok(f64::NEG_INFINITY);
        }
        let sd = precision.sqrt().recip();
        let log_mass = log_std_normal_interval((lower - mean) / sd, (upper - mean) / sd);
        if !log_mass.is_finite() {
            return Err(SmcError::numerical(
                "truncated mass",
                format!("dnorm({}, {}) has no mass in [{}, {}]", mean, precision, lower, upper),
            ));
        }
        Ok(log_density - log_mass)
    }
}

/// Draws `Z ~ N(0, 1)` conditioned on `a <= Z <= b`.
///
/// Proposals follow Robert (1995): plain normal draws when the interval holds
/// the bulk of the mass, uniform draws on narrow intervals and a translated
/// exponential in the tail. Every branch accepts with probability bounded
/// away from zero, so `None` only comes back for an empty interval.
fn sample_std_normal_interval(a: f64, b: f64, rng: &mut dyn RngCore) -> Option<f64> {
    if a.is_nan() || b.is_nan() || a > b {
        return None;
    }
    if a + b < 0.0 {
        return sample_std_normal_interval(-b, -a, rng).map(|z| -z);
    }
    if a == b {
        return Some(a);
    }
    for _ in 0..MAX_REJECTION_TRIES {
        let accepted = if a < 0.0 {
            if b - a >= WIDE_INTERVAL {
                let z: f64 = rng.sample(StandardNormal);
                (a..=b).contains(&z).then_some(z)
            } else {
                let z = rng.sample(UniformDist::new_inclusive(a, b));
                (rng.gen::<f64>() <= (-0.5 * z * z).exp()).then_some(z)
            }
        } else if b - a <= a.max(1.0).recip() {
            let z = rng.sample(UniformDist::new_inclusive(a, b));
            (rng.gen::<f64>() <= (0.5 * (a * a - z * z)).exp()).then_some(z)
        } else {
            let rate = 0.5 * (a + (a * a + 4.0).sqrt());
            let e: f64 = rng.sample(Exp1);
            let z = a + e / rate;
            let d = z - rate;
            (z <= b && rng.gen::<f64>() <= (-0.5 * d * d).exp()).then_some(z)
        };
        if accepted.is_some() {
            return accepted;
        }
    }
    None
}

/// `dunif(lower, upper)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Uniform;

impl DistributionFn for Uniform {
    fn name(&self) -> &'static str {
        "dunif"
    }

    fn n_params(&self) -> usize {
        2
    }

    fn family(&self) -> DistributionFamily {
        DistributionFamily::Uniform
    }

    fn is_discrete(&self) -> bool {
        false
    }

    fn check_params(&self, params: &[&NodeValue]) -> bool {
        match (scalar_param(params, 0), scalar_param(params, 1)) {
            (Some(lo), Some(hi)) => lo < hi && (hi - lo).is_finite(),
            _ => false,
        }
    }

    fn sample(
        &self,
        params: &[&NodeValue],
        _bounds: Bounds<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<NodeValue, SmcError> {
        if !self.check_params(params) {
            return Err(params_error(self));
        }
        let (lo, hi) = (params[0].values()[0], params[1].values()[0]);
        Ok(NodeValue::scalar(rng.sample(UniformDist::new(lo, hi))))
    }

    fn log_density(
        &self,
        x: &NodeValue,
        params: &[&NodeValue],
        _bounds: Bounds<'_>,
    ) -> Result<f64, SmcError> {
        if !self.check_params(params) {
            return Err(params_error(self));
        }
        let (lo, hi) = (params[0].values()[0], params[1].values()[0]);
        let x = x.as_scalar("dunif")?;
        if x < lo || x > hi {
            Ok(f64::NEG_INFINITY)
        } else {
            Ok(-(hi - lo).ln())
        }
    }
}

/// `dbern(p)` over {0, 1}.
#[derive(Debug, Default, Clone, Copy)]
pub struct Bernoulli;

impl DistributionFn for Bernoulli {
    fn name(&self) -> &'static str {
        "dbern"
    }

    fn n_params(&self) -> usize {
        1
    }

    fn family(&self) -> DistributionFamily {
        DistributionFamily::Bernoulli
    }

    fn is_discrete(&self) -> bool {
        true
    }

    fn has_finite_support(&self) -> bool {
        true
    }

    fn check_params(&self, params: &[&NodeValue]) -> bool {
        matches!(scalar_param(params, 0), Some(p) if (0.0..=1.0).contains(&p))
    }

    fn sample(
        &self,
        params: &[&NodeValue],
        _bounds: Bounds<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<NodeValue, SmcError> {
        if !self.check_params(params) {
            return Err(params_error(self));
        }
        let dist = BernoulliDist::new(params[0].values()[0]).map_err(|_| params_error(self))?;
        Ok(NodeValue::scalar(if rng.sample(dist) { 1.0 } else { 0.0 }))
    }

    fn log_density(
        &self,
        x: &NodeValue,
        params: &[&NodeValue],
        _bounds: Bounds<'_>,
    ) -> Result<f64, SmcError> {
        if !self.check_params(params) {
            return Err(params_error(self));
        }
        let p = params[0].values()[0];
        Ok(match x.as_scalar("dbern")? {
            v if v == 1.0 => p.ln(),
            v if v == 0.0 => (1.0 - p).ln(),
            _ => f64::NEG_INFINITY,
        })
    }

    fn finite_support(&self, params: &[&NodeValue]) -> Option<Vec<f64>> {
        self.check_params(params).then(|| vec![0.0, 1.0])
    }
}

/// `dcat(weights)` over {1, ..., K}; weights need not be normalized.
#[derive(Debug, Default, Clone, Copy)]
pub struct Categorical;

impl Categorical {
    fn total(params: &[&NodeValue]) -> f64 {
        params[0].values().iter().sum()
    }
}

impl DistributionFn for Categorical {
    fn name(&self) -> &'static str {
        "dcat"
    }

    fn n_params(&self) -> usize {
        1
    }

    fn family(&self) -> DistributionFamily {
        DistributionFamily::Categorical
    }

    fn is_discrete(&self) -> bool {
        true
    }

    fn has_finite_support(&self) -> bool {
        true
    }

    fn check_params(&self, params: &[&NodeValue]) -> bool {
        match params.first() {
            Some(weights) if !weights.is_empty() => {
                weights.values().iter().all(|w| w.is_finite() && *w >= 0.0)
                    && Self::total(params) > 0.0
            }
            _ => false,
        }
    }

    fn sample(
        &self,
        params: &[&NodeValue],
        _bounds: Bounds<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<NodeValue, SmcError> {
        if !self.check_params(params) {
            return Err(params_error(self));
        }
        let index = WeightedIndex::new(params[0].values()).map_err(|_| params_error(self))?;
        Ok(NodeValue::scalar((index.sample(rng) + 1) as f64))
    }

    fn log_density(
        &self,
        x: &NodeValue,
        params: &[&NodeValue],
        _bounds: Bounds<'_>,
    ) -> Result<f64, SmcError> {
        if !self.check_params(params) {
            return Err(params_error(self));
        }
        let weights = params[0].values();
        let x = x.as_scalar("dcat")?;
        if x.fract() != 0.0 || x < 1.0 || x > weights.len() as f64 {
            return Ok(f64::NEG_INFINITY);
        }
        Ok((weights[x as usize - 1] / Self::total(params)).ln())
    }

    fn finite_support(&self, params: &[&NodeValue]) -> Option<Vec<f64>> {
        self.check_params(params)
            .then(|| (1..=params[0].len()).map(|k| k as f64).collect())
    }
}

fn broadcast(
    name: &str,
    lhs: &NodeValue,
    rhs: &NodeValue,
    op: impl Fn(f64, f64) -> f64,
) -> Result<NodeValue, SmcError> {
    let (a, b) = (lhs.values(), rhs.values());
    let values: Vec<f64> = if a.len() == b.len() {
        a.iter().zip(b).map(|(x, y)| op(*x, *y)).collect()
    } else if b.len() == 1 {
        a.iter().map(|x| op(*x, b[0])).collect()
    } else if a.len() == 1 {
        b.iter().map(|y| op(a[0], *y)).collect()
    } else {
        return Err(SmcError::Logic(format!(
            "{}: incompatible dims {:?} and {:?}",
            name,
            lhs.dims(),
            rhs.dims()
        )));
    };
    let dims = if a.len() >= b.len() { lhs.dims() } else { rhs.dims() };
    NodeValue::with_dims(values, dims)
}

fn two_args<'a>(name: &str, args: &[&'a NodeValue]) -> Result<(&'a NodeValue, &'a NodeValue), SmcError> {
    match args {
        [a, b] => Ok((*a, *b)),
        _ => Err(SmcError::Logic(format!("{} takes 2 arguments", name))),
    }
}

fn one_arg<'a>(name: &str, args: &[&'a NodeValue]) -> Result<&'a NodeValue, SmcError> {
    match args {
        [a] => Ok(*a),
        _ => Err(SmcError::Logic(format!("{} takes 1 argument", name))),
    }
}

fn all_linear_or_known(linear: &[bool], known: &[bool]) -> bool {
    linear.iter().zip(known).all(|(l, k)| *l || *k)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Add;

impl DeterministicFn for Add {
    fn name(&self) -> &'static str {
        "add"
    }

    fn n_args(&self) -> usize {
        2
    }

    fn eval(&self, args: &[&NodeValue]) -> Result<NodeValue, SmcError> {
        let (a, b) = two_args(self.name(), args)?;
        broadcast(self.name(), a, b, |x, y| x + y)
    }

    fn is_linear(&self, linear: &[bool], known: &[bool]) -> bool {
        all_linear_or_known(linear, known)
    }

    fn is_scale(&self, scale: &[bool], _known: &[bool]) -> bool {
        scale.iter().all(|s| *s)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Sub;

impl DeterministicFn for Sub {
    fn name(&self) -> &'static str {
        "sub"
    }

    fn n_args(&self) -> usize {
        2
    }

    fn eval(&self, args: &[&NodeValue]) -> Result<NodeValue, SmcError> {
        let (a, b) = two_args(self.name(), args)?;
        broadcast(self.name(), a, b, |x, y| x - y)
    }

    fn is_linear(&self, linear: &[bool], known: &[bool]) -> bool {
        all_linear_or_known(linear, known)
    }

    fn is_scale(&self, scale: &[bool], _known: &[bool]) -> bool {
        scale.iter().all(|s| *s)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Mul;

impl DeterministicFn for Mul {
    fn name(&self) -> &'static str {
        "mul"
    }

    fn n_args(&self) -> usize {
        2
    }

    fn eval(&self, args: &[&NodeValue]) -> Result<NodeValue, SmcError> {
        let (a, b) = two_args(self.name(), args)?;
        broadcast(self.name(), a, b, |x, y| x * y)
    }

    fn is_linear(&self, linear: &[bool], known: &[bool]) -> bool {
        // Product of an affine term with known factors only.
        let dependent = known.iter().filter(|k| !**k).count();
        dependent <= 1 && all_linear_or_known(linear, known)
    }

    fn is_scale(&self, scale: &[bool], known: &[bool]) -> bool {
        let dependent = known.iter().filter(|k| !**k).count();
        dependent == 1 && scale.iter().zip(known).all(|(s, k)| *s || *k)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Neg;

impl DeterministicFn for Neg {
    fn name(&self) -> &'static str {
        "neg"
    }

    fn n_args(&self) -> usize {
        1
    }

    fn eval(&self, args: &[&NodeValue]) -> Result<NodeValue, SmcError> {
        let a = one_arg(self.name(), args)?;
        NodeValue::with_dims(a.values().iter().map(|v| -v).collect(), a.dims())
    }

    fn is_linear(&self, linear: &[bool], known: &[bool]) -> bool {
        all_linear_or_known(linear, known)
    }

    fn is_scale(&self, scale: &[bool], _known: &[bool]) -> bool {
        scale.iter().all(|s| *s)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Identity;

impl DeterministicFn for Identity {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn n_args(&self) -> usize {
        1
    }

    fn eval(&self, args: &[&NodeValue]) -> Result<NodeValue, SmcError> {
        Ok(one_arg(self.name(), args)?.clone())
    }

    fn is_linear(&self, linear: &[bool], known: &[bool]) -> bool {
        all_linear_or_known(linear, known)
    }

    fn is_scale(&self, scale: &[bool], _known: &[bool]) -> bool {
        scale.iter().all(|s| *s)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Exp;

impl DeterministicFn for Exp {
    fn name(&self) -> &'static str {
        "exp"
    }

    fn n_args(&self) -> usize {
        1
    }

    fn eval(&self, args: &[&NodeValue]) -> Result<NodeValue, SmcError> {
        let a = one_arg(self.name(), args)?;
        NodeValue::with_dims(a.values().iter().map(|v| v.exp()).collect(), a.dims())
    }
}

/// Named registry of distributions and deterministic functions.
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    distributions: FxHashMap<String, Arc<dyn DistributionFn>>,
    functions: FxHashMap<String, Arc<dyn DeterministicFn>>,
}

impl FunctionRegistry {
    pub fn with_builtins() -> Self {
        let mut r = FunctionRegistry::default();
        r.register_distribution(Arc::new(Normal));
        r.register_distribution(Arc::new(Uniform));
        r.register_distribution(Arc::new(Bernoulli));
        r.register_distribution(Arc::new(Categorical));
        r.register_function(Arc::new(Add));
        r.register_function(Arc::new(Sub));
        r.register_function(Arc::new(Mul));
        r.register_function(Arc::new(Neg));
        r.register_function(Arc::new(Identity));
        r.register_function(Arc::new(Exp));
        r
    }

    pub fn register_distribution(&mut self, dist: Arc<dyn DistributionFn>) {
        self.distributions.insert(dist.name().to_string(), dist);
    }

    pub fn register_function(&mut self, func: Arc<dyn DeterministicFn>) {
        self.functions.insert(func.name().to_string(), func);
    }

    pub fn distribution(&self, name: &str) -> Result<Arc<dyn DistributionFn>, SmcError> {
        self.distributions
            .get(name)
            .cloned()
            .ok_or_else(|| SmcError::Validation(format!("unknown distribution '{}'", name)))
    }

    pub fn function(&self, name: &str) -> Result<Arc<dyn DeterministicFn>, SmcError> {
        self.functions
            .get(name)
            .cloned()
            .ok_or_else(|| SmcError::Validation(format!("unknown function '{}'", name)))
    }

    /// Registered distribution names, sorted.
    pub fn distribution_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.distributions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut functions: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        functions.sort_unstable();
        f.debug_struct("FunctionRegistry")
            .field("distributions", &self.distribution_names())
            .field("functions", &functions)
            .finish()
    }
}
