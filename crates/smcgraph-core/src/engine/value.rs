//! Flat numeric node values with a shape descriptor.

use smallvec::{smallvec, SmallVec};

use crate::engine::errors::SmcError;

/// Inline storage for shape descriptors; most nodes are scalars or vectors.
pub type Dims = SmallVec<[usize; 2]>;

/// A realized value of one node: a flat buffer plus its dimensions.
///
/// Values are immutable once written into a particle or the graph; replicas
/// made during resampling share the same buffer behind an `Arc`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeValue {
    values: Vec<f64>,
    dims: Dims,
}

impl NodeValue {
    pub fn scalar(value: f64) -> Self {
        Self {
            values: vec![value],
            dims: smallvec![1],
        }
    }

    pub fn vector(values: Vec<f64>) -> Self {
        let len = values.len();
        Self {
            values,
            dims: smallvec![len],
        }
    }

    /// Builds a value from a flat buffer and explicit dimensions.
    pub fn with_dims(values: Vec<f64>, dims: &[usize]) -> Result<Self, SmcError> {
        let expected: usize = dims.iter().product();
        if dims.is_empty() || expected != values.len() {
            return Err(SmcError::Validation(format!(
                "value of length {} does not match dims {:?}",
                values.len(),
                dims
            )));
        }
        Ok(Self {
            values,
            dims: SmallVec::from_slice(dims),
        })
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_scalar(&self) -> bool {
        self.values.len() == 1
    }

    pub fn component(&self, index: usize) -> Option<f64> {
        self.values.get(index).copied()
    }

    /// Returns the value if this is a scalar, otherwise a logic error naming `what`.
    pub fn as_scalar(&self, what: &str) -> Result<f64, SmcError> {
        if self.is_scalar() {
            Ok(self.values[0])
        } else {
            Err(SmcError::Logic(format!(
                "{} expects a scalar, got dims {:?}",
                what, self.dims
            )))
        }
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}
