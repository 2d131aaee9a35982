//! Multiplier reconstruction support
//!
//! Reconstructing stage multipliers is only needed with an exact Hessian,
//! which the block-condensing exporter does not support. What remains is
//! the bound-dual lookup that reconstruction is built on, and the check that
//! refuses the exact-Hessian mode up front.

use rti_common::{BoxBound, ExportError, GeneratorOptions};
use serde::Serialize;

/// Sorted, duplicate-free flat indices of active bounds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BoundIndexSet {
    indices: Vec<usize>,
}

impl BoundIndexSet {
    pub fn new(indices: impl IntoIterator<Item = usize>) -> Self {
        let mut indices: Vec<usize> = indices.into_iter().collect();
        indices.sort_unstable();
        indices.dedup();
        Self { indices }
    }

    /// Flat indices `stage * dim + component` of every active bound over `stages`
    pub fn from_bounds(bounds: &[BoxBound], dim: usize, stages: usize, upper: bool) -> Self {
        Self::new(
            bounds
                .iter()
                .filter(|b| {
                    let limit = if upper { b.upper } else { b.lower };
                    limit.is_some_and(f64::is_finite)
                })
                .flat_map(|b| (0..stages).map(move |stage| stage * dim + b.component)),
        )
    }

    /// Position of `index` in the set; exact match only
    pub fn position(&self, index: usize) -> Option<usize> {
        self.indices.binary_search(&index).ok()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.position(index).is_some()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.indices
    }

    /// Indices in `range`, shifted to be relative to its start
    pub fn slice(&self, range: std::ops::Range<usize>) -> Vec<usize> {
        self.indices
            .iter()
            .filter(|i| range.contains(*i))
            .map(|i| i - range.start)
            .collect()
    }
}

/// Dual of a bounded component: found at `num_qp_vars + position`, zero when
/// the index carries no bound or the dual vector is too short
pub fn bound_multiplier(set: &BoundIndexSet, index: usize, duals: &[f64], num_qp_vars: usize) -> f64 {
    set.position(index)
        .and_then(|position| duals.get(num_qp_vars + position).copied())
        .unwrap_or(0.0)
}

/// Refuse multiplier reconstruction; selecting it is an error, never a fallback
pub fn check_multiplier_support(options: &GeneratorOptions) -> Result<(), ExportError> {
    if options.exact_hessian() {
        return Err(ExportError::not_implemented(format!(
            "multiplier reconstruction for HESSIAN_APPROXIMATION = {}",
            options.hessian_approximation
        )));
    }
    Ok(())
}
