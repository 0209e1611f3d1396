//! Resource vectors in canonical base units

use serde::{Deserialize, Serialize};

/// Per-dimension quantities in base units, ordered by the [`super::ResourceSchema`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceVector(Vec<u64>);

impl ResourceVector {
    pub fn zeros(dims: usize) -> Self {
        Self(vec![0; dims])
    }

    pub fn from_vec(values: Vec<u64>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }

    pub fn dims(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, dim: usize) -> u64 {
        self.0.get(dim).copied().unwrap_or(0)
    }

    pub(crate) fn set(&mut self, dim: usize, value: u64) {
        if let Some(slot) = self.0.get_mut(dim) {
            *slot = value;
        }
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|v| *v == 0)
    }

    /// True when every dimension of `self` is at least `other`'s
    pub fn covers(&self, other: &ResourceVector) -> bool {
        self.first_shortfall(other).is_none()
    }

    /// First dimension in which `self` cannot satisfy `requested`
    pub fn first_shortfall(&self, requested: &ResourceVector) -> Option<usize> {
        (0..requested.dims()).find(|&d| self.get(d) < requested.get(d))
    }

    pub fn checked_sub(&self, other: &ResourceVector) -> Option<ResourceVector> {
        if self.dims() != other.dims() {
            return None;
        }
        self.0
            .iter()
            .zip(&other.0)
            .map(|(a, b)| a.checked_sub(*b))
            .collect::<Option<Vec<_>>>()
            .map(ResourceVector)
    }

    pub fn checked_add(&self, other: &ResourceVector) -> Option<ResourceVector> {
        if self.dims() != other.dims() {
            return None;
        }
        self.0
            .iter()
            .zip(&other.0)
            .map(|(a, b)| a.checked_add(*b))
            .collect::<Option<Vec<_>>>()
            .map(ResourceVector)
    }

    /// Apply a signed delta; `None` if any dimension would go negative or overflow
    pub fn apply_delta(&self, delta: &[i64]) -> Option<ResourceVector> {
        if self.dims() != delta.len() {
            return None;
        }
        self.0
            .iter()
            .zip(delta)
            .map(|(v, d)| v.checked_add_signed(*d))
            .collect::<Option<Vec<_>>>()
            .map(ResourceVector)
    }

    /// Sum of `self / scale` over all dimensions
    pub fn normalized_total(&self, scales: &[f64]) -> f64 {
        self.0
            .iter()
            .zip(scales)
            .map(|(v, s)| *v as f64 / s)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_covers_and_shortfall() {
        let have = ResourceVector::from_vec(vec![4, 8, 0]);
        let want = ResourceVector::from_vec(vec![2, 8, 0]);
        assert!(have.covers(&want));

        let want_more = ResourceVector::from_vec(vec![2, 9, 0]);
        assert!(!have.covers(&want_more));
        assert_eq!(have.first_shortfall(&want_more), Some(1));
    }

    #[test]
    fn test_checked_arithmetic() {
        let a = ResourceVector::from_vec(vec![5, 5]);
        let b = ResourceVector::from_vec(vec![3, 6]);
        assert_eq!(a.checked_sub(&b), None);
        assert_eq!(
            a.checked_add(&b),
            Some(ResourceVector::from_vec(vec![8, 11]))
        );
        assert_eq!(
            a.apply_delta(&[-5, 2]),
            Some(ResourceVector::from_vec(vec![0, 7]))
        );
        assert_eq!(a.apply_delta(&[-6, 0]), None);
        assert_eq!(a.apply_delta(&[1]), None);
    }

    #[test]
    fn test_normalized_total() {
        let v = ResourceVector::from_vec(vec![2_000, 512]);
        let total = v.normalized_total(&[1_000.0, 1_024.0]);
        assert!((total - 2.5).abs() < 1e-9);
    }
}
