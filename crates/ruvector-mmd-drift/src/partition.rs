//! Group membership over the pooled sample.
//!
//! The pooled sequence is `reference ++ batch`. A partition assigns every pooled
//! index to the reference role or the test role while preserving the group sizes.

use rand::seq::index;
use rand::Rng;

use crate::error::{MmdDriftError, Result};

/// Assignment of pooled indices to the reference (`true`) or test (`false`) role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    in_reference: Vec<bool>,
    reference: Vec<usize>,
    test: Vec<usize>,
}

impl Partition {
    /// The observed partition: the first `m` pooled indices are the reference.
    pub fn observed(m: usize, n: usize) -> Self {
        let mut in_reference = vec![false; m + n];
        in_reference[..m].iter_mut().for_each(|b| *b = true);
        Self {
            in_reference,
            reference: (0..m).collect(),
            test: (m..m + n).collect(),
        }
    }

    /// Build a partition from explicit reference-role indices.
    pub fn from_reference_indices(pooled_len: usize, reference: &[usize]) -> Result<Self> {
        let mut in_reference = vec![false; pooled_len];
        for &i in reference {
            if i >= pooled_len {
                return Err(MmdDriftError::invalid_parameter(
                    "reference_indices",
                    format!("index {i} out of range for pooled length {pooled_len}"),
                ));
            }
            if in_reference[i] {
                return Err(MmdDriftError::invalid_parameter(
                    "reference_indices",
                    format!("index {i} appears twice"),
                ));
            }
            in_reference[i] = true;
        }
        Ok(Self::from_mask(in_reference))
    }

    /// Draw a uniformly random partition with `m` reference and `n` test indices.
    ///
    /// Indices are sampled without replacement; only membership matters.
    pub fn random<R: Rng + ?Sized>(m: usize, n: usize, rng: &mut R) -> Self {
        let mut in_reference = vec![false; m + n];
        for i in index::sample(rng, m + n, m).into_iter() {
            in_reference[i] = true;
        }
        Self::from_mask(in_reference)
    }

    fn from_mask(in_reference: Vec<bool>) -> Self {
        let (reference, test): (Vec<usize>, Vec<usize>) =
            (0..in_reference.len()).partition(|&i| in_reference[i]);
        Self {
            in_reference,
            reference,
            test,
        }
    }

    /// Whether pooled index `i` plays the reference role.
    #[inline]
    pub fn is_reference(&self, i: usize) -> bool {
        self.in_reference[i]
    }

    /// Reference-role indices in ascending order.
    pub fn reference_indices(&self) -> &[usize] {
        &self.reference
    }

    /// Test-role indices in ascending order.
    pub fn test_indices(&self) -> &[usize] {
        &self.test
    }

    /// Size of the reference group (m).
    pub fn n_reference(&self) -> usize {
        self.reference.len()
    }

    /// Size of the test group (n).
    pub fn n_test(&self) -> usize {
        self.test.len()
    }

    /// Pooled length m + n.
    pub fn len(&self) -> usize {
        self.in_reference.len()
    }

    /// Whether the pooled sample is empty.
    pub fn is_empty(&self) -> bool {
        self.in_reference.is_empty()
    }
}
