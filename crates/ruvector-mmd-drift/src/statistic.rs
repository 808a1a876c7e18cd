//! Unbiased MMD^2 estimator.
//!
//! ```text
//! MMD^2_u = 1/(m(m-1)) sum_{i!=j<=m} K[i][j]
//!         + 1/(n(n-1)) sum_{i!=j>m}  K[i][j]
//!         - 2/(mn)     sum_{i<=m, j>m} K[i][j]
//! ```
//!
//! Diagonal terms are excluded, which is what makes the U-statistic unbiased. The
//! estimate can be slightly negative under the null; that is expected.

use ndarray::ArrayView2;

use crate::error::{MmdDriftError, Result};
use crate::gram::{GroupKernelSums, GroupSums, KernelMatrix};
use crate::kernel::Kernel;

/// Smallest group size for which the unbiased estimator is defined.
pub const MIN_GROUP_SIZE: usize = 2;

/// Fail fast when either group is too small for the estimator.
pub fn check_group_sizes(m: usize, n: usize) -> Result<()> {
    if m < MIN_GROUP_SIZE {
        return Err(MmdDriftError::insufficient_samples(MIN_GROUP_SIZE, m));
    }
    if n < MIN_GROUP_SIZE {
        return Err(MmdDriftError::insufficient_samples(MIN_GROUP_SIZE, n));
    }
    Ok(())
}

/// MMD^2 from pre-accumulated group sums.
pub fn from_sums(sums: &GroupKernelSums, m: usize, n: usize) -> Result<f64> {
    check_group_sizes(m, n)?;
    Ok(mmd2_unchecked(sums, m, n))
}

#[inline]
pub(crate) fn mmd2_unchecked(sums: &GroupKernelSums, m: usize, n: usize) -> f64 {
    let (m, n) = (m as f64, n as f64);
    sums.reference_reference / (m * (m - 1.0)) + sums.test_test / (n * (n - 1.0))
        - 2.0 * sums.reference_test / (m * n)
}

/// MMD^2 of a kernel matrix whose first `m` rows are the reference and last `n` the test batch.
pub fn compute(k: ArrayView2<'_, f64>, m: usize, n: usize) -> Result<f64> {
    check_group_sizes(m, n)?;
    if k.nrows() != m + n {
        return Err(MmdDriftError::dimension_mismatch(m + n, k.nrows()));
    }
    if k.ncols() != m + n {
        return Err(MmdDriftError::dimension_mismatch(m + n, k.ncols()));
    }

    let mut sums = GroupKernelSums::default();
    for i in 0..m + n {
        for j in 0..m + n {
            if i == j {
                continue;
            }
            match (i < m, j < m) {
                (true, true) => sums.reference_reference += k[[i, j]],
                (false, false) => sums.test_test += k[[i, j]],
                (true, false) => sums.reference_test += k[[i, j]],
                (false, true) => {}
            }
        }
    }
    Ok(mmd2_unchecked(&sums, m, n))
}

/// MMD^2 for the observed partition of any [`GroupSums`] source.
pub fn observed(source: &dyn GroupSums) -> Result<f64> {
    from_sums(&source.observed_sums(), source.n_reference(), source.n_test())
}

/// MMD^2 between two samples under `kernel`, building the pooled matrix in memory.
pub fn between_samples(
    reference: ArrayView2<'_, f64>,
    test: ArrayView2<'_, f64>,
    kernel: &dyn Kernel,
) -> Result<f64> {
    check_group_sizes(reference.nrows(), test.nrows())?;
    if reference.ncols() != test.ncols() {
        return Err(MmdDriftError::dimension_mismatch(reference.ncols(), test.ncols()));
    }
    let pooled = ndarray::concatenate(ndarray::Axis(0), &[reference.view(), test.view()])
        .map_err(|e| MmdDriftError::numerical(e.to_string()))?;
    let km = KernelMatrix::build(pooled.view(), reference.nrows(), kernel)?;
    observed(&km)
}
