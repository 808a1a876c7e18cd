//! Pooled kernel (Gram) matrices and the estimator sums they provide.
//!
//! Two builders share one capability, [`KernelMatrixBuilder`]:
//!
//! - [`InMemoryBuilder`] materializes the full (m+n) x (m+n) matrix once and
//!   answers every partition as a quadratic form over it.
//! - [`ChunkedBuilder`] never holds more than one block of `b x (m+n)` kernel
//!   values. The observed sums are accumulated during the initial sweep, but every
//!   permuted partition re-evaluates the kernel block by block. Chunking trades
//!   speed for bounded memory: a permutation test over a chunked kernel costs a
//!   full kernel evaluation per permutation.

use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::error::{MmdDriftError, Result};
use crate::kernel::Kernel;
use crate::partition::Partition;

/// Upper bound on the memory of a single kernel block in the chunked path.
pub const MAX_BLOCK_BYTES: usize = 512 * 1024 * 1024;

/// Off-diagonal kernel sums for one partition.
///
/// `reference_reference` and `test_test` sum over ordered pairs `i != j`;
/// `reference_test` sums each cross pair once.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GroupKernelSums {
    /// Sum of K[i][j] with both indices in the reference role.
    pub reference_reference: f64,
    /// Sum of K[i][j] with both indices in the test role.
    pub test_test: f64,
    /// Sum of K[i][j] with i reference and j test.
    pub reference_test: f64,
}

/// Anything that can produce [`GroupKernelSums`] for a partition of the pooled sample.
pub trait GroupSums: Send + Sync {
    /// Pooled length m + n.
    fn pooled_len(&self) -> usize;

    /// Size of the observed reference group.
    fn n_reference(&self) -> usize;

    /// Sums for the observed partition (first m pooled indices are the reference).
    fn observed_sums(&self) -> GroupKernelSums;

    /// Sums for an arbitrary partition of the same pooled sample.
    fn group_sums(&self, partition: &Partition) -> Result<GroupKernelSums>;

    /// Size of the observed test group.
    fn n_test(&self) -> usize {
        self.pooled_len() - self.n_reference()
    }
}

/// Full symmetric kernel matrix over `reference ++ batch`.
#[derive(Debug, Clone)]
pub struct KernelMatrix {
    matrix: Array2<f64>,
    n_reference: usize,
    /// Row sums excluding the diagonal.
    offdiag_row_sums: Array1<f64>,
    /// Sum of all off-diagonal entries.
    offdiag_total: f64,
    observed: GroupKernelSums,
}

impl KernelMatrix {
    /// Wrap a precomputed kernel matrix whose first `n_reference` rows are the reference.
    pub fn from_matrix(matrix: Array2<f64>, n_reference: usize) -> Result<Self> {
        let size = matrix.nrows();
        if matrix.ncols() != size {
            return Err(MmdDriftError::dimension_mismatch(size, matrix.ncols()));
        }
        if n_reference > size {
            return Err(MmdDriftError::invalid_parameter(
                "n_reference",
                format!("{n_reference} exceeds kernel matrix size {size}"),
            ));
        }
        if matrix.iter().any(|v| !v.is_finite()) {
            return Err(MmdDriftError::numerical("kernel matrix contains non-finite values"));
        }

        let diag = matrix.diag();
        let offdiag_row_sums = &matrix.sum_axis(Axis(1)) - &diag;
        let offdiag_total = offdiag_row_sums.sum();

        let mut km = Self {
            matrix,
            n_reference,
            offdiag_row_sums,
            offdiag_total,
            observed: GroupKernelSums::default(),
        };
        km.observed = km.sums_for(&Partition::observed(n_reference, size - n_reference));
        Ok(km)
    }

    /// Compute the kernel matrix over the pooled sample.
    pub fn build(pooled: ArrayView2<'_, f64>, n_reference: usize, kernel: &dyn Kernel) -> Result<Self> {
        let mut matrix = kernel.evaluate_matrix(pooled, pooled)?;
        symmetrize(&mut matrix);
        Self::from_matrix(matrix, n_reference)
    }

    /// The raw matrix.
    pub fn matrix(&self) -> &Array2<f64> {
        &self.matrix
    }

    /// Off-diagonal row sums.
    pub fn offdiag_row_sums(&self) -> &Array1<f64> {
        &self.offdiag_row_sums
    }

    /// Sum of K[i][j] over ordered pairs i != j drawn from `indices`.
    pub fn within_group_sum(&self, indices: &[usize]) -> f64 {
        let mut sum = 0.0;
        for (a, &i) in indices.iter().enumerate() {
            let row = self.matrix.row(i);
            for &j in &indices[a + 1..] {
                sum += row[j];
            }
        }
        2.0 * sum
    }

    /// Quadratic-form evaluation: only the smaller group's internal sum is computed,
    /// the other two follow from the precomputed row sums and total.
    fn sums_for(&self, partition: &Partition) -> GroupKernelSums {
        let reference = partition.reference_indices();
        let test = partition.test_indices();

        if reference.len() <= test.len() {
            let rr = self.within_group_sum(reference);
            let row_total: f64 = reference.iter().map(|&i| self.offdiag_row_sums[i]).sum();
            let rt = row_total - rr;
            GroupKernelSums {
                reference_reference: rr,
                test_test: self.offdiag_total - rr - 2.0 * rt,
                reference_test: rt,
            }
        } else {
            let tt = self.within_group_sum(test);
            let row_total: f64 = test.iter().map(|&i| self.offdiag_row_sums[i]).sum();
            let rt = row_total - tt;
            GroupKernelSums {
                reference_reference: self.offdiag_total - tt - 2.0 * rt,
                test_test: tt,
                reference_test: rt,
            }
        }
    }
}

impl GroupSums for KernelMatrix {
    fn pooled_len(&self) -> usize {
        self.matrix.nrows()
    }

    fn n_reference(&self) -> usize {
        self.n_reference
    }

    fn observed_sums(&self) -> GroupKernelSums {
        self.observed
    }

    fn group_sums(&self, partition: &Partition) -> Result<GroupKernelSums> {
        if partition.len() != self.pooled_len() {
            return Err(MmdDriftError::dimension_mismatch(self.pooled_len(), partition.len()));
        }
        Ok(self.sums_for(partition))
    }
}

/// Memory-bounded kernel over the pooled sample.
///
/// Holds the pooled features and the kernel, never the full matrix. Each call to
/// [`GroupSums::group_sums`] sweeps the pooled rows in blocks of `block_size`.
#[derive(Debug, Clone)]
pub struct ChunkedKernel {
    pooled: Array2<f64>,
    kernel: Arc<dyn Kernel>,
    n_reference: usize,
    block_size: usize,
    observed: GroupKernelSums,
}

impl ChunkedKernel {
    /// Sweep the pooled sample once, accumulating the observed sums.
    pub fn build(
        pooled: ArrayView2<'_, f64>,
        n_reference: usize,
        kernel: Arc<dyn Kernel>,
        block_size: usize,
    ) -> Result<Self> {
        let size = pooled.nrows();
        if n_reference > size {
            return Err(MmdDriftError::invalid_parameter(
                "n_reference",
                format!("{n_reference} exceeds pooled length {size}"),
            ));
        }
        let block_size = checked_block_size(block_size, size)?;

        let mut chunked = Self {
            pooled: pooled.to_owned(),
            kernel,
            n_reference,
            block_size,
            observed: GroupKernelSums::default(),
        };
        chunked.observed = chunked.sweep(&Partition::observed(n_reference, size - n_reference))?;
        Ok(chunked)
    }

    /// Effective block size (clamped to the pooled length).
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn sweep(&self, partition: &Partition) -> Result<GroupKernelSums> {
        let size = self.pooled.nrows();
        let mut sums = GroupKernelSums::default();

        let mut start = 0;
        while start < size {
            let end = (start + self.block_size).min(size);
            let block = self
                .kernel
                .evaluate_matrix(self.pooled.slice(s![start..end, ..]), self.pooled.view())?;

            for (offset, row) in block.outer_iter().enumerate() {
                let i = start + offset;
                let i_ref = partition.is_reference(i);
                for (j, &k) in row.iter().enumerate() {
                    if i == j {
                        continue;
                    }
                    match (i_ref, partition.is_reference(j)) {
                        (true, true) => sums.reference_reference += k,
                        (false, false) => sums.test_test += k,
                        (true, false) => sums.reference_test += k,
                        (false, true) => {}
                    }
                }
            }
            start = end;
        }

        Ok(sums)
    }
}

impl GroupSums for ChunkedKernel {
    fn pooled_len(&self) -> usize {
        self.pooled.nrows()
    }

    fn n_reference(&self) -> usize {
        self.n_reference
    }

    fn observed_sums(&self) -> GroupKernelSums {
        self.observed
    }

    fn group_sums(&self, partition: &Partition) -> Result<GroupKernelSums> {
        if partition.len() != self.pooled_len() {
            return Err(MmdDriftError::dimension_mismatch(self.pooled_len(), partition.len()));
        }
        self.sweep(partition)
    }
}

/// Builds a [`GroupSums`] source over the pooled sample.
pub trait KernelMatrixBuilder: Send + Sync + fmt::Debug {
    /// Build from pooled features whose first `n_reference` rows are the reference.
    fn build(
        &self,
        pooled: ArrayView2<'_, f64>,
        n_reference: usize,
        kernel: Arc<dyn Kernel>,
    ) -> Result<Box<dyn GroupSums>>;

    /// Whether the builder keeps memory bounded by a block size.
    fn is_chunked(&self) -> bool {
        false
    }
}

/// Materializes the full kernel matrix.
#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryBuilder;

impl KernelMatrixBuilder for InMemoryBuilder {
    fn build(
        &self,
        pooled: ArrayView2<'_, f64>,
        n_reference: usize,
        kernel: Arc<dyn Kernel>,
    ) -> Result<Box<dyn GroupSums>> {
        debug!(pooled = pooled.nrows(), "Building in-memory kernel matrix");
        Ok(Box::new(KernelMatrix::build(pooled, n_reference, kernel.as_ref())?))
    }
}

/// Sweeps the kernel in row blocks of at most `block_size` rows.
#[derive(Debug, Clone, Copy)]
pub struct ChunkedBuilder {
    block_size: usize,
}

impl ChunkedBuilder {
    /// Create a chunked builder; `block_size` must be at least 1.
    pub fn new(block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(MmdDriftError::invalid_parameter("block_size", "must be at least 1"));
        }
        Ok(Self { block_size })
    }

    /// Configured block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

impl KernelMatrixBuilder for ChunkedBuilder {
    fn build(
        &self,
        pooled: ArrayView2<'_, f64>,
        n_reference: usize,
        kernel: Arc<dyn Kernel>,
    ) -> Result<Box<dyn GroupSums>> {
        debug!(
            pooled = pooled.nrows(),
            block_size = self.block_size,
            "Building chunked kernel"
        );
        Ok(Box::new(ChunkedKernel::build(pooled, n_reference, kernel, self.block_size)?))
    }

    fn is_chunked(&self) -> bool {
        true
    }
}

/// Select the builder for an optional block size: `None` keeps everything in memory.
pub fn builder_for(block_size: Option<usize>) -> Result<Arc<dyn KernelMatrixBuilder>> {
    match block_size {
        None => Ok(Arc::new(InMemoryBuilder)),
        Some(b) => Ok(Arc::new(ChunkedBuilder::new(b)?)),
    }
}

fn checked_block_size(block_size: usize, pooled_len: usize) -> Result<usize> {
    if block_size == 0 {
        return Err(MmdDriftError::invalid_parameter("block_size", "must be at least 1"));
    }
    let rows = block_size.min(pooled_len.max(1));
    let bytes = rows
        .checked_mul(pooled_len)
        .and_then(|elements| elements.checked_mul(std::mem::size_of::<f64>()))
        .ok_or_else(|| MmdDriftError::resource("kernel block size overflows; lower block_size"))?;
    if bytes > MAX_BLOCK_BYTES {
        return Err(MmdDriftError::resource(format!(
            "kernel block of {rows} x {pooled_len} needs {bytes} bytes, limit is {MAX_BLOCK_BYTES}; lower block_size"
        )));
    }
    Ok(rows)
}

fn symmetrize(matrix: &mut Array2<f64>) {
    let size = matrix.nrows();
    for i in 0..size {
        for j in (i + 1)..size {
            let v = 0.5 * (matrix[[i, j]] + matrix[[j, i]]);
            matrix[[i, j]] = v;
            matrix[[j, i]] = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{BandwidthAggregation, GaussianRbf};
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn pooled() -> Array2<f64> {
        array![
            [0.0, 0.1],
            [0.2, -0.3],
            [0.5, 0.4],
            [1.5, 1.2],
            [2.0, 1.9],
            [1.7, 2.4],
            [2.2, 1.1]
        ]
    }

    fn rbf() -> Arc<dyn Kernel> {
        Arc::new(GaussianRbf::new(vec![1.0], BandwidthAggregation::Mean).unwrap())
    }

    fn brute_force(k: &Array2<f64>, partition: &Partition) -> GroupKernelSums {
        let mut sums = GroupKernelSums::default();
        for i in 0..k.nrows() {
            for j in 0..k.ncols() {
                if i == j {
                    continue;
                }
                match (partition.is_reference(i), partition.is_reference(j)) {
                    (true, true) => sums.reference_reference += k[[i, j]],
                    (false, false) => sums.test_test += k[[i, j]],
                    (true, false) => sums.reference_test += k[[i, j]],
                    (false, true) => {}
                }
            }
        }
        sums
    }

    fn assert_sums_close(a: GroupKernelSums, b: GroupKernelSums) {
        assert!((a.reference_reference - b.reference_reference).abs() < 1e-10, "{a:?} vs {b:?}");
        assert!((a.test_test - b.test_test).abs() < 1e-10, "{a:?} vs {b:?}");
        assert!((a.reference_test - b.reference_test).abs() < 1e-10, "{a:?} vs {b:?}");
    }

    #[test]
    fn test_kernel_matrix_symmetric() {
        let data = pooled();
        let km = KernelMatrix::build(data.view(), 3, rbf().as_ref()).unwrap();
        let k = km.matrix();
        assert_eq!(k.shape(), &[7, 7]);
        for i in 0..7 {
            for j in 0..7 {
                assert_eq!(k[[i, j]], k[[j, i]]);
            }
            assert!((k[[i, i]] - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_quadratic_form_matches_brute_force() {
        let data = pooled();
        let km = KernelMatrix::build(data.view(), 3, rbf().as_ref()).unwrap();
        let mut rng = StdRng::seed_from_u64(11);

        // Both the "reference smaller" and "test smaller" branches.
        for (m, n) in [(3, 4), (5, 2)] {
            for _ in 0..20 {
                let p = Partition::random(m, n, &mut rng);
                let fast = km.group_sums(&p).unwrap();
                let slow = brute_force(km.matrix(), &p);
                assert_sums_close(fast, slow);
            }
        }
    }

    #[test]
    fn test_chunked_matches_in_memory() {
        let data = pooled();
        let km = KernelMatrix::build(data.view(), 3, rbf().as_ref()).unwrap();

        for block_size in [1, 2, 3, 7, 100] {
            let chunked = ChunkedKernel::build(data.view(), 3, rbf(), block_size).unwrap();
            assert_sums_close(chunked.observed_sums(), km.observed_sums());

            let p = Partition::from_reference_indices(7, &[1, 4, 6]).unwrap();
            assert_sums_close(chunked.group_sums(&p).unwrap(), km.group_sums(&p).unwrap());
        }
    }

    #[test]
    fn test_block_size_clamped() {
        let data = pooled();
        let chunked = ChunkedKernel::build(data.view(), 3, rbf(), 1_000).unwrap();
        assert_eq!(chunked.block_size(), 7);
    }

    #[test]
    fn test_zero_block_size_rejected() {
        let err = ChunkedBuilder::new(0).unwrap_err();
        assert!(err.is_invalid_input());
        assert!(builder_for(Some(0)).is_err());
        assert!(!builder_for(None).unwrap().is_chunked());
        assert!(builder_for(Some(4)).unwrap().is_chunked());
    }

    #[test]
    fn test_oversized_block_is_resource_error() {
        let err = checked_block_size(usize::MAX, usize::MAX).unwrap_err();
        assert!(err.is_resource());

        // 20_000 x 20_000 f64 = 3.2 GB, over the ceiling.
        let err = checked_block_size(20_000, 20_000).unwrap_err();
        assert!(err.is_resource());
        assert!(checked_block_size(10, 20_000).is_ok());
    }

    #[test]
    fn test_from_matrix_validation() {
        assert!(KernelMatrix::from_matrix(Array2::zeros((3, 4)), 1).is_err());
        assert!(KernelMatrix::from_matrix(Array2::zeros((3, 3)), 4).is_err());
        let mut bad = Array2::<f64>::eye(3);
        bad[[0, 1]] = f64::NAN;
        assert!(KernelMatrix::from_matrix(bad, 1).is_err());
    }

    #[test]
    fn test_partition_length_checked() {
        let data = pooled();
        let km = KernelMatrix::build(data.view(), 3, rbf().as_ref()).unwrap();
        let p = Partition::observed(2, 2);
        assert!(km.group_sums(&p).is_err());
    }
}
