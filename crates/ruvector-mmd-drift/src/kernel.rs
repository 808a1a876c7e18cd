//! Kernel functions for the MMD two-sample test.
//!
//! # Mathematical Background
//!
//! ## Gaussian RBF Kernel
//!
//! The default kernel is the Gaussian radial basis function:
//!
//! ```text
//! k(x, y) = exp(-||x - y||^2 / (2 * sigma^2))
//! ```
//!
//! With a set of bandwidths {sigma_1, ..., sigma_k} the per-bandwidth values are
//! combined by their mean (or sum), which blunts the sensitivity of the test to
//! any single length-scale.
//!
//! ## Median Heuristic
//!
//! When no bandwidth is configured, sigma^2 is set to the median of the pairwise
//! squared Euclidean distances among the pooled sample (self-distances excluded).
//! With a block size the median is located by counting sweeps instead of sorting
//! every pair, so memory stays bounded by the block like the chunked kernel.
//!
//! # References
//!
//! - Gretton, A., et al. (2012). "A Kernel Two-Sample Test" (JMLR)
//! - Garreau, D., Jitkrittum, W., & Kanagawa, M. (2017). "Large sample analysis of
//!   the median heuristic"

use ndarray::{Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{MmdDriftError, Result};

/// A positive-definite similarity function between feature vectors.
///
/// Implementations must be deterministic: the same inputs always produce the
/// same value. The batched form defaults to pairwise evaluation and can be
/// overridden when a kernel has a faster matrix path.
pub trait Kernel: Send + Sync + fmt::Debug {
    /// Evaluate k(x, y) for two feature vectors of equal length.
    fn evaluate(&self, x: ArrayView1<'_, f64>, y: ArrayView1<'_, f64>) -> f64;

    /// Evaluate the cross-kernel matrix K[i, j] = k(x_i, y_j).
    fn evaluate_matrix(&self, x: ArrayView2<'_, f64>, y: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        if x.ncols() != y.ncols() {
            return Err(MmdDriftError::dimension_mismatch(x.ncols(), y.ncols()));
        }
        Ok(Array2::from_shape_fn((x.nrows(), y.nrows()), |(i, j)| {
            self.evaluate(x.row(i), y.row(j))
        }))
    }

    /// Short human-readable name, attached to detector metadata.
    fn name(&self) -> String {
        "custom".to_string()
    }
}

/// How per-bandwidth RBF values are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandwidthAggregation {
    /// Average over bandwidths; keeps k(x, x) = 1.
    #[default]
    Mean,
    /// Sum over bandwidths; k(x, x) equals the number of bandwidths.
    Sum,
}

/// Configuration for the Gaussian RBF kernel.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RbfConfig {
    /// Bandwidths sigma. `None` infers a single bandwidth with the median heuristic.
    #[serde(default)]
    pub bandwidths: Option<Vec<f64>>,

    /// Combination rule for multiple bandwidths.
    #[serde(default)]
    pub aggregation: BandwidthAggregation,
}

impl RbfConfig {
    /// Configuration with a single fixed bandwidth.
    pub fn with_bandwidth(sigma: f64) -> Self {
        Self {
            bandwidths: Some(vec![sigma]),
            ..Default::default()
        }
    }

    /// Configuration with several bandwidths combined by `aggregation`.
    pub fn multi_bandwidth(sigmas: Vec<f64>, aggregation: BandwidthAggregation) -> Self {
        Self {
            bandwidths: Some(sigmas),
            aggregation,
        }
    }

    /// Validate the configuration parameters.
    pub fn validate(&self) -> Result<()> {
        if let Some(sigmas) = &self.bandwidths {
            if sigmas.is_empty() {
                return Err(MmdDriftError::invalid_parameter(
                    "bandwidths",
                    "must contain at least one value (omit to infer)",
                ));
            }
            if sigmas.iter().any(|s| !s.is_finite() || *s <= 0.0) {
                return Err(MmdDriftError::invalid_parameter(
                    "bandwidths",
                    "every bandwidth must be finite and positive",
                ));
            }
        }
        Ok(())
    }
}

/// Gaussian RBF kernel with one or more fixed bandwidths.
#[derive(Debug, Clone)]
pub struct GaussianRbf {
    bandwidths: Vec<f64>,
    /// Precomputed 1 / (2 sigma^2) per bandwidth.
    gammas: Vec<f64>,
    aggregation: BandwidthAggregation,
}

impl GaussianRbf {
    /// Create an RBF kernel from explicit bandwidths.
    pub fn new(bandwidths: Vec<f64>, aggregation: BandwidthAggregation) -> Result<Self> {
        RbfConfig::multi_bandwidth(bandwidths.clone(), aggregation).validate()?;
        let gammas = bandwidths.iter().map(|s| 1.0 / (2.0 * s * s)).collect();
        Ok(Self {
            bandwidths,
            gammas,
            aggregation,
        })
    }

    /// Create an RBF kernel whose bandwidth comes from the median heuristic on `sample`.
    pub fn from_median_heuristic(
        sample: ArrayView2<'_, f64>,
        aggregation: BandwidthAggregation,
    ) -> Result<Self> {
        let sigma = median_heuristic(sample)?;
        Self::new(vec![sigma], aggregation)
    }

    /// The bandwidths in use.
    pub fn bandwidths(&self) -> &[f64] {
        &self.bandwidths
    }

    /// The aggregation rule in use.
    pub fn aggregation(&self) -> BandwidthAggregation {
        self.aggregation
    }

    /// Kernel value for a squared Euclidean distance.
    #[inline]
    pub fn from_sq_distance(&self, sq_dist: f64) -> f64 {
        let total: f64 = self.gammas.iter().map(|g| (-g * sq_dist).exp()).sum();
        match self.aggregation {
            BandwidthAggregation::Mean => total / self.gammas.len() as f64,
            BandwidthAggregation::Sum => total,
        }
    }
}

impl Kernel for GaussianRbf {
    fn evaluate(&self, x: ArrayView1<'_, f64>, y: ArrayView1<'_, f64>) -> f64 {
        self.from_sq_distance(sq_euclidean(x, y))
    }

    fn evaluate_matrix(&self, x: ArrayView2<'_, f64>, y: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        let mut k = pairwise_sq_distances(x, y)?;
        k.mapv_inplace(|d| self.from_sq_distance(d));
        Ok(k)
    }

    fn name(&self) -> String {
        let sigmas: Vec<String> = self.bandwidths.iter().map(|s| format!("{s:.4}")).collect();
        format!("gaussian_rbf(sigma=[{}])", sigmas.join(", "))
    }
}

/// Kernel choice for a detector: the built-in RBF or a user-supplied kernel.
///
/// An RBF without bandwidths is resolved against a sample with [`KernelFunction::bind`].
/// Passing a block size there selects the memory-bounded median heuristic.
#[derive(Debug, Clone)]
pub enum KernelFunction {
    /// Gaussian RBF, bandwidths inferred when absent.
    Rbf(RbfConfig),
    /// Any user kernel.
    Custom(Arc<dyn Kernel>),
}

impl Default for KernelFunction {
    fn default() -> Self {
        Self::Rbf(RbfConfig::default())
    }
}

impl KernelFunction {
    /// Build an RBF kernel choice, validating its configuration.
    pub fn rbf(config: RbfConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::Rbf(config))
    }

    /// Wrap a user kernel.
    pub fn custom(kernel: Arc<dyn Kernel>) -> Self {
        Self::Custom(kernel)
    }

    /// Whether a bandwidth still has to be inferred from data.
    pub fn needs_inference(&self) -> bool {
        matches!(self, Self::Rbf(RbfConfig { bandwidths: None, .. }))
    }

    /// Resolve to a concrete kernel, inferring the RBF bandwidth from `sample` if needed.
    ///
    /// `block_size` selects [`median_heuristic_blocked`] over [`median_heuristic`].
    pub fn bind(&self, sample: ArrayView2<'_, f64>, block_size: Option<usize>) -> Result<Arc<dyn Kernel>> {
        match self {
            Self::Rbf(config) => {
                let sigmas = match &config.bandwidths {
                    Some(sigmas) => sigmas.clone(),
                    None => vec![infer_bandwidth(sample, block_size)?],
                };
                Ok(Arc::new(GaussianRbf::new(sigmas, config.aggregation)?))
            }
            Self::Custom(kernel) => Ok(Arc::clone(kernel)),
        }
    }

    /// Freeze an inferred RBF bandwidth against `sample`; other choices are returned unchanged.
    pub fn frozen(&self, sample: ArrayView2<'_, f64>, block_size: Option<usize>) -> Result<Self> {
        match self {
            Self::Rbf(config) if config.bandwidths.is_none() => {
                let sigma = infer_bandwidth(sample, block_size)?;
                Ok(Self::Rbf(RbfConfig {
                    bandwidths: Some(vec![sigma]),
                    aggregation: config.aggregation,
                }))
            }
            other => Ok(other.clone()),
        }
    }

    /// Description for metadata.
    pub fn describe(&self) -> String {
        match self {
            Self::Rbf(config) => match &config.bandwidths {
                Some(sigmas) => GaussianRbf::new(sigmas.clone(), config.aggregation)
                    .map(|k| k.name())
                    .unwrap_or_else(|_| "gaussian_rbf(invalid)".to_string()),
                None => "gaussian_rbf(sigma=median)".to_string(),
            },
            Self::Custom(kernel) => kernel.name(),
        }
    }
}

/// Squared Euclidean distance between two vectors.
#[inline]
pub fn sq_euclidean(x: ArrayView1<'_, f64>, y: ArrayView1<'_, f64>) -> f64 {
    x.iter().zip(y.iter()).map(|(a, b)| (a - b) * (a - b)).sum()
}

/// Matrix of squared Euclidean distances D[i, j] = ||x_i - y_j||^2.
pub fn pairwise_sq_distances(x: ArrayView2<'_, f64>, y: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
    if x.ncols() != y.ncols() {
        return Err(MmdDriftError::dimension_mismatch(x.ncols(), y.ncols()));
    }
    Ok(Array2::from_shape_fn((x.nrows(), y.nrows()), |(i, j)| {
        sq_euclidean(x.row(i), y.row(j))
    }))
}

/// Median heuristic bandwidth.
///
/// Returns sigma such that sigma^2 is the median pairwise squared distance among
/// the rows of `sample`, excluding self-distances. Falls back to 1.0 when that
/// median is zero (e.g. all rows identical).
pub fn median_heuristic(sample: ArrayView2<'_, f64>) -> Result<f64> {
    let n = sample.nrows();
    if n < 2 {
        return Err(MmdDriftError::insufficient_samples(2, n));
    }

    let mut distances = Vec::with_capacity(n * (n - 1) / 2);
    for i in 0..n {
        for j in (i + 1)..n {
            distances.push(sq_euclidean(sample.row(i), sample.row(j)));
        }
    }
    distances.sort_unstable_by(f64::total_cmp);

    let mid = distances.len() / 2;
    let median = if distances.len() % 2 == 0 {
        0.5 * (distances[mid - 1] + distances[mid])
    } else {
        distances[mid]
    };

    Ok(sigma_from_median(median, distances.len()))
}

/// Median heuristic bandwidth in O(block_size * n) memory.
///
/// Returns exactly the sigma of [`median_heuristic`]. The middle order statistics
/// are bracketed by bisecting on the bit pattern of a candidate squared distance
/// (monotone for non-negative floats) and counting the pairs at or below it. Once
/// the bracket holds at most `block_size * n` distances they are collected and
/// selected directly. Each step is a full O(n^2) sweep, so this trades time for
/// memory the same way the chunked kernel does.
pub fn median_heuristic_blocked(sample: ArrayView2<'_, f64>, block_size: usize) -> Result<f64> {
    let n = sample.nrows();
    if n < 2 {
        return Err(MmdDriftError::insufficient_samples(2, n));
    }
    if block_size == 0 {
        return Err(MmdDriftError::invalid_parameter("block_size", "must be at least 1"));
    }
    if sample.iter().any(|v| v.is_nan()) {
        return Err(MmdDriftError::numerical("sample contains NaN values"));
    }

    let pairs = n * (n - 1) / 2;
    let budget = block_size.saturating_mul(n);
    let lower = kth_sq_distance(sample, (pairs - 1) / 2, pairs, budget);
    let median = if pairs % 2 == 1 {
        lower
    } else if count_at_most(sample, lower) > pairs / 2 {
        lower
    } else {
        0.5 * (lower + min_above(sample, lower))
    };

    Ok(sigma_from_median(median, pairs))
}

fn infer_bandwidth(sample: ArrayView2<'_, f64>, block_size: Option<usize>) -> Result<f64> {
    match block_size {
        Some(b) => median_heuristic_blocked(sample, b),
        None => median_heuristic(sample),
    }
}

fn sigma_from_median(median: f64, pairs: usize) -> f64 {
    if !median.is_finite() || median <= 0.0 {
        warn!(median, "Median squared distance is degenerate, falling back to sigma = 1");
        return 1.0;
    }
    let sigma = median.sqrt();
    debug!(sigma, pairs, "Inferred RBF bandwidth from median heuristic");
    sigma
}

/// Squared distances from row `i` to every later row.
fn upper_distances(sample: ArrayView2<'_, f64>, i: usize) -> impl Iterator<Item = f64> + '_ {
    (i + 1..sample.nrows()).map(move |j| sq_euclidean(sample.row(i), sample.row(j)))
}

fn count_at_most(sample: ArrayView2<'_, f64>, t: f64) -> usize {
    (0..sample.nrows())
        .into_par_iter()
        .map(|i| upper_distances(sample, i).filter(|&d| d <= t).count())
        .sum()
}

fn min_above(sample: ArrayView2<'_, f64>, t: f64) -> f64 {
    (0..sample.nrows())
        .into_par_iter()
        .map(|i| upper_distances(sample, i).filter(|&d| d > t).fold(f64::INFINITY, f64::min))
        .reduce(|| f64::INFINITY, f64::min)
}

/// The k-th smallest (0-based) pairwise squared distance.
fn kth_sq_distance(sample: ArrayView2<'_, f64>, k: usize, pairs: usize, budget: usize) -> f64 {
    let max = (0..sample.nrows())
        .into_par_iter()
        .map(|i| upper_distances(sample, i).fold(0.0, f64::max))
        .reduce(|| 0.0, f64::max);

    // Bracket (lo, hi] in bit space with count(<= lo) <= k < count(<= hi).
    let mut lo: Option<u64> = None;
    let mut below = 0;
    let mut hi = max.to_bits();
    let mut hi_count = pairs;

    loop {
        let start = lo.map_or(0, |b| b + 1);
        if start >= hi {
            // A single representable value is left.
            return f64::from_bits(hi);
        }
        if hi_count - below <= budget {
            break;
        }
        let mid = start + (hi - start) / 2;
        let count = count_at_most(sample, f64::from_bits(mid));
        if count > k {
            hi = mid;
            hi_count = count;
        } else {
            lo = Some(mid);
            below = count;
        }
    }

    let (lo, hi) = (lo.map(f64::from_bits), f64::from_bits(hi));
    let mut bracket: Vec<f64> = (0..sample.nrows())
        .into_par_iter()
        .flat_map_iter(|i| upper_distances(sample, i).filter(move |&d| d <= hi && lo.map_or(true, |l| d > l)))
        .collect();
    bracket.sort_unstable_by(f64::total_cmp);
    bracket[k - below]
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[derive(Debug)]
    struct LinearKernel;

    impl Kernel for LinearKernel {
        fn evaluate(&self, x: ArrayView1<'_, f64>, y: ArrayView1<'_, f64>) -> f64 {
            x.dot(&y)
        }
    }

    #[test]
    fn test_rbf_known_value() {
        let kernel = GaussianRbf::new(vec![1.0], BandwidthAggregation::Mean).unwrap();
        let x = array![0.0, 0.0];
        let y = array![1.0, 0.0];

        let k = kernel.evaluate(x.view(), y.view());
        assert!((k - (-0.5f64).exp()).abs() < 1e-12);
        assert!((kernel.evaluate(x.view(), x.view()) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_rbf_symmetry() {
        let kernel = GaussianRbf::new(vec![0.7], BandwidthAggregation::Mean).unwrap();
        let x = array![0.1, 0.2, 0.3];
        let y = array![0.4, 0.5, 0.6];

        let k_xy = kernel.evaluate(x.view(), y.view());
        let k_yx = kernel.evaluate(y.view(), x.view());
        assert!((k_xy - k_yx).abs() < 1e-15, "Kernel should be symmetric");
    }

    #[test]
    fn test_multi_bandwidth_aggregation() {
        let x = array![0.0];
        let y = array![2.0];

        let mean = GaussianRbf::new(vec![1.0, 2.0], BandwidthAggregation::Mean).unwrap();
        let sum = GaussianRbf::new(vec![1.0, 2.0], BandwidthAggregation::Sum).unwrap();

        let expected_sum = (-2.0f64).exp() + (-0.5f64).exp();
        assert!((sum.evaluate(x.view(), y.view()) - expected_sum).abs() < 1e-12);
        assert!((mean.evaluate(x.view(), y.view()) - expected_sum / 2.0).abs() < 1e-12);

        // Self-similarity follows the aggregation rule.
        assert!((mean.evaluate(x.view(), x.view()) - 1.0).abs() < 1e-12);
        assert!((sum.evaluate(x.view(), x.view()) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_rbf_matrix_matches_pointwise() {
        let kernel = GaussianRbf::new(vec![1.5], BandwidthAggregation::Mean).unwrap();
        let x = array![[0.0, 1.0], [2.0, -1.0], [0.5, 0.5]];
        let y = array![[1.0, 1.0], [-3.0, 0.0]];

        let k = kernel.evaluate_matrix(x.view(), y.view()).unwrap();
        assert_eq!(k.shape(), &[3, 2]);
        for i in 0..3 {
            for j in 0..2 {
                let direct = kernel.evaluate(x.row(i), y.row(j));
                assert!((k[[i, j]] - direct).abs() < 1e-15);
            }
        }
    }

    #[test]
    fn test_matrix_dimension_mismatch() {
        let kernel = GaussianRbf::new(vec![1.0], BandwidthAggregation::Mean).unwrap();
        let x = array![[0.0, 1.0]];
        let y = array![[1.0, 1.0, 1.0]];
        assert!(kernel.evaluate_matrix(x.view(), y.view()).is_err());
        assert!(LinearKernel.evaluate_matrix(x.view(), y.view()).is_err());
    }

    #[test]
    fn test_rbf_config_validation() {
        assert!(RbfConfig::default().validate().is_ok());
        assert!(RbfConfig::with_bandwidth(0.5).validate().is_ok());
        assert!(RbfConfig::with_bandwidth(0.0).validate().is_err());
        assert!(RbfConfig::with_bandwidth(f64::NAN).validate().is_err());
        assert!(RbfConfig::multi_bandwidth(vec![], BandwidthAggregation::Sum)
            .validate()
            .is_err());
        assert!(GaussianRbf::new(vec![1.0, -2.0], BandwidthAggregation::Mean).is_err());
    }

    #[test]
    fn test_median_heuristic_known_sample() {
        // Points on a line at 0, 1, 3: squared distances {1, 9, 4}, median 4.
        let sample = array![[0.0], [1.0], [3.0]];
        let sigma = median_heuristic(sample.view()).unwrap();
        assert!((sigma - 2.0).abs() < 1e-12);

        // Even number of pairs averages the two middle values.
        let sample = array![[0.0], [1.0], [3.0], [6.0]];
        // {1, 9, 36, 4, 25, 9} -> sorted {1, 4, 9, 9, 25, 36}, median 9.
        let sigma = median_heuristic(sample.view()).unwrap();
        assert!((sigma - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_median_heuristic_degenerate() {
        let identical = Array2::from_elem((5, 3), 0.25);
        assert_eq!(median_heuristic(identical.view()).unwrap(), 1.0);

        let single = array![[1.0, 2.0]];
        assert!(median_heuristic(single.view()).is_err());
    }

    #[test]
    fn test_kernel_function_bind() {
        let sample = array![[0.0], [1.0], [3.0]];

        let inferred = KernelFunction::default();
        assert!(inferred.needs_inference());
        let bound = inferred.bind(sample.view(), None).unwrap();
        let k = bound.evaluate(sample.row(0), sample.row(2));
        // sigma^2 = 4, ||x - y||^2 = 9
        assert!((k - (-9.0f64 / 8.0).exp()).abs() < 1e-12);

        let fixed = KernelFunction::rbf(RbfConfig::with_bandwidth(1.0)).unwrap();
        assert!(!fixed.needs_inference());

        let custom = KernelFunction::custom(Arc::new(LinearKernel));
        let bound = custom.bind(sample.view(), None).unwrap();
        assert_eq!(bound.evaluate(sample.row(1), sample.row(2)), 3.0);
        assert_eq!(custom.describe(), "custom");
    }

    #[test]
    fn test_kernel_function_frozen() {
        let sample = array![[0.0], [1.0], [3.0]];
        let frozen = KernelFunction::default().frozen(sample.view(), None).unwrap();
        match frozen {
            KernelFunction::Rbf(config) => {
                assert_eq!(config.bandwidths, Some(vec![2.0]));
            }
            KernelFunction::Custom(_) => panic!("RBF should stay RBF"),
        }

        let blocked = KernelFunction::default().frozen(sample.view(), Some(1)).unwrap();
        assert_eq!(blocked.describe(), frozen_description(&sample));
    }

    fn frozen_description(sample: &Array2<f64>) -> String {
        KernelFunction::default().frozen(sample.view(), None).unwrap().describe()
    }

    #[test]
    fn test_blocked_median_known_samples() {
        // Odd and even pair counts, with ties.
        let odd = array![[0.0], [1.0], [3.0]];
        assert_eq!(median_heuristic_blocked(odd.view(), 1).unwrap(), 2.0);
        let even = array![[0.0], [1.0], [3.0], [6.0]];
        assert_eq!(median_heuristic_blocked(even.view(), 1).unwrap(), 3.0);

        let identical = Array2::from_elem((6, 2), -1.5);
        assert_eq!(median_heuristic_blocked(identical.view(), 1).unwrap(), 1.0);

        assert!(median_heuristic_blocked(odd.view(), 0).is_err());
        assert!(median_heuristic_blocked(array![[1.0]].view(), 4).is_err());
    }

    #[test]
    fn test_blocked_median_matches_sorted() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(17);
        for (n, dim) in [(2, 1), (5, 3), (40, 2), (101, 4), (200, 3)] {
            let sample = Array2::from_shape_fn((n, dim), |_| rng.gen_range(-3.0..3.0));
            let dense = median_heuristic(sample.view()).unwrap();
            for block_size in [1, 3, 64, 1_000] {
                let blocked = median_heuristic_blocked(sample.view(), block_size).unwrap();
                assert_eq!(blocked, dense, "n={n} block={block_size}");
            }
        }

        // Heavy ties: integer grid coordinates.
        let grid = Array2::from_shape_fn((60, 2), |(i, j)| ((i * (j + 2)) % 5) as f64);
        let dense = median_heuristic(grid.view()).unwrap();
        assert_eq!(median_heuristic_blocked(grid.view(), 1).unwrap(), dense);
    }
}
