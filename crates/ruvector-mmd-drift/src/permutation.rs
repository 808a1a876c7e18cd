//! Permutation test turning an MMD^2 statistic into a calibrated p-value.
//!
//! # Mathematical Background
//!
//! Under H_0: P = Q the group labels of the pooled sample are exchangeable, so
//! re-assigning them at random and recomputing MMD^2 draws from the null
//! distribution of the statistic. With B permutations:
//!
//! ```text
//! p = (#{b : MMD^2_b >= MMD^2_obs} + 1) / (B + 1)
//! ```
//!
//! The +1 counts the observed statistic as a member of its own null distribution,
//! so p is never exactly zero. The distance threshold is the upper-alpha quantile
//! of the permuted statistics.
//!
//! Every permutation reuses the same kernel; only the index-to-group mapping
//! changes. Permutations are independent and evaluated in parallel, each with its
//! own RNG stream derived from the master seed so that results do not depend on
//! thread scheduling.
//!
//! # References
//!
//! - Gretton, A., et al. (2012). "A Kernel Two-Sample Test" (JMLR)
//! - Phipson, B., & Smyth, G. K. (2010). "Permutation P-values Should Never Be Zero"

use ndarray::ArrayView2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MmdDriftError, Result};
use crate::gram::{GroupSums, KernelMatrix};
use crate::partition::Partition;
use crate::statistic;

/// How the p-value is formed from the permuted statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PValueConvention {
    /// (count + 1) / (B + 1): the observed statistic joins the null distribution.
    #[default]
    Corrected,
    /// count / B: plain fraction of permuted statistics at least as large.
    Uncorrected,
}

/// Configuration for the permutation test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermutationConfig {
    /// Number of random re-partitions B.
    pub n_permutations: usize,

    /// Significance level alpha.
    pub alpha: f64,

    /// Seed for reproducible permutations. `None` draws fresh entropy per run.
    #[serde(default)]
    pub seed: Option<u64>,

    /// P-value convention.
    #[serde(default)]
    pub p_value_convention: PValueConvention,

    /// Evaluate permutations on the rayon thread pool.
    #[serde(default = "default_parallel")]
    pub parallel: bool,
}

fn default_parallel() -> bool {
    true
}

impl Default for PermutationConfig {
    fn default() -> Self {
        Self {
            n_permutations: 100,
            alpha: 0.05,
            seed: None,
            p_value_convention: PValueConvention::Corrected,
            parallel: true,
        }
    }
}

impl PermutationConfig {
    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<()> {
        if self.n_permutations == 0 {
            return Err(MmdDriftError::invalid_parameter(
                "n_permutations",
                "must be at least 1",
            ));
        }
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(MmdDriftError::invalid_parameter("alpha", "must be in (0, 1)"));
        }
        Ok(())
    }
}

/// Permuted MMD^2 values, sorted ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NullDistribution {
    sorted: Vec<f64>,
}

impl NullDistribution {
    /// Build from unsorted permuted statistics.
    pub fn new(mut values: Vec<f64>) -> Self {
        values.sort_unstable_by(f64::total_cmp);
        Self { sorted: values }
    }

    /// Number of permuted statistics.
    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    /// Whether the distribution is empty.
    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    /// Values in ascending order.
    pub fn values(&self) -> &[f64] {
        &self.sorted
    }

    /// Number of permuted statistics at least as large as `x` (ties included).
    pub fn count_at_least(&self, x: f64) -> usize {
        let below = self.sorted.partition_point(|v| *v < x);
        self.sorted.len() - below
    }

    /// The critical value at the (1 - alpha) quantile.
    ///
    /// Taken as the element at rank floor(alpha * B) from the top.
    pub fn upper_quantile(&self, alpha: f64) -> f64 {
        let b = self.sorted.len();
        if b == 0 {
            return f64::NAN;
        }
        let from_top = ((alpha * b as f64).floor() as usize).min(b - 1);
        self.sorted[b - 1 - from_top]
    }
}

/// Outcome of one permutation test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermutationOutcome {
    /// Observed MMD^2 under the identity partition.
    pub observed: f64,
    /// Permutation p-value.
    pub p_value: f64,
    /// Configured significance level.
    pub alpha: f64,
    /// Upper-alpha quantile of the null distribution.
    pub distance_threshold: f64,
    /// Drift decision; `p_value <= alpha` is canonical.
    pub is_drift: bool,
    /// The permuted statistics.
    pub null_distribution: NullDistribution,
}

/// Permutation test over a fixed pooled kernel.
#[derive(Debug, Clone)]
pub struct PermutationTest {
    config: PermutationConfig,
}

impl PermutationTest {
    /// Create a permutation test with the given configuration.
    pub fn new(config: PermutationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// The configuration.
    pub fn config(&self) -> &PermutationConfig {
        &self.config
    }

    /// Run the test on a precomputed kernel matrix whose first `m` rows are the reference.
    pub fn run_matrix(&self, k: ArrayView2<'_, f64>, m: usize, n: usize) -> Result<PermutationOutcome> {
        statistic::check_group_sizes(m, n)?;
        if k.nrows() != m + n {
            return Err(MmdDriftError::dimension_mismatch(m + n, k.nrows()));
        }
        let km = KernelMatrix::from_matrix(k.to_owned(), m)?;
        self.run(&km)
    }

    /// Run the test on any [`GroupSums`] source.
    ///
    /// With a fixed seed, repeated runs over the same source are identical.
    pub fn run(&self, source: &dyn GroupSums) -> Result<PermutationOutcome> {
        let (m, n) = (source.n_reference(), source.n_test());
        let observed = statistic::observed(source)?;

        let mut master = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let seeds: Vec<u64> = (0..self.config.n_permutations).map(|_| master.gen()).collect();

        let permuted = |seed: &u64| -> Result<f64> {
            let mut rng = StdRng::seed_from_u64(*seed);
            let partition = Partition::random(m, n, &mut rng);
            let sums = source.group_sums(&partition)?;
            Ok(statistic::mmd2_unchecked(&sums, m, n))
        };

        let values: Vec<f64> = if self.config.parallel {
            seeds.par_iter().map(permuted).collect::<Result<Vec<_>>>()?
        } else {
            seeds.iter().map(permuted).collect::<Result<Vec<_>>>()?
        };

        Ok(self.decide(observed, NullDistribution::new(values)))
    }

    fn decide(&self, observed: f64, null_distribution: NullDistribution) -> PermutationOutcome {
        let b = null_distribution.len();
        let count = null_distribution.count_at_least(observed);
        let p_value = match self.config.p_value_convention {
            PValueConvention::Corrected => (count + 1) as f64 / (b + 1) as f64,
            PValueConvention::Uncorrected => count as f64 / b as f64,
        };

        let alpha = self.config.alpha;
        let distance_threshold = null_distribution.upper_quantile(alpha);
        let is_drift = p_value <= alpha;

        if is_drift != (observed > distance_threshold) {
            debug!(
                observed,
                distance_threshold,
                p_value,
                "Threshold comparison disagrees with p-value at a tie; p-value decides"
            );
        }

        PermutationOutcome {
            observed,
            p_value,
            alpha,
            distance_threshold,
            is_drift,
            null_distribution,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{BandwidthAggregation, GaussianRbf};
    use ndarray::{concatenate, Array2, Axis};
    use rand_distr::{Distribution, Normal};

    fn normal_sample(n: usize, dim: usize, mean: f64, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(mean, 1.0).unwrap();
        Array2::from_shape_fn((n, dim), |_| normal.sample(&mut rng))
    }

    fn pooled_matrix(x: &Array2<f64>, y: &Array2<f64>) -> KernelMatrix {
        let pooled = concatenate(Axis(0), &[x.view(), y.view()]).unwrap();
        let kernel = GaussianRbf::from_median_heuristic(pooled.view(), BandwidthAggregation::Mean).unwrap();
        KernelMatrix::build(pooled.view(), x.nrows(), &kernel).unwrap()
    }

    fn seeded(seed: u64, n_permutations: usize) -> PermutationTest {
        PermutationTest::new(PermutationConfig {
            n_permutations,
            seed: Some(seed),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_config_validation() {
        let mut config = PermutationConfig::default();
        assert!(config.validate().is_ok());

        config.n_permutations = 0;
        assert!(config.validate().is_err());

        config.n_permutations = 10;
        config.alpha = 0.0;
        assert!(config.validate().is_err());
        config.alpha = 1.0;
        assert!(config.validate().is_err());
        config.alpha = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_null_distribution_helpers() {
        let null = NullDistribution::new(vec![0.3, 0.1, 0.4, 0.2, 0.5]);
        assert_eq!(null.values(), &[0.1, 0.2, 0.3, 0.4, 0.5]);
        assert_eq!(null.count_at_least(0.3), 3);
        assert_eq!(null.count_at_least(0.0), 5);
        assert_eq!(null.count_at_least(0.6), 0);

        // floor(0.2 * 5) = 1 from the top.
        assert_eq!(null.upper_quantile(0.2), 0.4);
        // floor(0.05 * 5) = 0: the maximum.
        assert_eq!(null.upper_quantile(0.05), 0.5);
    }

    #[test]
    fn test_identical_samples_not_significant() {
        let x = normal_sample(30, 3, 0.0, 1);
        let km = pooled_matrix(&x, &x);
        let outcome = seeded(42, 200).run(&km).unwrap();

        assert!(outcome.observed.abs() < 0.1, "MMD^2 = {}", outcome.observed);
        assert!(outcome.p_value > 0.9, "p = {}", outcome.p_value);
        assert!(!outcome.is_drift);
    }

    #[test]
    fn test_shifted_samples_significant() {
        let x = normal_sample(100, 2, 0.0, 3);
        let y = normal_sample(100, 2, 5.0, 4);
        let km = pooled_matrix(&x, &y);
        let outcome = seeded(42, 100).run(&km).unwrap();

        assert!(outcome.p_value <= 0.05, "p = {}", outcome.p_value);
        assert!(outcome.is_drift);
        assert!(outcome.observed > outcome.distance_threshold);
        // Nothing in the null reaches the observed value: p is the floor 1/(B+1).
        assert!((outcome.p_value - 1.0 / 101.0).abs() < 1e-12);
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let x = normal_sample(20, 2, 0.0, 5);
        let y = normal_sample(25, 2, 0.5, 6);
        let km = pooled_matrix(&x, &y);
        let test = seeded(7, 150);

        let a = test.run(&km).unwrap();
        let b = test.run(&km).unwrap();
        assert_eq!(a.p_value, b.p_value);
        assert_eq!(a.distance_threshold, b.distance_threshold);
        assert_eq!(a.null_distribution, b.null_distribution);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let x = normal_sample(15, 2, 0.0, 8);
        let y = normal_sample(18, 2, 0.3, 9);
        let km = pooled_matrix(&x, &y);

        let parallel = seeded(99, 64).run(&km).unwrap();
        let sequential = PermutationTest::new(PermutationConfig {
            n_permutations: 64,
            seed: Some(99),
            parallel: false,
            ..Default::default()
        })
        .unwrap()
        .run(&km)
        .unwrap();

        assert_eq!(parallel.null_distribution, sequential.null_distribution);
        assert_eq!(parallel.p_value, sequential.p_value);
    }

    #[test]
    fn test_uncorrected_convention() {
        let x = normal_sample(40, 2, 0.0, 10);
        let y = normal_sample(40, 2, 6.0, 11);
        let km = pooled_matrix(&x, &y);
        let outcome = PermutationTest::new(PermutationConfig {
            n_permutations: 50,
            seed: Some(1),
            p_value_convention: PValueConvention::Uncorrected,
            ..Default::default()
        })
        .unwrap()
        .run(&km)
        .unwrap();

        assert_eq!(outcome.p_value, 0.0);
        assert!(outcome.is_drift);
    }

    #[test]
    fn test_p_value_in_unit_interval() {
        let x = normal_sample(10, 2, 0.0, 12);
        let y = normal_sample(12, 2, 0.2, 13);
        let km = pooled_matrix(&x, &y);
        for seed in 0..5 {
            let outcome = seeded(seed, 30).run(&km).unwrap();
            assert!(outcome.p_value > 0.0 && outcome.p_value <= 1.0);
            assert_eq!(outcome.null_distribution.len(), 30);
            assert_eq!(outcome.is_drift, outcome.p_value <= outcome.alpha);
        }
    }

    #[test]
    fn test_run_matrix_validates_sizes() {
        let test = seeded(0, 10);
        let k = Array2::<f64>::eye(4);
        assert!(test.run_matrix(k.view(), 2, 2).is_ok());
        assert!(test.run_matrix(k.view(), 1, 3).is_err());
        assert!(test.run_matrix(k.view(), 2, 3).is_err());
    }
}
