//! # Ruvector MMD Drift
//!
//! Kernel two-sample drift detection with the Maximum Mean Discrepancy (MMD).
//!
//! A detector holds a reference sample. Each incoming batch is tested against it with
//! the unbiased MMD^2 statistic, and a permutation test turns the statistic into a
//! p-value and a distance threshold. After each prediction the reference can be
//! refreshed with a trailing window or a reservoir sample of the stream.
//!
//! ## Features
//!
//! - **Gaussian RBF kernel**: one or more bandwidths, inferred with the median heuristic
//!   when not configured
//! - **Unbiased MMD^2**: diagonal-free U-statistic, valid for any group sizes >= 2
//! - **Permutation test**: seeded, parallel over rayon, with a quadratic-form shortcut
//!   that avoids re-summing the kernel matrix for every permutation
//! - **Bounded memory**: optional block-wise kernel evaluation for large pooled samples
//! - **Reference updates**: last-N window or reservoir sampling
//! - **Thread-safe API**: [`SharedDetector`] serializes predictions behind a lock
//!
//! ## Quick Start
//!
//! ```rust
//! use ruvector_mmd_drift::{DetectorConfig, MmdDriftDetector, PermutationConfig, UpdatePolicy};
//! use ndarray::Array2;
//! use rand::SeedableRng;
//! use rand_distr::{Distribution, Normal};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut rng = rand::rngs::StdRng::seed_from_u64(7);
//! let baseline = Normal::new(0.0, 1.0)?;
//! let shifted = Normal::new(3.0, 1.0)?;
//!
//! let reference = Array2::from_shape_fn((100, 4), |_| baseline.sample(&mut rng));
//! let config = DetectorConfig {
//!     permutation: PermutationConfig {
//!         n_permutations: 200,
//!         seed: Some(42),
//!         ..Default::default()
//!     },
//!     update_policy: UpdatePolicy::Last(200),
//!     ..Default::default()
//! };
//! let mut detector = MmdDriftDetector::new(reference, config)?;
//!
//! let batch = Array2::from_shape_fn((50, 4), |_| shifted.sample(&mut rng));
//! let prediction = detector.predict(&batch, true, true)?;
//!
//! println!(
//!     "drift={} p={:?} MMD^2={:?}",
//!     prediction.is_drift, prediction.p_value, prediction.distance
//! );
//! assert!(prediction.is_drift);
//! # Ok(())
//! # }
//! ```
//!
//! ## Mathematical Background
//!
//! ### Maximum Mean Discrepancy
//!
//! MMD^2(P, Q) = E[k(X,X')] - 2E[k(X,Y)] + E[k(Y,Y')]
//!
//! With a characteristic kernel such as the Gaussian RBF, MMD(P, Q) = 0 if and only if
//! P = Q. The unbiased estimator drops the k(x, x) terms, so it can be slightly negative
//! when the samples come from the same distribution.
//!
//! ### Median Heuristic
//!
//! sigma^2 = median{ ||z_i - z_j||^2 : i < j } over the pooled sample, falling back to
//! sigma = 1 when the median is zero or not finite.
//!
//! ### Permutation Test
//!
//! Under H_0 the group labels are exchangeable. Re-partitioning the pooled sample B
//! times gives a null distribution for MMD^2; the p-value is the fraction of permuted
//! statistics at least as large as the observed one, by default with the +1 correction
//! (count + 1) / (B + 1) that keeps the test valid at finite B.
//!
//! ## References
//!
//! - Gretton, A., et al. (2012). "A Kernel Two-Sample Test"
//! - Vitter, J.S. (1985). "Random Sampling with a Reservoir"
//! - Phipson, B., & Smyth, G.K. (2010). "Permutation P-values Should Never Be Zero"

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod detector;
pub mod error;
pub mod gram;
pub mod kernel;
pub mod partition;
pub mod permutation;
pub mod reference;
pub mod statistic;

// Re-exports for convenience
pub use detector::{
    DetectorConfig, DetectorMetadata, DetectorStatus, DriftPrediction, MmdDriftDetector,
    MmdResult, Preprocessor, SharedDetector,
};
pub use error::{MmdDriftError, Result};
pub use gram::{
    builder_for, ChunkedBuilder, ChunkedKernel, GroupKernelSums, GroupSums, InMemoryBuilder,
    KernelMatrix, KernelMatrixBuilder, MAX_BLOCK_BYTES,
};
pub use kernel::{
    median_heuristic, median_heuristic_blocked, pairwise_sq_distances, BandwidthAggregation,
    GaussianRbf, Kernel, KernelFunction, RbfConfig,
};
pub use partition::Partition;
pub use permutation::{
    NullDistribution, PValueConvention, PermutationConfig, PermutationOutcome, PermutationTest,
};
pub use reference::{ReferenceSetManager, ReferenceState, UpdatePolicy};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports.
pub mod prelude {
    //! Convenient imports for common use cases.
    pub use crate::detector::{DetectorConfig, DriftPrediction, MmdDriftDetector, SharedDetector};
    pub use crate::error::{MmdDriftError, Result};
    pub use crate::kernel::{GaussianRbf, Kernel, KernelFunction, RbfConfig};
    pub use crate::permutation::{PermutationConfig, PermutationTest};
    pub use crate::reference::UpdatePolicy;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
