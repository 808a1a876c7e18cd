//! MMD drift detector.
//!
//! This module wires the statistical components together:
//!
//! 1. **Kernel** - resolves the RBF bandwidth (median heuristic) or uses a user kernel.
//! 2. **Kernel matrix builder** - in-memory Gram matrix, or a block sweep when a
//!    block size is configured.
//! 3. **Permutation test** - observed MMD^2, p-value and distance threshold from
//!    the same pooled kernel.
//! 4. **Reference manager** - refreshes the reference sample after each prediction.
//!
//! # Usage
//!
//! ```ignore
//! use ruvector_mmd_drift::{DetectorConfig, MmdDriftDetector, UpdatePolicy};
//!
//! let config = DetectorConfig {
//!     update_policy: UpdatePolicy::Last(500),
//!     ..Default::default()
//! };
//! let mut detector = MmdDriftDetector::new(reference, config)?;
//!
//! for batch in batches {
//!     let prediction = detector.predict(&batch, true, true)?;
//!     if prediction.is_drift {
//!         println!("Drift: p = {:?}", prediction.p_value);
//!     }
//! }
//! ```

use ndarray::{concatenate, Array2, ArrayView2, Axis};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{MmdDriftError, Result};
use crate::gram::{builder_for, KernelMatrixBuilder};
use crate::kernel::{KernelFunction, RbfConfig};
use crate::permutation::{NullDistribution, PermutationConfig, PermutationOutcome, PermutationTest};
use crate::reference::{ReferenceSetManager, ReferenceState, UpdatePolicy};
use crate::statistic;

/// Mixed into the permutation seed to derive the reservoir sampling seed.
const RESERVOIR_SEED_SALT: u64 = 0x9E37_79B9_7F4A_7C15;

/// Maps raw instances (rows) to fixed-dimension feature vectors.
///
/// The transform must keep one output row per input row. Any configuration it
/// carries (batch size, model handle) is opaque to the detector. Closures of the
/// form `|raw: &Array2<f64>| -> Result<Array2<f64>> { .. }` implement it.
pub trait Preprocessor: Send + Sync {
    /// Transform raw rows into feature rows.
    fn transform(&self, raw: &Array2<f64>) -> Result<Array2<f64>>;
}

impl<F> Preprocessor for F
where
    F: Fn(&Array2<f64>) -> Result<Array2<f64>> + Send + Sync,
{
    fn transform(&self, raw: &Array2<f64>) -> Result<Array2<f64>> {
        self(raw)
    }
}

/// Configuration for the MMD drift detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// RBF kernel configuration; bandwidths are inferred when omitted.
    #[serde(default)]
    pub kernel: RbfConfig,
    /// Infer the bandwidth once from the reference at initialization instead of
    /// from the pooled sample at every prediction.
    #[serde(default)]
    pub configure_kernel_from_reference: bool,
    /// Permutation test configuration (B, alpha, seed, p-value convention).
    #[serde(default)]
    pub permutation: PermutationConfig,
    /// Reference update policy.
    #[serde(default)]
    pub update_policy: UpdatePolicy,
    /// Row block size for the memory-bounded kernel path (`None` for in-memory).
    #[serde(default)]
    pub block_size: Option<usize>,
    /// Apply the preprocessor to the reference once at initialization.
    #[serde(default = "default_preprocess_at_init")]
    pub preprocess_at_init: bool,
    /// Free-form data type tag attached to metadata.
    #[serde(default)]
    pub data_type: Option<String>,
}

fn default_preprocess_at_init() -> bool {
    true
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            kernel: RbfConfig::default(),
            configure_kernel_from_reference: false,
            permutation: PermutationConfig::default(),
            update_policy: UpdatePolicy::None,
            block_size: None,
            preprocess_at_init: true,
            data_type: None,
        }
    }
}

impl DetectorConfig {
    /// Fewer permutations, for quick checks on small batches.
    pub fn fast() -> Self {
        Self {
            permutation: PermutationConfig {
                n_permutations: 50,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// More permutations and a stricter significance level.
    pub fn high_precision() -> Self {
        Self {
            permutation: PermutationConfig {
                n_permutations: 1_000,
                alpha: 0.01,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.kernel.validate()?;
        self.permutation.validate()?;
        self.update_policy.validate()?;

        if self.block_size == Some(0) {
            return Err(MmdDriftError::invalid_parameter("block_size", "must be at least 1"));
        }

        Ok(())
    }
}

/// Statistical outcome of one test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MmdResult {
    /// Observed MMD^2; may be slightly negative.
    pub observed_statistic: f64,
    /// Permutation p-value in [0, 1].
    pub p_value: f64,
    /// Configured significance level alpha.
    pub significance_threshold: f64,
    /// MMD^2 at the upper-alpha quantile of the null distribution.
    pub distance_threshold: f64,
    /// Whether drift was detected (`p_value <= alpha`).
    pub is_drift: bool,
    /// Reference size used for the test.
    pub n_reference: usize,
    /// Batch size tested.
    pub n_test: usize,
    /// Permuted statistics.
    pub null_distribution: NullDistribution,
}

impl MmdResult {
    fn from_outcome(outcome: PermutationOutcome, n_reference: usize, n_test: usize) -> Self {
        Self {
            observed_statistic: outcome.observed,
            p_value: outcome.p_value,
            significance_threshold: outcome.alpha,
            distance_threshold: outcome.distance_threshold,
            is_drift: outcome.is_drift,
            n_reference,
            n_test,
            null_distribution: outcome.null_distribution,
        }
    }
}

/// Detector description attached to every prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorMetadata {
    /// Detector name.
    pub name: String,
    /// Detector family.
    pub detector_type: String,
    /// Whether the detector is a sequential (online) one.
    pub online: bool,
    /// Data type tag from the configuration.
    pub data_type: Option<String>,
    /// Kernel description.
    pub kernel: String,
    /// Whether the memory-bounded kernel path is active.
    pub chunked: bool,
    /// Crate version.
    pub version: String,
}

/// Result record returned by [`MmdDriftDetector::predict`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftPrediction {
    /// Drift decision.
    pub is_drift: bool,
    /// P-value, when requested.
    pub p_value: Option<f64>,
    /// Significance level alpha, returned alongside the p-value.
    pub significance_threshold: Option<f64>,
    /// Observed MMD^2, when requested.
    pub distance: Option<f64>,
    /// Distance threshold, returned alongside the distance.
    pub distance_threshold: Option<f64>,
    /// Detector metadata.
    pub meta: DetectorMetadata,
}

/// Snapshot of detector bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorStatus {
    /// Current reference size.
    pub n_reference: usize,
    /// Instances seen, including the initial reference.
    pub n_seen: usize,
    /// Successful predictions made.
    pub n_predictions: usize,
    /// Predictions that flagged drift.
    pub n_drifts: usize,
    /// Configured update policy.
    pub update_policy: UpdatePolicy,
}

/// Kernel two-sample drift detector over a maintained reference sample.
///
/// One detector serves one logical stream: [`predict`](Self::predict) reads the
/// reference, tests, then updates the reference, and takes `&mut self` so those
/// steps are never interleaved. Use [`SharedDetector`] to share across threads.
pub struct MmdDriftDetector {
    config: DetectorConfig,
    kernel: KernelFunction,
    builder: Arc<dyn KernelMatrixBuilder>,
    permutation: PermutationTest,
    manager: ReferenceSetManager,
    reference: ReferenceState,
    preprocessor: Option<Arc<dyn Preprocessor>>,
    /// Raw input dimension, taken from the initial reference.
    input_dim: usize,
    n_predictions: usize,
    n_drifts: usize,
}

impl MmdDriftDetector {
    /// Create a detector with the RBF kernel from `config` and no preprocessing.
    pub fn new(reference: Array2<f64>, config: DetectorConfig) -> Result<Self> {
        let kernel = KernelFunction::rbf(config.kernel.clone())?;
        Self::with_components(reference, config, kernel, None)
    }

    /// Create a detector with an explicit kernel choice and optional preprocessing hook.
    ///
    /// The `kernel` argument takes precedence over `config.kernel`. An RBF choice
    /// is written back into the stored configuration so it always describes the
    /// kernel in use. A custom kernel requires `config.kernel` to be left at its
    /// default; explicit RBF settings next to it are rejected.
    ///
    /// With `preprocess_at_init`, the hook is applied to the reference here, once.
    pub fn with_components(
        reference: Array2<f64>,
        mut config: DetectorConfig,
        kernel: KernelFunction,
        preprocessor: Option<Arc<dyn Preprocessor>>,
    ) -> Result<Self> {
        match &kernel {
            KernelFunction::Rbf(rbf) => config.kernel = rbf.clone(),
            KernelFunction::Custom(_) if config.kernel != RbfConfig::default() => {
                return Err(MmdDriftError::invalid_parameter(
                    "kernel",
                    "RBF settings cannot be combined with a custom kernel",
                ));
            }
            KernelFunction::Custom(_) => {}
        }
        config.validate()?;
        validate_sample(reference.view(), "reference")?;

        let input_dim = reference.ncols();
        let builder = builder_for(config.block_size)?;
        let permutation = PermutationTest::new(config.permutation.clone())?;
        let mut manager = ReferenceSetManager::new(
            config.update_policy,
            config.permutation.seed.map(|s| s ^ RESERVOIR_SEED_SALT),
        )?;

        let stored = match (&preprocessor, config.preprocess_at_init) {
            (Some(p), true) => transform_checked(p.as_ref(), &reference)?,
            _ => reference,
        };
        let reference = manager.initialize(stored)?;

        let kernel = if config.configure_kernel_from_reference && kernel.needs_inference() {
            let transformed;
            let features = match (&preprocessor, config.preprocess_at_init) {
                (Some(p), false) => {
                    transformed = transform_checked(p.as_ref(), reference.data())?;
                    transformed.view()
                }
                _ => reference.view(),
            };
            kernel.frozen(features, config.block_size)?
        } else {
            kernel
        };

        info!(
            "Initialized MMD detector: {} reference instances of dimension {}, kernel {}, policy {:?}",
            reference.len(),
            input_dim,
            kernel.describe(),
            config.update_policy
        );

        Ok(Self {
            config,
            kernel,
            builder,
            permutation,
            manager,
            reference,
            preprocessor,
            input_dim,
            n_predictions: 0,
            n_drifts: 0,
        })
    }

    /// Test `batch` against the current reference without updating it.
    pub fn score(&self, batch: &Array2<f64>) -> Result<MmdResult> {
        self.run_test(batch).map(|(result, _)| result)
    }

    /// Test `batch`, then fold it into the reference per the update policy.
    ///
    /// `return_p_val` adds the p-value and significance level to the prediction,
    /// `return_distance` adds the observed MMD^2 and its threshold. On error the
    /// reference is left untouched.
    pub fn predict(
        &mut self,
        batch: &Array2<f64>,
        return_p_val: bool,
        return_distance: bool,
    ) -> Result<DriftPrediction> {
        let (result, features) = self.run_test(batch)?;

        if self.manager.policy() != UpdatePolicy::None {
            let stored = match (&self.preprocessor, self.config.preprocess_at_init) {
                (Some(_), true) => features.view(),
                _ => batch.view(),
            };
            if stored.ncols() != self.reference.dim() {
                return Err(MmdDriftError::dimension_mismatch(self.reference.dim(), stored.ncols()));
            }
            // With matching dimensions the update cannot fail, so the state is moved out.
            let current = std::mem::take(&mut self.reference);
            self.reference = self.manager.update(current, stored)?;
        }

        self.n_predictions += 1;
        if result.is_drift {
            self.n_drifts += 1;
            warn!(
                "DRIFT DETECTED on prediction {} (p={:.6}, MMD^2={:.6}, threshold={:.6})",
                self.n_predictions, result.p_value, result.observed_statistic, result.distance_threshold
            );
        }

        Ok(DriftPrediction {
            is_drift: result.is_drift,
            p_value: return_p_val.then_some(result.p_value),
            significance_threshold: return_p_val.then_some(result.significance_threshold),
            distance: return_distance.then_some(result.observed_statistic),
            distance_threshold: return_distance.then_some(result.distance_threshold),
            meta: self.metadata(),
        })
    }

    /// Run one test; also returns the batch in feature space.
    fn run_test(&self, batch: &Array2<f64>) -> Result<(MmdResult, Array2<f64>)> {
        validate_sample(batch.view(), "batch")?;
        if batch.ncols() != self.input_dim {
            return Err(MmdDriftError::dimension_mismatch(self.input_dim, batch.ncols()));
        }

        let features = match &self.preprocessor {
            Some(p) => transform_checked(p.as_ref(), batch)?,
            None => batch.clone(),
        };

        let transformed_reference;
        let reference = match (&self.preprocessor, self.config.preprocess_at_init) {
            (Some(p), false) => {
                transformed_reference = transform_checked(p.as_ref(), self.reference.data())?;
                transformed_reference.view()
            }
            _ => self.reference.view(),
        };

        let (m, n) = (reference.nrows(), features.nrows());
        statistic::check_group_sizes(m, n)?;
        if reference.ncols() != features.ncols() {
            return Err(MmdDriftError::dimension_mismatch(reference.ncols(), features.ncols()));
        }

        let pooled = concatenate(Axis(0), &[reference, features.view()])
            .map_err(|e| MmdDriftError::numerical(e.to_string()))?;
        let kernel = self.kernel.bind(pooled.view(), self.config.block_size)?;
        let source = self.builder.build(pooled.view(), m, kernel)?;
        let outcome = self.permutation.run(source.as_ref())?;

        debug!(
            m,
            n,
            mmd2 = outcome.observed,
            p_value = outcome.p_value,
            threshold = outcome.distance_threshold,
            "MMD permutation test complete"
        );

        Ok((MmdResult::from_outcome(outcome, m, n), features))
    }

    /// Metadata attached to predictions.
    pub fn metadata(&self) -> DetectorMetadata {
        DetectorMetadata {
            name: "MMDDrift".to_string(),
            detector_type: "drift".to_string(),
            online: false,
            data_type: self.config.data_type.clone(),
            kernel: self.kernel.describe(),
            chunked: self.builder.is_chunked(),
            version: crate::VERSION.to_string(),
        }
    }

    /// Current reference state.
    pub fn reference(&self) -> &ReferenceState {
        &self.reference
    }

    /// The kernel choice in use (bandwidth frozen if configured from the reference).
    pub fn kernel(&self) -> &KernelFunction {
        &self.kernel
    }

    /// Get the configuration.
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Get bookkeeping status.
    pub fn status(&self) -> DetectorStatus {
        DetectorStatus {
            n_reference: self.reference.len(),
            n_seen: self.reference.n_seen(),
            n_predictions: self.n_predictions,
            n_drifts: self.n_drifts,
            update_policy: self.manager.policy(),
        }
    }
}

/// Thread-safe wrapper for the detector.
///
/// `predict` holds the write lock across read, test and update; `score` and
/// `status` only need the read lock.
pub struct SharedDetector(Arc<RwLock<MmdDriftDetector>>);

impl SharedDetector {
    /// Create a new shared detector.
    pub fn new(reference: Array2<f64>, config: DetectorConfig) -> Result<Self> {
        Ok(Self::from_detector(MmdDriftDetector::new(reference, config)?))
    }

    /// Wrap an existing detector.
    pub fn from_detector(detector: MmdDriftDetector) -> Self {
        Self(Arc::new(RwLock::new(detector)))
    }

    /// Test and update the reference.
    pub fn predict(
        &self,
        batch: &Array2<f64>,
        return_p_val: bool,
        return_distance: bool,
    ) -> Result<DriftPrediction> {
        self.0.write().predict(batch, return_p_val, return_distance)
    }

    /// Test without updating.
    pub fn score(&self, batch: &Array2<f64>) -> Result<MmdResult> {
        self.0.read().score(batch)
    }

    /// Get current status.
    pub fn status(&self) -> DetectorStatus {
        self.0.read().status()
    }
}

impl Clone for SharedDetector {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

fn validate_sample(sample: ArrayView2<'_, f64>, what: &str) -> Result<()> {
    if sample.nrows() < statistic::MIN_GROUP_SIZE {
        return Err(MmdDriftError::insufficient_samples(
            statistic::MIN_GROUP_SIZE,
            sample.nrows(),
        ));
    }
    if sample.iter().any(|v| !v.is_finite()) {
        return Err(MmdDriftError::numerical(format!("{what} contains NaN or infinite values")));
    }
    Ok(())
}

fn transform_checked(preprocessor: &dyn Preprocessor, raw: &Array2<f64>) -> Result<Array2<f64>> {
    let features = preprocessor.transform(raw)?;
    if features.nrows() != raw.nrows() {
        return Err(MmdDriftError::preprocess(format!(
            "transform returned {} rows for {} inputs",
            features.nrows(),
            raw.nrows()
        )));
    }
    if features.iter().any(|v| !v.is_finite()) {
        return Err(MmdDriftError::preprocess("transform produced NaN or infinite values"));
    }
    Ok(features)
}
