//! Reference sample maintenance for streaming detection.
//!
//! After each detection call the reference sample can be refreshed with the
//! batch that was just tested:
//!
//! - [`UpdatePolicy::Last`] keeps a trailing window of the N most recent instances.
//! - [`UpdatePolicy::ReservoirSampling`] keeps a uniform sample of size N over the
//!   whole stream seen so far (Vitter's Algorithm R). The initial reference is the
//!   stream prefix.
//!
//! Both keep memory bounded at N rows regardless of stream length.

use ndarray::{concatenate, s, Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{MmdDriftError, Result};

/// How the reference sample evolves after each detection call.
///
/// Serializes as `"none"`, `{"last": N}` or `{"reservoir_sampling": N}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    /// The reference never changes after initialization.
    #[default]
    None,
    /// Keep the N most recent instances.
    Last(usize),
    /// Keep a uniform random sample of N instances over the full stream.
    ReservoirSampling(usize),
}

impl UpdatePolicy {
    /// Validate the policy.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Last(n) | Self::ReservoirSampling(n) if *n < 2 => Err(
                MmdDriftError::invalid_parameter("update_policy", "capacity must be at least 2"),
            ),
            _ => Ok(()),
        }
    }

    /// Maximum number of reference rows kept, if bounded.
    pub fn capacity(&self) -> Option<usize> {
        match self {
            Self::None => None,
            Self::Last(n) | Self::ReservoirSampling(n) => Some(*n),
        }
    }
}

/// The current reference sample and stream bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct ReferenceState {
    data: Array2<f64>,
    /// Instances seen so far, including the initial reference.
    n_seen: usize,
}

impl ReferenceState {
    /// The reference rows.
    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    /// Borrowed view of the reference rows.
    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    /// Number of reference rows.
    pub fn len(&self) -> usize {
        self.data.nrows()
    }

    /// Whether the reference is empty.
    pub fn is_empty(&self) -> bool {
        self.data.nrows() == 0
    }

    /// Feature dimension of the stored rows.
    pub fn dim(&self) -> usize {
        self.data.ncols()
    }

    /// Total instances seen, including the initial reference.
    pub fn n_seen(&self) -> usize {
        self.n_seen
    }
}

/// Applies an [`UpdatePolicy`] to a [`ReferenceState`].
#[derive(Debug, Clone)]
pub struct ReferenceSetManager {
    policy: UpdatePolicy,
    rng: StdRng,
}

impl ReferenceSetManager {
    /// Create a manager. The seed only matters for reservoir sampling.
    pub fn new(policy: UpdatePolicy, seed: Option<u64>) -> Result<Self> {
        policy.validate()?;
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self { policy, rng })
    }

    /// The configured policy.
    pub fn policy(&self) -> UpdatePolicy {
        self.policy
    }

    /// Build the initial state, streaming `data` through the policy as the stream prefix.
    pub fn initialize(&mut self, data: Array2<f64>) -> Result<ReferenceState> {
        let empty = ReferenceState {
            data: Array2::zeros((0, data.ncols())),
            n_seen: 0,
        };
        let state = match self.policy {
            UpdatePolicy::None => ReferenceState {
                n_seen: data.nrows(),
                data,
            },
            _ => self.update(empty, data.view())?,
        };

        if let Some(capacity) = self.policy.capacity() {
            if state.n_seen > capacity {
                info!(
                    "Initial reference of {} instances reduced to {} by {:?}",
                    state.n_seen,
                    state.len(),
                    self.policy
                );
            }
        }
        Ok(state)
    }

    /// Fold `batch` into the reference according to the policy.
    pub fn update(&mut self, state: ReferenceState, batch: ArrayView2<'_, f64>) -> Result<ReferenceState> {
        if batch.ncols() != state.dim() {
            return Err(MmdDriftError::dimension_mismatch(state.dim(), batch.ncols()));
        }

        let updated = match self.policy {
            UpdatePolicy::None => ReferenceState {
                n_seen: state.n_seen + batch.nrows(),
                data: state.data,
            },
            UpdatePolicy::Last(capacity) => last_window(state, batch, capacity)?,
            UpdatePolicy::ReservoirSampling(capacity) => self.reservoir(state, batch, capacity)?,
        };

        debug!(
            reference = updated.len(),
            seen = updated.n_seen,
            batch = batch.nrows(),
            "Reference updated"
        );
        Ok(updated)
    }

    fn reservoir(
        &mut self,
        state: ReferenceState,
        batch: ArrayView2<'_, f64>,
        capacity: usize,
    ) -> Result<ReferenceState> {
        let ReferenceState { mut data, mut n_seen } = state;

        let fill = capacity.saturating_sub(data.nrows()).min(batch.nrows());
        if fill > 0 {
            data = concatenate(Axis(0), &[data.view(), batch.slice(s![..fill, ..])])
                .map_err(|e| MmdDriftError::numerical(e.to_string()))?;
            n_seen += fill;
        }

        for row in batch.slice(s![fill.., ..]).outer_iter() {
            n_seen += 1;
            let slot = self.rng.gen_range(0..n_seen);
            if slot < capacity {
                data.row_mut(slot).assign(&row);
            }
        }

        Ok(ReferenceState { data, n_seen })
    }
}

fn last_window(state: ReferenceState, batch: ArrayView2<'_, f64>, capacity: usize) -> Result<ReferenceState> {
    let n_seen = state.n_seen + batch.nrows();
    let joined = concatenate(Axis(0), &[state.data.view(), batch.view()])
        .map_err(|e| MmdDriftError::numerical(e.to_string()))?;
    let start = joined.nrows().saturating_sub(capacity);
    let data = if start == 0 {
        joined
    } else {
        joined.slice(s![start.., ..]).to_owned()
    };
    Ok(ReferenceState { data, n_seen })
}
