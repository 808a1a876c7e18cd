//! Error types for MMD drift detection.
//!
//! Errors fall into two families. Invalid-input errors are caller configuration
//! mistakes (too few samples, mismatched feature dimensions, bad parameters) and
//! are never worth retrying. Resource errors come from the memory-bounded kernel
//! path and mean the caller should lower the block size.

use thiserror::Error;

/// Result type alias for drift detection operations.
pub type Result<T> = std::result::Result<T, MmdDriftError>;

/// Errors that can occur while building kernels, testing, or updating the reference.
#[derive(Error, Debug, Clone)]
pub enum MmdDriftError {
    /// Dimension mismatch between vectors or matrices.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected dimension.
        expected: usize,
        /// Actual dimension encountered.
        actual: usize,
    },

    /// Sample size is too small for the unbiased estimator.
    #[error("Insufficient samples: need at least {minimum}, got {actual}")]
    InsufficientSamples {
        /// Minimum required samples.
        minimum: usize,
        /// Actual number of samples.
        actual: usize,
    },

    /// Invalid parameter value provided.
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter {
        /// Parameter name.
        name: String,
        /// Reason why the parameter is invalid.
        reason: String,
    },

    /// A kernel block does not fit the memory ceiling.
    #[error("Resource limit exceeded: {0}")]
    ResourceExhausted(String),

    /// Numerical computation error (NaN or infinite values in the input).
    #[error("Numerical error: {0}")]
    NumericalError(String),

    /// The preprocessing hook failed to transform a sample.
    #[error("Preprocessing failed: {0}")]
    PreprocessError(String),
}

impl MmdDriftError {
    /// Create a dimension mismatch error.
    pub fn dimension_mismatch(expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch { expected, actual }
    }

    /// Create an insufficient samples error.
    pub fn insufficient_samples(minimum: usize, actual: usize) -> Self {
        Self::InsufficientSamples { minimum, actual }
    }

    /// Create an invalid parameter error.
    pub fn invalid_parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a resource error.
    pub fn resource(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Create a numerical error.
    pub fn numerical(msg: impl Into<String>) -> Self {
        Self::NumericalError(msg.into())
    }

    /// Create a preprocessing error.
    pub fn preprocess(msg: impl Into<String>) -> Self {
        Self::PreprocessError(msg.into())
    }

    /// Whether this error is a caller configuration or input mistake.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Self::DimensionMismatch { .. }
                | Self::InsufficientSamples { .. }
                | Self::InvalidParameter { .. }
                | Self::NumericalError(_)
        )
    }

    /// Whether this error signals that the block size should be lowered.
    pub fn is_resource(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MmdDriftError::dimension_mismatch(128, 64);
        assert!(err.to_string().contains("128"));
        assert!(err.to_string().contains("64"));

        let err = MmdDriftError::insufficient_samples(2, 1);
        assert!(err.to_string().contains("at least 2"));

        let err = MmdDriftError::invalid_parameter("sigma", "must be positive");
        assert!(err.to_string().contains("sigma"));
        assert!(err.to_string().contains("positive"));
    }

    #[test]
    fn test_error_classification() {
        assert!(MmdDriftError::insufficient_samples(2, 1).is_invalid_input());
        assert!(MmdDriftError::invalid_parameter("block_size", "zero").is_invalid_input());
        assert!(!MmdDriftError::resource("block too large").is_invalid_input());
        assert!(MmdDriftError::resource("block too large").is_resource());
        assert!(!MmdDriftError::preprocess("encoder down").is_resource());
    }

    #[test]
    fn test_error_clone() {
        let err = MmdDriftError::numerical("NaN in batch");
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }
}
