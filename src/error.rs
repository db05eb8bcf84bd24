//! Error types for reconstruction runs.
//!
//! Geometric and configuration problems are detected before any solve starts
//! and surface as errors. Running out of solver iterations is not an error; it
//! is reported through [`crate::solver::SolveReport`].

use thiserror::Error;

/// Main error type for the reconstruction core.
#[derive(Error, Debug)]
pub enum SrrError {
    /// Slice and volume frames are inconsistent.
    #[error("Geometry mismatch: {0}")]
    GeometryMismatch(String),

    /// Voxels with no contributing unmasked slice data.
    #[error(
        "Ill-posed region: {voxels} voxel(s) receive no slice data \
         (index bounds {lower:?}..={upper:?})"
    )]
    IllPosedRegion {
        voxels: usize,
        lower: [usize; 3],
        upper: [usize; 3],
    },

    /// The motion-correction driver failed or timed out.
    #[error("External driver failure: {0}")]
    ExternalDriverFailure(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Array shapes do not agree.
    #[error("Dimension mismatch: expected {expected:?}, got {actual:?}")]
    DimensionMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// The run was cancelled at a cycle boundary.
    #[error("Reconstruction cancelled after {completed_cycles} completed cycle(s)")]
    Cancelled { completed_cycles: usize },

    /// Reading or writing run artefacts failed.
    #[error("I/O error: {0}")]
    Io(String),
}

/// Result type for reconstruction operations.
pub type Result<T> = std::result::Result<T, SrrError>;

impl SrrError {
    /// Create a geometry mismatch error.
    pub fn geometry(msg: impl Into<String>) -> Self {
        Self::GeometryMismatch(msg.into())
    }

    /// Create an external driver failure.
    pub fn driver(msg: impl Into<String>) -> Self {
        Self::ExternalDriverFailure(msg.into())
    }

    /// Create an invalid configuration error.
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create an I/O error.
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    /// Shape mismatch between two n-d shapes.
    pub fn shape(expected: &[usize], actual: &[usize]) -> Self {
        Self::DimensionMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SrrError::geometry("slice 3 lies outside the volume");
        assert_eq!(
            err.to_string(),
            "Geometry mismatch: slice 3 lies outside the volume"
        );
    }

    #[test]
    fn test_ill_posed_region_reports_bounds() {
        let err = SrrError::IllPosedRegion {
            voxels: 4,
            lower: [0, 1, 2],
            upper: [1, 2, 3],
        };
        let msg = err.to_string();
        assert!(msg.contains("4 voxel(s)"));
        assert!(msg.contains("[0, 1, 2]"));
    }

    #[test]
    fn test_shape_mismatch() {
        let err = SrrError::shape(&[4, 4], &[4, 5]);
        assert!(matches!(err, SrrError::DimensionMismatch { .. }));
        assert!(err.to_string().contains("expected [4, 4]"));
    }
}
