//! Image grids and rigid transforms in the shared physical frame.
//!
//! A [`Grid`] maps continuous voxel indices to world coordinates (mm) through
//! `origin + direction * (spacing ∘ index)`. Flat indices follow the standard
//! (row-major) layout of `ndarray::Array3`, i.e. the last axis is fastest.

use nalgebra::{Isometry3, Matrix3, Point3, Rotation3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SrrError};

const ORTHONORMAL_TOL: f64 = 1e-6;

/// Regular sampling grid placed in world coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    pub shape: [usize; 3],
    pub origin: Vector3<f64>,
    pub spacing: Vector3<f64>,
    /// Columns are the world directions of the index axes.
    pub direction: Matrix3<f64>,
}

impl Grid {
    /// Build a grid, rejecting degenerate spacing or a non-orthonormal direction.
    pub fn new(
        shape: [usize; 3],
        origin: Vector3<f64>,
        spacing: Vector3<f64>,
        direction: Matrix3<f64>,
    ) -> Result<Self> {
        if shape.iter().any(|&n| n == 0) {
            return Err(SrrError::geometry(format!("grid shape {shape:?} has an empty axis")));
        }
        if spacing.iter().any(|&s| !(s.is_finite() && s > 0.0)) {
            return Err(SrrError::geometry(format!(
                "grid spacing {:?} must be finite and positive",
                spacing.as_slice()
            )));
        }
        let gram = direction.transpose() * direction;
        if (gram - Matrix3::identity()).abs().max() > ORTHONORMAL_TOL {
            return Err(SrrError::geometry("grid direction matrix is not orthonormal"));
        }
        Ok(Self {
            shape,
            origin,
            spacing,
            direction,
        })
    }

    /// Axis-aligned isotropic grid.
    pub fn isotropic(shape: [usize; 3], origin: Vector3<f64>, spacing: f64) -> Result<Self> {
        Self::new(
            shape,
            origin,
            Vector3::repeat(spacing),
            Matrix3::identity(),
        )
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_isotropic(&self) -> bool {
        let s = self.spacing;
        (s.x - s.y).abs() <= 1e-9 * s.x && (s.x - s.z).abs() <= 1e-9 * s.x
    }

    /// Continuous index → world position.
    pub fn index_to_world(&self, index: &Vector3<f64>) -> Vector3<f64> {
        self.origin + self.direction * self.spacing.component_mul(index)
    }

    /// World position → continuous index.
    pub fn world_to_index(&self, point: &Vector3<f64>) -> Vector3<f64> {
        (self.direction.transpose() * (point - self.origin)).component_div(&self.spacing)
    }

    /// Linear map taking world-frame vectors to index-frame vectors.
    pub fn world_to_index_linear(&self) -> Matrix3<f64> {
        Matrix3::from_diagonal(&self.spacing.map(|s| 1.0 / s)) * self.direction.transpose()
    }

    #[inline]
    pub fn flat_index(&self, i: usize, j: usize, k: usize) -> usize {
        (i * self.shape[1] + j) * self.shape[2] + k
    }

    #[inline]
    pub fn unflatten(&self, flat: usize) -> [usize; 3] {
        let k = flat % self.shape[2];
        let rest = flat / self.shape[2];
        [rest / self.shape[1], rest % self.shape[1], k]
    }

    /// Whether a continuous index lies within the voxel footprint of the grid.
    pub fn contains_index(&self, index: &Vector3<f64>) -> bool {
        (0..3).all(|a| index[a] >= -0.5 && index[a] <= self.shape[a] as f64 - 0.5)
    }

    /// World positions of the eight outer voxel-edge corners.
    pub fn edge_corners(&self) -> Vec<Vector3<f64>> {
        let mut corners = Vec::with_capacity(8);
        for &ci in &[-0.5, self.shape[0] as f64 - 0.5] {
            for &cj in &[-0.5, self.shape[1] as f64 - 0.5] {
                for &ck in &[-0.5, self.shape[2] as f64 - 0.5] {
                    corners.push(self.index_to_world(&Vector3::new(ci, cj, ck)));
                }
            }
        }
        corners
    }

    /// Axis-aligned isotropic grid covering the given world points.
    pub fn covering(points: &[Vector3<f64>], spacing: f64) -> Result<Self> {
        if points.is_empty() {
            return Err(SrrError::geometry("cannot build a grid around zero points"));
        }
        if !(spacing.is_finite() && spacing > 0.0) {
            return Err(SrrError::invalid_configuration(format!(
                "resolution {spacing} must be finite and positive"
            )));
        }
        let mut lo = Vector3::repeat(f64::INFINITY);
        let mut hi = Vector3::repeat(f64::NEG_INFINITY);
        for p in points {
            lo = lo.inf(p);
            hi = hi.sup(p);
        }
        let mut shape = [1usize; 3];
        for a in 0..3 {
            // Shave rounding noise so exact multiples do not gain a voxel.
            let extent = (hi[a] - lo[a]) / spacing;
            shape[a] = ((extent - 1e-9).ceil() as usize).max(1);
        }
        Self::isotropic(shape, lo + Vector3::repeat(0.5 * spacing), spacing)
    }

    /// Same physical extent and orientation sampled at a new isotropic spacing.
    pub fn resampled(&self, spacing: f64) -> Result<Self> {
        if !(spacing.is_finite() && spacing > 0.0) {
            return Err(SrrError::invalid_configuration(format!(
                "resolution {spacing} must be finite and positive"
            )));
        }
        let mut shape = [1usize; 3];
        let mut offset = Vector3::zeros();
        for a in 0..3 {
            let extent = self.shape[a] as f64 * self.spacing[a] / spacing;
            shape[a] = ((extent - 1e-9).ceil() as usize).max(1);
            offset[a] = 0.5 * (spacing - self.spacing[a]);
        }
        Self::new(
            shape,
            self.origin + self.direction * offset,
            Vector3::repeat(spacing),
            self.direction,
        )
    }

    /// Geometric equality within a small tolerance.
    pub fn same_geometry(&self, other: &Grid) -> bool {
        self.shape == other.shape
            && (self.origin - other.origin).abs().max() < 1e-6
            && (self.spacing - other.spacing).abs().max() < 1e-9
            && (self.direction - other.direction).abs().max() < 1e-9
    }
}

/// Euler-angle parameterisation of a rigid transform.
///
/// Angles are in radians and follow nalgebra's roll/pitch/yaw convention
/// (`R = Rz(yaw) * Ry(pitch) * Rx(roll)`); translation is in mm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RigidParameters {
    pub rotation: [f64; 3],
    pub translation: [f64; 3],
}

/// Rigid transform in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "RigidParameters", into = "RigidParameters")]
pub struct RigidTransform {
    isometry: Isometry3<f64>,
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl RigidTransform {
    pub fn identity() -> Self {
        Self {
            isometry: Isometry3::identity(),
        }
    }

    pub fn from_parameters(params: &RigidParameters) -> Self {
        let [roll, pitch, yaw] = params.rotation;
        let [tx, ty, tz] = params.translation;
        let rotation = Rotation3::from_euler_angles(roll, pitch, yaw);
        Self {
            isometry: Isometry3::from_parts(
                Translation3::new(tx, ty, tz),
                UnitQuaternion::from_rotation_matrix(&rotation),
            ),
        }
    }

    pub fn parameters(&self) -> RigidParameters {
        let (roll, pitch, yaw) = self.isometry.rotation.euler_angles();
        let t = self.isometry.translation.vector;
        RigidParameters {
            rotation: [roll, pitch, yaw],
            translation: [t.x, t.y, t.z],
        }
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.isometry.rotation.to_rotation_matrix().into_inner()
    }

    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.isometry.transform_point(&Point3::from(*point)).coords
    }

    /// `self ∘ other`: apply `other` first.
    pub fn compose(&self, other: &RigidTransform) -> Self {
        Self {
            isometry: self.isometry * other.isometry,
        }
    }

    pub fn inverse(&self) -> Self {
        Self {
            isometry: self.isometry.inverse(),
        }
    }

    /// Rotation by `params.rotation` about `center`, followed by
    /// `params.translation`.
    pub fn about_point(params: &RigidParameters, center: &Vector3<f64>) -> Self {
        let rotation_only = Self::from_parameters(&RigidParameters {
            rotation: params.rotation,
            translation: [0.0; 3],
        });
        let shift = center - rotation_only.rotation_matrix() * center
            + Vector3::from(params.translation);
        Self::from_parameters(&RigidParameters {
            rotation: params.rotation,
            translation: [shift.x, shift.y, shift.z],
        })
    }
}

impl From<RigidParameters> for RigidTransform {
    fn from(params: RigidParameters) -> Self {
        Self::from_parameters(&params)
    }
}

impl From<RigidTransform> for RigidParameters {
    fn from(transform: RigidTransform) -> Self {
        transform.parameters()
    }
}
