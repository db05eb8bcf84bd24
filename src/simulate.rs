//! Synthetic acquisitions.
//!
//! Stacks are simulated by pushing a known volume through the acquisition
//! model, optionally with per-slice rigid motion and Gaussian noise. The
//! returned stacks carry identity transforms; the motion that produced them is
//! returned separately so registration results can be checked against it.

use std::str::FromStr;

use log::info;
use nalgebra::{Matrix3, Vector3};
use ndarray::{Array3, Axis};
use ndarray_rand::rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SrrError};
use crate::geometry::{Grid, RigidParameters, RigidTransform};
use crate::operator::{AcquisitionOperator, OperatorContext};
use crate::psf::Psf;
use crate::stack::{Stack, StackGeometry};
use crate::volume::Volume;

/// Slice plane relative to the world axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    /// Slices normal to z.
    Axial,
    /// Slices normal to y.
    Coronal,
    /// Slices normal to x.
    Sagittal,
}

impl Orientation {
    pub const ALL: [Orientation; 3] = [
        Orientation::Axial,
        Orientation::Coronal,
        Orientation::Sagittal,
    ];

    /// Columns: in-plane x, in-plane y, slice normal. Always right-handed.
    pub fn direction(&self) -> Matrix3<f64> {
        let (x, y, n) = match self {
            Orientation::Axial => (Vector3::x(), Vector3::y(), Vector3::z()),
            Orientation::Coronal => (Vector3::x(), Vector3::z(), -Vector3::y()),
            Orientation::Sagittal => (Vector3::y(), Vector3::z(), Vector3::x()),
        };
        Matrix3::from_columns(&[x, y, n])
    }

    pub fn name(&self) -> &'static str {
        match self {
            Orientation::Axial => "axial",
            Orientation::Coronal => "coronal",
            Orientation::Sagittal => "sagittal",
        }
    }
}

impl FromStr for Orientation {
    type Err = SrrError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "axial" => Ok(Orientation::Axial),
            "coronal" => Ok(Orientation::Coronal),
            "sagittal" => Ok(Orientation::Sagittal),
            other => Err(SrrError::invalid_configuration(format!(
                "unknown orientation '{other}'"
            ))),
        }
    }
}

/// Bounds of the uniform per-slice motion draw.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionAmplitude {
    /// Maximum absolute Euler angle, radians.
    pub rotation: f64,
    /// Maximum absolute translation per axis, mm.
    pub translation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionProtocol {
    pub orientation: Orientation,
    pub in_plane_spacing: f64,
    pub thickness: f64,
    /// Defaults to the Gaussian PSF derived from the spacing.
    pub psf: Option<Psf>,
    /// Standard deviation of additive Gaussian noise.
    pub noise_sigma: f64,
    pub seed: u64,
    pub motion: Option<MotionAmplitude>,
}

impl AcquisitionProtocol {
    pub fn new(orientation: Orientation, in_plane_spacing: f64, thickness: f64) -> Self {
        Self {
            orientation,
            in_plane_spacing,
            thickness,
            psf: None,
            noise_sigma: 0.0,
            seed: 0,
            motion: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(self.in_plane_spacing) || !positive(self.thickness) {
            return Err(SrrError::invalid_configuration(format!(
                "slice spacing ({}, thickness {}) must be positive",
                self.in_plane_spacing, self.thickness
            )));
        }
        if !(self.noise_sigma.is_finite() && self.noise_sigma >= 0.0) {
            return Err(SrrError::invalid_configuration(format!(
                "noise sigma {} must be non-negative",
                self.noise_sigma
            )));
        }
        if let Some(m) = self.motion {
            let bounded = |v: f64| v.is_finite() && v >= 0.0;
            if !(bounded(m.rotation) && bounded(m.translation)) {
                return Err(SrrError::invalid_configuration(format!(
                    "motion amplitudes ({}, {}) must be finite and non-negative",
                    m.rotation, m.translation
                )));
            }
        }
        if let Some(psf) = &self.psf {
            psf.validate()?;
        }
        Ok(())
    }

    /// Stack geometry tiling the footprint of `grid`, and the image array
    /// shape `(n_slices, nx, ny)`.
    pub fn stack_geometry(&self, grid: &Grid) -> (StackGeometry, (usize, usize, usize)) {
        let direction = self.orientation.direction();
        let spacing = Vector3::new(self.in_plane_spacing, self.in_plane_spacing, self.thickness);
        let mut lo = Vector3::repeat(f64::INFINITY);
        let mut hi = Vector3::repeat(f64::NEG_INFINITY);
        for p in grid.edge_corners() {
            let local = direction.transpose() * p;
            lo = lo.inf(&local);
            hi = hi.sup(&local);
        }
        let count = |a: usize| (((hi[a] - lo[a]) / spacing[a] - 1e-9).ceil() as usize).max(1);
        let geometry = StackGeometry {
            origin: direction * (lo + spacing * 0.5),
            spacing,
            direction,
            slice_step: None,
            psf: self.psf,
        };
        (geometry, (count(2), count(0), count(1)))
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedStack {
    pub stack: Stack,
    /// Motion applied to each slice during acquisition.
    pub motion: Vec<RigidTransform>,
}

/// Acquire one stack of `volume` under `protocol`.
pub fn simulate_stack(
    volume: &Volume,
    protocol: &AcquisitionProtocol,
    ctx: OperatorContext,
) -> Result<SimulatedStack> {
    protocol.validate()?;
    let name = protocol.orientation.name();
    let (geometry, (n, nx, ny)) = protocol.stack_geometry(volume.grid());
    let mut stack = Stack::from_arrays(name, &Array3::zeros((n, nx, ny)), None, &geometry)?;

    let mut rng = StdRng::seed_from_u64(protocol.seed);
    let motion: Vec<RigidTransform> = match protocol.motion {
        None => vec![RigidTransform::identity(); n],
        Some(amp) => stack
            .slices()
            .iter()
            .map(|slice| {
                let mut draw = |a: f64| rng.gen_range(-a..=a);
                let params = RigidParameters {
                    rotation: [draw(amp.rotation), draw(amp.rotation), draw(amp.rotation)],
                    translation: [
                        draw(amp.translation),
                        draw(amp.translation),
                        draw(amp.translation),
                    ],
                };
                let centre = slice.grid().index_to_world(&Vector3::new(
                    (nx as f64 - 1.0) / 2.0,
                    (ny as f64 - 1.0) / 2.0,
                    0.0,
                ));
                RigidTransform::about_point(&params, &centre)
            })
            .collect(),
    };
    stack.set_transforms(&motion)?;

    let mut images = Array3::<f32>::zeros((n, nx, ny));
    {
        let op = AcquisitionOperator::new(volume.grid(), std::slice::from_ref(&stack), ctx)?;
        for (k, predicted) in op.forward(volume)?.iter().enumerate() {
            images
                .index_axis_mut(Axis(0), k)
                .assign(&predicted.mapv(|v| v as f32));
        }
    }
    if protocol.noise_sigma > 0.0 {
        let normal = Normal::new(0.0f32, protocol.noise_sigma as f32)
            .map_err(|e| SrrError::invalid_configuration(e.to_string()))?;
        images += &Array3::random_using((n, nx, ny), normal, &mut rng);
    }

    info!(
        "simulated {name} stack: {n} slices of {nx}x{ny}, thickness {} mm, noise sigma {}",
        protocol.thickness, protocol.noise_sigma
    );
    Ok(SimulatedStack {
        stack: Stack::from_arrays(name, &images, None, &geometry)?,
        motion,
    })
}

/// Smooth test object: overlapping Gaussian blobs inside the grid footprint,
/// zero-valued towards the borders.
pub fn phantom(grid: &Grid) -> Result<Volume> {
    // (centre in [-1, 1]³ index box coordinates, width, amplitude)
    const BLOBS: [([f64; 3], f64, f64); 4] = [
        ([0.0, 0.0, 0.0], 0.4, 1.0),
        ([0.35, 0.2, -0.1], 0.2, 0.8),
        ([-0.3, -0.25, 0.2], 0.18, -0.5),
        ([0.1, -0.35, -0.3], 0.15, 0.6),
    ];
    let [nx, ny, nz] = grid.shape;
    let unit = |i: usize, n: usize| {
        if n > 1 {
            2.0 * i as f64 / (n - 1) as f64 - 1.0
        } else {
            0.0
        }
    };
    let data = Array3::from_shape_fn((nx, ny, nz), |(i, j, k)| {
        let u = [unit(i, nx), unit(j, ny), unit(k, nz)];
        BLOBS
            .iter()
            .map(|(c, w, amp)| {
                let d2: f64 = (0..3).map(|a| (u[a] - c[a]).powi(2)).sum();
                amp * (-d2 / (2.0 * w * w)).exp()
            })
            .sum::<f64>() as f32
    });
    Volume::from_array(data, grid)
}

/// Volume of uniform noise in `[0, 1)`.
pub fn random_volume(grid: &Grid, seed: u64) -> Result<Volume> {
    let [nx, ny, nz] = grid.shape;
    let mut rng = StdRng::seed_from_u64(seed);
    let data = Array3::random_using((nx, ny, nz), Uniform::new(0.0f32, 1.0), &mut rng);
    Volume::from_array(data, grid)
}
