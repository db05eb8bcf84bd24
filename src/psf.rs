//! Point-spread functions of the slice acquisition.
//!
//! A [`Psf`] is described in slice-local coordinates (in-plane x, in-plane y,
//! through-plane). [`OrientedKernel`] is the same PSF expressed in the index
//! frame of the reconstruction grid for one slice pose; it produces the
//! interpolation weights shared by the forward and adjoint operators.
//!
//! [`DeconvolutionMode`] selects which part of the slice PSF the operator
//! models: the full 3D blur, the in-plane blur only (the through-plane
//! profile collapses to one trilinear sample in the slice plane), or a fixed
//! FWHM that replaces every Gaussian slice PSF.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SrrError};
use crate::geometry::{Grid, RigidTransform};

/// In-plane FWHM relative to the in-plane pixel spacing.
pub const IN_PLANE_FWHM_FACTOR: f64 = 1.2;

/// Largest step between in-plane quadrature samples, in voxels.
const IN_PLANE_SAMPLE_STEP: f64 = 0.5;

/// Part of the slice PSF deconvolved by the reconstruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DeconvolutionMode {
    #[default]
    Full3d,
    /// Blur within the slice plane only; no through-plane extent.
    OnlyInPlane,
    /// One Gaussian FWHM (slice-local axes, mm) for every Gaussian slice PSF.
    PredefinedCovariance { fwhm: [f64; 3] },
}

impl DeconvolutionMode {
    pub fn validate(&self) -> Result<()> {
        match self {
            DeconvolutionMode::PredefinedCovariance { fwhm } => Psf::gaussian(*fwhm).validate(),
            _ => Ok(()),
        }
    }
}

/// Kernel shape used to sample the volume at a slice pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PsfKernel {
    /// Oriented anisotropic Gaussian truncated at `cutoff` standard deviations.
    Gaussian,
    /// Trilinear interpolation at the pixel centre (no blur).
    Trilinear,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Psf {
    pub kernel: PsfKernel,
    /// Full width at half maximum along the slice-local axes, in mm.
    pub fwhm: [f64; 3],
}

impl Psf {
    pub fn gaussian(fwhm: [f64; 3]) -> Self {
        Self {
            kernel: PsfKernel::Gaussian,
            fwhm,
        }
    }

    /// Gaussian PSF derived from the acquisition spacing `[sx, sy, thickness]`.
    pub fn from_slice_spacing(spacing: &Vector3<f64>) -> Self {
        Self::gaussian([
            IN_PLANE_FWHM_FACTOR * spacing.x,
            IN_PLANE_FWHM_FACTOR * spacing.y,
            spacing.z,
        ])
    }

    pub fn trilinear() -> Self {
        Self {
            kernel: PsfKernel::Trilinear,
            fwhm: [0.0; 3],
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.kernel == PsfKernel::Gaussian
            && self.fwhm.iter().any(|&w| !(w.is_finite() && w > 0.0))
        {
            return Err(SrrError::invalid_configuration(format!(
                "Gaussian PSF FWHM {:?} must be finite and positive",
                self.fwhm
            )));
        }
        Ok(())
    }

    /// Covariance in slice-local coordinates (mm²).
    pub fn local_covariance(&self) -> Matrix3<f64> {
        let scale = 8.0 * std::f64::consts::LN_2;
        Matrix3::from_diagonal(&Vector3::from(self.fwhm).map(|w| w * w / scale))
    }

    /// Express this PSF in the index frame of `volume` for a slice whose local
    /// axes are `slice_direction` after applying `transform`.
    pub fn orient(
        &self,
        volume: &Grid,
        slice_direction: &Matrix3<f64>,
        transform: &RigidTransform,
        cutoff: f64,
        mode: DeconvolutionMode,
    ) -> Result<OrientedKernel> {
        if self.kernel == PsfKernel::Trilinear {
            return Ok(OrientedKernel::Trilinear);
        }
        let r = transform.rotation_matrix() * slice_direction;
        let l = volume.world_to_index_linear();
        match mode {
            DeconvolutionMode::Full3d => gaussian_kernel(self, &r, &l, cutoff),
            DeconvolutionMode::PredefinedCovariance { fwhm } => {
                let psf = Psf::gaussian(fwhm);
                psf.validate()?;
                gaussian_kernel(&psf, &r, &l, cutoff)
            }
            DeconvolutionMode::OnlyInPlane => {
                let step = IN_PLANE_SAMPLE_STEP * volume.spacing.min();
                let sigma = self.local_covariance().map(f64::sqrt);
                let offsets = |a: usize| {
                    let reach = cutoff * sigma[(a, a)];
                    let n = (reach / step).ceil().max(1.0) as i64;
                    let axis = l * r.column(a);
                    (-n..=n)
                        .map(|m| {
                            let u = reach * m as f64 / n as f64;
                            (axis * u, (-0.5 * (u / sigma[(a, a)]).powi(2)).exp())
                        })
                        .collect::<Vec<_>>()
                };
                let (along_x, along_y) = (offsets(0), offsets(1));
                let mut samples = Vec::with_capacity(along_x.len() * along_y.len());
                for (dx, wx) in &along_x {
                    for (dy, wy) in &along_y {
                        samples.push((dx + dy, wx * wy));
                    }
                }
                let total: f64 = samples.iter().map(|(_, w)| w).sum();
                for (_, w) in samples.iter_mut() {
                    *w /= total;
                }
                Ok(OrientedKernel::InPlane { samples })
            }
        }
    }
}

fn gaussian_kernel(
    psf: &Psf,
    r: &Matrix3<f64>,
    l: &Matrix3<f64>,
    cutoff: f64,
) -> Result<OrientedKernel> {
    let world_cov = r * psf.local_covariance() * r.transpose();
    let cov = l * world_cov * l.transpose();
    let precision = cov
        .try_inverse()
        .ok_or_else(|| SrrError::geometry("PSF covariance is singular in the volume frame"))?;
    let half_width = Vector3::new(cov[(0, 0)], cov[(1, 1)], cov[(2, 2)]).map(|v| cutoff * v.sqrt());
    Ok(OrientedKernel::Gaussian {
        precision,
        half_width,
    })
}

/// PSF in volume index units for one slice pose.
#[derive(Debug, Clone)]
pub enum OrientedKernel {
    Gaussian {
        precision: Matrix3<f64>,
        /// Box support half widths in voxels.
        half_width: Vector3<f64>,
    },
    /// In-plane Gaussian quadrature: index offsets within the slice plane and
    /// their normalised weights, each sample spread trilinearly.
    InPlane { samples: Vec<(Vector3<f64>, f64)> },
    Trilinear,
}

impl OrientedKernel {
    /// Collect `(flat voxel index, weight)` pairs for a sample centred at the
    /// continuous index `q`. Out-of-grid voxels are dropped; Gaussian weights
    /// are normalised over the full support, so the grid acts as if padded
    /// with zeros. A voxel may appear more than once.
    pub fn weights(&self, grid: &Grid, q: &Vector3<f64>, out: &mut Vec<(usize, f64)>) {
        out.clear();
        match self {
            OrientedKernel::Trilinear => trilinear_weights(grid, q, out),
            OrientedKernel::Gaussian {
                precision,
                half_width,
            } => gaussian_weights(grid, q, precision, half_width, out),
            OrientedKernel::InPlane { samples } => {
                let mut corners = Vec::with_capacity(8);
                for (offset, w) in samples {
                    corners.clear();
                    trilinear_weights(grid, &(q + offset), &mut corners);
                    out.extend(corners.iter().map(|&(v, c)| (v, c * w)));
                }
            }
        }
    }
}

fn axis_range(center: f64, half: f64) -> (i64, i64) {
    ((center - half).ceil() as i64, (center + half).floor() as i64)
}

fn gaussian_weights(
    grid: &Grid,
    q: &Vector3<f64>,
    precision: &Matrix3<f64>,
    half_width: &Vector3<f64>,
    out: &mut Vec<(usize, f64)>,
) {
    let [nx, ny, nz] = grid.shape.map(|n| n as i64);
    let (i0, i1) = axis_range(q.x, half_width.x);
    let (j0, j1) = axis_range(q.y, half_width.y);
    let (k0, k1) = axis_range(q.z, half_width.z);

    let mut total = 0.0;
    for i in i0..=i1 {
        for j in j0..=j1 {
            for k in k0..=k1 {
                let d = Vector3::new(i as f64, j as f64, k as f64) - q;
                let w = (-0.5 * d.dot(&(precision * d))).exp();
                total += w;
                if (0..nx).contains(&i) && (0..ny).contains(&j) && (0..nz).contains(&k) {
                    out.push((grid.flat_index(i as usize, j as usize, k as usize), w));
                }
            }
        }
    }
    if total <= 0.0 {
        out.clear();
        return;
    }
    for (_, w) in out.iter_mut() {
        *w /= total;
    }
}

fn trilinear_weights(grid: &Grid, q: &Vector3<f64>, out: &mut Vec<(usize, f64)>) {
    let base = q.map(f64::floor);
    let frac = q - base;
    let shape = grid.shape.map(|n| n as i64);
    for corner in 0..8usize {
        let mut idx = [0usize; 3];
        let mut w = 1.0;
        let mut inside = true;
        for a in 0..3 {
            let upper = (corner >> a) & 1 == 1;
            let c = base[a] as i64 + upper as i64;
            w *= if upper { frac[a] } else { 1.0 - frac[a] };
            if c < 0 || c >= shape[a] {
                inside = false;
            } else {
                idx[a] = c as usize;
            }
        }
        if inside && w > 0.0 {
            out.push((grid.flat_index(idx[0], idx[1], idx[2]), w));
        }
    }
}
