//! Slice acquisition model.
//!
//! [`AcquisitionOperator`] maps a volume (flattened in grid order) to the
//! stacked intensities of all valid slice pixels, and back. Each row of the
//! implied system matrix holds the PSF weights of one pixel; forward and
//! adjoint share the same weight computation so the adjoint is exact.
//!
//! Slices are processed independently. The adjoint accumulates fixed-size
//! groups of slices into partial volumes and adds the partials to the result
//! in slice order, so results do not depend on the number of worker threads.
//! At most one partial per worker thread is alive at a time.

use nalgebra::Vector3;
use ndarray::{Array2, Array3};
use rayon::prelude::*;

use crate::error::{Result, SrrError};
use crate::geometry::Grid;
use crate::psf::{DeconvolutionMode, OrientedKernel};
use crate::stack::{Slice, Stack};
use crate::volume::Volume;

/// Slices accumulated into one partial volume by the adjoint.
const SLICES_PER_JOB: usize = 16;

/// A linear map known only through its action and the action of its transpose.
pub trait LinearOperator {
    fn apply(&self, x: &[f64]) -> Vec<f64>;
    fn apply_adjoint(&self, y: &[f64]) -> Vec<f64>;
}

/// Numerical settings shared by every operator built during a run.
#[derive(Debug, Clone, Copy)]
pub struct OperatorContext {
    /// Gaussian support radius in standard deviations.
    pub psf_cutoff: f64,
    /// Evaluate slices on the rayon thread pool.
    pub parallel: bool,
    pub deconvolution: DeconvolutionMode,
}

impl Default for OperatorContext {
    fn default() -> Self {
        Self {
            psf_cutoff: 3.0,
            parallel: true,
            deconvolution: DeconvolutionMode::Full3d,
        }
    }
}

struct SliceView<'a> {
    slice: &'a Slice,
    kernel: OrientedKernel,
    /// Continuous volume index of every valid pixel centre.
    positions: Vec<Vector3<f64>>,
    /// Row offset of this slice in the stacked data vector.
    offset: usize,
}

pub struct AcquisitionOperator<'a> {
    grid: Grid,
    views: Vec<SliceView<'a>>,
    n_rows: usize,
    ctx: OperatorContext,
}

impl<'a> AcquisitionOperator<'a> {
    /// Build the operator for the current slice transforms.
    ///
    /// Fails with [`SrrError::GeometryMismatch`] if a slice with valid pixels
    /// has none of them inside the volume footprint.
    pub fn new(grid: &Grid, stacks: &'a [Stack], ctx: OperatorContext) -> Result<Self> {
        if !(ctx.psf_cutoff.is_finite() && ctx.psf_cutoff > 0.0) {
            return Err(SrrError::invalid_configuration(format!(
                "PSF cutoff {} must be finite and positive",
                ctx.psf_cutoff
            )));
        }
        ctx.deconvolution.validate()?;
        let mut views = Vec::new();
        let mut offset = 0;
        for stack in stacks {
            for slice in stack.slices() {
                let kernel = slice.psf().orient(
                    grid,
                    &slice.grid().direction,
                    slice.transform(),
                    ctx.psf_cutoff,
                    ctx.deconvolution,
                )?;
                let positions: Vec<_> = slice
                    .valid_pixels()
                    .map(|(i, j)| grid.world_to_index(&slice.pixel_world(i, j)))
                    .collect();
                if !positions.is_empty() && !positions.iter().any(|q| grid.contains_index(q)) {
                    return Err(SrrError::geometry(format!(
                        "slice {} of stack '{}' lies entirely outside the reconstruction grid",
                        slice.index(),
                        stack.name()
                    )));
                }
                let n = positions.len();
                views.push(SliceView {
                    slice,
                    kernel,
                    positions,
                    offset,
                });
                offset += n;
            }
        }
        Ok(Self {
            grid: grid.clone(),
            views,
            n_rows: offset,
            ctx,
        })
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Number of valid pixels over all slices.
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.grid.len()
    }

    pub fn n_slices(&self) -> usize {
        self.views.len()
    }

    /// Observed intensities of all valid pixels (`M y`) in f64.
    pub fn observed(&self) -> Vec<f64> {
        let mut y = Vec::with_capacity(self.n_rows);
        for view in &self.views {
            let image = view.slice.image();
            y.extend(view.slice.valid_pixels().map(|ij| image[ij] as f64));
        }
        y
    }

    /// `Aᵀ 1`: total PSF weight every voxel receives from valid pixels.
    pub fn coverage(&self) -> Vec<f64> {
        self.apply_adjoint(&vec![1.0; self.n_rows])
    }

    /// Predicted intensities, one image per slice in stack order. Masked
    /// pixels are zero.
    pub fn forward(&self, volume: &Volume) -> Result<Vec<Array2<f64>>> {
        self.check_volume(volume)?;
        Ok(self.unstack(&self.apply(&volume.to_flat())))
    }

    /// Back-project per-slice residual images into volume space. Values at
    /// masked pixels are ignored.
    pub fn adjoint(&self, residuals: &[Array2<f64>]) -> Result<Array3<f64>> {
        let y = self.stack_images(residuals)?;
        let [nx, ny, nz] = self.grid.shape;
        Array3::from_shape_vec((nx, ny, nz), self.apply_adjoint(&y))
            .map_err(|e| SrrError::geometry(e.to_string()))
    }

    /// Scatter a stacked data vector into per-slice images.
    pub fn unstack(&self, y: &[f64]) -> Vec<Array2<f64>> {
        self.views
            .iter()
            .map(|view| {
                let mut image = Array2::zeros(view.slice.image().dim());
                for (p, ij) in view.slice.valid_pixels().enumerate() {
                    image[ij] = y[view.offset + p];
                }
                image
            })
            .collect()
    }

    /// Gather the valid pixels of per-slice images into a stacked data vector.
    pub fn stack_images(&self, images: &[Array2<f64>]) -> Result<Vec<f64>> {
        if images.len() != self.views.len() {
            return Err(SrrError::shape(&[self.views.len()], &[images.len()]));
        }
        let mut y = Vec::with_capacity(self.n_rows);
        for (view, image) in self.views.iter().zip(images) {
            let expected = view.slice.image().dim();
            if image.dim() != expected {
                return Err(SrrError::shape(
                    &[expected.0, expected.1],
                    &[image.dim().0, image.dim().1],
                ));
            }
            y.extend(view.slice.valid_pixels().map(|ij| image[ij]));
        }
        Ok(y)
    }

    fn check_volume(&self, volume: &Volume) -> Result<()> {
        if !volume.grid().same_geometry(&self.grid) {
            return Err(SrrError::geometry(
                "volume grid differs from the operator's reconstruction grid",
            ));
        }
        Ok(())
    }

    fn forward_view(&self, view: &SliceView<'_>, x: &[f64]) -> Vec<f64> {
        let mut weights = Vec::new();
        view.positions
            .iter()
            .map(|q| {
                view.kernel.weights(&self.grid, q, &mut weights);
                weights.iter().map(|&(v, w)| w * x[v]).sum::<f64>()
            })
            .collect()
    }

    /// Add the back-projection of `views` into `acc`.
    fn accumulate_views(&self, views: &[SliceView<'_>], y: &[f64], acc: &mut [f64]) {
        let mut weights = Vec::new();
        for view in views {
            for (p, q) in view.positions.iter().enumerate() {
                let r = y[view.offset + p];
                if r == 0.0 {
                    continue;
                }
                view.kernel.weights(&self.grid, q, &mut weights);
                for &(v, w) in &weights {
                    acc[v] += w * r;
                }
            }
        }
    }
}

fn add_into(total: &mut [f64], partial: &[f64]) {
    for (t, p) in total.iter_mut().zip(partial) {
        *t += p;
    }
}

impl LinearOperator for AcquisitionOperator<'_> {
    fn apply(&self, x: &[f64]) -> Vec<f64> {
        debug_assert_eq!(x.len(), self.grid.len());
        let per_slice: Vec<Vec<f64>> = if self.ctx.parallel {
            self.views.par_iter().map(|v| self.forward_view(v, x)).collect()
        } else {
            self.views.iter().map(|v| self.forward_view(v, x)).collect()
        };
        per_slice.concat()
    }

    fn apply_adjoint(&self, y: &[f64]) -> Vec<f64> {
        debug_assert_eq!(y.len(), self.n_rows);
        let n = self.grid.len();
        let mut total = vec![0.0; n];
        let jobs: Vec<&[SliceView<'_>]> = self.views.chunks(SLICES_PER_JOB).collect();
        if self.ctx.parallel {
            let batch = rayon::current_num_threads().max(1);
            for group in jobs.chunks(batch) {
                let partials: Vec<Vec<f64>> = group
                    .par_iter()
                    .map(|job| {
                        let mut acc = vec![0.0; n];
                        self.accumulate_views(job, y, &mut acc);
                        acc
                    })
                    .collect();
                for partial in &partials {
                    add_into(&mut total, partial);
                }
            }
        } else {
            let mut acc = vec![0.0; n];
            for job in jobs {
                acc.fill(0.0);
                self.accumulate_views(job, y, &mut acc);
                add_into(&mut total, &acc);
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{RigidParameters, RigidTransform};
    use crate::stack::StackGeometry;
    use approx::assert_relative_eq;
    use nalgebra::Matrix3;
    use ndarray::Array3;

    fn volume_grid() -> Grid {
        Grid::isotropic([6, 6, 6], Vector3::zeros(), 1.0).unwrap()
    }

    fn axial_stack() -> Stack {
        let geometry = StackGeometry {
            origin: Vector3::new(0.0, 0.0, 0.5),
            spacing: Vector3::new(1.0, 1.0, 2.0),
            direction: Matrix3::identity(),
            slice_step: None,
            psf: None,
        };
        let images = Array3::from_shape_fn((3, 6, 6), |(k, i, j)| (k + i + j) as f32);
        Stack::from_arrays("axial", &images, None, &geometry).unwrap()
    }

    #[test]
    fn dimensions_follow_valid_pixels() {
        let stacks = vec![axial_stack()];
        let op = AcquisitionOperator::new(&volume_grid(), &stacks, OperatorContext::default())
            .unwrap();
        assert_eq!(op.n_rows(), 3 * 36);
        assert_eq!(op.n_cols(), 216);
        assert_eq!(op.observed().len(), op.n_rows());
    }

    #[test]
    fn constant_volume_predicts_constant_interior() {
        let stacks = vec![axial_stack()];
        let grid = volume_grid();
        let op = AcquisitionOperator::new(&grid, &stacks, OperatorContext::default()).unwrap();
        let y = op.apply(&vec![2.0; grid.len()]);
        let predicted = op.unstack(&y);
        // Pixel (3, 3) of the middle slice has its whole support inside the grid.
        assert_relative_eq!(predicted[1][[3, 3]], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn parallel_and_serial_agree_bitwise() {
        let stacks = vec![axial_stack()];
        let grid = volume_grid();
        let serial = AcquisitionOperator::new(
            &grid,
            &stacks,
            OperatorContext {
                parallel: false,
                ..Default::default()
            },
        )
        .unwrap();
        let parallel = AcquisitionOperator::new(&grid, &stacks, OperatorContext::default())
            .unwrap();
        let y = serial.observed();
        assert_eq!(serial.apply_adjoint(&y), parallel.apply_adjoint(&y));
    }

    #[test]
    fn batched_adjoint_matches_serial_on_small_pools() {
        // 40 slices: three jobs, spread over several batches on a two-thread pool.
        let geometry = StackGeometry {
            origin: Vector3::new(0.0, 0.0, 0.0),
            spacing: Vector3::new(1.0, 1.0, 0.12),
            direction: Matrix3::identity(),
            slice_step: None,
            psf: Some(crate::psf::Psf::trilinear()),
        };
        let images = Array3::from_shape_fn((40, 6, 6), |(k, i, j)| (k + 2 * i + j) as f32);
        let stacks = vec![Stack::from_arrays("dense", &images, None, &geometry).unwrap()];
        let grid = volume_grid();
        let serial = AcquisitionOperator::new(
            &grid,
            &stacks,
            OperatorContext {
                parallel: false,
                ..Default::default()
            },
        )
        .unwrap();
        let parallel = AcquisitionOperator::new(&grid, &stacks, OperatorContext::default())
            .unwrap();
        assert!(parallel.n_slices() > 2 * SLICES_PER_JOB);
        let y = serial.observed();
        let expected = serial.apply_adjoint(&y);
        for threads in [1, 2] {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .unwrap();
            assert_eq!(pool.install(|| parallel.apply_adjoint(&y)), expected);
        }
        assert_eq!(parallel.apply_adjoint(&y), expected);
    }

    #[test]
    fn rejects_slices_outside_volume() {
        let mut stacks = vec![axial_stack()];
        let far = RigidTransform::from_parameters(&RigidParameters {
            rotation: [0.0; 3],
            translation: [0.0, 0.0, 100.0],
        });
        stacks[0].set_transforms(&[far; 3]).unwrap();
        let err = AcquisitionOperator::new(&volume_grid(), &stacks, OperatorContext::default())
            .err()
            .unwrap();
        assert!(matches!(err, SrrError::GeometryMismatch(_)));
    }

    #[test]
    fn image_helpers_reject_wrong_counts() {
        let stacks = vec![axial_stack()];
        let op = AcquisitionOperator::new(&volume_grid(), &stacks, OperatorContext::default())
            .unwrap();
        assert!(op.adjoint(&[Array2::zeros((6, 6))]).is_err());
    }
}
