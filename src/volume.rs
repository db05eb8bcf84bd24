//! Reconstruction volume and grid selection.

use log::{debug, info};
use ndarray::Array3;

use crate::config::ReconstructionConfig;
use crate::error::{Result, SrrError};
use crate::geometry::Grid;
use crate::operator::{AcquisitionOperator, LinearOperator, OperatorContext};
use crate::stack::Stack;

/// Reconstructed 3D image on a fixed grid.
///
/// Intensities are stored in single precision; solvers work on the
/// double-precision copy returned by [`Volume::to_flat`].
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    data: Array3<f32>,
    grid: Grid,
}

impl Volume {
    pub fn zeros(grid: &Grid) -> Self {
        let [nx, ny, nz] = grid.shape;
        Self {
            data: Array3::zeros((nx, ny, nz)),
            grid: grid.clone(),
        }
    }

    pub fn from_array(data: Array3<f32>, grid: &Grid) -> Result<Self> {
        let (nx, ny, nz) = data.dim();
        if [nx, ny, nz] != grid.shape {
            return Err(SrrError::shape(&grid.shape, &[nx, ny, nz]));
        }
        Ok(Self {
            data: data.as_standard_layout().to_owned(),
            grid: grid.clone(),
        })
    }

    /// Volume from a flat vector in grid order.
    pub fn from_flat(grid: &Grid, values: &[f64]) -> Result<Self> {
        if values.len() != grid.len() {
            return Err(SrrError::shape(&[grid.len()], &[values.len()]));
        }
        let [nx, ny, nz] = grid.shape;
        let data = Array3::from_shape_vec(
            (nx, ny, nz),
            values.iter().map(|&v| v as f32).collect(),
        )
        .map_err(|e| SrrError::geometry(e.to_string()))?;
        Ok(Self {
            data,
            grid: grid.clone(),
        })
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Intensities widened to f64, in grid order.
    pub fn to_flat(&self) -> Vec<f64> {
        self.data.iter().map(|&v| v as f64).collect()
    }

    /// Normalised back-projection of the observed slices,
    /// `Aᵀ(M y) / Aᵀ(M 1)`. Voxels without coverage are zero.
    pub fn scattered_data_approximation(
        grid: &Grid,
        stacks: &[Stack],
        ctx: OperatorContext,
    ) -> Result<Self> {
        let op = AcquisitionOperator::new(grid, stacks, ctx)?;
        let numerator = op.apply_adjoint(&op.observed());
        let coverage = op.coverage();
        let mut uncovered = 0usize;
        let values: Vec<f64> = numerator
            .iter()
            .zip(&coverage)
            .map(|(&n, &c)| {
                if c > 0.0 {
                    n / c
                } else {
                    uncovered += 1;
                    0.0
                }
            })
            .collect();
        debug!(
            "scattered data approximation: {} of {} voxels without coverage",
            uncovered,
            values.len()
        );
        Self::from_flat(grid, &values)
    }
}

/// Scattered-data estimate on the grid selected by `config.resolution`
/// (and `reference`, if given).
pub fn initial_estimate(
    stacks: &[Stack],
    config: &ReconstructionConfig,
    reference: Option<&Grid>,
) -> Result<Volume> {
    let grid = reconstruction_grid(stacks, config.resolution, reference)?;
    Volume::scattered_data_approximation(&grid, stacks, config.operator_context())
}

/// Choose the reconstruction grid.
///
/// With a `reference` grid, its extent and orientation are kept and resampled
/// to `resolution`. Otherwise an axis-aligned grid covers every slice slab.
/// Without an explicit resolution the finest in-plane slice spacing is used.
pub fn reconstruction_grid(
    stacks: &[Stack],
    resolution: Option<f64>,
    reference: Option<&Grid>,
) -> Result<Grid> {
    let spacing = match resolution {
        Some(r) => r,
        None => finest_in_plane_spacing(stacks, reference)?,
    };
    let grid = match reference {
        Some(grid) => grid.resampled(spacing)?,
        None => {
            let corners: Vec<_> = stacks
                .iter()
                .flat_map(|s| s.slices())
                .flat_map(|s| s.slab_corners())
                .collect();
            Grid::covering(&corners, spacing)?
        }
    };
    info!(
        "reconstruction grid {:?} at {:.3} mm isotropic",
        grid.shape, spacing
    );
    Ok(grid)
}

fn finest_in_plane_spacing(stacks: &[Stack], reference: Option<&Grid>) -> Result<f64> {
    stacks
        .iter()
        .flat_map(|s| s.slices().first())
        .map(|s| s.grid().spacing.x.min(s.grid().spacing.y))
        .chain(reference.map(|g| g.spacing.min()))
        .min_by(|a, b| a.total_cmp(b))
        .ok_or_else(|| SrrError::geometry("no stacks to derive a reconstruction grid from"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::StackGeometry;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, Vector3};

    fn stack(value: f32) -> Stack {
        let geometry = StackGeometry {
            origin: Vector3::new(0.0, 0.0, 0.5),
            spacing: Vector3::new(1.0, 1.0, 2.0),
            direction: Matrix3::identity(),
            slice_step: None,
            psf: None,
        };
        Stack::from_arrays("s", &Array3::from_elem((4, 8, 8), value), None, &geometry).unwrap()
    }

    #[test]
    fn grid_covers_all_slabs() {
        let grid = reconstruction_grid(&[stack(1.0)], None, None).unwrap();
        assert_eq!(grid.shape, [8, 8, 8]);
        assert_relative_eq!(grid.origin, Vector3::new(0.0, 0.0, 0.0), epsilon = 1e-9);
    }

    #[test]
    fn reference_grid_is_resampled() {
        let reference = Grid::isotropic([4, 4, 4], Vector3::zeros(), 2.0).unwrap();
        let grid = reconstruction_grid(&[stack(1.0)], Some(1.0), Some(&reference)).unwrap();
        assert_eq!(grid.shape, [8, 8, 8]);
        assert_relative_eq!(grid.origin, Vector3::repeat(-0.5), epsilon = 1e-12);
    }

    #[test]
    fn constant_slices_give_constant_estimate() {
        let stacks = [stack(3.0)];
        let grid = reconstruction_grid(&stacks, None, None).unwrap();
        let volume =
            Volume::scattered_data_approximation(&grid, &stacks, OperatorContext::default())
                .unwrap();
        for &v in volume.data().iter() {
            assert_relative_eq!(v, 3.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn from_flat_checks_length() {
        let grid = Grid::isotropic([2, 2, 2], Vector3::zeros(), 1.0).unwrap();
        assert!(Volume::from_flat(&grid, &[0.0; 7]).is_err());
        let v = Volume::from_flat(&grid, &[1.5; 8]).unwrap();
        assert_eq!(v.to_flat(), vec![1.5; 8]);
    }
}
