//! Slice and stack containers.

use nalgebra::{Matrix3, Vector3};
use ndarray::{Array2, Array3, Axis};

use crate::error::{Result, SrrError};
use crate::geometry::{Grid, RigidTransform};
use crate::psf::Psf;

/// Per-slice transforms of a stack collection, indexed `[stack][slice]`.
pub type TransformSet = Vec<Vec<RigidTransform>>;

/// One acquired 2D slice.
///
/// The slice grid has shape `[nx, ny, 1]` and its third spacing component is
/// the slice thickness. `transform` maps the acquisition pose onto the
/// motion-corrected pose in the shared world frame.
#[derive(Debug, Clone)]
pub struct Slice {
    image: Array2<f32>,
    mask: Array2<bool>,
    grid: Grid,
    psf: Psf,
    transform: RigidTransform,
    index: usize,
}

impl Slice {
    pub fn new(
        image: Array2<f32>,
        mask: Option<Array2<bool>>,
        grid: Grid,
        psf: Psf,
        index: usize,
    ) -> Result<Self> {
        let (nx, ny) = image.dim();
        if grid.shape != [nx, ny, 1] {
            return Err(SrrError::shape(&[nx, ny, 1], &grid.shape));
        }
        let mask = match mask {
            Some(m) if m.dim() != (nx, ny) => {
                return Err(SrrError::shape(&[nx, ny], &[m.dim().0, m.dim().1]));
            }
            Some(m) => m,
            None => Array2::from_elem((nx, ny), true),
        };
        psf.validate()?;
        Ok(Self {
            image,
            mask,
            grid,
            psf,
            transform: RigidTransform::identity(),
            index,
        })
    }

    pub fn image(&self) -> &Array2<f32> {
        &self.image
    }

    pub fn mask(&self) -> &Array2<bool> {
        &self.mask
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn psf(&self) -> &Psf {
        &self.psf
    }

    pub fn transform(&self) -> &RigidTransform {
        &self.transform
    }

    pub fn set_transform(&mut self, transform: RigidTransform) {
        self.transform = transform;
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Pixel coordinates inside the mask, in row-major order.
    pub fn valid_pixels(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.mask
            .indexed_iter()
            .filter(|&(_, &valid)| valid)
            .map(|(ij, _)| ij)
    }

    pub fn n_valid(&self) -> usize {
        self.mask.iter().filter(|&&v| v).count()
    }

    /// World position of the centre of pixel `(i, j)` under the current transform.
    pub fn pixel_world(&self, i: usize, j: usize) -> Vector3<f64> {
        let local = self
            .grid
            .index_to_world(&Vector3::new(i as f64, j as f64, 0.0));
        self.transform.transform_point(&local)
    }

    /// Corners of the slice slab (pixel edges, ± half thickness) in world space.
    pub fn slab_corners(&self) -> Vec<Vector3<f64>> {
        self.grid
            .edge_corners()
            .iter()
            .map(|p| self.transform.transform_point(p))
            .collect()
    }
}

/// Acquisition geometry shared by the slices of a stack.
#[derive(Debug, Clone)]
pub struct StackGeometry {
    /// World position of pixel `(0, 0)` of the first slice.
    pub origin: Vector3<f64>,
    /// In-plane spacing and slice thickness.
    pub spacing: Vector3<f64>,
    /// Columns: in-plane x, in-plane y, slice normal.
    pub direction: Matrix3<f64>,
    /// Distance between consecutive slice centres; defaults to the thickness.
    pub slice_step: Option<f64>,
    /// Defaults to [`Psf::from_slice_spacing`].
    pub psf: Option<Psf>,
}

/// Ordered slices sharing acquisition geometry.
#[derive(Debug, Clone)]
pub struct Stack {
    name: String,
    slices: Vec<Slice>,
}

impl Stack {
    pub fn new(name: impl Into<String>, slices: Vec<Slice>) -> Result<Self> {
        let name = name.into();
        let first = slices
            .first()
            .ok_or_else(|| SrrError::geometry(format!("stack '{name}' has no slices")))?;
        for slice in &slices[1..] {
            let same_spacing = (slice.grid.spacing - first.grid.spacing).abs().max() < 1e-9;
            let same_direction =
                (slice.grid.direction - first.grid.direction).abs().max() < 1e-9;
            if !(same_spacing && same_direction) {
                return Err(SrrError::geometry(format!(
                    "slice {} of stack '{name}' does not share the stack geometry",
                    slice.index
                )));
            }
        }
        Ok(Self { name, slices })
    }

    /// Build a stack from an `(n_slices, nx, ny)` image array.
    pub fn from_arrays(
        name: impl Into<String>,
        images: &Array3<f32>,
        masks: Option<&Array3<bool>>,
        geometry: &StackGeometry,
    ) -> Result<Self> {
        if let Some(m) = masks {
            if m.dim() != images.dim() {
                let (a, b, c) = images.dim();
                let (x, y, z) = m.dim();
                return Err(SrrError::shape(&[a, b, c], &[x, y, z]));
            }
        }
        let (_, nx, ny) = images.dim();
        let step = geometry.slice_step.unwrap_or(geometry.spacing.z);
        let psf = geometry
            .psf
            .unwrap_or_else(|| Psf::from_slice_spacing(&geometry.spacing));
        let normal = geometry.direction.column(2).into_owned();

        let slices = images
            .axis_iter(Axis(0))
            .enumerate()
            .map(|(k, image)| {
                let grid = Grid::new(
                    [nx, ny, 1],
                    geometry.origin + normal * (k as f64 * step),
                    geometry.spacing,
                    geometry.direction,
                )?;
                let mask = masks.map(|m| m.index_axis(Axis(0), k).to_owned());
                Slice::new(image.to_owned(), mask, grid, psf, k)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(name, slices)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn transforms(&self) -> Vec<RigidTransform> {
        self.slices.iter().map(|s| *s.transform()).collect()
    }

    pub fn set_transforms(&mut self, transforms: &[RigidTransform]) -> Result<()> {
        if transforms.len() != self.slices.len() {
            return Err(SrrError::shape(&[self.slices.len()], &[transforms.len()]));
        }
        for (slice, t) in self.slices.iter_mut().zip(transforms) {
            slice.set_transform(*t);
        }
        Ok(())
    }
}

/// Current transforms of all slices.
pub fn transform_set(stacks: &[Stack]) -> TransformSet {
    stacks.iter().map(Stack::transforms).collect()
}

/// Install a transform set, checking that its shape matches the stacks.
pub fn apply_transform_set(stacks: &mut [Stack], transforms: &TransformSet) -> Result<()> {
    if transforms.len() != stacks.len() {
        return Err(SrrError::shape(&[stacks.len()], &[transforms.len()]));
    }
    for (stack, t) in stacks.iter_mut().zip(transforms) {
        stack.set_transforms(t)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::RigidParameters;
    use approx::assert_relative_eq;

    fn axial_geometry() -> StackGeometry {
        StackGeometry {
            origin: Vector3::new(0.0, 0.0, 0.5),
            spacing: Vector3::new(1.0, 1.0, 2.0),
            direction: Matrix3::identity(),
            slice_step: None,
            psf: None,
        }
    }

    #[test]
    fn from_arrays_places_slices_along_normal() {
        let images = Array3::<f32>::zeros((3, 4, 5));
        let stack = Stack::from_arrays("axial", &images, None, &axial_geometry()).unwrap();
        assert_eq!(stack.len(), 3);
        let p = stack.slices()[2].pixel_world(1, 2);
        assert_relative_eq!(p, Vector3::new(1.0, 2.0, 4.5), epsilon = 1e-12);
        assert_eq!(stack.slices()[0].n_valid(), 20);
        assert_eq!(stack.slices()[0].psf().fwhm, [1.2, 1.2, 2.0]);
    }

    #[test]
    fn mask_limits_valid_pixels() {
        let images = Array3::<f32>::zeros((1, 3, 3));
        let mut masks = Array3::from_elem((1, 3, 3), false);
        masks[[0, 1, 1]] = true;
        masks[[0, 2, 0]] = true;
        let stack = Stack::from_arrays("m", &images, Some(&masks), &axial_geometry()).unwrap();
        let pixels: Vec<_> = stack.slices()[0].valid_pixels().collect();
        assert_eq!(pixels, vec![(1, 1), (2, 0)]);
    }

    #[test]
    fn transform_moves_pixels() {
        let images = Array3::<f32>::zeros((1, 2, 2));
        let mut stack = Stack::from_arrays("t", &images, None, &axial_geometry()).unwrap();
        let shift = RigidTransform::from_parameters(&RigidParameters {
            rotation: [0.0; 3],
            translation: [0.0, 0.0, 1.5],
        });
        stack.set_transforms(&[shift]).unwrap();
        assert_relative_eq!(
            stack.slices()[0].pixel_world(0, 0),
            Vector3::new(0.0, 0.0, 2.0),
            epsilon = 1e-12
        );
        assert!(stack.set_transforms(&[shift, shift]).is_err());
    }

    #[test]
    fn rejects_mixed_geometry() {
        let g = axial_geometry();
        let a = Slice::new(
            Array2::zeros((2, 2)),
            None,
            Grid::new([2, 2, 1], g.origin, g.spacing, g.direction).unwrap(),
            Psf::trilinear(),
            0,
        )
        .unwrap();
        let b = Slice::new(
            Array2::zeros((2, 2)),
            None,
            Grid::new([2, 2, 1], g.origin, Vector3::new(1.0, 1.0, 3.0), g.direction).unwrap(),
            Psf::trilinear(),
            1,
        )
        .unwrap();
        let err = Stack::new("mixed", vec![a, b]).unwrap_err();
        assert!(matches!(err, SrrError::GeometryMismatch(_)));
    }
}
