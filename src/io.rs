//! On-disk formats: stack manifests, volumes with grid sidecars, transform sets.
//!
//! Arrays are stored as `.npy`; everything else is JSON. Stack images are
//! `(n_slices, nx, ny)` f32 arrays, masks the same shape as u8 (non-zero is
//! valid). A volume `<name>.npy` is accompanied by `<name>.json` holding its
//! grid.

use std::fs;
use std::path::{Path, PathBuf};

use nalgebra::{Matrix3, Vector3};
use ndarray::{Array2, Array3, Axis};
use ndarray_npy::{read_npy, write_npy};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SrrError};
use crate::geometry::{Grid, RigidTransform};
use crate::psf::Psf;
use crate::stack::{Slice, Stack, StackGeometry, TransformSet};
use crate::volume::Volume;

fn identity_rows() -> [f64; 9] {
    [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]
}

fn matrix_from_rows(rows: &[f64; 9]) -> Matrix3<f64> {
    Matrix3::from_row_slice(rows)
}

fn matrix_to_rows(m: &Matrix3<f64>) -> [f64; 9] {
    let mut rows = [0.0; 9];
    for r in 0..3 {
        for c in 0..3 {
            rows[3 * r + c] = m[(r, c)];
        }
    }
    rows
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackManifest {
    pub stacks: Vec<StackEntry>,
}

/// One stack of a manifest. Relative paths resolve against the manifest's
/// directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackEntry {
    pub name: String,
    pub images: PathBuf,
    #[serde(default)]
    pub masks: Option<PathBuf>,
    /// World position of pixel `(0, 0)` of the first slice.
    pub origin: [f64; 3],
    /// `[sx, sy, thickness]`.
    pub spacing: [f64; 3],
    /// Row-major direction matrix; columns are in-plane x, in-plane y, normal.
    #[serde(default = "identity_rows")]
    pub direction: [f64; 9],
    #[serde(default)]
    pub slice_step: Option<f64>,
    /// Per-slice origins; overrides `origin` and `slice_step` when present.
    #[serde(default)]
    pub slice_origins: Option<Vec<[f64; 3]>>,
    #[serde(default)]
    pub psf: Option<Psf>,
    #[serde(default)]
    pub transforms: Option<Vec<RigidTransform>>,
}

impl StackEntry {
    fn geometry(&self) -> StackGeometry {
        StackGeometry {
            origin: Vector3::from(self.origin),
            spacing: Vector3::from(self.spacing),
            direction: matrix_from_rows(&self.direction),
            slice_step: self.slice_step,
            psf: self.psf,
        }
    }

    fn build(&self, base: &Path) -> Result<Stack> {
        let images: Array3<f32> = read_array(&resolve(base, &self.images))?;
        let masks: Option<Array3<bool>> = match &self.masks {
            Some(p) => {
                let raw: Array3<u8> = read_array(&resolve(base, p))?;
                Some(raw.mapv(|v| v != 0))
            }
            None => None,
        };
        let geometry = self.geometry();
        let mut stack = match &self.slice_origins {
            None => Stack::from_arrays(&self.name, &images, masks.as_ref(), &geometry)?,
            Some(origins) => {
                if origins.len() != images.len_of(Axis(0)) {
                    return Err(SrrError::shape(&[images.len_of(Axis(0))], &[origins.len()]));
                }
                let (_, nx, ny) = images.dim();
                let psf = geometry
                    .psf
                    .unwrap_or_else(|| Psf::from_slice_spacing(&geometry.spacing));
                let slices = origins
                    .iter()
                    .enumerate()
                    .map(|(k, o)| {
                        let grid = Grid::new(
                            [nx, ny, 1],
                            Vector3::from(*o),
                            geometry.spacing,
                            geometry.direction,
                        )?;
                        let image: Array2<f32> = images.index_axis(Axis(0), k).to_owned();
                        let mask = masks.as_ref().map(|m| m.index_axis(Axis(0), k).to_owned());
                        Slice::new(image, mask, grid, psf, k)
                    })
                    .collect::<Result<Vec<_>>>()?;
                Stack::new(&self.name, slices)?
            }
        };
        if let Some(t) = &self.transforms {
            stack.set_transforms(t)?;
        }
        Ok(stack)
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn read_array<T, D>(path: &Path) -> Result<ndarray::Array<T, D>>
where
    T: ndarray_npy::ReadableElement,
    D: ndarray::Dimension,
{
    read_npy(path).map_err(|e| SrrError::io(format!("Failed to read NPY {}: {e}", path.display())))
}

fn write_array<T, D>(path: &Path, array: &ndarray::Array<T, D>) -> Result<()>
where
    T: ndarray_npy::WritableElement,
    D: ndarray::Dimension,
{
    write_npy(path, array)
        .map_err(|e| SrrError::io(format!("Failed to write NPY {}: {e}", path.display())))
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path)
        .map_err(|e| SrrError::io(format!("Failed to read {}: {e}", path.display())))?;
    serde_json::from_str(&contents)
        .map_err(|e| SrrError::io(format!("Failed to parse {}: {e}", path.display())))
}

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let contents = serde_json::to_string_pretty(value)
        .map_err(|e| SrrError::io(format!("Failed to serialize {}: {e}", path.display())))?;
    fs::write(path, contents)
        .map_err(|e| SrrError::io(format!("Failed to write {}: {e}", path.display())))
}

/// Load every stack listed in a manifest.
pub fn load_stacks(manifest: &Path) -> Result<Vec<Stack>> {
    let parsed: StackManifest = read_json(manifest)?;
    let base = manifest.parent().unwrap_or_else(|| Path::new("."));
    parsed.stacks.iter().map(|entry| entry.build(base)).collect()
}

/// Write stacks (images, masks, exact slice placement, transforms) into
/// `dir` and return the manifest path.
pub fn write_stacks(dir: &Path, stacks: &[Stack]) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .map_err(|e| SrrError::io(format!("Failed to create {}: {e}", dir.display())))?;
    let mut entries = Vec::with_capacity(stacks.len());
    for (s, stack) in stacks.iter().enumerate() {
        let first = stack
            .slices()
            .first()
            .ok_or_else(|| SrrError::geometry(format!("stack '{}' has no slices", stack.name())))?;
        let (nx, ny) = first.image().dim();
        let mut images = Array3::<f32>::zeros((stack.len(), nx, ny));
        let mut masks = Array3::<u8>::zeros((stack.len(), nx, ny));
        for (k, slice) in stack.slices().iter().enumerate() {
            images.index_axis_mut(Axis(0), k).assign(slice.image());
            masks
                .index_axis_mut(Axis(0), k)
                .assign(&slice.mask().mapv(u8::from));
        }
        let images_name = PathBuf::from(format!("stack{s}_images.npy"));
        let masks_name = PathBuf::from(format!("stack{s}_masks.npy"));
        write_array(&dir.join(&images_name), &images)?;
        write_array(&dir.join(&masks_name), &masks)?;

        let grid = first.grid();
        entries.push(StackEntry {
            name: stack.name().to_string(),
            images: images_name,
            masks: Some(masks_name),
            origin: grid.origin.into(),
            spacing: grid.spacing.into(),
            direction: matrix_to_rows(&grid.direction),
            slice_step: None,
            slice_origins: Some(
                stack
                    .slices()
                    .iter()
                    .map(|sl| sl.grid().origin.into())
                    .collect(),
            ),
            psf: Some(*first.psf()),
            transforms: Some(stack.transforms()),
        });
    }
    let manifest = dir.join("stacks.json");
    write_json(&manifest, &StackManifest { stacks: entries })?;
    Ok(manifest)
}

/// Serialized form of a [`Grid`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridRecord {
    pub shape: [usize; 3],
    pub origin: [f64; 3],
    pub spacing: [f64; 3],
    #[serde(default = "identity_rows")]
    pub direction: [f64; 9],
}

impl From<&Grid> for GridRecord {
    fn from(grid: &Grid) -> Self {
        Self {
            shape: grid.shape,
            origin: grid.origin.into(),
            spacing: grid.spacing.into(),
            direction: matrix_to_rows(&grid.direction),
        }
    }
}

impl GridRecord {
    pub fn to_grid(&self) -> Result<Grid> {
        Grid::new(
            self.shape,
            Vector3::from(self.origin),
            Vector3::from(self.spacing),
            matrix_from_rows(&self.direction),
        )
    }
}

fn sidecar(path: &Path) -> PathBuf {
    path.with_extension("json")
}

/// Write `volume` to `path` (`.npy`) and its grid next to it.
pub fn write_volume(path: &Path, volume: &Volume) -> Result<()> {
    write_array(path, volume.data())?;
    write_json(&sidecar(path), &GridRecord::from(volume.grid()))
}

pub fn read_volume(path: &Path) -> Result<Volume> {
    let record: GridRecord = read_json(&sidecar(path))?;
    let data: Array3<f32> = read_array(path)?;
    Volume::from_array(data, &record.to_grid()?)
}

pub fn write_transforms(path: &Path, transforms: &TransformSet) -> Result<()> {
    write_json(path, transforms)
}

pub fn read_transforms(path: &Path) -> Result<TransformSet> {
    read_json(path)
}
