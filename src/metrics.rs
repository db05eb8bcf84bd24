//! Similarity between a reconstruction and a reference volume.
//!
//! All measures take an optional voxel mask; voxels outside it are ignored.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SrrError};
use crate::volume::Volume;

/// Measure used to rank reconstructions in a parameter study.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Similarity {
    /// Normalized cross correlation; higher is better.
    #[default]
    Ncc,
    /// Root mean squared error; lower is better.
    Rmse,
    /// Peak signal-to-noise ratio in dB; higher is better.
    Psnr,
}

impl Similarity {
    pub fn higher_is_better(&self) -> bool {
        !matches!(self, Similarity::Rmse)
    }

    /// Whether score `a` ranks strictly better than `b`.
    pub fn better(&self, a: f64, b: f64) -> bool {
        if self.higher_is_better() {
            a > b
        } else {
            a < b
        }
    }

    pub fn score(&self, volume: &Volume, reference: &Volume, mask: Option<&[bool]>) -> Result<f64> {
        if !volume.grid().same_geometry(reference.grid()) {
            return Err(SrrError::geometry(
                "reference volume grid differs from the reconstruction grid",
            ));
        }
        let a = volume.to_flat();
        let b = reference.to_flat();
        if let Some(m) = mask {
            if m.len() != a.len() {
                return Err(SrrError::shape(&[a.len()], &[m.len()]));
            }
            if !m.contains(&true) {
                return Err(SrrError::invalid_configuration(
                    "similarity mask selects no voxels",
                ));
            }
        }
        Ok(match self {
            Similarity::Ncc => ncc(&a, &b, mask),
            Similarity::Rmse => rmse(&a, &b, mask),
            Similarity::Psnr => psnr(&a, &b, mask),
        })
    }
}

fn selected<'a>(
    a: &'a [f64],
    b: &'a [f64],
    mask: Option<&'a [bool]>,
) -> impl Iterator<Item = (f64, f64)> + 'a {
    a.iter()
        .zip(b)
        .enumerate()
        .filter(move |&(i, _)| mask.map_or(true, |m| m[i]))
        .map(|(_, (&x, &y))| (x, y))
}

/// Pearson correlation of the two images. Zero if either is constant, NaN
/// if the mask selects nothing.
pub fn ncc(a: &[f64], b: &[f64], mask: Option<&[bool]>) -> f64 {
    let (mut n, mut sum_a, mut sum_b) = (0usize, 0.0, 0.0);
    for (x, y) in selected(a, b, mask) {
        n += 1;
        sum_a += x;
        sum_b += y;
    }
    if n == 0 {
        return f64::NAN;
    }
    let mean_a = sum_a / n as f64;
    let mean_b = sum_b / n as f64;
    let (mut cross, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (x, y) in selected(a, b, mask) {
        let da = x - mean_a;
        let db = y - mean_b;
        cross += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    let denom = (var_a * var_b).sqrt();
    if denom < f64::EPSILON {
        return 0.0;
    }
    cross / denom
}

/// NaN if the mask selects nothing.
pub fn rmse(a: &[f64], b: &[f64], mask: Option<&[bool]>) -> f64 {
    let mut sum_sq = 0.0;
    let mut n = 0usize;
    for (x, y) in selected(a, b, mask) {
        sum_sq += (x - y) * (x - y);
        n += 1;
    }
    if n == 0 {
        return f64::NAN;
    }
    (sum_sq / n as f64).sqrt()
}

/// PSNR with the reference maximum as peak. Infinite for identical images.
pub fn psnr(a: &[f64], reference: &[f64], mask: Option<&[bool]>) -> f64 {
    let err = rmse(a, reference, mask);
    let peak = selected(a, reference, mask)
        .map(|(_, y)| y.abs())
        .fold(0.0, f64::max);
    if err == 0.0 {
        return f64::INFINITY;
    }
    20.0 * (peak / err).log10()
}

/// `‖a − reference‖ / ‖reference‖` over all voxels.
pub fn relative_error(a: &[f64], reference: &[f64]) -> f64 {
    let num: f64 = a.iter().zip(reference).map(|(x, y)| (x - y) * (x - y)).sum();
    let den: f64 = reference.iter().map(|y| y * y).sum();
    if den == 0.0 {
        return num.sqrt();
    }
    (num / den).sqrt()
}
