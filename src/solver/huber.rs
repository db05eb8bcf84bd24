//! Huber penalty on the gradient magnitude.
//!
//! ρ(t) = t² for t ≤ γ and 2γt − γ² beyond, so ρ matches the first-order
//! Tikhonov energy below the threshold. The reweighting factor ρ'(t) / 2t
//! is 1 below γ and γ / t above.

use super::prior::gradient_magnitude;

pub fn huber_weight(magnitude: f64, threshold: f64) -> f64 {
    if magnitude <= threshold {
        1.0
    } else {
        threshold / magnitude
    }
}

/// Square roots of the per-voxel reweighting factors at `x`.
pub fn sqrt_weights(x: &[f64], shape: [usize; 3], threshold: f64) -> Vec<f64> {
    gradient_magnitude(x, shape)
        .into_iter()
        .map(|m| huber_weight(m, threshold).sqrt())
        .collect()
}

/// Σ ρ(|∇x|) over all voxels.
pub fn huber_energy(x: &[f64], shape: [usize; 3], threshold: f64) -> f64 {
    gradient_magnitude(x, shape)
        .into_iter()
        .map(|t| {
            if t <= threshold {
                t * t
            } else {
                2.0 * threshold * t - threshold * threshold
            }
        })
        .sum()
}
