//! Common test utilities for srr-core integration tests

#![allow(dead_code)]

use nalgebra::Vector3;

use srr_core::operator::OperatorContext;
use srr_core::simulate::{phantom, simulate_stack, AcquisitionProtocol, Orientation};
use srr_core::{Grid, Stack, Volume};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Cubic isotropic grid at the origin.
pub fn cube_grid(n: usize, spacing: f64) -> Grid {
    Grid::isotropic([n; 3], Vector3::zeros(), spacing).unwrap()
}

pub fn phantom_volume(n: usize) -> Volume {
    phantom(&cube_grid(n, 1.0)).unwrap()
}

/// Axial, coronal and sagittal stacks of `truth`, motion free.
pub fn orthogonal_stacks(truth: &Volume, thickness: f64, noise_sigma: f64) -> Vec<Stack> {
    Orientation::ALL
        .iter()
        .enumerate()
        .map(|(i, &o)| {
            let mut protocol = AcquisitionProtocol::new(o, truth.grid().spacing.x, thickness);
            protocol.noise_sigma = noise_sigma;
            protocol.seed = 100 + i as u64;
            simulate_stack(truth, &protocol, OperatorContext::default())
                .unwrap()
                .stack
        })
        .collect()
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Relative L2 distance between two volumes.
pub fn relative_error(a: &Volume, reference: &Volume) -> f64 {
    srr_core::metrics::relative_error(&a.to_flat(), &reference.to_flat())
}

pub fn max_abs_diff(a: &Volume, b: &Volume) -> f64 {
    a.to_flat()
        .iter()
        .zip(b.to_flat())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}
