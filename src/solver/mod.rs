//! Regularized volume reconstruction.
//!
//! Minimizes `Σ_k ‖M_k(A_k x − y_k)‖² + α R(x)` over the volume `x` with
//! LSMR on the augmented system (see [`prior`]). Tikhonov priors need a
//! single solve; the Huber prior is handled by iteratively reweighted least
//! squares, each round warm-started from the previous estimate.

pub mod huber;
pub mod lsmr;
pub mod prior;

use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;

use crate::config::{IllPosedPolicy, ReconstructionConfig, Regularization, TikhonovOrder};
use crate::error::{Result, SrrError};
use crate::geometry::Grid;
use crate::operator::{AcquisitionOperator, LinearOperator};
use crate::stack::Stack;
use crate::volume::Volume;

use self::lsmr::{lsmr, LsmrOptions, LsmrStop};
use self::prior::{gradient, AugmentedOperator, Prior};

/// Convergence record of one reconstruction.
#[derive(Debug, Clone, Serialize)]
pub struct SolveReport {
    pub regularization: &'static str,
    pub alpha: f64,
    /// LSMR iterations summed over all solves.
    pub iterations: usize,
    /// Number of LSMR solves (Huber reweighting rounds).
    pub solves: usize,
    /// Stop reason of the last solve.
    pub stop: LsmrStop,
    /// False if the iteration cap was hit before the tolerance was met.
    pub converged: bool,
    /// Estimated residual of the augmented system, per iteration of each solve.
    pub residual_history: Vec<f64>,
    /// `Σ ‖M(Ax − y)‖²`.
    pub data_residual: f64,
    /// `‖x‖²`, `‖∇x‖²` or the Huber energy.
    pub prior_residual: f64,
    /// `data_residual + α · prior_residual`.
    pub cost: f64,
    pub zero_filled_voxels: usize,
    #[serde(serialize_with = "serialize_seconds")]
    pub elapsed: Duration,
}

fn serialize_seconds<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

pub struct Solver<'c> {
    config: &'c ReconstructionConfig,
}

impl<'c> Solver<'c> {
    pub fn new(config: &'c ReconstructionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Reconstruct on the grid of `initial`, starting from its intensities.
    pub fn solve(
        &self,
        stacks: &[Stack],
        initial: &Volume,
        iter_max: usize,
    ) -> Result<(Volume, SolveReport)> {
        let start = Instant::now();
        let grid = initial.grid();
        if !grid.is_isotropic() {
            return Err(SrrError::geometry(format!(
                "reconstruction grid spacing {:?} is not isotropic",
                grid.spacing.as_slice()
            )));
        }
        if iter_max == 0 {
            return Err(SrrError::invalid_configuration("iteration cap must be at least 1"));
        }

        let op = AcquisitionOperator::new(grid, stacks, self.config.operator_context())?;
        let support = self.support(&op.coverage(), grid)?;
        let zero_filled_voxels = support
            .as_ref()
            .map_or(0, |s| s.iter().filter(|&&inside| !inside).count());
        let observed = op.observed();

        let mut x = initial.to_flat();
        if let Some(s) = &support {
            for (v, &inside) in x.iter_mut().zip(s) {
                if !inside {
                    *v = 0.0;
                }
            }
        }

        let alpha = self.config.alpha;
        let opts = LsmrOptions::new(self.config.tolerance, iter_max);
        let mut iterations = 0;
        let mut solves = 0;
        let mut residual_history = Vec::new();
        let mut stop = LsmrStop::StartingPointExact;

        let rounds: Vec<Option<f64>> = match self.config.regularization {
            Regularization::Tikhonov { .. } => vec![None],
            Regularization::Huber {
                threshold,
                iterations,
            } => vec![Some(threshold); iterations],
        };
        for (round, threshold) in rounds.into_iter().enumerate() {
            let prior = match (self.config.regularization, threshold) {
                (Regularization::Tikhonov { order: TikhonovOrder::Zeroth }, _) => Prior::Identity,
                (_, Some(threshold)) => Prior::Gradient {
                    sqrt_weights: Some(huber::sqrt_weights(&x, grid.shape, threshold)),
                },
                (_, None) => Prior::Gradient { sqrt_weights: None },
            };
            let aug = AugmentedOperator::new(
                &op,
                op.n_rows(),
                grid.shape,
                alpha,
                prior,
                support.as_deref(),
            );
            let b = aug.rhs(&observed);
            let outcome = lsmr(&aug, &b, Some(&x), &opts);
            debug!(
                "{} round {}: {} LSMR iterations, stop {:?}",
                self.config.regularization.tag(),
                round,
                outcome.iterations,
                outcome.stop
            );
            iterations += outcome.iterations;
            solves += 1;
            residual_history.extend(outcome.residual_history);
            stop = outcome.stop;
            x = outcome.x;
        }

        let converged = stop.reached_tolerance();
        if !converged {
            warn!(
                "solver stopped without reaching tolerance {:e} ({:?}, {} iterations); \
                 returning the last iterate",
                self.config.tolerance, stop, iterations
            );
        }

        let data_residual = op
            .apply(&x)
            .iter()
            .zip(&observed)
            .map(|(p, y)| (p - y) * (p - y))
            .sum::<f64>();
        let prior_residual = self.prior_residual(&x, grid.shape);
        let cost = data_residual + alpha * prior_residual;
        let elapsed = start.elapsed();
        info!(
            "{} reconstruction (alpha = {}): {} iterations in {:.2?}, data residual {:.3e}, prior {:.3e}",
            self.config.regularization.tag(),
            alpha,
            iterations,
            elapsed,
            data_residual,
            prior_residual
        );

        let volume = Volume::from_flat(grid, &x)?;
        let report = SolveReport {
            regularization: self.config.regularization.tag(),
            alpha,
            iterations,
            solves,
            stop,
            converged,
            residual_history,
            data_residual,
            prior_residual,
            cost,
            zero_filled_voxels,
            elapsed,
        };
        Ok((volume, report))
    }

    fn prior_residual(&self, x: &[f64], shape: [usize; 3]) -> f64 {
        match self.config.regularization {
            Regularization::Tikhonov {
                order: TikhonovOrder::Zeroth,
            } => x.iter().map(|v| v * v).sum(),
            Regularization::Tikhonov {
                order: TikhonovOrder::First,
            } => {
                let mut g = vec![0.0; 3 * x.len()];
                gradient(x, shape, &mut g);
                g.iter().map(|v| v * v).sum()
            }
            Regularization::Huber { threshold, .. } => huber::huber_energy(x, shape, threshold),
        }
    }

    /// Voxels the data reaches, or `None` if it reaches all of them.
    fn support(&self, coverage: &[f64], grid: &Grid) -> Result<Option<Vec<bool>>> {
        let uncovered: Vec<usize> = coverage
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c <= 0.0)
            .map(|(v, _)| v)
            .collect();
        if uncovered.is_empty() {
            return Ok(None);
        }
        let mut lower = [usize::MAX; 3];
        let mut upper = [0usize; 3];
        for &v in &uncovered {
            let idx = grid.unflatten(v);
            for a in 0..3 {
                lower[a] = lower[a].min(idx[a]);
                upper[a] = upper[a].max(idx[a]);
            }
        }
        match self.config.ill_posed_policy {
            IllPosedPolicy::Fail => Err(SrrError::IllPosedRegion {
                voxels: uncovered.len(),
                lower,
                upper,
            }),
            IllPosedPolicy::ZeroFill => {
                warn!(
                    "{} voxel(s) in {:?}..={:?} receive no slice data and are pinned to zero",
                    uncovered.len(),
                    lower,
                    upper
                );
                Ok(Some(coverage.iter().map(|&c| c > 0.0).collect()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IllPosedPolicy;
    use crate::stack::StackGeometry;
    use nalgebra::{Matrix3, Vector3};
    use ndarray::Array3;

    fn stack(n_slices: usize) -> Stack {
        let geometry = StackGeometry {
            origin: Vector3::new(0.0, 0.0, 0.5),
            spacing: Vector3::new(1.0, 1.0, 2.0),
            direction: Matrix3::identity(),
            slice_step: None,
            psf: None,
        };
        let images = Array3::from_shape_fn((n_slices, 6, 6), |(k, i, j)| (1 + k + i * j) as f32);
        Stack::from_arrays("axial", &images, None, &geometry).unwrap()
    }

    fn grid(nz: usize) -> Grid {
        Grid::isotropic([6, 6, nz], Vector3::zeros(), 1.0).unwrap()
    }

    #[test]
    fn uncovered_voxels_fail_by_default() {
        // Two slices reach z ≤ 5; the grid extends to z = 11.
        let stacks = [stack(2)];
        let config = ReconstructionConfig::default();
        let err = Solver::new(&config)
            .unwrap()
            .solve(&stacks, &Volume::zeros(&grid(12)), 3)
            .unwrap_err();
        match err {
            SrrError::IllPosedRegion { lower, upper, .. } => {
                assert_eq!(lower[0], 0);
                assert_eq!(upper, [5, 5, 11]);
                assert!(lower[2] >= 5);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn zero_fill_pins_uncovered_voxels() {
        let stacks = [stack(2)];
        let config = ReconstructionConfig {
            ill_posed_policy: IllPosedPolicy::ZeroFill,
            ..Default::default()
        };
        let initial = Volume::from_flat(&grid(12), &vec![1.0; 6 * 6 * 12]).unwrap();
        let (volume, report) = Solver::new(&config)
            .unwrap()
            .solve(&stacks, &initial, 5)
            .unwrap();
        assert!(report.zero_filled_voxels > 0);
        assert_eq!(volume.data()[[2, 2, 11]], 0.0);
        assert!(volume.data()[[2, 2, 1]] != 0.0);
    }

    #[test]
    fn anisotropic_grid_is_rejected() {
        let stacks = [stack(3)];
        let config = ReconstructionConfig::default();
        let g = Grid::new(
            [6, 6, 6],
            Vector3::zeros(),
            Vector3::new(1.0, 1.0, 2.0),
            Matrix3::identity(),
        )
        .unwrap();
        let err = Solver::new(&config)
            .unwrap()
            .solve(&stacks, &Volume::zeros(&g), 3)
            .unwrap_err();
        assert!(matches!(err, SrrError::GeometryMismatch(_)));
    }

    #[test]
    fn iteration_cap_is_reported_not_fatal() {
        let stacks = [stack(3)];
        let config = ReconstructionConfig {
            tolerance: 1e-14,
            ..Default::default()
        };
        let (_, report) = Solver::new(&config)
            .unwrap()
            .solve(&stacks, &Volume::zeros(&grid(6)), 1)
            .unwrap();
        assert_eq!(report.iterations, 1);
        assert!(!report.converged);
        assert_eq!(report.stop, LsmrStop::IterationLimit);
    }

    #[test]
    fn report_cost_combines_terms() {
        let stacks = [stack(3)];
        let config = ReconstructionConfig::default();
        let (_, report) = Solver::new(&config)
            .unwrap()
            .solve(&stacks, &Volume::zeros(&grid(6)), 5)
            .unwrap();
        let expected = report.data_residual + config.alpha * report.prior_residual;
        assert!((report.cost - expected).abs() <= 1e-12 * expected.max(1.0));
        assert_eq!(report.regularization, "TK1");
    }
}
