//! Alternation between volume reconstruction and slice motion correction.
//!
//! ```text
//! Init → Reconstructing(0) → MotionCorrecting(1) → Reconstructing(1) → …
//!      → MotionCorrecting(N) → Reconstructing(N) → Converged
//! ```
//!
//! The first reconstruction uses `iter_max_first` iterations; each later one
//! uses `iter_max` and starts from the previous volume. With
//! `two_step_cycles = 0` the driver is never called. Cancellation is honoured
//! between cycles only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::info;
use serde::Serialize;

use crate::config::ReconstructionConfig;
use crate::error::{Result, SrrError};
use crate::motion::{check_shape, into_driver_failure, MotionCorrection};
use crate::solver::{SolveReport, Solver};
use crate::stack::{apply_transform_set, transform_set, Stack, TransformSet};
use crate::volume::Volume;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoopState {
    Init,
    Reconstructing { cycle: usize },
    MotionCorrecting { cycle: usize },
    Converged,
}

#[derive(Debug, Clone)]
pub struct TwoStepOutcome {
    pub volume: Volume,
    /// Input stacks carrying the final transforms.
    pub stacks: Vec<Stack>,
    pub transforms: TransformSet,
    /// One report per reconstruction, in order.
    pub reports: Vec<SolveReport>,
    /// States visited, in order.
    pub states: Vec<LoopState>,
}

pub struct TwoStepReconstruction<'c, D> {
    config: &'c ReconstructionConfig,
    driver: D,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'c, D: MotionCorrection> TwoStepReconstruction<'c, D> {
    pub fn new(config: &'c ReconstructionConfig, driver: D) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            driver,
            cancel: None,
        })
    }

    /// Stop at the next cycle boundary once `flag` is set.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn into_driver(self) -> D {
        self.driver
    }

    fn check_cancelled(&self, completed_cycles: usize) -> Result<()> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::SeqCst) => {
                info!("two-step reconstruction cancelled after {completed_cycles} cycle(s)");
                Err(SrrError::Cancelled { completed_cycles })
            }
            _ => Ok(()),
        }
    }

    pub fn run(&mut self, mut stacks: Vec<Stack>, initial: Volume) -> Result<TwoStepOutcome> {
        let solver = Solver::new(self.config)?;
        let cycles = self.config.two_step_cycles;
        let mut states = vec![LoopState::Init];
        let mut reports = Vec::new();

        self.check_cancelled(0)?;
        states.push(LoopState::Reconstructing { cycle: 0 });
        info!(
            "two-step: initial reconstruction of {} stack(s), {} iterations",
            stacks.len(),
            self.config.first_iter_max()
        );
        let (mut volume, report) = solver.solve(&stacks, &initial, self.config.first_iter_max())?;
        reports.push(report);

        for cycle in 1..=cycles {
            self.check_cancelled(cycle - 1)?;

            states.push(LoopState::MotionCorrecting { cycle });
            info!("two-step cycle {cycle}/{cycles}: motion correction");
            let current = transform_set(&stacks);
            let updated = self
                .driver
                .correct(&volume, &stacks, &current)
                .map_err(into_driver_failure)?;
            check_shape(&current, &updated)?;
            apply_transform_set(&mut stacks, &updated).map_err(into_driver_failure)?;

            states.push(LoopState::Reconstructing { cycle });
            info!("two-step cycle {cycle}/{cycles}: reconstruction");
            let (next, report) = solver.solve(&stacks, &volume, self.config.iter_max)?;
            volume = next;
            reports.push(report);
        }

        states.push(LoopState::Converged);
        Ok(TwoStepOutcome {
            volume,
            transforms: transform_set(&stacks),
            stacks,
            reports,
            states,
        })
    }
}

/// One reconstruction with `iter_max_first` iterations and no motion
/// correction.
pub fn reconstruct_volume(
    stacks: &[Stack],
    initial: &Volume,
    config: &ReconstructionConfig,
) -> Result<(Volume, SolveReport)> {
    Solver::new(config)?.solve(stacks, initial, config.first_iter_max())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Grid, RigidParameters, RigidTransform};
    use crate::motion::StaticDriver;
    use crate::stack::StackGeometry;
    use nalgebra::{Matrix3, Vector3};
    use ndarray::Array3;

    fn stacks() -> Vec<Stack> {
        let geometry = StackGeometry {
            origin: Vector3::new(0.0, 0.0, 0.5),
            spacing: Vector3::new(1.0, 1.0, 2.0),
            direction: Matrix3::identity(),
            slice_step: None,
            psf: None,
        };
        let images = Array3::from_shape_fn((3, 6, 6), |(k, i, j)| (k + i + 2 * j) as f32);
        vec![Stack::from_arrays("axial", &images, None, &geometry).unwrap()]
    }

    fn initial() -> Volume {
        Volume::zeros(&Grid::isotropic([6, 6, 6], Vector3::zeros(), 1.0).unwrap())
    }

    /// Counts calls and nudges every slice along x.
    struct Nudge(usize);

    impl MotionCorrection for Nudge {
        fn correct(
            &mut self,
            _volume: &Volume,
            _stacks: &[Stack],
            transforms: &TransformSet,
        ) -> Result<TransformSet> {
            self.0 += 1;
            let step = RigidTransform::from_parameters(&RigidParameters {
                rotation: [0.0; 3],
                translation: [0.01, 0.0, 0.0],
            });
            Ok(transforms
                .iter()
                .map(|s| s.iter().map(|t| step.compose(t)).collect())
                .collect())
        }
    }

    struct Failing;

    impl MotionCorrection for Failing {
        fn correct(&mut self, _: &Volume, _: &[Stack], _: &TransformSet) -> Result<TransformSet> {
            Err(SrrError::io("registration crashed"))
        }
    }

    #[test]
    fn zero_cycles_never_call_the_driver() {
        let config = ReconstructionConfig {
            two_step_cycles: 0,
            ..Default::default()
        };
        let mut run = TwoStepReconstruction::new(&config, Nudge(0)).unwrap();
        let outcome = run.run(stacks(), initial()).unwrap();
        assert_eq!(run.driver().0, 0);
        assert_eq!(outcome.reports.len(), 1);
        assert_eq!(
            outcome.states,
            vec![
                LoopState::Init,
                LoopState::Reconstructing { cycle: 0 },
                LoopState::Converged
            ]
        );
    }

    #[test]
    fn cycles_alternate_and_update_transforms() {
        let config = ReconstructionConfig {
            two_step_cycles: 2,
            iter_max: 3,
            iter_max_first: Some(5),
            ..Default::default()
        };
        let mut run = TwoStepReconstruction::new(&config, Nudge(0)).unwrap();
        let outcome = run.run(stacks(), initial()).unwrap();
        assert_eq!(run.driver().0, 2);
        assert_eq!(outcome.reports.len(), 3);
        assert!(outcome.reports[0].iterations <= 5);
        assert!(outcome.reports[1].iterations <= 3);
        assert_eq!(outcome.states[3], LoopState::Reconstructing { cycle: 1 });
        let shift = outcome.transforms[0][0].parameters().translation[0];
        assert!((shift - 0.02).abs() < 1e-12);
    }

    #[test]
    fn driver_errors_abort_as_external_failures() {
        let config = ReconstructionConfig {
            two_step_cycles: 1,
            ..Default::default()
        };
        let err = TwoStepReconstruction::new(&config, Failing)
            .unwrap()
            .run(stacks(), initial())
            .unwrap_err();
        assert!(matches!(err, SrrError::ExternalDriverFailure(_)));
    }

    #[test]
    fn states_serialize_for_reports() {
        let json = serde_json::to_string(&[
            LoopState::Init,
            LoopState::MotionCorrecting { cycle: 2 },
        ])
        .unwrap();
        assert_eq!(json, r#"["Init",{"MotionCorrecting":{"cycle":2}}]"#);
    }

    #[test]
    fn unbounded_cycle_count_ends_at_the_first_failure() {
        let config = ReconstructionConfig {
            two_step_cycles: usize::MAX,
            iter_max: 2,
            ..Default::default()
        };
        let err = TwoStepReconstruction::new(&config, Failing)
            .unwrap()
            .run(stacks(), initial())
            .unwrap_err();
        assert!(matches!(err, SrrError::ExternalDriverFailure(_)));
    }

    #[test]
    fn cancellation_stops_before_the_first_solve() {
        let config = ReconstructionConfig::default();
        let flag = Arc::new(AtomicBool::new(true));
        let err = TwoStepReconstruction::new(&config, StaticDriver)
            .unwrap()
            .with_cancel_flag(flag)
            .run(stacks(), initial())
            .unwrap_err();
        assert!(matches!(err, SrrError::Cancelled { completed_cycles: 0 }));
    }

    #[test]
    fn single_shot_matches_first_reconstruction() {
        let config = ReconstructionConfig {
            two_step_cycles: 0,
            iter_max_first: Some(4),
            ..Default::default()
        };
        let (volume, _) = reconstruct_volume(&stacks(), &initial(), &config).unwrap();
        let outcome = TwoStepReconstruction::new(&config, StaticDriver)
            .unwrap()
            .run(stacks(), initial())
            .unwrap();
        assert_eq!(volume, outcome.volume);
    }
}
