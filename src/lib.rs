//! SRR-Core: slice-to-volume super-resolution reconstruction
//!
//! Reconstructs one isotropic high-resolution volume from several stacks of
//! motion-affected 2D slices.
//!
//! # Modules
//! - `geometry`: grids and rigid transforms in the shared world frame
//! - `psf`: slice point-spread functions and their volume-frame kernels
//! - `stack`: slices, stacks and per-slice transforms
//! - `operator`: acquisition model (forward and exact adjoint)
//! - `solver`: LSMR, Tikhonov and Huber regularized reconstruction
//! - `motion`: motion-correction drivers
//! - `two_step`: reconstruction / motion-correction alternation
//! - `study`: regularization parameter sweeps
//! - `metrics`: similarity to a reference volume
//! - `simulate`: synthetic stacks from a known volume
//! - `io`: manifests, volumes and transform files

// Core model
pub mod error;
pub mod geometry;
pub mod psf;
pub mod stack;
pub mod volume;

// Reconstruction
pub mod config;
pub mod operator;
pub mod solver;
pub mod motion;
pub mod two_step;
pub mod study;

// Support
pub mod metrics;
pub mod simulate;
pub mod io;

pub use config::{IllPosedPolicy, ReconstructionConfig, Regularization, TikhonovOrder};
pub use error::{Result, SrrError};
pub use geometry::{Grid, RigidParameters, RigidTransform};
pub use motion::{CommandDriver, MotionCorrection, StaticDriver};
pub use operator::{AcquisitionOperator, LinearOperator, OperatorContext};
pub use psf::{DeconvolutionMode, Psf, PsfKernel};
pub use solver::{SolveReport, Solver};
pub use stack::{Slice, Stack, StackGeometry, TransformSet};
pub use study::{AlphaSweep, ParameterStudy, StudyReport};
pub use two_step::{reconstruct_volume, TwoStepOutcome, TwoStepReconstruction};
pub use volume::{initial_estimate, reconstruction_grid, Volume};
