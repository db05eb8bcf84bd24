//! Reconstruction configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SrrError};
use crate::operator::OperatorContext;
use crate::psf::DeconvolutionMode;

/// Order of the Tikhonov prior: `‖x‖²` or `‖∇x‖²`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TikhonovOrder {
    Zeroth,
    #[default]
    First,
}

/// Regularization functional.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Regularization {
    Tikhonov {
        #[serde(default)]
        order: TikhonovOrder,
    },
    /// Huber penalty on the gradient magnitude, solved by reweighting.
    Huber {
        /// Gradient magnitude at which the penalty turns linear.
        threshold: f64,
        /// Reweighting rounds.
        #[serde(default = "default_huber_iterations")]
        iterations: usize,
    },
}

impl Default for Regularization {
    fn default() -> Self {
        Regularization::Tikhonov {
            order: TikhonovOrder::First,
        }
    }
}

impl Regularization {
    /// Short tag used in output names.
    pub fn tag(&self) -> &'static str {
        match self {
            Regularization::Tikhonov {
                order: TikhonovOrder::Zeroth,
            } => "TK0",
            Regularization::Tikhonov {
                order: TikhonovOrder::First,
            } => "TK1",
            Regularization::Huber { .. } => "HuberL2",
        }
    }
}

fn default_huber_iterations() -> usize {
    5
}

/// What to do with voxels that no valid slice pixel reaches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IllPosedPolicy {
    #[default]
    Fail,
    /// Pin uncovered voxels to zero and solve for the rest.
    ZeroFill,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconstructionConfig {
    pub regularization: Regularization,
    /// Regularization weight α.
    pub alpha: f64,
    /// Inner solver iterations per reconstruction.
    pub iter_max: usize,
    /// Inner iterations of the first reconstruction; `iter_max` if unset.
    pub iter_max_first: Option<usize>,
    /// Number of (motion correction, reconstruction) cycles after the first
    /// reconstruction.
    pub two_step_cycles: usize,
    /// Relative tolerance of the least-squares solver.
    pub tolerance: f64,
    pub ill_posed_policy: IllPosedPolicy,
    /// Isotropic reconstruction spacing in mm.
    pub resolution: Option<f64>,
    /// Gaussian PSF support in standard deviations.
    pub psf_cutoff: f64,
    pub deconvolution: DeconvolutionMode,
    pub parallel: bool,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            regularization: Regularization::default(),
            alpha: 0.03,
            iter_max: 10,
            iter_max_first: None,
            two_step_cycles: 3,
            tolerance: 1e-6,
            ill_posed_policy: IllPosedPolicy::Fail,
            resolution: None,
            psf_cutoff: 3.0,
            deconvolution: DeconvolutionMode::Full3d,
            parallel: true,
        }
    }
}

impl ReconstructionConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| SrrError::io(format!("Failed to read config {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| {
            SrrError::invalid_configuration(format!(
                "Failed to parse config {}: {e}",
                path.display()
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(SrrError::invalid_configuration(msg));
        if !(self.alpha.is_finite() && self.alpha >= 0.0) {
            return bad(format!("alpha must be finite and non-negative, got {}", self.alpha));
        }
        if self.iter_max == 0 || self.iter_max_first == Some(0) {
            return bad("iteration caps must be at least 1".into());
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return bad(format!("tolerance must be positive, got {}", self.tolerance));
        }
        if !(self.psf_cutoff.is_finite() && self.psf_cutoff > 0.0) {
            return bad(format!("psf_cutoff must be positive, got {}", self.psf_cutoff));
        }
        self.deconvolution.validate()?;
        if let Some(r) = self.resolution {
            if !(r.is_finite() && r > 0.0) {
                return bad(format!("resolution must be positive, got {r}"));
            }
        }
        if let Regularization::Huber {
            threshold,
            iterations,
        } = self.regularization
        {
            if !(threshold.is_finite() && threshold > 0.0) {
                return bad(format!("Huber threshold must be positive, got {threshold}"));
            }
            if iterations == 0 {
                return bad("Huber iterations must be at least 1".into());
            }
        }
        Ok(())
    }

    pub fn first_iter_max(&self) -> usize {
        self.iter_max_first.unwrap_or(self.iter_max)
    }

    pub fn with_alpha(&self, alpha: f64) -> Self {
        Self {
            alpha,
            ..self.clone()
        }
    }

    pub fn operator_context(&self) -> OperatorContext {
        OperatorContext {
            psf_cutoff: self.psf_cutoff,
            parallel: self.parallel,
            deconvolution: self.deconvolution,
        }
    }

    /// Output name encoding the reconstruction setting, e.g.
    /// `recon_stacks3_TK1_lsmr_alpha0p03_itermax10`.
    pub fn setting_specific_name(&self, prefix: &str, n_stacks: usize) -> String {
        let mut name = format!("{prefix}_stacks{n_stacks}");
        if self.alpha > 0.0 {
            name.push('_');
            name.push_str(self.regularization.tag());
        }
        name.push_str(&format!("_lsmr_alpha{}_itermax{}", self.alpha, self.iter_max));
        name.replace('.', "p")
    }
}
