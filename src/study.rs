//! Regularization parameter studies.
//!
//! Every α of a sweep gets its own two-step run on private copies of the input
//! stacks and initial volume; no run sees another's transforms or volume. The
//! resulting volumes are scored against a reference image.

use log::info;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::ReconstructionConfig;
use crate::error::{Result, SrrError};
use crate::metrics::Similarity;
use crate::motion::MotionCorrection;
use crate::solver::SolveReport;
use crate::stack::Stack;
use crate::two_step::TwoStepReconstruction;
use crate::volume::Volume;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepSpacing {
    #[default]
    Linear,
    Logarithmic,
}

/// `count` values of α from `low` to `high` inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlphaSweep {
    pub low: f64,
    pub high: f64,
    pub count: usize,
    #[serde(default)]
    pub spacing: SweepSpacing,
}

impl AlphaSweep {
    pub fn linear(low: f64, high: f64, count: usize) -> Self {
        Self {
            low,
            high,
            count,
            spacing: SweepSpacing::Linear,
        }
    }

    pub fn logarithmic(low: f64, high: f64, count: usize) -> Self {
        Self {
            spacing: SweepSpacing::Logarithmic,
            ..Self::linear(low, high, count)
        }
    }

    pub fn values(&self) -> Result<Vec<f64>> {
        let bad = |msg: String| Err(SrrError::invalid_configuration(msg));
        if self.count == 0 {
            return bad("alpha sweep needs at least one value".into());
        }
        if !(self.low.is_finite() && self.high.is_finite() && self.low >= 0.0) {
            return bad(format!(
                "alpha range [{}, {}] must be finite and non-negative",
                self.low, self.high
            ));
        }
        if self.low > self.high {
            return bad(format!("alpha range [{}, {}] is reversed", self.low, self.high));
        }
        if self.spacing == SweepSpacing::Logarithmic && self.low <= 0.0 {
            return bad("logarithmic alpha sweep needs a positive lower bound".into());
        }
        if self.count == 1 {
            return Ok(vec![self.low]);
        }
        let last = (self.count - 1) as f64;
        let mut values: Vec<f64> = (0..self.count)
            .map(|i| {
                let t = i as f64 / last;
                match self.spacing {
                    SweepSpacing::Linear => self.low + t * (self.high - self.low),
                    SweepSpacing::Logarithmic => {
                        (self.low.ln() + t * (self.high.ln() - self.low.ln())).exp()
                    }
                }
            })
            .collect();
        values[0] = self.low;
        values[self.count - 1] = self.high;
        Ok(values)
    }
}

#[derive(Debug, Clone)]
pub struct ParameterStudyPoint {
    pub alpha: f64,
    pub volume: Volume,
    pub score: f64,
    pub reports: Vec<SolveReport>,
}

#[derive(Debug, Clone)]
pub struct StudyReport {
    pub similarity: Similarity,
    /// Ordered by α as swept.
    pub points: Vec<ParameterStudyPoint>,
    /// Index of the best-scoring point.
    pub best: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PointSummary {
    pub alpha: f64,
    pub score: f64,
    pub iterations: usize,
    pub converged: bool,
    pub cost: f64,
    pub elapsed_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudySummary {
    pub similarity: Similarity,
    pub best_alpha: f64,
    pub best_score: f64,
    pub points: Vec<PointSummary>,
}

impl StudyReport {
    pub fn best_point(&self) -> &ParameterStudyPoint {
        &self.points[self.best]
    }

    pub fn best_alpha(&self) -> f64 {
        self.best_point().alpha
    }

    pub fn into_best_volume(mut self) -> Volume {
        self.points.swap_remove(self.best).volume
    }

    /// α and score table without the volumes.
    pub fn summary(&self) -> StudySummary {
        StudySummary {
            similarity: self.similarity,
            best_alpha: self.best_alpha(),
            best_score: self.best_point().score,
            points: self
                .points
                .iter()
                .map(|p| PointSummary {
                    alpha: p.alpha,
                    score: p.score,
                    iterations: p.reports.iter().map(|r| r.iterations).sum(),
                    converged: p.reports.iter().all(|r| r.converged),
                    cost: p.reports.last().map_or(f64::NAN, |r| r.cost),
                    elapsed_seconds: p.reports.iter().map(|r| r.elapsed.as_secs_f64()).sum(),
                })
                .collect(),
        }
    }
}

pub struct ParameterStudy<'a> {
    config: &'a ReconstructionConfig,
    sweep: AlphaSweep,
    similarity: Similarity,
    reference: &'a Volume,
    mask: Option<&'a [bool]>,
}

impl<'a> ParameterStudy<'a> {
    pub fn new(config: &'a ReconstructionConfig, sweep: AlphaSweep, reference: &'a Volume) -> Self {
        Self {
            config,
            sweep,
            similarity: Similarity::default(),
            reference,
            mask: None,
        }
    }

    pub fn with_similarity(mut self, similarity: Similarity) -> Self {
        self.similarity = similarity;
        self
    }

    /// Score only voxels where `mask` is true.
    pub fn with_mask(mut self, mask: &'a [bool]) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Run the sweep. `make_driver` builds a fresh driver for each α.
    pub fn run<D, F>(&self, stacks: &[Stack], initial: &Volume, make_driver: F) -> Result<StudyReport>
    where
        D: MotionCorrection,
        F: Fn(f64) -> D + Sync,
    {
        let alphas = self.sweep.values()?;
        self.config.validate()?;
        if !self.reference.grid().same_geometry(initial.grid()) {
            return Err(SrrError::geometry(
                "reference volume grid differs from the reconstruction grid",
            ));
        }
        if let Some(m) = self.mask {
            if m.len() != initial.grid().len() {
                return Err(SrrError::shape(&[initial.grid().len()], &[m.len()]));
            }
            if !m.contains(&true) {
                return Err(SrrError::invalid_configuration(
                    "parameter study mask selects no voxels",
                ));
            }
        }
        info!(
            "parameter study: {} alpha value(s) in [{}, {}], scored by {:?}",
            alphas.len(),
            self.sweep.low,
            self.sweep.high,
            self.similarity
        );

        let run_one = |alpha: f64| -> Result<ParameterStudyPoint> {
            let config = self.config.with_alpha(alpha);
            let outcome = TwoStepReconstruction::new(&config, make_driver(alpha))?
                .run(stacks.to_vec(), initial.clone())?;
            let score = self
                .similarity
                .score(&outcome.volume, self.reference, self.mask)?;
            info!("alpha = {alpha}: {:?} = {score:.6}", self.similarity);
            Ok(ParameterStudyPoint {
                alpha,
                volume: outcome.volume,
                score,
                reports: outcome.reports,
            })
        };
        let points: Vec<ParameterStudyPoint> = if self.config.parallel {
            alphas.par_iter().map(|&a| run_one(a)).collect::<Result<_>>()?
        } else {
            alphas.iter().map(|&a| run_one(a)).collect::<Result<_>>()?
        };

        let mut best = 0;
        for (i, p) in points.iter().enumerate().skip(1) {
            if self.similarity.better(p.score, points[best].score) || points[best].score.is_nan() {
                best = i;
            }
        }
        info!("parameter study: best alpha = {}", points[best].alpha);
        Ok(StudyReport {
            similarity: self.similarity,
            points,
            best,
        })
    }
}
