//! Short-sprint profiling from split times and radar traces.
//!
//! Fits the mono-exponential sprint model `v(t) = MSS * (1 - exp(-t/TAU))`
//! to raw observations, derives secondary kinematic and kinetic quantities
//! (maximal acceleration, power, air resistance, force-velocity profile),
//! and locates critical distances/times on the fitted curve.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod air;
pub mod critical;
pub mod estimate;
pub mod fv;
pub mod kinematics;
pub mod mixed;
mod solver;

pub use air::{AirConditions, Anthropometrics};
pub use critical::{CriticalPoint, CriticalRegion};
pub use estimate::{CorrectionModel, FitOptions, StartValues, TimeCorrection};
pub use fv::{FvOptions, FvProfile, FvSeries};
pub use kinematics::Corrections;
pub use mixed::{MixedFitOptions, RadarObservation, RandomEffects, SplitObservation};

#[derive(Error, Debug)]
pub enum SprintError {
    #[error("invalid input: {0}")]
    Input(String),
    #[error("solver failed to converge: {0}")]
    Convergence(String),
    #[error("domain error: {0}")]
    Domain(String),
    #[error("degenerate mixed-model fit: {0}")]
    DegenerateFit(String),
}

/// Fitted mono-exponential sprint parameters.
///
/// `mac` and `pmax` are derived, never stored, so they are exact for every
/// parameter set this crate produces.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SprintParameters {
    /// Maximal sprinting speed (m/s), the model asymptote.
    pub mss: f64,
    /// Relative acceleration time constant (s).
    pub tau: f64,
    /// Additive start-technique time offset (s); 0 when not modeled.
    pub time_correction: f64,
    /// Additive start-technique distance offset (m); 0 when not modeled.
    pub distance_correction: f64,
}

impl SprintParameters {
    /// Maximal acceleration (m/s^2), the model value at t = 0.
    pub fn mac(&self) -> f64 {
        self.mss / self.tau
    }

    /// Maximal theoretical relative power (W/kg), MSS * MAC / 4.
    pub fn pmax(&self) -> f64 {
        self.mss * self.mac() / 4.0
    }

    /// Corrections carried by this parameter set, for the predict functions.
    pub fn corrections(&self) -> Corrections {
        Corrections {
            time: self.time_correction,
            distance: self.distance_correction,
        }
    }
}

/// Goodness-of-fit summary for a converged estimate.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ModelFit {
    /// Residual standard error, sqrt(RSS / (n - p)).
    pub rse: f64,
    /// Squared Pearson correlation of observed vs predicted.
    pub r_squared: f64,
    pub min_err: f64,
    pub max_err: f64,
    pub rmse: f64,
    pub mae: f64,
}

impl ModelFit {
    pub(crate) fn from_observations(observed: &[f64], predicted: &[f64], n_params: usize) -> Self {
        let n = observed.len();
        let residuals: Vec<f64> = observed
            .iter()
            .zip(predicted.iter())
            .map(|(o, p)| o - p)
            .collect();
        let rss: f64 = residuals.iter().map(|r| r * r).sum();
        let dof = n.saturating_sub(n_params).max(1) as f64;
        let mean_obs = observed.iter().sum::<f64>() / n as f64;
        let mean_pred = predicted.iter().sum::<f64>() / n as f64;
        let mut cov = 0.0;
        let mut var_obs = 0.0;
        let mut var_pred = 0.0;
        for (o, p) in observed.iter().zip(predicted.iter()) {
            cov += (o - mean_obs) * (p - mean_pred);
            var_obs += (o - mean_obs) * (o - mean_obs);
            var_pred += (p - mean_pred) * (p - mean_pred);
        }
        let r = if var_obs > 0.0 && var_pred > 0.0 {
            cov / (var_obs.sqrt() * var_pred.sqrt())
        } else {
            0.0
        };
        ModelFit {
            rse: (rss / dof).sqrt(),
            r_squared: r * r,
            min_err: residuals.iter().copied().fold(f64::INFINITY, f64::min),
            max_err: residuals.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            rmse: (rss / n as f64).sqrt(),
            mae: residuals.iter().map(|r| r.abs()).sum::<f64>() / n as f64,
        }
    }
}

/// Diagnostics from the underlying nonlinear least-squares solver.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SolverReport {
    /// Final objective value (half the residual sum of squares).
    pub objective: f64,
    pub evaluations: usize,
    pub termination: String,
}

/// Leave-one-out cross-validation output: one refit parameter set and one
/// held-out prediction per excluded observation, in input order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoocvResult {
    pub parameters: Vec<SprintParameters>,
    pub predicted: Vec<f64>,
}

/// Result of a single-athlete fit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FitResult {
    pub parameters: SprintParameters,
    pub model_fit: ModelFit,
    /// Predicted target values, aligned 1:1 with the fitted observations.
    pub predicted: Vec<f64>,
    pub solver: SolverReport,
    pub loocv: Option<LoocvResult>,
}

/// Result of a mixed-effects fit across multiple athletes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MixedFitResult {
    /// Fixed-effect parameter set shared across athletes.
    pub fixed: SprintParameters,
    /// Per-athlete parameter sets, fixed effects plus that athlete's
    /// random-effect deviations.
    pub random: BTreeMap<String, SprintParameters>,
    pub model_fit: ModelFit,
    pub predicted: Vec<f64>,
    pub solver: SolverReport,
}
