//! Single-athlete estimators: split times and radar velocity traces.
//!
//! Both targets share one equation builder parameterized by the correction
//! variant; the split-time model goes through the Lambert-W time inversion,
//! the radar model uses the velocity form directly. Leave-one-out
//! cross-validation refits the same model N times with one observation held
//! out each time.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::kinematics::{time_at, velocity_at};
use crate::solver::{fit_curve, NlsOptions};
use crate::{FitResult, LoocvResult, ModelFit, SprintError, SprintParameters};

/// Which start-technique corrections are free parameters of the fit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrectionModel {
    /// Corrections fixed by the caller (possibly zero).
    None,
    /// Estimate the time correction alongside MSS and TAU.
    TimeOnly,
    /// Estimate both time and distance corrections.
    TimeAndDistance,
}

impl CorrectionModel {
    pub(crate) fn free_parameters(self) -> usize {
        match self {
            CorrectionModel::None => 2,
            CorrectionModel::TimeOnly => 3,
            CorrectionModel::TimeAndDistance => 4,
        }
    }
}

/// Caller-supplied fixed time correction for the plain fit variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TimeCorrection {
    Fixed(f64),
    /// One correction per observation, matched by position against the raw
    /// input (rows filtered from the working frame drop theirs too).
    PerObservation(Vec<f64>),
}

impl Default for TimeCorrection {
    fn default() -> Self {
        TimeCorrection::Fixed(0.0)
    }
}

/// Solver starting values. Convergence is sensitive to these; the defaults
/// suit adult sprinters but callers fitting unusual populations should
/// override them.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StartValues {
    pub mss: f64,
    pub tau: f64,
    pub time_correction: f64,
    pub distance_correction: f64,
}

impl Default for StartValues {
    fn default() -> Self {
        Self {
            mss: 7.0,
            tau: 0.8,
            time_correction: 0.0,
            distance_correction: 0.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitOptions {
    pub time_correction: TimeCorrection,
    /// Run leave-one-out cross-validation after the full fit.
    pub loocv: bool,
    pub start: StartValues,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            time_correction: TimeCorrection::default(),
            loocv: false,
            start: StartValues::default(),
            max_iterations: 100,
            tolerance: 1e-10,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    SplitTime,
    RadarVelocity,
}

/// Working frame: the solver-facing series plus what is needed to map
/// predictions back into the observation space.
#[derive(Clone)]
struct Frame {
    /// Primary coordinate as fed to the solver.
    xs: Vec<f64>,
    /// Target as fed to the solver.
    ys: Vec<f64>,
    /// Original observed target, for metrics and the predicted series.
    observed: Vec<f64>,
    /// Fixed per-row time corrections (zeros for estimated variants).
    tcs: Vec<f64>,
    target: Target,
    variant: CorrectionModel,
}

fn per_row_corrections(
    correction: &TimeCorrection,
    n: usize,
    variant: CorrectionModel,
) -> Result<Vec<f64>, SprintError> {
    match correction {
        TimeCorrection::Fixed(c) => {
            if !c.is_finite() {
                return Err(SprintError::Input(format!(
                    "time correction must be finite, got {c}"
                )));
            }
            Ok(vec![*c; n])
        }
        TimeCorrection::PerObservation(cs) => {
            if variant != CorrectionModel::None {
                return Err(SprintError::Input(
                    "per-observation time corrections only apply to the fixed-correction variants"
                        .to_string(),
                ));
            }
            if cs.len() != n {
                return Err(SprintError::Input(format!(
                    "expected {n} per-observation time corrections, got {}",
                    cs.len()
                )));
            }
            if let Some(bad) = cs.iter().find(|c| !c.is_finite()) {
                return Err(SprintError::Input(format!(
                    "time corrections must be finite, got {bad}"
                )));
            }
            Ok(cs.clone())
        }
    }
}

fn build_split_frame(
    distance: &[f64],
    time: &[f64],
    options: &FitOptions,
    variant: CorrectionModel,
) -> Result<Frame, SprintError> {
    if distance.len() != time.len() {
        return Err(SprintError::Input(format!(
            "distance and time lengths differ: {} vs {}",
            distance.len(),
            time.len()
        )));
    }
    if distance.is_empty() {
        return Err(SprintError::Input("no observations supplied".to_string()));
    }
    let tcs = per_row_corrections(&options.time_correction, distance.len(), variant)?;

    let mut xs = Vec::with_capacity(distance.len());
    let mut observed = Vec::with_capacity(distance.len());
    let mut kept_tcs = Vec::with_capacity(distance.len());
    let mut dropped = 0usize;
    for ((&d, &t), &tc) in distance.iter().zip(time.iter()).zip(tcs.iter()) {
        if !d.is_finite() || !t.is_finite() {
            return Err(SprintError::Input(format!(
                "non-finite observation (distance {d}, time {t})"
            )));
        }
        if d < 0.0 || t < 0.0 {
            return Err(SprintError::Input(format!(
                "negative observation (distance {d}, time {t})"
            )));
        }
        // Zero-distance and duplicate-distance rows are degenerate for the
        // time inversion and are dropped from the working frame.
        if d == 0.0 || xs.last() == Some(&d) {
            dropped += 1;
            continue;
        }
        xs.push(d);
        observed.push(t);
        kept_tcs.push(tc);
    }
    if dropped > 0 {
        debug!(dropped, "filtered degenerate split rows");
    }
    if xs.windows(2).any(|w| w[1] <= w[0]) {
        return Err(SprintError::Input(
            "distances must be strictly increasing".to_string(),
        ));
    }

    let ys = match variant {
        CorrectionModel::None => observed
            .iter()
            .zip(kept_tcs.iter())
            .map(|(t, c)| t + c)
            .collect(),
        _ => observed.clone(),
    };
    Ok(Frame {
        xs,
        ys,
        observed,
        tcs: kept_tcs,
        target: Target::SplitTime,
        variant,
    })
}

fn build_radar_frame(
    time: &[f64],
    velocity: &[f64],
    options: &FitOptions,
    variant: CorrectionModel,
) -> Result<Frame, SprintError> {
    if time.len() != velocity.len() {
        return Err(SprintError::Input(format!(
            "time and velocity lengths differ: {} vs {}",
            time.len(),
            velocity.len()
        )));
    }
    if time.is_empty() {
        return Err(SprintError::Input("no observations supplied".to_string()));
    }
    let tcs = per_row_corrections(&options.time_correction, time.len(), variant)?;
    for (&t, &v) in time.iter().zip(velocity.iter()) {
        if !t.is_finite() || !v.is_finite() {
            return Err(SprintError::Input(format!(
                "non-finite observation (time {t}, velocity {v})"
            )));
        }
        if t < 0.0 {
            return Err(SprintError::Input(format!("negative time value {t}")));
        }
    }
    // A fixed correction shifts the radar time axis directly.
    let xs = match variant {
        CorrectionModel::None => time.iter().zip(tcs.iter()).map(|(t, c)| t + c).collect(),
        _ => time.to_vec(),
    };
    Ok(Frame {
        xs,
        ys: velocity.to_vec(),
        observed: velocity.to_vec(),
        tcs,
        target: Target::RadarVelocity,
        variant,
    })
}

pub(crate) fn model_value(
    target: Target,
    variant: CorrectionModel,
    p: &[f64],
    x: f64,
) -> Result<f64, SprintError> {
    let mss = p[0];
    let tau = p[1];
    if !(mss.is_finite() && tau.is_finite() && mss > 0.0 && tau > 0.0) {
        return Err(SprintError::Domain(format!(
            "iterate left the parameter domain (MSS={mss}, TAU={tau})"
        )));
    }
    match (target, variant) {
        (Target::SplitTime, CorrectionModel::None) => time_at(x, mss, tau),
        (Target::SplitTime, CorrectionModel::TimeOnly) => Ok(time_at(x, mss, tau)? - p[2]),
        (Target::SplitTime, CorrectionModel::TimeAndDistance) => {
            Ok(time_at(x + p[3], mss, tau)? - p[2])
        }
        (Target::RadarVelocity, CorrectionModel::None) => Ok(velocity_at(x, mss, tau)),
        (Target::RadarVelocity, CorrectionModel::TimeOnly) => {
            Ok(velocity_at(x + p[2], mss, tau))
        }
        (Target::RadarVelocity, CorrectionModel::TimeAndDistance) => Err(SprintError::Input(
            "distance corrections do not apply to radar fits".to_string(),
        )),
    }
}

/// Prediction in the original observation space for one row of the frame.
fn predict_row(frame: &Frame, p: &[f64], idx: usize) -> Result<f64, SprintError> {
    let raw = model_value(frame.target, frame.variant, p, frame.xs[idx])?;
    match (frame.target, frame.variant) {
        (Target::SplitTime, CorrectionModel::None) => Ok(raw - frame.tcs[idx]),
        _ => Ok(raw),
    }
}

pub(crate) fn start_vector(variant: CorrectionModel, start: &StartValues) -> Vec<f64> {
    match variant {
        CorrectionModel::None => vec![start.mss, start.tau],
        CorrectionModel::TimeOnly => vec![start.mss, start.tau, start.time_correction],
        CorrectionModel::TimeAndDistance => vec![
            start.mss,
            start.tau,
            start.time_correction,
            start.distance_correction,
        ],
    }
}

fn parameters_from(
    variant: CorrectionModel,
    p: &[f64],
    options: &FitOptions,
) -> Result<SprintParameters, SprintError> {
    let mss = p[0];
    let tau = p[1];
    if !(mss.is_finite() && tau.is_finite() && mss > 0.0 && tau > 0.0) {
        return Err(SprintError::Convergence(format!(
            "solver converged to a physically invalid estimate (MSS={mss}, TAU={tau})"
        )));
    }
    let (time_correction, distance_correction) = match variant {
        CorrectionModel::None => {
            let tc = match &options.time_correction {
                TimeCorrection::Fixed(c) => *c,
                TimeCorrection::PerObservation(_) => 0.0,
            };
            (tc, 0.0)
        }
        CorrectionModel::TimeOnly => (p[2], 0.0),
        CorrectionModel::TimeAndDistance => (p[2], p[3]),
    };
    Ok(SprintParameters {
        mss,
        tau,
        time_correction,
        distance_correction,
    })
}

fn fit_frame(frame: &Frame, options: &FitOptions) -> Result<FitResult, SprintError> {
    let n_params = frame.variant.free_parameters();
    if frame.xs.len() <= n_params {
        return Err(SprintError::Input(format!(
            "{} observations cannot identify {} free parameters (need at least {})",
            frame.xs.len(),
            n_params,
            n_params + 1
        )));
    }
    let target = frame.target;
    let variant = frame.variant;
    let fit = fit_curve(
        &frame.xs,
        &frame.ys,
        start_vector(variant, &options.start),
        move |p, x| model_value(target, variant, p, x),
        &NlsOptions {
            max_iterations: options.max_iterations,
            tolerance: options.tolerance,
        },
    )?;
    let parameters = parameters_from(variant, &fit.params, options)?;
    let predicted: Vec<f64> = (0..frame.xs.len())
        .map(|i| predict_row(frame, &fit.params, i))
        .collect::<Result<_, _>>()?;
    let model_fit = ModelFit::from_observations(&frame.observed, &predicted, n_params);
    Ok(FitResult {
        parameters,
        model_fit,
        predicted,
        solver: fit.report,
        loocv: None,
    })
}

fn frame_without(frame: &Frame, idx: usize) -> Frame {
    let keep = |v: &[f64]| -> Vec<f64> {
        v.iter()
            .enumerate()
            .filter(|(i, _)| *i != idx)
            .map(|(_, &x)| x)
            .collect()
    };
    Frame {
        xs: keep(&frame.xs),
        ys: keep(&frame.ys),
        observed: keep(&frame.observed),
        tcs: keep(&frame.tcs),
        target: frame.target,
        variant: frame.variant,
    }
}

fn run_loocv(frame: &Frame, options: &FitOptions) -> Result<LoocvResult, SprintError> {
    let refit_options = FitOptions {
        loocv: false,
        ..options.clone()
    };
    let outcomes: Vec<Result<(SprintParameters, f64), SprintError>> = (0..frame.xs.len())
        .into_par_iter()
        .map(|i| {
            let reduced = frame_without(frame, i);
            let parameters = fit_frame(&reduced, &refit_options)?.parameters;
            // Held-out prediction from the reduced fit's parameter vector.
            let raw = match frame.variant {
                CorrectionModel::None => {
                    model_value(frame.target, frame.variant, &[parameters.mss, parameters.tau], frame.xs[i])?
                }
                CorrectionModel::TimeOnly => model_value(
                    frame.target,
                    frame.variant,
                    &[parameters.mss, parameters.tau, parameters.time_correction],
                    frame.xs[i],
                )?,
                CorrectionModel::TimeAndDistance => model_value(
                    frame.target,
                    frame.variant,
                    &[
                        parameters.mss,
                        parameters.tau,
                        parameters.time_correction,
                        parameters.distance_correction,
                    ],
                    frame.xs[i],
                )?,
            };
            let held_out = match (frame.target, frame.variant) {
                (Target::SplitTime, CorrectionModel::None) => raw - frame.tcs[i],
                _ => raw,
            };
            Ok((parameters, held_out))
        })
        .collect();

    let mut parameters = Vec::with_capacity(outcomes.len());
    let mut predicted = Vec::with_capacity(outcomes.len());
    for (i, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok((p, pred)) => {
                parameters.push(p);
                predicted.push(pred);
            }
            Err(e) => {
                return Err(SprintError::Convergence(format!(
                    "LOOCV refit excluding observation {i} failed: {e}"
                )));
            }
        }
    }
    Ok(LoocvResult {
        parameters,
        predicted,
    })
}

fn fit_with_loocv(frame: Frame, options: &FitOptions) -> Result<FitResult, SprintError> {
    let mut result = fit_frame(&frame, options)?;
    if options.loocv {
        result.loocv = Some(run_loocv(&frame, options)?);
    }
    Ok(result)
}

/// Fit {MSS, TAU} to split times with a caller-fixed time correction.
pub fn fit_splits(
    distance: &[f64],
    time: &[f64],
    options: &FitOptions,
) -> Result<FitResult, SprintError> {
    let frame = build_split_frame(distance, time, options, CorrectionModel::None)?;
    fit_with_loocv(frame, options)
}

/// Fit {MSS, TAU, time_correction} to split times.
pub fn fit_splits_with_time_correction(
    distance: &[f64],
    time: &[f64],
    options: &FitOptions,
) -> Result<FitResult, SprintError> {
    let frame = build_split_frame(distance, time, options, CorrectionModel::TimeOnly)?;
    fit_with_loocv(frame, options)
}

/// Fit {MSS, TAU, time_correction, distance_correction} to split times.
pub fn fit_splits_with_corrections(
    distance: &[f64],
    time: &[f64],
    options: &FitOptions,
) -> Result<FitResult, SprintError> {
    let frame = build_split_frame(distance, time, options, CorrectionModel::TimeAndDistance)?;
    fit_with_loocv(frame, options)
}

/// Fit {MSS, TAU} to a radar velocity trace with a fixed time correction.
pub fn fit_radar(
    time: &[f64],
    velocity: &[f64],
    options: &FitOptions,
) -> Result<FitResult, SprintError> {
    let frame = build_radar_frame(time, velocity, options, CorrectionModel::None)?;
    fit_with_loocv(frame, options)
}

/// Fit {MSS, TAU, time_correction} to a radar velocity trace.
pub fn fit_radar_with_time_correction(
    time: &[f64],
    velocity: &[f64],
    options: &FitOptions,
) -> Result<FitResult, SprintError> {
    let frame = build_radar_frame(time, velocity, options, CorrectionModel::TimeOnly)?;
    fit_with_loocv(frame, options)
}
