//! Mixed-effects estimation across multiple athletes.
//!
//! Fits one fixed-effect parameter set shared by all athletes plus
//! per-athlete random-effect deviations for a caller-selected parameter
//! subset. The fitter is a penalized nonlinear least squares: the residual
//! vector is the per-observation residuals augmented with
//! sqrt(lambda_j) * b_ij penalty rows, and the penalty weights are iterated
//! against the variance-component estimates after each solve. A deviation
//! variance that collapses to zero is a singular random-effects covariance
//! and is surfaced as `DegenerateFit`.

use std::collections::BTreeMap;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::estimate::{model_value, start_vector, CorrectionModel, StartValues, Target};
use crate::solver::{fit_curve, fit_least_squares, NlsOptions};
use crate::{MixedFitResult, ModelFit, SolverReport, SprintError, SprintParameters};

/// One split-time observation in long format.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SplitObservation {
    pub athlete: String,
    pub distance: f64,
    pub time: f64,
}

/// One radar observation in long format.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RadarObservation {
    pub athlete: String,
    pub time: f64,
    pub velocity: f64,
}

/// Which parameters carry per-athlete random-effect deviations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomEffects {
    pub mss: bool,
    pub tau: bool,
    pub time_correction: bool,
    pub distance_correction: bool,
}

impl Default for RandomEffects {
    fn default() -> Self {
        Self {
            mss: true,
            tau: true,
            time_correction: false,
            distance_correction: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MixedFitOptions {
    /// Fixed time correction for the plain variants (s).
    pub time_correction: f64,
    pub random_effects: RandomEffects,
    pub start: StartValues,
    pub max_iterations: usize,
    pub tolerance: f64,
    /// Upper bound on the penalty-weight (variance component) updates; the
    /// loop stops early once the weights settle.
    pub variance_iterations: usize,
}

impl Default for MixedFitOptions {
    fn default() -> Self {
        Self {
            time_correction: 0.0,
            random_effects: RandomEffects::default(),
            start: StartValues::default(),
            max_iterations: 100,
            tolerance: 1e-10,
            variance_iterations: 10,
        }
    }
}

/// Long-format working frame with athletes mapped to dense indices.
struct MixedFrame {
    xs: Vec<f64>,
    ys: Vec<f64>,
    observed: Vec<f64>,
    athlete_of_row: Vec<usize>,
    athletes: Vec<String>,
    target: Target,
    variant: CorrectionModel,
    /// Indices (into the fixed-parameter vector) that carry deviations.
    random_idx: Vec<usize>,
    /// Fixed scalar correction folded into the frame (plain variants).
    fixed_tc: f64,
}

fn random_indices(
    effects: &RandomEffects,
    variant: CorrectionModel,
) -> Result<Vec<usize>, SprintError> {
    let k = variant.free_parameters();
    let mut idx = Vec::new();
    if effects.mss {
        idx.push(0);
    }
    if effects.tau {
        idx.push(1);
    }
    if effects.time_correction {
        if k < 3 {
            return Err(SprintError::Input(
                "time-correction random effect requires a time-correction variant".to_string(),
            ));
        }
        idx.push(2);
    }
    if effects.distance_correction {
        if k < 4 {
            return Err(SprintError::Input(
                "distance-correction random effect requires the full-correction variant"
                    .to_string(),
            ));
        }
        idx.push(3);
    }
    if idx.is_empty() {
        return Err(SprintError::Input(
            "at least one random effect is required".to_string(),
        ));
    }
    Ok(idx)
}

fn build_split_mixed_frame(
    data: &[SplitObservation],
    options: &MixedFitOptions,
    variant: CorrectionModel,
) -> Result<MixedFrame, SprintError> {
    if data.is_empty() {
        return Err(SprintError::Input("no observations supplied".to_string()));
    }
    if !options.time_correction.is_finite() {
        return Err(SprintError::Input(format!(
            "time correction must be finite, got {}",
            options.time_correction
        )));
    }
    let random_idx = random_indices(&options.random_effects, variant)?;

    let mut athletes: Vec<String> = data.iter().map(|r| r.athlete.clone()).collect();
    athletes.sort();
    athletes.dedup();

    let mut xs = Vec::with_capacity(data.len());
    let mut observed = Vec::with_capacity(data.len());
    let mut athlete_of_row = Vec::with_capacity(data.len());
    let mut last_distance: BTreeMap<usize, f64> = BTreeMap::new();
    let mut dropped = 0usize;
    for row in data {
        if !row.distance.is_finite() || !row.time.is_finite() {
            return Err(SprintError::Input(format!(
                "non-finite observation for athlete {} (distance {}, time {})",
                row.athlete, row.distance, row.time
            )));
        }
        if row.distance < 0.0 || row.time < 0.0 {
            return Err(SprintError::Input(format!(
                "negative observation for athlete {} (distance {}, time {})",
                row.athlete, row.distance, row.time
            )));
        }
        let a = match athletes.binary_search(&row.athlete) {
            Ok(a) => a,
            Err(_) => {
                return Err(SprintError::Input(format!(
                    "unknown athlete {}",
                    row.athlete
                )))
            }
        };
        if row.distance == 0.0 || last_distance.get(&a) == Some(&row.distance) {
            dropped += 1;
            continue;
        }
        if let Some(&prev) = last_distance.get(&a) {
            if row.distance <= prev {
                return Err(SprintError::Input(format!(
                    "distances must be strictly increasing per athlete ({} after {} for {})",
                    row.distance, prev, row.athlete
                )));
            }
        }
        last_distance.insert(a, row.distance);
        xs.push(row.distance);
        observed.push(row.time);
        athlete_of_row.push(a);
    }
    if dropped > 0 {
        debug!(dropped, "filtered degenerate split rows");
    }

    let fixed_tc = if variant == CorrectionModel::None {
        options.time_correction
    } else {
        0.0
    };
    let ys = observed.iter().map(|t| t + fixed_tc).collect();
    let frame = MixedFrame {
        xs,
        ys,
        observed,
        athlete_of_row,
        athletes,
        target: Target::SplitTime,
        variant,
        random_idx,
        fixed_tc,
    };
    check_group_sizes(&frame)?;
    Ok(frame)
}

fn build_radar_mixed_frame(
    data: &[RadarObservation],
    options: &MixedFitOptions,
    variant: CorrectionModel,
) -> Result<MixedFrame, SprintError> {
    if data.is_empty() {
        return Err(SprintError::Input("no observations supplied".to_string()));
    }
    if !options.time_correction.is_finite() {
        return Err(SprintError::Input(format!(
            "time correction must be finite, got {}",
            options.time_correction
        )));
    }
    let random_idx = random_indices(&options.random_effects, variant)?;

    let mut athletes: Vec<String> = data.iter().map(|r| r.athlete.clone()).collect();
    athletes.sort();
    athletes.dedup();

    let fixed_tc = if variant == CorrectionModel::None {
        options.time_correction
    } else {
        0.0
    };
    let mut xs = Vec::with_capacity(data.len());
    let mut observed = Vec::with_capacity(data.len());
    let mut athlete_of_row = Vec::with_capacity(data.len());
    for row in data {
        if !row.time.is_finite() || !row.velocity.is_finite() {
            return Err(SprintError::Input(format!(
                "non-finite observation for athlete {} (time {}, velocity {})",
                row.athlete, row.time, row.velocity
            )));
        }
        if row.time < 0.0 {
            return Err(SprintError::Input(format!(
                "negative time value {} for athlete {}",
                row.time, row.athlete
            )));
        }
        let a = match athletes.binary_search(&row.athlete) {
            Ok(a) => a,
            Err(_) => {
                return Err(SprintError::Input(format!(
                    "unknown athlete {}",
                    row.athlete
                )))
            }
        };
        xs.push(row.time + fixed_tc);
        observed.push(row.velocity);
        athlete_of_row.push(a);
    }

    let frame = MixedFrame {
        ys: observed.clone(),
        xs,
        observed,
        athlete_of_row,
        athletes,
        target: Target::RadarVelocity,
        variant,
        random_idx,
        fixed_tc,
    };
    check_group_sizes(&frame)?;
    Ok(frame)
}

fn check_group_sizes(frame: &MixedFrame) -> Result<(), SprintError> {
    let k = frame.variant.free_parameters();
    let r = frame.random_idx.len();
    let mut counts = vec![0usize; frame.athletes.len()];
    for &a in &frame.athlete_of_row {
        counts[a] += 1;
    }
    for (a, &count) in counts.iter().enumerate() {
        if count <= r {
            return Err(SprintError::Input(format!(
                "athlete {} has {} usable observations, need at least {} for {} random effects",
                frame.athletes[a],
                count,
                r + 1,
                r
            )));
        }
    }
    if frame.xs.len() <= k {
        return Err(SprintError::Input(format!(
            "{} observations cannot identify {} fixed effects",
            frame.xs.len(),
            k
        )));
    }
    Ok(())
}

/// Effective parameter vector for one athlete: fixed effects plus that
/// athlete's deviations.
fn athlete_params(frame: &MixedFrame, theta: &[f64], athlete: usize) -> Vec<f64> {
    let k = frame.variant.free_parameters();
    let r = frame.random_idx.len();
    let mut p = theta[..k].to_vec();
    for (slot, &j) in frame.random_idx.iter().enumerate() {
        p[j] += theta[k + athlete * r + slot];
    }
    p
}

fn mixed_residuals(frame: &MixedFrame, theta: &[f64], lambdas: &[f64]) -> Option<DVector<f64>> {
    let n = frame.xs.len();
    let k = frame.variant.free_parameters();
    let r = frame.random_idx.len();
    let m = frame.athletes.len();
    let mut out = DVector::zeros(n + m * r);
    for i in 0..n {
        let p = athlete_params(frame, theta, frame.athlete_of_row[i]);
        let pred = model_value(frame.target, frame.variant, &p, frame.xs[i]).ok()?;
        out[i] = frame.ys[i] - pred;
    }
    for a in 0..m {
        for slot in 0..r {
            out[n + a * r + slot] = lambdas[slot].sqrt() * theta[k + a * r + slot];
        }
    }
    Some(out)
}

/// Per-athlete individual fits used to seed the joint problem. An athlete
/// whose own fit fails or lands outside the parameter domain keeps the
/// caller's starting values (zero deviation).
fn seed_estimates(
    frame: &MixedFrame,
    options: &MixedFitOptions,
    nls_options: &NlsOptions,
) -> Vec<Vec<f64>> {
    let m = frame.athletes.len();
    let start = start_vector(frame.variant, &options.start);
    let mut seeds = vec![start.clone(); m];
    for (a, seed) in seeds.iter_mut().enumerate() {
        let rows: Vec<usize> = (0..frame.xs.len())
            .filter(|&i| frame.athlete_of_row[i] == a)
            .collect();
        let xs: Vec<f64> = rows.iter().map(|&i| frame.xs[i]).collect();
        let ys: Vec<f64> = rows.iter().map(|&i| frame.ys[i]).collect();
        let target = frame.target;
        let variant = frame.variant;
        if let Ok(fit) = fit_curve(
            &xs,
            &ys,
            start.clone(),
            move |p, x| model_value(target, variant, p, x),
            nls_options,
        ) {
            if fit.params[0] > 0.0 && fit.params[1] > 0.0 {
                *seed = fit.params;
            }
        }
    }
    seeds
}

/// Penalty weights sigma^2 / sigma_bj^2 from the current iterate. A
/// deviation variance collapsing to zero is a singular random-effects
/// covariance.
fn penalty_weights(frame: &MixedFrame, theta: &[f64]) -> Result<(Vec<f64>, f64), SprintError> {
    let n = frame.xs.len();
    let k = frame.variant.free_parameters();
    let r = frame.random_idx.len();
    let m = frame.athletes.len();
    let mut rss = 0.0;
    for i in 0..n {
        let p = athlete_params(frame, theta, frame.athlete_of_row[i]);
        let res = frame.ys[i] - model_value(frame.target, frame.variant, &p, frame.xs[i])?;
        rss += res * res;
    }
    let sigma2 = (rss / (n.saturating_sub(k).max(1) as f64)).max(1e-14);
    let mut lambdas = vec![0.0; r];
    for slot in 0..r {
        let var_b = (0..m)
            .map(|a| theta[k + a * r + slot].powi(2))
            .sum::<f64>()
            / m as f64;
        if !var_b.is_finite() || var_b < 1e-12 {
            return Err(SprintError::DegenerateFit(format!(
                "random-effect variance for parameter {} collapsed to {var_b:e}",
                frame.random_idx[slot]
            )));
        }
        lambdas[slot] = (sigma2 / var_b).max(1e-12);
    }
    Ok((lambdas, sigma2))
}

fn fit_mixed_frame(
    frame: &MixedFrame,
    options: &MixedFitOptions,
) -> Result<MixedFitResult, SprintError> {
    let n = frame.xs.len();
    let k = frame.variant.free_parameters();
    let r = frame.random_idx.len();
    let m = frame.athletes.len();

    let nls_options = NlsOptions {
        max_iterations: options.max_iterations,
        tolerance: options.tolerance,
    };

    // Seed fixed effects and deviations from the per-athlete fits so the
    // initial penalty weights reflect realistic variance components. A flat
    // start with unit weights settles on an over-shrunken fixed point where
    // the shrinkage residuals themselves keep the penalty large.
    let seeds = seed_estimates(frame, options, &nls_options);
    let mut theta = vec![0.0; k + m * r];
    for j in 0..k {
        theta[j] = seeds.iter().map(|s| s[j]).sum::<f64>() / m as f64;
    }
    for a in 0..m {
        for (slot, &j) in frame.random_idx.iter().enumerate() {
            theta[k + a * r + slot] = seeds[a][j] - theta[j];
        }
    }
    let (mut lambdas, _) = penalty_weights(frame, &theta)?;

    let mut report: Option<SolverReport> = None;
    for outer in 0..options.variance_iterations.max(1) {
        let lam = lambdas.clone();
        let fit = fit_least_squares(
            n + m * r,
            theta.clone(),
            |p| mixed_residuals(frame, p, &lam),
            &nls_options,
        )?;
        theta = fit.params;
        report = Some(fit.report);

        let (new_lambdas, sigma2) = penalty_weights(frame, &theta)?;
        let max_change = lambdas
            .iter()
            .zip(new_lambdas.iter())
            .map(|(&old, &new)| (new - old).abs() / old)
            .fold(0.0_f64, f64::max);
        lambdas = new_lambdas;
        debug!(outer, ?lambdas, sigma2, "variance component update");
        if max_change < 1e-3 {
            break;
        }
    }
    let report = report.ok_or_else(|| {
        SprintError::Convergence("mixed-model solver produced no iterations".to_string())
    })?;

    let fixed = parameters_from_vector(frame, &theta[..k], options)?;
    let mut random = BTreeMap::new();
    for (a, name) in frame.athletes.iter().enumerate() {
        let p = athlete_params(frame, &theta, a);
        let params = parameters_from_vector(frame, &p, options)?;
        random.insert(name.clone(), params);
    }

    let predicted: Vec<f64> = (0..n)
        .map(|i| {
            let p = athlete_params(frame, &theta, frame.athlete_of_row[i]);
            let raw = model_value(frame.target, frame.variant, &p, frame.xs[i])?;
            Ok(match (frame.target, frame.variant) {
                (Target::SplitTime, CorrectionModel::None) => raw - frame.fixed_tc,
                _ => raw,
            })
        })
        .collect::<Result<_, SprintError>>()?;
    let model_fit = ModelFit::from_observations(&frame.observed, &predicted, k);

    Ok(MixedFitResult {
        fixed,
        random,
        model_fit,
        predicted,
        solver: report,
    })
}

fn parameters_from_vector(
    frame: &MixedFrame,
    p: &[f64],
    options: &MixedFitOptions,
) -> Result<SprintParameters, SprintError> {
    let mss = p[0];
    let tau = p[1];
    if !(mss.is_finite() && tau.is_finite() && mss > 0.0 && tau > 0.0) {
        return Err(SprintError::Convergence(format!(
            "solver converged to a physically invalid estimate (MSS={mss}, TAU={tau})"
        )));
    }
    let (time_correction, distance_correction) = match frame.variant {
        CorrectionModel::None => (options.time_correction, 0.0),
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

/// Fit fixed {MSS, TAU} with per-athlete random effects to split times.
pub fn fit_mixed_splits(
    data: &[SplitObservation],
    options: &MixedFitOptions,
) -> Result<MixedFitResult, SprintError> {
    let frame = build_split_mixed_frame(data, options, CorrectionModel::None)?;
    fit_mixed_frame(&frame, options)
}

/// Fit {MSS, TAU, time_correction} across athletes; the correction may be a
/// random effect via `MixedFitOptions::random_effects`.
pub fn fit_mixed_splits_with_time_correction(
    data: &[SplitObservation],
    options: &MixedFitOptions,
) -> Result<MixedFitResult, SprintError> {
    let frame = build_split_mixed_frame(data, options, CorrectionModel::TimeOnly)?;
    fit_mixed_frame(&frame, options)
}

/// Fit {MSS, TAU, time_correction, distance_correction} across athletes.
pub fn fit_mixed_splits_with_corrections(
    data: &[SplitObservation],
    options: &MixedFitOptions,
) -> Result<MixedFitResult, SprintError> {
    let frame = build_split_mixed_frame(data, options, CorrectionModel::TimeAndDistance)?;
    fit_mixed_frame(&frame, options)
}

/// Fit fixed {MSS, TAU} with per-athlete random effects to radar traces.
pub fn fit_mixed_radar(
    data: &[RadarObservation],
    options: &MixedFitOptions,
) -> Result<MixedFitResult, SprintError> {
    let frame = build_radar_mixed_frame(data, options, CorrectionModel::None)?;
    fit_mixed_frame(&frame, options)
}

/// Fit {MSS, TAU, time_correction} across athletes on radar traces.
pub fn fit_mixed_radar_with_time_correction(
    data: &[RadarObservation],
    options: &MixedFitOptions,
) -> Result<MixedFitResult, SprintError> {
    let frame = build_radar_mixed_frame(data, options, CorrectionModel::TimeOnly)?;
    fit_mixed_frame(&frame, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::{predict_time_at_distance, Corrections};

    fn split_rows(athlete: &str, mss: f64, tau: f64, phase: usize) -> Vec<SplitObservation> {
        let distances = [5.0, 10.0, 20.0, 30.0, 40.0];
        let times = predict_time_at_distance(&distances, mss, tau, Corrections::default())
            .unwrap();
        distances
            .iter()
            .zip(times.iter())
            .enumerate()
            .map(|(i, (&d, &t))| SplitObservation {
                athlete: athlete.to_string(),
                distance: d,
                time: t + if (i + phase) % 2 == 0 { 1e-5 } else { -1e-5 },
            })
            .collect()
    }

    #[test]
    fn recovers_per_athlete_parameters_from_splits() {
        let mut data = split_rows("ann", 7.5, 0.8, 0);
        data.extend(split_rows("bob", 8.5, 1.0, 1));
        let result = fit_mixed_splits(&data, &MixedFitOptions::default()).unwrap();

        assert_eq!(result.random.len(), 2);
        let ann = &result.random["ann"];
        let bob = &result.random["bob"];
        assert!((ann.mss - 7.5).abs() < 0.05, "ann MSS = {}", ann.mss);
        assert!((bob.mss - 8.5).abs() < 0.05, "bob MSS = {}", bob.mss);
        assert!((ann.tau - 0.8).abs() < 0.05);
        assert!((bob.tau - 1.0).abs() < 0.05);
        // Fixed effects sit between the athletes.
        assert!(result.fixed.mss > ann.mss && result.fixed.mss < bob.mss);
        assert_eq!(result.predicted.len(), data.len());
        for (obs, pred) in data.iter().map(|r| r.time).zip(result.predicted.iter()) {
            assert!((obs - pred).abs() < 1e-2);
        }
    }

    #[test]
    fn per_athlete_sets_carry_the_full_parameter_structure() {
        let mut data = split_rows("ann", 7.5, 0.8, 0);
        data.extend(split_rows("bob", 8.5, 1.0, 1));
        let result = fit_mixed_splits(&data, &MixedFitOptions::default()).unwrap();
        for params in result.random.values() {
            assert!(params.mss > 0.0 && params.tau > 0.0);
            assert!(params.mac() > 0.0 && params.pmax() > 0.0);
            assert_eq!(params.time_correction, 0.0);
            assert_eq!(params.distance_correction, 0.0);
        }
    }

    #[test]
    fn recovers_per_athlete_parameters_from_radar() {
        let mut data = Vec::new();
        for (athlete, mss, tau) in [("ann", 7.5_f64, 0.8_f64), ("bob", 8.5, 1.0)] {
            for i in 0..=30 {
                let t = i as f64 * 0.2;
                data.push(RadarObservation {
                    athlete: athlete.to_string(),
                    time: t,
                    velocity: mss * (1.0 - (-t / tau).exp())
                        + if i % 2 == 0 { 1e-6 } else { -1e-6 },
                });
            }
        }
        let result = fit_mixed_radar(&data, &MixedFitOptions::default()).unwrap();
        assert!((result.random["ann"].mss - 7.5).abs() < 0.05);
        assert!((result.random["bob"].mss - 8.5).abs() < 0.05);
    }

    #[test]
    fn random_correction_requires_matching_variant() {
        let data = split_rows("ann", 7.5, 0.8, 0);
        let options = MixedFitOptions {
            random_effects: RandomEffects {
                time_correction: true,
                ..RandomEffects::default()
            },
            ..MixedFitOptions::default()
        };
        assert!(matches!(
            fit_mixed_splits(&data, &options),
            Err(SprintError::Input(_))
        ));
    }

    #[test]
    fn no_random_effects_is_an_input_error() {
        let data = split_rows("ann", 7.5, 0.8, 0);
        let options = MixedFitOptions {
            random_effects: RandomEffects {
                mss: false,
                tau: false,
                time_correction: false,
                distance_correction: false,
            },
            ..MixedFitOptions::default()
        };
        assert!(matches!(
            fit_mixed_splits(&data, &options),
            Err(SprintError::Input(_))
        ));
    }

    #[test]
    fn undersized_groups_are_rejected() {
        let mut data = split_rows("ann", 7.5, 0.8, 0);
        data.push(SplitObservation {
            athlete: "solo".to_string(),
            distance: 10.0,
            time: 1.9,
        });
        assert!(matches!(
            fit_mixed_splits(&data, &MixedFitOptions::default()),
            Err(SprintError::Input(_))
        ));
    }

    #[test]
    fn identical_athletes_collapse_to_a_degenerate_fit() {
        // Three athletes with byte-identical data leave zero between-athlete
        // variance, a singular random-effects covariance.
        let mut data = Vec::new();
        for athlete in ["ann", "bob", "cho"] {
            data.extend(split_rows(athlete, 8.0, 0.9, 0));
        }
        assert!(matches!(
            fit_mixed_splits(&data, &MixedFitOptions::default()),
            Err(SprintError::DegenerateFit(_))
        ));
    }

    #[test]
    fn estimated_time_correction_variant_fits() {
        let corr = Corrections {
            time: 0.25,
            distance: 0.0,
        };
        let distances = [5.0, 10.0, 20.0, 30.0, 40.0];
        let mut data = Vec::new();
        for (athlete, mss, tau, phase) in [("ann", 7.5_f64, 0.8_f64, 0), ("bob", 8.5, 1.0, 1)] {
            let times = predict_time_at_distance(&distances, mss, tau, corr).unwrap();
            for (i, (&d, &t)) in distances.iter().zip(times.iter()).enumerate() {
                data.push(SplitObservation {
                    athlete: athlete.to_string(),
                    distance: d,
                    time: t + if (i + phase) % 2 == 0 { 1e-5 } else { -1e-5 },
                });
            }
        }
        let result =
            fit_mixed_splits_with_time_correction(&data, &MixedFitOptions::default()).unwrap();
        assert!((result.fixed.time_correction - 0.25).abs() < 0.05);
        assert!((result.random["ann"].mss - 7.5).abs() < 0.1);
        assert!((result.random["bob"].mss - 8.5).abs() < 0.1);
    }
}
