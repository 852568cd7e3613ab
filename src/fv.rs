//! Force-velocity profiling from a fitted parameter pair.
//!
//! Simulates a kinematic trace on a fixed sampling grid, computes the net
//! horizontal force (inertial plus drag) and the ratio of horizontal to
//! resultant force at each sample, then summarizes both as linear fits:
//! force against velocity for {F0, V0, Pmax, slope}, and force ratio against
//! velocity on the late window t > cutoff for {RFmax, Drf}.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::air::{air_resistance, AirConditions, Anthropometrics};
use crate::kinematics::{acceleration_at, check_parameters, velocity_at};
use crate::SprintError;

const GRAVITY: f64 = 9.81;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FvOptions {
    pub anthropometrics: Anthropometrics,
    pub conditions: AirConditions,
    /// Simulation horizon (s).
    pub max_time: f64,
    /// Sampling frequency (Hz).
    pub frequency: f64,
    /// The force-ratio regression only uses samples with t > cutoff (s),
    /// past the early push-off where the ratio is not yet linear in v.
    pub rfmax_cutoff: f64,
}

impl Default for FvOptions {
    fn default() -> Self {
        Self {
            anthropometrics: Anthropometrics::default(),
            conditions: AirConditions::default(),
            max_time: 6.0,
            frequency: 100.0,
            rfmax_cutoff: 0.3,
        }
    }
}

/// Simulated trace underlying the profile, aligned sample by sample.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FvSeries {
    pub time: Vec<f64>,
    pub velocity: Vec<f64>,
    pub acceleration: Vec<f64>,
    /// Net horizontal force (N).
    pub force: Vec<f64>,
    /// Ratio of horizontal to resultant force, in (0, 1).
    pub force_ratio: Vec<f64>,
}

/// Linear force-velocity profile derived from a fitted {MSS, TAU}.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FvProfile {
    pub bodymass: f64,
    /// Theoretical maximal horizontal force (N), the F-v intercept.
    pub f0: f64,
    /// F0 per kg (N/kg).
    pub f0_rel: f64,
    /// Theoretical maximal velocity (m/s), where the F-v line crosses zero.
    pub v0: f64,
    /// Maximal power F0 * V0 / 4 (W).
    pub pmax: f64,
    /// Pmax per kg (W/kg).
    pub pmax_rel: f64,
    /// Slope of the relative-force vs velocity line (N/kg per m/s).
    pub fv_slope: f64,
    /// Force-ratio intercept of the late-window regression.
    pub rf_max: f64,
    pub rf_max_cutoff: f64,
    /// Force-ratio decay per unit velocity.
    pub drf: f64,
    /// Residual standard error of the F-v fit (N).
    pub rse_fv: f64,
    /// Residual standard error of the force-ratio fit.
    pub rse_drf: f64,
    pub series: FvSeries,
}

/// Ordinary least squares y = intercept + slope * x, with the residual
/// standard error on n - 2 degrees of freedom.
fn linear_fit(xs: &[f64], ys: &[f64]) -> Result<(f64, f64, f64), SprintError> {
    let n = xs.len();
    let mean_x = xs.iter().sum::<f64>() / n as f64;
    let mean_y = ys.iter().sum::<f64>() / n as f64;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (&x, &y) in xs.iter().zip(ys.iter()) {
        sxx += (x - mean_x) * (x - mean_x);
        sxy += (x - mean_x) * (y - mean_y);
    }
    if sxx <= 0.0 {
        return Err(SprintError::Domain(
            "regressor is constant, linear fit undefined".to_string(),
        ));
    }
    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    let rss: f64 = xs
        .iter()
        .zip(ys.iter())
        .map(|(&x, &y)| {
            let r = y - intercept - slope * x;
            r * r
        })
        .sum();
    let dof = n.saturating_sub(2).max(1) as f64;
    Ok((intercept, slope, (rss / dof).sqrt()))
}

fn check_options(options: &FvOptions) -> Result<(), SprintError> {
    let a = &options.anthropometrics;
    if !(a.bodymass.is_finite() && a.bodymass > 0.0) {
        return Err(SprintError::Input(format!(
            "bodymass must be positive, got {}",
            a.bodymass
        )));
    }
    if !(a.bodyheight.is_finite() && a.bodyheight > 0.0) {
        return Err(SprintError::Input(format!(
            "bodyheight must be positive, got {}",
            a.bodyheight
        )));
    }
    if !(options.max_time.is_finite() && options.max_time > 0.0) {
        return Err(SprintError::Input(format!(
            "max_time must be positive, got {}",
            options.max_time
        )));
    }
    if !(options.frequency.is_finite() && options.frequency > 0.0) {
        return Err(SprintError::Input(format!(
            "frequency must be positive, got {}",
            options.frequency
        )));
    }
    if !options.rfmax_cutoff.is_finite() {
        return Err(SprintError::Input(format!(
            "cutoff must be finite, got {}",
            options.rfmax_cutoff
        )));
    }
    if options.rfmax_cutoff >= options.max_time {
        return Err(SprintError::Domain(format!(
            "cutoff {} is not below max_time {}",
            options.rfmax_cutoff, options.max_time
        )));
    }
    Ok(())
}

/// Derive the linear force-velocity profile for a fitted {MSS, TAU}.
pub fn force_velocity_profile(
    mss: f64,
    tau: f64,
    options: &FvOptions,
) -> Result<FvProfile, SprintError> {
    check_parameters(mss, tau)?;
    check_options(options)?;
    let mass = options.anthropometrics.bodymass;
    let weight = mass * GRAVITY;

    let samples = (options.max_time * options.frequency).floor() as usize;
    let mut series = FvSeries {
        time: Vec::with_capacity(samples + 1),
        velocity: Vec::with_capacity(samples + 1),
        acceleration: Vec::with_capacity(samples + 1),
        force: Vec::with_capacity(samples + 1),
        force_ratio: Vec::with_capacity(samples + 1),
    };
    for i in 0..=samples {
        let t = i as f64 / options.frequency;
        let v = velocity_at(t, mss, tau);
        let a = acceleration_at(t, mss, tau);
        let force = mass * a + air_resistance(v, &options.anthropometrics, &options.conditions);
        let ratio = force / (force * force + weight * weight).sqrt();
        series.time.push(t);
        series.velocity.push(v);
        series.acceleration.push(a);
        series.force.push(force);
        series.force_ratio.push(ratio);
    }

    let (f0, slope, rse_fv) = linear_fit(&series.velocity, &series.force)?;
    if !(slope < 0.0 && f0 > 0.0) {
        return Err(SprintError::Domain(format!(
            "force-velocity relation is not decreasing (F0={f0}, slope={slope})"
        )));
    }
    let v0 = -f0 / slope;
    let pmax = f0 * v0 / 4.0;

    let late: Vec<usize> = (0..series.time.len())
        .filter(|&i| series.time[i] > options.rfmax_cutoff)
        .collect();
    if late.len() < 2 {
        return Err(SprintError::Domain(format!(
            "only {} samples past the {} s cutoff, need at least 2",
            late.len(),
            options.rfmax_cutoff
        )));
    }
    let late_v: Vec<f64> = late.iter().map(|&i| series.velocity[i]).collect();
    let late_rf: Vec<f64> = late.iter().map(|&i| series.force_ratio[i]).collect();
    let (rf_max, drf, rse_drf) = linear_fit(&late_v, &late_rf)?;
    debug!(f0, v0, rf_max, drf, "force-velocity profile derived");

    Ok(FvProfile {
        bodymass: mass,
        f0,
        f0_rel: f0 / mass,
        v0,
        pmax,
        pmax_rel: pmax / mass,
        fv_slope: slope / mass,
        rf_max,
        rf_max_cutoff: options.rfmax_cutoff,
        drf,
        rse_fv,
        rse_drf,
        series,
    })
}
