//! Air-resistance and power model layered on the sprint kinematics.
//!
//! Drag follows the frontal-area regression and density formula of the
//! original system: A = 0.2025 * h^0.725 * m^0.425 * 0.266,
//! rho = 1.293 * (P/760) * (273 / (273 + T)), Cd = 0.9. Power is the net
//! horizontal force (inertial plus drag) times velocity, reported per kg.

use serde::{Deserialize, Serialize};

use crate::kinematics::{acceleration_at, time_at, velocity_at, Corrections};
use crate::SprintError;

const DRAG_COEFFICIENT: f64 = 0.9;
const REFERENCE_AIR_DENSITY: f64 = 1.293;

/// Athlete body dimensions used for the frontal-area regression.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Anthropometrics {
    /// Body mass (kg).
    pub bodymass: f64,
    /// Body height (m).
    pub bodyheight: f64,
}

impl Default for Anthropometrics {
    fn default() -> Self {
        Self {
            bodymass: 75.0,
            bodyheight: 1.75,
        }
    }
}

/// Environmental conditions. An explicit value object rather than
/// process-wide defaults so the model stays pure and testable.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AirConditions {
    /// Barometric pressure (mmHg).
    pub barometric_pressure: f64,
    /// Air temperature (deg C).
    pub air_temperature: f64,
    /// Wind velocity along the running direction (m/s), tailwind positive.
    pub wind_velocity: f64,
}

impl Default for AirConditions {
    fn default() -> Self {
        Self {
            barometric_pressure: 760.0,
            air_temperature: 25.0,
            wind_velocity: 0.0,
        }
    }
}

/// Air density (kg/m^3) for the given conditions.
pub fn air_density(conditions: &AirConditions) -> f64 {
    REFERENCE_AIR_DENSITY
        * (conditions.barometric_pressure / 760.0)
        * (273.0 / (273.0 + conditions.air_temperature))
}

/// Projected frontal area (m^2) from the height/mass regression.
pub fn frontal_area(anthro: &Anthropometrics) -> f64 {
    0.2025 * anthro.bodyheight.powf(0.725) * anthro.bodymass.powf(0.425) * 0.266
}

/// Drag force (N) on the athlete at the given velocity, signed by the
/// velocity relative to the wind.
pub fn air_resistance(velocity: f64, anthro: &Anthropometrics, conditions: &AirConditions) -> f64 {
    let relative = velocity - conditions.wind_velocity;
    let coef = 0.5 * air_density(conditions) * frontal_area(anthro) * DRAG_COEFFICIENT;
    relative.signum() * coef * relative * relative
}

/// Relative power (W/kg) from instantaneous velocity and acceleration.
///
/// Without anthropometrics the drag contribution is zero and this is the
/// pure kinematic power `a * v`.
pub(crate) fn relative_power(
    velocity: f64,
    acceleration: f64,
    anthro: Option<&Anthropometrics>,
    conditions: &AirConditions,
) -> f64 {
    match anthro {
        Some(a) => {
            let drag = air_resistance(velocity, a, conditions);
            (a.bodymass * acceleration + drag) * velocity / a.bodymass
        }
        None => acceleration * velocity,
    }
}

pub(crate) fn relative_power_at_time(
    t: f64,
    mss: f64,
    tau: f64,
    corr: Corrections,
    anthro: Option<&Anthropometrics>,
    conditions: &AirConditions,
) -> f64 {
    let tc = t + corr.time;
    relative_power(
        velocity_at(tc, mss, tau),
        acceleration_at(tc, mss, tau),
        anthro,
        conditions,
    )
}

fn check_anthropometrics(anthro: Option<&Anthropometrics>) -> Result<(), SprintError> {
    if let Some(a) = anthro {
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
    }
    Ok(())
}

/// Relative power (W/kg) at each time (s). Pass `None` anthropometrics for
/// kinematics-only output.
pub fn predict_relative_power_at_time(
    times: &[f64],
    mss: f64,
    tau: f64,
    corr: Corrections,
    anthro: Option<&Anthropometrics>,
    conditions: &AirConditions,
) -> Result<Vec<f64>, SprintError> {
    check_anthropometrics(anthro)?;
    // Parameter and finiteness checks live in the kinematics layer.
    let v = crate::kinematics::predict_velocity_at_time(times, mss, tau, corr)?;
    let a = crate::kinematics::predict_acceleration_at_time(times, mss, tau, corr)?;
    Ok(v.iter()
        .zip(a.iter())
        .map(|(&vi, &ai)| relative_power(vi, ai, anthro, conditions))
        .collect())
}

/// Relative power (W/kg) at each distance (m).
pub fn predict_relative_power_at_distance(
    distances: &[f64],
    mss: f64,
    tau: f64,
    corr: Corrections,
    anthro: Option<&Anthropometrics>,
    conditions: &AirConditions,
) -> Result<Vec<f64>, SprintError> {
    check_anthropometrics(anthro)?;
    let v = crate::kinematics::predict_velocity_at_distance(distances, mss, tau, corr)?;
    let a = crate::kinematics::predict_acceleration_at_distance(distances, mss, tau, corr)?;
    Ok(v.iter()
        .zip(a.iter())
        .map(|(&vi, &ai)| relative_power(vi, ai, anthro, conditions))
        .collect())
}

pub(crate) fn relative_power_at_distance(
    d: f64,
    mss: f64,
    tau: f64,
    corr: Corrections,
    anthro: Option<&Anthropometrics>,
    conditions: &AirConditions,
) -> Result<f64, SprintError> {
    let t = time_at(d + corr.distance, mss, tau)?;
    Ok(relative_power(
        velocity_at(t, mss, tau),
        acceleration_at(t, mss, tau),
        anthro,
        conditions,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn air_density_at_reference_conditions() {
        let rho = air_density(&AirConditions::default());
        // 1.293 * 273/298 at 760 mmHg and 25 C.
        assert!((rho - 1.293 * 273.0 / 298.0).abs() < 1e-12);
    }

    #[test]
    fn drag_is_zero_at_wind_speed_and_signed_below_it() {
        let anthro = Anthropometrics::default();
        let cond = AirConditions {
            wind_velocity: 2.0,
            ..AirConditions::default()
        };
        assert_eq!(air_resistance(2.0, &anthro, &cond), 0.0);
        assert!(air_resistance(5.0, &anthro, &cond) > 0.0);
        assert!(air_resistance(0.5, &anthro, &cond) < 0.0);
    }

    #[test]
    fn kinematic_mode_has_zero_drag_contribution() {
        let cond = AirConditions::default();
        let times = [0.5, 1.0, 2.0];
        let kinematic = predict_relative_power_at_time(
            &times,
            8.0,
            0.9,
            Corrections::default(),
            None,
            &cond,
        )
        .unwrap();
        let v =
            crate::kinematics::predict_velocity_at_time(&times, 8.0, 0.9, Corrections::default())
                .unwrap();
        let a = crate::kinematics::predict_acceleration_at_time(
            &times,
            8.0,
            0.9,
            Corrections::default(),
        )
        .unwrap();
        for ((p, vi), ai) in kinematic.iter().zip(v.iter()).zip(a.iter()) {
            assert!((p - vi * ai).abs() < 1e-12);
        }
    }

    #[test]
    fn drag_raises_power_demand_at_speed() {
        let cond = AirConditions::default();
        let anthro = Anthropometrics::default();
        let times = [2.0, 3.0];
        let with_air =
            predict_relative_power_at_time(&times, 8.0, 0.9, Corrections::default(), Some(&anthro), &cond)
                .unwrap();
        let without =
            predict_relative_power_at_time(&times, 8.0, 0.9, Corrections::default(), None, &cond)
                .unwrap();
        for (w, wo) in with_air.iter().zip(without.iter()) {
            assert!(w > wo);
        }
    }

    #[test]
    fn power_at_time_and_distance_agree() {
        let cond = AirConditions::default();
        let anthro = Anthropometrics::default();
        let corr = Corrections::default();
        let d = [5.0, 15.0, 30.0];
        let t = crate::kinematics::predict_time_at_distance(&d, 8.0, 0.9, corr).unwrap();
        let p_d =
            predict_relative_power_at_distance(&d, 8.0, 0.9, corr, Some(&anthro), &cond).unwrap();
        let p_t =
            predict_relative_power_at_time(&t, 8.0, 0.9, corr, Some(&anthro), &cond).unwrap();
        for (a, b) in p_d.iter().zip(p_t.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn invalid_bodymass_rejected() {
        let bad = Anthropometrics {
            bodymass: 0.0,
            bodyheight: 1.75,
        };
        let err = predict_relative_power_at_time(
            &[1.0],
            8.0,
            0.9,
            Corrections::default(),
            Some(&bad),
            &AirConditions::default(),
        );
        assert!(matches!(err, Err(SprintError::Input(_))));
    }
}
