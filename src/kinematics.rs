//! Closed-form mono-exponential sprint kinematics.
//!
//! Every relation is parameterized by MSS (asymptotic velocity) and TAU
//! (relative acceleration time constant). The distance-to-time inversion is
//! transcendental and goes through the principal branch of the Lambert-W
//! function; everything else is elementary.

use serde::{Deserialize, Serialize};

use crate::SprintError;

/// Additive start-technique offsets applied identically during fitting and
/// prediction. Both default to zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Corrections {
    /// Time offset (s), subtracted from predicted times and added to the
    /// time coordinate of the at-time forms.
    pub time: f64,
    /// Distance offset (m), added to the distance coordinate before the
    /// at-distance forms and subtracted from predicted distances.
    pub distance: f64,
}

const INV_E: f64 = 0.367_879_441_171_442_33;

/// Principal-branch Lambert-W, defined for arguments in [-1/e, inf).
///
/// Branch-point series seed plus Halley refinement; relative error is well
/// below 1e-9 over the [-1/e, 0) range the time inversion uses.
pub fn lambert_w0(x: f64) -> Result<f64, SprintError> {
    if !x.is_finite() {
        return Err(SprintError::Domain(format!(
            "Lambert-W argument must be finite, got {x}"
        )));
    }
    if x < -INV_E - 1e-12 {
        return Err(SprintError::Domain(format!(
            "Lambert-W argument {x} below branch point -1/e"
        )));
    }
    if x <= -INV_E {
        return Ok(-1.0);
    }

    let mut w = if x < 0.0 {
        // Series around the branch point, accurate where Halley's
        // denominator degenerates.
        let p = (2.0 * (std::f64::consts::E * x + 1.0)).sqrt();
        -1.0 + p - p * p / 3.0 + 11.0 / 72.0 * p * p * p
    } else if x < std::f64::consts::E {
        (1.0 + x).ln()
    } else {
        let l = x.ln();
        l - l.ln()
    };

    for _ in 0..64 {
        let wp1 = w + 1.0;
        if wp1.abs() < 1e-9 {
            // The series seed is already at full accuracy this close to -1.
            break;
        }
        let ew = w.exp();
        let f = w * ew - x;
        let denom = ew * wp1 - (w + 2.0) * f / (2.0 * wp1);
        let dw = f / denom;
        w -= dw;
        if dw.abs() <= 1e-13 * (1.0 + w.abs()) {
            break;
        }
    }
    Ok(w)
}

pub(crate) fn velocity_at(t: f64, mss: f64, tau: f64) -> f64 {
    mss * (1.0 - (-t / tau).exp())
}

pub(crate) fn acceleration_at(t: f64, mss: f64, tau: f64) -> f64 {
    mss / tau * (-t / tau).exp()
}

pub(crate) fn distance_at(t: f64, mss: f64, tau: f64) -> f64 {
    mss * (t + tau * (-t / tau).exp()) - mss * tau
}

/// Uncorrected inverse of `distance_at`; requires d >= 0.
pub(crate) fn time_at(d: f64, mss: f64, tau: f64) -> Result<f64, SprintError> {
    if d < 0.0 {
        return Err(SprintError::Domain(format!(
            "corrected distance must be non-negative, got {d}"
        )));
    }
    let arg = -(-d / (mss * tau) - 1.0).exp();
    Ok(tau * lambert_w0(arg)? + d / mss + tau)
}

pub(crate) fn check_parameters(mss: f64, tau: f64) -> Result<(), SprintError> {
    if !(mss.is_finite() && tau.is_finite() && mss > 0.0 && tau > 0.0) {
        return Err(SprintError::Domain(format!(
            "MSS and TAU must be finite and positive, got MSS={mss}, TAU={tau}"
        )));
    }
    Ok(())
}

fn map_times<F: Fn(f64) -> f64>(
    times: &[f64],
    mss: f64,
    tau: f64,
    f: F,
) -> Result<Vec<f64>, SprintError> {
    check_parameters(mss, tau)?;
    for &t in times {
        if !t.is_finite() {
            return Err(SprintError::Domain(format!("non-finite time value {t}")));
        }
    }
    Ok(times.iter().map(|&t| f(t)).collect())
}

/// Instantaneous velocity (m/s) at each time (s).
pub fn predict_velocity_at_time(
    times: &[f64],
    mss: f64,
    tau: f64,
    corr: Corrections,
) -> Result<Vec<f64>, SprintError> {
    map_times(times, mss, tau, |t| velocity_at(t + corr.time, mss, tau))
}

/// Instantaneous acceleration (m/s^2) at each time (s).
pub fn predict_acceleration_at_time(
    times: &[f64],
    mss: f64,
    tau: f64,
    corr: Corrections,
) -> Result<Vec<f64>, SprintError> {
    map_times(times, mss, tau, |t| acceleration_at(t + corr.time, mss, tau))
}

/// Covered distance (m) at each time (s).
pub fn predict_distance_at_time(
    times: &[f64],
    mss: f64,
    tau: f64,
    corr: Corrections,
) -> Result<Vec<f64>, SprintError> {
    map_times(times, mss, tau, |t| {
        distance_at(t + corr.time, mss, tau) - corr.distance
    })
}

/// Split time (s) at each distance (m), via the Lambert-W inversion.
pub fn predict_time_at_distance(
    distances: &[f64],
    mss: f64,
    tau: f64,
    corr: Corrections,
) -> Result<Vec<f64>, SprintError> {
    check_parameters(mss, tau)?;
    distances
        .iter()
        .map(|&d| {
            if !d.is_finite() {
                return Err(SprintError::Domain(format!("non-finite distance value {d}")));
            }
            Ok(time_at(d + corr.distance, mss, tau)? - corr.time)
        })
        .collect()
}

/// Instantaneous velocity (m/s) at each distance (m).
///
/// Composes the time inversion with the at-time velocity form; the time
/// correction cancels by construction.
pub fn predict_velocity_at_distance(
    distances: &[f64],
    mss: f64,
    tau: f64,
    corr: Corrections,
) -> Result<Vec<f64>, SprintError> {
    check_parameters(mss, tau)?;
    distances
        .iter()
        .map(|&d| {
            if !d.is_finite() {
                return Err(SprintError::Domain(format!("non-finite distance value {d}")));
            }
            let t = time_at(d + corr.distance, mss, tau)?;
            Ok(velocity_at(t, mss, tau))
        })
        .collect()
}

/// Instantaneous acceleration (m/s^2) at each distance (m).
pub fn predict_acceleration_at_distance(
    distances: &[f64],
    mss: f64,
    tau: f64,
    corr: Corrections,
) -> Result<Vec<f64>, SprintError> {
    check_parameters(mss, tau)?;
    distances
        .iter()
        .map(|&d| {
            if !d.is_finite() {
                return Err(SprintError::Domain(format!("non-finite distance value {d}")));
            }
            let t = time_at(d + corr.distance, mss, tau)?;
            Ok(acceleration_at(t, mss, tau))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lambert_w0_satisfies_defining_equation() {
        // Sample the fitting domain [-1/e, 0) plus a few positive points.
        let xs = [
            -INV_E + 1e-12,
            -0.367,
            -0.3,
            -0.2,
            -0.1,
            -0.01,
            -1e-6,
            0.5,
            1.0,
            10.0,
        ];
        for &x in &xs {
            let w = lambert_w0(x).unwrap();
            let back = w * w.exp();
            assert!(
                (back - x).abs() <= 1e-9 * x.abs().max(1e-3),
                "W({x}) = {w}, round trip {back}"
            );
        }
        assert_eq!(lambert_w0(-INV_E).unwrap(), -1.0);
        assert!(lambert_w0(-0.4).is_err());
        assert!(lambert_w0(f64::NAN).is_err());
    }

    #[test]
    fn time_and_distance_round_trip() {
        let mss = 8.0;
        let tau = 0.9;
        let corr = Corrections::default();
        for i in 0..=40 {
            let d = i as f64;
            let t = predict_time_at_distance(&[d], mss, tau, corr).unwrap()[0];
            let back = predict_distance_at_time(&[t], mss, tau, corr).unwrap()[0];
            assert!((back - d).abs() < 1e-6, "distance {d} -> time {t} -> {back}");
        }
        for i in 0..=60 {
            let t = i as f64 * 0.1;
            let d = predict_distance_at_time(&[t], mss, tau, corr).unwrap()[0];
            let back = predict_time_at_distance(&[d], mss, tau, corr).unwrap()[0];
            assert!((back - t).abs() < 1e-6, "time {t} -> distance {d} -> {back}");
        }
    }

    #[test]
    fn time_correction_shifts_predicted_time_additively() {
        let mss = 9.5;
        let tau = 1.1;
        let base = predict_time_at_distance(&[10.0, 20.0], mss, tau, Corrections::default())
            .unwrap();
        for &c in &[-0.5, -0.1, 0.0, 0.2, 0.7] {
            let corrected = predict_time_at_distance(
                &[10.0, 20.0],
                mss,
                tau,
                Corrections { time: c, distance: 0.0 },
            )
            .unwrap();
            for (b, s) in base.iter().zip(corrected.iter()) {
                assert!((s - (b - c)).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn distance_correction_applied_symmetrically() {
        let mss = 8.0;
        let tau = 0.8;
        let corr = Corrections { time: 0.3, distance: 1.5 };
        // predict_time at d then predict_distance at that time lands back on d.
        let d = 15.0;
        let t = predict_time_at_distance(&[d], mss, tau, corr).unwrap()[0];
        let back = predict_distance_at_time(&[t], mss, tau, corr).unwrap()[0];
        assert!((back - d).abs() < 1e-9);
    }

    #[test]
    fn velocity_monotone_increasing_and_bounded() {
        let mss = 8.0;
        let tau = 0.9;
        let times: Vec<f64> = (0..600).map(|i| i as f64 * 0.05).collect();
        let v = predict_velocity_at_time(&times, mss, tau, Corrections::default()).unwrap();
        for w in v.windows(2) {
            assert!(w[1] > w[0]);
        }
        assert!(v.iter().all(|&x| x < mss));
        assert!(v.last().unwrap() > &(mss * 0.999_999));
    }

    #[test]
    fn acceleration_monotone_decreasing_to_zero() {
        let mss = 8.0;
        let tau = 0.9;
        let times: Vec<f64> = (0..600).map(|i| i as f64 * 0.05).collect();
        let a = predict_acceleration_at_time(&times, mss, tau, Corrections::default()).unwrap();
        for w in a.windows(2) {
            assert!(w[1] < w[0]);
        }
        assert!((a[0] - mss / tau).abs() < 1e-12);
        assert!(a.last().unwrap() < &1e-10);
    }

    #[test]
    fn velocity_at_distance_matches_composition() {
        let mss = 10.0;
        let tau = 0.9;
        let corr = Corrections::default();
        let d = [5.0, 10.0, 25.0];
        let t = predict_time_at_distance(&d, mss, tau, corr).unwrap();
        let v_direct = predict_velocity_at_distance(&d, mss, tau, corr).unwrap();
        let v_composed = predict_velocity_at_time(&t, mss, tau, corr).unwrap();
        for (a, b) in v_direct.iter().zip(v_composed.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn invalid_parameters_and_domains_rejected() {
        assert!(predict_velocity_at_time(&[1.0], -1.0, 0.9, Corrections::default()).is_err());
        assert!(predict_velocity_at_time(&[1.0], 8.0, 0.0, Corrections::default()).is_err());
        assert!(predict_time_at_distance(&[-1.0], 8.0, 0.9, Corrections::default()).is_err());
        assert!(predict_time_at_distance(&[f64::NAN], 8.0, 0.9, Corrections::default()).is_err());
    }
}
