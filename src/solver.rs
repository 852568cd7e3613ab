//! Thin wrapper over the external nonlinear least-squares solver.
//!
//! The estimators hand this module an equation template (a closure from
//! parameter vector and primary coordinate to a predicted value, or a full
//! residual vector for the mixed-effects fitter), data and starting values;
//! it returns point estimates plus convergence diagnostics, or a
//! `Convergence` error. The Jacobian is a central difference of the
//! residual vector, which is plenty for the 2-4 parameter mono-exponential
//! family and its penalized mixed-effects extension.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::storage::Owned;
use nalgebra::{DMatrix, DVector, Dyn};
use tracing::debug;

use crate::{SolverReport, SprintError};

pub(crate) struct NlsOptions {
    pub max_iterations: usize,
    pub tolerance: f64,
}

pub(crate) struct NlsFit {
    pub params: Vec<f64>,
    pub report: SolverReport,
}

/// A least-squares problem over a caller-supplied residual function.
/// Returning `None` from the function marks the iterate as out of domain,
/// which makes the solver backtrack.
struct ResidualProblem<F>
where
    F: Fn(&[f64]) -> Option<DVector<f64>>,
{
    residual_fn: F,
    params: DVector<f64>,
    n_residuals: usize,
}

impl<F> LeastSquaresProblem<f64, Dyn, Dyn> for ResidualProblem<F>
where
    F: Fn(&[f64]) -> Option<DVector<f64>>,
{
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.copy_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        (self.residual_fn)(self.params.as_slice())
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let p = self.params.len();
        let mut jac = DMatrix::zeros(self.n_residuals, p);
        let base: Vec<f64> = self.params.as_slice().to_vec();
        for k in 0..p {
            // Central difference; step scales with the parameter magnitude.
            let h = 6e-6 * base[k].abs().max(1.0);
            let mut plus = base.clone();
            plus[k] += h;
            let mut minus = base.clone();
            minus[k] -= h;
            let r_plus = (self.residual_fn)(&plus)?;
            let r_minus = (self.residual_fn)(&minus)?;
            for i in 0..self.n_residuals {
                jac[(i, k)] = (r_plus[i] - r_minus[i]) / (2.0 * h);
            }
        }
        Some(jac)
    }
}

/// Minimize the sum of squared residuals from the given starting values.
pub(crate) fn fit_least_squares<F>(
    n_residuals: usize,
    start: Vec<f64>,
    residual_fn: F,
    options: &NlsOptions,
) -> Result<NlsFit, SprintError>
where
    F: Fn(&[f64]) -> Option<DVector<f64>>,
{
    let problem = ResidualProblem {
        residual_fn,
        params: DVector::from_vec(start),
        n_residuals,
    };
    let solver = LevenbergMarquardt::new()
        .with_patience(options.max_iterations)
        .with_ftol(options.tolerance)
        .with_xtol(options.tolerance);
    let (solved, report) = solver.minimize(problem);
    debug!(
        termination = ?report.termination,
        evaluations = report.number_of_evaluations,
        objective = report.objective_function,
        "nonlinear least squares finished"
    );
    if !report.termination.was_successful() {
        return Err(SprintError::Convergence(format!(
            "{:?} after {} evaluations (objective {:e})",
            report.termination, report.number_of_evaluations, report.objective_function
        )));
    }
    Ok(NlsFit {
        params: solved.params.as_slice().to_vec(),
        report: SolverReport {
            objective: report.objective_function,
            evaluations: report.number_of_evaluations,
            termination: format!("{:?}", report.termination),
        },
    })
}

/// Fit `model(params, x) ~ y` by nonlinear least squares.
pub(crate) fn fit_curve<F>(
    xs: &[f64],
    ys: &[f64],
    start: Vec<f64>,
    model: F,
    options: &NlsOptions,
) -> Result<NlsFit, SprintError>
where
    F: Fn(&[f64], f64) -> Result<f64, SprintError>,
{
    let n = xs.len();
    fit_least_squares(
        n,
        start,
        |p| {
            let mut out = DVector::zeros(n);
            for (i, (&x, &y)) in xs.iter().zip(ys.iter()).enumerate() {
                out[i] = y - model(p, x).ok()?;
            }
            Some(out)
        },
        options,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_exponential_saturation_parameters() {
        // y = a * (1 - exp(-x / b)), a = 8, b = 0.9.
        let xs: Vec<f64> = (1..=20).map(|i| i as f64 * 0.3).collect();
        let ys: Vec<f64> = xs.iter().map(|&x| 8.0 * (1.0 - (-x / 0.9).exp())).collect();
        let fit = fit_curve(
            &xs,
            &ys,
            vec![7.0, 0.8],
            |p, x| Ok(p[0] * (1.0 - (-x / p[1]).exp())),
            &NlsOptions {
                max_iterations: 100,
                tolerance: 1e-12,
            },
        )
        .unwrap();
        assert!((fit.params[0] - 8.0).abs() < 1e-6, "a = {}", fit.params[0]);
        assert!((fit.params[1] - 0.9).abs() < 1e-6, "b = {}", fit.params[1]);
        assert!(fit.report.objective < 1e-10);
    }

    #[test]
    fn penalty_rows_shrink_a_free_offset() {
        // One data residual (x - 1) plus a strong penalty on x pulls the
        // estimate toward zero, the mechanism the mixed fitter relies on.
        let fit = fit_least_squares(
            2,
            vec![0.5],
            |p| {
                Some(DVector::from_vec(vec![1.0 - p[0], 100.0_f64.sqrt() * p[0]]))
            },
            &NlsOptions {
                max_iterations: 100,
                tolerance: 1e-12,
            },
        )
        .unwrap();
        // Closed form: x = 1 / (1 + 100).
        assert!((fit.params[0] - 1.0 / 101.0).abs() < 1e-8);
    }

    #[test]
    fn model_domain_failure_surfaces_as_convergence_error() {
        let xs = [1.0, 2.0, 3.0];
        let ys = [1.0, 2.0, 3.0];
        let result = fit_curve(
            &xs,
            &ys,
            vec![1.0],
            |_, _| Err(SprintError::Domain("always out of domain".to_string())),
            &NlsOptions {
                max_iterations: 10,
                tolerance: 1e-10,
            },
        );
        assert!(matches!(result, Err(SprintError::Convergence(_))));
    }
}
