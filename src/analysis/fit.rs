//! Weighted nonlinear least squares.
//!
//! Minimises `sum(((y_i - f(t_i; p)) / sigma_i)^2)` with a Levenberg-Marquardt
//! iteration. The Jacobian comes from [`FitModel::derivatives`] when the model
//! provides it and from forward differences (MINPACK `lmdif` step sizes)
//! otherwise. Steps are solved through the SVD of the column-scaled Jacobian
//! rather than the normal equations, since epoch timestamps make `J^T J`
//! nearly singular. Parameter errors come from the unscaled covariance
//! `(J^T J)^-1` at the optimum.
use log::debug;
use nalgebra::{DMatrix, DVector};
use ndarray::Array1;
use serde::Serialize;
use thiserror::Error;

use crate::analysis::model::{FitModel, LinearModel};
use crate::types::FitResult;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FitError {
    #[error("series lengths differ: {times} times, {values} values, {uncertainties} uncertainties")]
    LengthMismatch {
        times: usize,
        values: usize,
        uncertainties: usize,
    },
    #[error("{samples} samples are not enough to fit {params} parameters")]
    InsufficientData { samples: usize, params: usize },
    #[error("model expects {expected} parameters, initial guess has {actual}")]
    ParameterCount { expected: usize, actual: usize },
    #[error("uncertainty at index {index} must be positive and finite, got {value}")]
    InvalidUncertainty { index: usize, value: f64 },
    #[error("weighted residuals are not finite")]
    NonFinite,
    #[error("solver did not converge within {iterations} iterations")]
    NotConverged { iterations: usize },
    #[error("parameter covariance is singular")]
    SingularCovariance,
}

#[derive(Clone, Copy, Debug)]
pub struct SolverOptions {
    pub max_iterations: usize,
    /// Relative reduction of chi-square below which the fit is done.
    pub ftol: f64,
    /// Relative step size below which the fit is done.
    pub xtol: f64,
    /// Largest cosine between the residual and a Jacobian column at which the
    /// current point counts as stationary.
    pub gtol: f64,
    pub initial_lambda: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        // MINPACK defaults: sqrt(machine epsilon)
        Self {
            max_iterations: 200,
            ftol: 1.49012e-8,
            xtol: 1.49012e-8,
            gtol: 1e-8,
            initial_lambda: 1e-3,
        }
    }
}

/// Model-agnostic solver output.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FitSolution {
    pub params: Vec<f64>,
    pub param_errors: Vec<f64>,
    pub chi_square: f64,
    pub degrees_of_freedom: i64,
    pub iterations: usize,
}

impl FitSolution {
    /// Linear view, valid for two-parameter `p0 * t + p1` models.
    pub fn linear(&self) -> Option<FitResult> {
        if self.params.len() != 2 {
            return None;
        }
        Some(FitResult {
            slope: self.params[0],
            slope_error: self.param_errors[0],
            intercept: self.params[1],
            intercept_error: self.param_errors[1],
            chi_square: self.chi_square,
            degrees_of_freedom: self.degrees_of_freedom,
        })
    }
}

/// Levenberg-Marquardt driver around a swappable [`FitModel`].
pub struct FitEngine<M: FitModel> {
    model: M,
    options: SolverOptions,
}

impl FitEngine<LinearModel> {
    pub fn linear() -> Self {
        Self::new(LinearModel)
    }
    pub fn fit_linear(
        &self,
        times: &[f64],
        values: &[f64],
        uncertainties: &[f64],
        initial_guess: [f64; 2],
    ) -> Result<FitResult, FitError> {
        let solution = self.fit(times, values, uncertainties, &initial_guess)?;
        solution.linear().ok_or(FitError::ParameterCount {
            expected: 2,
            actual: solution.params.len(),
        })
    }
}

impl<M: FitModel> FitEngine<M> {
    pub fn new(model: M) -> Self {
        Self {
            model,
            options: SolverOptions::default(),
        }
    }
    pub fn with_options(mut self, options: SolverOptions) -> Self {
        self.options = options;
        self
    }

    pub fn fit(
        &self,
        times: &[f64],
        values: &[f64],
        uncertainties: &[f64],
        initial_guess: &[f64],
    ) -> Result<FitSolution, FitError> {
        let problem = Problem::new(&self.model, times, values, uncertainties, initial_guess)?;
        let opts = &self.options;
        let n_params = initial_guess.len();

        let mut params = initial_guess.to_vec();
        let mut residuals = problem.residuals(&params)?;
        let mut chi2 = residuals.dot(&residuals);
        let mut lambda = opts.initial_lambda;
        let mut iterations = 0;
        let mut converged = chi2 == 0.0;
        let mut accepted_steps = 0usize;

        while !converged {
            if iterations >= opts.max_iterations {
                return Err(FitError::NotConverged { iterations });
            }
            iterations += 1;
            let jac = problem.jacobian(&params, &residuals)?;
            let decomposition = ScaledSvd::new(&jac)?;
            let r = DVector::from_iterator(residuals.len(), residuals.iter().copied());
            let utr = decomposition.u.tr_mul(&r);

            // Gauss-Newton first, then Marquardt damping until chi-square drops
            let mut accepted = None;
            let mut damping = 0.0;
            while damping <= MAX_DAMPING {
                let step = decomposition.step(&utr, damping);
                let trial: Vec<f64> = params.iter().zip(&step).map(|(p, d)| p + d).collect();
                if let Ok(trial_residuals) = problem.residuals(&trial) {
                    if trial_residuals.dot(&trial_residuals) < chi2 {
                        let step_norm = step.iter().map(|d| d * d).sum::<f64>().sqrt();
                        accepted = Some((trial, trial_residuals, step_norm, damping));
                        break;
                    }
                }
                damping = if damping == 0.0 { lambda } else { damping * 10.0 };
            }
            let Some((trial, trial_residuals, step_norm, damping)) = accepted else {
                // no downhill step left
                if accepted_steps == 0 && !is_stationary(&jac, &r, opts.gtol) {
                    return Err(FitError::NotConverged { iterations });
                }
                break;
            };
            accepted_steps += 1;
            let new_chi2 = trial_residuals.dot(&trial_residuals);
            converged = if damping == 0.0 {
                let param_norm = trial.iter().map(|p| p * p).sum::<f64>().sqrt();
                new_chi2 == 0.0
                    || (chi2 - new_chi2) <= opts.ftol * chi2
                    || step_norm <= opts.xtol * (param_norm + opts.xtol)
            } else {
                lambda = (damping / 10.0).max(MIN_DAMPING);
                new_chi2 == 0.0
            };
            params = trial;
            residuals = trial_residuals;
            chi2 = new_chi2;
        }
        debug!("fit finished after {iterations} iterations, chi2 = {chi2:e}");

        let jac = problem.jacobian(&params, &residuals)?;
        let param_errors = ScaledSvd::new(&jac)?.parameter_errors()?;
        Ok(FitSolution {
            params,
            param_errors,
            chi_square: chi2,
            degrees_of_freedom: problem.len() as i64 - 1 - n_params as i64,
            iterations,
        })
    }
}

/// Fits `y = p0 * t + p1` with the default solver settings.
pub fn fit_linear(
    times: &[f64],
    values: &[f64],
    uncertainties: &[f64],
    initial_guess: [f64; 2],
) -> Result<FitResult, FitError> {
    FitEngine::linear().fit_linear(times, values, uncertainties, initial_guess)
}

struct Problem<'a, M: FitModel> {
    model: &'a M,
    times: Array1<f64>,
    values: Array1<f64>,
    uncertainties: Array1<f64>,
}

impl<'a, M: FitModel> Problem<'a, M> {
    fn new(
        model: &'a M,
        times: &[f64],
        values: &[f64],
        uncertainties: &[f64],
        initial_guess: &[f64],
    ) -> Result<Self, FitError> {
        if times.len() != values.len() || times.len() != uncertainties.len() {
            return Err(FitError::LengthMismatch {
                times: times.len(),
                values: values.len(),
                uncertainties: uncertainties.len(),
            });
        }
        if let Some(expected) = model.param_count() {
            if expected != initial_guess.len() {
                return Err(FitError::ParameterCount {
                    expected,
                    actual: initial_guess.len(),
                });
            }
        }
        if initial_guess.is_empty() || times.len() < initial_guess.len() {
            return Err(FitError::InsufficientData {
                samples: times.len(),
                params: initial_guess.len(),
            });
        }
        if let Some((index, &value)) = uncertainties
            .iter()
            .enumerate()
            .find(|(_, s)| !(s.is_finite() && **s > 0.0))
        {
            return Err(FitError::InvalidUncertainty { index, value });
        }
        Ok(Self {
            model,
            times: Array1::from(times.to_vec()),
            values: Array1::from(values.to_vec()),
            uncertainties: Array1::from(uncertainties.to_vec()),
        })
    }

    fn len(&self) -> usize {
        self.times.len()
    }

    fn residuals(&self, params: &[f64]) -> Result<Array1<f64>, FitError> {
        let predicted = self.model.evaluate(&self.times, params);
        if predicted.len() != self.len() {
            return Err(FitError::NonFinite);
        }
        let chi = (&self.values - &predicted) / &self.uncertainties;
        if chi.iter().all(|c| c.is_finite()) {
            Ok(chi)
        } else {
            Err(FitError::NonFinite)
        }
    }

    // d r_i / d p_j with r_i = (y_i - f(t_i)) / sigma_i
    fn jacobian(&self, params: &[f64], base: &Array1<f64>) -> Result<DMatrix<f64>, FitError> {
        if let Some(d) = self.model.derivatives(&self.times, params) {
            if d.dim() == (self.len(), params.len()) {
                let jac = DMatrix::from_fn(self.len(), params.len(), |i, j| {
                    -d[(i, j)] / self.uncertainties[i]
                });
                return if jac.iter().all(|v| v.is_finite()) {
                    Ok(jac)
                } else {
                    Err(FitError::NonFinite)
                };
            }
        }
        let eps = f64::EPSILON.sqrt();
        let mut jac = DMatrix::zeros(self.len(), params.len());
        let mut shifted = params.to_vec();
        for j in 0..params.len() {
            let h = if params[j] == 0.0 { eps } else { eps * params[j].abs() };
            shifted[j] = params[j] + h;
            let r = self.residuals(&shifted)?;
            for i in 0..self.len() {
                jac[(i, j)] = (r[i] - base[i]) / h;
            }
            shifted[j] = params[j];
        }
        Ok(jac)
    }
}

// MINPACK gtol test
fn is_stationary(jac: &DMatrix<f64>, residuals: &DVector<f64>, gtol: f64) -> bool {
    let r_norm = residuals.norm();
    if r_norm == 0.0 {
        return true;
    }
    jac.column_iter().all(|col| {
        let norm = col.norm();
        norm == 0.0 || col.dot(residuals).abs() / (norm * r_norm) <= gtol
    })
}

const MAX_DAMPING: f64 = 1e16;
const MIN_DAMPING: f64 = 1e-12;
/// Singular values below `RCOND * s_max` of the column-scaled Jacobian are
/// treated as zero.
const RCOND: f64 = 1e-12;

/// SVD of the Jacobian after scaling every column to unit norm.
struct ScaledSvd {
    u: DMatrix<f64>,
    v_t: DMatrix<f64>,
    singular: DVector<f64>,
    scales: Vec<f64>,
    cutoff: f64,
}

impl ScaledSvd {
    fn new(jac: &DMatrix<f64>) -> Result<Self, FitError> {
        let scales: Vec<f64> = jac
            .column_iter()
            .map(|c| {
                let norm = c.norm();
                if norm > 0.0 {
                    norm
                } else {
                    1.0
                }
            })
            .collect();
        let mut scaled = jac.clone();
        for (j, scale) in scales.iter().enumerate() {
            for i in 0..scaled.nrows() {
                scaled[(i, j)] /= scale;
            }
        }
        let svd = scaled.svd(true, true);
        let u = svd.u.ok_or(FitError::SingularCovariance)?;
        let v_t = svd.v_t.ok_or(FitError::SingularCovariance)?;
        let singular = svd.singular_values;
        let s_max = singular.iter().cloned().fold(0.0, f64::max);
        Ok(Self {
            u,
            v_t,
            singular,
            scales,
            cutoff: s_max * RCOND,
        })
    }

    // minimises |r + J d|^2 + damping * |D d|^2 with D = diag(column norms)
    fn step(&self, utr: &DVector<f64>, damping: f64) -> Vec<f64> {
        let s = &self.singular;
        (0..self.scales.len())
            .map(|j| {
                let z: f64 = (0..s.len())
                    .filter(|&k| s[k] > self.cutoff)
                    .map(|k| self.v_t[(k, j)] * s[k] / (s[k] * s[k] + damping) * utr[k])
                    .sum();
                -z / self.scales[j]
            })
            .collect()
    }

    // sqrt(diag((J^T J)^-1)) = sqrt(diag(D^-1 V S^-2 V^T D^-1))
    fn parameter_errors(&self) -> Result<Vec<f64>, FitError> {
        let s = &self.singular;
        let cols = self.scales.len();
        if s.len() < cols || s.iter().any(|&sv| !(sv > self.cutoff)) {
            return Err(FitError::SingularCovariance);
        }
        let errors: Vec<f64> = (0..cols)
            .map(|j| {
                let var: f64 = (0..s.len()).map(|k| (self.v_t[(k, j)] / s[k]).powi(2)).sum();
                var.sqrt() / self.scales[j]
            })
            .collect();
        if errors.iter().all(|e| e.is_finite()) {
            Ok(errors)
        } else {
            Err(FitError::SingularCovariance)
        }
    }
}
