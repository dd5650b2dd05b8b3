use ndarray::{Array1, Array2};

/// Model function `y = f(t; params)` evaluated over a whole time axis.
///
/// Closures `Fn(&Array1<f64>, &[f64]) -> Array1<f64>` implement this trait,
/// so alternative models can be handed to the solver without new types.
pub trait FitModel {
    fn evaluate(&self, times: &Array1<f64>, params: &[f64]) -> Array1<f64>;
    /// Number of parameters the model expects, if fixed.
    fn param_count(&self) -> Option<usize> {
        None
    }
    /// Analytic `d f(t_i) / d p_j` as an `N x P` matrix. The solver falls back
    /// to forward differences when this returns `None`.
    fn derivatives(&self, _times: &Array1<f64>, _params: &[f64]) -> Option<Array2<f64>> {
        None
    }
}

impl<F> FitModel for F
where
    F: Fn(&Array1<f64>, &[f64]) -> Array1<f64>,
{
    fn evaluate(&self, times: &Array1<f64>, params: &[f64]) -> Array1<f64> {
        self(times, params)
    }
}

/// `y = p0 * t + p1`
#[derive(Clone, Copy, Debug, Default)]
pub struct LinearModel;

impl LinearModel {
    /// Zero slope, 100 Pa offset.
    pub const DEFAULT_GUESS: [f64; 2] = [0.0, 100.0];
}

impl FitModel for LinearModel {
    fn evaluate(&self, times: &Array1<f64>, params: &[f64]) -> Array1<f64> {
        let (p0, p1) = (params[0], params[1]);
        times.mapv(|t| p0 * t + p1)
    }
    fn param_count(&self) -> Option<usize> {
        Some(2)
    }
    fn derivatives(&self, times: &Array1<f64>, _params: &[f64]) -> Option<Array2<f64>> {
        let mut d = Array2::ones((times.len(), 2));
        d.column_mut(0).assign(times);
        Some(d)
    }
}
