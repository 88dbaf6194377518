//! Least-squares problems: a model of the observations and the weighted
//! residual sum of squares built from it.
use nalgebra::{DMatrix, DVector};
use tracing::warn;

use crate::criteria::ExitCondition;
use crate::error::{MinimizationError, Result};
use crate::result::NonlinearMinimizationResult;

/// A model predicting one value per observation from a parameter vector.
///
/// This is what [`LevenbergMarquardtMinimizer`](crate::LevenbergMarquardtMinimizer)
/// and [`TrustRegionMinimizer`](crate::TrustRegionMinimizer) fit. The
/// Jacobian is optional; without it the [`ObjectiveModel`] uses finite
/// differences.
pub trait ModelFunction {
    /// Predictions `$f(\vec{p})$`, or `None` if the model cannot be evaluated.
    fn values(&self, parameters: &DVector<f64>) -> Option<DVector<f64>>;

    /// The Jacobian `$\partial f_i/\partial p_j$` of the predictions.
    fn jacobian(&self, _parameters: &DVector<f64>) -> Option<DMatrix<f64>> {
        None
    }

    fn is_jacobian_supported(&self) -> bool {
        false
    }
}

impl<M: ModelFunction + ?Sized> ModelFunction for &M {
    fn values(&self, parameters: &DVector<f64>) -> Option<DVector<f64>> {
        (**self).values(parameters)
    }

    fn jacobian(&self, parameters: &DVector<f64>) -> Option<DMatrix<f64>> {
        (**self).jacobian(parameters)
    }

    fn is_jacobian_supported(&self) -> bool {
        (**self).is_jacobian_supported()
    }
}

/// A scalar curve `$y = f(\vec{p}, x)$` sampled at fixed abscissae.
#[derive(Debug, Clone)]
pub struct Curve<F> {
    f: F,
    x: DVector<f64>,
}

impl<F> Curve<F>
where
    F: Fn(&DVector<f64>, f64) -> f64,
{
    pub fn new(f: F, x: DVector<f64>) -> Self {
        Self { f, x }
    }
}

impl<F> ModelFunction for Curve<F>
where
    F: Fn(&DVector<f64>, f64) -> f64,
{
    fn values(&self, parameters: &DVector<f64>) -> Option<DVector<f64>> {
        Some(self.x.map(|x| (self.f)(parameters, x)))
    }
}

/// A [`Curve`] together with its partial derivatives
/// `$\partial f(\vec{p}, x)/\partial p_j$`.
#[derive(Debug, Clone)]
pub struct CurveWithDerivative<F, D> {
    f: F,
    df: D,
    x: DVector<f64>,
}

impl<F, D> CurveWithDerivative<F, D>
where
    F: Fn(&DVector<f64>, f64) -> f64,
    D: Fn(&DVector<f64>, f64) -> DVector<f64>,
{
    pub fn new(f: F, df: D, x: DVector<f64>) -> Self {
        Self { f, df, x }
    }
}

impl<F, D> ModelFunction for CurveWithDerivative<F, D>
where
    F: Fn(&DVector<f64>, f64) -> f64,
    D: Fn(&DVector<f64>, f64) -> DVector<f64>,
{
    fn values(&self, parameters: &DVector<f64>) -> Option<DVector<f64>> {
        Some(self.x.map(|x| (self.f)(parameters, x)))
    }

    fn jacobian(&self, parameters: &DVector<f64>) -> Option<DMatrix<f64>> {
        let n = parameters.len();
        let mut jacobian = DMatrix::zeros(self.x.len(), n);
        for (i, x) in self.x.iter().enumerate() {
            let row = (self.df)(parameters, *x);
            if row.len() != n {
                return None;
            }
            jacobian.row_mut(i).tr_copy_from(&row);
        }
        Some(jacobian)
    }

    fn is_jacobian_supported(&self) -> bool {
        true
    }
}

/// How the Jacobian of the model is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Differencing {
    /// Call [`ModelFunction::jacobian`].
    Analytic,
    /// `$(f(\vec{p} + h\vec{e}_j) - f(\vec{p}))/h$` with `$h = \sqrt{\varepsilon}\max(|p_j|, 1)$`.
    Forward,
    /// `$(f(\vec{p} + h\vec{e}_j) - f(\vec{p} - h\vec{e}_j))/2h$` with `$h = \sqrt[3]{\varepsilon}\max(|p_j|, 1)$`.
    Central,
}

/// Bounds, scales and fixed parameters of a fit.
///
/// Every part is optional. Infinite entries of a bound leave that side of
/// the parameter unbounded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterConstraints {
    lower: Option<DVector<f64>>,
    upper: Option<DVector<f64>>,
    scales: Option<DVector<f64>>,
    is_fixed: Option<Vec<bool>>,
}

impl ParameterConstraints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lower_bound(self, lower: DVector<f64>) -> Self {
        Self {
            lower: Some(lower),
            ..self
        }
    }

    pub fn with_upper_bound(self, upper: DVector<f64>) -> Self {
        Self {
            upper: Some(upper),
            ..self
        }
    }

    /// Typical magnitudes of the parameters, used to scale the internal
    /// coordinates of parameters that are not bounded on both sides.
    pub fn with_scales(self, scales: DVector<f64>) -> Self {
        Self {
            scales: Some(scales),
            ..self
        }
    }

    /// Parameters marked `true` keep their initial value.
    pub fn with_fixed(self, is_fixed: Vec<bool>) -> Self {
        Self {
            is_fixed: Some(is_fixed),
            ..self
        }
    }

    pub fn lower(&self) -> Option<&DVector<f64>> {
        self.lower.as_ref()
    }

    pub fn upper(&self) -> Option<&DVector<f64>> {
        self.upper.as_ref()
    }

    pub fn scales(&self) -> Option<&DVector<f64>> {
        self.scales.as_ref()
    }

    pub fn is_fixed(&self) -> Option<&[bool]> {
        self.is_fixed.as_deref()
    }
}

/// The weighted least-squares objective
/// `$F(\vec{p}) = \vec{r}^\top\mathbf{W}\vec{r}$` with residuals
/// `$\vec{r} = \vec{y} - f(\vec{p})$`.
///
/// Like [`Evaluation`](crate::objective::Evaluation) the model is bound to a
/// point and caches the gradient `$\vec{g} = -\mathbf{J}^\top\mathbf{W}\vec{r}$`
/// and the Gauss-Newton Hessian `$\mathbf{H} = \mathbf{J}^\top\mathbf{W}\mathbf{J}$`
/// there. Note that `$\vec{g}$` is half the gradient of `$F$`.
pub struct ObjectiveModel<'m, M: ?Sized> {
    model: &'m M,
    observed: DVector<f64>,
    weights: Option<DVector<f64>>,
    differencing: Differencing,
    is_fixed: Vec<bool>,
    point: DVector<f64>,
    model_values: DVector<f64>,
    residuals: DVector<f64>,
    value: f64,
    derivatives: Option<(DVector<f64>, DMatrix<f64>)>,
    evaluations: usize,
    jacobian_evaluations: usize,
}

impl<'m, M: ?Sized> Clone for ObjectiveModel<'m, M> {
    fn clone(&self) -> Self {
        Self {
            model: self.model,
            observed: self.observed.clone(),
            weights: self.weights.clone(),
            differencing: self.differencing,
            is_fixed: self.is_fixed.clone(),
            point: self.point.clone(),
            model_values: self.model_values.clone(),
            residuals: self.residuals.clone(),
            value: self.value,
            derivatives: self.derivatives.clone(),
            evaluations: self.evaluations,
            jacobian_evaluations: self.jacobian_evaluations,
        }
    }
}

impl<'m, M: ModelFunction + ?Sized> ObjectiveModel<'m, M> {
    /// Fit `model` to the observations `observed`.
    ///
    /// The Jacobian is analytic if the model supports it and computed by
    /// forward differences otherwise.
    pub fn new(model: &'m M, observed: DVector<f64>) -> Self {
        let differencing = if model.is_jacobian_supported() {
            Differencing::Analytic
        } else {
            Differencing::Forward
        };
        Self {
            model,
            observed,
            weights: None,
            differencing,
            is_fixed: Vec::new(),
            point: DVector::zeros(0),
            model_values: DVector::zeros(0),
            residuals: DVector::zeros(0),
            value: f64::NAN,
            derivatives: None,
            evaluations: 0,
            jacobian_evaluations: 0,
        }
    }

    /// Set the diagonal of `$\mathbf{W}$`.
    ///
    /// # Panics
    ///
    /// Panics if the number of weights differs from the number of
    /// observations or a weight is negative or not finite.
    pub fn with_weights(self, weights: DVector<f64>) -> Self {
        assert_eq!(
            weights.len(),
            self.observed.len(),
            "need one weight per observation"
        );
        assert!(
            weights.iter().all(|w| w.is_finite() && *w >= 0.0),
            "weights must be finite and >= 0"
        );
        Self {
            weights: Some(weights),
            ..self
        }
    }

    pub fn with_differencing(self, differencing: Differencing) -> Self {
        Self {
            differencing,
            ..self
        }
    }

    /// Set the fixed mask and evaluate at the initial guess.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if the mask has the wrong length or fixes every parameter.
    /// - `EvaluationFailed` if the model fails at `initial_guess`.
    pub fn set_parameters(
        &mut self,
        initial_guess: &DVector<f64>,
        is_fixed: Option<&[bool]>,
    ) -> Result<()> {
        let n = initial_guess.len();
        if n == 0 {
            return Err(MinimizationError::invalid_input("no parameters to fit"));
        }
        self.is_fixed = match is_fixed {
            Some(mask) if mask.len() != n => {
                return Err(MinimizationError::invalid_input(format!(
                    "fixed mask has {} entries, expected {n}",
                    mask.len()
                )))
            }
            Some(mask) => mask.to_vec(),
            None => vec![false; n],
        };
        if self.is_fixed.iter().all(|fixed| *fixed) {
            return Err(MinimizationError::invalid_input(
                "all parameters are fixed",
            ));
        }
        self.evaluate_at(initial_guess)
    }

    /// Evaluate the model at `point` and drop the cached derivatives.
    ///
    /// A non-finite residual sum of squares is not an error here; the
    /// minimizers report it as [`ExitCondition::InvalidValues`].
    ///
    /// # Errors
    ///
    /// `EvaluationFailed` if the model returns no values or the wrong number.
    pub fn evaluate_at(&mut self, point: &DVector<f64>) -> Result<()> {
        if self.is_fixed.len() != point.len() {
            self.is_fixed = vec![false; point.len()];
        }
        let model_values = self.call_model(point)?;
        self.residuals = &self.observed - &model_values;
        self.value = match &self.weights {
            Some(w) => self
                .residuals
                .iter()
                .zip(w.iter())
                .map(|(r, w)| w * r * r)
                .sum(),
            None => self.residuals.norm_squared(),
        };
        self.model_values = model_values;
        self.point = point.clone();
        self.derivatives = None;
        Ok(())
    }

    fn call_model(&mut self, point: &DVector<f64>) -> Result<DVector<f64>> {
        self.evaluations += 1;
        let values = self.model.values(point).ok_or_else(|| {
            MinimizationError::evaluation_failed("model returned no values", point, None)
        })?;
        if values.len() != self.observed.len() {
            return Err(MinimizationError::evaluation_failed(
                format!(
                    "model returned {} values for {} observations",
                    values.len(),
                    self.observed.len()
                ),
                point,
                None,
            ));
        }
        Ok(values)
    }

    /// `$\vec{g}$` and `$\mathbf{H}$` at the current point, computed on first access.
    ///
    /// Columns of fixed parameters are zero in `$\mathbf{J}$` and their
    /// diagonal entry in `$\mathbf{H}$` is one.
    ///
    /// # Errors
    ///
    /// - `IncompatibleObjective` if analytic differencing is requested from a
    ///   model without Jacobian.
    /// - `EvaluationFailed` if the model fails while differencing.
    pub fn gradient_and_hessian(&mut self) -> Result<(&DVector<f64>, &DMatrix<f64>)> {
        let derivatives = match self.derivatives.take() {
            Some(derivatives) => derivatives,
            None => {
                let mut jacobian = self.jacobian()?;
                for (j, fixed) in self.is_fixed.iter().enumerate() {
                    if *fixed {
                        jacobian.column_mut(j).fill(0.0);
                    }
                }
                let mut weighted = jacobian.clone();
                let mut weighted_residuals = self.residuals.clone();
                if let Some(w) = &self.weights {
                    for (i, wi) in w.iter().enumerate() {
                        weighted.row_mut(i).scale_mut(*wi);
                        weighted_residuals[i] *= wi;
                    }
                }
                let gradient = -(jacobian.transpose() * weighted_residuals);
                let mut hessian = jacobian.transpose() * weighted;
                for (j, fixed) in self.is_fixed.iter().enumerate() {
                    if *fixed {
                        hessian[(j, j)] = 1.0;
                    }
                }
                (gradient, hessian)
            }
        };
        let (gradient, hessian) = self.derivatives.insert(derivatives);
        Ok((&*gradient, &*hessian))
    }

    /// Jacobian of the predictions at the current point.
    fn jacobian(&mut self) -> Result<DMatrix<f64>> {
        self.jacobian_evaluations += 1;
        let (m, n) = (self.observed.len(), self.point.len());
        let point = self.point.clone();
        let free: Vec<usize> = (0..n).filter(|j| !self.is_fixed[*j]).collect();
        match self.differencing {
            Differencing::Analytic => {
                if !self.model.is_jacobian_supported() {
                    return Err(MinimizationError::IncompatibleObjective {
                        capability: "Jacobian",
                    });
                }
                let jacobian = self.model.jacobian(&point).ok_or_else(|| {
                    MinimizationError::evaluation_failed(
                        "model returned no Jacobian",
                        &point,
                        Some(self.value),
                    )
                })?;
                if jacobian.shape() != (m, n) {
                    return Err(MinimizationError::evaluation_failed(
                        format!("Jacobian has shape {:?}, expected ({m}, {n})", jacobian.shape()),
                        &point,
                        Some(self.value),
                    ));
                }
                Ok(jacobian)
            }
            Differencing::Forward => {
                let mut jacobian = DMatrix::zeros(m, n);
                let center = self.model_values.clone();
                for &j in &free {
                    let mut moved = point.clone();
                    moved[j] += f64::EPSILON.sqrt() * point[j].abs().max(1.0);
                    let h = moved[j] - point[j];
                    let forward = self.call_model(&moved)?;
                    jacobian.set_column(j, &((forward - &center) / h));
                }
                Ok(jacobian)
            }
            Differencing::Central => {
                let mut jacobian = DMatrix::zeros(m, n);
                for &j in &free {
                    let h = f64::EPSILON.cbrt() * point[j].abs().max(1.0);
                    let mut moved = point.clone();
                    moved[j] = point[j] + h;
                    let forward = self.call_model(&moved)?;
                    moved[j] = point[j] - h;
                    let backward = self.call_model(&moved)?;
                    jacobian.set_column(j, &((forward - backward) / (2.0 * h)));
                }
                Ok(jacobian)
            }
        }
    }

    /// An independent copy, caches included.
    pub fn fork(&self) -> Self {
        self.clone()
    }

    /// Keep the counters of a rejected fork.
    pub(crate) fn absorb_counters(&mut self, fork: &Self) {
        self.evaluations = self.evaluations.max(fork.evaluations);
        self.jacobian_evaluations = self.jacobian_evaluations.max(fork.jacobian_evaluations);
    }

    /// Residual sum of squares at the current point.
    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn point(&self) -> &DVector<f64> {
        &self.point
    }

    pub fn model_values(&self) -> &DVector<f64> {
        &self.model_values
    }

    pub fn residuals(&self) -> &DVector<f64> {
        &self.residuals
    }

    pub fn observed(&self) -> &DVector<f64> {
        &self.observed
    }

    pub fn is_fixed(&self) -> &[bool] {
        &self.is_fixed
    }

    pub fn free_parameters(&self) -> usize {
        self.is_fixed.iter().filter(|fixed| !**fixed).count()
    }

    /// Observations with nonzero weight minus free parameters.
    pub fn degrees_of_freedom(&self) -> usize {
        let observations = match &self.weights {
            Some(w) => w.iter().filter(|w| **w > 0.0).count(),
            None => self.observed.len(),
        };
        observations.saturating_sub(self.free_parameters())
    }

    /// Number of model evaluations, including those for finite differences.
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    pub fn jacobian_evaluations(&self) -> usize {
        self.jacobian_evaluations
    }

    /// Fit statistics at the current point.
    ///
    /// The covariance is `$\mathbf{H}^+ F/(m - n)$`, with rows and columns of
    /// fixed parameters set to zero. It is `None` without degrees of freedom,
    /// at a non-finite point or if the pseudo-inverse fails.
    pub(crate) fn to_result(
        &mut self,
        iterations: usize,
        exit_condition: ExitCondition,
    ) -> Result<NonlinearMinimizationResult> {
        let degrees_of_freedom = self.degrees_of_freedom();
        let covariance = if degrees_of_freedom > 0 && self.value.is_finite() {
            self.covariance(degrees_of_freedom)?
        } else {
            None
        };
        let standard_errors = covariance
            .as_ref()
            .map(|c| c.diagonal().map(|v| v.max(0.0).sqrt()));
        let correlation = match (&covariance, &standard_errors) {
            (Some(c), Some(se)) => Some(DMatrix::from_fn(c.nrows(), c.ncols(), |i, j| {
                if i == j && se[i] > 0.0 {
                    1.0
                } else if se[i] > 0.0 && se[j] > 0.0 {
                    c[(i, j)] / (se[i] * se[j])
                } else {
                    0.0
                }
            })),
            _ => None,
        };
        Ok(NonlinearMinimizationResult {
            minimizing_point: self.point.clone(),
            value: self.value,
            minimized_values: self.model_values.clone(),
            covariance,
            correlation,
            standard_errors,
            degrees_of_freedom,
            iterations,
            exit_condition,
        })
    }

    fn covariance(&mut self, degrees_of_freedom: usize) -> Result<Option<DMatrix<f64>>> {
        let reduced_chi_square = self.value / degrees_of_freedom as f64;
        let is_fixed = self.is_fixed.clone();
        let (_, hessian) = self.gradient_and_hessian()?;
        if hessian.iter().any(|h| !h.is_finite()) {
            warn!("Hessian is not finite, no covariance available");
            return Ok(None);
        }
        let mut covariance = match hessian.clone().pseudo_inverse(f64::EPSILON) {
            Ok(inverse) => inverse * reduced_chi_square,
            Err(reason) => {
                warn!("pseudo-inverse of the Hessian failed: {}", reason);
                return Ok(None);
            }
        };
        for (j, fixed) in is_fixed.iter().enumerate() {
            if *fixed {
                covariance.row_mut(j).fill(0.0);
                covariance.column_mut(j).fill(0.0);
            }
        }
        Ok(Some(covariance))
    }
}
