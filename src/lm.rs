//! Levenberg-Marquardt with an adaptive damping parameter.
use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::criteria::ExitCondition;
use crate::error::Result;
use crate::problem::{ModelFunction, ObjectiveModel, ParameterConstraints};
use crate::projection::{all_finite, start_fit};
use crate::result::NonlinearMinimizationResult;

#[cfg(test)]
mod test_helpers;
#[cfg(test)]
mod test_lm;

/// Levenberg-Marquardt minimizer for weighted least-squares problems.
///
/// Each iteration solves the damped normal equations
/// ```math
///   (\mathbf{H} + \mu\mathbf{I})\Delta\vec{p} = -\vec{g}
/// ```
/// with the Gauss-Newton Hessian `$\mathbf{H} = \mathbf{J}^\top\mathbf{W}\mathbf{J}$`
/// and `$\vec{g} = -\mathbf{J}^\top\mathbf{W}\vec{r}$`. A step is accepted
/// if the gain ratio
/// ```math
///   \rho = \frac{F(\vec{p}) - F(\vec{p} + \Delta\vec{p})}{\Delta\vec{p}^\top(\mu\Delta\vec{p} - \vec{g})}
/// ```
/// is positive; then `$\mu$` shrinks by `$\max(\frac{1}{3}, 1 - (2\rho - 1)^3)$`.
/// Otherwise `$\mu$` grows by a factor `$\nu$` which doubles on every
/// consecutive rejection.
///
/// Bounds are not enforced by clipping. The parameters are mapped to
/// unconstrained internal coordinates (see [`Projection`](crate::Projection))
/// and the iteration runs there.
///
/// # Example
///
/// ```
/// # use approx::assert_relative_eq;
/// use nalgebra::DVector;
/// use numopt::{CurveWithDerivative, LevenbergMarquardtMinimizer, ObjectiveModel, ParameterConstraints};
///
/// // y = a x + b
/// let line = CurveWithDerivative::new(
///     |p: &DVector<f64>, x: f64| p[0] * x + p[1],
///     |_: &DVector<f64>, x: f64| DVector::from_vec(vec![x, 1.0]),
///     DVector::from_vec(vec![1.0, 2.0]),
/// );
/// let mut model = ObjectiveModel::new(&line, DVector::from_vec(vec![3.0, 5.0]));
/// let result = LevenbergMarquardtMinimizer::new()
///     .find_minimum(&mut model, &DVector::zeros(2), &ParameterConstraints::new())
///     .unwrap();
/// assert_relative_eq!(result.minimizing_point, DVector::from_vec(vec![2.0, 1.0]), epsilon = 1e-6);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevenbergMarquardtMinimizer {
    initial_mu: f64,
    gradient_tolerance: f64,
    step_tolerance: f64,
    function_tolerance: f64,
    maximum_iterations: Option<usize>,
}

impl Default for LevenbergMarquardtMinimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl LevenbergMarquardtMinimizer {
    pub fn new() -> Self {
        Self {
            initial_mu: 1e-3,
            gradient_tolerance: 1e-15,
            step_tolerance: 1e-15,
            function_tolerance: 1e-15,
            maximum_iterations: None,
        }
    }

    /// Set `$\tau$` in the initial damping `$\mu = \tau\max_i H_{ii}$`.
    ///
    /// Small values (`$10^{-6}$`) suit a good initial guess, larger
    /// values (up to `$1$`) a poor one.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{initial\_mu} \leq 0$`.
    pub fn with_initial_mu(self, initial_mu: f64) -> Self {
        assert!(initial_mu > 0.0, "initial_mu must be > 0");
        Self { initial_mu, ..self }
    }

    /// Stop when `$\|\vec{g}\|_\infty$` is at most `gradient_tolerance`.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{gradient\_tolerance} < 0$`.
    pub fn with_gradient_tolerance(self, gradient_tolerance: f64) -> Self {
        assert!(gradient_tolerance >= 0.0, "gradient_tolerance must be >= 0");
        Self {
            gradient_tolerance,
            ..self
        }
    }

    /// Stop when `$\|\Delta\vec{p}\| \leq \epsilon(\epsilon + \|\vec{p}\|)$`.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{step\_tolerance} < 0$`.
    pub fn with_step_tolerance(self, step_tolerance: f64) -> Self {
        assert!(step_tolerance >= 0.0, "step_tolerance must be >= 0");
        Self {
            step_tolerance,
            ..self
        }
    }

    /// Stop when the residual sum of squares is at most `function_tolerance`.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{function\_tolerance} < 0$`.
    pub fn with_function_tolerance(self, function_tolerance: f64) -> Self {
        assert!(function_tolerance >= 0.0, "function_tolerance must be >= 0");
        Self {
            function_tolerance,
            ..self
        }
    }

    /// Set the number of outer iterations, `$200(n+1)$` by default.
    ///
    /// Zero evaluates the initial guess only and reports
    /// [`ExitCondition::ManuallyStopped`].
    pub fn with_maximum_iterations(self, maximum_iterations: usize) -> Self {
        Self {
            maximum_iterations: Some(maximum_iterations),
            ..self
        }
    }

    /// Fit `model` starting from `initial_guess`.
    ///
    /// Numerical breakdown (a non-finite residual sum of squares, gradient or
    /// damping) and an exhausted iteration budget are reported through the
    /// exit condition of the result, with the statistics of the last
    /// accepted point.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` for inconsistent constraints or an infeasible guess.
    /// - `EvaluationFailed` if the model returns no or too few values.
    /// - `IncompatibleObjective` if an analytic Jacobian is requested from a
    ///   model that has none.
    pub fn find_minimum<M>(
        &self,
        model: &mut ObjectiveModel<'_, M>,
        initial_guess: &DVector<f64>,
        constraints: &ParameterConstraints,
    ) -> Result<NonlinearMinimizationResult>
    where
        M: ModelFunction + ?Sized,
    {
        let (projection, mut p) = start_fit(model, initial_guess, constraints)?;
        if !model.value().is_finite() {
            return model.to_result(0, ExitCondition::InvalidValues);
        }
        let maximum_iterations = self
            .maximum_iterations
            .unwrap_or(200 * (initial_guess.len() + 1));
        if maximum_iterations == 0 {
            return model.to_result(0, ExitCondition::ManuallyStopped);
        }

        let (mut gradient, mut hessian) = projection.evaluate_jacobian(model, &p)?;
        if !all_finite(&gradient, &hessian) {
            return model.to_result(0, ExitCondition::InvalidValues);
        }
        let mut exit_condition = self.check_convergence(model.value(), &gradient);

        let max_diagonal = hessian.diagonal().max();
        let mut mu = if max_diagonal > 0.0 {
            self.initial_mu * max_diagonal
        } else {
            self.initial_mu
        };
        let mut nu = 2.0;
        let mut iterations = 0;

        while exit_condition.is_none() && iterations < maximum_iterations {
            iterations += 1;
            exit_condition = loop {
                let step = match damped_step(&hessian, &gradient, mu) {
                    Some(step) => step,
                    None => {
                        mu *= nu;
                        nu *= 2.0;
                        if !mu.is_finite() {
                            break Some(ExitCondition::InvalidValues);
                        }
                        continue;
                    }
                };
                if step.norm() <= self.step_tolerance * (self.step_tolerance + p.norm()) {
                    break Some(ExitCondition::RelativePoints);
                }

                let candidate = &p + &step;
                let mut trial = model.fork();
                projection.evaluate_function(&mut trial, &candidate)?;
                if !trial.value().is_finite() {
                    model.absorb_counters(&trial);
                    break Some(ExitCondition::InvalidValues);
                }

                let predicted_reduction = step.dot(&(&step * mu - &gradient));
                let rho = (model.value() - trial.value()) / predicted_reduction;
                if rho > 0.0 {
                    *model = trial;
                    p = candidate;
                    let (g, h) = projection.evaluate_jacobian(model, &p)?;
                    if !all_finite(&g, &h) {
                        break Some(ExitCondition::InvalidValues);
                    }
                    gradient = g;
                    hessian = h;
                    mu *= (1.0 / 3.0f64).max(1.0 - (2.0 * rho - 1.0).powi(3));
                    nu = 2.0;
                    debug!(
                        "iteration {}: RSS {:e}, |dp| {:e}, mu {:e}",
                        iterations,
                        model.value(),
                        step.norm(),
                        mu
                    );
                    break self.check_convergence(model.value(), &gradient);
                }

                model.absorb_counters(&trial);
                mu *= nu;
                nu *= 2.0;
                if !mu.is_finite() {
                    break Some(ExitCondition::InvalidValues);
                }
            };
        }

        let exit_condition = exit_condition.unwrap_or(ExitCondition::ExceedIterations);
        model.to_result(iterations, exit_condition)
    }

    fn check_convergence(&self, rss: f64, gradient: &DVector<f64>) -> Option<ExitCondition> {
        if gradient.amax() <= self.gradient_tolerance {
            Some(ExitCondition::AbsoluteGradient)
        } else if rss <= self.function_tolerance {
            Some(ExitCondition::Converged)
        } else {
            None
        }
    }
}

/// Solve `$(\mathbf{H} + \mu\mathbf{I})\Delta\vec{p} = -\vec{g}$`.
fn damped_step(hessian: &DMatrix<f64>, gradient: &DVector<f64>, mu: f64) -> Option<DVector<f64>> {
    let mut damped = hessian.clone();
    for i in 0..damped.nrows() {
        damped[(i, i)] += mu;
    }
    let rhs = -gradient;
    let step = match damped.clone().cholesky() {
        Some(cholesky) => cholesky.solve(&rhs),
        None => damped.lu().solve(&rhs)?,
    };
    step.iter().all(|s| s.is_finite()).then_some(step)
}
