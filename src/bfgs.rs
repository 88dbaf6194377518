//! Broyden-Fletcher-Goldfarb-Shanno with an explicit inverse Hessian.
use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::criteria::ExitCriteria;
use crate::error::Result;
use crate::line_search::WolfeLineSearch;
use crate::objective::{Evaluation, ObjectiveFunction};
use crate::quasi_newton::{drive, steepest_descent_step, SearchDirection, Step};
use crate::result::{LineSearchStats, MinimizationResult};

/// Unconstrained quasi-Newton minimizer.
///
/// Keeps a dense approximation `$\mathbf{H}$` of the inverse Hessian, starting
/// from the identity, and searches along `$-\mathbf{H}\nabla f$` with a weak
/// Wolfe line search. Needs the gradient of the objective.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BfgsMinimizer {
    gradient_tolerance: f64,
    parameter_tolerance: f64,
    function_progress_tolerance: f64,
    maximum_iterations: usize,
}

impl Default for BfgsMinimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl BfgsMinimizer {
    pub fn new() -> Self {
        Self {
            gradient_tolerance: 1e-8,
            parameter_tolerance: 1e-8,
            function_progress_tolerance: 1e-8,
            maximum_iterations: 1000,
        }
    }

    /// Set the tolerance on the relative gradient
    /// `$\max_i |g_i|\max(|x_i|,1)/\max(|f|,1)$`.
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

    /// Set the tolerance on the relative change of the point between two
    /// iterations.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{parameter\_tolerance} < 0$`.
    pub fn with_parameter_tolerance(self, parameter_tolerance: f64) -> Self {
        assert!(parameter_tolerance >= 0.0, "parameter_tolerance must be >= 0");
        Self {
            parameter_tolerance,
            ..self
        }
    }

    /// Set the smallest decrease of `$f$` that still counts as progress in long runs.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{function\_progress\_tolerance} < 0$`.
    pub fn with_function_progress_tolerance(self, function_progress_tolerance: f64) -> Self {
        assert!(
            function_progress_tolerance >= 0.0,
            "function_progress_tolerance must be >= 0"
        );
        Self {
            function_progress_tolerance,
            ..self
        }
    }

    /// # Panics
    ///
    /// Panics if `$\mathtt{maximum\_iterations} = 0$`.
    pub fn with_maximum_iterations(self, maximum_iterations: usize) -> Self {
        assert!(maximum_iterations > 0, "maximum_iterations must be > 0");
        Self {
            maximum_iterations,
            ..self
        }
    }

    /// Minimize `objective` starting from `initial_guess`.
    ///
    /// # Errors
    ///
    /// - `IncompatibleObjective` if the objective has no gradient.
    /// - `EvaluationFailed` for non-finite values or gradients.
    /// - `InnerOptimization` if a line search fails.
    /// - `MaximumIterations` if no exit criterion was met in time.
    pub fn find_minimum<O>(
        &self,
        objective: &O,
        initial_guess: &DVector<f64>,
    ) -> Result<MinimizationResult>
    where
        O: ObjectiveFunction + ?Sized,
    {
        let criteria = ExitCriteria::new(
            self.gradient_tolerance,
            self.parameter_tolerance,
            self.function_progress_tolerance,
        );
        let mut direction = BfgsDirection {
            inverse_hessian: DMatrix::identity(initial_guess.len(), initial_guess.len()),
            line_search: WolfeLineSearch::weak(
                1e-4,
                0.9,
                self.parameter_tolerance.max(1e-10),
                1000,
            ),
        };
        drive(
            objective,
            initial_guess,
            &criteria,
            self.maximum_iterations,
            &mut direction,
        )
    }
}

struct BfgsDirection {
    inverse_hessian: DMatrix<f64>,
    line_search: WolfeLineSearch,
}

/// `$\mathbf{H} \leftarrow \mathbf{H} + \frac{s^\top y + y^\top\mathbf{H}y}{(s^\top y)^2}ss^\top - \frac{\mathbf{H}ys^\top + sy^\top\mathbf{H}}{s^\top y}$`
///
/// Skipped if `$s^\top y \leq 0$`, which keeps `$\mathbf{H}$` positive definite.
fn update_inverse_hessian(h: &mut DMatrix<f64>, s: &DVector<f64>, y: &DVector<f64>) {
    let sy = s.dot(y);
    if !(sy > 0.0) {
        return;
    }
    let hy = &*h * y;
    let yhy = y.dot(&hy);
    // H is symmetric, so y'H = (Hy)'
    h.ger((sy + yhy) / (sy * sy), s, s, 1.0);
    h.ger(-1.0 / sy, &hy, s, 1.0);
    h.ger(-1.0 / sy, s, &hy, 1.0);
}

impl SearchDirection for BfgsDirection {
    fn line_search(&self) -> WolfeLineSearch {
        self.line_search
    }

    fn first_step<O>(&mut self, initial: &mut Evaluation<'_, O>) -> Result<Option<Step>>
    where
        O: ObjectiveFunction + ?Sized,
    {
        let gradient = initial.gradient()?;
        Ok(Some(Step::unbounded(
            -gradient,
            steepest_descent_step(gradient),
        )))
    }

    fn next_step<O>(
        &mut self,
        previous: &mut Evaluation<'_, O>,
        candidate: &mut Evaluation<'_, O>,
        stats: &mut LineSearchStats,
    ) -> Result<Option<Step>>
    where
        O: ObjectiveFunction + ?Sized,
    {
        let s = candidate.point() - previous.point();
        let previous_gradient = previous.gradient()?.clone();
        let gradient = candidate.gradient()?;
        let y = gradient - previous_gradient;
        update_inverse_hessian(&mut self.inverse_hessian, &s, &y);

        let direction = -(&self.inverse_hessian * gradient);
        if direction.dot(gradient) >= 0.0 {
            debug!("BFGS direction is not a descent direction, resetting to steepest descent");
            stats.steepest_descent_resets += 1;
            self.inverse_hessian.fill_with_identity();
            return Ok(Some(Step::unbounded(
                -gradient,
                steepest_descent_step(gradient),
            )));
        }
        Ok(Some(Step::unbounded(direction, 1.0)))
    }
}
