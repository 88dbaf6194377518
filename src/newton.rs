//! Newton's method with an analytic Hessian.
use nalgebra::DVector;
use tracing::debug;

use crate::criteria::ExitCriteria;
use crate::error::{MinimizationError, Result};
use crate::line_search::WolfeLineSearch;
use crate::objective::{validate_value_and_gradient, Evaluation, ObjectiveFunction};
use crate::quasi_newton::{check_exit, drive, finish, SearchDirection, Step};
use crate::result::{LineSearchStats, MinimizationResult};

/// Minimizer that solves `$\mathbf{H}\vec{p} = -\nabla f$` in every iteration.
///
/// By default full Newton steps are taken. With
/// [`with_line_search`](Self::with_line_search) every step is a weak Wolfe
/// line search along the Newton direction instead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewtonMinimizer {
    gradient_tolerance: f64,
    maximum_iterations: usize,
    use_line_search: bool,
}

impl Default for NewtonMinimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl NewtonMinimizer {
    pub fn new() -> Self {
        Self {
            gradient_tolerance: 1e-8,
            maximum_iterations: 1000,
            use_line_search: false,
        }
    }

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

    pub fn with_line_search(self, use_line_search: bool) -> Self {
        Self {
            use_line_search,
            ..self
        }
    }

    /// Minimize `objective` starting from `initial_guess`.
    ///
    /// # Errors
    ///
    /// - `IncompatibleObjective` if the objective has no gradient or no Hessian.
    /// - `EvaluationFailed` for non-finite values, gradients or Hessians.
    /// - `InnerOptimization` if a line search fails.
    /// - `MaximumIterations` if the gradient did not vanish in time.
    pub fn find_minimum<O>(
        &self,
        objective: &O,
        initial_guess: &DVector<f64>,
    ) -> Result<MinimizationResult>
    where
        O: ObjectiveFunction + ?Sized,
    {
        if !objective.is_gradient_supported() {
            return Err(MinimizationError::IncompatibleObjective {
                capability: "gradient",
            });
        }
        if !objective.is_hessian_supported() {
            return Err(MinimizationError::IncompatibleObjective {
                capability: "Hessian",
            });
        }

        // only the gradient test applies to Newton's method
        let criteria = ExitCriteria::new(self.gradient_tolerance, 0.0, 0.0);
        let mut direction = NewtonDirection;
        if self.use_line_search {
            return drive(
                objective,
                initial_guess,
                &criteria,
                self.maximum_iterations,
                &mut direction,
            );
        }

        let mut current = Evaluation::new(objective, initial_guess.clone());
        validate_value_and_gradient(&mut current)?;
        if let Some(exit_condition) = check_exit(&criteria, &direction, &mut current, None, 0)? {
            return finish(current, 0, exit_condition, None);
        }
        for iteration in 1..=self.maximum_iterations {
            let step = newton_direction(&mut current)?;
            let mut candidate = current.at(current.point() + &step);
            validate_value_and_gradient(&mut candidate)?;
            let value = candidate.value()?;
            debug!(iteration, value, step_norm = step.norm(), "accepted step");
            if let Some(exit_condition) =
                check_exit(&criteria, &direction, &mut candidate, None, iteration)?
            {
                return finish(candidate, iteration, exit_condition, None);
            }
            current = candidate;
        }
        Err(MinimizationError::maximum_iterations(self.maximum_iterations))
    }
}

/// Newton direction, or steepest descent where it is not a descent direction.
fn newton_direction<O>(evaluation: &mut Evaluation<'_, O>) -> Result<DVector<f64>>
where
    O: ObjectiveFunction + ?Sized,
{
    let value = evaluation.value()?;
    let gradient = evaluation.gradient()?.clone();
    let hessian = evaluation.hessian()?.clone();
    if hessian.iter().any(|h| !h.is_finite()) {
        return Err(MinimizationError::evaluation_failed(
            "non-finite Hessian returned",
            evaluation.point(),
            Some(value),
        ));
    }

    let rhs = -&gradient;
    let newton = match hessian.clone().cholesky() {
        Some(cholesky) => Some(cholesky.solve(&rhs)),
        None => hessian.lu().solve(&rhs),
    };
    match newton {
        Some(p) if p.dot(&gradient) < 0.0 => Ok(p),
        _ => {
            debug!("Newton step is not a descent direction, using steepest descent");
            Ok(rhs)
        }
    }
}

struct NewtonDirection;

impl SearchDirection for NewtonDirection {
    fn line_search(&self) -> WolfeLineSearch {
        WolfeLineSearch::weak(1e-4, 0.9, 1e-10, 1000)
    }

    fn first_step<O>(&mut self, initial: &mut Evaluation<'_, O>) -> Result<Option<Step>>
    where
        O: ObjectiveFunction + ?Sized,
    {
        Ok(Some(Step::unbounded(newton_direction(initial)?, 1.0)))
    }

    fn next_step<O>(
        &mut self,
        _previous: &mut Evaluation<'_, O>,
        candidate: &mut Evaluation<'_, O>,
        _stats: &mut LineSearchStats,
    ) -> Result<Option<Step>>
    where
        O: ObjectiveFunction + ?Sized,
    {
        self.first_step(candidate)
    }
}
