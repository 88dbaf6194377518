//! BFGS for box-constrained problems.
//!
//! Every iteration first finds the generalized Cauchy point of the quadratic
//! model, which fixes a set of variables at their bounds. The model is then
//! minimized over the remaining free variables and the resulting point is
//! pulled back into the box. The line search runs from the current point
//! toward that point and never leaves the box.
use nalgebra::{DMatrix, DVector};
use tracing::warn;

use crate::criteria::ExitCriteria;
use crate::error::Result;
use crate::gradient_projection::{cauchy_point, BoxBounds};
use crate::line_search::WolfeLineSearch;
use crate::objective::{Evaluation, ObjectiveFunction};
use crate::quasi_newton::{drive, SearchDirection, Step};
use crate::result::{LineSearchStats, MinimizationResult};

/// Bound-constrained quasi-Newton minimizer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BfgsBMinimizer {
    gradient_tolerance: f64,
    parameter_tolerance: f64,
    function_progress_tolerance: f64,
    maximum_iterations: usize,
}

impl Default for BfgsBMinimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl BfgsBMinimizer {
    pub fn new() -> Self {
        Self {
            gradient_tolerance: 1e-8,
            parameter_tolerance: 1e-8,
            function_progress_tolerance: 1e-8,
            maximum_iterations: 1000,
        }
    }

    /// Set the tolerance on the relative projected gradient.
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

    /// Minimize `objective` over the box `$[\vec{l}, \vec{u}]$`.
    ///
    /// Every point the objective is evaluated at lies inside the box.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if `initial_guess` is not inside the box or the
    ///   dimensions do not match.
    /// - Otherwise as [`BfgsMinimizer::find_minimum`](crate::BfgsMinimizer::find_minimum).
    pub fn find_minimum<O>(
        &self,
        objective: &O,
        bounds: &BoxBounds,
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
        let n = initial_guess.len();
        let mut direction = BfgsBDirection {
            bounds: bounds.clone(),
            pseudo_hessian: DMatrix::identity(n, n),
            line_search: WolfeLineSearch::strong(
                1e-4,
                0.9,
                self.parameter_tolerance.max(1e-5),
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

struct BfgsBDirection {
    bounds: BoxBounds,
    /// Approximation of the Hessian itself, not its inverse.
    pseudo_hessian: DMatrix<f64>,
    line_search: WolfeLineSearch,
}

/// `$\mathbf{B} \leftarrow \mathbf{B} + \frac{yy^\top}{y^\top s} - \frac{\mathbf{B}ss^\top\mathbf{B}}{s^\top\mathbf{B}s}$`,
/// skipped if `$s^\top y \leq 0$`.
fn update_pseudo_hessian(b: &mut DMatrix<f64>, s: &DVector<f64>, y: &DVector<f64>) -> bool {
    let sy = s.dot(y);
    let bs = &*b * s;
    let sbs = s.dot(&bs);
    if !(sy > 0.0) || !(sbs > 0.0) {
        return false;
    }
    b.ger(1.0 / sy, y, y, 1.0);
    b.ger(-1.0 / sbs, &bs, &bs, 1.0);
    true
}

impl BfgsBDirection {
    /// Point that minimizes the model over the free variables, starting
    /// from the Cauchy point and staying inside the box.
    fn subspace_minimum(
        &self,
        x: &DVector<f64>,
        gradient: &DVector<f64>,
        cauchy: &DVector<f64>,
        free: &[usize],
    ) -> DVector<f64> {
        if free.is_empty() {
            return cauchy.clone();
        }
        // model gradient at the Cauchy point
        let model_gradient = gradient + &self.pseudo_hessian * (cauchy - x);
        let reduced_gradient = model_gradient.select_rows(free.iter());
        let reduced_hessian = self
            .pseudo_hessian
            .select_rows(free.iter())
            .select_columns(free.iter());
        let Some(cholesky) = reduced_hessian.cholesky() else {
            warn!("reduced Hessian is not positive definite, using the Cauchy point");
            return cauchy.clone();
        };
        let reduced_step = -cholesky.solve(&reduced_gradient);
        let mut step = DVector::zeros(x.len());
        for (k, &i) in free.iter().enumerate() {
            step[i] = reduced_step[k];
        }
        let max_step = self.bounds.find_max_step(cauchy, &step).min(1.0);
        cauchy + step * max_step
    }

    fn compute_step(&self, x: &DVector<f64>, gradient: &DVector<f64>) -> Option<Step> {
        let projection = cauchy_point(x, gradient, &self.pseudo_hessian, &self.bounds);
        let free = projection.free_indices();
        let target = self.subspace_minimum(x, gradient, &projection.cauchy_point, &free);

        let feasible = |direction: DVector<f64>| {
            let max_step = self.bounds.find_max_step(x, &direction);
            if max_step > 0.0 && direction.dot(gradient) < 0.0 {
                Some((direction, max_step))
            } else {
                None
            }
        };
        let (direction, max_step) =
            feasible(&target - x).or_else(|| feasible(&projection.cauchy_point - x))?;

        let curvature = direction.dot(&(&self.pseudo_hessian * &direction));
        let initial_step = if curvature > 0.0 {
            (-gradient.dot(&direction) / curvature).max(1.0)
        } else {
            1.0
        };
        Some(Step {
            direction,
            initial_step: initial_step.min(max_step),
            max_step,
        })
    }
}

impl SearchDirection for BfgsBDirection {
    fn line_search(&self) -> WolfeLineSearch {
        self.line_search
    }

    fn bounds(&self) -> Option<&BoxBounds> {
        Some(&self.bounds)
    }

    fn projected_gradient(&self, point: &DVector<f64>, gradient: &DVector<f64>) -> DVector<f64> {
        self.bounds.projected_gradient(point, gradient)
    }

    fn first_step<O>(&mut self, initial: &mut Evaluation<'_, O>) -> Result<Option<Step>>
    where
        O: ObjectiveFunction + ?Sized,
    {
        let gradient = initial.gradient()?.clone();
        Ok(self.compute_step(initial.point(), &gradient))
    }

    fn next_step<O>(
        &mut self,
        previous: &mut Evaluation<'_, O>,
        candidate: &mut Evaluation<'_, O>,
        _stats: &mut LineSearchStats,
    ) -> Result<Option<Step>>
    where
        O: ObjectiveFunction + ?Sized,
    {
        let s = candidate.point() - previous.point();
        let previous_gradient = previous.gradient()?.clone();
        let gradient = candidate.gradient()?.clone();
        update_pseudo_hessian(&mut self.pseudo_hessian, &s, &(&gradient - previous_gradient));
        Ok(self.compute_step(candidate.point(), &gradient))
    }
}
