//! Limited-memory BFGS.
use std::collections::VecDeque;

use nalgebra::DVector;

use crate::criteria::ExitCriteria;
use crate::error::{MinimizationError, Result};
use crate::line_search::WolfeLineSearch;
use crate::objective::{Evaluation, ObjectiveFunction};
use crate::quasi_newton::{drive, steepest_descent_step, SearchDirection, Step};
use crate::result::{LineSearchStats, MinimizationResult};

/// Quasi-Newton minimizer that never materializes the inverse Hessian.
///
/// The direction is computed by the two-loop recursion from the last
/// `memory` pairs of steps `$s_k$` and gradient changes `$y_k$`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LbfgsMinimizer {
    gradient_tolerance: f64,
    parameter_tolerance: f64,
    function_progress_tolerance: f64,
    maximum_iterations: usize,
    memory: usize,
}

impl Default for LbfgsMinimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl LbfgsMinimizer {
    pub fn new() -> Self {
        Self {
            gradient_tolerance: 1e-8,
            parameter_tolerance: 1e-8,
            function_progress_tolerance: 1e-8,
            maximum_iterations: 1000,
            memory: 5,
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

    /// Set how many correction pairs are kept.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{memory} = 0$`.
    pub fn with_memory(self, memory: usize) -> Self {
        assert!(memory > 0, "memory must be > 0");
        Self { memory, ..self }
    }

    /// Minimize `objective` starting from `initial_guess`.
    ///
    /// # Errors
    ///
    /// Same as [`BfgsMinimizer::find_minimum`](crate::BfgsMinimizer::find_minimum),
    /// plus `NonDescentDirection` if the two-loop recursion yields a
    /// direction along which `$f$` does not decrease.
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
        let mut direction = LbfgsDirection {
            history: VecDeque::with_capacity(self.memory),
            memory: self.memory,
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

/// One correction pair with `$\rho = 1/(y^\top s)$`.
struct Correction {
    s: DVector<f64>,
    y: DVector<f64>,
    rho: f64,
}

struct LbfgsDirection {
    history: VecDeque<Correction>,
    memory: usize,
    line_search: WolfeLineSearch,
}

impl LbfgsDirection {
    fn remember(&mut self, s: DVector<f64>, y: DVector<f64>) {
        let sy = s.dot(&y);
        if !(sy > 0.0) {
            return;
        }
        if self.history.len() == self.memory {
            self.history.pop_front();
        }
        self.history.push_back(Correction { s, y, rho: 1.0 / sy });
    }

    /// `$-\mathbf{H}\nabla f$` by the two-loop recursion.
    fn direction(&self, gradient: &DVector<f64>) -> DVector<f64> {
        let mut q = gradient.clone();
        let mut alphas = Vec::with_capacity(self.history.len());
        for correction in self.history.iter().rev() {
            let alpha = correction.rho * correction.s.dot(&q);
            q.axpy(-alpha, &correction.y, 1.0);
            alphas.push(alpha);
        }
        if let Some(last) = self.history.back() {
            q *= last.s.dot(&last.y) / last.y.norm_squared();
        }
        for (correction, alpha) in self.history.iter().zip(alphas.iter().rev()) {
            let beta = correction.rho * correction.y.dot(&q);
            q.axpy(alpha - beta, &correction.s, 1.0);
        }
        -q
    }
}

impl SearchDirection for LbfgsDirection {
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
        _stats: &mut LineSearchStats,
    ) -> Result<Option<Step>>
    where
        O: ObjectiveFunction + ?Sized,
    {
        let s = candidate.point() - previous.point();
        let previous_gradient = previous.gradient()?.clone();
        let gradient = candidate.gradient()?;
        self.remember(s, gradient - previous_gradient);

        let direction = self.direction(gradient);
        if direction.dot(gradient) >= 0.0 {
            return Err(MinimizationError::NonDescentDirection);
        }
        if self.history.is_empty() {
            let initial_step = steepest_descent_step(gradient);
            return Ok(Some(Step::unbounded(direction, initial_step)));
        }
        Ok(Some(Step::unbounded(direction, 1.0)))
    }
}
