//! Powell's direction set method.
use std::cell::Cell;

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::brent::BrentMinimizer;
use crate::criteria::ExitCondition;
use crate::error::{MinimizationError, Result};
use crate::objective::ObjectiveFunction;
use crate::result::MinimizationResult;

const TINY: f64 = 1e-25;

/// Derivative-free minimizer running line minimizations along a set of
/// directions that adapts to the valleys of the objective.
///
/// Each iteration minimizes along all `$n$` directions in turn with
/// [`BrentMinimizer`]. The net displacement of the cycle then replaces the
/// direction of largest decrease, unless extrapolating along it does not
/// promise a further decrease or would make the set nearly linearly
/// dependent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowellMinimizer {
    function_tolerance: f64,
    maximum_iterations: usize,
    maximum_evaluations: usize,
    line_search: BrentMinimizer,
}

impl Default for PowellMinimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl PowellMinimizer {
    pub fn new() -> Self {
        Self {
            function_tolerance: 1e-8,
            maximum_iterations: 1000,
            maximum_evaluations: 100_000,
            line_search: BrentMinimizer::new(),
        }
    }

    /// Set the relative decrease of one iteration below which the search stops.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{function\_tolerance} \leq 0$`.
    pub fn with_function_tolerance(self, function_tolerance: f64) -> Self {
        assert!(function_tolerance > 0.0, "function_tolerance must be > 0");
        Self {
            function_tolerance,
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

    /// # Panics
    ///
    /// Panics if `$\mathtt{maximum\_evaluations} = 0$`.
    pub fn with_maximum_evaluations(self, maximum_evaluations: usize) -> Self {
        assert!(maximum_evaluations > 0, "maximum_evaluations must be > 0");
        Self {
            maximum_evaluations,
            ..self
        }
    }

    /// Use a differently configured scalar minimizer along the directions.
    pub fn with_line_search(self, line_search: BrentMinimizer) -> Self {
        Self {
            line_search,
            ..self
        }
    }

    /// Minimize starting from `initial_guess` with the unit vectors as
    /// initial directions.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if the initial guess is empty.
    /// - `EvaluationFailed` if the objective is not finite at a trial point.
    /// - `InnerOptimization` if a line minimization fails.
    /// - `MaximumIterations` or `MaximumEvaluations` when a budget runs out.
    pub fn find_minimum<O>(
        &self,
        objective: &O,
        initial_guess: &DVector<f64>,
    ) -> Result<MinimizationResult>
    where
        O: ObjectiveFunction + ?Sized,
    {
        let n = initial_guess.len();
        if n == 0 {
            return Err(MinimizationError::invalid_input("initial guess is empty"));
        }
        let search = Search {
            objective,
            evaluations: Cell::new(0),
            maximum_evaluations: self.maximum_evaluations,
            line_search: self.line_search,
        };

        let mut directions = DMatrix::identity(n, n);
        let mut point = initial_guess.clone();
        let mut value = search.evaluate(&point)?;

        for iteration in 0..self.maximum_iterations {
            let start = point.clone();
            let start_value = value;
            let mut largest_decrease = 0.0;
            let mut largest_index = 0;
            for i in 0..n {
                let direction = directions.column(i).into_owned();
                let previous = value;
                value = search.line_minimize(&mut point, &direction, value)?;
                if previous - value > largest_decrease {
                    largest_decrease = previous - value;
                    largest_index = i;
                }
            }
            debug!("Powell iteration {iteration}: value {value}");

            if 2.0 * (start_value - value)
                <= self.function_tolerance * (start_value.abs() + value.abs()) + TINY
            {
                return Ok(MinimizationResult {
                    minimizing_point: point,
                    value,
                    gradient: None,
                    iterations: iteration + 1,
                    exit_condition: ExitCondition::Converged,
                    line_search: None,
                });
            }

            let displacement = &point - &start;
            let extrapolated = &point + &displacement;
            let extrapolated_value = search.evaluate(&extrapolated)?;
            if extrapolated_value < start_value {
                let t = 2.0
                    * (start_value - 2.0 * value + extrapolated_value)
                    * (start_value - value - largest_decrease).powi(2)
                    - largest_decrease * (start_value - extrapolated_value).powi(2);
                if t < 0.0 {
                    value = search.line_minimize(&mut point, &displacement, value)?;
                    // the last direction takes the place of the best one
                    let last = directions.column(n - 1).into_owned();
                    directions.set_column(largest_index, &last);
                    directions.set_column(n - 1, &displacement);
                }
            }
        }
        Err(MinimizationError::maximum_iterations(self.maximum_iterations))
    }
}

struct Search<'a, O: ?Sized> {
    objective: &'a O,
    evaluations: Cell<usize>,
    maximum_evaluations: usize,
    line_search: BrentMinimizer,
}

impl<O: ObjectiveFunction + ?Sized> Search<'_, O> {
    fn evaluate(&self, point: &DVector<f64>) -> Result<f64> {
        let evaluations = self.evaluations.get();
        if evaluations == self.maximum_evaluations {
            return Err(MinimizationError::maximum_evaluations(self.maximum_evaluations));
        }
        self.evaluations.set(evaluations + 1);
        match self.objective.value(point) {
            Some(value) if value.is_finite() => Ok(value),
            value => Err(MinimizationError::evaluation_failed(
                "objective value not finite",
                point,
                value,
            )),
        }
    }

    /// Move `point` to the minimum along `direction` and return its value.
    fn line_minimize(
        &self,
        point: &mut DVector<f64>,
        direction: &DVector<f64>,
        value: f64,
    ) -> Result<f64> {
        // the first failure along the line, reported instead of the
        // scalar search's own error
        let failure = Cell::new(None);
        let along = |t: f64| {
            let trial = &*point + direction * t;
            match self.evaluate(&trial) {
                Ok(value) => value,
                Err(err) => {
                    let first = failure.take();
                    failure.set(first.or(Some(err)));
                    f64::NAN
                }
            }
        };
        let result = self.line_search.find_minimum(along, 0.0, 1.0);
        if let Some(err) = failure.into_inner() {
            return Err(err);
        }
        let result = result.map_err(|e| MinimizationError::inner("line minimization", e))?;
        if result.value > value {
            // never accept a worse point than the start of the line
            return Ok(value);
        }
        point.axpy(result.minimizing_point, direction, 1.0);
        Ok(result.value)
    }
}
