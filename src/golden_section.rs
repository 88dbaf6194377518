//! Golden section search on a bounded interval.
use tracing::debug;

use crate::brent::evaluate;
use crate::criteria::ExitCondition;
use crate::error::{MinimizationError, Result};
use crate::result::ScalarMinimizationResult;

/// The golden ratio.
const GOLDEN_RATIO: f64 = 1.618_033_988_749_895;

/// Scalar minimizer narrowing a bracket at the golden section.
///
/// If the interval does not contain a valley, i.e. one of the bounds is below
/// the interior point, the interval is first widened on the side of the lower
/// function value by the expansion factors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GoldenSectionMinimizer {
    x_tolerance: f64,
    maximum_iterations: usize,
    maximum_expansion_steps: usize,
    lower_expansion_factor: f64,
    upper_expansion_factor: f64,
}

impl Default for GoldenSectionMinimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl GoldenSectionMinimizer {
    pub fn new() -> Self {
        Self {
            x_tolerance: 1e-5,
            maximum_iterations: 1000,
            maximum_expansion_steps: 10,
            lower_expansion_factor: 2.0,
            upper_expansion_factor: 2.0,
        }
    }

    /// Set the width of the final bracket.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{x\_tolerance} \leq 0$`.
    pub fn with_x_tolerance(self, x_tolerance: f64) -> Self {
        assert!(x_tolerance > 0.0, "x_tolerance must be > 0");
        Self {
            x_tolerance,
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

    /// Set how often the interval may be widened before giving up.
    pub fn with_maximum_expansion_steps(self, maximum_expansion_steps: usize) -> Self {
        Self {
            maximum_expansion_steps,
            ..self
        }
    }

    /// Set the factors by which the interval grows on either side.
    ///
    /// An expansion towards the lower bound replaces it with
    /// `$m - \mathtt{lower}\cdot\frac{1}{2}(u - l)$` where `$m$` is the center.
    ///
    /// # Panics
    ///
    /// Panics if a factor is not `$> 1$`.
    pub fn with_expansion_factors(self, lower: f64, upper: f64) -> Self {
        assert!(
            lower > 1.0 && upper > 1.0,
            "expansion factors must be > 1"
        );
        Self {
            lower_expansion_factor: lower,
            upper_expansion_factor: upper,
            ..self
        }
    }

    /// Minimize `f` on `[lower, upper]`.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if `$\mathtt{lower} \geq \mathtt{upper}$`.
    /// - `InvalidBracket` if no valley is found within the expansion steps.
    /// - `EvaluationFailed` if `f` is not finite at a trial point.
    /// - `MaximumIterations` if the bracket does not shrink in time.
    pub fn find_minimum<F>(&self, f: F, lower: f64, upper: f64) -> Result<ScalarMinimizationResult>
    where
        F: Fn(f64) -> f64,
    {
        if !(lower < upper) {
            return Err(MinimizationError::invalid_input(format!(
                "lower bound {lower} must be below upper bound {upper}"
            )));
        }
        let (mut lower, mut upper) = (lower, upper);
        let interior = |lower: f64, upper: f64| lower + (upper - lower) / (1.0 + GOLDEN_RATIO);

        let mut middle = interior(lower, upper);
        let mut f_lower = evaluate(&f, lower)?;
        let mut f_middle = evaluate(&f, middle)?;
        let mut f_upper = evaluate(&f, upper)?;

        let mut expansion_steps = 0;
        while (f_upper < f_middle || f_lower < f_middle)
            && expansion_steps < self.maximum_expansion_steps
        {
            let center = 0.5 * (upper + lower);
            let half_width = 0.5 * (upper - lower);
            if f_lower < f_middle {
                lower = center - self.lower_expansion_factor * half_width;
                f_lower = evaluate(&f, lower)?;
            } else {
                upper = center + self.upper_expansion_factor * half_width;
                f_upper = evaluate(&f, upper)?;
            }
            middle = interior(lower, upper);
            f_middle = evaluate(&f, middle)?;
            expansion_steps += 1;
            debug!("expanded interval to [{lower}, {upper}]");
        }
        if f_upper < f_middle || f_lower < f_middle {
            return Err(MinimizationError::invalid_bracket(format!(
                "[{lower}, {upper}] does not bound a minimum after {expansion_steps} expansion steps"
            )));
        }

        let mut iterations = 0;
        while upper - lower > self.x_tolerance {
            if iterations == self.maximum_iterations {
                return Err(MinimizationError::maximum_iterations(self.maximum_iterations));
            }
            // mirror the interior point in the bracket
            let test = lower + (upper - middle);
            let f_test = evaluate(&f, test)?;
            if test < middle {
                if f_test > f_middle {
                    lower = test;
                } else {
                    upper = middle;
                    middle = test;
                    f_middle = f_test;
                }
            } else if f_test > f_middle {
                upper = test;
            } else {
                lower = middle;
                middle = test;
                f_middle = f_test;
            }
            iterations += 1;
        }

        Ok(ScalarMinimizationResult {
            minimizing_point: middle,
            value: f_middle,
            iterations,
            exit_condition: ExitCondition::BoundTolerance,
        })
    }
}
