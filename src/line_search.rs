//! Inexact line search satisfying the Wolfe conditions.
//!
//! Along a descent direction `$\vec{d}$` from `$\vec{x}$` let
//! `$\varphi(t) = f(\vec{x} + t\vec{d})$`. A step `$t$` is accepted when
//! ```math
//!   \varphi(t) \leq \varphi(0) + c_1 t \varphi'(0)
//! ```
//! (sufficient decrease) and
//! ```math
//!   \varphi'(t) \geq c_2 \varphi'(0)
//! ```
//! (curvature). The strong variant replaces the curvature condition by
//! `$|\varphi'(t)| \leq c_2 |\varphi'(0)|$`.
//!
//! The search keeps a bracket `$[t_l, t_u)$` of step lengths, bisecting it
//! when a condition fails and doubling the step while no finite upper end is
//! known.
use nalgebra::DVector;
use tracing::trace;

use crate::criteria::ExitCondition;
use crate::error::{MinimizationError, Result};
use crate::gradient_projection::BoxBounds;
use crate::objective::{Evaluation, ObjectiveFunction};

/// Which curvature condition a step has to satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WolfeCondition {
    Weak,
    Strong,
}

/// Bisection-expansion line search for the (weak or strong) Wolfe conditions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WolfeLineSearch {
    c1: f64,
    c2: f64,
    parameter_tolerance: f64,
    max_iterations: usize,
    condition: WolfeCondition,
}

/// An accepted step.
pub struct LineSearchResult<'a, O: ?Sized> {
    /// The objective evaluated at the accepted point.
    pub evaluation: Evaluation<'a, O>,
    /// Accepted step length.
    pub step: f64,
    /// Number of trial points evaluated.
    pub iterations: usize,
    pub exit_condition: ExitCondition,
}

impl WolfeLineSearch {
    /// Line search for the weak Wolfe conditions.
    ///
    /// # Panics
    ///
    /// Panics unless `$0 < c_1 < c_2 < 1$`, `parameter_tolerance` is
    /// non-negative and `max_iterations` is positive.
    pub fn weak(c1: f64, c2: f64, parameter_tolerance: f64, max_iterations: usize) -> Self {
        Self::new(
            WolfeCondition::Weak,
            c1,
            c2,
            parameter_tolerance,
            max_iterations,
        )
    }

    /// Line search for the strong Wolfe conditions.
    ///
    /// # Panics
    ///
    /// Same preconditions as [`weak`](Self::weak).
    pub fn strong(c1: f64, c2: f64, parameter_tolerance: f64, max_iterations: usize) -> Self {
        Self::new(
            WolfeCondition::Strong,
            c1,
            c2,
            parameter_tolerance,
            max_iterations,
        )
    }

    fn new(
        condition: WolfeCondition,
        c1: f64,
        c2: f64,
        parameter_tolerance: f64,
        max_iterations: usize,
    ) -> Self {
        assert!(
            0.0 < c1 && c1 < c2 && c2 < 1.0,
            "Wolfe constants must satisfy 0 < c1 < c2 < 1"
        );
        assert!(
            parameter_tolerance >= 0.0,
            "parameter_tolerance must be non-negative"
        );
        assert!(max_iterations > 0, "max_iterations must be positive");
        Self {
            c1,
            c2,
            parameter_tolerance,
            max_iterations,
            condition,
        }
    }

    pub fn condition(&self) -> WolfeCondition {
        self.condition
    }

    pub fn c1(&self) -> f64 {
        self.c1
    }

    pub fn c2(&self) -> f64 {
        self.c2
    }

    /// Search for a step along `direction` starting at `start`.
    ///
    /// The first trial is `initial_step`, trial steps never exceed
    /// `upper_bound` (pass `f64::INFINITY` for an unbounded search).
    ///
    /// # Errors
    ///
    /// - `LineSearchFailed` if `direction` is not a descent direction.
    /// - `EvaluationFailed` if a trial value or gradient is not finite.
    /// - `MaximumIterations` if no acceptable step was found in time.
    pub fn find_conforming_step<'a, O>(
        &self,
        start: &mut Evaluation<'a, O>,
        direction: &DVector<f64>,
        initial_step: f64,
        upper_bound: f64,
    ) -> Result<LineSearchResult<'a, O>>
    where
        O: ObjectiveFunction + ?Sized,
    {
        self.search(start, direction, initial_step, upper_bound, None)
    }

    /// Like [`find_conforming_step`](Self::find_conforming_step), but every
    /// trial point is clamped into `bounds`.
    pub fn find_conforming_step_within<'a, O>(
        &self,
        start: &mut Evaluation<'a, O>,
        direction: &DVector<f64>,
        initial_step: f64,
        upper_bound: f64,
        bounds: &BoxBounds,
    ) -> Result<LineSearchResult<'a, O>>
    where
        O: ObjectiveFunction + ?Sized,
    {
        self.search(start, direction, initial_step, upper_bound, Some(bounds))
    }

    fn search<'a, O>(
        &self,
        start: &mut Evaluation<'a, O>,
        direction: &DVector<f64>,
        initial_step: f64,
        upper_bound: f64,
        bounds: Option<&BoxBounds>,
    ) -> Result<LineSearchResult<'a, O>>
    where
        O: ObjectiveFunction + ?Sized,
    {
        if !start.is_gradient_supported() {
            return Err(MinimizationError::IncompatibleObjective {
                capability: "gradient",
            });
        }
        if !(initial_step > 0.0) || !(upper_bound > 0.0) {
            return Err(MinimizationError::invalid_input(format!(
                "line search needs positive steps, got initial step {initial_step} and upper bound {upper_bound}"
            )));
        }

        let initial_value = start.value()?;
        let initial_slope = direction.dot(start.gradient()?);
        if !initial_value.is_finite() || !initial_slope.is_finite() {
            return Err(MinimizationError::evaluation_failed(
                "non-finite value or slope at the start of the line search",
                start.point(),
                Some(initial_value),
            ));
        }
        if initial_slope >= 0.0 {
            return Err(MinimizationError::line_search_failed(
                "search direction is not a descent direction",
                0,
                initial_step,
            ));
        }

        let mut lower = 0.0;
        let mut upper = upper_bound;
        let mut step = initial_step.min(upper_bound);
        // last trial that satisfied sufficient decrease
        let mut best: Option<Evaluation<'a, O>> = None;
        let mut trial = start.at(start.point().clone());

        for iteration in 0..self.max_iterations {
            let mut point = start.point() + direction * step;
            if let Some(bounds) = bounds {
                point = bounds.clamp(&point);
            }
            trial.evaluate_at(point);
            let value = trial.value()?;
            let slope = direction.dot(trial.gradient()?);
            if !value.is_finite() || !slope.is_finite() {
                return Err(MinimizationError::evaluation_failed(
                    "non-finite value or slope during line search",
                    trial.point(),
                    Some(value),
                ));
            }
            trace!(
                "line search trial {}: step {:e}, value {:e}, slope {:e}",
                iteration,
                step,
                value,
                slope
            );

            if value > initial_value + self.c1 * step * initial_slope {
                upper = step;
            } else if slope < self.c2 * initial_slope {
                lower = step;
                best = Some(trial.fork());
            } else if self.condition == WolfeCondition::Strong
                && slope > self.c2 * initial_slope.abs()
            {
                upper = step;
            } else {
                let exit_condition = match self.condition {
                    WolfeCondition::Weak => ExitCondition::WeakWolfeCriteria,
                    WolfeCondition::Strong => ExitCondition::StrongWolfeCriteria,
                };
                return Ok(LineSearchResult {
                    evaluation: trial,
                    step,
                    iterations: iteration + 1,
                    exit_condition,
                });
            }

            if upper.is_finite() {
                let width = upper - lower;
                let max_relative_change = direction
                    .iter()
                    .zip(trial.point().iter())
                    .map(|(d, x)| (d * width).abs() / x.abs().max(1.0))
                    .fold(0.0, f64::max);
                if max_relative_change < self.parameter_tolerance {
                    return Ok(LineSearchResult {
                        evaluation: best.unwrap_or_else(|| start.fork()),
                        step: lower,
                        iterations: iteration + 1,
                        exit_condition: ExitCondition::LackOfProgress,
                    });
                }
                step = 0.5 * (lower + upper);
            } else {
                step = 2.0 * lower;
            }
        }

        Err(MinimizationError::MaximumIterations {
            max_iterations: self.max_iterations,
            detail: if upper.is_infinite() {
                Some("function appears to be unbounded in the search direction")
            } else {
                None
            },
        })
    }
}
