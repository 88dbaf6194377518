//! The iteration loop shared by the line-search minimizers.
//!
//! A minimizer only decides *where* to search. The driver evaluates the
//! initial point, runs the line search along every proposed direction,
//! validates the new point and checks the [`ExitCriteria`].
use nalgebra::DVector;
use tracing::{debug, Level};

use crate::criteria::{ExitCondition, ExitCriteria, Snapshot};
use crate::error::{MinimizationError, Result};
use crate::gradient_projection::BoxBounds;
use crate::line_search::WolfeLineSearch;
use crate::objective::{validate_value_and_gradient, Evaluation, ObjectiveFunction};
use crate::result::{LineSearchStats, MinimizationResult};

/// A proposed line search.
#[derive(Debug, Clone)]
pub(crate) struct Step {
    pub direction: DVector<f64>,
    /// First trial step length.
    pub initial_step: f64,
    /// Largest admissible step length, `f64::INFINITY` if unbounded.
    pub max_step: f64,
}

impl Step {
    pub fn unbounded(direction: DVector<f64>, initial_step: f64) -> Self {
        Self {
            direction,
            initial_step,
            max_step: f64::INFINITY,
        }
    }
}

/// Strategy that turns the state of a minimization into search directions.
///
/// Returning `Ok(None)` means no admissible direction exists and the
/// minimization stops with [`ExitCondition::LackOfProgress`].
pub(crate) trait SearchDirection {
    fn line_search(&self) -> WolfeLineSearch;

    /// Box that every trial point is clamped into.
    fn bounds(&self) -> Option<&BoxBounds> {
        None
    }

    /// The gradient the exit criteria look at.
    fn projected_gradient(&self, _point: &DVector<f64>, gradient: &DVector<f64>) -> DVector<f64> {
        gradient.clone()
    }

    fn first_step<O>(&mut self, initial: &mut Evaluation<'_, O>) -> Result<Option<Step>>
    where
        O: ObjectiveFunction + ?Sized;

    /// Update the internal state with the accepted move from `previous` to
    /// `candidate` and propose the next step from `candidate`.
    fn next_step<O>(
        &mut self,
        previous: &mut Evaluation<'_, O>,
        candidate: &mut Evaluation<'_, O>,
        stats: &mut LineSearchStats,
    ) -> Result<Option<Step>>
    where
        O: ObjectiveFunction + ?Sized;
}

/// Initial step length for a steepest-descent direction.
pub(crate) fn steepest_descent_step(gradient: &DVector<f64>) -> f64 {
    let norm = gradient.norm();
    if norm > 1.0 {
        1.0 / norm
    } else {
        1.0
    }
}

/// Run a line-search minimizer to completion.
pub(crate) fn drive<O, S>(
    objective: &O,
    initial: &DVector<f64>,
    criteria: &ExitCriteria,
    maximum_iterations: usize,
    strategy: &mut S,
) -> Result<MinimizationResult>
where
    O: ObjectiveFunction + ?Sized,
    S: SearchDirection,
{
    if !objective.is_gradient_supported() {
        return Err(MinimizationError::IncompatibleObjective {
            capability: "gradient",
        });
    }
    if let Some(bounds) = strategy.bounds() {
        if bounds.len() != initial.len() || !bounds.contains(initial) {
            return Err(MinimizationError::invalid_input(
                "initial guess is not inside the bounds",
            ));
        }
    }

    let mut stats = LineSearchStats::default();
    let mut current = Evaluation::new(objective, initial.clone());
    validate_value_and_gradient(&mut current)?;
    if let Some(exit_condition) = check_exit(criteria, strategy, &mut current, None, 0)? {
        return finish(current, 0, exit_condition, Some(stats));
    }

    let mut step = strategy.first_step(&mut current)?;
    for iteration in 1..=maximum_iterations {
        let Some(proposal) = step else {
            return finish(
                current,
                iteration - 1,
                ExitCondition::LackOfProgress,
                Some(stats),
            );
        };

        let search = strategy.line_search();
        let outcome = match strategy.bounds() {
            Some(bounds) => search.find_conforming_step_within(
                &mut current,
                &proposal.direction,
                proposal.initial_step,
                proposal.max_step,
                bounds,
            ),
            None => search.find_conforming_step(
                &mut current,
                &proposal.direction,
                proposal.initial_step,
                proposal.max_step,
            ),
        }
        .map_err(|err| MinimizationError::inner("Line search failed", err))?;
        stats.total_steps += outcome.iterations;
        if outcome.iterations > 1 {
            stats.iterations_with_nontrivial_search += 1;
        }

        let mut candidate = outcome.evaluation;
        validate_value_and_gradient(&mut candidate)?;
        if tracing::enabled!(Level::DEBUG) {
            let value = candidate.value()?;
            let gradient_norm = candidate.gradient()?.norm();
            debug!(
                iteration,
                value,
                step = outcome.step,
                gradient_norm,
                "accepted step"
            );
        }
        if let Some(exit_condition) =
            check_exit(criteria, strategy, &mut candidate, Some(&mut current), iteration)?
        {
            return finish(candidate, iteration, exit_condition, Some(stats));
        }

        step = strategy.next_step(&mut current, &mut candidate, &mut stats)?;
        current = candidate;
    }

    Err(MinimizationError::maximum_iterations(maximum_iterations))
}

/// Evaluate the exit criteria for `candidate`, compared against `previous`.
pub(crate) fn check_exit<O, S>(
    criteria: &ExitCriteria,
    strategy: &S,
    candidate: &mut Evaluation<'_, O>,
    previous: Option<&mut Evaluation<'_, O>>,
    iterations: usize,
) -> Result<Option<ExitCondition>>
where
    O: ObjectiveFunction + ?Sized,
    S: SearchDirection,
{
    let value = candidate.value()?;
    let gradient = candidate.gradient()?.clone();
    let projected = strategy.projected_gradient(candidate.point(), &gradient);
    let snapshot = Snapshot {
        point: candidate.point(),
        value,
        gradient: &projected,
    };
    match previous {
        Some(previous) => {
            let previous_value = previous.value()?;
            let previous_gradient = previous.gradient()?.clone();
            let previous_snapshot = Snapshot {
                point: previous.point(),
                value: previous_value,
                gradient: &previous_gradient,
            };
            Ok(criteria.check(&snapshot, Some(&previous_snapshot), iterations))
        }
        None => Ok(criteria.check(&snapshot, None, iterations)),
    }
}

/// Package the final evaluation.
pub(crate) fn finish<O>(
    mut evaluation: Evaluation<'_, O>,
    iterations: usize,
    exit_condition: ExitCondition,
    line_search: Option<LineSearchStats>,
) -> Result<MinimizationResult>
where
    O: ObjectiveFunction + ?Sized,
{
    let value = evaluation.value()?;
    let gradient = if evaluation.is_gradient_supported() {
        Some(evaluation.gradient()?.clone())
    } else {
        None
    };
    debug!(
        "finished after {} iterations with {:?}, value {:e}",
        iterations, exit_condition, value
    );
    Ok(MinimizationResult {
        minimizing_point: evaluation.point().clone(),
        value,
        gradient,
        iterations,
        exit_condition,
        line_search,
    })
}
