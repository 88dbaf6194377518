//! Exit conditions shared by the gradient based minimizers.
use nalgebra::DVector;

/// Why a minimizer (or a line search) stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitCondition {
    /// A residual sum of squares or trial value was `NaN` or infinite.
    InvalidValues,
    /// A least squares minimizer ran out of iterations or evaluations.
    ExceedIterations,
    /// The step became small relative to the current point.
    RelativePoints,
    /// The scaled gradient fell below the gradient tolerance.
    RelativeGradient,
    /// Successive points stopped moving.
    LackOfProgress,
    /// The gradient norm fell below the gradient tolerance.
    AbsoluteGradient,
    /// The weak Wolfe conditions hold at the accepted step.
    WeakWolfeCriteria,
    /// A bracketing search narrowed its bracket below tolerance.
    BoundTolerance,
    /// The strong Wolfe conditions hold at the accepted step.
    StrongWolfeCriteria,
    /// The function value stopped decreasing in a long run.
    LackOfFunctionImprovement,
    /// Stopped on request before iterating.
    ManuallyStopped,
    /// The residuals (or the function value spread) became small.
    Converged,
}

/// Iteration count after which [`ExitCondition::LackOfFunctionImprovement`] is considered.
const FUNCTION_PROGRESS_WARMUP: usize = 500;

/// Tolerances of the gradient based minimizers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitCriteria {
    pub gradient_tolerance: f64,
    pub parameter_tolerance: f64,
    pub function_progress_tolerance: f64,
}

/// The parts of an evaluation that the exit tests look at.
pub(crate) struct Snapshot<'a> {
    pub point: &'a DVector<f64>,
    pub value: f64,
    /// Gradient, already projected onto the feasible set if there is one.
    pub gradient: &'a DVector<f64>,
}

impl ExitCriteria {
    pub fn new(
        gradient_tolerance: f64,
        parameter_tolerance: f64,
        function_progress_tolerance: f64,
    ) -> Self {
        Self {
            gradient_tolerance,
            parameter_tolerance,
            function_progress_tolerance,
        }
    }

    /// Returns the first exit condition that fires, in priority order.
    ///
    /// `previous` is `None` before the first step, in which case only the
    /// gradient test applies.
    pub(crate) fn check(
        &self,
        candidate: &Snapshot<'_>,
        previous: Option<&Snapshot<'_>>,
        iterations: usize,
    ) -> Option<ExitCondition> {
        if relative_gradient(candidate) < self.gradient_tolerance {
            return Some(ExitCondition::RelativeGradient);
        }

        let previous = previous?;
        if relative_change(candidate.point, previous.point) < self.parameter_tolerance {
            return Some(ExitCondition::LackOfProgress);
        }

        let function_change = candidate.value - previous.value;
        if iterations > FUNCTION_PROGRESS_WARMUP
            && function_change < 0.0
            && function_change.abs() < self.function_progress_tolerance
        {
            return Some(ExitCondition::LackOfFunctionImprovement);
        }
        None
    }
}

/// `$\max_i |g_i|\max(|x_i|,1)/\max(|f|,1)$`
pub(crate) fn relative_gradient(candidate: &Snapshot<'_>) -> f64 {
    let normalizer = candidate.value.abs().max(1.0);
    candidate
        .gradient
        .iter()
        .zip(candidate.point.iter())
        .map(|(g, x)| (g * x.abs().max(1.0) / normalizer).abs())
        .fold(0.0, f64::max)
}

/// `$\max_i |x_i - y_i|/\max(|y_i|,1)$`
pub(crate) fn relative_change(x: &DVector<f64>, reference: &DVector<f64>) -> f64 {
    x.iter()
        .zip(reference.iter())
        .map(|(x, y)| (x - y).abs() / y.abs().max(1.0))
        .fold(0.0, f64::max)
}
