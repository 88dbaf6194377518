//! Error types shared by all minimizers.
use nalgebra::DVector;
use thiserror::Error;

/// Errors that abort a minimization.
///
/// Normal termination is never reported through this type. A run that stops
/// because a convergence test fired returns a result carrying an
/// [`ExitCondition`](crate::ExitCondition) instead.
#[derive(Debug, Clone, Error)]
pub enum MinimizationError {
    /// The objective lacks a capability the minimizer needs.
    #[error("Objective does not support the {capability}")]
    IncompatibleObjective {
        /// Either `"gradient"` or `"Hessian"`
        capability: &'static str,
    },

    /// A user function produced no value or a non-finite value.
    ///
    /// The point and, when available, the value of the offending evaluation
    /// are attached for diagnostics.
    #[error("Evaluation failed: {reason}")]
    EvaluationFailed {
        /// What went wrong
        reason: String,
        /// Point at which the objective was evaluated
        point: DVector<f64>,
        /// Objective value at `point`, if it could be computed
        value: Option<f64>,
    },

    /// A nested search (line search, subproblem) failed.
    #[error("{context}")]
    InnerOptimization {
        /// Which nested search failed
        context: &'static str,
        /// The error raised by the nested search
        #[source]
        source: Box<MinimizationError>,
    },

    /// The line search could not produce an acceptable step.
    #[error("Line search failed: {reason}")]
    LineSearchFailed {
        /// Description of why the line search failed
        reason: String,
        /// Number of trial steps evaluated
        iterations: usize,
        /// Last trial step
        last_step: f64,
    },

    /// The iteration budget was exhausted without meeting any convergence test.
    #[error("Maximum iterations ({max_iterations}) reached")]
    MaximumIterations {
        /// The iteration budget
        max_iterations: usize,
        /// Extra context, e.g. that the function looks unbounded
        detail: Option<&'static str>,
    },

    /// The function evaluation budget was exhausted.
    #[error("Maximum function evaluations ({max_evaluations}) reached")]
    MaximumEvaluations {
        /// The evaluation budget
        max_evaluations: usize,
    },

    /// The quasi-Newton direction does not point downhill.
    #[error("Search direction is not a descent direction")]
    NonDescentDirection,

    /// The arguments passed to a minimizer are inconsistent.
    #[error("Invalid input: {reason}")]
    InvalidInput {
        /// Description of the problem
        reason: String,
    },

    /// A scalar search could not enclose a minimum.
    #[error("Invalid bracket: {reason}")]
    InvalidBracket {
        /// Description of the problem
        reason: String,
    },
}

impl MinimizationError {
    /// Create an `EvaluationFailed` error.
    pub fn evaluation_failed<S: Into<String>>(
        reason: S,
        point: &DVector<f64>,
        value: Option<f64>,
    ) -> Self {
        Self::EvaluationFailed {
            reason: reason.into(),
            point: point.clone(),
            value,
        }
    }

    /// Wrap an error raised by a nested search.
    pub fn inner(context: &'static str, source: MinimizationError) -> Self {
        Self::InnerOptimization {
            context,
            source: Box::new(source),
        }
    }

    /// Create a `LineSearchFailed` error.
    pub fn line_search_failed<S: Into<String>>(
        reason: S,
        iterations: usize,
        last_step: f64,
    ) -> Self {
        Self::LineSearchFailed {
            reason: reason.into(),
            iterations,
            last_step,
        }
    }

    /// Create a `MaximumIterations` error.
    pub fn maximum_iterations(max_iterations: usize) -> Self {
        Self::MaximumIterations {
            max_iterations,
            detail: None,
        }
    }

    /// Create a `MaximumEvaluations` error.
    pub fn maximum_evaluations(max_evaluations: usize) -> Self {
        Self::MaximumEvaluations { max_evaluations }
    }

    /// Create an `InvalidInput` error.
    pub fn invalid_input<S: Into<String>>(reason: S) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    /// Create an `InvalidBracket` error.
    pub fn invalid_bracket<S: Into<String>>(reason: S) -> Self {
        Self::InvalidBracket {
            reason: reason.into(),
        }
    }

    /// Whether this error, or an error it wraps, is an exhausted budget.
    pub fn is_budget_exhausted(&self) -> bool {
        match self {
            Self::MaximumIterations { .. } | Self::MaximumEvaluations { .. } => true,
            Self::InnerOptimization { source, .. } => source.is_budget_exhausted(),
            _ => false,
        }
    }
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, MinimizationError>;
