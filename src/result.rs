//! Results returned by the minimizers.
use nalgebra::{DMatrix, DVector};

use crate::criteria::ExitCondition;

/// Diagnostics of the line searches performed during a minimization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineSearchStats {
    /// Trial steps evaluated over all line searches.
    pub total_steps: usize,
    /// Iterations whose line search needed more than the initial trial.
    pub iterations_with_nontrivial_search: usize,
    /// How often the quasi-Newton direction was replaced by steepest descent.
    pub steepest_descent_resets: usize,
}

/// Outcome of a successful vector minimization.
#[derive(Debug, Clone)]
pub struct MinimizationResult {
    pub minimizing_point: DVector<f64>,
    /// Objective value at `minimizing_point`.
    pub value: f64,
    /// Gradient at `minimizing_point`, if the objective provides one.
    pub gradient: Option<DVector<f64>>,
    pub iterations: usize,
    pub exit_condition: ExitCondition,
    /// Present for minimizers driven by a line search.
    pub line_search: Option<LineSearchStats>,
}

/// Outcome of a successful scalar minimization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalarMinimizationResult {
    pub minimizing_point: f64,
    pub value: f64,
    pub iterations: usize,
    pub exit_condition: ExitCondition,
}

/// Outcome of a nonlinear least-squares fit.
///
/// The statistics are computed at the returned point from the Gauss-Newton
/// Hessian `$\mathbf{J}^\top\mathbf{W}\mathbf{J}$` of the external
/// parameters: the covariance is its pseudo-inverse scaled by the reduced
/// residual sum of squares.
#[derive(Debug, Clone)]
pub struct NonlinearMinimizationResult {
    /// Best-fit parameters in the caller's coordinates.
    pub minimizing_point: DVector<f64>,
    /// Weighted residual sum of squares at `minimizing_point`.
    pub value: f64,
    /// Model predictions at `minimizing_point`.
    pub minimized_values: DVector<f64>,
    /// `None` if the covariance could not be computed.
    pub covariance: Option<DMatrix<f64>>,
    pub correlation: Option<DMatrix<f64>>,
    pub standard_errors: Option<DVector<f64>>,
    /// Observations minus free parameters.
    pub degrees_of_freedom: usize,
    pub iterations: usize,
    pub exit_condition: ExitCondition,
}
