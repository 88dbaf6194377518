//! Nonlinear minimization using [nalgebra](https://nalgebra.org).
//!
//! The crate solves unconstrained and box-constrained problems
//! ```math
//! \min_{\vec{x}\in\R^n} f(\vec{x})\quad\text{subject to}\quad \vec{l} \leq \vec{x} \leq \vec{u},
//! ```
//! and weighted nonlinear least-squares fits of a model `$\vec{y}(\vec{p})$`
//! to observations `$\vec{y}^\mathrm{obs}$`
//! ```math
//! \min_{\vec{p}\in\R^n} F(\vec{p}) \coloneqq \sum_{i=1}^m w_i\bigl(y_i^\mathrm{obs} - y_i(\vec{p})\bigr)^2.
//! ```
//!
//! # Minimizers
//!
//! | minimizer | needs | problem |
//! | --- | --- | --- |
//! | [`BfgsMinimizer`], [`LbfgsMinimizer`] | gradient | unconstrained |
//! | [`BfgsBMinimizer`] | gradient | box constraints |
//! | [`NewtonMinimizer`] | gradient, Hessian | unconstrained |
//! | [`LevenbergMarquardtMinimizer`], [`TrustRegionMinimizer`] | model values, optionally its Jacobian | least squares, bounds, fixed parameters |
//! | [`NelderMeadSimplex`], [`PowellMinimizer`] | values | unconstrained |
//! | [`BrentMinimizer`], [`GoldenSectionMinimizer`] | values | scalar |
//! | [`MpFit`] | residuals, optionally the Jacobian | least squares with limits, MINPACK conventions |
//!
//! Every minimizer is configured with consuming `with_*` methods and started
//! with `find_minimum` (or [`MpFit::fit`]). Runs that stop because a
//! convergence test fired return a result with an [`ExitCondition`]. Failures,
//! including exhausted iteration budgets of the gradient-based minimizers, are
//! reported as [`MinimizationError`].
//!
//! # Objectives
//!
//! Scalar objectives implement [`ObjectiveFunction`], or are built from
//! closures with [`objective::value`], [`objective::gradient`] and
//! [`objective::hessian`]. Least-squares problems implement
//! [`ModelFunction`] and are wrapped with their observations in an
//! [`ObjectiveModel`].
//!
//! # Usage Example
//!
//! We use `$f(x, y) \coloneqq (1 - x)^2 + 100(y - x^2)^2$`, the
//! [Rosenbrock function](https://en.wikipedia.org/wiki/Rosenbrock_function).
//!
//! ```
//! use nalgebra::DVector;
//! use numopt::{objective, BfgsMinimizer, ExitCondition};
//!
//! let rosenbrock = objective::gradient(
//!     |p: &DVector<f64>| (1.0 - p[0]).powi(2) + 100.0 * (p[1] - p[0] * p[0]).powi(2),
//!     |p: &DVector<f64>| {
//!         DVector::from_vec(vec![
//!             -2.0 * (1.0 - p[0]) - 400.0 * p[0] * (p[1] - p[0] * p[0]),
//!             200.0 * (p[1] - p[0] * p[0]),
//!         ])
//!     },
//! );
//! let result = BfgsMinimizer::new()
//!     .find_minimum(&rosenbrock, &DVector::from_vec(vec![-1.2, 1.0]))
//!     .unwrap();
//! assert_ne!(result.exit_condition, ExitCondition::ExceedIterations);
//! assert!((result.minimizing_point[0] - 1.0).abs() < 1e-5);
//! ```
//!
//! # Derivative checking
//!
//! [`differentiate_numerically`] approximates the Jacobian of a
//! [`ModelFunction`] with extrapolated central differences, which is handy to
//! test an analytic [`ModelFunction::jacobian`].
//!
//! # Logging
//!
//! Progress is reported with [`tracing`] at `debug` and `trace` level. The
//! line-search minimizers and [`NewtonMinimizer`] emit an `accepted step`
//! event with `iteration` and `value` fields for every accepted iterate. The
//! crate never installs a subscriber.

mod bfgs;
mod bfgs_b;
mod brent;
mod criteria;
mod equation;
mod error;
mod golden_section;
mod gradient_projection;
mod lbfgs;
mod line_search;
mod lm;
mod mpfit;
mod nelder_mead;
mod newton;
pub mod objective;
mod powell;
mod problem;
mod projection;
mod qr;
mod quasi_newton;
mod result;
mod trust_region;
mod utils;

pub use bfgs::BfgsMinimizer;
pub use bfgs_b::BfgsBMinimizer;
pub use brent::BrentMinimizer;
pub use criteria::{ExitCondition, ExitCriteria};
pub use equation::Equation;
pub use error::{MinimizationError, Result};
pub use golden_section::GoldenSectionMinimizer;
pub use gradient_projection::{cauchy_point, BoxBounds, GradientProjectionResult};
pub use lbfgs::LbfgsMinimizer;
pub use line_search::{LineSearchResult, WolfeCondition, WolfeLineSearch};
pub use lm::LevenbergMarquardtMinimizer;
pub use mpfit::{MpFit, MpFunction, MpResult, MpStatus, ParameterSpec, Side};
pub use nelder_mead::NelderMeadSimplex;
pub use newton::NewtonMinimizer;
pub use objective::{Evaluation, ObjectiveFunction};
pub use powell::PowellMinimizer;
pub use problem::{
    Curve, CurveWithDerivative, Differencing, ModelFunction, ObjectiveModel, ParameterConstraints,
};
pub use projection::Projection;
pub use result::{
    LineSearchStats, MinimizationResult, NonlinearMinimizationResult, ScalarMinimizationResult,
};
pub use trust_region::{
    DogLeg, NewtonCg, SubproblemStep, TrustRegionMinimizer, TrustRegionSubproblem,
};

pub use utils::differentiate_numerically;
