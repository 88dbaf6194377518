//! Box constraints and the generalized Cauchy point.
//!
//! The bounded BFGS minimizer identifies the active set by following the
//! projected steepest-descent path
//! ```math
//!   \vec{x}(t) = \mathrm{P}\bigl(\vec{x}_0 - t\nabla f(\vec{x}_0)\bigr)
//! ```
//! of a quadratic model `$m(\vec{x}) = \vec{g}^\top(\vec{x}-\vec{x}_0) + \frac{1}{2}(\vec{x}-\vec{x}_0)^\top\mathbf{B}(\vec{x}-\vec{x}_0)$`
//! until the first local minimizer of `$m$` along the path.
use nalgebra::{DMatrix, DVector};

use crate::error::{MinimizationError, Result};

/// Relative distance below which a variable counts as sitting on its bound.
const AT_BOUND: f64 = 1e-15;

/// Lower and upper bounds for every variable.
#[derive(Debug, Clone, PartialEq)]
pub struct BoxBounds {
    lower: DVector<f64>,
    upper: DVector<f64>,
}

impl BoxBounds {
    /// Create bounds `$l_i \leq x_i \leq u_i$`.
    ///
    /// Infinite bounds are allowed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the lengths differ, a bound is `NaN` or
    /// `$l_i > u_i$`.
    pub fn new(lower: DVector<f64>, upper: DVector<f64>) -> Result<Self> {
        if lower.len() != upper.len() {
            return Err(MinimizationError::invalid_input(format!(
                "lower bound has {} entries but upper bound has {}",
                lower.len(),
                upper.len()
            )));
        }
        for (i, (l, u)) in lower.iter().zip(upper.iter()).enumerate() {
            if l.is_nan() || u.is_nan() || l > u {
                return Err(MinimizationError::invalid_input(format!(
                    "invalid bounds [{l}, {u}] for variable {i}"
                )));
            }
        }
        Ok(Self { lower, upper })
    }

    pub fn lower(&self) -> &DVector<f64> {
        &self.lower
    }

    pub fn upper(&self) -> &DVector<f64> {
        &self.upper
    }

    pub fn len(&self) -> usize {
        self.lower.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lower.is_empty()
    }

    pub fn contains(&self, x: &DVector<f64>) -> bool {
        x.len() == self.len()
            && x
                .iter()
                .zip(self.lower.iter().zip(self.upper.iter()))
                .all(|(x, (l, u))| l <= x && x <= u)
    }

    /// Project `x` onto the box.
    pub fn clamp(&self, x: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(
            x.len(),
            x.iter()
                .zip(self.lower.iter().zip(self.upper.iter()))
                .map(|(x, (l, u))| x.max(*l).min(*u)),
        )
    }

    /// Largest `$t \geq 0$` such that `start + t * direction` stays inside the box.
    ///
    /// Returns `$+\infty$` for a zero direction.
    pub fn find_max_step(&self, start: &DVector<f64>, direction: &DVector<f64>) -> f64 {
        let mut max_step = f64::INFINITY;
        for i in 0..start.len() {
            let step = if direction[i] > 0.0 {
                (self.upper[i] - start[i]) / direction[i]
            } else if direction[i] < 0.0 {
                (start[i] - self.lower[i]) / -direction[i]
            } else {
                f64::INFINITY
            };
            max_step = max_step.min(step);
        }
        max_step.max(0.0)
    }

    fn at_lower(&self, x: &DVector<f64>, i: usize) -> bool {
        x[i] - self.lower[i] <= AT_BOUND * self.lower[i].abs().max(1.0)
    }

    fn at_upper(&self, x: &DVector<f64>, i: usize) -> bool {
        self.upper[i] - x[i] <= AT_BOUND * self.upper[i].abs().max(1.0)
    }

    /// The gradient with every component zeroed that would push a variable
    /// sitting on a bound further outside.
    pub fn projected_gradient(&self, x: &DVector<f64>, gradient: &DVector<f64>) -> DVector<f64> {
        DVector::from_fn(gradient.len(), |i, _| {
            match (self.at_lower(x, i), self.at_upper(x, i)) {
                (true, true) => 0.0,
                (true, false) => gradient[i].min(0.0),
                (false, true) => gradient[i].max(0.0),
                (false, false) => gradient[i],
            }
        })
    }
}

/// The generalized Cauchy point and the active set it defines.
#[derive(Debug, Clone)]
pub struct GradientProjectionResult {
    pub cauchy_point: DVector<f64>,
    /// Number of variables fixed at a bound.
    pub fixed_count: usize,
    /// `true` for every variable fixed at a bound.
    pub is_fixed: Vec<bool>,
}

impl GradientProjectionResult {
    /// Indices of the variables that are not fixed.
    pub fn free_indices(&self) -> Vec<usize> {
        (0..self.is_fixed.len())
            .filter(|&i| !self.is_fixed[i])
            .collect()
    }
}

/// Find the generalized Cauchy point of the quadratic model with gradient
/// `gradient` and (pseudo-)Hessian `hessian` at `x0`.
///
/// The path is piecewise linear with a kink at every breakpoint where a
/// variable reaches its bound. On each segment the model is a quadratic in
/// the segment-local step; the search stops at the first segment whose
/// quadratic has its minimizer inside the segment, or when every variable
/// is fixed.
pub fn cauchy_point(
    x0: &DVector<f64>,
    gradient: &DVector<f64>,
    hessian: &DMatrix<f64>,
    bounds: &BoxBounds,
) -> GradientProjectionResult {
    let n = x0.len();
    let lower = bounds.lower();
    let upper = bounds.upper();

    let breakpoints: Vec<f64> = (0..n)
        .map(|i| {
            if gradient[i] < 0.0 {
                (x0[i] - upper[i]) / gradient[i]
            } else if gradient[i] > 0.0 {
                (x0[i] - lower[i]) / gradient[i]
            } else if bounds.at_lower(x0, i) || bounds.at_upper(x0, i) {
                0.0
            } else {
                f64::INFINITY
            }
        })
        .collect();

    let mut is_fixed: Vec<bool> = breakpoints.iter().map(|t| *t <= 0.0).collect();
    let mut direction = DVector::from_fn(n, |i, _| if is_fixed[i] { 0.0 } else { -gradient[i] });

    let mut ordered: Vec<f64> = breakpoints
        .iter()
        .copied()
        .filter(|t| *t > 0.0 && t.is_finite())
        .collect();
    ordered.sort_by(f64::total_cmp);
    ordered.dedup();

    let mut x = x0.clone();
    let mut segment_start = 0.0;
    let mut finished = false;
    for &breakpoint in &ordered {
        if is_fixed.iter().all(|fixed| *fixed) {
            finished = true;
            break;
        }
        let (slope, curvature) = segment_model(x0, &x, gradient, hessian, &direction);
        if slope >= 0.0 {
            finished = true;
            break;
        }
        let segment_length = breakpoint - segment_start;
        if curvature > 0.0 {
            let step = -slope / curvature;
            if step < segment_length {
                x.axpy(step, &direction, 1.0);
                finished = true;
                break;
            }
        }
        x.axpy(segment_length, &direction, 1.0);
        for i in 0..n {
            if !is_fixed[i] && breakpoints[i] <= breakpoint {
                x[i] = if gradient[i] < 0.0 { upper[i] } else { lower[i] };
                direction[i] = 0.0;
                is_fixed[i] = true;
            }
        }
        segment_start = breakpoint;
    }

    // only variables with an infinite breakpoint can still be free here
    if !finished && is_fixed.iter().any(|fixed| !*fixed) {
        let (slope, curvature) = segment_model(x0, &x, gradient, hessian, &direction);
        if slope < 0.0 && curvature > 0.0 {
            x.axpy(-slope / curvature, &direction, 1.0);
        }
    }

    let fixed_count = is_fixed.iter().filter(|fixed| **fixed).count();
    GradientProjectionResult {
        cauchy_point: bounds.clamp(&x),
        fixed_count,
        is_fixed,
    }
}

/// First and second derivative of the model along `direction` at `x`.
fn segment_model(
    x0: &DVector<f64>,
    x: &DVector<f64>,
    gradient: &DVector<f64>,
    hessian: &DMatrix<f64>,
    direction: &DVector<f64>,
) -> (f64, f64) {
    let hd = hessian * direction;
    let slope = gradient.dot(direction) + (x - x0).dot(&hd);
    let curvature = direction.dot(&hd);
    (slope, curvature)
}
