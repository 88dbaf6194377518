//! Brent's method for scalar minimization.
use nalgebra::DVector;
use tracing::{debug, trace};

use crate::criteria::ExitCondition;
use crate::error::{MinimizationError, Result};
use crate::result::ScalarMinimizationResult;

/// The golden ratio.
const GOLD: f64 = 1.618_033_988_749_895;
/// `$(3 - \sqrt{5})/2$`, the golden section of a unit interval.
const CGOLD: f64 = 0.381_966_011_250_105_1;
/// Farthest a parabolic step may extrapolate while bracketing.
const GROWTH_LIMIT: f64 = 100.0;
/// Guards the division in the parabolic extrapolation.
const TINY: f64 = 1e-20;
/// Absolute tolerance added near zero.
const ZEPS: f64 = f64::EPSILON * 1e-3;

/// Parabolic interpolation safeguarded by golden section steps.
///
/// The search keeps a bracket `$a < x < b$` together with the two previous
/// best points `$w$` and `$v$`. A parabola through `$x, w, v$` is used when
/// its minimum lies inside the bracket and the step is less than half of the
/// step before the last one, otherwise the larger part of the bracket is cut
/// at the golden section. It stops when
/// ```math
///   |x - \tfrac{1}{2}(a+b)| \leq 2\,\mathtt{tol}_1 - \tfrac{1}{2}(b - a),
///   \qquad \mathtt{tol}_1 = \mathtt{tolerance}\cdot|x| + \epsilon.
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrentMinimizer {
    tolerance: f64,
    maximum_iterations: usize,
}

impl Default for BrentMinimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl BrentMinimizer {
    pub fn new() -> Self {
        Self {
            tolerance: 3e-8,
            maximum_iterations: 500,
        }
    }

    /// Set the fractional precision of the minimizing point.
    ///
    /// Values below the square root of the machine precision do not pay off.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{tolerance} \leq 0$`.
    pub fn with_tolerance(self, tolerance: f64) -> Self {
        assert!(tolerance > 0.0, "tolerance must be > 0");
        Self { tolerance, ..self }
    }

    /// Set the iteration budget of both the bracketing and the narrowing phase.
    ///
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

    /// Minimize `f` starting from the two points `a` and `b`.
    ///
    /// A bracket is searched downhill from `a` and `b` by golden ratio
    /// expansion with parabolic extrapolation before Brent's iteration starts.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if `a == b` or either point is not finite.
    /// - `InvalidBracket` if no bracket is found within the iteration budget.
    /// - `EvaluationFailed` if `f` is not finite at a trial point.
    /// - `MaximumIterations` if the bracket does not shrink in time.
    pub fn find_minimum<F>(&self, f: F, a: f64, b: f64) -> Result<ScalarMinimizationResult>
    where
        F: Fn(f64) -> f64,
    {
        if !a.is_finite() || !b.is_finite() || a == b {
            return Err(MinimizationError::invalid_input(format!(
                "need two distinct finite starting points, got {a} and {b}"
            )));
        }
        let (a, x, b, fx) = self.bracket(&f, a, b)?;
        self.minimize(&f, a, x, b, fx)
    }

    /// Minimize `f` in a known bracket.
    ///
    /// `x` must lie strictly between `a` and `b` with `$f(x)$` below both
    /// `$f(a)$` and `$f(b)$`.
    ///
    /// # Errors
    ///
    /// - `InvalidBracket` if `a, x, b` do not bracket a minimum.
    /// - `EvaluationFailed` if `f` is not finite at a trial point.
    /// - `MaximumIterations` if the bracket does not shrink in time.
    pub fn find_minimum_in_bracket<F>(
        &self,
        f: F,
        a: f64,
        x: f64,
        b: f64,
    ) -> Result<ScalarMinimizationResult>
    where
        F: Fn(f64) -> f64,
    {
        if !((a < x && x < b) || (b < x && x < a)) {
            return Err(MinimizationError::invalid_bracket(format!(
                "{x} does not lie between {a} and {b}"
            )));
        }
        let fa = evaluate(&f, a)?;
        let fx = evaluate(&f, x)?;
        let fb = evaluate(&f, b)?;
        if fx > fa || fx > fb {
            return Err(MinimizationError::invalid_bracket(format!(
                "f({x}) = {fx} is not below f({a}) = {fa} and f({b}) = {fb}"
            )));
        }
        self.minimize(&f, a, x, b, fx)
    }

    /// Walk downhill from `a` to `b` until the function rises again.
    fn bracket<F>(&self, f: &F, mut a: f64, mut b: f64) -> Result<(f64, f64, f64, f64)>
    where
        F: Fn(f64) -> f64,
    {
        let mut fa = evaluate(f, a)?;
        let mut fb = evaluate(f, b)?;
        if fb > fa {
            std::mem::swap(&mut a, &mut b);
            std::mem::swap(&mut fa, &mut fb);
        }
        let mut c = b + GOLD * (b - a);
        let mut fc = evaluate(f, c)?;

        let mut steps = 0;
        while fb > fc {
            steps += 1;
            if steps > self.maximum_iterations {
                return Err(MinimizationError::invalid_bracket(format!(
                    "no minimum found downhill of {b} after {} steps",
                    self.maximum_iterations
                )));
            }
            // parabolic extrapolation from a, b, c
            let r = (b - a) * (fb - fc);
            let q = (b - c) * (fb - fa);
            let denominator = 2.0 * (q - r).abs().max(TINY).copysign(q - r);
            let mut u = b - ((b - c) * q - (b - a) * r) / denominator;
            let limit = b + GROWTH_LIMIT * (c - b);
            let mut fu;
            if (b - u) * (u - c) > 0.0 {
                fu = evaluate(f, u)?;
                if fu < fc {
                    // minimum between b and c
                    return Ok((b, u, c, fu));
                } else if fu > fb {
                    // minimum between a and u
                    return Ok((a, b, u, fb));
                }
                u = c + GOLD * (c - b);
                fu = evaluate(f, u)?;
            } else if (c - u) * (u - limit) > 0.0 {
                fu = evaluate(f, u)?;
                if fu < fc {
                    b = c;
                    c = u;
                    u = c + GOLD * (c - b);
                    fb = fc;
                    fc = fu;
                    fu = evaluate(f, u)?;
                }
            } else if (u - limit) * (limit - c) >= 0.0 {
                u = limit;
                fu = evaluate(f, u)?;
            } else {
                u = c + GOLD * (c - b);
                fu = evaluate(f, u)?;
            }
            a = b;
            b = c;
            c = u;
            fa = fb;
            fb = fc;
            fc = fu;
            trace!("bracketing: ({a}, {b}, {c}) with f(b) = {fb}");
        }
        Ok((a, b, c, fb))
    }

    fn minimize<F>(
        &self,
        f: &F,
        a: f64,
        x: f64,
        b: f64,
        fx: f64,
    ) -> Result<ScalarMinimizationResult>
    where
        F: Fn(f64) -> f64,
    {
        let (mut a, mut b) = if a < b { (a, b) } else { (b, a) };
        let (mut x, mut w, mut v) = (x, x, x);
        let (mut fx, mut fw, mut fv) = (fx, fx, fx);
        // step before the last one and last step
        let (mut e, mut d) = (0.0f64, 0.0f64);

        for iteration in 0..self.maximum_iterations {
            let xm = 0.5 * (a + b);
            let tol1 = self.tolerance * x.abs() + ZEPS;
            let tol2 = 2.0 * tol1;
            if (x - xm).abs() <= tol2 - 0.5 * (b - a) {
                debug!("Brent converged to {x} after {iteration} iterations");
                return Ok(ScalarMinimizationResult {
                    minimizing_point: x,
                    value: fx,
                    iterations: iteration,
                    exit_condition: ExitCondition::BoundTolerance,
                });
            }

            let golden = |x: f64| if x >= xm { a - x } else { b - x };
            if e.abs() > tol1 {
                // trial parabolic fit
                let r = (x - w) * (fx - fv);
                let mut q = (x - v) * (fx - fw);
                let mut p = (x - v) * q - (x - w) * r;
                q = 2.0 * (q - r);
                if q > 0.0 {
                    p = -p;
                }
                q = q.abs();
                let previous = e;
                e = d;
                if p.abs() >= (0.5 * q * previous).abs() || p <= q * (a - x) || p >= q * (b - x) {
                    e = golden(x);
                    d = CGOLD * e;
                } else {
                    d = p / q;
                    let u = x + d;
                    if u - a < tol2 || b - u < tol2 {
                        d = tol1.copysign(xm - x);
                    }
                }
            } else {
                e = golden(x);
                d = CGOLD * e;
            }

            let u = if d.abs() >= tol1 {
                x + d
            } else {
                x + tol1.copysign(d)
            };
            let fu = evaluate(f, u)?;
            trace!("Brent trial f({u}) = {fu}");

            if fu <= fx {
                if u >= x {
                    a = x;
                } else {
                    b = x;
                }
                v = w;
                w = x;
                x = u;
                fv = fw;
                fw = fx;
                fx = fu;
            } else {
                if u < x {
                    a = u;
                } else {
                    b = u;
                }
                if fu <= fw || w == x {
                    v = w;
                    w = u;
                    fv = fw;
                    fw = fu;
                } else if fu <= fv || v == x || v == w {
                    v = u;
                    fv = fu;
                }
            }
        }
        Err(MinimizationError::maximum_iterations(self.maximum_iterations))
    }
}

pub(crate) fn evaluate<F>(f: &F, x: f64) -> Result<f64>
where
    F: Fn(f64) -> f64,
{
    let value = f(x);
    if value.is_finite() {
        Ok(value)
    } else {
        Err(MinimizationError::evaluation_failed(
            "function value not finite",
            &DVector::from_element(1, x),
            Some(value),
        ))
    }
}
