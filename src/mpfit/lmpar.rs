//! Solver for the trust-region sub-problem in the MPFIT kernel.
use nalgebra::{convert, DVector, RealField};
use num_traits::Float;

use crate::qr::DampedLeastSquares;
use crate::utils::enorm;

pub(super) struct LMParameter<F: RealField> {
    pub step: DVector<F>,
    pub lambda: F,
    #[allow(dead_code)]
    pub dp_norm: F,
}

/// Approximately solve the LM trust-region subproblem.
///
/// Given `$\mathbf{J}\in\R^{m\times n}$` and a non-singular diagonal matrix `$\mathbf{D}$`
/// this routine approximately solves the problem
/// ```math
///   \min_{\vec{p}\in\R^n}\|\mathbf{J}\vec{p} - \vec{r}\|^2\text{ subject to }\|\mathbf{D}\vec{p}\|\leq\Delta.
/// ```
///
/// It can be shown that `$\vec{p}$` with `$\|\mathbf{D}\vec{p}\|\leq\Delta$` is
/// a solution if and only if there exists `$\lambda\geq 0$` such that
/// ```math
/// \begin{aligned}
/// (\mathbf{J}^\top\mathbf{J} + \lambda \mathbf{D}\mathbf{D})\vec{p} &= \mathbf{J}^\top\vec{r}, \\
/// \lambda(\Delta - \|\mathbf{D}\vec{p}\|) &= 0.
/// \end{aligned}
/// ```
///
/// The returned `$\lambda$` makes `$\|\mathbf{D}\vec{p}\|$` lie within 10% of
/// `$\Delta$`, or is zero if the Gauss-Newton step is already short enough.
///
/// # Reference
///
/// This method resembles `LMPAR` from `MINPACK`. See the following paper
/// on how it works:
///
/// > Moré J.J. (1978) The Levenberg-Marquardt algorithm: Implementation and theory. In: Watson G.A. (eds) Numerical Analysis. Lecture Notes in Mathematics, vol 630. Springer, Berlin, Heidelberg.
pub(super) fn determine_lambda_and_parameter_update<F>(
    lls: &mut DampedLeastSquares<F>,
    diag: &DVector<F>,
    delta: F,
    initial_lambda: F,
) -> LMParameter<F>
where
    F: RealField + Float,
{
    const ITERATION_LIMIT: usize = 10;
    let p1: F = convert(0.1f64);
    let p001: F = convert(0.001f64);
    let dwarf = F::min_positive_value();
    let full_rank = lls.has_full_rank();
    let n = diag.len();

    let (mut p, mut l) = lls.solve_undamped();
    let mut diag_p = p.component_mul(diag);
    let mut diag_p_norm = enorm(diag_p.iter().copied());
    let mut fp = diag_p_norm - delta;
    if fp <= delta * p1 {
        // we have a feasible p with lambda = 0
        return LMParameter {
            step: p,
            lambda: F::zero(),
            dp_norm: diag_p_norm,
        };
    }

    // we now look for lambda > 0 with ||D p|| = delta
    // by using an approximate Newton iteration.

    let mut lambda_lower = if full_rank {
        let direction = diag_p.component_mul(diag) / diag_p_norm;
        let direction = l.solve(direction);
        fp / delta / direction.norm_squared()
    } else {
        F::zero()
    };

    let gnorm;
    let mut lambda_upper = {
        let mut gradient = l.mul_qtb(DVector::zeros(n));
        for (g, perm) in gradient.iter_mut().zip(l.permutation.iter()) {
            *g = *g / diag[*perm];
        }
        gnorm = enorm(gradient.iter().copied());
        let upper = gnorm / delta;
        if upper.is_zero() {
            dwarf / Float::min(delta, p1)
        } else {
            upper
        }
    };

    let mut lambda = Float::min(Float::max(initial_lambda, lambda_lower), lambda_upper);
    if lambda.is_zero() {
        lambda = gnorm / diag_p_norm;
    }

    for iteration in 1..=ITERATION_LIMIT {
        if lambda.is_zero() {
            lambda = Float::max(dwarf, lambda_upper * p001);
        }
        let diag_lambda = diag.map(|d| d * Float::sqrt(lambda));
        let (p_new, mut l) = lls.solve_with_diagonal(&diag_lambda, p);
        p = p_new;
        diag_p = p.component_mul(diag);
        diag_p_norm = enorm(diag_p.iter().copied());
        let fp_old = fp;
        fp = diag_p_norm - delta;

        // ||D p|| is close enough to delta, or lambda_lower is zero and the
        // step is already inside the region
        if Float::abs(fp) <= p1 * delta
            || (lambda_lower.is_zero() && fp <= fp_old && fp_old < F::zero())
            || iteration == ITERATION_LIMIT
        {
            break;
        }

        let newton_correction = {
            let direction = diag_p.component_mul(diag) / diag_p_norm;
            let direction = l.solve(direction);
            fp / delta / direction.norm_squared()
        };

        if fp > F::zero() {
            lambda_lower = Float::max(lambda_lower, lambda);
        } else if fp < F::zero() {
            lambda_upper = Float::min(lambda_upper, lambda);
        }
        lambda = Float::max(lambda_lower, lambda + newton_correction);
    }

    LMParameter {
        step: p,
        lambda,
        dp_norm: diag_p_norm,
    }
}
