use nalgebra::{DMatrix, DVector};
use tracing::warn;

use super::{boundary_step, SubproblemStep, TrustRegionSubproblem};

/// The dog-leg path from the Cauchy point to the Gauss-Newton point.
///
/// The Gauss-Newton point `$-\mathbf{H}^+\vec{g}$` is taken if it lies
/// inside the region. Otherwise the step follows the steepest descent
/// direction to the Cauchy point `$-\alpha\vec{g}$` with
/// `$\alpha = \vec{g}^\top\vec{g}/\vec{g}^\top\mathbf{H}\vec{g}$` and then
/// turns towards the Gauss-Newton point until it meets the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DogLeg;

impl TrustRegionSubproblem for DogLeg {
    fn solve(&self, gradient: &DVector<f64>, hessian: &DMatrix<f64>, radius: f64) -> SubproblemStep {
        let gradient_norm = gradient.norm();
        let to_boundary = || SubproblemStep {
            step: gradient * (-radius / gradient_norm),
            hit_boundary: true,
        };

        let curvature = gradient.dot(&(hessian * gradient));
        if curvature <= 0.0 {
            return to_boundary();
        }
        let alpha = gradient.norm_squared() / curvature;
        let cauchy = gradient * -alpha;

        let gauss_newton = match hessian.clone().pseudo_inverse(f64::EPSILON) {
            Ok(inverse) => -(inverse * gradient),
            Err(reason) => {
                warn!("pseudo-inverse of the Hessian failed: {}", reason);
                return if alpha * gradient_norm >= radius {
                    to_boundary()
                } else {
                    SubproblemStep {
                        step: cauchy,
                        hit_boundary: false,
                    }
                };
            }
        };

        if gauss_newton.norm() <= radius {
            SubproblemStep {
                step: gauss_newton,
                hit_boundary: false,
            }
        } else if alpha * gradient_norm >= radius {
            to_boundary()
        } else {
            let turn = &gauss_newton - &cauchy;
            let tau = boundary_step(&cauchy, &turn, radius);
            SubproblemStep {
                step: cauchy + turn * tau,
                hit_boundary: true,
            }
        }
    }
}
