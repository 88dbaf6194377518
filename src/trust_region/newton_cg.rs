use nalgebra::{DMatrix, DVector};

use super::{boundary_step, SubproblemStep, TrustRegionSubproblem};

/// Steihaug's truncated conjugate gradient method.
///
/// Runs conjugate gradients on `$\mathbf{H}\vec{p} = -\vec{g}$` from
/// `$\vec{p} = 0$` and stops at the boundary when an iterate leaves the
/// region or a direction of non-positive curvature appears. The residual
/// tolerance is `$\min(\frac{1}{2}, \sqrt{\|\vec{g}\|})\|\vec{g}\|$`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NewtonCg;

impl TrustRegionSubproblem for NewtonCg {
    fn solve(&self, gradient: &DVector<f64>, hessian: &DMatrix<f64>, radius: f64) -> SubproblemStep {
        let n = gradient.len();
        let gradient_norm = gradient.norm();
        let tolerance = gradient_norm.sqrt().min(0.5) * gradient_norm;

        let mut z = DVector::zeros(n);
        let mut r = gradient.clone();
        let mut d = -&r;
        if r.norm() < tolerance {
            return SubproblemStep {
                step: z,
                hit_boundary: false,
            };
        }

        for _ in 0..n.max(1) * 10 {
            let hd = hessian * &d;
            let curvature = d.dot(&hd);
            if curvature <= 0.0 {
                let tau = boundary_step(&z, &d, radius);
                return SubproblemStep {
                    step: z + d * tau,
                    hit_boundary: true,
                };
            }

            let r_squared = r.norm_squared();
            let alpha = r_squared / curvature;
            let next = &z + &d * alpha;
            if next.norm() >= radius {
                let tau = boundary_step(&z, &d, radius);
                return SubproblemStep {
                    step: z + d * tau,
                    hit_boundary: true,
                };
            }

            r += hd * alpha;
            z = next;
            if r.norm() < tolerance {
                break;
            }
            let beta = r.norm_squared() / r_squared;
            d = &d * beta - &r;
        }
        SubproblemStep {
            step: z,
            hit_boundary: false,
        }
    }
}
