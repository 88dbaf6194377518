//! Trust-region minimization of least-squares problems.
use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::criteria::ExitCondition;
use crate::error::Result;
use crate::problem::{ModelFunction, ObjectiveModel, ParameterConstraints};
use crate::projection::{all_finite, start_fit};
use crate::result::NonlinearMinimizationResult;

mod dog_leg;
mod newton_cg;

pub use dog_leg::DogLeg;
pub use newton_cg::NewtonCg;

/// Approximate minimizer of the quadratic model
/// `$m(\vec{p}) = \vec{g}^\top\vec{p} + \frac{1}{2}\vec{p}^\top\mathbf{H}\vec{p}$`
/// subject to `$\|\vec{p}\| \leq \Delta$`.
pub trait TrustRegionSubproblem {
    fn solve(&self, gradient: &DVector<f64>, hessian: &DMatrix<f64>, radius: f64) -> SubproblemStep;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubproblemStep {
    pub step: DVector<f64>,
    /// Whether `step` lies on the boundary `$\|\vec{p}\| = \Delta$`.
    pub hit_boundary: bool,
}

/// The `$\tau \geq 0$` with `$\|\vec{z} + \tau\vec{d}\| = \Delta$` for `$\|\vec{z}\| \leq \Delta$`.
pub(crate) fn boundary_step(z: &DVector<f64>, d: &DVector<f64>, radius: f64) -> f64 {
    let a = d.norm_squared();
    let b = 2.0 * z.dot(d);
    let c = z.norm_squared() - radius * radius;
    let discriminant = (b * b - 4.0 * a * c).max(0.0);
    (-b + discriminant.sqrt()) / (2.0 * a)
}

/// Trust-region minimizer for weighted least-squares problems.
///
/// The radius starts at `$\vec{g}^\top\vec{g}/\vec{g}^\top\mathbf{H}\vec{g}$`
/// clamped to `$[1, \Delta_{\max}]$`. After each trial step the radius is
/// doubled if the model predicted the reduction well (`$\rho > 0.75$`) and the
/// step was limited by the boundary, and quartered if it predicted badly
/// (`$\rho < 0.25$`). The step is accepted if `$\rho > \eta$`.
///
/// Like [`LevenbergMarquardtMinimizer`](crate::LevenbergMarquardtMinimizer)
/// it works on the internal coordinates of the parameter
/// [`Projection`](crate::Projection).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrustRegionMinimizer<S> {
    subproblem: S,
    gradient_tolerance: f64,
    step_tolerance: f64,
    function_tolerance: f64,
    radius_tolerance: f64,
    max_radius: f64,
    eta: f64,
    maximum_iterations: Option<usize>,
}

impl<S: TrustRegionSubproblem + Default> Default for TrustRegionMinimizer<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl TrustRegionMinimizer<DogLeg> {
    pub fn dog_leg() -> Self {
        Self::new(DogLeg)
    }
}

impl TrustRegionMinimizer<NewtonCg> {
    pub fn newton_cg() -> Self {
        Self::new(NewtonCg)
    }
}

impl<S: TrustRegionSubproblem> TrustRegionMinimizer<S> {
    pub fn new(subproblem: S) -> Self {
        Self {
            subproblem,
            gradient_tolerance: 1e-8,
            step_tolerance: 1e-8,
            function_tolerance: 1e-8,
            radius_tolerance: 1e-18,
            max_radius: 1e3,
            eta: 0.0,
            maximum_iterations: None,
        }
    }

    /// # Panics
    ///
    /// Panics if `$\mathtt{gradient\_tolerance} < 0$`.
    pub fn with_gradient_tolerance(self, gradient_tolerance: f64) -> Self {
        assert!(gradient_tolerance >= 0.0, "gradient_tolerance must be >= 0");
        Self {
            gradient_tolerance,
            ..self
        }
    }

    /// # Panics
    ///
    /// Panics if `$\mathtt{step\_tolerance} < 0$`.
    pub fn with_step_tolerance(self, step_tolerance: f64) -> Self {
        assert!(step_tolerance >= 0.0, "step_tolerance must be >= 0");
        Self {
            step_tolerance,
            ..self
        }
    }

    /// # Panics
    ///
    /// Panics if `$\mathtt{function\_tolerance} < 0$`.
    pub fn with_function_tolerance(self, function_tolerance: f64) -> Self {
        assert!(function_tolerance >= 0.0, "function_tolerance must be >= 0");
        Self {
            function_tolerance,
            ..self
        }
    }

    /// Stop with [`ExitCondition::RelativePoints`] once the radius shrinks
    /// below `$\epsilon(\epsilon + \|\vec{x}\|)$`.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{radius\_tolerance} < 0$`.
    pub fn with_radius_tolerance(self, radius_tolerance: f64) -> Self {
        assert!(radius_tolerance >= 0.0, "radius_tolerance must be >= 0");
        Self {
            radius_tolerance,
            ..self
        }
    }

    /// # Panics
    ///
    /// Panics if `$\mathtt{max\_radius} < 1$`.
    pub fn with_max_radius(self, max_radius: f64) -> Self {
        assert!(max_radius >= 1.0, "max_radius must be >= 1");
        Self { max_radius, ..self }
    }

    /// Set the threshold on `$\rho$` for accepting a step.
    ///
    /// # Panics
    ///
    /// Panics unless `$0 \leq \eta < \frac{1}{4}$`.
    pub fn with_eta(self, eta: f64) -> Self {
        assert!((0.0..0.25).contains(&eta), "eta must be in [0, 0.25)");
        Self { eta, ..self }
    }

    /// Set the number of iterations, `$200(n+1)$` by default.
    ///
    /// Zero evaluates the initial guess only and reports
    /// [`ExitCondition::ManuallyStopped`].
    pub fn with_maximum_iterations(self, maximum_iterations: usize) -> Self {
        Self {
            maximum_iterations: Some(maximum_iterations),
            ..self
        }
    }

    /// Fit `model` starting from `initial_guess`.
    ///
    /// # Errors
    ///
    /// Same as [`LevenbergMarquardtMinimizer::find_minimum`](crate::LevenbergMarquardtMinimizer::find_minimum).
    pub fn find_minimum<M>(
        &self,
        model: &mut ObjectiveModel<'_, M>,
        initial_guess: &DVector<f64>,
        constraints: &ParameterConstraints,
    ) -> Result<NonlinearMinimizationResult>
    where
        M: ModelFunction + ?Sized,
    {
        let (projection, mut x) = start_fit(model, initial_guess, constraints)?;
        if !model.value().is_finite() {
            return model.to_result(0, ExitCondition::InvalidValues);
        }
        let maximum_iterations = self
            .maximum_iterations
            .unwrap_or(200 * (initial_guess.len() + 1));
        if maximum_iterations == 0 {
            return model.to_result(0, ExitCondition::ManuallyStopped);
        }

        let (mut gradient, mut hessian) = projection.evaluate_jacobian(model, &x)?;
        if !all_finite(&gradient, &hessian) {
            return model.to_result(0, ExitCondition::InvalidValues);
        }
        let mut exit_condition = self.check_convergence(model.value(), &gradient);

        let initial_radius = gradient.norm_squared() / (&hessian * &gradient).dot(&gradient);
        let mut radius = if initial_radius.is_finite() {
            initial_radius.clamp(1.0, self.max_radius)
        } else {
            1.0
        };
        let mut iterations = 0;

        while exit_condition.is_none() && iterations < maximum_iterations {
            iterations += 1;
            let SubproblemStep { step, hit_boundary } =
                self.subproblem.solve(&gradient, &hessian, radius);
            let x_norm = x.norm();
            if step.norm() <= self.step_tolerance * (self.step_tolerance + x_norm) {
                exit_condition = Some(ExitCondition::RelativePoints);
                break;
            }

            let candidate = &x + &step;
            let mut trial = model.fork();
            projection.evaluate_function(&mut trial, &candidate)?;
            if !trial.value().is_finite() {
                model.absorb_counters(&trial);
                exit_condition = Some(ExitCondition::InvalidValues);
                break;
            }

            // the model is on the scale of the residual sum of squares,
            // twice that of m(p)
            let predicted_reduction =
                -2.0 * gradient.dot(&step) - step.dot(&(&hessian * &step));
            let rho = (model.value() - trial.value()) / predicted_reduction;

            let mut radius_exit = None;
            if rho > 0.75 && hit_boundary {
                radius = (2.0 * radius).min(self.max_radius);
            } else if rho < 0.25 {
                radius *= 0.25;
                if radius <= self.radius_tolerance * (self.radius_tolerance + x_norm) {
                    radius_exit = Some(ExitCondition::RelativePoints);
                }
            }

            if rho > self.eta {
                *model = trial;
                x = candidate;
                let (g, h) = projection.evaluate_jacobian(model, &x)?;
                if !all_finite(&g, &h) {
                    exit_condition = Some(ExitCondition::InvalidValues);
                    break;
                }
                gradient = g;
                hessian = h;
                debug!(
                    "iteration {}: RSS {:e}, |p| {:e}, radius {:e}",
                    iterations,
                    model.value(),
                    step.norm(),
                    radius
                );
                exit_condition = self
                    .check_convergence(model.value(), &gradient)
                    .or(radius_exit);
            } else {
                model.absorb_counters(&trial);
                exit_condition = radius_exit;
            }
        }

        let exit_condition = exit_condition.unwrap_or(ExitCondition::ExceedIterations);
        model.to_result(iterations, exit_condition)
    }

    fn check_convergence(&self, rss: f64, gradient: &DVector<f64>) -> Option<ExitCondition> {
        if gradient.amax() <= self.gradient_tolerance {
            Some(ExitCondition::AbsoluteGradient)
        } else if rss <= self.function_tolerance {
            Some(ExitCondition::Converged)
        } else {
            None
        }
    }
}
