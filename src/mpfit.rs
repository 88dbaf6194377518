//! MINPACK-style Levenberg-Marquardt with parameter limits (MPFIT).
//!
//! This kernel follows the `lmder` driver of MINPACK: the step is obtained
//! from a trust-region subproblem solved by [`lmpar`](lmpar) on a pivoted QR
//! factorization of the Jacobian, and the trust region is scaled by the
//! column norms of the Jacobian. On top of that it supports
//!
//! - fixed parameters,
//! - lower and upper limits, enforced by truncating the step at the limit
//!   and "pegging" parameters which sit on a limit while the gradient points
//!   outside,
//! - per-parameter finite difference settings and analytic derivatives.
use cfg_if::cfg_if;
use nalgebra::{convert, DMatrix, DVector, RealField};
use num_traits::Float;
use tracing::debug;

use crate::criteria::ExitCondition;
use crate::error::{MinimizationError, Result};
use crate::qr::{DampedLeastSquares, PivotedQR};
use crate::utils::{enorm, epsmch, to_f64};

mod covar;
mod fdjac;
mod lmpar;

#[cfg(test)]
mod test_examples;
#[cfg(test)]
mod test_helpers;
#[cfg(test)]
mod test_init_step;
#[cfg(test)]
mod test_limits;
#[cfg(test)]
mod test_update_diag;

/// A least squares problem for [`MpFit`].
///
/// The kernel sets the parameters and then asks for the residuals
/// `$\vec{r}(\vec{x})$` (and, for parameters with [`Side::Analytic`], the
/// Jacobian) at that point.
pub trait MpFunction<F: RealField> {
    /// Set the stored parameters `$\vec{x}$`.
    fn set_params(&mut self, x: &DVector<F>);

    /// Compute the residual vector.
    fn residuals(&self) -> Option<DVector<F>>;

    /// Compute the Jacobian of the residual vector with respect to all
    /// parameters.
    fn jacobian(&self) -> Option<DMatrix<F>> {
        None
    }
}

/// How the Jacobian column of a parameter is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Side {
    /// One-sided forward difference, backward if an upper limit is within
    /// one step.
    #[default]
    Forward,
    /// One-sided backward difference, forward if a lower limit is within
    /// one step.
    Backward,
    /// Central difference, one-sided near a limit.
    TwoSided,
    /// Column of [`MpFunction::jacobian`].
    Analytic,
}

/// Constraints and differencing settings of one parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterSpec<F> {
    fixed: bool,
    lower: Option<F>,
    upper: Option<F>,
    step: Option<F>,
    relative_step: Option<F>,
    side: Side,
}

impl<F: RealField + Float> Default for ParameterSpec<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: RealField + Float> ParameterSpec<F> {
    pub fn new() -> Self {
        Self {
            fixed: false,
            lower: None,
            upper: None,
            step: None,
            relative_step: None,
            side: Side::Forward,
        }
    }

    /// Keep the parameter at its initial value.
    pub fn with_fixed(self, fixed: bool) -> Self {
        Self { fixed, ..self }
    }

    pub fn with_lower_limit(self, lower: F) -> Self {
        Self {
            lower: Some(lower),
            ..self
        }
    }

    pub fn with_upper_limit(self, upper: F) -> Self {
        Self {
            upper: Some(upper),
            ..self
        }
    }

    /// Set an absolute finite difference step.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{step} \leq 0$`.
    pub fn with_step(self, step: F) -> Self {
        assert!(step > F::zero(), "step must be > 0");
        Self {
            step: Some(step),
            ..self
        }
    }

    /// Set a finite difference step relative to the parameter value.
    ///
    /// Takes precedence over [`with_step`](Self::with_step).
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{relative\_step} \leq 0$`.
    pub fn with_relative_step(self, relative_step: F) -> Self {
        assert!(relative_step > F::zero(), "relative_step must be > 0");
        Self {
            relative_step: Some(relative_step),
            ..self
        }
    }

    pub fn with_side(self, side: Side) -> Self {
        Self { side, ..self }
    }

    fn is_at_lower(&self, x: F) -> bool {
        self.lower.map_or(false, |lower| x <= lower)
    }

    fn is_at_upper(&self, x: F) -> bool {
        self.upper.map_or(false, |upper| x >= upper)
    }
}

/// Why the kernel stopped, with MPFIT's status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MpStatus {
    /// Both actual and predicted relative reductions of `$\chi^2$` are at
    /// most `ftol`, or the residuals vanished.
    ChiSquareConverged = 1,
    /// The relative change of the parameters is at most `xtol`.
    ParametersConverged = 2,
    /// Both of the above.
    BothConverged = 3,
    /// The cosine between the residuals and every Jacobian column is at most `gtol`.
    Orthogonal = 4,
    /// The iteration or evaluation budget is exhausted.
    MaximumIterations = 5,
    /// `ftol` is too small, `$\chi^2$` cannot be reduced further.
    FtolTooSmall = 6,
    /// `xtol` is too small, the parameters cannot be improved further.
    XtolTooSmall = 7,
    /// `gtol` is too small, the residuals are orthogonal to the Jacobian
    /// up to machine precision.
    GtolTooSmall = 8,
}

impl MpStatus {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn exit_condition(self) -> ExitCondition {
        match self {
            MpStatus::ChiSquareConverged | MpStatus::BothConverged => ExitCondition::Converged,
            MpStatus::ParametersConverged => ExitCondition::RelativePoints,
            MpStatus::Orthogonal | MpStatus::GtolTooSmall => ExitCondition::RelativeGradient,
            MpStatus::MaximumIterations => ExitCondition::ExceedIterations,
            MpStatus::FtolTooSmall => ExitCondition::LackOfFunctionImprovement,
            MpStatus::XtolTooSmall => ExitCondition::LackOfProgress,
        }
    }
}

/// Outcome of [`MpFit::fit`].
#[derive(Debug, Clone, PartialEq)]
pub struct MpResult<F: RealField> {
    pub parameters: DVector<F>,
    /// `$\chi^2 = \|\vec{r}\|^2$` at `parameters`.
    pub best_norm: F,
    /// `$\chi^2$` at the initial guess.
    pub original_norm: F,
    /// Number of accepted steps.
    pub iterations: usize,
    /// Number of residual evaluations, finite differences included.
    pub evaluations: usize,
    pub status: MpStatus,
    pub free_parameters: usize,
    /// Free parameters which ended on one of their limits.
    pub pegged_parameters: usize,
    pub residuals: DVector<F>,
    /// `$\sqrt{C_{ii}}$`, zero for fixed and pegged parameters.
    pub parameter_errors: DVector<F>,
    /// Covariance `$(\mathbf{J}^\top\mathbf{J})^{-1}$` of all parameters.
    pub covariance: DMatrix<F>,
}

/// Configuration of the MPFIT kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MpFit<F> {
    ftol: F,
    xtol: F,
    gtol: F,
    epsfcn: F,
    step_factor: F,
    covtol: F,
    maximum_iterations: usize,
    maximum_evaluations: Option<usize>,
    scale_diag: bool,
}

impl<F: RealField + Float> Default for MpFit<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: RealField + Float> MpFit<F> {
    pub fn new() -> Self {
        Self {
            ftol: convert(1e-10),
            xtol: convert(1e-10),
            gtol: convert(1e-10),
            epsfcn: epsmch(),
            step_factor: convert(100.0),
            covtol: convert(1e-14),
            maximum_iterations: 200,
            maximum_evaluations: None,
            scale_diag: true,
        }
    }

    /// Set the relative error desired in `$\chi^2$`.
    ///
    /// Termination occurs when both the actual and
    /// predicted relative reductions of `$\chi^2$` are at most `ftol`.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{ftol} < 0$`.
    pub fn with_ftol(self, ftol: F) -> Self {
        assert!(ftol >= F::zero(), "ftol must be >= 0");
        Self { ftol, ..self }
    }

    /// Set relative error between last two approximations.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{xtol} < 0$`.
    pub fn with_xtol(self, xtol: F) -> Self {
        assert!(xtol >= F::zero(), "xtol must be >= 0");
        Self { xtol, ..self }
    }

    /// Set orthogonality desired between the residual vector and its derivative.
    ///
    /// Termination occurs when
    /// ```math
    ///   \max_{i=1,\ldots,n}\frac{|(\mathbf{J}^\top \vec{r})_i|}{\|\mathbf{J}\vec{e}_i\|\|\vec{r}\|} \leq \texttt{gtol}.
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{gtol} < 0$`.
    pub fn with_gtol(self, gtol: F) -> Self {
        assert!(gtol >= F::zero(), "gtol must be >= 0");
        Self { gtol, ..self }
    }

    /// Set the relative error of the residuals used to pick the finite
    /// difference step `$\sqrt{\max(\mathtt{epsfcn}, \varepsilon)}|x_j|$`.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{epsfcn} < 0$`.
    pub fn with_epsfcn(self, epsfcn: F) -> Self {
        assert!(epsfcn >= F::zero(), "epsfcn must be >= 0");
        Self { epsfcn, ..self }
    }

    /// Set factor for the initial step bound.
    ///
    /// This bound is set to `$\mathtt{step\_factor}\cdot\|\mathbf{D}\vec{x}\|$`
    /// if nonzero, or else to `step_factor` itself.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{step\_factor} \leq 0$`.
    pub fn with_step_factor(self, step_factor: F) -> Self {
        assert!(step_factor > F::zero(), "step_factor must be > 0");
        Self {
            step_factor,
            ..self
        }
    }

    /// Set the relative tolerance for the rank of `$\mathbf{R}$` in the
    /// covariance.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{covtol} < 0$`.
    pub fn with_covtol(self, covtol: F) -> Self {
        assert!(covtol >= F::zero(), "covtol must be >= 0");
        Self { covtol, ..self }
    }

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

    /// Set the maximal number of residual evaluations.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{maximum\_evaluations} = 0$`.
    pub fn with_maximum_evaluations(self, maximum_evaluations: usize) -> Self {
        assert!(maximum_evaluations > 0, "maximum_evaluations must be > 0");
        Self {
            maximum_evaluations: Some(maximum_evaluations),
            ..self
        }
    }

    /// Enable or disable whether the variables will be rescaled internally.
    pub fn with_scale_diag(self, scale_diag: bool) -> Self {
        Self { scale_diag, ..self }
    }

    /// Fit `function` starting at `initial`.
    ///
    /// `specs` holds one [`ParameterSpec`] per parameter, or is empty for
    /// unconstrained parameters with forward differences.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` for inconsistent specs, an infeasible or non-finite
    ///   initial guess, no free parameters or fewer residuals than free
    ///   parameters.
    /// - `EvaluationFailed` if the residuals or the Jacobian are missing or
    ///   not finite.
    pub fn fit<O>(
        &self,
        function: &mut O,
        initial: DVector<F>,
        specs: &[ParameterSpec<F>],
    ) -> Result<MpResult<F>>
    where
        O: MpFunction<F> + ?Sized,
    {
        Kernel::new(self, function, initial, specs)?.run()
    }
}

/// Set the parameters, evaluate the residuals and count the evaluation.
fn evaluate<F, O>(target: &mut O, evaluations: &mut usize, x: &DVector<F>) -> Result<DVector<F>>
where
    F: RealField + Float,
    O: MpFunction<F> + ?Sized,
{
    *evaluations += 1;
    target.set_params(x);
    target
        .residuals()
        .ok_or_else(|| MinimizationError::evaluation_failed("residuals returned None", &to_f64(x), None))
}

fn non_finite<F>(what: &str, x: &DVector<F>) -> MinimizationError
where
    F: RealField + Float,
{
    MinimizationError::evaluation_failed(format!("{what} not finite"), &to_f64(x), None)
}

/// State of a running fit.
struct Kernel<'a, F: RealField, O: ?Sized> {
    config: &'a MpFit<F>,
    target: &'a mut O,
    specs: Vec<ParameterSpec<F>>,
    /// Indices of the free parameters.
    free: Vec<usize>,
    any_limits: bool,
    /// All parameters at the current point.
    xall: DVector<F>,
    /// Free parameters at the current point.
    x: DVector<F>,
    residuals: DVector<F>,
    residuals_norm: F,
    original_norm: F,
    diag: DVector<F>,
    delta: F,
    xnorm: F,
    lambda: F,
    gnorm: F,
    first_update: bool,
    iterations: usize,
    evaluations: usize,
}

impl<'a, F, O> Kernel<'a, F, O>
where
    F: RealField + Float,
    O: MpFunction<F> + ?Sized,
{
    fn new(
        config: &'a MpFit<F>,
        target: &'a mut O,
        initial: DVector<F>,
        specs: &[ParameterSpec<F>],
    ) -> Result<Self> {
        let n = initial.len();
        let specs = match specs.len() {
            0 => vec![ParameterSpec::new(); n],
            len if len == n => specs.to_vec(),
            len => {
                return Err(MinimizationError::invalid_input(format!(
                    "got {len} parameter specs for {n} parameters"
                )))
            }
        };
        for (j, (spec, x)) in specs.iter().zip(initial.iter()).enumerate() {
            if !Float::is_finite(*x) {
                return Err(MinimizationError::invalid_input(format!(
                    "initial value of parameter {j} is not finite"
                )));
            }
            if let (Some(lower), Some(upper)) = (spec.lower, spec.upper) {
                if lower >= upper {
                    return Err(MinimizationError::invalid_input(format!(
                        "lower limit of parameter {j} is not below its upper limit"
                    )));
                }
            }
            if spec.lower.map_or(false, |lower| *x < lower)
                || spec.upper.map_or(false, |upper| *x > upper)
            {
                return Err(MinimizationError::invalid_input(format!(
                    "initial value of parameter {j} violates its limits"
                )));
            }
        }

        let mut evaluations = 0;
        let residuals = evaluate(target, &mut evaluations, &initial)?;
        if n == 0 {
            return Err(MinimizationError::invalid_input("no parameters"));
        }
        let free: Vec<usize> = (0..n).filter(|j| !specs[*j].fixed).collect();
        if free.is_empty() {
            return Err(MinimizationError::invalid_input("all parameters are fixed"));
        }
        if residuals.len() < free.len() {
            return Err(MinimizationError::invalid_input(format!(
                "{} residuals are not enough for {} free parameters",
                residuals.len(),
                free.len()
            )));
        }
        let residuals_norm = enorm(residuals.iter().copied());
        if !Float::is_finite(residuals_norm) {
            return Err(non_finite("residuals", &initial));
        }

        let any_limits = free
            .iter()
            .any(|j| specs[*j].lower.is_some() || specs[*j].upper.is_some());
        let x = DVector::from_iterator(free.len(), free.iter().map(|j| initial[*j]));
        Ok(Self {
            config,
            target,
            diag: DVector::from_element(free.len(), F::one()),
            specs,
            free,
            any_limits,
            xall: initial,
            x,
            residuals,
            residuals_norm,
            original_norm: residuals_norm * residuals_norm,
            delta: F::zero(),
            xnorm: F::zero(),
            lambda: F::zero(),
            gnorm: F::zero(),
            first_update: true,
            iterations: 0,
            evaluations,
        })
    }

    fn run(mut self) -> Result<MpResult<F>> {
        cfg_if! {
            if #[cfg(not(feature = "minpack-compat"))] {
                if self.residuals_norm <= F::min_positive_value() {
                    // already zero, nothing to do
                    return Ok(self.finish(MpStatus::ChiSquareConverged, None));
                }
            }
        }
        loop {
            let jacobian = self.jacobian()?;
            let mut lls = PivotedQR::new(jacobian)?
                .into_damped_least_squares(self.residuals.clone());
            if let Some(status) = self.update_diag(&mut lls)? {
                return Ok(self.finish(status, Some(&lls)));
            }
            if let Some(status) = self.step(&mut lls)? {
                return Ok(self.finish(status, Some(&lls)));
            }
        }
    }

    /// Jacobian of the free parameters with the columns of pegged
    /// parameters set to zero.
    fn jacobian(&mut self) -> Result<DMatrix<F>> {
        let mut jacobian = fdjac::jacobian(
            self.config,
            &mut *self.target,
            &self.xall,
            &self.residuals,
            &self.specs,
            &self.free,
            &mut self.evaluations,
        )?;
        if self.any_limits {
            for (j, &i) in self.free.iter().enumerate() {
                let spec = &self.specs[i];
                let at_lower = spec.is_at_lower(self.x[j]);
                let at_upper = spec.is_at_upper(self.x[j]);
                if !at_lower && !at_upper {
                    continue;
                }
                // the descent direction of chi^2 is -J^T r
                let slope = jacobian.column(j).dot(&self.residuals);
                if (at_lower && slope > F::zero()) || (at_upper && slope < F::zero()) {
                    jacobian.column_mut(j).fill(F::zero());
                }
            }
        }
        Ok(jacobian)
    }

    /// Test the gradient and initialize or update the scaling.
    fn update_diag(&mut self, lls: &mut DampedLeastSquares<F>) -> Result<Option<MpStatus>> {
        self.gnorm = if self.residuals_norm.is_zero() {
            F::zero()
        } else {
            match lls.max_scaled_correlation(self.residuals_norm) {
                Some(gnorm) => gnorm,
                None => {
                    cfg_if! {
                        if #[cfg(feature = "minpack-compat")] {
                            // MINPACK's max ignores NaN
                            F::zero()
                        } else {
                            return Err(non_finite("Jacobian", &self.xall));
                        }
                    }
                }
            }
        };
        if self.gnorm <= self.config.gtol {
            return Ok(Some(MpStatus::Orthogonal));
        }

        let column_norms = lls.column_norms();
        if self.first_update {
            if self.config.scale_diag {
                for (d, norm) in self.diag.iter_mut().zip(column_norms.iter()) {
                    *d = if norm.is_zero() { F::one() } else { *norm };
                }
            }
            self.xnorm = enorm(self.diag.iter().zip(self.x.iter()).map(|(d, x)| *d * *x));
            if !Float::is_finite(self.xnorm) {
                return Err(non_finite("scaled parameters", &self.xall));
            }
            self.delta = if self.xnorm.is_zero() {
                self.config.step_factor
            } else {
                self.config.step_factor * self.xnorm
            };
            self.first_update = false;
        } else if self.config.scale_diag {
            for (d, norm) in self.diag.iter_mut().zip(column_norms.iter()) {
                *d = Float::max(*d, *norm);
            }
        }
        Ok(None)
    }

    /// Inner iteration: try steps until one is accepted or a test fires.
    fn step(&mut self, lls: &mut DampedLeastSquares<F>) -> Result<Option<MpStatus>> {
        let p1: F = convert(0.1);
        let p5: F = convert(0.5);
        let p25: F = convert(0.25);
        let p75: F = convert(0.75);
        let p0001: F = convert(1e-4);
        let nfree = self.free.len();

        loop {
            let param = lmpar::determine_lambda_and_parameter_update(
                lls,
                &self.diag,
                self.delta,
                self.lambda,
            );
            self.lambda = param.lambda;
            let mut step = -param.step;

            let mut alpha = F::one();
            let candidate = if self.any_limits {
                for (j, &i) in self.free.iter().enumerate() {
                    let spec = &self.specs[i];
                    if (spec.is_at_lower(self.x[j]) && step[j] < F::zero())
                        || (spec.is_at_upper(self.x[j]) && step[j] > F::zero())
                    {
                        step[j] = F::zero();
                    }
                }
                for (j, &i) in self.free.iter().enumerate() {
                    if step[j].is_zero() {
                        continue;
                    }
                    let spec = &self.specs[i];
                    let target = self.x[j] + step[j];
                    if let Some(lower) = spec.lower.filter(|lower| target < *lower) {
                        alpha = Float::min(alpha, (lower - self.x[j]) / step[j]);
                    }
                    if let Some(upper) = spec.upper.filter(|upper| target > *upper) {
                        alpha = Float::min(alpha, (upper - self.x[j]) / step[j]);
                    }
                }
                step *= alpha;
                let mut candidate = &self.x + &step;
                // snap onto limits which are hit up to round-off
                for (j, &i) in self.free.iter().enumerate() {
                    let spec = &self.specs[i];
                    if let Some(upper) = spec.upper {
                        let sign = if upper >= F::zero() { F::one() } else { -F::one() };
                        if candidate[j] >= upper * (F::one() - sign * epsmch()) {
                            candidate[j] = upper;
                        }
                    }
                    if let Some(lower) = spec.lower {
                        let sign = if lower >= F::zero() { F::one() } else { -F::one() };
                        if candidate[j] <= lower * (F::one() + sign * epsmch()) {
                            candidate[j] = lower;
                        }
                    }
                }
                candidate
            } else {
                &self.x + &step
            };

            let pnorm = enorm((0..nfree).map(|j| self.diag[j] * step[j]));
            if !Float::is_finite(pnorm) {
                return Err(non_finite("step", &self.xall));
            }
            // at the first iteration, adjust the initial step bound
            if self.iterations == 0 {
                self.delta = Float::min(self.delta, pnorm);
            }

            let mut xall = self.xall.clone();
            for (j, &i) in self.free.iter().enumerate() {
                xall[i] = candidate[j];
            }
            let residuals = evaluate(&mut *self.target, &mut self.evaluations, &xall)?;
            if residuals.len() != self.residuals.len() {
                return Err(MinimizationError::evaluation_failed(
                    "number of residuals changed",
                    &to_f64(&xall),
                    None,
                ));
            }
            let new_norm = enorm(residuals.iter().copied());
            if !Float::is_finite(new_norm) {
                return Err(non_finite("residuals", &xall));
            }

            // compute predicted and actual reduction
            let actual_reduction = if p1 * new_norm < self.residuals_norm {
                F::one() - Float::powi(new_norm / self.residuals_norm, 2)
            } else {
                -F::one()
            };
            let temp1 = lls.product_norm(&step) * alpha / self.residuals_norm;
            let temp2 = Float::sqrt(alpha * self.lambda) * pnorm / self.residuals_norm;
            let predicted_reduction = temp1 * temp1 + temp2 * temp2 / p5;
            let directional_derivative = -(temp1 * temp1 + temp2 * temp2);
            let ratio = if predicted_reduction.is_zero() {
                F::zero()
            } else {
                actual_reduction / predicted_reduction
            };

            // update the step bound
            if ratio <= p25 {
                let mut temp = if actual_reduction >= F::zero() {
                    p5
                } else {
                    p5 * directional_derivative
                        / (directional_derivative + p5 * actual_reduction)
                };
                if p1 * new_norm >= self.residuals_norm || temp < p1 {
                    temp = p1;
                }
                self.delta = temp * Float::min(self.delta, pnorm / p1);
                self.lambda = self.lambda / temp;
            } else if self.lambda.is_zero() || ratio >= p75 {
                self.delta = pnorm / p5;
                self.lambda = p5 * self.lambda;
            }

            let accepted = ratio >= p0001;
            if accepted {
                self.x = candidate;
                self.xall = xall;
                self.residuals = residuals;
                self.residuals_norm = new_norm;
                self.xnorm = enorm(self.diag.iter().zip(self.x.iter()).map(|(d, x)| *d * *x));
                self.iterations += 1;
                debug!(
                    "iteration {}: chi^2 {:e}, ratio {:e}, delta {:e}",
                    self.iterations,
                    Float::powi(new_norm, 2).to_f64().unwrap_or(f64::NAN),
                    ratio.to_f64().unwrap_or(f64::NAN),
                    self.delta.to_f64().unwrap_or(f64::NAN)
                );
            }

            // convergence tests
            cfg_if! {
                if #[cfg(not(feature = "minpack-compat"))] {
                    if self.residuals_norm <= F::min_positive_value() {
                        return Ok(Some(MpStatus::ChiSquareConverged));
                    }
                }
            }
            let ftol_reached = Float::abs(actual_reduction) <= self.config.ftol
                && predicted_reduction <= self.config.ftol
                && p5 * ratio <= F::one();
            let xtol_reached = self.delta <= self.config.xtol * self.xnorm;
            match (ftol_reached, xtol_reached) {
                (true, true) => return Ok(Some(MpStatus::BothConverged)),
                (true, false) => return Ok(Some(MpStatus::ChiSquareConverged)),
                (false, true) => return Ok(Some(MpStatus::ParametersConverged)),
                (false, false) => {}
            }

            // termination tests
            if self.iterations >= self.config.maximum_iterations
                || self
                    .config
                    .maximum_evaluations
                    .map_or(false, |max| self.evaluations >= max)
            {
                return Ok(Some(MpStatus::MaximumIterations));
            }
            if Float::abs(actual_reduction) <= epsmch()
                && predicted_reduction <= epsmch()
                && p5 * ratio <= F::one()
            {
                return Ok(Some(MpStatus::FtolTooSmall));
            }
            if self.delta <= epsmch::<F>() * self.xnorm {
                return Ok(Some(MpStatus::XtolTooSmall));
            }
            if self.gnorm <= epsmch() {
                return Ok(Some(MpStatus::GtolTooSmall));
            }

            if accepted {
                return Ok(None);
            }
        }
    }

    fn finish(self, status: MpStatus, lls: Option<&DampedLeastSquares<F>>) -> MpResult<F> {
        let n = self.xall.len();
        let mut covariance = DMatrix::zeros(n, n);
        if let Some(lls) = lls {
            let free_covariance = covar::covariance(lls.r(), lls.permutation(), self.config.covtol);
            for (a, &i) in self.free.iter().enumerate() {
                for (b, &j) in self.free.iter().enumerate() {
                    covariance[(i, j)] = free_covariance[(a, b)];
                }
            }
        }
        let parameter_errors = covariance
            .diagonal()
            .map(|c| Float::sqrt(Float::max(c, F::zero())));
        let pegged_parameters = self
            .free
            .iter()
            .enumerate()
            .filter(|&(j, &i)| {
                self.specs[i].is_at_lower(self.x[j]) || self.specs[i].is_at_upper(self.x[j])
            })
            .count();
        debug!(
            "finished with status {:?} after {} iterations and {} evaluations",
            status, self.iterations, self.evaluations
        );
        MpResult {
            parameters: self.xall,
            best_norm: self.residuals_norm * self.residuals_norm,
            original_norm: self.original_norm,
            iterations: self.iterations,
            evaluations: self.evaluations,
            status,
            free_parameters: self.free.len(),
            pegged_parameters,
            residuals: self.residuals,
            parameter_errors,
            covariance,
        }
    }
}
