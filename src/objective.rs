//! Objective functions and their lazily cached evaluations.
use nalgebra::{DMatrix, DVector};

use crate::error::{MinimizationError, Result};

/// A scalar function of a parameter vector, optionally with derivatives.
///
/// Returning `None` from any method signals that the computation failed at
/// the given point. Minimizers turn that into
/// [`MinimizationError::EvaluationFailed`].
///
/// The capability flags must agree with the methods that are implemented:
/// a minimizer never calls `gradient` unless `is_gradient_supported` is `true`.
pub trait ObjectiveFunction {
    /// Compute `$f(\vec{x})$`.
    fn value(&self, point: &DVector<f64>) -> Option<f64>;

    /// Compute `$\nabla f(\vec{x})$`.
    fn gradient(&self, _point: &DVector<f64>) -> Option<DVector<f64>> {
        None
    }

    /// Compute `$\nabla^2 f(\vec{x})$`.
    fn hessian(&self, _point: &DVector<f64>) -> Option<DMatrix<f64>> {
        None
    }

    fn is_gradient_supported(&self) -> bool {
        false
    }

    fn is_hessian_supported(&self) -> bool {
        false
    }
}

impl<O: ObjectiveFunction + ?Sized> ObjectiveFunction for &O {
    fn value(&self, point: &DVector<f64>) -> Option<f64> {
        (**self).value(point)
    }

    fn gradient(&self, point: &DVector<f64>) -> Option<DVector<f64>> {
        (**self).gradient(point)
    }

    fn hessian(&self, point: &DVector<f64>) -> Option<DMatrix<f64>> {
        (**self).hessian(point)
    }

    fn is_gradient_supported(&self) -> bool {
        (**self).is_gradient_supported()
    }

    fn is_hessian_supported(&self) -> bool {
        (**self).is_hessian_supported()
    }
}

/// Objective built from a value closure only.
#[derive(Clone, Copy)]
pub struct ValueObjective<F> {
    f: F,
}

/// Objective built from value and gradient closures.
#[derive(Clone, Copy)]
pub struct GradientObjective<F, G> {
    f: F,
    g: G,
}

/// Objective built from value, gradient and Hessian closures.
#[derive(Clone, Copy)]
pub struct HessianObjective<F, G, H> {
    f: F,
    g: G,
    h: H,
}

/// Create an objective that only provides values.
///
/// Suitable for the derivative-free minimizers.
pub fn value<F>(f: F) -> ValueObjective<F>
where
    F: Fn(&DVector<f64>) -> f64,
{
    ValueObjective { f }
}

/// Create an objective with an analytic gradient.
///
/// ```
/// use nalgebra::DVector;
/// use numopt::{objective, BfgsMinimizer};
///
/// let f = objective::gradient(
///     |x: &DVector<f64>| (x[0] - 1.0).powi(2) + (x[1] - 2.0).powi(2),
///     |x: &DVector<f64>| DVector::from_vec(vec![2.0 * (x[0] - 1.0), 2.0 * (x[1] - 2.0)]),
/// );
/// let result = BfgsMinimizer::new()
///     .find_minimum(&f, &DVector::zeros(2))
///     .unwrap();
/// assert!((result.minimizing_point[0] - 1.0).abs() < 1e-6);
/// ```
pub fn gradient<F, G>(f: F, g: G) -> GradientObjective<F, G>
where
    F: Fn(&DVector<f64>) -> f64,
    G: Fn(&DVector<f64>) -> DVector<f64>,
{
    GradientObjective { f, g }
}

/// Create an objective with analytic gradient and Hessian.
pub fn hessian<F, G, H>(f: F, g: G, h: H) -> HessianObjective<F, G, H>
where
    F: Fn(&DVector<f64>) -> f64,
    G: Fn(&DVector<f64>) -> DVector<f64>,
    H: Fn(&DVector<f64>) -> DMatrix<f64>,
{
    HessianObjective { f, g, h }
}

impl<F> ObjectiveFunction for ValueObjective<F>
where
    F: Fn(&DVector<f64>) -> f64,
{
    fn value(&self, point: &DVector<f64>) -> Option<f64> {
        Some((self.f)(point))
    }
}

impl<F, G> ObjectiveFunction for GradientObjective<F, G>
where
    F: Fn(&DVector<f64>) -> f64,
    G: Fn(&DVector<f64>) -> DVector<f64>,
{
    fn value(&self, point: &DVector<f64>) -> Option<f64> {
        Some((self.f)(point))
    }

    fn gradient(&self, point: &DVector<f64>) -> Option<DVector<f64>> {
        Some((self.g)(point))
    }

    fn is_gradient_supported(&self) -> bool {
        true
    }
}

impl<F, G, H> ObjectiveFunction for HessianObjective<F, G, H>
where
    F: Fn(&DVector<f64>) -> f64,
    G: Fn(&DVector<f64>) -> DVector<f64>,
    H: Fn(&DVector<f64>) -> DMatrix<f64>,
{
    fn value(&self, point: &DVector<f64>) -> Option<f64> {
        Some((self.f)(point))
    }

    fn gradient(&self, point: &DVector<f64>) -> Option<DVector<f64>> {
        Some((self.g)(point))
    }

    fn hessian(&self, point: &DVector<f64>) -> Option<DMatrix<f64>> {
        Some((self.h)(point))
    }

    fn is_gradient_supported(&self) -> bool {
        true
    }

    fn is_hessian_supported(&self) -> bool {
        true
    }
}

/// An objective bound to a point, caching what has been computed there.
///
/// The caches are only valid for the current point. [`evaluate_at`](Self::evaluate_at)
/// rebinds the point and drops all of them. Two code paths that need a
/// "before" and an "after" state each hold their own `Evaluation`; use
/// [`fork`](Self::fork) to take an independent snapshot.
pub struct Evaluation<'a, O: ?Sized> {
    objective: &'a O,
    point: DVector<f64>,
    value: Option<f64>,
    gradient: Option<DVector<f64>>,
    hessian: Option<DMatrix<f64>>,
    evaluations: usize,
}

impl<'a, O: ?Sized> Clone for Evaluation<'a, O> {
    fn clone(&self) -> Self {
        Self {
            objective: self.objective,
            point: self.point.clone(),
            value: self.value,
            gradient: self.gradient.clone(),
            hessian: self.hessian.clone(),
            evaluations: self.evaluations,
        }
    }
}

impl<'a, O: ObjectiveFunction + ?Sized> Evaluation<'a, O> {
    pub fn new(objective: &'a O, point: DVector<f64>) -> Self {
        Self {
            objective,
            point,
            value: None,
            gradient: None,
            hessian: None,
            evaluations: 0,
        }
    }

    /// Move to a new point, invalidating all cached quantities.
    pub fn evaluate_at(&mut self, point: DVector<f64>) {
        self.point = point;
        self.value = None;
        self.gradient = None;
        self.hessian = None;
    }

    /// A new, empty evaluation of the same objective at `point`.
    pub fn at(&self, point: DVector<f64>) -> Self {
        Self::new(self.objective, point)
    }

    /// An independent deep copy of this evaluation, caches included.
    pub fn fork(&self) -> Self {
        self.clone()
    }

    pub fn point(&self) -> &DVector<f64> {
        &self.point
    }

    pub fn objective(&self) -> &'a O {
        self.objective
    }

    /// Number of user calls (value, gradient or Hessian) made through this evaluation.
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    pub fn is_gradient_supported(&self) -> bool {
        self.objective.is_gradient_supported()
    }

    pub fn is_hessian_supported(&self) -> bool {
        self.objective.is_hessian_supported()
    }

    pub fn value(&mut self) -> Result<f64> {
        if let Some(value) = self.value {
            return Ok(value);
        }
        self.evaluations += 1;
        let value = self.objective.value(&self.point).ok_or_else(|| {
            MinimizationError::evaluation_failed("objective returned no value", &self.point, None)
        })?;
        self.value = Some(value);
        Ok(value)
    }

    pub fn gradient(&mut self) -> Result<&DVector<f64>> {
        if !self.objective.is_gradient_supported() {
            return Err(MinimizationError::IncompatibleObjective {
                capability: "gradient",
            });
        }
        let gradient = match self.gradient.take() {
            Some(gradient) => gradient,
            None => {
                self.evaluations += 1;
                let gradient = self.objective.gradient(&self.point).ok_or_else(|| {
                    MinimizationError::evaluation_failed(
                        "objective returned no gradient",
                        &self.point,
                        self.value,
                    )
                })?;
                if gradient.len() != self.point.len() {
                    return Err(MinimizationError::evaluation_failed(
                        format!(
                            "gradient has {} entries, expected {}",
                            gradient.len(),
                            self.point.len()
                        ),
                        &self.point,
                        self.value,
                    ));
                }
                gradient
            }
        };
        Ok(self.gradient.insert(gradient))
    }

    pub fn hessian(&mut self) -> Result<&DMatrix<f64>> {
        if !self.objective.is_hessian_supported() {
            return Err(MinimizationError::IncompatibleObjective {
                capability: "Hessian",
            });
        }
        let hessian = match self.hessian.take() {
            Some(hessian) => hessian,
            None => {
                self.evaluations += 1;
                let hessian = self.objective.hessian(&self.point).ok_or_else(|| {
                    MinimizationError::evaluation_failed(
                        "objective returned no Hessian",
                        &self.point,
                        self.value,
                    )
                })?;
                let n = self.point.len();
                if hessian.shape() != (n, n) {
                    return Err(MinimizationError::evaluation_failed(
                        format!("Hessian has shape {:?}, expected ({n}, {n})", hessian.shape()),
                        &self.point,
                        self.value,
                    ));
                }
                hessian
            }
        };
        Ok(self.hessian.insert(hessian))
    }
}

/// Fail with [`MinimizationError::EvaluationFailed`] if the value or the
/// gradient at the current point are not finite.
pub fn validate_value_and_gradient<O>(evaluation: &mut Evaluation<'_, O>) -> Result<()>
where
    O: ObjectiveFunction + ?Sized,
{
    let value = evaluation.value()?;
    if !value.is_finite() {
        return Err(MinimizationError::evaluation_failed(
            "non-finite objective function returned",
            evaluation.point(),
            Some(value),
        ));
    }
    if evaluation.gradient()?.iter().any(|g| !g.is_finite()) {
        return Err(MinimizationError::evaluation_failed(
            "non-finite gradient returned",
            evaluation.point(),
            Some(value),
        ));
    }
    Ok(())
}
