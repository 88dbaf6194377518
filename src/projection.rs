//! Smooth reparameterization of box-constrained parameters.
//!
//! The least-squares minimizers work on unconstrained internal coordinates
//! `$\vec{q}$`. Every parameter is mapped to its external (user) value
//! `$p = \phi(q)$` by a bijection onto its feasible interval, so any
//! internal point is feasible.
use nalgebra::{DMatrix, DVector};

use crate::error::{MinimizationError, Result};
use crate::problem::{ModelFunction, ObjectiveModel, ParameterConstraints};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mapping {
    /// `$p = l + \frac{u - l}{2}(\sin q + 1)$`
    Both { lower: f64, upper: f64 },
    /// `$p = l + s(\sqrt{q^2 + 1} - 1)$`
    Lower { lower: f64, scale: f64 },
    /// `$p = u - s(\sqrt{q^2 + 1} - 1)$`
    Upper { upper: f64, scale: f64 },
    /// `$p = sq$`
    Scaled { scale: f64 },
    Identity,
}

impl Mapping {
    fn to_external(self, q: f64) -> f64 {
        match self {
            Mapping::Both { lower, upper } => {
                (lower + (upper - lower) / 2.0 * (q.sin() + 1.0)).clamp(lower, upper)
            }
            Mapping::Lower { lower, scale } => {
                (lower + scale * ((q * q + 1.0).sqrt() - 1.0)).max(lower)
            }
            Mapping::Upper { upper, scale } => {
                (upper - scale * ((q * q + 1.0).sqrt() - 1.0)).min(upper)
            }
            Mapping::Scaled { scale } => scale * q,
            Mapping::Identity => q,
        }
    }

    fn to_internal(self, p: f64) -> f64 {
        match self {
            Mapping::Both { lower, upper } => {
                (2.0 * (p - lower) / (upper - lower) - 1.0).clamp(-1.0, 1.0).asin()
            }
            Mapping::Lower { lower, scale } => (((p - lower) / scale + 1.0).powi(2) - 1.0)
                .max(0.0)
                .sqrt(),
            Mapping::Upper { upper, scale } => (((upper - p) / scale + 1.0).powi(2) - 1.0)
                .max(0.0)
                .sqrt(),
            Mapping::Scaled { scale } => p / scale,
            Mapping::Identity => p,
        }
    }

    /// `$\mathrm{d}p/\mathrm{d}q$`
    fn jacobian_factor(self, q: f64) -> f64 {
        match self {
            Mapping::Both { lower, upper } => (upper - lower) / 2.0 * q.cos(),
            Mapping::Lower { scale, .. } => scale * q / (q * q + 1.0).sqrt(),
            Mapping::Upper { scale, .. } => -scale * q / (q * q + 1.0).sqrt(),
            Mapping::Scaled { scale } => scale,
            Mapping::Identity => 1.0,
        }
    }
}

/// The map between internal and external coordinates of a fit.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    mappings: Vec<Mapping>,
}

impl Projection {
    /// Build the projection for `constraints`, validating them against the
    /// initial guess.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if a bound, scale or mask has the wrong length, a
    /// lower bound is not below its upper bound, a scale is not positive, or
    /// the initial guess violates a bound.
    pub fn new(constraints: &ParameterConstraints, initial_guess: &DVector<f64>) -> Result<Self> {
        let n = initial_guess.len();
        let check_length = |name: &str, len: Option<usize>| match len {
            Some(len) if len != n => Err(MinimizationError::invalid_input(format!(
                "{name} has {len} entries, expected {n}"
            ))),
            _ => Ok(()),
        };
        check_length("lower bound", constraints.lower().map(|l| l.len()))?;
        check_length("upper bound", constraints.upper().map(|u| u.len()))?;
        check_length("scales", constraints.scales().map(|s| s.len()))?;
        check_length("fixed mask", constraints.is_fixed().map(|f| f.len()))?;

        let mut mappings = Vec::with_capacity(n);
        for i in 0..n {
            let p = initial_guess[i];
            let lower = constraints.lower().map_or(f64::NEG_INFINITY, |l| l[i]);
            let upper = constraints.upper().map_or(f64::INFINITY, |u| u[i]);
            let scale = constraints.scales().map(|s| s[i]);
            if !p.is_finite() {
                return Err(MinimizationError::invalid_input(format!(
                    "initial guess {p} for parameter {i} is not finite"
                )));
            }
            if lower.is_nan() || upper.is_nan() || lower >= upper {
                return Err(MinimizationError::invalid_input(format!(
                    "lower bound {lower} of parameter {i} is not below its upper bound {upper}"
                )));
            }
            if let Some(scale) = scale {
                if !(scale > 0.0 && scale.is_finite()) {
                    return Err(MinimizationError::invalid_input(format!(
                        "scale {scale} of parameter {i} is not positive"
                    )));
                }
            }
            if p < lower || p > upper {
                return Err(MinimizationError::invalid_input(format!(
                    "initial guess {p} for parameter {i} is outside [{lower}, {upper}]"
                )));
            }

            let scale_or_one = scale.unwrap_or(1.0);
            mappings.push(match (lower.is_finite(), upper.is_finite()) {
                (true, true) => Mapping::Both { lower, upper },
                (true, false) => Mapping::Lower {
                    lower,
                    scale: scale_or_one,
                },
                (false, true) => Mapping::Upper {
                    upper,
                    scale: scale_or_one,
                },
                (false, false) => match scale {
                    Some(scale) => Mapping::Scaled { scale },
                    None => Mapping::Identity,
                },
            });
        }
        Ok(Self { mappings })
    }

    pub fn is_identity(&self) -> bool {
        self.mappings.iter().all(|m| *m == Mapping::Identity)
    }

    pub fn to_internal(&self, external: &DVector<f64>) -> DVector<f64> {
        DVector::from_fn(external.len(), |i, _| self.mappings[i].to_internal(external[i]))
    }

    pub fn to_external(&self, internal: &DVector<f64>) -> DVector<f64> {
        DVector::from_fn(internal.len(), |i, _| self.mappings[i].to_external(internal[i]))
    }

    /// `$\mathrm{d}p_i/\mathrm{d}q_i$` at `internal`.
    pub fn jacobian_factors(&self, internal: &DVector<f64>) -> DVector<f64> {
        DVector::from_fn(internal.len(), |i, _| {
            self.mappings[i].jacobian_factor(internal[i])
        })
    }

    /// Evaluate `model` at the external image of `internal`.
    pub fn evaluate_function<M>(
        &self,
        model: &mut ObjectiveModel<'_, M>,
        internal: &DVector<f64>,
    ) -> Result<()>
    where
        M: ModelFunction + ?Sized,
    {
        model.evaluate_at(&self.to_external(internal))
    }

    /// Gradient and Hessian of `model` (evaluated at the external image of
    /// `internal`) with respect to the internal coordinates.
    pub fn evaluate_jacobian<M>(
        &self,
        model: &mut ObjectiveModel<'_, M>,
        internal: &DVector<f64>,
    ) -> Result<(DVector<f64>, DMatrix<f64>)>
    where
        M: ModelFunction + ?Sized,
    {
        let factors = self.jacobian_factors(internal);
        let is_fixed = model.is_fixed().to_vec();
        let (gradient, hessian) = model.gradient_and_hessian()?;
        let gradient = gradient.component_mul(&factors);
        let mut hessian = hessian.component_mul(&(&factors * factors.transpose()));
        for (j, fixed) in is_fixed.iter().enumerate() {
            if *fixed {
                hessian[(j, j)] = 1.0;
            }
        }
        Ok((gradient, hessian))
    }
}

/// Validate the constraints, prepare `model` and evaluate it at the
/// internal image of `initial_guess`.
///
/// Returns the projection and the internal starting point.
pub(crate) fn start_fit<M>(
    model: &mut ObjectiveModel<'_, M>,
    initial_guess: &DVector<f64>,
    constraints: &ParameterConstraints,
) -> Result<(Projection, DVector<f64>)>
where
    M: ModelFunction + ?Sized,
{
    let projection = Projection::new(constraints, initial_guess)?;
    model.set_parameters(initial_guess, constraints.is_fixed())?;
    let internal = projection.to_internal(initial_guess);
    if !projection.is_identity() {
        projection.evaluate_function(model, &internal)?;
    }
    Ok((projection, internal))
}

pub(crate) fn all_finite(gradient: &DVector<f64>, hessian: &DMatrix<f64>) -> bool {
    gradient.iter().chain(hessian.iter()).all(|v| v.is_finite())
}
