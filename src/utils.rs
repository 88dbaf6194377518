use nalgebra::{convert, DMatrix, DVector, RealField};
use num_traits::{Float, ToPrimitive};

use crate::problem::ModelFunction;

mod finite_difference;

use finite_difference::derivative;

/// Compute a [numerical approximation](https://en.wikipedia.org/wiki/Numerical_differentiation)
/// of the Jacobian of a model for testing.
///
/// The function is intended to be used for debugging or testing.
/// You can check the [`jacobian`](crate::ModelFunction::jacobian) of your
/// [`ModelFunction`](crate::ModelFunction) against it.
///
/// Computing the derivatives numerically is unstable: You can construct
/// functions where the computed result is catastrophically wrong. If you
/// observe large differences between the derivative computed by this function
/// and your implementation the reason _might_ be due to instability.
///
/// The achieved precision is lower than the floating point precision in
/// general, expect errors above `$10^{-15}$`.
///
/// # Example
///
/// ```
/// # use approx::assert_relative_eq;
/// use nalgebra::{DMatrix, DVector};
/// use numopt::{differentiate_numerically, ModelFunction};
///
/// struct Parabola;
///
/// impl ModelFunction for Parabola {
///     fn values(&self, p: &DVector<f64>) -> Option<DVector<f64>> {
///         Some(DVector::from_vec(vec![p[0] * p[0], p[0] * p[1]]))
///     }
///
///     fn jacobian(&self, p: &DVector<f64>) -> Option<DMatrix<f64>> {
///         Some(DMatrix::from_row_slice(2, 2, &[2. * p[0], 0., p[1], p[0]]))
///     }
/// }
///
/// let p = DVector::from_vec(vec![1.5, -2.]);
/// let numerical = differentiate_numerically(&Parabola, &p).unwrap();
/// assert_relative_eq!(numerical, Parabola.jacobian(&p).unwrap(), epsilon = 1e-10);
/// ```
pub fn differentiate_numerically<M>(model: &M, parameters: &DVector<f64>) -> Option<DMatrix<f64>>
where
    M: ModelFunction + ?Sized,
{
    let m = model.values(parameters)?.len();
    let n = parameters.len();
    let mut jacobian = DMatrix::zeros(m, n);
    for i in 0..m {
        for j in 0..n {
            jacobian[(i, j)] = derivative(parameters[j], |x| {
                let mut moved = parameters.clone();
                moved[j] = x;
                model.values(&moved).map(|values| values[i])
            })?;
        }
    }
    Some(jacobian)
}

/// Euclidean norm computed as in MINPACK's `enorm`.
///
/// Components are accumulated in three sums (small, intermediate and large
/// magnitudes) so that neither overflow nor destructive underflow occurs.
pub(crate) fn enorm<F, I>(v: I) -> F
where
    F: RealField + Float,
    I: IntoIterator<Item = F>,
    I::IntoIter: ExactSizeIterator,
{
    let iter = v.into_iter();
    let rdwarf: F = convert(3.834e-20f64);
    let rgiant: F = convert(1.304e19f64);
    let agiant = rgiant / convert(iter.len().max(1) as f64);

    let (mut s1, mut s2, mut s3) = (F::zero(), F::zero(), F::zero());
    let (mut x1max, mut x3max) = (F::zero(), F::zero());
    for xi in iter {
        let xabs = Float::abs(xi);
        if xabs > rdwarf && xabs < agiant {
            s2 += xabs * xabs;
        } else if xabs <= rdwarf {
            if xabs > x3max {
                s3 = F::one() + s3 * Float::powi(x3max / xabs, 2);
                x3max = xabs;
            } else if !xabs.is_zero() {
                s3 += Float::powi(xabs / x3max, 2);
            }
        } else if xabs > x1max {
            s1 = F::one() + s1 * Float::powi(x1max / xabs, 2);
            x1max = xabs;
        } else {
            s1 += Float::powi(xabs / x1max, 2);
        }
    }

    if !s1.is_zero() {
        x1max * Float::sqrt(s1 + (s2 / x1max) / x1max)
    } else if !s2.is_zero() {
        if s2 >= x3max {
            Float::sqrt(s2 * (F::one() + (x3max / s2) * (x3max * s3)))
        } else {
            Float::sqrt(x3max * ((s2 / x3max) + (x3max * s3)))
        }
    } else {
        x3max * Float::sqrt(s3)
    }
}

/// Machine precision of `F`.
#[inline]
pub(crate) fn epsmch<F: Float>() -> F {
    F::epsilon()
}

/// Lossy conversion for diagnostics, `NaN` where `F` has no `f64` value.
pub(crate) fn to_f64<F: ToPrimitive>(x: &DVector<F>) -> DVector<f64>
where
    F: nalgebra::Scalar,
{
    x.map(|xi| xi.to_f64().unwrap_or(f64::NAN))
}
