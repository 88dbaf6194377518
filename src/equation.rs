use nalgebra::{DMatrix, DVector};

use crate::error::{MinimizationError, Result};
use crate::lm::LevenbergMarquardtMinimizer;
use crate::problem::{ModelFunction, ObjectiveModel, ParameterConstraints};
use crate::result::NonlinearMinimizationResult;

/// A convenience trait to fit the coefficients of a scalar equation
/// `$y = f(\vec{w}, x)$` with [`LevenbergMarquardtMinimizer`].
///
/// For example:
///
/// ```
/// # use approx::assert_relative_eq;
/// use numopt::Equation;
///
/// struct Problem;
///
/// impl Equation<2> for Problem {
///     fn equation(&self, ws: &[f64; 2], x: f64) -> f64 {
///         // This is our equation; we want to find the coefficients `ws`.
///         ws[0] * 2.0 * x + ws[1] * 0.5 * x.powi(2)
///     }
///
///     fn derivatives(&self, _ws: &[f64; 2], x: f64) -> [f64; 2] {
///         // These are the partial derivatives of our equation, one for each coefficient.
///         [2.0 * x, 0.5 * x.powi(2)]
///     }
/// }
///
/// // Let's pick some coefficients...
/// let ws = [1.33, 0.66];
///
/// // ...and generate some data...
/// let xs = [1.0, 10.0, 100.0];
/// let ys = xs.map(|x| Problem.equation(&ws, x));
///
/// // Now we can run the LM algorithm to calculate the coefficients from the data.
/// let ([w0, w1], _) = Problem.least_squares_fit(&xs, &ys, [1.5, 1.0]).unwrap();
///
/// // They're the same as what we've picked!
/// assert_relative_eq!(w0, 1.33, epsilon = 1e-9);
/// assert_relative_eq!(w1, 0.66, epsilon = 1e-9);
/// ```
pub trait Equation<const N_PARAMS: usize> {
    /// The equation for which we want to find the coefficients `ws`.
    fn equation(&self, ws: &[f64; N_PARAMS], x: f64) -> f64;

    /// The partial derivatives of the equation with respect to the coefficients `ws`.
    fn derivatives(&self, ws: &[f64; N_PARAMS], x: f64) -> [f64; N_PARAMS];

    /// Sample this equation at `xs` as a [`ModelFunction`].
    fn as_model<'a>(&'a self, xs: &'a [f64]) -> impl ModelFunction + 'a
    where
        Self: Sized,
    {
        struct Sampled<'a, const N_PARAMS: usize, E> {
            equation: &'a E,
            xs: &'a [f64],
        }

        impl<const N_PARAMS: usize, E: Equation<N_PARAMS>> Sampled<'_, N_PARAMS, E> {
            fn coefficients(parameters: &DVector<f64>) -> Option<[f64; N_PARAMS]> {
                parameters.as_slice().try_into().ok()
            }
        }

        impl<const N_PARAMS: usize, E: Equation<N_PARAMS>> ModelFunction for Sampled<'_, N_PARAMS, E> {
            fn values(&self, parameters: &DVector<f64>) -> Option<DVector<f64>> {
                let ws = Self::coefficients(parameters)?;
                Some(DVector::from_iterator(
                    self.xs.len(),
                    self.xs.iter().map(|&x| self.equation.equation(&ws, x)),
                ))
            }

            fn jacobian(&self, parameters: &DVector<f64>) -> Option<DMatrix<f64>> {
                let ws = Self::coefficients(parameters)?;
                let mut jacobian = DMatrix::zeros(self.xs.len(), N_PARAMS);
                for (i, &x) in self.xs.iter().enumerate() {
                    for (j, derivative) in self.equation.derivatives(&ws, x).into_iter().enumerate() {
                        jacobian[(i, j)] = derivative;
                    }
                }
                Some(jacobian)
            }

            fn is_jacobian_supported(&self) -> bool {
                true
            }
        }

        Sampled::<N_PARAMS, Self> { equation: self, xs }
    }

    /// Fit the coefficients to the points `(xs[i], ys[i])` starting from `initial_guess`.
    ///
    /// Equivalent to the following code:
    ///
    /// ```
    /// # use nalgebra::DVector;
    /// # use numopt::{Equation, LevenbergMarquardtMinimizer, ObjectiveModel, ParameterConstraints};
    /// # struct Problem;
    /// # impl Equation<2> for Problem {
    /// #     fn equation(&self, ws: &[f64; 2], x: f64) -> f64 { ws[0] + ws[1] * x }
    /// #     fn derivatives(&self, _ws: &[f64; 2], x: f64) -> [f64; 2] { [1.0, x] }
    /// # }
    /// # let (xs, ys, initial_guess) = ([0.0, 1.0], [1.0, 3.0], [0.0, 0.0]);
    /// let model = Problem.as_model(&xs);
    /// let mut objective = ObjectiveModel::new(&model, DVector::from_row_slice(&ys));
    /// let result = LevenbergMarquardtMinimizer::new().find_minimum(
    ///     &mut objective,
    ///     &DVector::from_row_slice(&initial_guess),
    ///     &ParameterConstraints::new(),
    /// );
    /// # assert!(result.is_ok());
    /// ```
    ///
    /// # Errors
    ///
    /// `InvalidInput` if `xs` and `ys` differ in length, otherwise the errors
    /// of [`LevenbergMarquardtMinimizer::find_minimum`].
    fn least_squares_fit(
        &self,
        xs: &[f64],
        ys: &[f64],
        initial_guess: [f64; N_PARAMS],
    ) -> Result<([f64; N_PARAMS], NonlinearMinimizationResult)>
    where
        Self: Sized,
    {
        if xs.len() != ys.len() {
            return Err(MinimizationError::invalid_input(format!(
                "{} abscissae but {} observations",
                xs.len(),
                ys.len()
            )));
        }
        let model = self.as_model(xs);
        let mut objective = ObjectiveModel::new(&model, DVector::from_row_slice(ys));
        let result = LevenbergMarquardtMinimizer::new().find_minimum(
            &mut objective,
            &DVector::from_row_slice(&initial_guess),
            &ParameterConstraints::new(),
        )?;
        let mut ws = [0.0; N_PARAMS];
        ws.copy_from_slice(result.minimizing_point.as_slice());
        Ok((ws, result))
    }
}
