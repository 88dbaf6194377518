use approx::assert_relative_eq;
use nalgebra::{DMatrix, DVector};

use super::test_helpers::{MockCall, MockProblem};
use super::{fdjac, MpFit, MpFunction, MpStatus, ParameterSpec, Side};
use crate::error::MinimizationError;

/// Straight line `$y = p_0 x + p_1$` through `(0, 1), (1, 3), (2, 5), (3, 7)`.
struct Line {
    params: DVector<f64>,
}

impl Line {
    fn new() -> Self {
        Self {
            params: DVector::zeros(2),
        }
    }
}

impl MpFunction<f64> for Line {
    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.copy_from(x);
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        Some(DVector::from_fn(4, |i, _| {
            let x = i as f64;
            self.params[0] * x + self.params[1] - (2. * x + 1.)
        }))
    }
}

struct Rosenbrock {
    params: DVector<f64>,
}

impl MpFunction<f64> for Rosenbrock {
    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.copy_from(x);
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let p = &self.params;
        Some(DVector::from_vec(vec![10. * (p[1] - p[0] * p[0]), 1. - p[0]]))
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let p = &self.params;
        Some(DMatrix::from_row_slice(2, 2, &[-20. * p[0], 10., -1., 0.]))
    }
}

#[test]
fn unconstrained_line() {
    let result = MpFit::new()
        .fit(&mut Line::new(), DVector::zeros(2), &[])
        .unwrap();
    assert_relative_eq!(result.parameters, DVector::from_vec(vec![2., 1.]), epsilon = 1e-7);
    assert!(result.best_norm < 1e-12);
    assert_eq!(result.pegged_parameters, 0);
    assert!(result.evaluations > result.iterations);
}

#[test]
fn pegged_at_upper_limit() {
    let specs = [ParameterSpec::new().with_upper_limit(1.5), ParameterSpec::new()];
    let result = MpFit::new()
        .fit(&mut Line::new(), DVector::zeros(2), &specs)
        .unwrap();
    assert_eq!(result.parameters[0], 1.5);
    // best intercept for the clamped slope
    assert_relative_eq!(result.parameters[1], 1.75, epsilon = 1e-6);
    assert_relative_eq!(result.best_norm, 1.25, epsilon = 1e-9);
    assert_eq!(result.pegged_parameters, 1);
    assert_eq!(result.free_parameters, 2);
}

#[test]
fn limit_truncates_step() {
    let specs = [
        ParameterSpec::new()
            .with_upper_limit(0.5)
            .with_side(Side::Analytic),
        ParameterSpec::new().with_side(Side::Analytic),
    ];
    let mut problem = Rosenbrock {
        params: DVector::zeros(2),
    };
    let result = MpFit::new()
        .with_maximum_iterations(500)
        .fit(&mut problem, DVector::from_vec(vec![-1.2, 1.]), &specs)
        .unwrap();
    assert!(result.parameters[0] <= 0.5);
    assert_relative_eq!(result.parameters, DVector::from_vec(vec![0.5, 0.25]), epsilon = 1e-6);
    assert_relative_eq!(result.best_norm, 0.25, epsilon = 1e-9);
    assert_eq!(result.pegged_parameters, 1);
}

#[test]
fn fixed_parameter() {
    let specs = [ParameterSpec::new(), ParameterSpec::new().with_fixed(true)];
    let result = MpFit::new()
        .fit(&mut Line::new(), DVector::from_vec(vec![1., 0.]), &specs)
        .unwrap();
    assert_eq!(result.parameters[1], 0.);
    assert_relative_eq!(result.parameters[0], 34. / 14., epsilon = 1e-7);
    assert_eq!(result.free_parameters, 1);
    assert_eq!(result.parameter_errors[1], 0.);
    assert_eq!(result.covariance[(0, 1)], 0.);
    // 1 / sum x^2
    assert_relative_eq!(result.covariance[(0, 0)], 1. / 14., epsilon = 1e-6);
}

#[test]
fn iteration_budget() {
    let mut problem = Rosenbrock {
        params: DVector::zeros(2),
    };
    let result = MpFit::new()
        .with_maximum_iterations(1)
        .fit(&mut problem, DVector::from_vec(vec![-1.2, 1.]), &[])
        .unwrap();
    assert_eq!(result.status, MpStatus::MaximumIterations);
    assert_eq!(result.status.code(), 5);
    assert_eq!(result.iterations, 1);

    let result = MpFit::new()
        .with_maximum_evaluations(5)
        .fit(&mut problem, DVector::from_vec(vec![-1.2, 1.]), &[])
        .unwrap();
    assert_eq!(result.status, MpStatus::MaximumIterations);
    assert!(result.evaluations >= 5);
}

fn difference(
    spec: ParameterSpec<f64>,
    x: f64,
    perturbed: f64,
) -> (DMatrix<f64>, Vec<DVector<f64>>, usize) {
    let mut problem = MockProblem::new(vec![Some(DVector::from_element(1, perturbed))]);
    let mut evaluations = 0;
    let jacobian = fdjac::jacobian(
        &MpFit::new(),
        &mut problem,
        &DVector::from_element(1, x),
        &DVector::from_element(1, 1.),
        &[spec],
        &[0],
        &mut evaluations,
    )
    .unwrap();
    (jacobian, problem.params.clone(), evaluations)
}

#[test]
fn relative_step() {
    let spec = ParameterSpec::new().with_relative_step(0.1);
    let (jacobian, params, evaluations) = difference(spec, 2., 1.2);
    assert_eq!(evaluations, 1);
    assert_relative_eq!(params[0][0], 2.2);
    assert_relative_eq!(jacobian[(0, 0)], 1., epsilon = 1e-12);
}

#[test]
fn absolute_step() {
    let spec = ParameterSpec::new().with_step(0.5);
    let (jacobian, params, _) = difference(spec, 2., 2.);
    assert_relative_eq!(params[0][0], 2.5);
    assert_relative_eq!(jacobian[(0, 0)], 2., epsilon = 1e-12);
}

#[test]
fn forward_difference_turns_at_upper_limit() {
    let spec = ParameterSpec::new()
        .with_relative_step(0.1)
        .with_upper_limit(2.);
    let (jacobian, params, _) = difference(spec, 2., 0.8);
    assert_relative_eq!(params[0][0], 1.8);
    assert_relative_eq!(jacobian[(0, 0)], 1., epsilon = 1e-12);
}

#[test]
fn backward_difference() {
    let spec = ParameterSpec::new()
        .with_relative_step(0.1)
        .with_side(Side::Backward);
    let (_, params, _) = difference(spec, 2., 0.8);
    assert_relative_eq!(params[0][0], 1.8);

    // a lower limit within one step turns it forward
    let spec = spec.with_lower_limit(1.9);
    let (_, params, _) = difference(spec, 2., 1.2);
    assert_relative_eq!(params[0][0], 2.2);
}

#[test]
fn two_sided_difference() {
    let mut problem = Line::new();
    let specs = [ParameterSpec::new().with_side(Side::TwoSided); 2];
    let residuals = DVector::from_vec(vec![-1., -3., -5., -7.]);
    let mut evaluations = 0;
    let jacobian = fdjac::jacobian(
        &MpFit::new(),
        &mut problem,
        &DVector::zeros(2),
        &residuals,
        &specs,
        &[0, 1],
        &mut evaluations,
    )
    .unwrap();
    assert_eq!(evaluations, 4);
    let expected = DMatrix::from_fn(4, 2, |i, j| if j == 0 { i as f64 } else { 1. });
    assert_relative_eq!(jacobian, expected, epsilon = 1e-6);
}

#[test]
fn analytic_jacobian_with_wrong_shape() {
    let mut problem = MockProblem::new(vec![Some(DVector::from_element(3, 1.))])
        .with_jacobians(vec![Some(DMatrix::zeros(3, 1))]);
    let specs = [ParameterSpec::new().with_side(Side::Analytic); 2];
    let err = MpFit::new()
        .fit(&mut problem, DVector::zeros(2), &specs)
        .unwrap_err();
    assert!(matches!(err, MinimizationError::EvaluationFailed { .. }));
    assert_eq!(
        problem.calls(),
        [
            MockCall::SetParams,
            MockCall::Residuals,
            MockCall::SetParams,
            MockCall::Jacobian
        ]
        .as_ref()
    );
}

#[test]
#[should_panic(expected = "step must be > 0")]
fn non_positive_step() {
    ParameterSpec::<f64>::new().with_step(0.);
}
