use approx::assert_relative_eq;
use nalgebra::{DMatrix, DVector};

use super::test_helpers::{MockCall, MockModel};
use super::LevenbergMarquardtMinimizer;
use crate::{
    CurveWithDerivative, ExitCondition, ModelFunction, ObjectiveModel, ParameterConstraints,
};

fn line(
    x: Vec<f64>,
) -> CurveWithDerivative<
    impl Fn(&DVector<f64>, f64) -> f64,
    impl Fn(&DVector<f64>, f64) -> DVector<f64>,
> {
    CurveWithDerivative::new(
        |p: &DVector<f64>, x: f64| p[0] * x + p[1],
        |_: &DVector<f64>, x: f64| DVector::from_vec(vec![x, 1.0]),
        DVector::from_vec(x),
    )
}

fn exponential(
    x: Vec<f64>,
) -> CurveWithDerivative<
    impl Fn(&DVector<f64>, f64) -> f64,
    impl Fn(&DVector<f64>, f64) -> DVector<f64>,
> {
    CurveWithDerivative::new(
        |p: &DVector<f64>, x: f64| p[0] * (p[1] * x).exp(),
        |p: &DVector<f64>, x: f64| {
            DVector::from_vec(vec![(p[1] * x).exp(), p[0] * x * (p[1] * x).exp()])
        },
        DVector::from_vec(x),
    )
}

#[test]
fn test_two_point_line() {
    let model = line(vec![0.0, 1.0]);
    let mut objective = ObjectiveModel::new(&model, DVector::from_vec(vec![1.0, 3.0]));
    let result = LevenbergMarquardtMinimizer::new()
        .find_minimum(&mut objective, &DVector::zeros(2), &ParameterConstraints::new())
        .unwrap();
    assert_relative_eq!(
        result.minimizing_point,
        DVector::from_vec(vec![2.0, 1.0]),
        epsilon = 1e-7
    );
    assert!(result.value < 1e-12);
    assert!(matches!(
        result.exit_condition,
        ExitCondition::Converged | ExitCondition::AbsoluteGradient
    ));
    // as many parameters as observations
    assert_eq!(result.degrees_of_freedom, 0);
    assert!(result.covariance.is_none());
}

#[test]
fn test_linear_fit_statistics() {
    let model = line(vec![0.0, 1.0, 2.0, 3.0]);
    let mut objective = ObjectiveModel::new(&model, DVector::from_vec(vec![1.0, 3.1, 4.9, 7.2]));
    let result = LevenbergMarquardtMinimizer::new()
        .find_minimum(&mut objective, &DVector::zeros(2), &ParameterConstraints::new())
        .unwrap();
    assert_relative_eq!(
        result.minimizing_point,
        DVector::from_vec(vec![2.04, 0.99]),
        epsilon = 1e-9
    );
    assert_relative_eq!(result.value, 0.042, epsilon = 1e-9);
    assert_eq!(result.degrees_of_freedom, 2);

    let covariance = result.covariance.unwrap();
    let expected = DMatrix::from_row_slice(2, 2, &[0.0042, -0.0063, -0.0063, 0.0147]);
    assert_relative_eq!(covariance, expected, epsilon = 1e-9);
    let standard_errors = result.standard_errors.unwrap();
    assert_relative_eq!(standard_errors[0], 0.0042f64.sqrt(), epsilon = 1e-9);
    let correlation = result.correlation.unwrap();
    assert_relative_eq!(correlation[(0, 0)], 1.0);
    assert_relative_eq!(
        correlation[(0, 1)],
        -0.0063 / (0.0042f64 * 0.0147).sqrt(),
        epsilon = 1e-7
    );
}

#[test]
fn test_exponential_decay() {
    let x = vec![0.0, 0.5, 1.0, 1.5, 2.0, 3.0];
    let model = exponential(x.clone());
    let observed = DVector::from_vec(x.iter().map(|x| 2.0 * (-0.7 * x).exp()).collect());
    let mut objective = ObjectiveModel::new(&model, observed);
    let result = LevenbergMarquardtMinimizer::new()
        .find_minimum(
            &mut objective,
            &DVector::from_vec(vec![1.0, 0.0]),
            &ParameterConstraints::new(),
        )
        .unwrap();
    assert_relative_eq!(
        result.minimizing_point,
        DVector::from_vec(vec![2.0, -0.7]),
        epsilon = 1e-6
    );
    assert!(result.iterations > 1);
}

#[test]
fn test_bounded_slope() {
    let model = line(vec![0.0, 1.0, 2.0, 3.0]);
    let mut objective = ObjectiveModel::new(&model, DVector::from_vec(vec![1.0, 3.0, 5.0, 7.0]));
    let constraints = ParameterConstraints::new()
        .with_lower_bound(DVector::from_vec(vec![0.0, f64::NEG_INFINITY]))
        .with_upper_bound(DVector::from_vec(vec![1.5, f64::INFINITY]));
    let result = LevenbergMarquardtMinimizer::new()
        .with_maximum_iterations(2000)
        .find_minimum(
            &mut objective,
            &DVector::from_vec(vec![0.5, 0.0]),
            &constraints,
        )
        .unwrap();
    let slope = result.minimizing_point[0];
    assert!(slope <= 1.5);
    assert_relative_eq!(slope, 1.5, epsilon = 1e-3);
    // best intercept for the clamped slope
    assert_relative_eq!(result.minimizing_point[1], 1.75, epsilon = 5e-3);
}

#[test]
fn test_fixed_intercept() {
    let model = line(vec![0.0, 1.0, 2.0, 3.0]);
    let mut objective = ObjectiveModel::new(&model, DVector::from_vec(vec![1.0, 3.0, 5.0, 7.0]));
    let constraints = ParameterConstraints::new().with_fixed(vec![false, true]);
    let result = LevenbergMarquardtMinimizer::new()
        .find_minimum(&mut objective, &DVector::from_vec(vec![1.0, 0.0]), &constraints)
        .unwrap();
    assert_eq!(result.minimizing_point[1], 0.0);
    assert_relative_eq!(result.minimizing_point[0], 34.0 / 14.0, epsilon = 1e-9);
    assert_eq!(result.degrees_of_freedom, 3);
    assert_eq!(result.standard_errors.unwrap()[1], 0.0);
}

#[test]
fn test_non_finite_trial_values() {
    let jacobian = DMatrix::identity(2, 2);
    let mut mock = MockModel::new(
        vec![
            Some(DVector::zeros(2)),
            Some(DVector::from_vec(vec![f64::NAN, 0.0])),
        ],
        vec![Some(jacobian)],
    );
    let result = {
        let mut objective = ObjectiveModel::new(&mock, DVector::from_element(2, 1.0));
        LevenbergMarquardtMinimizer::new()
            .find_minimum(&mut objective, &DVector::zeros(2), &ParameterConstraints::new())
            .unwrap()
    };
    assert_eq!(result.exit_condition, ExitCondition::InvalidValues);
    assert_eq!(result.iterations, 1);
    // the last accepted point is reported
    assert_eq!(result.minimizing_point, DVector::zeros(2));

    let calls = mock.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0], MockCall::Values(DVector::zeros(2)));
    assert_eq!(calls[1], MockCall::Jacobian(DVector::zeros(2)));
    assert!(matches!(&calls[2], MockCall::Values(p) if p[0] > 0.0 && p[1] > 0.0));
}

#[test]
fn test_non_finite_initial_values() {
    let mut mock = MockModel::new(vec![Some(DVector::from_vec(vec![f64::INFINITY, 0.0]))], vec![]);
    let result = {
        let mut objective = ObjectiveModel::new(&mock, DVector::zeros(2));
        LevenbergMarquardtMinimizer::new()
            .find_minimum(&mut objective, &DVector::zeros(2), &ParameterConstraints::new())
            .unwrap()
    };
    assert_eq!(result.exit_condition, ExitCondition::InvalidValues);
    assert_eq!(result.iterations, 0);
    assert_eq!(mock.calls().len(), 1);
}

#[test]
fn test_zero_iterations_only_evaluates() {
    let mut mock = MockModel::new(
        vec![Some(DVector::zeros(2))],
        vec![Some(DMatrix::identity(2, 2))],
    );
    assert!(mock.is_jacobian_supported());
    let result = {
        let mut objective = ObjectiveModel::new(&mock, DVector::from_element(2, 1.0));
        LevenbergMarquardtMinimizer::new()
            .with_maximum_iterations(0)
            .find_minimum(
                &mut objective,
                &DVector::from_vec(vec![0.5, -0.5]),
                &ParameterConstraints::new(),
            )
            .unwrap()
    };
    assert_eq!(result.exit_condition, ExitCondition::ManuallyStopped);
    assert_eq!(result.iterations, 0);
    assert_eq!(result.minimizing_point, DVector::from_vec(vec![0.5, -0.5]));
    assert_eq!(result.value, 2.0);
    assert_eq!(
        mock.calls()[0],
        MockCall::Values(DVector::from_vec(vec![0.5, -0.5]))
    );
}

#[test]
fn test_iteration_budget() {
    let x = vec![0.0, 0.5, 1.0, 1.5, 2.0, 3.0];
    let model = exponential(x.clone());
    let observed = DVector::from_vec(x.iter().map(|x| 2.0 * (-0.7 * x).exp()).collect());
    let mut objective = ObjectiveModel::new(&model, observed);
    let result = LevenbergMarquardtMinimizer::new()
        .with_maximum_iterations(1)
        .find_minimum(
            &mut objective,
            &DVector::from_vec(vec![1.0, 0.0]),
            &ParameterConstraints::new(),
        )
        .unwrap();
    assert_eq!(result.exit_condition, ExitCondition::ExceedIterations);
    assert_eq!(result.iterations, 1);
}

#[test]
fn test_infeasible_guess() {
    let model = line(vec![0.0, 1.0]);
    let mut objective = ObjectiveModel::new(&model, DVector::from_vec(vec![1.0, 3.0]));
    let constraints = ParameterConstraints::new().with_lower_bound(DVector::from_vec(vec![0.0, 0.0]));
    assert!(LevenbergMarquardtMinimizer::new()
        .find_minimum(&mut objective, &DVector::from_vec(vec![-1.0, 0.0]), &constraints)
        .is_err());
}

#[test]
#[should_panic(expected = "initial_mu must be > 0")]
fn test_non_positive_initial_mu() {
    LevenbergMarquardtMinimizer::new().with_initial_mu(0.0);
}
