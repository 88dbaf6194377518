use approx::assert_relative_eq;
use nalgebra::DVector;

use super::test_helpers::{MockCall, MockProblem};
use super::{Kernel, MpFit, MpStatus, ParameterSpec};
use crate::error::MinimizationError;

#[test]
fn nan_or_inf_none_residual() {
    // residuals return None
    let mut problem = MockProblem::new(vec![]);
    let err = Kernel::new(&MpFit::new(), &mut problem, DVector::zeros(2), &[])
        .err()
        .unwrap();
    assert!(matches!(
        err,
        MinimizationError::EvaluationFailed { ref reason, .. } if reason.contains("None")
    ));
    assert_eq!(
        problem.calls(),
        [MockCall::SetParams, MockCall::Residuals].as_ref()
    );

    for bad in [f64::INFINITY, f64::NAN] {
        let mut problem = MockProblem::new(vec![Some(DVector::from_vec(vec![1., 1., bad]))]);
        let err = Kernel::new(&MpFit::new(), &mut problem, DVector::zeros(2), &[])
            .err()
            .unwrap();
        match err {
            MinimizationError::EvaluationFailed { reason, point, .. } => {
                assert_eq!(reason, "residuals not finite");
                assert_eq!(point, DVector::zeros(2));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(
            problem.calls(),
            [MockCall::SetParams, MockCall::Residuals].as_ref()
        );
    }
}

#[test]
#[cfg(not(feature = "minpack-compat"))]
fn already_zero() {
    let mut problem = MockProblem::new(vec![Some(DVector::zeros(3))]);
    let result = MpFit::new()
        .fit(&mut problem, DVector::zeros(2), &[])
        .unwrap();
    assert_eq!(result.status, MpStatus::ChiSquareConverged);
    assert_eq!(result.evaluations, 1);
    assert_eq!(result.iterations, 0);
    assert_eq!(result.best_norm, 0.);
    assert_eq!(
        problem.calls(),
        [MockCall::SetParams, MockCall::Residuals].as_ref()
    );

    let mut problem = MockProblem::new(vec![Some(DVector::from_element(1, f64::MIN_POSITIVE))]);
    let result = MpFit::new()
        .fit(&mut problem, DVector::from_element(1, 10.), &[])
        .unwrap();
    assert_eq!(result.status, MpStatus::ChiSquareConverged);
    assert_eq!(result.parameters, DVector::from_element(1, 10.));
    assert_eq!(result.best_norm, 0.);
    assert_eq!(
        problem.calls(),
        [MockCall::SetParams, MockCall::Residuals].as_ref()
    );
}

#[test]
fn no_params() {
    let mut problem = MockProblem::new(vec![Some(DVector::from_element(3, 1.))]);
    let err = Kernel::new(&MpFit::new(), &mut problem, DVector::zeros(0), &[])
        .err()
        .unwrap();
    assert!(matches!(err, MinimizationError::InvalidInput { .. }));
    assert_eq!(
        problem.calls(),
        [MockCall::SetParams, MockCall::Residuals].as_ref()
    );
}

#[test]
fn all_fixed() {
    let mut problem = MockProblem::new(vec![Some(DVector::from_element(3, 1.))]);
    let specs = [ParameterSpec::new().with_fixed(true); 2];
    let err = Kernel::new(&MpFit::new(), &mut problem, DVector::zeros(2), &specs)
        .err()
        .unwrap();
    assert!(matches!(err, MinimizationError::InvalidInput { .. }));
}

#[test]
fn too_few_residuals() {
    let mut problem = MockProblem::new(vec![Some(DVector::from_element(2, 1.))]);
    let err = Kernel::new(&MpFit::new(), &mut problem, DVector::zeros(3), &[])
        .err()
        .unwrap();
    assert!(matches!(err, MinimizationError::InvalidInput { .. }));
    assert_eq!(
        problem.calls(),
        [MockCall::SetParams, MockCall::Residuals].as_ref()
    );

    // fixing a parameter makes the problem feasible
    let mut problem = MockProblem::new(vec![Some(DVector::from_element(2, 1.))]);
    let specs = [
        ParameterSpec::new(),
        ParameterSpec::new().with_fixed(true),
        ParameterSpec::new(),
    ];
    assert!(Kernel::new(&MpFit::new(), &mut problem, DVector::zeros(3), &specs).is_ok());
}

#[test]
fn invalid_specs_are_rejected_before_evaluation() {
    let config = MpFit::new();
    let cases: [(DVector<f64>, Vec<ParameterSpec<f64>>); 4] = [
        // wrong number of specs
        (DVector::zeros(2), vec![ParameterSpec::new()]),
        // empty interval
        (
            DVector::zeros(1),
            vec![ParameterSpec::new().with_lower_limit(1.).with_upper_limit(1.)],
        ),
        // infeasible start
        (
            DVector::from_element(1, 2.),
            vec![ParameterSpec::new().with_upper_limit(1.)],
        ),
        // non-finite start
        (DVector::from_element(1, f64::NAN), vec![ParameterSpec::new()]),
    ];
    for (initial, specs) in cases {
        let mut problem = MockProblem::new(vec![Some(DVector::from_element(3, 1.))]);
        let err = Kernel::new(&config, &mut problem, initial, &specs)
            .err()
            .unwrap();
        assert!(matches!(err, MinimizationError::InvalidInput { .. }));
        assert!(problem.calls().is_empty());
    }
}

#[test]
fn initial_diagonal_and_residual() {
    let mut problem = MockProblem::new(vec![Some(DVector::from_vec(vec![0.5, 1.]))]);
    let config = MpFit::new();
    let kernel = Kernel::new(&config, &mut problem, DVector::from_element(2, 2.), &[])
        .ok()
        .unwrap();
    assert_eq!(kernel.diag, DVector::from_element(2, 1.));
    assert_relative_eq!(kernel.original_norm, 1.25);
    assert_relative_eq!(kernel.residuals_norm, 1.25f64.sqrt());
    assert_eq!(kernel.residuals, DVector::from_vec(vec![0.5, 1.]));
    assert_eq!(kernel.evaluations, 1);
    assert_eq!(kernel.free, vec![0, 1]);
    drop(kernel);
    assert_eq!(
        problem.calls(),
        [MockCall::SetParams, MockCall::Residuals].as_ref()
    );
}
