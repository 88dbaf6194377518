use approx::assert_relative_eq;
use nalgebra::{DMatrix, DVector};

use super::test_helpers::{MockCall, MockProblem};
use super::{Kernel, MpFit, MpStatus};
use crate::qr::PivotedQR;

fn residuals() -> DVector<f64> {
    DVector::from_vec(vec![1., 2., 0.5])
}

fn jacobian() -> DMatrix<f64> {
    DMatrix::from_row_slice(3, 2, &[1., 2., 4., -2., 0.5, 0.1])
}

#[test]
fn gnorm_and_gtol() {
    let mut problem = MockProblem::new(vec![Some(residuals())]);
    let config = MpFit::new().with_gtol(0.98);
    let mut kernel = Kernel::new(&config, &mut problem, DVector::zeros(2), &[])
        .ok()
        .unwrap();
    let mut lls = PivotedQR::new(jacobian())
        .unwrap()
        .into_damped_least_squares(residuals());
    assert_eq!(
        kernel.update_diag(&mut lls).unwrap(),
        Some(MpStatus::Orthogonal)
    );
    drop(kernel);
    assert_eq!(problem.calls(), &[MockCall::SetParams, MockCall::Residuals]);

    let mut problem = MockProblem::new(vec![Some(residuals())]);
    let config = MpFit::new().with_gtol(0.96);
    let mut kernel = Kernel::new(&config, &mut problem, DVector::zeros(2), &[])
        .ok()
        .unwrap();
    let mut lls = PivotedQR::new(jacobian())
        .unwrap()
        .into_damped_least_squares(residuals());
    assert_eq!(kernel.update_diag(&mut lls).unwrap(), None);
    assert!(kernel.gnorm > 0.96 && kernel.gnorm < 0.98);
}

#[test]
fn diag_init_and_second_call() {
    let mut problem = MockProblem::new(vec![Some(residuals())]);
    let config = MpFit::new().with_step_factor(42.);
    let mut jacobian = jacobian();
    let mut kernel = Kernel::new(&config, &mut problem, DVector::from_vec(vec![1.5, 10.]), &[])
        .ok()
        .unwrap();

    let mut lls = PivotedQR::new(jacobian.clone())
        .unwrap()
        .into_damped_least_squares(residuals());
    assert_eq!(kernel.update_diag(&mut lls).unwrap(), None);
    // set diagonal to the column norms of J
    assert_relative_eq!(
        kernel.diag,
        DVector::from_vec(vec![4.153311931459037, 2.8301943396169813])
    );
    // xnorm = ||D * x||
    assert_relative_eq!(kernel.xnorm, 28.979518629542486);
    assert_eq!(kernel.delta, kernel.xnorm * 42.);
    let delta = kernel.delta;

    // change column norms of J
    jacobian[(0, 0)] = 100.;
    jacobian[(0, 1)] = 0.;
    let mut lls = PivotedQR::new(jacobian)
        .unwrap()
        .into_damped_least_squares(residuals());

    kernel.xnorm = 123.;
    assert_eq!(kernel.update_diag(&mut lls).unwrap(), None);
    // on second call only pick max
    assert_relative_eq!(
        kernel.diag,
        DVector::from_vec(vec![100.08121701897915, 2.8301943396169813])
    );
    // on second call not touched
    assert_eq!(kernel.xnorm, 123.);
    assert_eq!(kernel.delta, delta);
}

#[test]
fn non_finite_jacobian() {
    for bad in [f64::INFINITY, f64::NAN] {
        let mut problem = MockProblem::new(vec![Some(residuals())]);
        let config = MpFit::new();
        let mut kernel = Kernel::new(&config, &mut problem, DVector::from_vec(vec![1., 2.]), &[])
            .ok()
            .unwrap();
        let mut jacobian = jacobian();
        jacobian[(0, 0)] = bad;
        let mut lls = PivotedQR::new(jacobian)
            .unwrap()
            .into_damped_least_squares(residuals());
        let outcome = kernel.update_diag(&mut lls);
        if cfg!(feature = "minpack-compat") {
            assert_eq!(outcome.unwrap(), Some(MpStatus::Orthogonal));
        } else {
            assert!(outcome.is_err());
        }
    }
}

#[test]
fn zero_x() {
    let mut problem = MockProblem::new(vec![Some(residuals())]);
    let config = MpFit::new().with_step_factor(900.);
    let mut kernel = Kernel::new(&config, &mut problem, DVector::zeros(2), &[])
        .ok()
        .unwrap();
    let mut lls = PivotedQR::new(jacobian())
        .unwrap()
        .into_damped_least_squares(residuals());
    assert_eq!(kernel.update_diag(&mut lls).unwrap(), None);
    assert_eq!(kernel.xnorm, 0.);
    assert_eq!(kernel.delta, 900.);
}

#[test]
fn no_scale_diag() {
    let initial_x = DVector::from_vec(vec![1.5, 10.]);
    let mut problem = MockProblem::new(vec![Some(residuals())]);
    let config = MpFit::new().with_scale_diag(false).with_step_factor(0.5);
    let mut jacobian = jacobian();
    let mut kernel = Kernel::new(&config, &mut problem, initial_x.clone(), &[])
        .ok()
        .unwrap();
    let mut lls = PivotedQR::new(jacobian.clone())
        .unwrap()
        .into_damped_least_squares(residuals());
    assert_eq!(kernel.update_diag(&mut lls).unwrap(), None);
    assert_eq!(kernel.diag, DVector::from_element(2, 1.));
    // xnorm = ||D * x||
    assert_relative_eq!(kernel.xnorm, initial_x.norm());
    assert_eq!(kernel.delta, kernel.xnorm * 0.5);
    let delta = kernel.delta;

    // change column norms of J
    jacobian[(0, 0)] = 100.;
    jacobian[(0, 1)] = 0.;
    let mut lls = PivotedQR::new(jacobian)
        .unwrap()
        .into_damped_least_squares(residuals());

    kernel.xnorm = 123.;
    assert_eq!(kernel.update_diag(&mut lls).unwrap(), None);
    // on second call still no changed
    assert_eq!(kernel.diag, DVector::from_element(2, 1.));
    // on second call not touched
    assert_eq!(kernel.xnorm, 123.);
    assert_eq!(kernel.delta, delta);
}
