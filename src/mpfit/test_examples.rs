//! Tests with example functions from the MINPACK test suite.
//!
//! The reference values were obtained with MINPACK's `lmder`, whose
//! objective is `$\frac{1}{2}\|\vec{r}\|^2$`, so they are doubled here.
use approx::assert_relative_eq;
use nalgebra::{DMatrix, DVector};

use super::{fdjac, MpFit, MpFunction, MpStatus, ParameterSpec, Side};

/// TOL value used by SciPy
const TOL: f64 = 1.49012e-08;

fn config() -> MpFit<f64> {
    MpFit::new().with_ftol(TOL).with_xtol(TOL).with_gtol(0.)
}

fn analytic(n: usize) -> Vec<ParameterSpec<f64>> {
    vec![ParameterSpec::new().with_side(Side::Analytic); n]
}

/// Compare the analytic Jacobian against central differences.
fn check_jacobian<P: MpFunction<f64>>(problem: &mut P, x: DVector<f64>, epsilon: f64) {
    problem.set_params(&x);
    let residuals = problem.residuals().unwrap();
    let analytic = problem.jacobian().unwrap();
    let specs = vec![ParameterSpec::new().with_side(Side::TwoSided); x.len()];
    let free: Vec<usize> = (0..x.len()).collect();
    let mut evaluations = 0;
    let numeric = fdjac::jacobian(
        &MpFit::new().with_epsfcn(1e-10),
        problem,
        &x,
        &residuals,
        &specs,
        &free,
        &mut evaluations,
    )
    .unwrap();
    assert_eq!(evaluations, 2 * x.len());
    assert_relative_eq!(numeric, analytic, epsilon = epsilon);
}

struct LinearFullRank {
    params: DVector<f64>,
    m: usize,
}

impl MpFunction<f64> for LinearFullRank {
    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.copy_from(x);
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let mut residuals =
            DVector::from_element(self.m, -2. * self.params.sum() / self.m as f64 - 1.);
        for (el, p) in residuals.rows_range_mut(..5).iter_mut().zip(self.params.iter()) {
            *el += p;
        }
        Some(residuals)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let mut jacobian = DMatrix::from_element(self.m, 5, -2. / self.m as f64);
        for i in 0..5 {
            jacobian[(i, i)] += 1.;
        }
        Some(jacobian)
    }
}

#[test]
fn test_linear_full_rank() {
    for (m, best_norm) in [(10, 5.), (50, 45.)] {
        let mut problem = LinearFullRank {
            params: DVector::zeros(5),
            m,
        };
        check_jacobian(&mut problem, DVector::from_vec(vec![0.3, -0.2, 0.9, 1.1, 0.4]), 1e-6);
        let result = config()
            .fit(&mut problem, DVector::from_element(5, 1.), &analytic(5))
            .unwrap();
        assert_eq!(result.status, MpStatus::BothConverged);
        assert_relative_eq!(result.best_norm, best_norm, epsilon = 1e-10);
        assert_relative_eq!(result.parameters, DVector::from_element(5, -1.), epsilon = 1e-10);
        assert_eq!(result.free_parameters, 5);
        assert_eq!(result.pegged_parameters, 0);
    }
}

struct LinearRank1 {
    params: DVector<f64>,
    m: usize,
}

impl MpFunction<f64> for LinearRank1 {
    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.copy_from(x);
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let weighted_sum: f64 = self
            .params
            .iter()
            .enumerate()
            .map(|(j, p)| (j + 1) as f64 * p)
            .sum();
        Some(DVector::from_iterator(
            self.m,
            (0..self.m).map(|i| (i + 1) as f64 * weighted_sum - 1.),
        ))
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        Some(DMatrix::from_fn(self.m, 5, |i, j| ((i + 1) * (j + 1)) as f64))
    }
}

#[test]
fn test_linear_rank1() {
    for (m, best_norm) in [(10, 2.142857142857143), (50, 12.128712871287126)] {
        let mut problem = LinearRank1 {
            params: DVector::zeros(5),
            m,
        };
        let result = config()
            .fit(&mut problem, DVector::from_element(5, 1.), &analytic(5))
            .unwrap();
        assert_eq!(result.status, MpStatus::ChiSquareConverged);
        assert_relative_eq!(result.best_norm, best_norm, max_relative = 1e-8);
        // the covariance of a rank one Jacobian has a single nonzero block
        let nonzero = result.parameter_errors.iter().filter(|e| **e > 0.).count();
        assert_eq!(nonzero, 1);
    }
}

#[derive(Clone)]
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
fn test_rosenbrock() {
    let mut problem = Rosenbrock {
        params: DVector::zeros(2),
    };
    check_jacobian(&mut problem, DVector::from_vec(vec![0.7, -0.3]), 1e-6);

    let initial = DVector::from_vec(vec![-1.2, 1.]);
    let expected = if cfg!(feature = "minpack-compat") {
        // MINPACK reports orthogonality because the residuals vanish
        // exactly and the gnorm computation divides by zero
        [
            MpStatus::Orthogonal,
            MpStatus::ParametersConverged,
            MpStatus::ParametersConverged,
        ]
    } else {
        [MpStatus::ChiSquareConverged; 3]
    };
    for (shift, status) in [0., 10., 100.].into_iter().zip(expected) {
        let result = config()
            .fit(&mut problem, initial.add_scalar(shift), &analytic(2))
            .unwrap();
        assert_eq!(result.status, status);
        assert_relative_eq!(result.best_norm, 0., epsilon = 1e-20);
        assert_relative_eq!(result.parameters, DVector::from_element(2, 1.), epsilon = 1e-10);
        assert!(result.original_norm > 0.);
        assert!(result.evaluations >= result.iterations);
    }
}

struct HelicalValley {
    params: DVector<f64>,
}

const TPI: f64 = std::f64::consts::PI * 2.;

impl MpFunction<f64> for HelicalValley {
    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.copy_from(x);
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let p = &self.params;
        let tmp1 = if p[0] == 0. {
            (0.25f64).copysign(p[1])
        } else if p[0] > 0. {
            (p[1] / p[0]).atan() / TPI
        } else {
            (p[1] / p[0]).atan() / TPI + 0.5
        };
        let tmp2 = (p[0] * p[0] + p[1] * p[1]).sqrt();
        Some(DVector::from_vec(vec![
            10. * (p[2] - 10. * tmp1),
            10. * (tmp2 - 1.),
            p[2],
        ]))
    }

    #[rustfmt::skip]
    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let p = &self.params;
        let temp = p[0] * p[0] + p[1] * p[1];
        let tmp1 = TPI * temp;
        let tmp2 = temp.sqrt();
        Some(DMatrix::from_row_slice(3, 3, &[
            100. * p[1] / tmp1, -100. * p[0] / tmp1, 10.,
             10. * p[0] / tmp2,   10. * p[1] / tmp2,  0.,
                            0.,                  0.,  1.,
        ]))
    }
}

#[test]
fn test_helical_valley() {
    let mut problem = HelicalValley {
        params: DVector::zeros(3),
    };
    check_jacobian(&mut problem, DVector::from_vec(vec![0.4, 0.8, -0.3]), 1e-5);

    let initial = DVector::from_vec(vec![-1., 0., 0.]);
    for factor in [1., 10., 100.] {
        let result = config()
            .fit(&mut problem, &initial * factor, &analytic(3))
            .unwrap();
        assert!(matches!(
            result.status,
            MpStatus::ParametersConverged | MpStatus::ChiSquareConverged
        ));
        assert!(result.best_norm < 1e-30);
        assert_relative_eq!(
            result.parameters,
            DVector::from_vec(vec![1., 0., 0.]),
            epsilon = 1e-12
        );
    }
}

struct FreudensteinRoth {
    params: DVector<f64>,
}

impl MpFunction<f64> for FreudensteinRoth {
    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.copy_from(x);
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let p = &self.params;
        Some(DVector::from_vec(vec![
            -13. + p[0] + ((5. - p[1]) * p[1] - 2.) * p[1],
            -29. + p[0] + ((1. + p[1]) * p[1] - 14.) * p[1],
        ]))
    }

    #[rustfmt::skip]
    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let p = &self.params;
        Some(DMatrix::from_row_slice(2, 2, &[
            1., p[1] * (10. - 3. * p[1]) - 2.,
            1., p[1] * (2. + 3. * p[1]) - 14.,
        ]))
    }
}

#[test]
fn test_freudenstein_roth() {
    let mut problem = FreudensteinRoth {
        params: DVector::zeros(2),
    };
    check_jacobian(&mut problem, DVector::from_vec(vec![2.5, -1.5]), 1e-5);

    // a local minimum
    let result = config()
        .fit(&mut problem, DVector::from_vec(vec![0.5, -2.]), &analytic(2))
        .unwrap();
    assert_eq!(result.status, MpStatus::ChiSquareConverged);
    assert_relative_eq!(result.best_norm, 48.984253727069906, max_relative = 1e-8);
    assert_relative_eq!(
        result.parameters,
        DVector::from_vec(vec![11.412484465499368, -0.8968279137315035]),
        epsilon = 1e-3
    );
}

struct Bard {
    params: DVector<f64>,
}

impl MpFunction<f64> for Bard {
    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.copy_from(x);
    }

    #[rustfmt::skip]
    fn residuals(&self) -> Option<DVector<f64>> {
        const Y1: [f64; 15] = [
            0.14, 0.18, 0.22, 0.25, 0.29,
            0.32, 0.35, 0.39, 0.37, 0.58,
            0.73, 0.96, 1.34, 2.10, 4.39,
        ];
        let p = &self.params;
        Some(DVector::from_fn(15, |i, _| {
            let tmp2 = (15 - i) as f64;
            let tmp3 = if i > 7 { tmp2 } else { (i + 1) as f64 };
            Y1[i] - (p[0] + (i + 1) as f64 / (p[1] * tmp2 + p[2] * tmp3))
        }))
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let p = &self.params;
        Some(DMatrix::from_fn(15, 3, |i, j| {
            let tmp2 = (15 - i) as f64;
            let tmp3 = if i > 7 { tmp2 } else { (i + 1) as f64 };
            let tmp4 = (p[1] * tmp2 + p[2] * tmp3).powi(2);
            match j {
                0 => -1.,
                1 => (i + 1) as f64 * tmp2 / tmp4,
                _ => (i + 1) as f64 * tmp3 / tmp4,
            }
        }))
    }
}

#[test]
fn test_bard() {
    let mut problem = Bard {
        params: DVector::zeros(3),
    };
    check_jacobian(&mut problem, DVector::from_vec(vec![0.81, 0.47, 0.43]), 1e-6);

    let expected = DVector::from_vec(vec![0.0824105765758334, 1.1330366534715044, 2.343694638941154]);
    let result = config()
        .fit(&mut problem, DVector::from_element(3, 1.), &analytic(3))
        .unwrap();
    assert_eq!(result.status, MpStatus::ChiSquareConverged);
    assert_relative_eq!(result.best_norm, 0.00821487730658124, max_relative = 1e-8);
    assert_relative_eq!(result.parameters, expected, epsilon = 1e-6);

    // finite differences find the same minimum
    let result = config()
        .fit(&mut problem, DVector::from_element(3, 1.), &[])
        .unwrap();
    assert_relative_eq!(result.best_norm, 0.00821487730658124, max_relative = 1e-6);
    assert_relative_eq!(result.parameters, expected, epsilon = 1e-4);
    assert!(result.parameter_errors.iter().all(|e| *e > 0.));
}
