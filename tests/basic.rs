use std::cell::RefCell;
use std::fmt;
use std::sync::{Arc, Mutex};

use approx::assert_relative_eq;
use nalgebra::{DMatrix, DVector};
use numopt::{
    objective, BfgsBMinimizer, BfgsMinimizer, BoxBounds, CurveWithDerivative, ExitCondition,
    GoldenSectionMinimizer, LbfgsMinimizer, LevenbergMarquardtMinimizer, ModelFunction,
    NelderMeadSimplex, NewtonMinimizer, ObjectiveFunction, ObjectiveModel, ParameterConstraints,
    PowellMinimizer, TrustRegionMinimizer,
};
use tracing::field::{Field, Visit};
use tracing::{span, Event, Metadata, Subscriber};

fn paraboloid(x: &DVector<f64>) -> f64 {
    (x[0] - 1.0).powi(2) + (x[1] - 2.0).powi(2)
}

fn paraboloid_gradient(x: &DVector<f64>) -> DVector<f64> {
    DVector::from_vec(vec![2.0 * (x[0] - 1.0), 2.0 * (x[1] - 2.0)])
}

fn rosenbrock(x: &DVector<f64>) -> f64 {
    100.0 * (x[1] - x[0] * x[0]).powi(2) + (1.0 - x[0]).powi(2)
}

fn rosenbrock_gradient(x: &DVector<f64>) -> DVector<f64> {
    DVector::from_vec(vec![
        -400.0 * x[0] * (x[1] - x[0] * x[0]) - 2.0 * (1.0 - x[0]),
        200.0 * (x[1] - x[0] * x[0]),
    ])
}

/// Records every point the wrapped objective is asked about.
struct Recording<O> {
    objective: O,
    points: RefCell<Vec<DVector<f64>>>,
}

impl<O> Recording<O> {
    fn new(objective: O) -> Self {
        Self {
            objective,
            points: RefCell::new(Vec::new()),
        }
    }
}

impl<O: ObjectiveFunction> ObjectiveFunction for Recording<O> {
    fn value(&self, point: &DVector<f64>) -> Option<f64> {
        self.points.borrow_mut().push(point.clone());
        self.objective.value(point)
    }

    fn gradient(&self, point: &DVector<f64>) -> Option<DVector<f64>> {
        self.points.borrow_mut().push(point.clone());
        self.objective.gradient(point)
    }

    fn is_gradient_supported(&self) -> bool {
        self.objective.is_gradient_supported()
    }
}

impl<O> ModelFunction for Recording<O>
where
    O: Fn(&DVector<f64>) -> DVector<f64>,
{
    fn values(&self, parameters: &DVector<f64>) -> Option<DVector<f64>> {
        self.points.borrow_mut().push(parameters.clone());
        Some((self.objective)(parameters))
    }
}

#[test]
fn bfgs_shifted_paraboloid() {
    let f = objective::gradient(paraboloid, paraboloid_gradient);
    let result = BfgsMinimizer::new()
        .with_gradient_tolerance(1e-8)
        .find_minimum(&f, &DVector::zeros(2))
        .unwrap();
    assert_relative_eq!(
        result.minimizing_point,
        DVector::from_vec(vec![1.0, 2.0]),
        epsilon = 1e-7
    );
    assert!(result.value < 1e-12);
    assert_eq!(result.exit_condition, ExitCondition::RelativeGradient);
}

#[test]
fn lbfgs_rosenbrock() {
    let f = objective::gradient(rosenbrock, rosenbrock_gradient);
    let result = LbfgsMinimizer::new()
        .with_memory(10)
        .find_minimum(&f, &DVector::from_vec(vec![-1.2, 1.0]))
        .unwrap();
    assert_relative_eq!(
        result.minimizing_point,
        DVector::from_vec(vec![1.0, 1.0]),
        epsilon = 1e-4
    );
    assert!(result.iterations < 500);
}

#[test]
fn levenberg_marquardt_two_point_line() {
    let line = CurveWithDerivative::new(
        |p: &DVector<f64>, x: f64| p[0] * x + p[1],
        |_: &DVector<f64>, x: f64| DVector::from_vec(vec![x, 1.0]),
        DVector::from_vec(vec![1.0, 2.0]),
    );
    let mut model = ObjectiveModel::new(&line, DVector::from_vec(vec![3.0, 5.0]));
    let result = LevenbergMarquardtMinimizer::new()
        .find_minimum(&mut model, &DVector::zeros(2), &ParameterConstraints::new())
        .unwrap();
    assert_relative_eq!(
        result.minimizing_point,
        DVector::from_vec(vec![2.0, 1.0]),
        epsilon = 1e-6
    );
    assert!(result.value < 1e-10);
}

#[test]
fn bounded_bfgs_boundary_optimum() {
    let f = Recording::new(objective::gradient(
        |x: &DVector<f64>| x[0] * x[0],
        |x: &DVector<f64>| x * 2.0,
    ));
    let bounds =
        BoxBounds::new(DVector::from_element(1, 1.0), DVector::from_element(1, 5.0)).unwrap();
    let result = BfgsBMinimizer::new()
        .find_minimum(&f, &bounds, &DVector::from_element(1, 3.0))
        .unwrap();
    assert_eq!(result.minimizing_point[0], 1.0);
    let points = f.points.borrow();
    assert!(!points.is_empty());
    assert!(points.iter().all(|p| (1.0..=5.0).contains(&p[0])));
}

#[test]
fn bounded_levenberg_marquardt_stays_feasible() {
    // residual x, so the sum of squares is x^2
    let model = Recording::new(|p: &DVector<f64>| p.clone());
    let mut objective = ObjectiveModel::new(&model, DVector::zeros(1));
    let constraints = ParameterConstraints::new()
        .with_lower_bound(DVector::from_element(1, 1.0))
        .with_upper_bound(DVector::from_element(1, 5.0));
    let result = LevenbergMarquardtMinimizer::new()
        .find_minimum(&mut objective, &DVector::from_element(1, 3.0), &constraints)
        .unwrap();
    assert_relative_eq!(result.minimizing_point[0], 1.0, epsilon = 1e-4);
    let points = model.points.borrow();
    assert!(points.iter().all(|p| (1.0..=5.0).contains(&p[0])));
}

#[test]
fn golden_section_parabola() {
    let result = GoldenSectionMinimizer::new()
        .find_minimum(|x| (x - 3.0).powi(2), 0.0, 10.0)
        .unwrap();
    assert_relative_eq!(result.minimizing_point, 3.0, epsilon = 1e-4);
    assert_eq!(result.exit_condition, ExitCondition::BoundTolerance);
}

/// `$\frac{1}{2}x^\top A x - b^\top x$`, minimized at `$A^{-1}b$`.
fn quadratic() -> (DMatrix<f64>, DVector<f64>) {
    (
        DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.0, 1.0, 3.0, -1.0, 0.0, -1.0, 2.0]),
        DVector::from_vec(vec![1.0, 2.0, 3.0]),
    )
}

#[test]
fn quadratic_exactness() {
    let (a, b) = quadratic();
    let solution = a.clone().lu().solve(&b).unwrap();
    let (a1, b1, a2, b2, a3) = (a.clone(), b.clone(), a.clone(), b.clone(), a.clone());
    let f = objective::hessian(
        move |x: &DVector<f64>| 0.5 * x.dot(&(&a1 * x)) - b1.dot(x),
        move |x: &DVector<f64>| &a2 * x - &b2,
        move |_: &DVector<f64>| a3.clone(),
    );
    let start = DVector::from_vec(vec![-3.0, 8.0, 1.5]);

    let result = NewtonMinimizer::new().find_minimum(&f, &start).unwrap();
    assert!(result.iterations <= 3);
    assert_eq!(result.exit_condition, ExitCondition::RelativeGradient);
    assert_relative_eq!(result.minimizing_point, solution, epsilon = 1e-8);

    let result = BfgsMinimizer::new().find_minimum(&f, &start).unwrap();
    assert_relative_eq!(result.minimizing_point, solution, epsilon = 1e-6);

    // a linear model makes the Gauss-Newton Hessian exact
    let linear = CurveWithDerivative::new(
        |p: &DVector<f64>, x: f64| p[0] + p[1] * x + p[2] * x * x,
        |_: &DVector<f64>, x: f64| DVector::from_vec(vec![1.0, x, x * x]),
        DVector::from_vec(vec![-1.0, 0.0, 1.0, 2.0]),
    );
    let mut model = ObjectiveModel::new(&linear, DVector::from_vec(vec![2.0, 1.0, 2.0, 5.0]));
    let result = TrustRegionMinimizer::dog_leg()
        .find_minimum(&mut model, &DVector::zeros(3), &ParameterConstraints::new())
        .unwrap();
    assert_relative_eq!(
        result.minimizing_point,
        DVector::from_vec(vec![1.0, 0.0, 1.0]),
        epsilon = 1e-6
    );
}

#[test]
fn converged_start_returns_immediately() {
    let f = objective::gradient(paraboloid, paraboloid_gradient);
    let optimum = DVector::from_vec(vec![1.0, 2.0]);
    let first = BfgsMinimizer::new().find_minimum(&f, &DVector::zeros(2)).unwrap();
    let again = BfgsMinimizer::new().find_minimum(&f, &optimum).unwrap();
    assert_eq!(again.iterations, 0);
    assert_eq!(again.exit_condition, first.exit_condition);

    let again = LbfgsMinimizer::new().find_minimum(&f, &optimum).unwrap();
    assert_eq!(again.iterations, 0);

    let line = CurveWithDerivative::new(
        |p: &DVector<f64>, x: f64| p[0] * x + p[1],
        |_: &DVector<f64>, x: f64| DVector::from_vec(vec![x, 1.0]),
        DVector::from_vec(vec![0.0, 1.0, 2.0]),
    );
    let mut model = ObjectiveModel::new(&line, DVector::from_vec(vec![1.0, 3.0, 5.0]));
    let result = LevenbergMarquardtMinimizer::new()
        .find_minimum(
            &mut model,
            &DVector::from_vec(vec![2.0, 1.0]),
            &ParameterConstraints::new(),
        )
        .unwrap();
    assert_eq!(result.iterations, 0);
}

#[test]
fn derivative_free_methods_agree() {
    let f = objective::value(paraboloid);
    let start = DVector::from_vec(vec![-2.0, 4.0]);
    let simplex = NelderMeadSimplex::new().find_minimum(&f, &start).unwrap();
    let powell = PowellMinimizer::new().find_minimum(&f, &start).unwrap();
    assert!(simplex.gradient.is_none());
    assert_relative_eq!(simplex.minimizing_point, powell.minimizing_point, epsilon = 1e-3);
    assert_relative_eq!(powell.minimizing_point, DVector::from_vec(vec![1.0, 2.0]), epsilon = 1e-5);
}

/// Collects the `value` field of every `accepted step` event.
#[derive(Clone, Default)]
struct AcceptedValues(Arc<Mutex<Vec<f64>>>);

#[derive(Default)]
struct AcceptedStep {
    iteration: Option<u64>,
    value: Option<f64>,
}

impl Visit for AcceptedStep {
    fn record_f64(&mut self, field: &Field, value: f64) {
        if field.name() == "value" {
            self.value = Some(value);
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "iteration" {
            self.iteration = Some(value);
        }
    }

    fn record_debug(&mut self, _field: &Field, _value: &dyn fmt::Debug) {}
}

impl Subscriber for AcceptedValues {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.target().starts_with("numopt")
    }

    fn new_span(&self, _span: &span::Attributes<'_>) -> span::Id {
        span::Id::from_u64(1)
    }

    fn record(&self, _span: &span::Id, _values: &span::Record<'_>) {}

    fn record_follows_from(&self, _span: &span::Id, _follows: &span::Id) {}

    fn event(&self, event: &Event<'_>) {
        let mut step = AcceptedStep::default();
        event.record(&mut step);
        if let (Some(_), Some(value)) = (step.iteration, step.value) {
            self.0.lock().unwrap().push(value);
        }
    }

    fn enter(&self, _span: &span::Id) {}

    fn exit(&self, _span: &span::Id) {}
}

/// Objective values at the start and at every accepted iterate of `run`.
fn accepted_values<F: FnOnce()>(initial_value: f64, run: F) -> Vec<f64> {
    let collector = AcceptedValues::default();
    tracing::subscriber::with_default(collector.clone(), run);
    let mut values = vec![initial_value];
    values.extend(collector.0.lock().unwrap().iter().copied());
    values
}

fn assert_non_increasing(values: &[f64]) {
    assert!(values.len() > 1, "no accepted iterates were reported");
    assert!(
        values.windows(2).all(|w| w[1] <= w[0]),
        "values increased: {values:?}"
    );
}

#[test]
fn descent_on_convex_quadratic() {
    let (a, b) = quadratic();
    let (a1, b1, a2, b2, a3) = (a.clone(), b.clone(), a.clone(), b, a);
    let f = objective::hessian(
        move |x: &DVector<f64>| 0.5 * x.dot(&(&a1 * x)) - b1.dot(x),
        move |x: &DVector<f64>| &a2 * x - &b2,
        move |_: &DVector<f64>| a3.clone(),
    );
    let start = DVector::from_vec(vec![-3.0, 8.0, 1.5]);
    let initial_value = f.value(&start).unwrap();

    let values = accepted_values(initial_value, || {
        BfgsMinimizer::new().find_minimum(&f, &start).unwrap();
    });
    assert_non_increasing(&values);

    let values = accepted_values(initial_value, || {
        LbfgsMinimizer::new().find_minimum(&f, &start).unwrap();
    });
    assert_non_increasing(&values);

    let values = accepted_values(initial_value, || {
        NewtonMinimizer::new().find_minimum(&f, &start).unwrap();
    });
    assert_non_increasing(&values);
}

#[test]
fn descent_on_rosenbrock() {
    let f = objective::hessian(rosenbrock, rosenbrock_gradient, |x: &DVector<f64>| {
        DMatrix::from_row_slice(
            2,
            2,
            &[
                1200.0 * x[0] * x[0] - 400.0 * x[1] + 2.0,
                -400.0 * x[0],
                -400.0 * x[0],
                200.0,
            ],
        )
    });
    let start = DVector::from_vec(vec![-1.2, 1.0]);
    let initial_value = rosenbrock(&start);

    let values = accepted_values(initial_value, || {
        BfgsMinimizer::new().find_minimum(&f, &start).unwrap();
    });
    assert_non_increasing(&values);

    let values = accepted_values(initial_value, || {
        LbfgsMinimizer::new()
            .with_memory(10)
            .find_minimum(&f, &start)
            .unwrap();
    });
    assert_non_increasing(&values);

    // full Newton steps overshoot in the curved valley
    let values = accepted_values(initial_value, || {
        NewtonMinimizer::new()
            .with_line_search(true)
            .find_minimum(&f, &start)
            .unwrap();
    });
    assert_non_increasing(&values);
}
