//! Downhill simplex method of Nelder and Mead.
use nalgebra::DVector;
use tracing::{debug, trace};

use crate::criteria::ExitCondition;
use crate::error::{MinimizationError, Result};
use crate::objective::ObjectiveFunction;
use crate::result::MinimizationResult;

/// Guards the relative range test against a zero function value.
const TINY: f64 = 1e-10;

/// Derivative-free minimizer moving a simplex of `$n+1$` vertices downhill.
///
/// Every iteration reflects the worst vertex through the centroid of the
/// others. A reflection that beats the best vertex is expanded further, one
/// that stays worse than the second-worst vertex is contracted, and if even
/// the contraction fails the whole simplex shrinks towards its best vertex.
///
/// The search has converged once the relative range of the vertex values
/// ```math
///   \frac{2\,|f_\mathrm{high} - f_\mathrm{low}|}{|f_\mathrm{high}| + |f_\mathrm{low}| + \epsilon}
/// ```
/// drops below the tolerance on two consecutive iterations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NelderMeadSimplex {
    tolerance: f64,
    maximum_evaluations: usize,
}

impl Default for NelderMeadSimplex {
    fn default() -> Self {
        Self::new()
    }
}

impl NelderMeadSimplex {
    pub fn new() -> Self {
        Self {
            tolerance: 1e-8,
            maximum_evaluations: 1000,
        }
    }

    /// # Panics
    ///
    /// Panics if `$\mathtt{tolerance} \leq 0$`.
    pub fn with_tolerance(self, tolerance: f64) -> Self {
        assert!(tolerance > 0.0, "tolerance must be > 0");
        Self { tolerance, ..self }
    }

    /// Set the budget of objective evaluations.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{maximum\_evaluations} = 0$`.
    pub fn with_maximum_evaluations(self, maximum_evaluations: usize) -> Self {
        assert!(maximum_evaluations > 0, "maximum_evaluations must be > 0");
        Self {
            maximum_evaluations,
            ..self
        }
    }

    /// Minimize starting from a simplex around `initial_guess`.
    ///
    /// Vertex `$i$` is the initial guess with component `$i$` moved by
    /// `$0.1\,x_i$`, or by `$1$` where `$x_i = 0$`.
    pub fn find_minimum<O>(
        &self,
        objective: &O,
        initial_guess: &DVector<f64>,
    ) -> Result<MinimizationResult>
    where
        O: ObjectiveFunction + ?Sized,
    {
        let perturbation = initial_guess.map(|x| if x == 0.0 { 1.0 } else { 0.1 * x });
        self.find_minimum_with_perturbation(objective, initial_guess, &perturbation)
    }

    /// Minimize starting from the simplex spanned by `initial_guess` and the
    /// points `$\vec{x} + \delta_i\,\vec{e}_i$`.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if the dimensions disagree, the guess is empty or a
    ///   perturbation is zero.
    /// - `EvaluationFailed` if the objective is not finite at a vertex.
    /// - `MaximumEvaluations` if the evaluation budget runs out.
    pub fn find_minimum_with_perturbation<O>(
        &self,
        objective: &O,
        initial_guess: &DVector<f64>,
        perturbation: &DVector<f64>,
    ) -> Result<MinimizationResult>
    where
        O: ObjectiveFunction + ?Sized,
    {
        let n = initial_guess.len();
        if n == 0 {
            return Err(MinimizationError::invalid_input("initial guess is empty"));
        }
        if perturbation.len() != n {
            return Err(MinimizationError::invalid_input(format!(
                "perturbation has {} entries, expected {n}",
                perturbation.len()
            )));
        }
        if perturbation.iter().any(|&d| d == 0.0 || !d.is_finite()) {
            return Err(MinimizationError::invalid_input(
                "perturbations must be finite and nonzero",
            ));
        }

        let mut simplex = Simplex::new(objective, self.maximum_evaluations);
        simplex.add_vertex(initial_guess.clone())?;
        for i in 0..n {
            let mut vertex = initial_guess.clone();
            vertex[i] += perturbation[i];
            simplex.add_vertex(vertex)?;
        }

        let mut iterations = 0;
        let mut converged_once = false;
        loop {
            let (lowest, highest, next_highest) = simplex.error_profile();
            let f_low = simplex.values[lowest];
            let f_high = simplex.values[highest];
            let range = 2.0 * (f_high - f_low).abs() / (f_high.abs() + f_low.abs() + TINY);
            if range < self.tolerance {
                if converged_once {
                    debug!("Nelder-Mead converged to {f_low} after {iterations} iterations");
                    return Ok(MinimizationResult {
                        minimizing_point: simplex.vertices.swap_remove(lowest),
                        value: f_low,
                        gradient: None,
                        iterations,
                        exit_condition: ExitCondition::Converged,
                        line_search: None,
                    });
                }
                converged_once = true;
            } else {
                converged_once = false;
            }

            let reflected = simplex.try_move(highest, -1.0)?;
            if reflected <= f_low {
                trace!("expanding");
                simplex.try_move(highest, 2.0)?;
            } else if reflected >= simplex.values[next_highest] {
                let worst = simplex.values[highest];
                let contracted = simplex.try_move(highest, 0.5)?;
                if contracted >= worst {
                    trace!("shrinking towards vertex {lowest}");
                    simplex.shrink(lowest)?;
                }
            }
            iterations += 1;
            debug!(
                "Nelder-Mead iteration {iterations}: best {}",
                simplex.values[lowest].min(simplex.values[highest])
            );
        }
    }
}

/// Vertices, their values and the running vertex sum.
struct Simplex<'a, O: ?Sized> {
    objective: &'a O,
    vertices: Vec<DVector<f64>>,
    values: Vec<f64>,
    sum: DVector<f64>,
    evaluations: usize,
    maximum_evaluations: usize,
}

impl<'a, O: ObjectiveFunction + ?Sized> Simplex<'a, O> {
    fn new(objective: &'a O, maximum_evaluations: usize) -> Self {
        Self {
            objective,
            vertices: Vec::new(),
            values: Vec::new(),
            sum: DVector::zeros(0),
            evaluations: 0,
            maximum_evaluations,
        }
    }

    fn evaluate(&mut self, point: &DVector<f64>) -> Result<f64> {
        if self.evaluations == self.maximum_evaluations {
            return Err(MinimizationError::maximum_evaluations(self.maximum_evaluations));
        }
        self.evaluations += 1;
        match self.objective.value(point) {
            Some(value) if value.is_finite() => Ok(value),
            value => Err(MinimizationError::evaluation_failed(
                "objective value not finite",
                point,
                value,
            )),
        }
    }

    fn add_vertex(&mut self, vertex: DVector<f64>) -> Result<()> {
        let value = self.evaluate(&vertex)?;
        if self.vertices.is_empty() {
            self.sum = vertex.clone();
        } else {
            self.sum += &vertex;
        }
        self.vertices.push(vertex);
        self.values.push(value);
        Ok(())
    }

    /// Indices of the lowest, highest and second-highest vertex.
    fn error_profile(&self) -> (usize, usize, usize) {
        let (mut highest, mut next_highest) = if self.values[0] > self.values[1] {
            (0, 1)
        } else {
            (1, 0)
        };
        let mut lowest = 0;
        for (i, &value) in self.values.iter().enumerate() {
            if value <= self.values[lowest] {
                lowest = i;
            }
            if value > self.values[highest] {
                next_highest = highest;
                highest = i;
            } else if value > self.values[next_highest] && i != highest {
                next_highest = i;
            }
        }
        (lowest, highest, next_highest)
    }

    /// Scale the worst vertex about the centroid of the others by `factor`,
    /// keeping the trial point if it improves on the worst one.
    fn try_move(&mut self, worst: usize, factor: f64) -> Result<f64> {
        let n = self.sum.len() as f64;
        let fac1 = (1.0 - factor) / n;
        let fac2 = fac1 - factor;
        let trial = &self.sum * fac1 - &self.vertices[worst] * fac2;
        let value = self.evaluate(&trial)?;
        if value < self.values[worst] {
            self.sum += &trial - &self.vertices[worst];
            self.vertices[worst] = trial;
            self.values[worst] = value;
        }
        Ok(value)
    }

    fn shrink(&mut self, best: usize) -> Result<()> {
        let anchor = self.vertices[best].clone();
        for i in 0..self.vertices.len() {
            if i == best {
                continue;
            }
            let vertex = (&self.vertices[i] + &anchor) * 0.5;
            self.values[i] = self.evaluate(&vertex)?;
            self.vertices[i] = vertex;
        }
        self.sum = self
            .vertices
            .iter()
            .fold(DVector::zeros(anchor.len()), |sum, vertex| sum + vertex);
        Ok(())
    }
}
