use std::cell::RefCell;

use nalgebra::{DMatrix, DVector};

use super::MpFunction;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    SetParams,
    Residuals,
    Jacobian,
}

/// A problem replaying scripted residuals and Jacobians.
///
/// `None` is returned once a script is exhausted.
#[derive(Clone)]
pub struct MockProblem {
    call_history: RefCell<Vec<MockCall>>,
    pub params: Vec<DVector<f64>>,
    residuals: Vec<Option<DVector<f64>>>,
    residuals_index: RefCell<usize>,
    jacobians: Vec<Option<DMatrix<f64>>>,
    jacobians_index: RefCell<usize>,
}

impl MockProblem {
    pub fn new(residuals: Vec<Option<DVector<f64>>>) -> Self {
        Self {
            residuals,
            jacobians: vec![],
            call_history: RefCell::new(vec![]),
            params: vec![],
            residuals_index: RefCell::new(0),
            jacobians_index: RefCell::new(0),
        }
    }

    pub fn with_jacobians(self, jacobians: Vec<Option<DMatrix<f64>>>) -> Self {
        Self { jacobians, ..self }
    }

    pub fn calls(&mut self) -> &[MockCall] {
        self.call_history.get_mut().as_slice()
    }

    fn replay<T: Clone>(script: &[Option<T>], index: &RefCell<usize>) -> Option<T> {
        let mut index = index.borrow_mut();
        let entry = script.get(*index)?.clone();
        *index += 1;
        entry
    }
}

impl MpFunction<f64> for MockProblem {
    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.push(x.clone());
        self.call_history.get_mut().push(MockCall::SetParams);
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        self.call_history.borrow_mut().push(MockCall::Residuals);
        Self::replay(&self.residuals, &self.residuals_index)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        self.call_history.borrow_mut().push(MockCall::Jacobian);
        Self::replay(&self.jacobians, &self.jacobians_index)
    }
}
