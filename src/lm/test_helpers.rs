use std::cell::RefCell;

use nalgebra::{DMatrix, DVector};

use crate::ModelFunction;

#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Values(DVector<f64>),
    Jacobian(DVector<f64>),
}

/// A model replaying scripted predictions and Jacobians.
///
/// Once the script is exhausted the last entry is repeated.
pub struct MockModel {
    call_history: RefCell<Vec<MockCall>>,
    values: Vec<Option<DVector<f64>>>,
    values_index: RefCell<usize>,
    jacobians: Vec<Option<DMatrix<f64>>>,
    jacobians_index: RefCell<usize>,
}

impl MockModel {
    pub fn new(values: Vec<Option<DVector<f64>>>, jacobians: Vec<Option<DMatrix<f64>>>) -> Self {
        Self {
            call_history: RefCell::new(vec![]),
            values,
            values_index: RefCell::new(0),
            jacobians,
            jacobians_index: RefCell::new(0),
        }
    }

    pub fn calls(&mut self) -> &[MockCall] {
        self.call_history.get_mut().as_slice()
    }

    fn replay<T: Clone>(script: &[Option<T>], index: &RefCell<usize>) -> Option<T> {
        let mut index = index.borrow_mut();
        let entry = script.get(*index).or_else(|| script.last())?.clone();
        *index += 1;
        entry
    }
}

impl ModelFunction for MockModel {
    fn values(&self, parameters: &DVector<f64>) -> Option<DVector<f64>> {
        self.call_history
            .borrow_mut()
            .push(MockCall::Values(parameters.clone()));
        Self::replay(&self.values, &self.values_index)
    }

    fn jacobian(&self, parameters: &DVector<f64>) -> Option<DMatrix<f64>> {
        self.call_history
            .borrow_mut()
            .push(MockCall::Jacobian(parameters.clone()));
        Self::replay(&self.jacobians, &self.jacobians_index)
    }

    fn is_jacobian_supported(&self) -> bool {
        !self.jacobians.is_empty()
    }
}
