//! Однопоточный оператор

use super::{MatrixOperator, Operation};
use crate::error::Result;
use crate::matrix::operations::{check_multipliable, check_same_shape, cpu_compute};
use crate::matrix::Matrix;

/// Эталонная реализация: один поток, без разбиения на задачи
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialOperator;

impl SerialOperator {
    pub fn new() -> Self {
        Self
    }
}

impl MatrixOperator for SerialOperator {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn add(&self, one: &Matrix, two: &Matrix) -> Result<Matrix> {
        check_same_shape(Operation::Add, one, two)?;
        Ok(cpu_compute(Operation::Add, one, Some(two)))
    }

    fn subtract(&self, one: &Matrix, two: &Matrix) -> Result<Matrix> {
        check_same_shape(Operation::Subtract, one, two)?;
        Ok(cpu_compute(Operation::Subtract, one, Some(two)))
    }

    fn multiply(&self, one: &Matrix, two: &Matrix) -> Result<Matrix> {
        check_multipliable(one, two)?;
        Ok(cpu_compute(Operation::Multiply, one, Some(two)))
    }

    fn transpose(&self, matrix: &Matrix) -> Result<Matrix> {
        Ok(cpu_compute(Operation::Transpose, matrix, None))
    }
}
