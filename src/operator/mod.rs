//! Операторы: единый контракт матричной арифметики и три его реализации
//!
//! - [`SerialOperator`]: один поток, эталонная реализация
//! - [`ParallelOperator`]: разбиение по строкам результата на пуле rayon
//! - [`AcceleratedOperator`]: выполнение на ускорителе через [`crate::accel`]

mod accelerated;
mod parallel;
mod serial;

pub use accelerated::AcceleratedOperator;
pub use parallel::ParallelOperator;
pub use serial::SerialOperator;

use crate::error::{MatrixError, Result};
use crate::matrix::Matrix;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Вид матричной операции. Для каждого вида на ускорителе компилируется
/// отдельное ядро.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Add,
    Subtract,
    Multiply,
    Transpose,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Add,
        Operation::Subtract,
        Operation::Multiply,
        Operation::Transpose,
    ];

    /// Количество операндов
    pub fn arity(self) -> usize {
        match self {
            Operation::Transpose => 1,
            _ => 2,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Add => "add",
            Operation::Subtract => "subtract",
            Operation::Multiply => "multiply",
            Operation::Transpose => "transpose",
        };
        f.write_str(name)
    }
}

/// Общий контракт всех бэкендов.
///
/// Операнды никогда не изменяются, результат всегда размещается заново.
/// Проверка форм выполняется до любых вычислений.
pub trait MatrixOperator: Send + Sync {
    /// Короткое имя бэкенда для логов и отчетов
    fn name(&self) -> &'static str;

    /// `one + two`, формы должны совпадать
    fn add(&self, one: &Matrix, two: &Matrix) -> Result<Matrix>;

    /// `one - two`, формы должны совпадать
    fn subtract(&self, one: &Matrix, two: &Matrix) -> Result<Matrix>;

    /// Матричное произведение, `one.columns() == two.rows()`
    fn multiply(&self, one: &Matrix, two: &Matrix) -> Result<Matrix>;

    fn transpose(&self, matrix: &Matrix) -> Result<Matrix>;

    /// Динамический вызов операции по ее виду.
    ///
    /// Отсутствующий операнд (`None` или нехватка элементов в срезе) дает
    /// [`MatrixError::NullOperand`]; лишние операнды игнорируются.
    fn apply(&self, operation: Operation, operands: &[Option<&Matrix>]) -> Result<Matrix> {
        let operand = |position: usize| {
            operands
                .get(position)
                .copied()
                .flatten()
                .ok_or(MatrixError::NullOperand {
                    operation,
                    position,
                })
        };

        match operation {
            Operation::Add => self.add(operand(0)?, operand(1)?),
            Operation::Subtract => self.subtract(operand(0)?, operand(1)?),
            Operation::Multiply => self.multiply(operand(0)?, operand(1)?),
            Operation::Transpose => self.transpose(operand(0)?),
        }
    }
}
