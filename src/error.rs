//! Ошибки матричных операций

use crate::operator::Operation;

/// Ошибки, возникающие при построении матриц и выполнении операций.
///
/// Все проверки предусловий выполняются до начала вычислений и до любого
/// обращения к ускорителю, частичных результатов не бывает.
#[derive(Debug, thiserror::Error)]
pub enum MatrixError {
    /// Отсутствует операнд, необходимый операции
    #[error("{operation} is missing operand #{position}")]
    NullOperand { operation: Operation, position: usize },

    /// Размерности операндов несовместимы
    #[error(
        "wrong dimensions in {operation}: left operand is {left_rows}x{left_columns}, \
         right operand is {right_rows}x{right_columns}"
    )]
    DimensionMismatch {
        operation: Operation,
        left_rows: usize,
        left_columns: usize,
        right_rows: usize,
        right_columns: usize,
    },

    /// Вложенный массив неровный
    #[error(
        "array provided for conversion is jagged: element at index {index} has length {actual} \
         while element 0 has length {expected}"
    )]
    RaggedInput {
        index: usize,
        expected: usize,
        actual: usize,
    },

    /// Плоский буфер не соответствует заявленной форме
    #[error("buffer of {actual} elements cannot back a {rows}x{columns} matrix")]
    BufferLength {
        rows: usize,
        columns: usize,
        actual: usize,
    },

    #[error("index ({row}, {column}) is out of bounds for a {rows}x{columns} matrix")]
    IndexOutOfBounds {
        row: usize,
        column: usize,
        rows: usize,
        columns: usize,
    },

    /// Контекст ускорителя уже освобожден
    #[error("accelerator context has been disposed")]
    Disposed,

    /// Сбой на стороне ускорителя (выделение памяти, компиляция ядра, копирование)
    #[error("accelerator failure: {0:#}")]
    AcceleratorFailure(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, MatrixError>;

impl MatrixError {
    pub(crate) fn mismatch(
        operation: Operation,
        left: (usize, usize),
        right: (usize, usize),
    ) -> Self {
        MatrixError::DimensionMismatch {
            operation,
            left_rows: left.0,
            left_columns: left.1,
            right_rows: right.0,
            right_columns: right.1,
        }
    }

    /// Возвращает все четыре размерности для ошибок несовпадения форм
    pub fn dimensions(&self) -> Option<(usize, usize, usize, usize)> {
        match *self {
            MatrixError::DimensionMismatch {
                left_rows,
                left_columns,
                right_rows,
                right_columns,
                ..
            } => Some((left_rows, left_columns, right_rows, right_columns)),
            _ => None,
        }
    }
}
