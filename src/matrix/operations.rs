//! Операции над матрицами на стороне хоста
//!
//! Здесь собраны проверки предусловий и поэлементные формулы, общие для
//! всех хостовых реализаций. Последовательный, параллельный и хостовый
//! ускоритель считают каждую ячейку одной и той же функцией, поэтому их
//! результаты совпадают побитово.

use super::types::Matrix;
use crate::error::{MatrixError, Result};
use crate::operator::Operation;
use tracing::debug;

/// Проверяет, что формы операндов поэлементной операции совпадают
pub fn check_same_shape(operation: Operation, one: &Matrix, two: &Matrix) -> Result<()> {
    if one.shape() != two.shape() {
        return Err(MatrixError::mismatch(operation, one.shape(), two.shape()));
    }
    Ok(())
}

/// Проверяет, что число столбцов левого операнда равно числу строк правого
pub fn check_multipliable(one: &Matrix, two: &Matrix) -> Result<()> {
    if one.columns() != two.rows() {
        return Err(MatrixError::mismatch(
            Operation::Multiply,
            one.shape(),
            two.shape(),
        ));
    }
    Ok(())
}

/// Форма результата операции и длина общей размерности для умножения.
///
/// Возвращает `(rows, columns, inner)`.
pub fn output_extent(
    operation: Operation,
    one: &Matrix,
    two: Option<&Matrix>,
) -> (usize, usize, usize) {
    match (operation, two) {
        (Operation::Multiply, Some(two)) => (one.rows(), two.columns(), one.columns()),
        (Operation::Transpose, _) => (one.columns(), one.rows(), 0),
        _ => (one.rows(), one.columns(), 0),
    }
}

/// Значение одной ячейки результата.
///
/// `a` и `b` лежат построчно; `columns` и `inner` описывают форму результата
/// так же, как аргументы ядер ускорителя.
#[inline]
#[allow(clippy::too_many_arguments)]
pub fn compute_cell(
    operation: Operation,
    a: &[f64],
    b: &[f64],
    row: usize,
    column: usize,
    rows: usize,
    columns: usize,
    inner: usize,
) -> f64 {
    match operation {
        Operation::Add => a[row * columns + column] + b[row * columns + column],
        Operation::Subtract => a[row * columns + column] - b[row * columns + column],
        Operation::Multiply => {
            let mut sum = 0.0f64;
            for k in 0..inner {
                sum += a[row * inner + k] * b[k * columns + column];
            }
            sum
        }
        Operation::Transpose => a[column * rows + row],
    }
}

/// Заполняет одну строку результата
#[inline]
pub fn compute_row(
    operation: Operation,
    a: &[f64],
    b: &[f64],
    row: usize,
    out: &mut [f64],
    rows: usize,
    inner: usize,
) {
    let columns = out.len();
    for (column, cell) in out.iter_mut().enumerate() {
        *cell = compute_cell(operation, a, b, row, column, rows, columns, inner);
    }
}

/// Последовательная реализация любой операции
pub fn cpu_compute(operation: Operation, one: &Matrix, two: Option<&Matrix>) -> Matrix {
    let (rows, columns, inner) = output_extent(operation, one, two);
    let b = two.map_or(one.as_slice(), Matrix::as_slice);
    let mut result = Matrix::new(rows, columns);
    if columns == 0 {
        return result;
    }
    for (row, out) in result.as_mut_slice().chunks_mut(columns).enumerate() {
        compute_row(operation, one.as_slice(), b, row, out, rows, inner);
    }
    result
}

/// Сравнивает результаты двух бэкендов с допуском `epsilon`
pub fn compare_results(first: &Matrix, second: &Matrix, epsilon: f64) -> bool {
    if first.shape() != second.shape() {
        debug!(
            first = ?first.shape(),
            second = ?second.shape(),
            "Формы результатов различаются"
        );
        return false;
    }

    let mut max_diff = 0.0f64;
    let mut diff_count = 0usize;
    for (a, b) in first.as_slice().iter().zip(second.as_slice()) {
        let diff = (a - b).abs();
        if diff > epsilon || diff.is_nan() {
            diff_count += 1;
            max_diff = max_diff.max(diff);
        }
    }

    if diff_count > 0 {
        debug!(diff_count, max_diff, "Обнаружены расхождения");
        false
    } else {
        true
    }
}
