//! Многопоточный оператор на rayon

use super::{MatrixOperator, Operation};
use crate::error::Result;
use crate::matrix::operations::{check_multipliable, check_same_shape, compute_row, output_extent};
use crate::matrix::Matrix;
use anyhow::Context;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Arc;

/// Оператор, разбивающий работу по строкам результата.
///
/// Каждая задача пишет только в свою строку результата, поэтому
/// синхронизация нужна лишь на завершении. Формула ячейки та же, что у
/// [`super::SerialOperator`], результаты совпадают побитово.
#[derive(Clone, Default)]
pub struct ParallelOperator {
    pool: Option<Arc<ThreadPool>>,
}

impl ParallelOperator {
    /// Использует глобальный пул rayon
    pub fn new() -> Self {
        Self { pool: None }
    }

    /// Создает собственный пул из `threads` потоков
    pub fn with_threads(threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("fast-matrix-{}", i))
            .build()
            .context("Failed to build parallel operator thread pool")?;
        Ok(Self {
            pool: Some(Arc::new(pool)),
        })
    }

    /// Число потоков, которые будут выполнять задачи
    pub fn threads(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }

    fn compute(&self, operation: Operation, one: &Matrix, two: Option<&Matrix>) -> Matrix {
        let (rows, columns, inner) = output_extent(operation, one, two);
        let a = one.as_slice();
        let b = two.map_or(a, Matrix::as_slice);
        let mut result = Matrix::new(rows, columns);
        if result.is_empty() {
            return result;
        }

        let out = result.as_mut_slice();
        let mut run = move || {
            out.par_chunks_mut(columns)
                .enumerate()
                .for_each(|(row, line)| compute_row(operation, a, b, row, line, rows, inner));
        };
        match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }
        result
    }
}

impl std::fmt::Debug for ParallelOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelOperator")
            .field("threads", &self.threads())
            .finish()
    }
}

impl MatrixOperator for ParallelOperator {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn add(&self, one: &Matrix, two: &Matrix) -> Result<Matrix> {
        check_same_shape(Operation::Add, one, two)?;
        Ok(self.compute(Operation::Add, one, Some(two)))
    }

    fn subtract(&self, one: &Matrix, two: &Matrix) -> Result<Matrix> {
        check_same_shape(Operation::Subtract, one, two)?;
        Ok(self.compute(Operation::Subtract, one, Some(two)))
    }

    fn multiply(&self, one: &Matrix, two: &Matrix) -> Result<Matrix> {
        check_multipliable(one, two)?;
        Ok(self.compute(Operation::Multiply, one, Some(two)))
    }

    fn transpose(&self, matrix: &Matrix) -> Result<Matrix> {
        Ok(self.compute(Operation::Transpose, matrix, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::SerialOperator;

    #[test]
    fn matches_serial_bit_for_bit() {
        let a = Matrix::random(37, 23);
        let b = Matrix::random(23, 41);
        let serial = SerialOperator::new();
        let parallel = ParallelOperator::with_threads(4).unwrap();

        let expected = serial.multiply(&a, &b).unwrap();
        let actual = parallel.multiply(&a, &b).unwrap();
        let same_bits = expected
            .as_slice()
            .iter()
            .zip(actual.as_slice())
            .all(|(x, y)| x.to_bits() == y.to_bits());
        assert!(same_bits);

        assert_eq!(parallel.transpose(&a).unwrap(), serial.transpose(&a).unwrap());
    }

    #[test]
    fn global_pool_matches_serial() {
        let a = Matrix::random(9, 7);
        let b = Matrix::random(7, 5);
        let op = ParallelOperator::new();
        let serial = SerialOperator::new();
        assert_eq!(op.multiply(&a, &b).unwrap(), serial.multiply(&a, &b).unwrap());
        assert_eq!(op.add(&a, &a).unwrap(), serial.add(&a, &a).unwrap());
    }

    #[test]
    fn dedicated_pool_reports_threads() {
        let op = ParallelOperator::with_threads(3).unwrap();
        assert_eq!(op.threads(), 3);
        assert!(ParallelOperator::new().threads() >= 1);
    }

    #[test]
    fn empty_result_is_returned_without_tasks() {
        let op = ParallelOperator::new();
        let t = op.transpose(&Matrix::new(0, 4)).unwrap();
        assert_eq!(t.shape(), (4, 0));
        let c = op.multiply(&Matrix::new(2, 0), &Matrix::new(0, 3)).unwrap();
        assert_eq!(c, Matrix::new(2, 3));
    }
}
