//! Оператор на ускорителе

use super::{MatrixOperator, Operation};
use crate::accel::{kernel_dims, AcceleratorContext, DeviceBuffer, LaunchArgs, PendingUpload};
use crate::error::{MatrixError, Result};
use crate::matrix::operations::{check_multipliable, check_same_shape, output_extent};
use crate::matrix::Matrix;
use crate::utils::measure_time;
use anyhow::Context;
use tracing::debug;

/// Оператор, выполняющий операции на выбранном ускорителе.
///
/// Порядок одной операции: проверка форм, загрузка операндов в их
/// закрепленные буферы, выделение буфера результата, ожидание загрузок,
/// запуск ядра, синхронизация устройства и чтение результата. На GPU
/// заранее проверяется, что все смещения ядра помещаются в `int`.
#[derive(Debug, Clone, Default)]
pub struct AcceleratedOperator {
    context: AcceleratorContext,
}

impl AcceleratedOperator {
    pub fn new(context: AcceleratorContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &AcceleratorContext {
        &self.context
    }

    /// Освобождает буфер устройства, закрепленный за матрицей
    pub fn release(&self, matrix: &Matrix) -> Result<bool> {
        Ok(self.context.transfers()?.release(matrix))
    }

    fn compute(&self, operation: Operation, one: &Matrix, two: Option<&Matrix>) -> Result<Matrix> {
        let (rows, columns, inner) = output_extent(operation, one, two);

        // Пустые операнды или результат не требуют обращения к устройству,
        // но освобожденный контекст все равно отвергается
        let empty_input = one.is_empty() || two.is_some_and(Matrix::is_empty);
        if empty_input || rows * columns == 0 {
            if self.context.is_disposed() {
                return Err(MatrixError::Disposed);
            }
            return Ok(Matrix::new(rows, columns));
        }

        let session = self.context.session()?;
        if session.accelerator.kind().is_gpu() {
            kernel_dims(rows, columns, inner)?;
        }
        let kernel = session.kernels.get(operation);

        let (result, elapsed) = measure_time(|| -> anyhow::Result<Vec<f64>> {
            let mut first = session.transfers.upload(one)?;
            let mut second = match two {
                Some(two) => Some(session.transfers.upload(two)?),
                None => None,
            };

            let output = DeviceBuffer::allocate(&session.accelerator, rows * columns)
                .context("Failed to allocate result buffer")?;

            first.wait()?;
            if let Some(second) = second.as_mut() {
                second.wait()?;
            }
            let a = first.buffer();
            let b = second.as_ref().map_or(a, PendingUpload::buffer);

            kernel.launch(&LaunchArgs {
                a,
                b,
                out: output.handle(),
                rows,
                columns,
                inner,
            })?;
            session.accelerator.synchronize()?;
            let data = output.download()?;

            // Буферы операндов живут до чтения результата, даже если
            // параллельно их убрали из кэша
            drop(output);
            drop(second);
            drop(first);
            Ok(data)
        });
        let data = result.with_context(|| format!("Accelerated {} failed", operation))?;

        debug!(
            %operation,
            rows,
            columns,
            ?elapsed,
            device = session.accelerator.device_name(),
            "Операция на ускорителе выполнена"
        );
        Matrix::from_vec(rows, columns, data)
    }
}

impl MatrixOperator for AcceleratedOperator {
    fn name(&self) -> &'static str {
        "accelerated"
    }

    fn add(&self, one: &Matrix, two: &Matrix) -> Result<Matrix> {
        check_same_shape(Operation::Add, one, two)?;
        self.compute(Operation::Add, one, Some(two))
    }

    fn subtract(&self, one: &Matrix, two: &Matrix) -> Result<Matrix> {
        check_same_shape(Operation::Subtract, one, two)?;
        self.compute(Operation::Subtract, one, Some(two))
    }

    fn multiply(&self, one: &Matrix, two: &Matrix) -> Result<Matrix> {
        check_multipliable(one, two)?;
        self.compute(Operation::Multiply, one, Some(two))
    }

    fn transpose(&self, matrix: &Matrix) -> Result<Matrix> {
        self.compute(Operation::Transpose, matrix, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AcceleratorConfig;
    use crate::operator::SerialOperator;

    fn host_operator() -> AcceleratedOperator {
        AcceleratedOperator::new(AcceleratorContext::new(AcceleratorConfig {
            host_threads: Some(2),
            ..AcceleratorConfig::host_only()
        }))
    }

    #[test]
    fn agrees_with_serial() {
        let op = host_operator();
        let serial = SerialOperator::new();
        let a = Matrix::random(6, 4);
        let b = Matrix::random(4, 5);
        let c = Matrix::random(6, 4);

        assert_eq!(op.multiply(&a, &b).unwrap(), serial.multiply(&a, &b).unwrap());
        assert_eq!(op.add(&a, &c).unwrap(), serial.add(&a, &c).unwrap());
        assert_eq!(op.subtract(&a, &c).unwrap(), serial.subtract(&a, &c).unwrap());
        assert_eq!(op.transpose(&a).unwrap(), serial.transpose(&a).unwrap());
    }

    #[test]
    fn mismatch_is_reported_before_device_work() {
        let op = host_operator();
        let err = op
            .add(&Matrix::new(5, 3), &Matrix::new(4, 3))
            .unwrap_err();
        assert!(matches!(err, MatrixError::DimensionMismatch { .. }));
        assert_eq!(op.context().accelerator().unwrap().stats().uploads, 0);
    }

    #[test]
    fn empty_operands_skip_the_device() {
        let op = host_operator();
        let c = op.multiply(&Matrix::new(3, 0), &Matrix::new(0, 2)).unwrap();
        assert_eq!(c, Matrix::new(3, 2));
        let t = op.transpose(&Matrix::new(0, 4)).unwrap();
        assert_eq!(t.shape(), (4, 0));
        assert_eq!(op.context().accelerator().unwrap().stats().launches, 0);
    }

    #[test]
    fn operands_keep_their_buffers() {
        let op = host_operator();
        let a = Matrix::filled(3, 3, 2.0);
        let b = Matrix::filled(3, 3, 1.0);
        op.add(&a, &b).unwrap();
        op.multiply(&a, &b).unwrap();
        op.subtract(&a, &b).unwrap();
        assert_eq!(op.context().transfers().unwrap().buffer_allocations(), 2);
        assert!(op.release(&a).unwrap());
        assert!(!op.release(&a).unwrap());
    }

    #[test]
    fn disposed_context_is_rejected() {
        let op = host_operator();
        op.context().dispose();
        let a = Matrix::filled(2, 2, 1.0);
        assert!(matches!(op.add(&a, &a), Err(MatrixError::Disposed)));
        assert!(matches!(op.transpose(&Matrix::new(0, 0)), Err(MatrixError::Disposed)));
    }
}
