//! Общие сценарии для всех бэкендов
#![allow(dead_code)]

use fast_matrix::{AcceleratorConfig, AcceleratorContext, Matrix, MatrixError, MatrixOperator};

pub const SIZE: usize = 5;

/// Контекст, закрепленный за хостовым ускорителем
pub fn host_context() -> AcceleratorContext {
    AcceleratorContext::new(AcceleratorConfig {
        host_threads: Some(2),
        ..AcceleratorConfig::host_only()
    })
}

pub fn add_scenario(op: &dyn MatrixOperator) {
    let one = Matrix::filled(SIZE, SIZE, 15.0);
    let two = Matrix::filled(SIZE, SIZE, 5.0);
    let result = op.add(&one, &two).unwrap();
    assert_eq!(result, Matrix::filled(SIZE, SIZE, 20.0));
    // Операнды не меняются
    assert_eq!(one, Matrix::filled(SIZE, SIZE, 15.0));
    assert_eq!(two, Matrix::filled(SIZE, SIZE, 5.0));
}

pub fn subtract_scenario(op: &dyn MatrixOperator) {
    let one = Matrix::filled(SIZE, SIZE, 15.0);
    let two = Matrix::filled(SIZE, SIZE, 5.0);
    let result = op.subtract(&one, &two).unwrap();
    assert_eq!(result, Matrix::filled(SIZE, SIZE, 10.0));
}

pub fn multiply_scenario(op: &dyn MatrixOperator) {
    let one = Matrix::filled(SIZE, SIZE, 15.0);
    let two = Matrix::filled(SIZE, SIZE, 5.0);
    let result = op.multiply(&one, &two).unwrap();
    assert_eq!(result, Matrix::filled(SIZE, SIZE, 375.0));
}

pub fn rectangular_multiply_scenario(op: &dyn MatrixOperator) {
    let one = Matrix::from_rows(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]).unwrap();
    let two = Matrix::from_rows(&[[7.0, 8.0], [9.0, 10.0], [11.0, 12.0]]).unwrap();
    let result = op.multiply(&one, &two).unwrap();
    assert_eq!(result, Matrix::from_rows(&[[58.0, 64.0], [139.0, 154.0]]).unwrap());
}

pub fn transpose_scenario(op: &dyn MatrixOperator) {
    let mut one = Matrix::filled(SIZE, SIZE, 10.0);
    one[(0, SIZE - 1)] = 5.0;
    let result = op.transpose(&one).unwrap();
    let mut expected = Matrix::filled(SIZE, SIZE, 10.0);
    expected[(SIZE - 1, 0)] = 5.0;
    assert_eq!(result, expected);

    let wide = Matrix::from_rows(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]).unwrap();
    let tall = op.transpose(&wide).unwrap();
    assert_eq!(tall, Matrix::from_rows(&[[1.0, 4.0], [2.0, 5.0], [3.0, 6.0]]).unwrap());
}

pub fn mismatch_scenarios(op: &dyn MatrixOperator) {
    let one = Matrix::new(5, 3);
    let two = Matrix::new(4, 3);
    for err in [op.add(&one, &two).unwrap_err(), op.subtract(&one, &two).unwrap_err()] {
        assert!(matches!(err, MatrixError::DimensionMismatch { .. }));
        assert_eq!(err.dimensions(), Some((5, 3, 4, 3)));
    }

    let three = Matrix::new(4, 5);
    let err = op.multiply(&one, &three).unwrap_err();
    assert!(matches!(err, MatrixError::DimensionMismatch { .. }));
    assert_eq!(err.dimensions(), Some((5, 3, 4, 5)));
}

pub fn run_all(op: &dyn MatrixOperator) {
    add_scenario(op);
    subtract_scenario(op);
    multiply_scenario(op);
    rectangular_multiply_scenario(op);
    transpose_scenario(op);
    mismatch_scenarios(op);
}
