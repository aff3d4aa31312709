//! Пример использования библиотеки

use anyhow::Result;
use fast_matrix::{
    AcceleratedOperator, AcceleratorContext, Matrix, MatrixOperator, ParallelOperator,
    SerialOperator,
};
use ndarray::Array2;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Сложение двух матриц 5x3
fn add(op: &dyn MatrixOperator) -> Result<()> {
    let one = Matrix::filled(5, 3, 5.0);
    let two = Matrix::filled(5, 3, 10.0);
    let result = op.add(&one, &two)?;
    println!("add:\n{}", result);
    Ok(())
}

fn subtract(op: &dyn MatrixOperator) -> Result<()> {
    let one = Matrix::filled(5, 3, 5.0);
    let two = Matrix::filled(5, 3, 10.0);
    let result = op.subtract(&one, &two)?;
    println!("subtract:\n{}", result);
    Ok(())
}

/// Произведение 5x3 на 3x5
fn multiply(op: &dyn MatrixOperator) -> Result<()> {
    let one = Matrix::filled(5, 3, 5.0);
    let two = Matrix::filled(3, 5, 10.0);
    let result = op.multiply(&one, &two)?;
    println!("multiply:\n{}", result);
    Ok(())
}

/// Значение 10 из правого верхнего угла переходит в левый нижний
fn transpose(op: &dyn MatrixOperator) -> Result<()> {
    let mut one = Matrix::filled(5, 3, 5.0);
    let last = one.columns() - 1;
    one.set(0, last, 10.0)?;
    let result = op.transpose(&one)?;
    println!("transpose:\n{}", result);
    Ok(())
}

fn construct() -> Result<()> {
    let with_size = Matrix::new(10, 3);
    let from_array = Matrix::from(Array2::<f64>::zeros((10, 3)));
    let rows = vec![vec![0.0; 3]; 10];
    let from_rows = Matrix::from_rows(&rows)?;
    println!(
        "constructed: {:?} {:?} {:?}",
        with_size.shape(),
        from_array.shape(),
        from_rows.shape()
    );

    let mut ragged = vec![vec![0.0; 3]; 10];
    ragged[0].push(0.0);
    if let Err(e) = Matrix::from_rows(&ragged) {
        println!("ragged input rejected: {}", e);
    }
    Ok(())
}

fn run_samples(op: &dyn MatrixOperator) -> Result<()> {
    info!(backend = op.name(), "Запуск примеров");
    add(op)?;
    subtract(op)?;
    multiply(op)?;
    transpose(op)?;
    Ok(())
}

fn main() -> Result<()> {
    init_logging();

    construct()?;

    run_samples(&SerialOperator::new())?;
    run_samples(&ParallelOperator::new())?;

    let context = AcceleratorContext::from_env()?;
    if context.is_gpu_available() {
        info!(kind = %context.kind()?, "Используется GPU");
    } else {
        warn!("GPU не найден, используется хостовый ускоритель");
    }
    let accelerated = AcceleratedOperator::new(context.clone());
    let outcome = run_samples(&accelerated);
    context.dispose();
    outcome
}
