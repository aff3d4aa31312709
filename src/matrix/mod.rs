//! Модуль для работы с матрицами
//!
//! Предоставляет:
//! - Тип плотной матрицы
//! - Операции над матрицами на стороне хоста
//! - Исходные коды ядер для ускорителей

mod types;
pub mod operations;
pub mod kernels;

pub use types::{Axis, Matrix};
pub(crate) use types::Unbind;
pub use operations::{compare_results, cpu_compute};
