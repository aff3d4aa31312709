//! Модуль для работы с OpenCL
//!
//! Содержит низкоуровневые привязки и ускоритель поверх них

pub mod bindings;
pub mod types;
pub mod utils;

mod device;

pub use device::OpenClAccelerator;
