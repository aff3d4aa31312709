//! Модуль для работы с CUDA
//!
//! Драйвер и NVRTC загружаются динамически; без них вариант CUDA просто
//! пропускается при выборе ускорителя.

pub mod bindings;
pub mod types;

mod device;

pub use device::CudaAccelerator;
