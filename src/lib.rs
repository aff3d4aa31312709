//! Плотные матрицы двойной точности с тремя взаимозаменяемыми бэкендами:
//! однопоточным, многопоточным и ускорителем (CUDA / OpenCL / хост).

pub mod accel;
pub mod config;
pub mod cuda;
pub mod error;
pub mod matrix;
pub mod opencl;
pub mod operator;
pub mod utils;

// Реэкспортируем макросы на уровень крейта
#[macro_use]
mod macros {
    /// Макрос для обработки кодов возврата OpenCL.
    ///
    /// `cl_check!(api, clFinish(queue))` вызывает функцию из загруженной
    /// таблицы и превращает ненулевой код в `anyhow::Result<()>`.
    #[macro_export]
    macro_rules! cl_check {
        ($api:expr, $func:ident($($arg:expr),* $(,)?)) => {{
            #[allow(unused_unsafe)]
            let code = unsafe { ($api.$func)($($arg),*) };
            if code != $crate::opencl::types::CL_SUCCESS {
                Err(anyhow::anyhow!(
                    "{} failed: {}",
                    stringify!($func),
                    $crate::opencl::utils::error_name(code)
                ))
            } else {
                Ok(()) as anyhow::Result<()>
            }
        }};
    }

    /// Макрос для функций OpenCL, возвращающих объект.
    ///
    /// Последний аргумент (`errcode_ret`) добавляется автоматически.
    #[macro_export]
    macro_rules! cl_create {
        ($api:expr, $func:ident($($arg:expr),* $(,)?)) => {{
            let mut code: $crate::opencl::types::cl_int = 0;
            #[allow(unused_unsafe)]
            let obj = unsafe { ($api.$func)($($arg,)* &mut code) };
            if obj.is_null() || code != $crate::opencl::types::CL_SUCCESS {
                Err(anyhow::anyhow!(
                    "Failed to create OpenCL object: {} ({})",
                    stringify!($func),
                    $crate::opencl::utils::error_name(code)
                ))
            } else {
                Ok(obj) as anyhow::Result<_>
            }
        }};
    }

    /// Макрос для обработки кодов возврата CUDA driver API и NVRTC
    #[macro_export]
    macro_rules! cu_check {
        ($api:expr, $func:ident($($arg:expr),* $(,)?)) => {{
            #[allow(unused_unsafe)]
            let code = unsafe { ($api.$func)($($arg),*) };
            if code != 0 {
                Err(anyhow::anyhow!("{} failed with CUDA error code {}", stringify!($func), code))
            } else {
                Ok(()) as anyhow::Result<()>
            }
        }};
    }
}

// Реэкспорт основных типов для удобства
pub use accel::{Accelerator, AcceleratorContext, AcceleratorKind};
pub use config::AcceleratorConfig;
pub use error::{MatrixError, Result};
pub use matrix::{Axis, Matrix};
pub use operator::{
    AcceleratedOperator, MatrixOperator, Operation, ParallelOperator, SerialOperator,
};
