//! Типы CUDA driver API и NVRTC

#![allow(non_camel_case_types)]

pub type CUresult = i32;
pub type CUdevice = i32;
pub type CUdeviceptr = u64;
pub type CUcontext = *mut std::ffi::c_void;
pub type CUmodule = *mut std::ffi::c_void;
pub type CUfunction = *mut std::ffi::c_void;
pub type CUstream = *mut std::ffi::c_void;

pub type nvrtcResult = i32;
pub type nvrtcProgram = *mut std::ffi::c_void;

pub const CUDA_SUCCESS: CUresult = 0;
pub const CUDA_ERROR_NO_DEVICE: CUresult = 100;

/// Поток по умолчанию
pub const DEFAULT_STREAM: CUstream = std::ptr::null_mut();

/// Сторона блока потоков при запуске ядер
pub const BLOCK_SIDE: u32 = 16;
