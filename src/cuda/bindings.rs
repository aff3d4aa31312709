//! Низкоуровневые привязки к CUDA driver API и NVRTC
//!
//! Обе библиотеки загружаются во время выполнения. Драйвер дает память,
//! потоки и запуск ядер; NVRTC компилирует исходник ядер в PTX.

use super::types::*;
use anyhow::{anyhow, Result};
use libloading::Library;
use std::ffi::{c_char, c_void};
use std::path::Path;
use tracing::debug;

fn driver_names() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["nvcuda.dll"]
    }
    #[cfg(target_os = "macos")]
    {
        &[]
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        &["libcuda.so.1", "libcuda.so"]
    }
}

fn nvrtc_names() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["nvrtc64_120_0.dll", "nvrtc64_112_0.dll", "nvrtc64_110_0.dll"]
    }
    #[cfg(target_os = "macos")]
    {
        &[]
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        &["libnvrtc.so", "libnvrtc.so.12", "libnvrtc.so.11.2"]
    }
}

/// Открывает библиотеку по явному пути или по первому найденному имени
fn open(what: &str, path: Option<&Path>, names: &[&str]) -> Result<Option<Library>> {
    match path {
        // SAFETY: загрузка системных библиотек NVIDIA
        Some(path) => unsafe { Library::new(path) }
            .map(Some)
            .map_err(|e| anyhow!("Failed to load {} from {}: {}", what, path.display(), e)),
        None => {
            let found = names.iter().find_map(|name| unsafe { Library::new(name) }.ok());
            if found.is_none() {
                debug!("Библиотека {} не найдена", what);
            }
            Ok(found)
        }
    }
}

macro_rules! symbol {
    ($library:expr, $name:ident) => {{
        let symbol = $library
            .get(concat!(stringify!($name), "\0").as_bytes())
            .map_err(|e| anyhow!("Symbol {} not found: {}", stringify!($name), e))?;
        *symbol
    }};
}

/// Таблица функций CUDA driver API
#[allow(non_snake_case)]
pub struct CudaApi {
    _library: Library,

    pub cuInit: unsafe extern "C" fn(flags: u32) -> CUresult,
    pub cuDeviceGetCount: unsafe extern "C" fn(count: *mut i32) -> CUresult,
    pub cuDeviceGet: unsafe extern "C" fn(device: *mut CUdevice, ordinal: i32) -> CUresult,
    pub cuDeviceGetName:
        unsafe extern "C" fn(name: *mut c_char, len: i32, device: CUdevice) -> CUresult,

    pub cuCtxCreate_v2:
        unsafe extern "C" fn(context: *mut CUcontext, flags: u32, device: CUdevice) -> CUresult,
    pub cuCtxSetCurrent: unsafe extern "C" fn(context: CUcontext) -> CUresult,
    pub cuCtxSynchronize: unsafe extern "C" fn() -> CUresult,
    pub cuCtxDestroy_v2: unsafe extern "C" fn(context: CUcontext) -> CUresult,

    pub cuModuleLoadData: unsafe extern "C" fn(module: *mut CUmodule, image: *const c_void) -> CUresult,
    pub cuModuleGetFunction: unsafe extern "C" fn(
        function: *mut CUfunction,
        module: CUmodule,
        name: *const c_char,
    ) -> CUresult,
    pub cuModuleUnload: unsafe extern "C" fn(module: CUmodule) -> CUresult,

    pub cuMemAlloc_v2: unsafe extern "C" fn(ptr: *mut CUdeviceptr, bytes: usize) -> CUresult,
    pub cuMemFree_v2: unsafe extern "C" fn(ptr: CUdeviceptr) -> CUresult,
    pub cuMemcpyHtoDAsync_v2: unsafe extern "C" fn(
        dst: CUdeviceptr,
        src: *const c_void,
        bytes: usize,
        stream: CUstream,
    ) -> CUresult,
    pub cuMemcpyDtoH_v2:
        unsafe extern "C" fn(dst: *mut c_void, src: CUdeviceptr, bytes: usize) -> CUresult,

    pub cuStreamCreate: unsafe extern "C" fn(stream: *mut CUstream, flags: u32) -> CUresult,
    pub cuStreamSynchronize: unsafe extern "C" fn(stream: CUstream) -> CUresult,
    pub cuStreamDestroy_v2: unsafe extern "C" fn(stream: CUstream) -> CUresult,

    pub cuLaunchKernel: unsafe extern "C" fn(
        function: CUfunction,
        grid_x: u32,
        grid_y: u32,
        grid_z: u32,
        block_x: u32,
        block_y: u32,
        block_z: u32,
        shared_mem_bytes: u32,
        stream: CUstream,
        kernel_params: *mut *mut c_void,
        extra: *mut *mut c_void,
    ) -> CUresult,
}

impl CudaApi {
    /// `Ok(None)`, если драйвер не установлен
    pub fn load(path: Option<&Path>) -> Result<Option<Self>> {
        let Some(library) = open("CUDA driver", path, driver_names())? else {
            return Ok(None);
        };

        // SAFETY: сигнатуры повторяют cuda.h
        unsafe {
            Ok(Some(Self {
                cuInit: symbol!(library, cuInit),
                cuDeviceGetCount: symbol!(library, cuDeviceGetCount),
                cuDeviceGet: symbol!(library, cuDeviceGet),
                cuDeviceGetName: symbol!(library, cuDeviceGetName),
                cuCtxCreate_v2: symbol!(library, cuCtxCreate_v2),
                cuCtxSetCurrent: symbol!(library, cuCtxSetCurrent),
                cuCtxSynchronize: symbol!(library, cuCtxSynchronize),
                cuCtxDestroy_v2: symbol!(library, cuCtxDestroy_v2),
                cuModuleLoadData: symbol!(library, cuModuleLoadData),
                cuModuleGetFunction: symbol!(library, cuModuleGetFunction),
                cuModuleUnload: symbol!(library, cuModuleUnload),
                cuMemAlloc_v2: symbol!(library, cuMemAlloc_v2),
                cuMemFree_v2: symbol!(library, cuMemFree_v2),
                cuMemcpyHtoDAsync_v2: symbol!(library, cuMemcpyHtoDAsync_v2),
                cuMemcpyDtoH_v2: symbol!(library, cuMemcpyDtoH_v2),
                cuStreamCreate: symbol!(library, cuStreamCreate),
                cuStreamSynchronize: symbol!(library, cuStreamSynchronize),
                cuStreamDestroy_v2: symbol!(library, cuStreamDestroy_v2),
                cuLaunchKernel: symbol!(library, cuLaunchKernel),
                _library: library,
            }))
        }
    }
}

/// Таблица функций NVRTC
#[allow(non_snake_case)]
pub struct NvrtcApi {
    _library: Library,

    pub nvrtcCreateProgram: unsafe extern "C" fn(
        program: *mut nvrtcProgram,
        source: *const c_char,
        name: *const c_char,
        num_headers: i32,
        headers: *const *const c_char,
        include_names: *const *const c_char,
    ) -> nvrtcResult,
    pub nvrtcCompileProgram: unsafe extern "C" fn(
        program: nvrtcProgram,
        num_options: i32,
        options: *const *const c_char,
    ) -> nvrtcResult,
    pub nvrtcGetPTXSize: unsafe extern "C" fn(program: nvrtcProgram, size: *mut usize) -> nvrtcResult,
    pub nvrtcGetPTX: unsafe extern "C" fn(program: nvrtcProgram, ptx: *mut c_char) -> nvrtcResult,
    pub nvrtcGetProgramLogSize:
        unsafe extern "C" fn(program: nvrtcProgram, size: *mut usize) -> nvrtcResult,
    pub nvrtcGetProgramLog: unsafe extern "C" fn(program: nvrtcProgram, log: *mut c_char) -> nvrtcResult,
    pub nvrtcDestroyProgram: unsafe extern "C" fn(program: *mut nvrtcProgram) -> nvrtcResult,
}

impl NvrtcApi {
    /// `Ok(None)`, если NVRTC не установлен
    pub fn load(path: Option<&Path>) -> Result<Option<Self>> {
        let Some(library) = open("NVRTC", path, nvrtc_names())? else {
            return Ok(None);
        };

        // SAFETY: сигнатуры повторяют nvrtc.h
        unsafe {
            Ok(Some(Self {
                nvrtcCreateProgram: symbol!(library, nvrtcCreateProgram),
                nvrtcCompileProgram: symbol!(library, nvrtcCompileProgram),
                nvrtcGetPTXSize: symbol!(library, nvrtcGetPTXSize),
                nvrtcGetPTX: symbol!(library, nvrtcGetPTX),
                nvrtcGetProgramLogSize: symbol!(library, nvrtcGetProgramLogSize),
                nvrtcGetProgramLog: symbol!(library, nvrtcGetProgramLog),
                nvrtcDestroyProgram: symbol!(library, nvrtcDestroyProgram),
                _library: library,
            }))
        }
    }
}
