//! Низкоуровневые привязки к OpenCL API
//!
//! Библиотека загружается во время выполнения, поэтому сборка не требует
//! установленного OpenCL, а его отсутствие просто пропускает этот вариант
//! в цепочке выбора ускорителя.

use super::types::*;
use anyhow::{anyhow, Result};
use libloading::Library;
use std::ffi::c_void;
use std::path::Path;
use tracing::debug;

/// Имена библиотеки OpenCL для текущей платформы
fn candidate_names() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["OpenCL.dll"]
    }
    #[cfg(target_os = "macos")]
    {
        &["/System/Library/Frameworks/OpenCL.framework/OpenCL"]
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        &["libOpenCL.so.1", "libOpenCL.so"]
    }
}

/// Таблица функций OpenCL, загруженная из разделяемой библиотеки.
///
/// Указатели действительны, пока жива `_library`.
#[allow(non_snake_case)]
pub struct OpenClApi {
    _library: Library,

    pub clGetPlatformIDs:
        unsafe extern "C" fn(num_entries: cl_uint, platforms: *mut cl_platform_id, num_platforms: *mut cl_uint) -> cl_int,

    pub clGetPlatformInfo: unsafe extern "C" fn(
        platform: cl_platform_id,
        param_name: cl_platform_info,
        param_value_size: usize,
        param_value: *mut c_void,
        param_value_size_ret: *mut usize,
    ) -> cl_int,

    pub clGetDeviceIDs: unsafe extern "C" fn(
        platform: cl_platform_id,
        device_type: cl_device_type,
        num_entries: cl_uint,
        devices: *mut cl_device_id,
        num_devices: *mut cl_uint,
    ) -> cl_int,

    pub clGetDeviceInfo: unsafe extern "C" fn(
        device: cl_device_id,
        param_name: cl_device_info,
        param_value_size: usize,
        param_value: *mut c_void,
        param_value_size_ret: *mut usize,
    ) -> cl_int,

    pub clCreateContext: unsafe extern "C" fn(
        properties: *const cl_context_properties,
        num_devices: cl_uint,
        devices: *const cl_device_id,
        pfn_notify: Option<unsafe extern "C" fn(*const i8, *const c_void, usize, *mut c_void)>,
        user_data: *mut c_void,
        errcode_ret: *mut cl_int,
    ) -> cl_context,

    pub clCreateCommandQueue: unsafe extern "C" fn(
        context: cl_context,
        device: cl_device_id,
        properties: cl_command_queue_properties,
        errcode_ret: *mut cl_int,
    ) -> cl_command_queue,

    pub clCreateProgramWithSource: unsafe extern "C" fn(
        context: cl_context,
        count: cl_uint,
        strings: *const *const i8,
        lengths: *const usize,
        errcode_ret: *mut cl_int,
    ) -> cl_program,

    pub clBuildProgram: unsafe extern "C" fn(
        program: cl_program,
        num_devices: cl_uint,
        device_list: *const cl_device_id,
        options: *const i8,
        pfn_notify: Option<unsafe extern "C" fn(cl_program, *mut c_void)>,
        user_data: *mut c_void,
    ) -> cl_int,

    pub clGetProgramBuildInfo: unsafe extern "C" fn(
        program: cl_program,
        device: cl_device_id,
        param_name: cl_program_build_info,
        param_value_size: usize,
        param_value: *mut c_void,
        param_value_size_ret: *mut usize,
    ) -> cl_int,

    pub clCreateKernel:
        unsafe extern "C" fn(program: cl_program, kernel_name: *const i8, errcode_ret: *mut cl_int) -> cl_kernel,

    pub clSetKernelArg: unsafe extern "C" fn(
        kernel: cl_kernel,
        arg_index: cl_uint,
        arg_size: usize,
        arg_value: *const c_void,
    ) -> cl_int,

    pub clCreateBuffer: unsafe extern "C" fn(
        context: cl_context,
        flags: cl_mem_flags,
        size: usize,
        host_ptr: *mut c_void,
        errcode_ret: *mut cl_int,
    ) -> cl_mem,

    pub clEnqueueNDRangeKernel: unsafe extern "C" fn(
        command_queue: cl_command_queue,
        kernel: cl_kernel,
        work_dim: cl_uint,
        global_work_offset: *const usize,
        global_work_size: *const usize,
        local_work_size: *const usize,
        num_events_in_wait_list: cl_uint,
        event_wait_list: *const cl_event,
        event: *mut cl_event,
    ) -> cl_int,

    pub clEnqueueReadBuffer: unsafe extern "C" fn(
        command_queue: cl_command_queue,
        buffer: cl_mem,
        blocking_read: cl_bool,
        offset: usize,
        size: usize,
        ptr: *mut c_void,
        num_events_in_wait_list: cl_uint,
        event_wait_list: *const cl_event,
        event: *mut cl_event,
    ) -> cl_int,

    pub clEnqueueWriteBuffer: unsafe extern "C" fn(
        command_queue: cl_command_queue,
        buffer: cl_mem,
        blocking_write: cl_bool,
        offset: usize,
        size: usize,
        ptr: *const c_void,
        num_events_in_wait_list: cl_uint,
        event_wait_list: *const cl_event,
        event: *mut cl_event,
    ) -> cl_int,

    pub clFinish: unsafe extern "C" fn(command_queue: cl_command_queue) -> cl_int,

    pub clReleaseMemObject: unsafe extern "C" fn(memobj: cl_mem) -> cl_int,
    pub clReleaseKernel: unsafe extern "C" fn(kernel: cl_kernel) -> cl_int,
    pub clReleaseProgram: unsafe extern "C" fn(program: cl_program) -> cl_int,
    pub clReleaseCommandQueue: unsafe extern "C" fn(command_queue: cl_command_queue) -> cl_int,
    pub clReleaseContext: unsafe extern "C" fn(context: cl_context) -> cl_int,
}

/// Достает символ из библиотеки как указатель на функцию
macro_rules! symbol {
    ($library:expr, $name:ident) => {{
        let symbol = $library
            .get(concat!(stringify!($name), "\0").as_bytes())
            .map_err(|e| anyhow!("Symbol {} not found: {}", stringify!($name), e))?;
        *symbol
    }};
}

impl OpenClApi {
    /// Загружает OpenCL по явному пути или по стандартным именам.
    ///
    /// `Ok(None)`, если библиотека не найдена, это не ошибка.
    pub fn load(path: Option<&Path>) -> Result<Option<Self>> {
        let library = match path {
            // SAFETY: загрузка системной библиотеки OpenCL, ее инициализаторы
            // не имеют побочных эффектов для нашего процесса.
            Some(path) => unsafe { Library::new(path) }
                .map_err(|e| anyhow!("Failed to load OpenCL from {}: {}", path.display(), e))?,
            None => {
                let found = candidate_names()
                    .iter()
                    .find_map(|name| unsafe { Library::new(name) }.ok());
                match found {
                    Some(library) => library,
                    None => {
                        debug!("Библиотека OpenCL не найдена");
                        return Ok(None);
                    }
                }
            }
        };

        // SAFETY: сигнатуры полей повторяют заголовки OpenCL 1.2.
        unsafe {
            Ok(Some(Self {
                clGetPlatformIDs: symbol!(library, clGetPlatformIDs),
                clGetPlatformInfo: symbol!(library, clGetPlatformInfo),
                clGetDeviceIDs: symbol!(library, clGetDeviceIDs),
                clGetDeviceInfo: symbol!(library, clGetDeviceInfo),
                clCreateContext: symbol!(library, clCreateContext),
                clCreateCommandQueue: symbol!(library, clCreateCommandQueue),
                clCreateProgramWithSource: symbol!(library, clCreateProgramWithSource),
                clBuildProgram: symbol!(library, clBuildProgram),
                clGetProgramBuildInfo: symbol!(library, clGetProgramBuildInfo),
                clCreateKernel: symbol!(library, clCreateKernel),
                clSetKernelArg: symbol!(library, clSetKernelArg),
                clCreateBuffer: symbol!(library, clCreateBuffer),
                clEnqueueNDRangeKernel: symbol!(library, clEnqueueNDRangeKernel),
                clEnqueueReadBuffer: symbol!(library, clEnqueueReadBuffer),
                clEnqueueWriteBuffer: symbol!(library, clEnqueueWriteBuffer),
                clFinish: symbol!(library, clFinish),
                clReleaseMemObject: symbol!(library, clReleaseMemObject),
                clReleaseKernel: symbol!(library, clReleaseKernel),
                clReleaseProgram: symbol!(library, clReleaseProgram),
                clReleaseCommandQueue: symbol!(library, clReleaseCommandQueue),
                clReleaseContext: symbol!(library, clReleaseContext),
                _library: library,
            }))
        }
    }
}
