//! Ускоритель на OpenCL GPU

use super::bindings::OpenClApi;
use super::types::*;
use crate::accel::{Accelerator, AcceleratorKind, AcceleratorStats, Counters, LaunchArgs};
use crate::config::AcceleratorConfig;
use crate::matrix::kernels::{kernel_name, opencl_source};
use crate::operator::Operation;
use crate::utils::{from_c_bytes, to_c_string};
use crate::{cl_check, cl_create};
use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::ffi::c_void;
use std::mem::size_of;
use std::ptr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

const MAX_PLATFORMS: usize = 16;
const MAX_DEVICES: usize = 16;

/// Ускоритель на первом GPU с поддержкой двойной точности.
///
/// Для каждого потока копирований создается своя очередь команд; ядра
/// выполняются в отдельной очереди. Установка аргументов ядра в OpenCL не
/// потокобезопасна, поэтому запуски сериализуются.
pub struct OpenClAccelerator {
    api: OpenClApi,
    device: cl_device_id,
    context: cl_context,
    queue: cl_command_queue,
    name: String,
    programs: Mutex<HashMap<u64, cl_program>>,
    launch_lock: Mutex<()>,
    counters: Counters,
}

// SAFETY: объекты OpenCL можно использовать из любых потоков, кроме
// clSetKernelArg, который вызывается только под `launch_lock`.
unsafe impl Send for OpenClAccelerator {}
unsafe impl Sync for OpenClAccelerator {}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn handle<T>(ptr: *mut T) -> u64 {
    ptr as usize as u64
}

fn raw(handle: u64) -> *mut c_void {
    handle as usize as *mut c_void
}

impl OpenClAccelerator {
    /// Ищет GPU-устройство OpenCL с поддержкой `double`.
    ///
    /// `Ok(None)`, если библиотеки, платформ или подходящих устройств нет.
    pub fn probe(config: &AcceleratorConfig) -> Result<Option<Self>> {
        let Some(api) = OpenClApi::load(config.opencl_library.as_deref())? else {
            return Ok(None);
        };

        let mut platforms = vec![ptr::null_mut(); MAX_PLATFORMS];
        let mut num_platforms: cl_uint = 0;
        let code = unsafe {
            (api.clGetPlatformIDs)(
                MAX_PLATFORMS as cl_uint,
                platforms.as_mut_ptr(),
                &mut num_platforms,
            )
        };
        if code == CL_PLATFORM_NOT_FOUND_KHR || (code == CL_SUCCESS && num_platforms == 0) {
            debug!("Платформы OpenCL не найдены");
            return Ok(None);
        }
        if code != CL_SUCCESS {
            return Err(anyhow!(
                "clGetPlatformIDs failed: {}",
                super::utils::error_name(code)
            ));
        }
        platforms.truncate((num_platforms as usize).min(MAX_PLATFORMS));

        for platform in platforms {
            let platform_name = platform_name(&api, platform).unwrap_or_default();
            let mut devices = vec![ptr::null_mut(); MAX_DEVICES];
            let mut num_devices: cl_uint = 0;
            let code = unsafe {
                (api.clGetDeviceIDs)(
                    platform,
                    CL_DEVICE_TYPE_GPU,
                    MAX_DEVICES as cl_uint,
                    devices.as_mut_ptr(),
                    &mut num_devices,
                )
            };
            if code == CL_DEVICE_NOT_FOUND || num_devices == 0 {
                debug!(platform = %platform_name, "На платформе нет GPU");
                continue;
            }
            if code != CL_SUCCESS {
                warn!(platform = %platform_name, code, "Не удалось перечислить устройства");
                continue;
            }
            devices.truncate((num_devices as usize).min(MAX_DEVICES));

            for device in devices {
                let name = device_name(&api, device).unwrap_or_else(|_| "unknown".into());
                if !supports_double(&api, device) {
                    debug!(device = %name, "GPU без поддержки double пропущен");
                    continue;
                }
                return Self::create(api, device, format!("{} / {}", platform_name, name)).map(Some);
            }
        }
        Ok(None)
    }

    fn create(api: OpenClApi, device: cl_device_id, name: String) -> Result<Self> {
        let context = cl_create!(
            api,
            clCreateContext(ptr::null(), 1, &device, None, ptr::null_mut())
        )?;
        let queue = match cl_create!(api, clCreateCommandQueue(context, device, 0)) {
            Ok(queue) => queue,
            Err(e) => {
                unsafe { (api.clReleaseContext)(context) };
                return Err(e);
            }
        };

        Ok(Self {
            api,
            device,
            context,
            queue,
            name,
            programs: Mutex::new(HashMap::new()),
            launch_lock: Mutex::new(()),
            counters: Counters::default(),
        })
    }

    fn build_log(&self, program: cl_program) -> String {
        let mut log_size = 0usize;
        let sized = cl_check!(
            self.api,
            clGetProgramBuildInfo(
                program,
                self.device,
                CL_PROGRAM_BUILD_LOG,
                0,
                ptr::null_mut(),
                &mut log_size
            )
        );
        if sized.is_err() || log_size == 0 {
            return String::new();
        }
        let mut log = vec![0u8; log_size];
        let read = cl_check!(
            self.api,
            clGetProgramBuildInfo(
                program,
                self.device,
                CL_PROGRAM_BUILD_LOG,
                log_size,
                log.as_mut_ptr() as *mut c_void,
                ptr::null_mut()
            )
        );
        match read {
            Ok(()) => from_c_bytes(&log),
            Err(_) => String::new(),
        }
    }

    fn set_arg<T>(&self, kernel: cl_kernel, index: cl_uint, value: &T) -> Result<()> {
        cl_check!(
            self.api,
            clSetKernelArg(
                kernel,
                index,
                size_of::<T>(),
                value as *const T as *const c_void
            )
        )
        .with_context(|| format!("Failed to set kernel argument {}", index))
    }
}

fn platform_name(api: &OpenClApi, platform: cl_platform_id) -> Result<String> {
    let mut buffer = vec![0u8; 256];
    cl_check!(
        api,
        clGetPlatformInfo(
            platform,
            CL_PLATFORM_NAME,
            buffer.len(),
            buffer.as_mut_ptr() as *mut c_void,
            ptr::null_mut()
        )
    )?;
    Ok(from_c_bytes(&buffer))
}

fn device_name(api: &OpenClApi, device: cl_device_id) -> Result<String> {
    let mut buffer = vec![0u8; 256];
    cl_check!(
        api,
        clGetDeviceInfo(
            device,
            CL_DEVICE_NAME,
            buffer.len(),
            buffer.as_mut_ptr() as *mut c_void,
            ptr::null_mut()
        )
    )?;
    Ok(from_c_bytes(&buffer))
}

fn supports_double(api: &OpenClApi, device: cl_device_id) -> bool {
    let mut config: cl_ulong = 0;
    let result = cl_check!(
        api,
        clGetDeviceInfo(
            device,
            CL_DEVICE_DOUBLE_FP_CONFIG,
            size_of::<cl_ulong>(),
            &mut config as *mut cl_ulong as *mut c_void,
            ptr::null_mut()
        )
    );
    result.is_ok() && config != 0
}

impl std::fmt::Debug for OpenClAccelerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenClAccelerator")
            .field("device", &self.name)
            .field("stats", &self.counters.snapshot())
            .finish()
    }
}

impl Accelerator for OpenClAccelerator {
    fn kind(&self) -> AcceleratorKind {
        AcceleratorKind::OpenCl
    }

    fn device_name(&self) -> &str {
        &self.name
    }

    fn compile(&self, operation: Operation) -> Result<u64> {
        let source = opencl_source(operation);
        let source_ptr = source.as_ptr() as *const i8;
        let source_len = source.len();
        let program = cl_create!(
            self.api,
            clCreateProgramWithSource(self.context, 1, &source_ptr, &source_len)
        )?;

        if let Err(e) = cl_check!(
            self.api,
            clBuildProgram(program, 1, &self.device, ptr::null(), None, ptr::null_mut())
        ) {
            // В случае ошибки прикладываем лог компиляции
            let log = self.build_log(program);
            unsafe { (self.api.clReleaseProgram)(program) };
            return Err(e.context(format!("Build log for {}:\n{}", operation, log)));
        }

        let name = to_c_string(kernel_name(operation))?;
        let kernel = match cl_create!(self.api, clCreateKernel(program, name.as_ptr())) {
            Ok(kernel) => kernel,
            Err(e) => {
                unsafe { (self.api.clReleaseProgram)(program) };
                return Err(e);
            }
        };

        lock(&self.programs).insert(handle(kernel), program);
        Ok(handle(kernel))
    }

    fn release_kernel(&self, kernel: u64) {
        let program = lock(&self.programs).remove(&kernel);
        unsafe {
            (self.api.clReleaseKernel)(raw(kernel));
            if let Some(program) = program {
                (self.api.clReleaseProgram)(program);
            }
        }
    }

    fn allocate(&self, len: usize) -> Result<u64> {
        let buffer = cl_create!(
            self.api,
            clCreateBuffer(
                self.context,
                CL_MEM_READ_WRITE,
                len * size_of::<f64>(),
                ptr::null_mut()
            )
        )?;
        self.counters.allocated();
        Ok(handle(buffer))
    }

    fn free(&self, buffer: u64) {
        unsafe { (self.api.clReleaseMemObject)(raw(buffer)) };
        self.counters.freed();
    }

    fn create_stream(&self) -> Result<u64> {
        let queue = cl_create!(self.api, clCreateCommandQueue(self.context, self.device, 0))?;
        Ok(handle(queue))
    }

    fn release_stream(&self, stream: u64) {
        unsafe { (self.api.clReleaseCommandQueue)(raw(stream)) };
    }

    unsafe fn upload(&self, stream: u64, buffer: u64, data: &[f64]) -> Result<()> {
        cl_check!(
            self.api,
            clEnqueueWriteBuffer(
                raw(stream),
                raw(buffer),
                CL_FALSE,
                0,
                std::mem::size_of_val(data),
                data.as_ptr() as *const c_void,
                0,
                ptr::null(),
                ptr::null_mut()
            )
        )?;
        self.counters.uploaded();
        Ok(())
    }

    fn synchronize_stream(&self, stream: u64) -> Result<()> {
        cl_check!(self.api, clFinish(raw(stream)))
    }

    fn launch(&self, kernel: u64, args: &LaunchArgs) -> Result<()> {
        let (rows, columns, inner) = args.dims_i32()?;
        let kernel = raw(kernel);
        let a: cl_mem = raw(args.a);
        let b: cl_mem = raw(args.b);
        let out: cl_mem = raw(args.out);

        let _guard = lock(&self.launch_lock);
        self.set_arg(kernel, 0, &a)?;
        self.set_arg(kernel, 1, &b)?;
        self.set_arg(kernel, 2, &out)?;
        self.set_arg(kernel, 3, &rows)?;
        self.set_arg(kernel, 4, &columns)?;
        self.set_arg(kernel, 5, &inner)?;

        let global_size = [args.rows, args.columns];
        cl_check!(
            self.api,
            clEnqueueNDRangeKernel(
                self.queue,
                kernel,
                2,
                ptr::null(),
                global_size.as_ptr(),
                ptr::null(),
                0,
                ptr::null(),
                ptr::null_mut()
            )
        )
        .context("Failed to enqueue kernel")?;
        self.counters.launched();
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        cl_check!(self.api, clFinish(self.queue))
    }

    fn download(&self, buffer: u64, out: &mut [f64]) -> Result<()> {
        cl_check!(
            self.api,
            clEnqueueReadBuffer(
                self.queue,
                raw(buffer),
                CL_TRUE,
                0,
                std::mem::size_of_val(out),
                out.as_mut_ptr() as *mut c_void,
                0,
                ptr::null(),
                ptr::null_mut()
            )
        )
        .map_err(|e| anyhow!("Failed to read result buffer: {:#}", e))
    }

    fn stats(&self) -> AcceleratorStats {
        self.counters.snapshot()
    }
}

impl Drop for OpenClAccelerator {
    fn drop(&mut self) {
        let programs: Vec<cl_program> = lock(&self.programs).drain().map(|(_, p)| p).collect();
        unsafe {
            for program in programs {
                (self.api.clReleaseProgram)(program);
            }
            (self.api.clReleaseCommandQueue)(self.queue);
            (self.api.clReleaseContext)(self.context);
        }
    }
}
