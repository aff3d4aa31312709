//! Ускоритель на CUDA

use super::bindings::{CudaApi, NvrtcApi};
use super::types::*;
use crate::accel::{Accelerator, AcceleratorKind, AcceleratorStats, Counters, LaunchArgs};
use crate::config::AcceleratorConfig;
use crate::cu_check;
use crate::matrix::kernels::{kernel_name, CUDA_KERNELS};
use crate::operator::Operation;
use crate::utils::{from_c_bytes, to_c_string};
use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::ffi::{c_char, c_void};
use std::ptr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Параметры NVRTC: без слияния умножения и сложения, как на хосте
const NVRTC_OPTIONS: [&str; 1] = ["--fmad=false"];

/// Ускоритель на первом устройстве CUDA.
///
/// Исходник ядер компилируется в PTX один раз; каждое ядро загружается
/// своим модулем, чтобы освобождаться независимо. Контекст делается
/// текущим перед каждым обращением, так как вызовы приходят из разных
/// потоков.
pub struct CudaAccelerator {
    api: CudaApi,
    nvrtc: NvrtcApi,
    context: CUcontext,
    name: String,
    ptx: Mutex<Option<Vec<u8>>>,
    modules: Mutex<HashMap<u64, CUmodule>>,
    counters: Counters,
}

// SAFETY: контекст CUDA можно делать текущим в любом потоке, а изменяемое
// состояние ускорителя защищено мьютексами.
unsafe impl Send for CudaAccelerator {}
unsafe impl Sync for CudaAccelerator {}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn handle<T>(ptr: *mut T) -> u64 {
    ptr as usize as u64
}

fn raw(handle: u64) -> *mut c_void {
    handle as usize as *mut c_void
}

/// Число блоков, покрывающих `extent`
fn blocks(extent: usize) -> Result<u32> {
    let count = extent.div_ceil(BLOCK_SIDE as usize);
    u32::try_from(count).map_err(|_| anyhow!("Grid dimension {} is too large", count))
}

impl CudaAccelerator {
    /// Ищет устройство CUDA.
    ///
    /// `Ok(None)`, если нет драйвера, NVRTC или устройств.
    pub fn probe(config: &AcceleratorConfig) -> Result<Option<Self>> {
        let Some(api) = CudaApi::load(config.cuda_library.as_deref())? else {
            return Ok(None);
        };

        let code = unsafe { (api.cuInit)(0) };
        if code == CUDA_ERROR_NO_DEVICE {
            debug!("Устройства CUDA не найдены");
            return Ok(None);
        }
        if code != CUDA_SUCCESS {
            return Err(anyhow!("cuInit failed with CUDA error code {}", code));
        }

        let mut count = 0i32;
        cu_check!(api, cuDeviceGetCount(&mut count))?;
        if count == 0 {
            debug!("Устройства CUDA не найдены");
            return Ok(None);
        }

        let Some(nvrtc) = NvrtcApi::load(config.nvrtc_library.as_deref())? else {
            debug!("NVRTC недоступен, ядра CUDA не скомпилировать");
            return Ok(None);
        };

        let mut device: CUdevice = 0;
        cu_check!(api, cuDeviceGet(&mut device, 0))?;

        let mut name = vec![0u8; 256];
        cu_check!(
            api,
            cuDeviceGetName(name.as_mut_ptr() as *mut c_char, name.len() as i32, device)
        )?;
        let name = from_c_bytes(&name);

        let mut context: CUcontext = ptr::null_mut();
        cu_check!(api, cuCtxCreate_v2(&mut context, 0, device))
            .with_context(|| format!("Failed to create CUDA context on {}", name))?;

        Ok(Some(Self {
            api,
            nvrtc,
            context,
            name,
            ptx: Mutex::new(None),
            modules: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }))
    }

    /// Делает контекст текущим для вызывающего потока
    fn bind(&self) -> Result<()> {
        cu_check!(self.api, cuCtxSetCurrent(self.context))
    }

    /// PTX всех ядер; компилируется при первом обращении
    fn ptx(&self) -> Result<Vec<u8>> {
        let mut cached = lock(&self.ptx);
        if let Some(ptx) = cached.as_ref() {
            return Ok(ptx.clone());
        }

        let source = to_c_string(CUDA_KERNELS)?;
        let file = to_c_string("matrix_kernels.cu")?;
        let mut program: nvrtcProgram = ptr::null_mut();
        cu_check!(
            self.nvrtc,
            nvrtcCreateProgram(
                &mut program,
                source.as_ptr(),
                file.as_ptr(),
                0,
                ptr::null(),
                ptr::null()
            )
        )?;

        let result = self.compile_program(program);
        unsafe { (self.nvrtc.nvrtcDestroyProgram)(&mut program) };
        let ptx = result?;
        *cached = Some(ptx.clone());
        Ok(ptx)
    }

    fn compile_program(&self, program: nvrtcProgram) -> Result<Vec<u8>> {
        let options = NVRTC_OPTIONS
            .iter()
            .map(|option| to_c_string(option))
            .collect::<Result<Vec<_>>>()?;
        let option_ptrs: Vec<*const c_char> = options.iter().map(|o| o.as_ptr()).collect();

        if let Err(e) = cu_check!(
            self.nvrtc,
            nvrtcCompileProgram(program, option_ptrs.len() as i32, option_ptrs.as_ptr())
        ) {
            return Err(e.context(format!("NVRTC log:\n{}", self.program_log(program))));
        }

        let mut size = 0usize;
        cu_check!(self.nvrtc, nvrtcGetPTXSize(program, &mut size))?;
        let mut ptx = vec![0u8; size];
        cu_check!(self.nvrtc, nvrtcGetPTX(program, ptx.as_mut_ptr() as *mut c_char))?;
        Ok(ptx)
    }

    fn program_log(&self, program: nvrtcProgram) -> String {
        let mut size = 0usize;
        if cu_check!(self.nvrtc, nvrtcGetProgramLogSize(program, &mut size)).is_err() || size == 0 {
            return String::new();
        }
        let mut log = vec![0u8; size];
        match cu_check!(self.nvrtc, nvrtcGetProgramLog(program, log.as_mut_ptr() as *mut c_char)) {
            Ok(()) => from_c_bytes(&log),
            Err(_) => String::new(),
        }
    }
}

impl std::fmt::Debug for CudaAccelerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaAccelerator")
            .field("device", &self.name)
            .field("stats", &self.counters.snapshot())
            .finish()
    }
}

impl Accelerator for CudaAccelerator {
    fn kind(&self) -> AcceleratorKind {
        AcceleratorKind::Cuda
    }

    fn device_name(&self) -> &str {
        &self.name
    }

    fn compile(&self, operation: Operation) -> Result<u64> {
        let ptx = self.ptx()?;
        self.bind()?;

        let mut module: CUmodule = ptr::null_mut();
        cu_check!(self.api, cuModuleLoadData(&mut module, ptx.as_ptr() as *const c_void))?;

        let name = to_c_string(kernel_name(operation))?;
        let mut function: CUfunction = ptr::null_mut();
        if let Err(e) = cu_check!(self.api, cuModuleGetFunction(&mut function, module, name.as_ptr())) {
            unsafe { (self.api.cuModuleUnload)(module) };
            return Err(e.context(format!("Kernel {} not found", kernel_name(operation))));
        }

        lock(&self.modules).insert(handle(function), module);
        Ok(handle(function))
    }

    fn release_kernel(&self, kernel: u64) {
        if let Some(module) = lock(&self.modules).remove(&kernel) {
            if self.bind().is_ok() {
                unsafe { (self.api.cuModuleUnload)(module) };
            }
        }
    }

    fn allocate(&self, len: usize) -> Result<u64> {
        self.bind()?;
        let mut pointer: CUdeviceptr = 0;
        // Нулевой размер CUDA не принимает
        let bytes = len.max(1) * std::mem::size_of::<f64>();
        cu_check!(self.api, cuMemAlloc_v2(&mut pointer, bytes))
            .with_context(|| format!("Failed to allocate {} bytes on {}", bytes, self.name))?;
        self.counters.allocated();
        Ok(pointer)
    }

    fn free(&self, buffer: u64) {
        if self.bind().is_ok() {
            unsafe { (self.api.cuMemFree_v2)(buffer) };
        }
        self.counters.freed();
    }

    fn create_stream(&self) -> Result<u64> {
        self.bind()?;
        let mut stream: CUstream = ptr::null_mut();
        cu_check!(self.api, cuStreamCreate(&mut stream, 0))?;
        Ok(handle(stream))
    }

    fn release_stream(&self, stream: u64) {
        if self.bind().is_ok() {
            unsafe { (self.api.cuStreamDestroy_v2)(raw(stream)) };
        }
    }

    unsafe fn upload(&self, stream: u64, buffer: u64, data: &[f64]) -> Result<()> {
        self.bind()?;
        cu_check!(
            self.api,
            cuMemcpyHtoDAsync_v2(
                buffer,
                data.as_ptr() as *const c_void,
                std::mem::size_of_val(data),
                raw(stream)
            )
        )?;
        self.counters.uploaded();
        Ok(())
    }

    fn synchronize_stream(&self, stream: u64) -> Result<()> {
        self.bind()?;
        cu_check!(self.api, cuStreamSynchronize(raw(stream)))
    }

    fn launch(&self, kernel: u64, args: &LaunchArgs) -> Result<()> {
        let (mut rows, mut columns, mut inner) = args.dims_i32()?;
        let (mut a, mut b, mut out) = (args.a, args.b, args.out);
        let grid_x = blocks(args.columns)?;
        let grid_y = blocks(args.rows)?;

        let mut params: [*mut c_void; 6] = [
            &mut a as *mut CUdeviceptr as *mut c_void,
            &mut b as *mut CUdeviceptr as *mut c_void,
            &mut out as *mut CUdeviceptr as *mut c_void,
            &mut rows as *mut i32 as *mut c_void,
            &mut columns as *mut i32 as *mut c_void,
            &mut inner as *mut i32 as *mut c_void,
        ];

        self.bind()?;
        cu_check!(
            self.api,
            cuLaunchKernel(
                raw(kernel),
                grid_x,
                grid_y,
                1,
                BLOCK_SIDE,
                BLOCK_SIDE,
                1,
                0,
                DEFAULT_STREAM,
                params.as_mut_ptr(),
                ptr::null_mut()
            )
        )
        .context("Failed to launch kernel")?;
        self.counters.launched();
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        self.bind()?;
        cu_check!(self.api, cuCtxSynchronize())
    }

    fn download(&self, buffer: u64, out: &mut [f64]) -> Result<()> {
        self.bind()?;
        cu_check!(
            self.api,
            cuMemcpyDtoH_v2(
                out.as_mut_ptr() as *mut c_void,
                buffer,
                std::mem::size_of_val(out)
            )
        )
        .context("Failed to read result buffer")
    }

    fn stats(&self) -> AcceleratorStats {
        self.counters.snapshot()
    }
}

impl Drop for CudaAccelerator {
    fn drop(&mut self) {
        let modules: Vec<CUmodule> = lock(&self.modules).drain().map(|(_, m)| m).collect();
        unsafe {
            (self.api.cuCtxSetCurrent)(self.context);
            for module in modules {
                (self.api.cuModuleUnload)(module);
            }
            (self.api.cuCtxDestroy_v2)(self.context);
        }
    }
}
