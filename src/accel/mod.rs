//! Ускорители: CUDA / OpenCL GPU / хостовый запасной вариант
//!
//! Рантайм ускорителя потребляется как набор непрозрачных возможностей:
//! скомпилировать ядро, выделить память, асинхронно скопировать данные по
//! потоку, дождаться потока или всего устройства. Ресурсы адресуются
//! дескрипторами `u64`, а RAII-обертки из этого модуля освобождают их при
//! уничтожении.

mod host;
mod manager;
mod transfer;

pub use host::HostAccelerator;
pub use manager::AcceleratorContext;
pub use transfer::{PendingUpload, TransferCache};

use crate::operator::Operation;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Семейство ускорителя. Порядок вариантов совпадает с порядком
/// предпочтения по умолчанию.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorKind {
    /// Специализированный GPU (CUDA)
    Cuda,
    /// Вендор-нейтральный GPU через OpenCL
    OpenCl,
    /// Хостовый ускоритель на всех ядрах процессора
    Host,
}

impl AcceleratorKind {
    /// Является ли ускоритель настоящим GPU
    pub fn is_gpu(self) -> bool {
        !matches!(self, AcceleratorKind::Host)
    }
}

impl fmt::Display for AcceleratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AcceleratorKind::Cuda => "cuda",
            AcceleratorKind::OpenCl => "opencl",
            AcceleratorKind::Host => "host",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for AcceleratorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" => Ok(AcceleratorKind::Cuda),
            "opencl" | "cl" => Ok(AcceleratorKind::OpenCl),
            "host" | "cpu" => Ok(AcceleratorKind::Host),
            other => Err(anyhow::anyhow!("Unknown accelerator kind: {}", other)),
        }
    }
}

/// Аргументы запуска ядра.
///
/// Пространство индексов задается формой результата `rows x columns`, `inner` задает
/// общую размерность умножения.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchArgs {
    pub a: u64,
    pub b: u64,
    pub out: u64,
    pub rows: usize,
    pub columns: usize,
    pub inner: usize,
}

impl LaunchArgs {
    /// Размеры в виде `int`, как их принимают ядра
    pub(crate) fn dims_i32(&self) -> anyhow::Result<(i32, i32, i32)> {
        kernel_dims(self.rows, self.columns, self.inner)
    }
}

/// Проверяет, что ядра с индексами `int` адресуют все ячейки.
///
/// Ядра считают смещения `row * cols + col`, `row * inner + k` и
/// `k * cols + col`, поэтому в `int` должны помещаться не только размеры,
/// но и их попарные произведения.
pub(crate) fn kernel_dims(
    rows: usize,
    columns: usize,
    inner: usize,
) -> anyhow::Result<(i32, i32, i32)> {
    let fits = |value: Option<usize>| value.is_some_and(|value| value <= i32::MAX as usize);
    let extents = [
        Some(rows),
        Some(columns),
        Some(inner),
        rows.checked_mul(columns),
        rows.checked_mul(inner),
        inner.checked_mul(columns),
    ];
    if !extents.into_iter().all(fits) {
        anyhow::bail!(
            "Extent {}x{} (inner {}) exceeds the kernel int index range",
            rows,
            columns,
            inner
        );
    }
    Ok((rows as i32, columns as i32, inner as i32))
}

/// Снимок счетчиков ускорителя
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AcceleratorStats {
    pub allocations: usize,
    pub frees: usize,
    pub uploads: usize,
    pub launches: usize,
}

/// Атомарные счетчики, общие для всех реализаций
#[derive(Debug, Default)]
pub(crate) struct Counters {
    allocations: AtomicUsize,
    frees: AtomicUsize,
    uploads: AtomicUsize,
    launches: AtomicUsize,
}

impl Counters {
    pub(crate) fn allocated(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn freed(&self) {
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn uploaded(&self) {
        self.uploads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn launched(&self) {
        self.launches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> AcceleratorStats {
        AcceleratorStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            uploads: self.uploads.load(Ordering::Relaxed),
            launches: self.launches.load(Ordering::Relaxed),
        }
    }
}

/// Возможности рантайма ускорителя.
///
/// Все дескрипторы непрозрачны и действительны только для выдавшего их
/// ускорителя. Обычно вместо прямых вызовов используются обертки
/// [`DeviceBuffer`], [`Stream`] и [`Kernel`].
pub trait Accelerator: Send + Sync + fmt::Debug {
    fn kind(&self) -> AcceleratorKind;

    /// Человекочитаемое имя устройства
    fn device_name(&self) -> &str;

    /// Компилирует ядро для операции
    fn compile(&self, operation: Operation) -> anyhow::Result<u64>;

    fn release_kernel(&self, kernel: u64);

    /// Выделяет на устройстве буфер из `len` чисел двойной точности
    fn allocate(&self, len: usize) -> anyhow::Result<u64>;

    fn free(&self, buffer: u64);

    /// Создает поток (очередь) для асинхронных копирований
    fn create_stream(&self) -> anyhow::Result<u64>;

    fn release_stream(&self, stream: u64);

    /// Ставит в поток копирование `data` в буфер устройства.
    ///
    /// # Safety
    ///
    /// Копирование может продолжаться после возврата. Память `data` должна
    /// оставаться живой и неизменной до успешного
    /// [`Accelerator::synchronize_stream`] для этого потока.
    unsafe fn upload(&self, stream: u64, buffer: u64, data: &[f64]) -> anyhow::Result<()>;

    /// Блокирует до завершения всех операций в потоке
    fn synchronize_stream(&self, stream: u64) -> anyhow::Result<()>;

    /// Запускает ядро над пространством индексов результата
    fn launch(&self, kernel: u64, args: &LaunchArgs) -> anyhow::Result<()>;

    /// Блокирует до завершения всех запущенных ядер
    fn synchronize(&self) -> anyhow::Result<()>;

    /// Синхронно читает буфер устройства в `out`
    fn download(&self, buffer: u64, out: &mut [f64]) -> anyhow::Result<()>;

    fn stats(&self) -> AcceleratorStats;
}

/// Буфер в памяти устройства, освобождается при уничтожении
#[derive(Debug)]
pub struct DeviceBuffer {
    accelerator: Arc<dyn Accelerator>,
    handle: u64,
    len: usize,
}

impl DeviceBuffer {
    pub fn allocate(accelerator: &Arc<dyn Accelerator>, len: usize) -> anyhow::Result<Self> {
        let handle = accelerator.allocate(len)?;
        Ok(Self {
            accelerator: Arc::clone(accelerator),
            handle,
            len,
        })
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Читает содержимое буфера в новый вектор
    pub fn download(&self) -> anyhow::Result<Vec<f64>> {
        let mut out = vec![0.0; self.len];
        self.accelerator.download(self.handle, &mut out)?;
        Ok(out)
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.accelerator.free(self.handle);
    }
}

/// Поток копирований
#[derive(Debug)]
pub struct Stream {
    accelerator: Arc<dyn Accelerator>,
    handle: u64,
}

impl Stream {
    pub fn create(accelerator: &Arc<dyn Accelerator>) -> anyhow::Result<Self> {
        let handle = accelerator.create_stream()?;
        Ok(Self {
            accelerator: Arc::clone(accelerator),
            handle,
        })
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn synchronize(&self) -> anyhow::Result<()> {
        self.accelerator.synchronize_stream(self.handle)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.accelerator.release_stream(self.handle);
    }
}

/// Скомпилированное ядро
#[derive(Debug)]
pub struct Kernel {
    accelerator: Arc<dyn Accelerator>,
    handle: u64,
    operation: Operation,
}

impl Kernel {
    pub fn compile(accelerator: &Arc<dyn Accelerator>, operation: Operation) -> anyhow::Result<Self> {
        let handle = accelerator.compile(operation)?;
        Ok(Self {
            accelerator: Arc::clone(accelerator),
            handle,
            operation,
        })
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn launch(&self, args: &LaunchArgs) -> anyhow::Result<()> {
        self.accelerator.launch(self.handle, args)
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.accelerator.release_kernel(self.handle);
    }
}

/// Набор ядер для всех операций, компилируется один раз
#[derive(Debug)]
pub struct KernelSet {
    add: Kernel,
    subtract: Kernel,
    multiply: Kernel,
    transpose: Kernel,
}

impl KernelSet {
    pub fn compile(accelerator: &Arc<dyn Accelerator>) -> anyhow::Result<Self> {
        Ok(Self {
            add: Kernel::compile(accelerator, Operation::Add)?,
            subtract: Kernel::compile(accelerator, Operation::Subtract)?,
            multiply: Kernel::compile(accelerator, Operation::Multiply)?,
            transpose: Kernel::compile(accelerator, Operation::Transpose)?,
        })
    }

    pub fn get(&self, operation: Operation) -> &Kernel {
        match operation {
            Operation::Add => &self.add,
            Operation::Subtract => &self.subtract,
            Operation::Multiply => &self.multiply,
            Operation::Transpose => &self.transpose,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parsing_and_class() {
        assert_eq!("OpenCL".parse::<AcceleratorKind>().unwrap(), AcceleratorKind::OpenCl);
        assert_eq!("cpu".parse::<AcceleratorKind>().unwrap(), AcceleratorKind::Host);
        assert!("metal".parse::<AcceleratorKind>().is_err());
        assert!(AcceleratorKind::Cuda.is_gpu());
        assert!(!AcceleratorKind::Host.is_gpu());
    }

    #[test]
    fn launch_dims_must_fit_int() {
        let args = LaunchArgs {
            a: 1,
            b: 1,
            out: 2,
            rows: 3,
            columns: 4,
            inner: 5,
        };
        assert_eq!(args.dims_i32().unwrap(), (3, 4, 5));
        let huge = LaunchArgs {
            rows: usize::MAX,
            ..args
        };
        assert!(huge.dims_i32().is_err());
    }

    #[test]
    fn kernel_offsets_must_fit_int() {
        assert!(kernel_dims(50_000, 50_000, 0).is_err());
        assert!(kernel_dims(50_000, 1, 50_000).is_err());
        assert!(kernel_dims(1, 50_000, 50_000).is_err());
        assert!(kernel_dims(usize::MAX, 2, 0).is_err());
        assert_eq!(kernel_dims(40_000, 40_000, 0).unwrap(), (40_000, 40_000, 0));
        assert!(kernel_dims(46_341, 46_341, 0).is_err());
    }

    #[test]
    fn raii_wrappers_release_handles() {
        let accelerator: Arc<dyn Accelerator> = Arc::new(HostAccelerator::new(Some(2)).unwrap());
        {
            let _buffer = DeviceBuffer::allocate(&accelerator, 16).unwrap();
            let _kernels = KernelSet::compile(&accelerator).unwrap();
            assert_eq!(accelerator.stats().allocations, 1);
        }
        let stats = accelerator.stats();
        assert_eq!(stats.frees, 1);
    }
}
