//! Хостовый ускоритель: последняя ступень цепочки выбора
//!
//! "Память устройства": обычные векторы за дескрипторами, ядра выполняются
//! на собственном пуле rayon по одной задаче на строку результата. Копии
//! выполняются сразу, поэтому ожидание потока ничего не делает.

use super::{Accelerator, AcceleratorKind, AcceleratorStats, Counters, LaunchArgs};
use crate::matrix::operations::compute_row;
use crate::operator::Operation;
use anyhow::{anyhow, Context, Result};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::debug;

type HostMemory = Arc<RwLock<Vec<f64>>>;

/// Ускоритель, распараллеливающий ядра по ядрам процессора
pub struct HostAccelerator {
    pool: ThreadPool,
    name: String,
    next_handle: AtomicU64,
    buffers: Mutex<HashMap<u64, HostMemory>>,
    kernels: Mutex<HashMap<u64, Operation>>,
    counters: Counters,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HostAccelerator {
    /// Создает ускоритель на `threads` потоках (по умолчанию по числу ядер)
    pub fn new(threads: Option<usize>) -> Result<Self> {
        let threads = threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("host-accel-{}", i))
            .build()
            .context("Failed to build host accelerator thread pool")?;
        debug!(threads, "Хостовый ускоритель создан");

        Ok(Self {
            pool,
            name: format!("host ({} threads)", threads),
            next_handle: AtomicU64::new(1),
            buffers: Mutex::new(HashMap::new()),
            kernels: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn buffer(&self, handle: u64) -> Result<HostMemory> {
        lock(&self.buffers)
            .get(&handle)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown host buffer handle {}", handle))
    }
}

impl std::fmt::Debug for HostAccelerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostAccelerator")
            .field("threads", &self.threads())
            .field("stats", &self.counters.snapshot())
            .finish()
    }
}

impl Accelerator for HostAccelerator {
    fn kind(&self) -> AcceleratorKind {
        AcceleratorKind::Host
    }

    fn device_name(&self) -> &str {
        &self.name
    }

    fn compile(&self, operation: Operation) -> Result<u64> {
        let handle = self.handle();
        lock(&self.kernels).insert(handle, operation);
        Ok(handle)
    }

    fn release_kernel(&self, kernel: u64) {
        lock(&self.kernels).remove(&kernel);
    }

    fn allocate(&self, len: usize) -> Result<u64> {
        let handle = self.handle();
        lock(&self.buffers).insert(handle, Arc::new(RwLock::new(vec![0.0; len])));
        self.counters.allocated();
        Ok(handle)
    }

    fn free(&self, buffer: u64) {
        if lock(&self.buffers).remove(&buffer).is_some() {
            self.counters.freed();
        }
    }

    fn create_stream(&self) -> Result<u64> {
        Ok(self.handle())
    }

    fn release_stream(&self, _stream: u64) {}

    unsafe fn upload(&self, _stream: u64, buffer: u64, data: &[f64]) -> Result<()> {
        let memory = self.buffer(buffer)?;
        let mut memory = memory.write().unwrap_or_else(PoisonError::into_inner);
        if memory.len() != data.len() {
            return Err(anyhow!(
                "Upload of {} elements into host buffer of {}",
                data.len(),
                memory.len()
            ));
        }
        memory.copy_from_slice(data);
        self.counters.uploaded();
        Ok(())
    }

    fn synchronize_stream(&self, _stream: u64) -> Result<()> {
        Ok(())
    }

    fn launch(&self, kernel: u64, args: &LaunchArgs) -> Result<()> {
        let operation = *lock(&self.kernels)
            .get(&kernel)
            .ok_or_else(|| anyhow!("Unknown host kernel handle {}", kernel))?;
        let a = self.buffer(args.a)?;
        let b = self.buffer(args.b)?;
        let out = self.buffer(args.out)?;
        if Arc::ptr_eq(&out, &a) || Arc::ptr_eq(&out, &b) {
            return Err(anyhow!("Kernel output must not alias an input buffer"));
        }

        let a_guard = a.read().unwrap_or_else(PoisonError::into_inner);
        let b_guard = if Arc::ptr_eq(&a, &b) {
            None
        } else {
            Some(b.read().unwrap_or_else(PoisonError::into_inner))
        };
        let mut out_guard = out.write().unwrap_or_else(PoisonError::into_inner);
        if out_guard.len() != args.rows * args.columns {
            return Err(anyhow!(
                "Output buffer of {} elements for a {}x{} launch",
                out_guard.len(),
                args.rows,
                args.columns
            ));
        }
        if args.columns == 0 {
            return Ok(());
        }

        let a_slice: &[f64] = &a_guard;
        let b_slice: &[f64] = b_guard.as_deref().map_or(a_slice, Vec::as_slice);
        let out_slice: &mut [f64] = &mut out_guard;
        let (rows, columns, inner) = (args.rows, args.columns, args.inner);
        self.pool.install(|| {
            out_slice
                .par_chunks_mut(columns)
                .enumerate()
                .for_each(|(row, line)| {
                    compute_row(operation, a_slice, b_slice, row, line, rows, inner)
                });
        });
        self.counters.launched();
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    fn download(&self, buffer: u64, out: &mut [f64]) -> Result<()> {
        let memory = self.buffer(buffer)?;
        let memory = memory.read().unwrap_or_else(PoisonError::into_inner);
        if memory.len() != out.len() {
            return Err(anyhow!(
                "Download of host buffer of {} elements into {}",
                memory.len(),
                out.len()
            ));
        }
        out.copy_from_slice(&memory);
        Ok(())
    }

    fn stats(&self) -> AcceleratorStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiply_kernel_on_host() {
        let accel = HostAccelerator::new(Some(2)).unwrap();
        let a = accel.allocate(6).unwrap();
        let b = accel.allocate(6).unwrap();
        let out = accel.allocate(4).unwrap();
        unsafe {
            accel.upload(0, a, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
            accel.upload(0, b, &[7.0, 8.0, 9.0, 10.0, 11.0, 12.0]).unwrap();
        }
        let kernel = accel.compile(Operation::Multiply).unwrap();
        accel
            .launch(
                kernel,
                &LaunchArgs {
                    a,
                    b,
                    out,
                    rows: 2,
                    columns: 2,
                    inner: 3,
                },
            )
            .unwrap();
        let mut result = vec![0.0; 4];
        accel.download(out, &mut result).unwrap();
        assert_eq!(result, vec![58.0, 64.0, 139.0, 154.0]);

        let stats = accel.stats();
        assert_eq!(stats.allocations, 3);
        assert_eq!(stats.uploads, 2);
        assert_eq!(stats.launches, 1);
    }

    #[test]
    fn rejects_unknown_handles_and_size_mismatch() {
        let accel = HostAccelerator::new(Some(1)).unwrap();
        let buffer = accel.allocate(2).unwrap();
        assert!(unsafe { accel.upload(0, buffer, &[1.0]) }.is_err());
        assert!(unsafe { accel.upload(0, 999, &[1.0]) }.is_err());
        let mut out = vec![0.0; 3];
        assert!(accel.download(buffer, &mut out).is_err());

        accel.free(buffer);
        accel.free(buffer);
        assert_eq!(accel.stats().frees, 1);
    }

    #[test]
    fn rejects_aliased_output() {
        let accel = HostAccelerator::new(Some(1)).unwrap();
        let buffer = accel.allocate(4).unwrap();
        let kernel = accel.compile(Operation::Add).unwrap();
        let args = LaunchArgs {
            a: buffer,
            b: buffer,
            out: buffer,
            rows: 2,
            columns: 2,
            inner: 0,
        };
        assert!(accel.launch(kernel, &args).is_err());
    }
}
