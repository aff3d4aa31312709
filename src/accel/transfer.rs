//! Привязка матриц к буферам устройства
//!
//! Кэш сопоставляет идентичность матрицы с парой "буфер устройства + поток
//! копирований". Матрица не меняет размер, поэтому буфер выделяется один раз
//! и переиспользуется при каждой следующей загрузке; повторяется только само
//! копирование. Привязка освобождается не позже уничтожения самой матрицы.

use super::{Accelerator, DeviceBuffer, Stream};
use crate::matrix::{Matrix, Unbind};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, warn};

/// Копия данных одной матрицы на устройстве
#[derive(Debug)]
struct DeviceBinding {
    buffer: DeviceBuffer,
    stream: Stream,
}

type BindingMap = HashMap<u64, Arc<DeviceBinding>>;

/// Таблица привязок; матрицы держат на нее слабую ссылку
#[derive(Debug, Default)]
struct Bindings {
    map: Mutex<BindingMap>,
}

impl Bindings {
    fn lock(&self) -> MutexGuard<'_, BindingMap> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Unbind for Bindings {
    fn unbind(&self, id: u64) {
        if self.lock().remove(&id).is_some() {
            debug!(matrix = id, "Матрица уничтожена, буфер устройства освобожден");
        }
    }
}

/// Побочная таблица: идентичность матрицы -> привязка
#[derive(Debug)]
pub struct TransferCache {
    accelerator: Arc<dyn Accelerator>,
    bindings: Arc<Bindings>,
    allocations: AtomicUsize,
}

impl TransferCache {
    pub fn new(accelerator: Arc<dyn Accelerator>) -> Self {
        Self {
            accelerator,
            bindings: Arc::new(Bindings::default()),
            allocations: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BindingMap> {
        self.bindings.lock()
    }

    /// Ставит в очередь загрузку матрицы на устройство.
    ///
    /// При первом обращении создает буфер и поток; дальше переиспользует их.
    /// Возвращенный [`PendingUpload`] удерживает заимствование матрицы и сам
    /// буфер, пока его не уничтожат.
    pub fn upload<'m>(&self, matrix: &'m Matrix) -> Result<PendingUpload<'m>> {
        let binding = self.binding(matrix)?;

        // SAFETY: PendingUpload заимствует `matrix` на 'm и синхронизирует
        // поток перед тем, как заимствование закончится.
        unsafe {
            self.accelerator
                .upload(binding.stream.handle(), binding.buffer.handle(), matrix.as_slice())
                .context("Failed to enqueue matrix upload")?;
        }

        Ok(PendingUpload {
            binding,
            waited: false,
            _host: PhantomData,
        })
    }

    fn binding(&self, matrix: &Matrix) -> Result<Arc<DeviceBinding>> {
        let identity = matrix.identity();
        let mut bindings = self.lock();
        if let Some(binding) = bindings.get(&identity.id()) {
            return Ok(Arc::clone(binding));
        }

        let buffer = DeviceBuffer::allocate(&self.accelerator, matrix.len())
            .context("Failed to allocate device buffer for matrix")?;
        let stream = Stream::create(&self.accelerator)
            .context("Failed to create transfer stream for matrix")?;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        debug!(
            matrix = identity.id(),
            rows = matrix.rows(),
            columns = matrix.columns(),
            "Выделен буфер устройства"
        );

        let holder: Weak<dyn Unbind> = Arc::<Bindings>::downgrade(&self.bindings);
        identity.register(holder);
        let binding = Arc::new(DeviceBinding { buffer, stream });
        bindings.insert(identity.id(), Arc::clone(&binding));
        Ok(binding)
    }

    /// Освобождает привязку матрицы, если она есть.
    ///
    /// Операция, которая уже загрузила матрицу, доработает с прежним
    /// буфером; он освободится вместе с ее [`PendingUpload`].
    pub fn release(&self, matrix: &Matrix) -> bool {
        self.lock().remove(&matrix.identity().id()).is_some()
    }

    /// Освобождает все привязки
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Есть ли у матрицы буфер на устройстве
    pub fn contains(&self, matrix: &Matrix) -> bool {
        self.lock().contains_key(&matrix.identity().id())
    }

    /// Количество живых привязок
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Сколько буферов под матрицы было выделено за все время
    pub fn buffer_allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }
}

/// Загрузка, поставленная в поток матрицы.
///
/// Ядро нельзя запускать, пока [`PendingUpload::wait`] не вернул `Ok`.
/// Буфер остается живым, пока жив этот объект, даже если привязку уже
/// убрали из кэша. Если загрузку не дождались явно, ожидание выполняется
/// при уничтожении.
#[must_use = "the upload must be waited on before its buffer is read"]
pub struct PendingUpload<'m> {
    binding: Arc<DeviceBinding>,
    waited: bool,
    _host: PhantomData<&'m Matrix>,
}

impl PendingUpload<'_> {
    /// Дескриптор буфера устройства с данными матрицы
    pub fn buffer(&self) -> u64 {
        self.binding.buffer.handle()
    }

    /// Блокирует до завершения копирования
    pub fn wait(&mut self) -> Result<()> {
        self.waited = true;
        self.binding
            .stream
            .synchronize()
            .context("Failed to wait for matrix upload")
    }
}

impl Drop for PendingUpload<'_> {
    fn drop(&mut self) {
        if !self.waited {
            if let Err(e) = self.binding.stream.synchronize() {
                warn!("Не удалось дождаться загрузки матрицы: {:#}", e);
            }
        }
    }
}
