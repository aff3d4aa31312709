//! Контекст ускорителя: выбор, выдача и освобождение
//!
//! Выбор выполняется лениво, ровно один раз, по цепочке из
//! [`AcceleratorConfig::chain`]: CUDA, затем OpenCL GPU, затем хостовый
//! ускоритель, который создается всегда. Выбранный ускоритель больше не
//! меняется до освобождения контекста.

use super::{Accelerator, AcceleratorKind, HostAccelerator, KernelSet, TransferCache};
use crate::config::AcceleratorConfig;
use crate::cuda::CudaAccelerator;
use crate::error::{MatrixError, Result};
use crate::opencl::OpenClAccelerator;
use crate::utils::measure_time;
use anyhow::Context;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

enum State {
    /// Выбор еще не выполнялся
    Pending,
    Ready(Ready),
    Disposed,
}

struct Ready {
    accelerator: Arc<dyn Accelerator>,
    kernels: Option<Arc<KernelSet>>,
    transfers: Arc<TransferCache>,
}

impl Ready {
    fn new(accelerator: Arc<dyn Accelerator>) -> Self {
        let transfers = Arc::new(TransferCache::new(Arc::clone(&accelerator)));
        Self {
            accelerator,
            kernels: None,
            transfers,
        }
    }
}

struct Inner {
    config: AcceleratorConfig,
    state: Mutex<State>,
}

/// Все, что нужно одной операции на ускорителе.
///
/// Снимок берется под замком контекста, а сами вычисления идут без него.
pub(crate) struct Session {
    pub(crate) accelerator: Arc<dyn Accelerator>,
    pub(crate) kernels: Arc<KernelSet>,
    pub(crate) transfers: Arc<TransferCache>,
}

/// Владеемый вызывающим кодом контекст ускорителя.
///
/// Клоны разделяют одно состояние. Контекст создается явно и передается в
/// [`crate::operator::AcceleratedOperator`]; независимые контексты не
/// влияют друг на друга.
///
/// После [`AcceleratorContext::dispose`] любое обращение возвращает
/// [`MatrixError::Disposed`]; повторное освобождение ничего не делает.
#[derive(Clone)]
pub struct AcceleratorContext {
    inner: Arc<Inner>,
}

impl AcceleratorContext {
    pub fn new(config: AcceleratorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::Pending),
            }),
        }
    }

    /// Контекст с настройками из переменных окружения
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(AcceleratorConfig::from_env()?))
    }

    /// Контекст с уже созданным ускорителем, без цепочки выбора
    pub fn with_accelerator(accelerator: Arc<dyn Accelerator>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: AcceleratorConfig::default(),
                state: Mutex::new(State::Ready(Ready::new(accelerator))),
            }),
        }
    }

    pub fn config(&self) -> &AcceleratorConfig {
        &self.inner.config
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ready<'s>(&self, state: &'s mut State) -> Result<&'s mut Ready> {
        if let State::Pending = state {
            let accelerator = select(&self.inner.config)?;
            *state = State::Ready(Ready::new(accelerator));
        }
        match state {
            State::Ready(ready) => Ok(ready),
            State::Disposed => Err(MatrixError::Disposed),
            State::Pending => unreachable!("selection either fails or yields a ready state"),
        }
    }

    /// Выбранный ускоритель; при первом вызове выполняет выбор
    pub fn accelerator(&self) -> Result<Arc<dyn Accelerator>> {
        let mut state = self.lock();
        let ready = self.ready(&mut state)?;
        Ok(Arc::clone(&ready.accelerator))
    }

    pub fn kind(&self) -> Result<AcceleratorKind> {
        Ok(self.accelerator()?.kind())
    }

    /// Есть ли хоть какой-то ускоритель.
    ///
    /// Хостовый вариант создается всегда, поэтому `false` возможен только
    /// после освобождения контекста или при сбое выбора.
    pub fn is_available(&self) -> bool {
        self.accelerator().is_ok()
    }

    /// Выбран ли настоящий GPU (CUDA или OpenCL GPU)
    pub fn is_gpu_available(&self) -> bool {
        self.kind().map(AcceleratorKind::is_gpu).unwrap_or(false)
    }

    pub fn is_disposed(&self) -> bool {
        matches!(*self.lock(), State::Disposed)
    }

    /// Кэш буферов устройства
    pub fn transfers(&self) -> Result<Arc<TransferCache>> {
        let mut state = self.lock();
        let ready = self.ready(&mut state)?;
        Ok(Arc::clone(&ready.transfers))
    }

    /// Снимок для одной операции; при первом вызове компилирует ядра
    pub(crate) fn session(&self) -> Result<Session> {
        let mut state = self.lock();
        let ready = self.ready(&mut state)?;
        let kernels = match &ready.kernels {
            Some(kernels) => Arc::clone(kernels),
            None => {
                let (kernels, elapsed) = measure_time(|| KernelSet::compile(&ready.accelerator));
                let kernels = Arc::new(kernels.context("Failed to compile matrix kernels")?);
                info!(
                    device = ready.accelerator.device_name(),
                    ?elapsed,
                    "Ядра скомпилированы"
                );
                ready.kernels = Some(Arc::clone(&kernels));
                kernels
            }
        };
        Ok(Session {
            accelerator: Arc::clone(&ready.accelerator),
            kernels,
            transfers: Arc::clone(&ready.transfers),
        })
    }

    /// Освобождает ядра, все буферы матриц и сам ускоритель.
    ///
    /// Операции, уже получившие снимок, доработают до конца; ресурсы
    /// освободятся, когда их отпустит последний пользователь.
    pub fn dispose(&self) {
        let previous = std::mem::replace(&mut *self.lock(), State::Disposed);
        match previous {
            State::Ready(ready) => {
                ready.transfers.clear();
                info!(
                    device = ready.accelerator.device_name(),
                    "Контекст ускорителя освобожден"
                );
            }
            State::Pending => debug!("Контекст освобожден до первого использования"),
            State::Disposed => debug!("Повторное освобождение контекста проигнорировано"),
        }
    }
}

impl Default for AcceleratorContext {
    fn default() -> Self {
        Self::new(AcceleratorConfig::default())
    }
}

impl std::fmt::Debug for AcceleratorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.lock() {
            State::Pending => "pending".to_string(),
            State::Ready(ready) => format!("ready({})", ready.accelerator.device_name()),
            State::Disposed => "disposed".to_string(),
        };
        f.debug_struct("AcceleratorContext")
            .field("config", &self.inner.config)
            .field("state", &state)
            .finish()
    }
}

/// Перебирает кандидатов по порядку; первый найденный побеждает
fn select(config: &AcceleratorConfig) -> Result<Arc<dyn Accelerator>> {
    for kind in config.chain() {
        let candidate: anyhow::Result<Option<Arc<dyn Accelerator>>> = match kind {
            AcceleratorKind::Cuda => CudaAccelerator::probe(config)
                .map(|found| found.map(|a| Arc::new(a) as Arc<dyn Accelerator>)),
            AcceleratorKind::OpenCl => OpenClAccelerator::probe(config)
                .map(|found| found.map(|a| Arc::new(a) as Arc<dyn Accelerator>)),
            AcceleratorKind::Host => HostAccelerator::new(config.host_threads)
                .map(|a| Some(Arc::new(a) as Arc<dyn Accelerator>)),
        };

        match candidate {
            Ok(Some(accelerator)) => {
                info!(
                    %kind,
                    device = accelerator.device_name(),
                    "Выбран ускоритель"
                );
                return Ok(accelerator);
            }
            Ok(None) => debug!(%kind, "Устройства не найдены"),
            Err(e) if kind == AcceleratorKind::Host => return Err(e.into()),
            Err(e) => warn!(%kind, "Кандидат пропущен: {:#}", e),
        }
    }
    Err(anyhow::anyhow!("No accelerator could be created").into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::Matrix;

    fn host_context() -> AcceleratorContext {
        AcceleratorContext::new(AcceleratorConfig {
            host_threads: Some(2),
            ..AcceleratorConfig::host_only()
        })
    }

    #[test]
    fn selection_is_lazy_and_sticky() {
        let ctx = host_context();
        assert!(format!("{:?}", ctx).contains("pending"));
        let first = ctx.accelerator().unwrap();
        let second = ctx.accelerator().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.kind(), AcceleratorKind::Host);
        assert!(ctx.is_available());
        assert!(!ctx.is_gpu_available());
    }

    #[test]
    fn default_chain_always_finds_something() {
        let ctx = AcceleratorContext::default();
        assert!(ctx.is_available());
        ctx.dispose();
    }

    #[test]
    fn clones_share_state() {
        let ctx = host_context();
        let clone = ctx.clone();
        let a = ctx.accelerator().unwrap();
        let b = clone.accelerator().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        clone.dispose();
        assert!(ctx.is_disposed());
    }

    #[test]
    fn independent_contexts_do_not_share() {
        let one = host_context();
        let two = host_context();
        assert!(!Arc::ptr_eq(&one.accelerator().unwrap(), &two.accelerator().unwrap()));
    }

    #[test]
    fn session_compiles_kernels_once() {
        let ctx = host_context();
        let first = ctx.session().unwrap();
        let second = ctx.session().unwrap();
        assert!(Arc::ptr_eq(&first.kernels, &second.kernels));
        assert!(Arc::ptr_eq(&first.transfers, &second.transfers));
    }

    #[test]
    fn dispose_is_idempotent_and_blocks_further_use() {
        let ctx = host_context();
        ctx.dispose();
        ctx.dispose();
        assert!(ctx.is_disposed());
        assert!(!ctx.is_available());
        assert!(matches!(ctx.accelerator(), Err(MatrixError::Disposed)));
        assert!(matches!(ctx.session(), Err(MatrixError::Disposed)));
    }

    #[test]
    fn dispose_releases_bindings() {
        let ctx = host_context();
        let accelerator = ctx.accelerator().unwrap();
        let transfers = ctx.transfers().unwrap();
        let m = Matrix::filled(3, 3, 1.0);
        transfers.upload(&m).unwrap().wait().unwrap();
        assert_eq!(transfers.len(), 1);

        ctx.dispose();
        assert!(transfers.is_empty());
        assert_eq!(accelerator.stats().frees, 1);
    }
}
