mod common;

use fast_matrix::accel::{AcceleratorStats, HostAccelerator, LaunchArgs, TransferCache};
use fast_matrix::{
    AcceleratedOperator, Accelerator, AcceleratorConfig, AcceleratorContext, AcceleratorKind,
    Matrix, MatrixError, MatrixOperator, Operation,
};
use std::sync::{Arc, Mutex, OnceLock};

/// Что сделать посреди операции, пока она ждет загрузку операнда
#[derive(Debug)]
enum Interrupt {
    Dispose(AcceleratorContext),
    Clear(Arc<TransferCache>),
}

/// Хостовый ускоритель, записывающий порядок вызовов
#[derive(Debug)]
struct Recording {
    inner: HostAccelerator,
    calls: Mutex<Vec<&'static str>>,
    interrupt: OnceLock<Interrupt>,
}

impl Recording {
    fn new() -> Self {
        Self {
            inner: HostAccelerator::new(Some(1)).unwrap(),
            calls: Mutex::new(Vec::new()),
            interrupt: OnceLock::new(),
        }
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }

    fn take(&self) -> Vec<&'static str> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }
}

impl Accelerator for Recording {
    fn kind(&self) -> AcceleratorKind {
        self.inner.kind()
    }

    fn device_name(&self) -> &str {
        "recording"
    }

    fn compile(&self, operation: Operation) -> anyhow::Result<u64> {
        self.record("compile");
        self.inner.compile(operation)
    }

    fn release_kernel(&self, kernel: u64) {
        self.record("release_kernel");
        self.inner.release_kernel(kernel)
    }

    fn allocate(&self, len: usize) -> anyhow::Result<u64> {
        self.record("allocate");
        self.inner.allocate(len)
    }

    fn free(&self, buffer: u64) {
        self.record("free");
        self.inner.free(buffer)
    }

    fn create_stream(&self) -> anyhow::Result<u64> {
        self.record("create_stream");
        self.inner.create_stream()
    }

    fn release_stream(&self, stream: u64) {
        self.record("release_stream");
        self.inner.release_stream(stream)
    }

    unsafe fn upload(&self, stream: u64, buffer: u64, data: &[f64]) -> anyhow::Result<()> {
        self.record("upload");
        self.inner.upload(stream, buffer, data)
    }

    fn synchronize_stream(&self, stream: u64) -> anyhow::Result<()> {
        self.record("synchronize_stream");
        match self.interrupt.get() {
            Some(Interrupt::Dispose(context)) => context.dispose(),
            Some(Interrupt::Clear(transfers)) => transfers.clear(),
            None => {}
        }
        self.inner.synchronize_stream(stream)
    }

    fn launch(&self, kernel: u64, args: &LaunchArgs) -> anyhow::Result<()> {
        self.record("launch");
        self.inner.launch(kernel, args)
    }

    fn synchronize(&self) -> anyhow::Result<()> {
        self.record("synchronize");
        self.inner.synchronize()
    }

    fn download(&self, buffer: u64, out: &mut [f64]) -> anyhow::Result<()> {
        self.record("download");
        self.inner.download(buffer, out)
    }

    fn stats(&self) -> AcceleratorStats {
        self.inner.stats()
    }
}

fn recorded() -> (Arc<Recording>, AcceleratedOperator) {
    let recording = Arc::new(Recording::new());
    let context = AcceleratorContext::with_accelerator(recording.clone());
    (recording, AcceleratedOperator::new(context))
}

#[test]
fn first_operation_compiles_and_binds_operands() {
    let (recording, op) = recorded();
    let a = Matrix::filled(3, 3, 1.0);
    let b = Matrix::filled(3, 3, 2.0);
    op.add(&a, &b).unwrap();

    assert_eq!(
        recording.take(),
        vec![
            "compile",
            "compile",
            "compile",
            "compile",
            "allocate",
            "create_stream",
            "upload",
            "allocate",
            "create_stream",
            "upload",
            "allocate",
            "synchronize_stream",
            "synchronize_stream",
            "launch",
            "synchronize",
            "download",
            "free",
        ]
    );
}

fn position(calls: &[&str], call: &str) -> usize {
    calls.iter().position(|c| *c == call).unwrap()
}

#[test]
fn dispose_during_operation_keeps_operands_until_download() {
    let (recording, op) = recorded();
    recording
        .interrupt
        .set(Interrupt::Dispose(op.context().clone()))
        .unwrap();
    let a = Matrix::filled(3, 3, 1.0);
    let b = Matrix::filled(3, 3, 2.0);

    assert_eq!(op.add(&a, &b).unwrap(), Matrix::filled(3, 3, 3.0));
    assert!(op.context().is_disposed());

    let calls = recording.take();
    let launch = position(&calls, "launch");
    assert!(launch < position(&calls, "free"), "{:?}", calls);
    assert!(launch < position(&calls, "download"));
    assert_eq!(calls.iter().filter(|c| **c == "free").count(), 3);
    assert_eq!(calls.iter().filter(|c| **c == "release_kernel").count(), 4);

    let stats = recording.stats();
    assert_eq!(stats.allocations, stats.frees);
    assert!(matches!(op.add(&a, &b), Err(MatrixError::Disposed)));
}

#[test]
fn release_during_operation_keeps_operands_until_download() {
    let (recording, op) = recorded();
    let transfers = op.context().transfers().unwrap();
    recording.interrupt.set(Interrupt::Clear(transfers.clone())).unwrap();
    let a = Matrix::filled(2, 3, 2.0);
    let b = Matrix::filled(3, 2, 1.0);

    assert_eq!(op.multiply(&a, &b).unwrap(), Matrix::filled(2, 2, 6.0));
    let calls = recording.take();
    assert!(position(&calls, "launch") < position(&calls, "free"), "{:?}", calls);
    assert!(transfers.is_empty());
    assert_eq!(recording.stats().frees, 3);

    // Следующая операция снова выделяет буферы под операнды
    assert_eq!(op.multiply(&a, &b).unwrap(), Matrix::filled(2, 2, 6.0));
    assert_eq!(transfers.buffer_allocations(), 4);
}

#[test]
fn dispose_racing_operations_never_fails_mid_flight() {
    let op = AcceleratedOperator::new(common::host_context());
    let started = std::sync::Barrier::new(5);
    std::thread::scope(|scope| {
        for worker in 0..4 {
            let (op, started) = (&op, &started);
            scope.spawn(move || {
                let value = worker as f64;
                let a = Matrix::filled(8, 8, value);
                let b = Matrix::filled(8, 8, 1.0);
                op.add(&a, &b).unwrap();
                started.wait();
                loop {
                    match op.multiply(&a, &b) {
                        Ok(product) => assert_eq!(product, Matrix::filled(8, 8, value * 8.0)),
                        Err(MatrixError::Disposed) => break,
                        Err(e) => panic!("operation failed after dispose: {}", e),
                    }
                }
            });
        }
        started.wait();
        op.context().dispose();
    });
    assert!(op.context().is_disposed());
}

#[test]
fn later_operations_only_copy() {
    let (recording, op) = recorded();
    let a = Matrix::filled(3, 3, 1.0);
    let b = Matrix::filled(3, 3, 2.0);
    op.multiply(&a, &b).unwrap();
    recording.take();

    op.multiply(&a, &b).unwrap();
    assert_eq!(
        recording.take(),
        vec![
            "upload",
            "upload",
            "allocate",
            "synchronize_stream",
            "synchronize_stream",
            "launch",
            "synchronize",
            "download",
            "free",
        ]
    );
}

#[test]
fn invalid_shapes_never_reach_the_accelerator() {
    let (recording, op) = recorded();
    assert!(op.multiply(&Matrix::new(5, 3), &Matrix::new(4, 5)).is_err());
    assert!(op.add(&Matrix::new(5, 3), &Matrix::new(4, 3)).is_err());
    assert!(recording.take().is_empty());
}

#[test]
fn dispose_releases_everything() {
    let (recording, op) = recorded();
    let a = Matrix::filled(2, 2, 1.0);
    let b = Matrix::filled(2, 2, 1.0);
    op.add(&a, &b).unwrap();
    recording.take();

    op.context().dispose();
    let calls = recording.take();
    assert_eq!(calls.iter().filter(|c| **c == "free").count(), 2);
    assert_eq!(calls.iter().filter(|c| **c == "release_stream").count(), 2);
    assert_eq!(calls.iter().filter(|c| **c == "release_kernel").count(), 4);

    let stats = recording.stats();
    assert_eq!(stats.allocations, stats.frees);
}

#[test]
fn dispose_is_idempotent() {
    let (recording, op) = recorded();
    op.context().dispose();
    op.context().dispose();
    assert!(op.context().is_disposed());
    assert!(matches!(op.transpose(&Matrix::new(2, 2)), Err(MatrixError::Disposed)));
    assert!(matches!(op.context().accelerator(), Err(MatrixError::Disposed)));
    assert!(!recording.take().contains(&"compile"));
}

#[test]
fn disposed_context_rejects_every_operation() {
    let op = AcceleratedOperator::new(common::host_context());
    let a = Matrix::filled(2, 2, 1.0);
    op.add(&a, &a).unwrap();
    op.context().dispose();

    for operation in Operation::ALL {
        let err = op.apply(operation, &[Some(&a), Some(&a)]).unwrap_err();
        assert!(matches!(err, MatrixError::Disposed), "{}", operation);
    }
    assert!(!op.context().is_available());
}

#[test]
fn host_only_config_from_json() {
    let config = AcceleratorConfig::from_json(r#"{"preference": ["host"], "host_threads": 2}"#).unwrap();
    let context = AcceleratorContext::new(config);
    assert_eq!(context.kind().unwrap(), AcceleratorKind::Host);
    context.dispose();
}
