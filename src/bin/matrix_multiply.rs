//! Тестирование производительности умножения матриц на всех бэкендах
use anyhow::{Context, Result};
use clap::Parser;
use fast_matrix::accel::AcceleratorStats;
use fast_matrix::matrix::compare_results;
use fast_matrix::utils::{average, measure_time};
use fast_matrix::{
    AcceleratedOperator, AcceleratorContext, Matrix, MatrixOperator, ParallelOperator,
    SerialOperator,
};
use indicatif::{ProgressBar, ProgressStyle};
use prettytable::{row, Table};
use serde::Serialize;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const EPSILON: f64 = 1e-9;

#[derive(Parser, Debug)]
#[command(about = "Сравнение времени умножения матриц на разных бэкендах")]
struct Args {
    /// Размер квадратных матриц
    #[arg(short, long, default_value_t = 512)]
    size: usize,

    /// Число замеров на каждом бэкенде
    #[arg(short, long, default_value_t = 5)]
    iterations: usize,

    /// Вывести отчет в JSON вместо таблицы
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct BackendReport {
    backend: &'static str,
    #[serde(with = "millis")]
    average: Duration,
    matches_serial: bool,
}

#[derive(Serialize)]
struct Report {
    size: usize,
    iterations: usize,
    device: String,
    backends: Vec<BackendReport>,
    stats: AcceleratorStats,
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64() * 1000.0)
    }
}

fn bench(
    op: &dyn MatrixOperator,
    a: &Matrix,
    b: &Matrix,
    iterations: usize,
    pb: &ProgressBar,
) -> Result<(Duration, Matrix)> {
    pb.set_message(op.name());

    // Прогрев: первая операция на ускорителе компилирует ядра
    let mut last = op.multiply(a, b)?;
    let mut total = Duration::ZERO;
    for _ in 0..iterations {
        let (result, elapsed) = measure_time(|| op.multiply(a, b));
        last = result?;
        total += elapsed;
        pb.inc(1);
    }
    Ok((average(total, iterations), last))
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let a = Matrix::random(args.size, args.size);
    let b = Matrix::random(args.size, args.size);

    let context = AcceleratorContext::from_env().context("Не удалось прочитать настройки")?;
    let accelerated = AcceleratedOperator::new(context.clone());
    let operators: [&dyn MatrixOperator; 3] =
        [&SerialOperator::new(), &ParallelOperator::new(), &accelerated];

    let pb = ProgressBar::new((operators.len() * args.iterations) as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}")
            .context("Некорректный шаблон прогресса")?
            .progress_chars("#>-"),
    );

    let mut measured = Vec::with_capacity(operators.len());
    for op in operators {
        let (time, result) = bench(op, &a, &b, args.iterations, &pb)?;
        measured.push((op.name(), time, result));
    }
    pb.finish_and_clear();

    let reference = &measured[0].2;
    let backends: Vec<BackendReport> = measured
        .iter()
        .map(|(backend, average, result)| BackendReport {
            backend: *backend,
            average: *average,
            matches_serial: compare_results(reference, result, EPSILON),
        })
        .collect();

    let report = Report {
        size: args.size,
        iterations: args.iterations,
        device: context.accelerator()?.device_name().to_string(),
        backends,
        stats: context.accelerator()?.stats(),
    };
    context.dispose();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.add_row(row!["Бэкенд", "Среднее время", "Совпадает с эталоном"]);
    for backend in &report.backends {
        let name = backend.backend;
        let time = format!("{:.2?}", backend.average);
        let verdict = if backend.matches_serial { "да" } else { "НЕТ" };
        table.add_row(row![name, time, verdict]);
    }
    println!(
        "Умножение {}x{}, {} итераций, ускоритель: {}",
        report.size, report.size, report.iterations, report.device
    );
    table.printstd();

    if report.backends.iter().any(|backend| !backend.matches_serial) {
        anyhow::bail!("Результаты бэкендов расходятся");
    }
    Ok(())
}
