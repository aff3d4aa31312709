//! Настройки выбора ускорителя

use crate::accel::AcceleratorKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Переменная окружения со списком ускорителей через запятую
pub const ACCELERATOR_ENV: &str = "FAST_MATRIX_ACCELERATOR";
/// Переменная окружения с числом потоков хостового ускорителя
pub const HOST_THREADS_ENV: &str = "FAST_MATRIX_HOST_THREADS";

/// Настройки [`crate::accel::AcceleratorContext`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceleratorConfig {
    /// Порядок перебора кандидатов
    pub preference: Vec<AcceleratorKind>,
    /// Потоки хостового ускорителя, при `None` по числу ядер
    pub host_threads: Option<usize>,
    /// Явный путь к библиотеке OpenCL
    pub opencl_library: Option<PathBuf>,
    /// Явный путь к драйверу CUDA
    pub cuda_library: Option<PathBuf>,
    /// Явный путь к NVRTC
    pub nvrtc_library: Option<PathBuf>,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            preference: vec![
                AcceleratorKind::Cuda,
                AcceleratorKind::OpenCl,
                AcceleratorKind::Host,
            ],
            host_threads: None,
            opencl_library: None,
            cuda_library: None,
            nvrtc_library: None,
        }
    }
}

impl AcceleratorConfig {
    /// Только хостовый ускоритель
    pub fn host_only() -> Self {
        Self {
            preference: vec![AcceleratorKind::Host],
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse accelerator config")
    }

    /// Настройки по умолчанию, переопределенные переменными окружения
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(value) = std::env::var(ACCELERATOR_ENV) {
            config.preference = parse_preference(&value)?;
        }
        if let Ok(value) = std::env::var(HOST_THREADS_ENV) {
            let threads = value
                .trim()
                .parse::<usize>()
                .with_context(|| format!("Invalid {}: {}", HOST_THREADS_ENV, value))?;
            config.host_threads = Some(threads);
        }
        Ok(config)
    }

    /// Итоговая цепочка выбора: без повторов, хост всегда последний резерв
    pub fn chain(&self) -> Vec<AcceleratorKind> {
        let mut chain = Vec::with_capacity(3);
        for kind in &self.preference {
            if !chain.contains(kind) {
                chain.push(*kind);
            }
        }
        if !chain.contains(&AcceleratorKind::Host) {
            chain.push(AcceleratorKind::Host);
        }
        chain
    }
}

fn parse_preference(value: &str) -> Result<Vec<AcceleratorKind>> {
    value
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(str::parse)
        .collect()
}
