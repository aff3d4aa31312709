//! Вспомогательные функции и утилиты

use std::ffi::CString;
use std::time::{Duration, Instant};

/// Измеряет время выполнения функции
pub fn measure_time<F, T>(f: F) -> (T, Duration)
where
    F: FnOnce() -> T,
{
    let start = Instant::now();
    let result = f();
    let duration = start.elapsed();
    (result, duration)
}

/// Преобразует строку в null-terminated строку для C
pub fn to_c_string(s: &str) -> anyhow::Result<CString> {
    CString::new(s).map_err(|e| anyhow::anyhow!("String contains interior NUL: {}", e))
}

/// Читает null-terminated байты, заполненные драйвером
pub fn from_c_bytes(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Среднее время одной итерации
pub fn average(total: Duration, iterations: usize) -> Duration {
    match u32::try_from(iterations) {
        Ok(0) => Duration::ZERO,
        Ok(n) => total / n,
        Err(_) => Duration::from_secs_f64(total.as_secs_f64() / iterations as f64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measures_and_returns_result() {
        let (value, elapsed) = measure_time(|| 2 + 2);
        assert_eq!(value, 4);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn c_strings() {
        assert_eq!(to_c_string("matrix_add").unwrap().as_bytes_with_nul(), b"matrix_add\0");
        assert!(to_c_string("a\0b").is_err());
        assert_eq!(from_c_bytes(b"Tesla\0\0\0"), "Tesla");
        assert_eq!(from_c_bytes(b"no-nul"), "no-nul");
    }

    #[test]
    fn average_handles_zero_iterations() {
        assert_eq!(average(Duration::from_secs(4), 0), Duration::ZERO);
        assert_eq!(average(Duration::from_secs(4), 2), Duration::from_secs(2));
    }
}
