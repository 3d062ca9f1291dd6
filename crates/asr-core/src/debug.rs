//! Вспомогательные функции для отладочного вывода.

use std::sync::OnceLock;

use candle_core::{Result, Tensor};

/// Возвращает `true`, если включен подробный отладочный вывод.
///
/// Управляется переменной окружения `RUSTASR_DEBUG` (любое непустое значение).
pub fn enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| std::env::var_os("RUSTASR_DEBUG").is_some_and(|v| !v.is_empty()))
}

/// Минимум, максимум и RMS тензора (в f32) для отладочных логов.
pub fn stats(t: &Tensor) -> Result<(f32, f32, f32)> {
    let flat = t.flatten_all()?.to_dtype(candle_core::DType::F32)?;
    let min = flat.min(0)?.to_scalar::<f32>()?;
    let max = flat.max(0)?.to_scalar::<f32>()?;
    let rms = flat.sqr()?.mean_all()?.sqrt()?.to_scalar::<f32>()?;
    Ok((min, max, rms))
}
