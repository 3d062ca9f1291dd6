//! # asr-core
//!
//! Базовые типы и утилиты, общие для крейтов RustASR:
//!
//! - Унифицированная обработка ошибок через [`AsrError`]
//! - Переключатель подробного отладочного вывода ([`debug::enabled`])
//! - Усреднение чекпоинтов модели ([`checkpoint`])

pub mod checkpoint;
pub mod debug;
pub mod error;

pub use checkpoint::{average_checkpoints, save_checkpoint, select_checkpoints, SelectOptions};
pub use error::{AsrError, AsrResult};
