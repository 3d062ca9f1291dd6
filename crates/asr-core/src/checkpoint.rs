//! Усреднение чекпоинтов модели (safetensors).
//!
//! Два режима выбора файлов:
//! - `val_best`: читаются метаданные `epoch_*.json`, берутся `num` эпох
//!   с наименьшим validation loss в диапазоне `[min_epoch, max_epoch]`;
//! - иначе: последние `num` файлов `*.safetensors` по времени изменения
//!   (файлы `init*` пропускаются).
//!
//! Усреднение поэлементное, накопление в f32, результат приводится
//! к исходному dtype каждого тензора.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use serde::Deserialize;
use tracing::{debug, info};

use crate::{AsrError, AsrResult};

/// Параметры выбора чекпоинтов для усреднения.
#[derive(Debug, Clone)]
pub struct SelectOptions {
    /// Директория с чекпоинтами.
    pub src_path: PathBuf,
    /// Сколько чекпоинтов усреднять.
    pub num: usize,
    /// Выбирать по лучшему validation loss вместо последних по времени.
    pub val_best: bool,
    /// Минимальная эпоха (включительно), только для `val_best`.
    pub min_epoch: u64,
    /// Максимальная эпоха (включительно), только для `val_best`.
    pub max_epoch: u64,
}

impl SelectOptions {
    pub fn new(src_path: impl Into<PathBuf>, num: usize) -> Self {
        Self {
            src_path: src_path.into(),
            num,
            val_best: false,
            min_epoch: 0,
            max_epoch: u64::MAX,
        }
    }
}

/// Метаданные эпохи, которые пишет цикл обучения рядом с весами.
#[derive(Debug, Clone, Deserialize)]
pub struct EpochInfo {
    pub epoch: u64,
    pub tag: String,
    pub result_dict: EpochResult,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EpochResult {
    pub loss: f64,
}

/// Выбрать файлы чекпоинтов для усреднения.
pub fn select_checkpoints(opts: &SelectOptions) -> AsrResult<Vec<PathBuf>> {
    if !opts.src_path.is_dir() {
        return Err(AsrError::Checkpoint(format!(
            "директория не найдена: {}",
            opts.src_path.display()
        )));
    }

    let paths = if opts.val_best {
        select_val_best(opts)?
    } else {
        select_latest(opts)?
    };

    info!("Чекпоинты для усреднения: {:?}", paths);
    Ok(paths)
}

fn select_val_best(opts: &SelectOptions) -> AsrResult<Vec<PathBuf>> {
    let mut scores: Vec<EpochInfo> = Vec::new();
    for entry in std::fs::read_dir(&opts.src_path)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !(name.starts_with("epoch_") && name.ends_with(".json")) {
            continue;
        }
        let info: EpochInfo = serde_json::from_slice(&std::fs::read(&path)?)?;
        if (opts.min_epoch..=opts.max_epoch).contains(&info.epoch) {
            scores.push(info);
        }
    }

    scores.sort_by(|a, b| a.result_dict.loss.total_cmp(&b.result_dict.loss));
    scores.truncate(opts.num);
    for s in &scores {
        info!(
            "best val: epoch={}, loss={:.4}, tag={}",
            s.epoch, s.result_dict.loss, s.tag
        );
    }

    Ok(scores
        .iter()
        .map(|s| opts.src_path.join(format!("{}.safetensors", s.tag)))
        .collect())
}

fn select_latest(opts: &SelectOptions) -> AsrResult<Vec<PathBuf>> {
    let mut found: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(&opts.src_path)? {
        let path = entry?.path();
        if !path.is_file() || path.extension().and_then(|s| s.to_str()) != Some("safetensors") {
            continue;
        }
        let is_init = path
            .file_name()
            .and_then(|s| s.to_str())
            .is_some_and(|n| n.starts_with("init"));
        if is_init {
            continue;
        }
        let mtime = std::fs::metadata(&path)?.modified()?;
        found.push((mtime, path));
    }
    found.sort();

    let skip = found.len().saturating_sub(opts.num);
    Ok(found.into_iter().skip(skip).map(|(_, p)| p).collect())
}

/// Усреднить веса из `paths`.
///
/// `expected` — запрошенное число чекпоинтов; несовпадение с числом
/// найденных файлов считается ошибкой (иначе среднее будет смещено).
pub fn average_checkpoints(
    paths: &[PathBuf],
    expected: usize,
    device: &Device,
) -> AsrResult<HashMap<String, Tensor>> {
    if paths.len() != expected {
        return Err(AsrError::Checkpoint(format!(
            "найдено {} чекпоинтов, запрошено {}",
            paths.len(),
            expected
        )));
    }
    if paths.is_empty() {
        return Err(AsrError::Checkpoint("нечего усреднять".to_string()));
    }

    let mut sums: HashMap<String, Tensor> = HashMap::new();
    let mut dtypes: HashMap<String, DType> = HashMap::new();

    for path in paths {
        info!("Обработка {}", path.display());
        let states = candle_core::safetensors::load(path, device)?;
        for (name, tensor) in states {
            let as_f32 = tensor.to_dtype(DType::F32)?;
            match sums.get_mut(&name) {
                Some(acc) => {
                    *acc = acc.add(&as_f32).map_err(|e| {
                        AsrError::Checkpoint(format!("{name}: {e} ({})", path.display()))
                    })?;
                }
                None => {
                    dtypes.insert(name.clone(), tensor.dtype());
                    sums.insert(name, as_f32);
                }
            }
        }
    }

    let n = paths.len() as f64;
    let mut avg = HashMap::with_capacity(sums.len());
    for (name, sum) in sums {
        let dtype = dtypes.get(&name).copied().unwrap_or(DType::F32);
        let mean = (sum / n)?.to_dtype(dtype)?;
        debug!("{name}: {:?} {:?}", mean.dims(), dtype);
        avg.insert(name, mean);
    }
    Ok(avg)
}

/// Сохранить набор тензоров в safetensors.
pub fn save_checkpoint(tensors: &HashMap<String, Tensor>, path: impl AsRef<Path>) -> AsrResult<()> {
    let path = path.as_ref();
    info!("Сохранение в {}", path.display());
    candle_core::safetensors::save(tensors, path)?;
    Ok(())
}
