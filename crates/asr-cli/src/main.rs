//!
//! CLI для E-Branchformer энкодера: усреднение чекпоинтов и прогон энкодера.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;

use asr_core::SelectOptions;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use model_ebranchformer::{EBranchformerConfig, EBranchformerEncoder};
use tracing::info;

#[derive(Parser)]
#[command(name = "rustasr")]
#[command(author, version, about = "RustASR: streaming E-Branchformer encoder", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Усреднить несколько чекпоинтов в один safetensors-файл
    Average {
        /// Куда сохранить усреднённую модель
        #[arg(long)]
        dst_model: PathBuf,

        /// Директория с чекпоинтами
        #[arg(long)]
        src_path: PathBuf,

        /// Брать эпохи с лучшим validation loss (по `epoch_*.json`)
        #[arg(long, default_value_t = false)]
        val_best: bool,

        /// Сколько чекпоинтов усреднять
        #[arg(long, default_value_t = 5)]
        num: usize,

        /// Минимальная эпоха (только с --val-best)
        #[arg(long, default_value_t = 0)]
        min_epoch: u64,

        /// Максимальная эпоха (только с --val-best)
        #[arg(long, default_value_t = u64::MAX)]
        max_epoch: u64,
    },

    /// Прогнать энкодер на случайных признаках: полный и потоковый режим
    Encode {
        /// JSON-конфигурация энкодера (по умолчанию — `small`)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Веса в safetensors; без них веса инициализируются случайно
        #[arg(long)]
        weights: Option<PathBuf>,

        /// Число входных кадров
        #[arg(long, default_value_t = 64)]
        frames: usize,

        /// Размер чанка для потокового режима
        #[arg(long, default_value_t = 16)]
        chunk_size: usize,

        /// Сколько левых чанков держать в кеше (по умолчанию — все)
        #[arg(long)]
        left_chunks: Option<usize>,

        /// Device to use (cpu, metal, cuda)
        #[arg(long, default_value = "cpu")]
        device: String,
    },

    /// Run a simple test to verify the setup
    Test {
        /// Device to use (cpu, metal, cuda)
        #[arg(long, default_value = "cpu")]
        device: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Average {
            dst_model,
            src_path,
            val_best,
            num,
            min_epoch,
            max_epoch,
        } => {
            if min_epoch > max_epoch {
                bail!("--min-epoch {min_epoch} больше --max-epoch {max_epoch}");
            }
            let opts = SelectOptions {
                val_best,
                min_epoch,
                max_epoch,
                ..SelectOptions::new(src_path, num)
            };
            let paths = asr_core::select_checkpoints(&opts).context("выбор чекпоинтов")?;
            let averaged = asr_core::average_checkpoints(&paths, num, &Device::Cpu)
                .context("усреднение чекпоинтов")?;
            asr_core::save_checkpoint(&averaged, &dst_model)
                .with_context(|| format!("сохранение {}", dst_model.display()))?;
            println!("✅ Усреднено {} чекпоинтов → {}", paths.len(), dst_model.display());
            Ok(())
        }

        Commands::Encode {
            config,
            weights,
            frames,
            chunk_size,
            left_chunks,
            device,
        } => run_encode(config, weights, frames, chunk_size, left_chunks, &device),

        Commands::Test { device } => {
            println!("🧪 RustASR - Setup Test");
            println!("=======================");

            let device = create_device(&device)?;
            println!("Testing {:?} device...", device);

            let a = Tensor::randn(0f32, 1f32, (2, 3), &device)?;
            let b = Tensor::randn(0f32, 1f32, (3, 4), &device)?;
            let c = a.matmul(&b)?;
            println!("✅ Test passed. Output shape: {:?}", c.dims());
            Ok(())
        }
    }
}

fn run_encode(
    config: Option<PathBuf>,
    weights: Option<PathBuf>,
    frames: usize,
    chunk_size: usize,
    left_chunks: Option<usize>,
    device: &str,
) -> Result<()> {
    if chunk_size == 0 {
        bail!("--chunk-size должен быть > 0");
    }
    let device = create_device(device)?;
    let cfg = match &config {
        Some(path) => EBranchformerConfig::from_json_file(path)
            .with_context(|| format!("чтение конфигурации {}", path.display()))?,
        None => EBranchformerConfig::small(),
    };

    let start = Instant::now();
    let encoder = match &weights {
        Some(path) => EBranchformerEncoder::from_safetensors(&cfg, path, &device)?,
        None => {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            EBranchformerEncoder::load(&cfg, vb.pp("encoder"))?
        }
    };
    info!(
        layers = encoder.num_layers(),
        size = encoder.output_size(),
        "энкодер готов за {:.2?}",
        start.elapsed()
    );

    let xs = Tensor::randn(0f32, 1f32, (1, frames, cfg.input_dim), &device)?;
    let lens = Tensor::new(&[frames as u32], &device)?;

    let start = Instant::now();
    let (full, _) = encoder.forward(&xs, &lens, false)?;
    println!("Полный прогон:    {:?} за {:.2?}", full.dims(), start.elapsed());

    let start = Instant::now();
    let streamed = encoder.forward_chunk_by_chunk(&xs, chunk_size, left_chunks)?;
    println!(
        "Потоковый прогон: {:?} за {:.2?} (chunk={}, left_chunks={:?})",
        streamed.dims(),
        start.elapsed(),
        chunk_size,
        left_chunks
    );

    if asr_core::debug::enabled() {
        let (min, max, rms) = asr_core::debug::stats(&streamed)?;
        println!("stats: min={min:.4} max={max:.4} rms={rms:.4}");
    }
    Ok(())
}

fn create_device(device: &str) -> Result<Device> {
    match device {
        "metal" => {
            // candle может panic при инициализации Metal, если устройство недоступно.
            let prev_hook = std::panic::take_hook();
            std::panic::set_hook(Box::new(|_| {}));
            let res = std::panic::catch_unwind(|| Device::new_metal(0));
            std::panic::set_hook(prev_hook);

            match res {
                Ok(Ok(dev)) => Ok(dev),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(anyhow::anyhow!(
                    "Инициализация Metal недоступна в этом окружении. Попробуйте --device cpu."
                )),
            }
        }
        "cuda" => Ok(Device::new_cuda(0)?),
        _ => Ok(Device::Cpu),
    }
}
