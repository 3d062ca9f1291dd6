//! E-Branchformer энкодер: эмбеддинг → N × слой → LayerNorm.
//!
//! Два режима:
//! - [`EBranchformerEncoder::forward`] — вся последовательность, маска из длин
//!   (+ статическая чанковая маска, если задана);
//! - [`EBranchformerEncoder::forward_chunk`] — потоковый инференс по чанкам
//!   с явным [`EncoderCache`].

use std::path::Path;

use asr_core::{AsrError, AsrResult};
use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{Dropout, LayerNorm, Linear, VarBuilder};
use tracing::{debug, info};

use crate::attention::apply_linear;
use crate::cache::{EncoderCache, LayerCache};
use crate::config::EBranchformerConfig;
use crate::encoder_layer::EBranchformerEncoderLayer;
use crate::mask::{add_optional_chunk_mask, make_non_pad_mask};
use crate::position::RelPositionalEncoding;

/// Входной эмбеддинг без субдискретизации: Linear → LayerNorm → Dropout → PE.
#[derive(Debug, Clone)]
pub struct LinearEmbed {
    linear: Linear,
    norm: LayerNorm,
    dropout: Dropout,
    pos_enc: RelPositionalEncoding,
}

impl LinearEmbed {
    pub fn load(cfg: &EBranchformerConfig, vb: VarBuilder) -> Result<Self> {
        let linear = candle_nn::linear(cfg.input_dim, cfg.output_size, vb.pp("out.0"))?;
        let norm = candle_nn::layer_norm(cfg.output_size, 1e-5, vb.pp("out.1"))?;
        let pos_enc = RelPositionalEncoding::new(
            cfg.output_size,
            cfg.positional_dropout_rate,
            cfg.max_pos_len,
            vb.device(),
        )?;
        Ok(Self {
            linear,
            norm,
            dropout: Dropout::new(cfg.dropout_rate),
            pos_enc,
        })
    }

    /// `[B, T, input_dim]` → (`[B, T, D]`, `pos_emb [1, T, D]` с позиции `offset`).
    pub fn forward(&self, xs: &Tensor, offset: usize, train: bool) -> Result<(Tensor, Tensor)> {
        let xs = apply_linear(&self.linear, xs)?;
        let xs = self.norm.forward(&xs)?;
        let xs = self.dropout.forward(&xs, train)?;
        self.pos_enc.forward(&xs, offset, train)
    }

    pub fn position_encoding(&self, offset: usize, size: usize) -> Result<Tensor> {
        self.pos_enc.position_encoding(offset, size)
    }
}

/// Стек E-Branchformer слоёв.
#[derive(Debug)]
pub struct EBranchformerEncoder {
    embed: LinearEmbed,
    layers: Vec<EBranchformerEncoderLayer>,
    after_norm: LayerNorm,
    config: EBranchformerConfig,
}

impl EBranchformerEncoder {
    /// Загрузить энкодер из VarBuilder (safetensors или VarMap).
    pub fn load(config: &EBranchformerConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let embed = LinearEmbed::load(config, vb.pp("embed"))?;
        let layers = (0..config.num_blocks)
            .map(|i| EBranchformerEncoderLayer::from_config(config, i, vb.pp(format!("encoders.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let after_norm = candle_nn::layer_norm(config.output_size, 1e-5, vb.pp("after_norm"))?;
        debug!(
            layers = layers.len(),
            size = config.output_size,
            attention = ?config.selfattention_layer_type,
            "E-Branchformer энкодер собран"
        );
        Ok(Self {
            embed,
            layers,
            after_norm,
            config: config.clone(),
        })
    }

    /// Загрузить веса из safetensors-файла (префикс `encoder`).
    pub fn from_safetensors(config: &EBranchformerConfig, path: impl AsRef<Path>, device: &Device) -> AsrResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(AsrError::Model(format!("веса не найдены: {}", path.display())));
        }
        info!("Загрузка E-Branchformer из {}", path.display());
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device)? };
        let encoder = Self::load(config, vb.pp("encoder"))?;
        info!("E-Branchformer энкодер загружен: {} слоёв", config.num_blocks);
        Ok(encoder)
    }

    pub fn config(&self) -> &EBranchformerConfig {
        &self.config
    }

    pub fn output_size(&self) -> usize {
        self.config.output_size
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Пустой кеш для новой потоковой сессии.
    pub fn new_cache(&self) -> EncoderCache {
        EncoderCache::new(self.layers.len())
    }

    fn log_stats(&self, what: &str, layer: usize, xs: &Tensor) -> Result<()> {
        if asr_core::debug::enabled() {
            let (min, max, rms) = asr_core::debug::stats(xs)?;
            debug!(layer, min, max, rms, "{what}");
        }
        Ok(())
    }

    /// Полный forward.
    ///
    /// * `xs` `[B, T, input_dim]`, `xs_lens` `[B]`
    ///
    /// Возвращает выход `[B, T, D]` и маску валидных кадров `[B, 1, T]`.
    pub fn forward(&self, xs: &Tensor, xs_lens: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let t = xs.dim(1)?;
        let masks = make_non_pad_mask(xs_lens, Some(t))?.unsqueeze(1)?;
        let (mut xs, pos_emb) = self.embed.forward(xs, 0, train)?;
        let chunk_masks = add_optional_chunk_mask(&masks, self.config.static_chunk_size, None)?;

        for (i, layer) in self.layers.iter().enumerate() {
            let out = layer.forward(&xs, Some(&chunk_masks), &pos_emb, LayerCache::default(), train)?;
            xs = out.xs;
            self.log_stats("encoder layer", i, &xs)?;
        }
        let xs = self.after_norm.forward(&xs)?;
        Ok((xs, masks))
    }

    /// Один шаг потокового инференса.
    ///
    /// * `xs` `[1, chunk, input_dim]`
    /// * `required_cache_size` — сколько кадров self-attention кеша оставить
    ///   для следующего чанка: `< 0` — без ограничения, `0` — не хранить.
    ///
    /// Маски не используются: чанк видит весь кеш и себя. Cross-attention
    /// кеш между чанками не переносится (память — ветка 2 текущего чанка).
    pub fn forward_chunk(
        &self,
        xs: &Tensor,
        required_cache_size: i64,
        cache: EncoderCache,
    ) -> Result<(Tensor, EncoderCache)> {
        assert_eq!(
            cache.layers.len(),
            self.layers.len(),
            "encoder cache has {} layers, model has {}",
            cache.layers.len(),
            self.layers.len()
        );
        let EncoderCache { layers: layer_caches, offset } = cache;

        let cache_len = layer_caches
            .first()
            .and_then(|l| l.self_att.as_ref())
            .map(|c| c.seq_len())
            .unwrap_or(0);
        let (mut xs, _) = self.embed.forward(xs, offset, false)?;
        let chunk = xs.dim(1)?;
        let key_len = cache_len + chunk;
        // позиции кеша + текущего чанка
        let pos_emb = self
            .embed
            .position_encoding(offset - cache_len, key_len)?
            .to_dtype(xs.dtype())?;

        let keep = match required_cache_size {
            r if r < 0 => key_len,
            r => key_len.min(r as usize),
        };

        let mut new_layers = Vec::with_capacity(self.layers.len());
        for (i, (layer, layer_cache)) in self.layers.iter().zip(layer_caches).enumerate() {
            let layer_cache = LayerCache {
                cross_att: None,
                ..layer_cache
            };
            let out = layer.forward(&xs, None, &pos_emb, layer_cache, false)?;
            xs = out.xs;
            self.log_stats("encoder chunk layer", i, &xs)?;

            let self_att = match (out.cache.self_att, keep) {
                (_, 0) => None,
                (Some(c), keep) => Some(c.keep_last(keep)?),
                (None, _) => None,
            };
            new_layers.push(LayerCache {
                self_att,
                cross_att: None,
                cnn: out.cache.cnn,
                fusion: out.cache.fusion,
            });
        }

        let xs = self.after_norm.forward(&xs)?;
        Ok((
            xs,
            EncoderCache {
                layers: new_layers,
                offset: offset + chunk,
            },
        ))
    }

    /// Прогнать `[1, T, input_dim]` чанками по `chunk_size` кадров.
    ///
    /// `num_left_chunks = None` — весь левый контекст.
    pub fn forward_chunk_by_chunk(
        &self,
        xs: &Tensor,
        chunk_size: usize,
        num_left_chunks: Option<usize>,
    ) -> Result<Tensor> {
        assert!(chunk_size > 0, "chunk_size must be positive");
        let required_cache_size = match num_left_chunks {
            Some(n) => (chunk_size * n) as i64,
            None => -1,
        };

        let total = xs.dim(1)?;
        let mut cache = self.new_cache();
        let mut outputs = Vec::with_capacity(total.div_ceil(chunk_size));
        let mut start = 0;
        while start < total {
            let len = chunk_size.min(total - start);
            let (ys, next) = self.forward_chunk(&xs.narrow(1, start, len)?, required_cache_size, cache)?;
            outputs.push(ys);
            cache = next;
            start += len;
        }
        debug!(chunks = outputs.len(), frames = total, "потоковый прогон завершён");
        Tensor::cat(&outputs, 1)
    }
}
