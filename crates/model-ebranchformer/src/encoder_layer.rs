//! E-Branchformer encoder layer.
//!
//! ```text
//! x ─► [macaron FF ×0.5] ─┬─► LN ─► self-attention ─► x1 ─┐
//!                         └─► LN ─► cgMLP ──────────► x2 ─┤
//!   concat(x1, x2) ─► depthwise fusion conv ─► merge_proj ─► + residual
//!   ─► [FF ×0.5|×1] ─► + cross-attention(q=x1, k=v=x2) ─► LN
//! ```

use candle_core::{Result, Tensor, D};
use candle_nn::{Dropout, LayerNorm, Linear, Module, ModuleT, VarBuilder};

use crate::attention::{apply_linear, MultiHeadedAttention, MultiHeadedCrossAttention, RelPositionMultiHeadedAttention};
use crate::cache::{LayerCache, SelfAttentionCache};
use crate::cgmlp::ConvolutionalGatingMLP;
use crate::config::{AttentionConfig, EBranchformerConfig, EncoderLayerConfig, SelfAttentionType};
use crate::conv::DepthwiseConv1d;
use crate::feed_forward::PositionwiseFeedForward;

/// Feed-forward модуль слоя (любой `ModuleT`: `[B, T, D] → [B, T, D]`).
pub type FeedForward = Box<dyn ModuleT + Send + Sync>;

/// Self-attention ветки 1. Формат кеша зависит от варианта.
#[derive(Debug, Clone)]
pub enum SelfAttention {
    Plain(MultiHeadedAttention),
    RelPosition(RelPositionMultiHeadedAttention),
}

impl SelfAttention {
    pub fn new(kind: SelfAttentionType, cfg: &AttentionConfig, vb: VarBuilder) -> Result<Self> {
        Ok(match kind {
            SelfAttentionType::Selfattn => Self::Plain(MultiHeadedAttention::new(cfg, vb)?),
            SelfAttentionType::RelSelfattn => Self::RelPosition(RelPositionMultiHeadedAttention::new(cfg, vb)?),
        })
    }

    /// `query = key = value = x`; `pos_emb` используется только relative-вариантом.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        pos_emb: &Tensor,
        cache: Option<&SelfAttentionCache>,
        train: bool,
    ) -> Result<(Tensor, Option<SelfAttentionCache>)> {
        match self {
            Self::Plain(attn) => {
                let cache = cache.map(|c| match c {
                    SelfAttentionCache::Split(kv) => kv,
                    SelfAttentionCache::Packed(_) => panic!("plain attention expects a split (key, value) cache"),
                });
                let (out, cache) = attn.forward(x, x, x, mask, cache, train)?;
                Ok((out, cache.map(SelfAttentionCache::Split)))
            }
            Self::RelPosition(attn) => {
                let cache = cache.map(|c| match c {
                    SelfAttentionCache::Packed(packed) => packed,
                    SelfAttentionCache::Split(_) => panic!("relative-position attention expects a packed cache"),
                });
                let (out, cache) = attn.forward(x, x, x, mask, pos_emb, cache, train)?;
                Ok((out, cache.map(SelfAttentionCache::Packed)))
            }
        }
    }
}

/// Результат одного forward слоя.
#[derive(Debug, Clone)]
pub struct EncoderLayerOutput {
    pub xs: Tensor,
    /// Маска, переданная на вход (без изменений).
    pub mask: Option<Tensor>,
    pub cache: LayerCache,
}

/// E-Branchformer слой.
pub struct EBranchformerEncoderLayer {
    size: usize,
    attn: SelfAttention,
    cgmlp: ConvolutionalGatingMLP,
    feed_forward: Option<(LayerNorm, FeedForward)>,
    feed_forward_macaron: Option<(LayerNorm, FeedForward)>,
    src_attn: MultiHeadedCrossAttention,
    norm_mha: LayerNorm,
    norm_mlp: LayerNorm,
    norm_final: LayerNorm,
    dropout: Dropout,
    depthwise_conv_fusion: DepthwiseConv1d,
    merge_proj: Linear,
    ff_scale: f64,
    stochastic_depth_rate: f64,
}

impl std::fmt::Debug for EBranchformerEncoderLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EBranchformerEncoderLayer")
            .field("size", &self.size)
            .field("macaron", &self.feed_forward_macaron.is_some())
            .field("feed_forward", &self.feed_forward.is_some())
            .field("ff_scale", &self.ff_scale)
            .field("stochastic_depth_rate", &self.stochastic_depth_rate)
            .finish_non_exhaustive()
    }
}

impl EBranchformerEncoderLayer {
    /// Собрать слой из готовых модулей.
    ///
    /// `vb` — префикс слоя: из него грузятся нормализации, fusion-свёртка
    /// и `merge_proj`.
    pub fn new(
        cfg: &EncoderLayerConfig,
        attn: SelfAttention,
        cgmlp: ConvolutionalGatingMLP,
        feed_forward: Option<FeedForward>,
        feed_forward_macaron: Option<FeedForward>,
        src_attn: MultiHeadedCrossAttention,
        vb: VarBuilder,
    ) -> Result<Self> {
        cfg.validate()?;
        let size = cfg.size;

        let feed_forward = match feed_forward {
            Some(ff) => Some((candle_nn::layer_norm(size, 1e-5, vb.pp("norm_ff"))?, ff)),
            None => None,
        };
        let feed_forward_macaron = match feed_forward_macaron {
            Some(ff) => Some((candle_nn::layer_norm(size, 1e-5, vb.pp("norm_ff_macaron"))?, ff)),
            None => None,
        };
        let ff_scale = if feed_forward_macaron.is_some() { 0.5 } else { 1.0 };

        Ok(Self {
            size,
            attn,
            cgmlp,
            feed_forward,
            feed_forward_macaron,
            src_attn,
            norm_mha: candle_nn::layer_norm(size, 1e-5, vb.pp("norm_mha"))?,
            norm_mlp: candle_nn::layer_norm(size, 1e-5, vb.pp("norm_mlp"))?,
            norm_final: candle_nn::layer_norm(size, 1e-5, vb.pp("norm_final"))?,
            dropout: Dropout::new(cfg.dropout_rate),
            depthwise_conv_fusion: DepthwiseConv1d::new(
                2 * size,
                cfg.merge_conv_kernel,
                cfg.causal,
                vb.pp("depthwise_conv_fusion"),
            )?,
            merge_proj: candle_nn::linear(2 * size, size, vb.pp("merge_proj"))?,
            ff_scale,
            stochastic_depth_rate: cfg.stochastic_depth_rate,
        })
    }

    /// Слой `layer` энкодера целиком из конфигурации.
    pub fn from_config(cfg: &EBranchformerConfig, layer: usize, vb: VarBuilder) -> Result<Self> {
        let att_cfg = cfg.attention_config();
        let attn = SelfAttention::new(cfg.selfattention_layer_type, &att_cfg, vb.pp("attn"))?;
        let cgmlp = ConvolutionalGatingMLP::new(&cfg.cgmlp_config(), vb.pp("cgmlp"))?;
        let src_attn = MultiHeadedCrossAttention::new(&att_cfg, vb.pp("src_attn"))?;

        let make_ff = |name: &str| -> Result<FeedForward> {
            let ff = PositionwiseFeedForward::new(
                cfg.output_size,
                cfg.linear_units,
                cfg.dropout_rate,
                cfg.ffn_activation,
                vb.pp(name),
            )?;
            Ok(Box::new(ff))
        };
        let feed_forward = if cfg.use_ffn { Some(make_ff("feed_forward")?) } else { None };
        let feed_forward_macaron = if cfg.use_ffn && cfg.macaron_ffn {
            Some(make_ff("feed_forward_macaron")?)
        } else {
            None
        };

        Self::new(
            &cfg.layer_config(layer),
            attn,
            cgmlp,
            feed_forward,
            feed_forward_macaron,
            src_attn,
            vb,
        )
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Коэффициент residual-ветвей: `1 / (1 - p)` при обучении, ровно 1.0 при инференсе.
    pub fn stochastic_depth_coeff(&self, train: bool) -> f64 {
        if train {
            1.0 / (1.0 - self.stochastic_depth_rate)
        } else {
            1.0
        }
    }

    fn feed_forward_step(
        &self,
        x: &Tensor,
        (norm, ff): &(LayerNorm, FeedForward),
        coeff: f64,
        train: bool,
    ) -> Result<Tensor> {
        let y = ff.forward_t(&norm.forward(x)?, train)?;
        let y = self.dropout.forward(&y, train)?;
        x + (y * (coeff * self.ff_scale))?
    }

    /// Слияние веток: `concat(x1, x2)` + depthwise свёртка → `merge_proj`.
    ///
    /// В causal режиме свёртка несёт свой кеш левого контекста.
    fn merge_branches(&self, x1: &Tensor, x2: &Tensor, cache: Option<&Tensor>) -> Result<(Tensor, Option<Tensor>)> {
        let x_concat = Tensor::cat(&[x1, x2], D::Minus1)?;
        let (x_tmp, cache) = self
            .depthwise_conv_fusion
            .forward(&x_concat.transpose(1, 2)?.contiguous()?, cache)?;
        let x_tmp = x_tmp.transpose(1, 2)?;
        let merged = apply_linear(&self.merge_proj, &(&x_concat + &x_tmp)?)?;
        Ok((merged, cache))
    }

    /// Forward.
    ///
    /// * `x` `[B, T, size]`
    /// * `mask` `[B, T, T]` или `[B, 1, T]`, `None` — без маски
    /// * `pos_emb` `[1, T_pos, size]`
    /// * `cache` — кеши слоя; `LayerCache::default()` — начало потока
    pub fn forward(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        pos_emb: &Tensor,
        cache: LayerCache,
        train: bool,
    ) -> Result<EncoderLayerOutput> {
        let coeff = self.stochastic_depth_coeff(train);

        let mut x = x.clone();
        if let Some(macaron) = &self.feed_forward_macaron {
            x = self.feed_forward_step(&x, macaron, coeff, train)?;
        }

        // Ветка 1: self-attention
        let x1 = self.norm_mha.forward(&x)?;
        let (x_att, self_att) = self.attn.forward(&x1, mask, pos_emb, cache.self_att.as_ref(), train)?;
        let x1 = self.dropout.forward(&x_att, train)?;

        // Ветка 2: cgMLP
        let x2 = self.norm_mlp.forward(&x)?;
        let (x2, cnn) = self.cgmlp.forward(&x2, cache.cnn.as_ref(), train)?;
        let x2 = self.dropout.forward(&x2, train)?;

        let (merged, fusion) = self.merge_branches(&x1, &x2, cache.fusion.as_ref())?;
        x = (&x + (self.dropout.forward(&merged, train)? * coeff)?)?;

        if let Some(ff) = &self.feed_forward {
            x = self.feed_forward_step(&x, ff, coeff, train)?;
        }

        // Cross-attention: query — ветка 1, key/value — ветка 2
        let residual = x;
        let (x_cross, cross_att) = self
            .src_attn
            .forward(&x1, &x2, &x2, mask, cache.cross_att.as_ref(), train)?;
        let x = (residual + self.dropout.forward(&x_cross, train)?)?;
        let xs = self.norm_final.forward(&x)?;

        Ok(EncoderLayerOutput {
            xs,
            mask: mask.cloned(),
            cache: LayerCache {
                self_att,
                cross_att,
                cnn,
                fusion,
            },
        })
    }
}
