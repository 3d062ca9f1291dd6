//! Convolutional Gating MLP (cgMLP) — ветка 2 E-Branchformer.
//!
//! `[B, T, size]` → Linear+GELU → `[B, T, linear_units]` → CSGU →
//! `[B, T, linear_units/2]` → Linear → `[B, T, size]`.

use candle_core::{Result, Tensor, D};
use candle_nn::{Dropout, Init, LayerNorm, Linear, Module, VarBuilder};

use crate::activation::Activation;
use crate::attention::apply_linear;
use crate::config::CgMlpConfig;
use crate::conv::{left_context, ConvPadding, DepthwiseConv1d};

/// Веса ~ N(0, 1e-6), bias = 1.
const UNIT_GATE_INIT: (Init, Init) = (
    Init::Randn {
        mean: 0.0,
        stdev: 1e-6,
    },
    Init::Const(1.0),
);

/// Convolutional Spatial Gating Unit.
///
/// Вход делится пополам по каналам: `x_r` проходит как есть, `x_g` —
/// через LayerNorm, depthwise свёртку по времени, опциональный Linear и
/// функцию гейта. Выход `x_r * gate(x_g)`.
#[derive(Debug, Clone)]
pub struct ConvolutionalSpatialGatingUnit {
    norm: LayerNorm,
    conv: DepthwiseConv1d,
    linear: Option<Linear>,
    act: Activation,
    dropout: Dropout,
}

impl ConvolutionalSpatialGatingUnit {
    /// Вход шириной `cfg.linear_units`; свёртка работает по половине каналов.
    pub fn new(cfg: &CgMlpConfig, vb: VarBuilder) -> Result<Self> {
        let n_channels = cfg.linear_units / 2;
        let init = cfg.unit_gate_init.then_some(UNIT_GATE_INIT);
        let norm = candle_nn::layer_norm(n_channels, 1e-5, vb.pp("norm"))?;
        let conv = DepthwiseConv1d::with_init(n_channels, cfg.kernel_size, cfg.causal, init, vb.pp("conv"))?;
        let linear = match (cfg.use_linear_after_conv, init) {
            (false, _) => None,
            (true, None) => Some(candle_nn::linear(n_channels, n_channels, vb.pp("linear"))?),
            (true, Some((weight_init, bias_init))) => {
                let vb = vb.pp("linear");
                let weight = vb.get_with_hints((n_channels, n_channels), "weight", weight_init)?;
                let bias = vb.get_with_hints(n_channels, "bias", bias_init)?;
                Some(Linear::new(weight, Some(bias)))
            }
        };
        Ok(Self {
            norm,
            conv,
            linear,
            act: cfg.gate_activation,
            dropout: Dropout::new(cfg.dropout_rate),
        })
    }

    /// `x` `[B, T, C]`, `cache` `[B, C/2, kernel-1]`.
    ///
    /// Возвращает `[B, T, C/2]` и новый кеш (только в causal режиме).
    /// Кеш берётся из `x_g` до нормализации.
    pub fn forward(&self, x: &Tensor, cache: Option<&Tensor>, train: bool) -> Result<(Tensor, Option<Tensor>)> {
        let half = x.dim(D::Minus1)? / 2;
        let x_r = x.narrow(D::Minus1, 0, half)?;
        // [B, T, C/2] → [B, C/2, T]
        let x_g = x.narrow(D::Minus1, half, half)?.transpose(1, 2)?;

        let (x_g, new_cache) = match self.conv.padding() {
            ConvPadding::Causal { lorder } if lorder > 0 => {
                let (padded, new_cache) = left_context(&x_g, lorder, cache)?;
                (padded, Some(new_cache))
            }
            _ => (x_g, None),
        };

        let x_g = self.norm.forward(&x_g.transpose(1, 2)?.contiguous()?)?;
        let x_g = self
            .conv
            .forward_padded(&x_g.transpose(1, 2)?.contiguous()?)?
            .transpose(1, 2)?;
        let x_g = match &self.linear {
            Some(linear) => apply_linear(linear, &x_g)?,
            None => x_g,
        };
        let x_g = self.act.apply(&x_g)?;

        let out = (x_r * x_g)?;
        Ok((self.dropout.forward(&out, train)?, new_cache))
    }
}

/// Convolutional Gating MLP.
#[derive(Debug, Clone)]
pub struct ConvolutionalGatingMLP {
    channel_proj1: Linear,
    csgu: ConvolutionalSpatialGatingUnit,
    channel_proj2: Linear,
}

impl ConvolutionalGatingMLP {
    pub fn new(cfg: &CgMlpConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let channel_proj1 = candle_nn::linear(cfg.size, cfg.linear_units, vb.pp("channel_proj1.0"))?;
        let csgu = ConvolutionalSpatialGatingUnit::new(cfg, vb.pp("csgu"))?;
        let channel_proj2 = candle_nn::linear(cfg.linear_units / 2, cfg.size, vb.pp("channel_proj2"))?;
        Ok(Self {
            channel_proj1,
            csgu,
            channel_proj2,
        })
    }

    /// `[B, T, size]` → `[B, T, size]` и новый кеш свёртки.
    pub fn forward(&self, x: &Tensor, cache: Option<&Tensor>, train: bool) -> Result<(Tensor, Option<Tensor>)> {
        let xs = apply_linear(&self.channel_proj1, x)?.gelu_erf()?;
        let (xs, new_cache) = self.csgu.forward(&xs, cache, train)?;
        let xs = apply_linear(&self.channel_proj2, &xs)?;
        Ok((xs, new_cache))
    }
}
