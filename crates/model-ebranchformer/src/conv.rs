//! Depthwise 1-D свёртка с кешем левого контекста в causal режиме.

use candle_core::{Result, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, Init, Module, VarBuilder};

/// Как depthwise свёртка дополняется по времени.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvPadding {
    /// Без встроенного padding: `lorder = kernel_size - 1` кадров левого
    /// контекста берутся из кеша или нулей.
    Causal { lorder: usize },
    /// `(kernel_size - 1) / 2` нулей с каждой стороны, без кеша.
    Symmetric { padding: usize },
}

impl ConvPadding {
    pub fn new(kernel_size: usize, causal: bool) -> Self {
        if causal {
            Self::Causal {
                lorder: kernel_size - 1,
            }
        } else {
            assert!(
                (kernel_size - 1) % 2 == 0,
                "symmetric convolution needs an odd kernel, got {kernel_size}"
            );
            Self::Symmetric {
                padding: (kernel_size - 1) / 2,
            }
        }
    }

    pub fn lorder(&self) -> usize {
        match self {
            Self::Causal { lorder } => *lorder,
            Self::Symmetric { .. } => 0,
        }
    }

    fn builtin_padding(&self) -> usize {
        match self {
            Self::Causal { .. } => 0,
            Self::Symmetric { padding } => *padding,
        }
    }
}

/// Дописать слева `lorder` кадров контекста к `xs` `[batch, channels, time]`.
///
/// Без кеша контекст нулевой (начало потока). Возвращает дополненный вход
/// и новый кеш: последние `lorder` кадров дополненного входа.
pub fn left_context(xs: &Tensor, lorder: usize, cache: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
    assert_eq!(
        xs.rank(),
        3,
        "left_context expects [batch, channels, time], got {:?}",
        xs.dims()
    );
    let padded = match cache {
        None => xs.pad_with_zeros(2, lorder, 0)?,
        Some(cache) => {
            assert_eq!(cache.rank(), 3, "conv cache must be rank 3, got {:?}", cache.dims());
            assert_eq!(cache.dim(0)?, xs.dim(0)?, "conv cache batch mismatch");
            assert_eq!(cache.dim(1)?, xs.dim(1)?, "conv cache channel mismatch");
            Tensor::cat(&[cache, xs], 2)?
        }
    };
    let t = padded.dim(2)?;
    assert!(t > lorder, "padded length {t} must exceed lorder {lorder}");
    let new_cache = padded.narrow(2, t - lorder, lorder)?.contiguous()?;
    Ok((padded, new_cache))
}

/// Групповая (channels == groups) Conv1d с bias.
#[derive(Debug, Clone)]
pub struct DepthwiseConv1d {
    conv: Conv1d,
    padding: ConvPadding,
}

impl DepthwiseConv1d {
    pub fn new(channels: usize, kernel_size: usize, causal: bool, vb: VarBuilder) -> Result<Self> {
        Self::with_init(channels, kernel_size, causal, None, vb)
    }

    /// То же, но новые `weight` и `bias` создаются с заданными `(Init, Init)`.
    pub fn with_init(
        channels: usize,
        kernel_size: usize,
        causal: bool,
        init: Option<(Init, Init)>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let padding = ConvPadding::new(kernel_size, causal);
        let cfg = Conv1dConfig {
            padding: padding.builtin_padding(),
            groups: channels,
            ..Default::default()
        };
        let conv = match init {
            None => candle_nn::conv1d(channels, channels, kernel_size, cfg, vb)?,
            Some((weight_init, bias_init)) => {
                let weight = vb.get_with_hints((channels, 1, kernel_size), "weight", weight_init)?;
                let bias = vb.get_with_hints(channels, "bias", bias_init)?;
                Conv1d::new(weight, Some(bias), cfg)
            }
        };
        Ok(Self { conv, padding })
    }

    pub fn padding(&self) -> ConvPadding {
        self.padding
    }

    /// Свёртка входа, который уже содержит левый контекст.
    pub fn forward_padded(&self, xs: &Tensor) -> Result<Tensor> {
        self.conv.forward(xs)
    }

    /// `[batch, channels, time] -> [batch, channels, time]` с кешем.
    ///
    /// В симметричном режиме `cache` игнорируется, возвращается `None`.
    pub fn forward(&self, xs: &Tensor, cache: Option<&Tensor>) -> Result<(Tensor, Option<Tensor>)> {
        match self.padding {
            ConvPadding::Causal { lorder } if lorder > 0 => {
                let (padded, new_cache) = left_context(xs, lorder, cache)?;
                Ok((self.conv.forward(&padded)?, Some(new_cache)))
            }
            _ => Ok((self.conv.forward(xs)?, None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_left_context_zero_pads_at_stream_start() {
        let dev = Device::Cpu;
        let xs = Tensor::ones((2, 3, 4), DType::F32, &dev).unwrap();
        let (padded, cache) = left_context(&xs, 2, None).unwrap();
        assert_eq!(padded.dims(), &[2, 3, 6]);
        assert_eq!(cache.dims(), &[2, 3, 2]);
        let first: Vec<f32> = padded.narrow(2, 0, 2).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(first.iter().all(|&v| v == 0.0));
    }

    #[test]
    #[should_panic(expected = "expects [batch, channels, time]")]
    fn test_left_context_rejects_rank_two() {
        let xs = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let _ = left_context(&xs, 2, None);
    }

    #[test]
    fn test_causal_chunks_match_full_sequence() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let conv = DepthwiseConv1d::new(6, 3, true, vb).unwrap();

        let xs = Tensor::randn(0f32, 1f32, (1, 6, 9), &dev).unwrap();
        let (full, _) = conv.forward(&xs, None).unwrap();
        assert_eq!(full.dims(), &[1, 6, 9]);

        let (a, cache) = conv.forward(&xs.narrow(2, 0, 5).unwrap(), None).unwrap();
        let (b, cache) = conv.forward(&xs.narrow(2, 5, 4).unwrap(), cache.as_ref()).unwrap();
        assert_eq!(cache.unwrap().dims(), &[1, 6, 2]);

        let streamed = Tensor::cat(&[&a, &b], 2).unwrap();
        assert!(max_abs_diff(&full, &streamed) < 1e-5);
    }

    #[test]
    fn test_symmetric_keeps_length_without_cache() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let conv = DepthwiseConv1d::new(4, 5, false, vb).unwrap();
        let xs = Tensor::randn(0f32, 1f32, (2, 4, 7), &dev).unwrap();
        let (ys, cache) = conv.forward(&xs, None).unwrap();
        assert_eq!(ys.dims(), &[2, 4, 7]);
        assert!(cache.is_none());
    }
}
