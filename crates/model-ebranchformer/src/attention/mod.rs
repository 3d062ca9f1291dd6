//! Семейство multi-head attention.
//!
//! [`AttentionCore`] содержит проекции, скоринг, маскирование и протокол
//! инкрементального key/value кеша. Три публичных варианта строятся на нём:
//!
//! - [`MultiHeadedAttention`] — обычная self/source attention, кеш `(key, value)`;
//! - [`RelPositionMultiHeadedAttention`] — относительные позиции Transformer-XL,
//!   упакованный кеш `key ‖ value`;
//! - [`MultiHeadedCrossAttention`] — предвычисленная память с расширением по beam.
//!
//! Число голов запросов и key/value может различаться (MHA / MQA / GQA);
//! размерность головы `d_k` общая.

mod cross;
mod rel_position;

pub use cross::MultiHeadedCrossAttention;
pub use rel_position::{rel_shift, RelPositionMultiHeadedAttention};

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Dropout, Linear, Module, VarBuilder};

use crate::cache::KvCache;
use crate::config::AttentionConfig;

/// Linear по последней оси тензора любого ранга >= 2.
pub(crate) fn apply_linear(linear: &Linear, x: &Tensor) -> Result<Tensor> {
    let dims = x.dims();
    let last = dims[dims.len() - 1];
    let y = linear.forward(&x.contiguous()?.reshape(((), last))?)?;
    let mut out_shape = dims[..dims.len() - 1].to_vec();
    out_shape.push(y.dim(1)?);
    y.reshape(out_shape)
}

/// Linear; при `bound` новые веса инициализируются равномерно в `±bound`.
pub(crate) fn linear_init(
    in_dim: usize,
    out_dim: usize,
    bias: bool,
    bound: Option<f64>,
    vb: VarBuilder,
) -> Result<Linear> {
    match bound {
        None => candle_nn::linear_b(in_dim, out_dim, bias, vb),
        Some(bound) => {
            let init = candle_nn::Init::Uniform {
                lo: -bound,
                up: bound,
            };
            let weight = vb.get_with_hints((out_dim, in_dim), "weight", init)?;
            let bias = if bias {
                Some(vb.get_with_hints(out_dim, "bias", init)?)
            } else {
                None
            };
            Ok(Linear::new(weight, bias))
        }
    }
}

/// Блочное расширение голов key/value `[.., h_kv, t, d] -> [.., h_kv * n_rep, t, d]`.
///
/// Голова `i` выхода — копия kv-головы `i / n_rep`: каждые `n_rep` подряд
/// идущих голов запросов делят одну kv-голову.
pub fn expand_kv_heads(x: &Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x.clone());
    }
    let dims = x.dims();
    let head_axis = dims.len() - 3;

    let mut expanded = dims[..=head_axis].to_vec();
    expanded.push(n_rep);
    expanded.extend_from_slice(&dims[head_axis + 1..]);

    let mut merged = dims[..head_axis].to_vec();
    merged.push(dims[head_axis] * n_rep);
    merged.extend_from_slice(&dims[head_axis + 1..]);

    x.unsqueeze(head_axis + 1)?
        .broadcast_as(expanded)?
        .contiguous()?
        .reshape(merged)
}

/// Общие проекции, скоринг и работа с кешем.
#[derive(Debug, Clone)]
pub struct AttentionCore {
    linear_q: Linear,
    linear_k: Linear,
    linear_v: Linear,
    linear_out: Linear,
    dropout: Dropout,
    n_head: usize,
    n_kv_head: usize,
    d_k: usize,
}

impl AttentionCore {
    /// Конфигурация проверяется до загрузки весов.
    pub fn new(cfg: &AttentionConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let bound = cfg
            .init_weights
            .then(|| ((cfg.n_head * cfg.d_k()) as f64).powf(-0.5));

        let linear_q = linear_init(cfg.n_feat, cfg.inner_dim(), cfg.query_bias, bound, vb.pp("linear_q"))?;
        let linear_k = linear_init(cfg.n_feat, cfg.inner_kv_dim(), cfg.key_bias, bound, vb.pp("linear_k"))?;
        let linear_v = linear_init(cfg.n_feat, cfg.inner_kv_dim(), cfg.value_bias, bound, vb.pp("linear_v"))?;
        // bias выходной проекции следует за query_bias
        let linear_out = linear_init(cfg.inner_dim(), cfg.n_feat, cfg.query_bias, bound, vb.pp("linear_out"))?;

        Ok(Self {
            linear_q,
            linear_k,
            linear_v,
            linear_out,
            dropout: Dropout::new(cfg.dropout_rate),
            n_head: cfg.n_head,
            n_kv_head: cfg.n_kv_head(),
            d_k: cfg.d_k(),
        })
    }

    pub fn n_head(&self) -> usize {
        self.n_head
    }

    pub fn n_kv_head(&self) -> usize {
        self.n_kv_head
    }

    pub fn d_k(&self) -> usize {
        self.d_k
    }

    fn split_heads(x: &Tensor, heads: usize, d_k: usize) -> Result<Tensor> {
        let dims = x.dims();
        let mut shape = dims[..dims.len() - 1].to_vec();
        shape.push(heads);
        shape.push(d_k);
        let x = x.reshape(shape)?;
        let rank = x.rank();
        // (batch, ..., head, time, d_k)
        x.transpose(rank - 3, rank - 2)
    }

    /// `(batch, ..., time1, size) -> (batch, ..., n_head, time1, d_k)`.
    pub fn forward_query(&self, query: &Tensor) -> Result<Tensor> {
        let q = apply_linear(&self.linear_q, query)?;
        Self::split_heads(&q, self.n_head, self.d_k)
    }

    /// `(batch, ..., time2, size) -> (batch, ..., n_kv_head, time2, d_k)`.
    pub fn forward_key(&self, key: &Tensor) -> Result<Tensor> {
        let k = apply_linear(&self.linear_k, key)?;
        Self::split_heads(&k, self.n_kv_head, self.d_k)
    }

    pub fn forward_value(&self, value: &Tensor) -> Result<Tensor> {
        let v = apply_linear(&self.linear_v, value)?;
        Self::split_heads(&v, self.n_kv_head, self.d_k)
    }

    pub fn forward_qkv(&self, query: &Tensor, key: &Tensor, value: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        Ok((
            self.forward_query(query)?,
            self.forward_key(key)?,
            self.forward_value(value)?,
        ))
    }

    /// Объединить новые key/value с входным кешем.
    ///
    /// При обучении кеш не используется и возвращается как есть. При
    /// инференсе key/value дописываются по времени и становятся новым кешем;
    /// ограничивать его длину должен вызывающий код.
    pub fn update_kv_and_cache(
        &self,
        k: Tensor,
        v: Tensor,
        cache: Option<&KvCache>,
        train: bool,
    ) -> Result<(Tensor, Tensor, Option<KvCache>)> {
        if train {
            return Ok((k, v, cache.cloned()));
        }
        let time_axis = k.rank() - 2;
        let (k, v) = match cache {
            Some(cache) => {
                cache.assert_consistent();
                (
                    Tensor::cat(&[&cache.key, &k], time_axis)?,
                    Tensor::cat(&[&cache.value, &v], time_axis)?,
                )
            }
            None => (k, v),
        };
        let new_cache = KvCache::new(k.clone(), v.clone());
        Ok((k, v, Some(new_cache)))
    }

    /// Размножить kv-головы до `n_head` (для обычной MHA ничего не делает).
    pub fn expand_kv(&self, x: &Tensor) -> Result<Tensor> {
        expand_kv_heads(x, self.n_head / self.n_kv_head)
    }

    /// `Q·Kᵀ / sqrt(d_k)` с broadcast по ведущим осям.
    pub fn scores(&self, q: &Tensor, k: &Tensor) -> Result<Tensor> {
        let kt = k.transpose(D::Minus2, D::Minus1)?.contiguous()?;
        let scores = q.contiguous()?.broadcast_matmul(&kt)?;
        scores / (self.d_k as f64).sqrt()
    }

    /// Softmax по последней оси с опциональной маской.
    ///
    /// `mask` — `u8`, 1 у допустимых позиций, форма `(batch, 1, time2)` или
    /// `(batch, time1, time2)`; `None` отключает маскирование. Маска обрезается
    /// до ширины скоров, замаскированные скоры заменяются на `-inf`, а веса
    /// после softmax обнуляются точно (полностью замаскированная строка
    /// даёт нули, а не NaN).
    pub fn attention_weights(scores: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let dtype = scores.dtype();
        let scores = scores.to_dtype(DType::F32)?;
        let mask = match mask {
            Some(m) if m.dim(D::Minus1)? > 0 => m,
            _ => {
                let attn = candle_nn::ops::softmax_last_dim(&scores.contiguous()?)?;
                return attn.to_dtype(dtype);
            }
        };

        let width = scores.dim(D::Minus1)?;
        let mask = mask.unsqueeze(mask.rank() - 2)?;
        let mask_width = mask.dim(D::Minus1)?;
        let mask = mask
            .narrow(D::Minus1, 0, width.min(mask_width))?
            .broadcast_as(scores.dims())?
            .contiguous()?;

        let neg_inf = Tensor::full(f32::NEG_INFINITY, scores.dims(), scores.device())?;
        let scores = mask.where_cond(&scores, &neg_inf)?;
        let attn = candle_nn::ops::softmax_last_dim(&scores)?;
        let attn = mask.where_cond(&attn, &attn.zeros_like()?)?;
        attn.to_dtype(dtype)
    }

    /// Взвешенная сумма `value` и выходная проекция.
    ///
    /// `value`: `(batch, n_head, time2, d_k)`, `scores`:
    /// `(batch, n_head, time1, time2)`. Возвращает `(batch, time1, n_feat)`.
    pub fn forward_attention(
        &self,
        value: &Tensor,
        scores: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let attn = Self::attention_weights(scores, mask)?;
        let p_attn = self.dropout.forward(&attn, train)?;
        let x = p_attn.broadcast_matmul(&value.contiguous()?)?;

        let rank = x.rank();
        let x = x.transpose(rank - 3, rank - 2)?.contiguous()?;
        let dims = x.dims();
        let mut shape = dims[..rank - 2].to_vec();
        shape.push(self.n_head * self.d_k);
        let x = x.reshape(shape)?;
        apply_linear(&self.linear_out, &x)
    }
}

/// Стандартная scaled dot-product multi-head attention.
#[derive(Debug, Clone)]
pub struct MultiHeadedAttention {
    core: AttentionCore,
}

impl MultiHeadedAttention {
    pub fn new(cfg: &AttentionConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            core: AttentionCore::new(cfg, vb)?,
        })
    }

    pub fn core(&self) -> &AttentionCore {
        &self.core
    }

    /// Возвращает выход `(batch, time1, n_feat)` и обновлённый кеш.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        cache: Option<&KvCache>,
        train: bool,
    ) -> Result<(Tensor, Option<KvCache>)> {
        let (q, k, v) = self.core.forward_qkv(query, key, value)?;
        let (k, v, new_cache) = self.core.update_kv_and_cache(k, v, cache, train)?;
        let k = self.core.expand_kv(&k)?;
        let v = self.core.expand_kv(&v)?;

        let scores = self.core.scores(&q, &k)?;
        let out = self.core.forward_attention(&v, &scores, mask, train)?;
        Ok((out, new_cache))
    }
}
