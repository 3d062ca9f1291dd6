//! Relative-position multi-head attention (Transformer-XL, pos_bias_u/v).
//!
//! score = ((q + u) @ Kᵀ + shift((q + v) @ Pᵀ)) / sqrt(d_k)
//!
//! Кеш хранится упакованным: key ‖ value по последней оси
//! ([`PackedKvCache`]), в отличие от `(key, value)` пары базового модуля.

use candle_core::{Result, Tensor};
use candle_nn::{Linear, VarBuilder};

use super::{apply_linear, linear_init, AttentionCore};
use crate::cache::PackedKvCache;
use crate::config::AttentionConfig;

/// Относительный сдвиг `[B, H, T1, T2] -> [B, H, T1, T2]`.
///
/// 1. Pad слева нулевым столбцом: `[B, H, T1, T2+1]`
/// 2. Reshape: `[B, H, T2+1, T1]`
/// 3. Drop первой строки и reshape обратно в `[B, H, T1, T2]`
///
/// При `zero_triu` элементы выше диагонали `T2 - T1` обнуляются.
pub fn rel_shift(x: &Tensor, zero_triu: bool) -> Result<Tensor> {
    let (b, h, t1, t2) = x.dims4()?;

    let pad = Tensor::zeros((b, h, t1, 1), x.dtype(), x.device())?;
    let padded = Tensor::cat(&[&pad, x], 3)?;
    let padded = padded.contiguous()?.reshape((b, h, t2 + 1, t1))?;
    let shifted = padded
        .narrow(2, 1, t2)?
        .contiguous()?
        .reshape((b, h, t1, t2))?;

    if !zero_triu {
        return Ok(shifted);
    }
    let diagonal = t2 as isize - t1 as isize;
    let tril: Vec<f32> = (0..t1)
        .flat_map(|i| (0..t2).map(move |j| if (j as isize) <= i as isize + diagonal { 1.0 } else { 0.0 }))
        .collect();
    let tril = Tensor::from_vec(tril, (1, 1, t1, t2), x.device())?.to_dtype(x.dtype())?;
    shifted.broadcast_mul(&tril)
}

/// Обучаемое масштабирование входа: `x * ada_scale + ada_bias`.
#[derive(Debug, Clone)]
struct AdaptiveScale {
    scale: Tensor,
    bias: Tensor,
}

impl AdaptiveScale {
    fn load(n_feat: usize, vb: VarBuilder) -> Result<Self> {
        let scale = vb.get_with_hints((1, 1, n_feat), "ada_scale", candle_nn::Init::Const(1.0))?;
        let bias = vb.get_with_hints((1, 1, n_feat), "ada_bias", candle_nn::Init::Const(0.0))?;
        Ok(Self { scale, bias })
    }

    fn apply(&self, x: &Tensor) -> Result<Tensor> {
        x.broadcast_mul(&self.scale)?.broadcast_add(&self.bias)
    }
}

/// Multi-head attention с относительным позиционным кодированием.
#[derive(Debug, Clone)]
pub struct RelPositionMultiHeadedAttention {
    core: AttentionCore,
    linear_pos: Linear,
    pos_bias_u: Tensor,
    pos_bias_v: Tensor,
    adaptive: Option<AdaptiveScale>,
    do_rel_shift: bool,
}

impl RelPositionMultiHeadedAttention {
    pub fn new(cfg: &AttentionConfig, vb: VarBuilder) -> Result<Self> {
        let core = AttentionCore::new(cfg, vb.clone())?;
        let (h, dk) = (cfg.n_head, cfg.d_k());

        let bound = cfg.init_weights.then(|| ((h * dk) as f64).powf(-0.5));
        let linear_pos = linear_init(cfg.n_feat, cfg.inner_dim(), false, bound, vb.pp("linear_pos"))?;

        // xavier uniform для [H, dk]
        let xavier = (6.0 / (h + dk) as f64).sqrt();
        let init = candle_nn::Init::Uniform {
            lo: -xavier,
            up: xavier,
        };
        let pos_bias_u = vb.get_with_hints((h, dk), "pos_bias_u", init)?;
        let pos_bias_v = vb.get_with_hints((h, dk), "pos_bias_v", init)?;

        let adaptive = if cfg.adaptive_scale {
            Some(AdaptiveScale::load(cfg.n_feat, vb.clone())?)
        } else {
            None
        };

        Ok(Self {
            core,
            linear_pos,
            pos_bias_u,
            pos_bias_v,
            adaptive,
            do_rel_shift: cfg.do_rel_shift,
        })
    }

    pub fn core(&self) -> &AttentionCore {
        &self.core
    }

    /// Forward.
    ///
    /// * `query` `[B, T1, D]`, `key`/`value` `[B, T2, D]`
    /// * `pos_emb` `[1 | B, T_pos, D]`
    /// * `cache` `[B, H_kv, T_cache, 2*dk]`
    ///
    /// Возвращает выход `[B, T1, D]` и новый упакованный кеш. В режиме
    /// обучения кеш не используется и возвращается как есть.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        pos_emb: &Tensor,
        cache: Option<&PackedKvCache>,
        train: bool,
    ) -> Result<(Tensor, Option<PackedKvCache>)> {
        let (q, k, v) = match &self.adaptive {
            Some(ada) => self
                .core
                .forward_qkv(&ada.apply(query)?, &ada.apply(key)?, &ada.apply(value)?)?,
            None => self.core.forward_qkv(query, key, value)?,
        };

        let (k, v, new_cache) = if train {
            (k, v, cache.cloned())
        } else {
            let (k, v) = match cache {
                Some(cache) => {
                    let (key_cache, value_cache) = cache.split()?;
                    assert_eq!(
                        key_cache.dims()[..2],
                        k.dims()[..2],
                        "packed kv cache: batch/heads {:?} не совпадают с key {:?}",
                        key_cache.dims(),
                        k.dims()
                    );
                    (
                        Tensor::cat(&[&key_cache, &k], 2)?,
                        Tensor::cat(&[&value_cache, &v], 2)?,
                    )
                }
                None => (k, v),
            };
            let packed = PackedKvCache::pack(&k, &v)?;
            (k, v, Some(packed))
        };

        let k = self.core.expand_kv(&k)?;
        let v = self.core.expand_kv(&v)?;

        let h = self.core.n_head();
        let dk = self.core.d_k();

        // Позиционные эмбеддинги: [Bp, T_pos, D] → [Bp, H, T_pos, dk]
        let n_batch_pos = pos_emb.dim(0)?;
        let p = apply_linear(&self.linear_pos, pos_emb)?
            .reshape((n_batch_pos, (), h, dk))?
            .transpose(1, 2)?
            .contiguous()?;

        // Content score: (q + u) @ Kᵀ → [B, H, T1, T2]
        let bias_u = self.pos_bias_u.reshape((1, h, 1, dk))?;
        let q_with_u = q.broadcast_add(&bias_u)?.contiguous()?;
        let matrix_ac = q_with_u.broadcast_matmul(&k.t()?.contiguous()?)?;

        // Position score: (q + v) @ Pᵀ → [B, H, T1, T_pos]
        let bias_v = self.pos_bias_v.reshape((1, h, 1, dk))?;
        let q_with_v = q.broadcast_add(&bias_v)?.contiguous()?;
        let mut matrix_bd = q_with_v.broadcast_matmul(&p.t()?.contiguous()?)?;
        if self.do_rel_shift {
            matrix_bd = rel_shift(&matrix_bd, false)?;
        }
        let width = matrix_ac.dim(3)?;
        if matrix_bd.dim(3)? > width {
            matrix_bd = matrix_bd.narrow(3, 0, width)?;
        }

        let scores = ((matrix_ac + matrix_bd)? / (dk as f64).sqrt())?;
        let out = self.core.forward_attention(&v, &scores, mask, train)?;
        Ok((out, new_cache))
    }
}
