//! Cross-attention по предвычисленной памяти с расширением по beam.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use super::AttentionCore;
use crate::cache::KvCache;
use crate::config::AttentionConfig;

/// Повторить каждый элемент батча `beams` раз подряд: `[B, ..] → [B*beams, ..]`.
fn repeat_interleave_batch(x: &Tensor, beams: usize) -> Result<Tensor> {
    let dims = x.dims();
    let mut expanded = vec![dims[0], beams];
    expanded.extend_from_slice(&dims[1..]);
    let mut merged = vec![dims[0] * beams];
    merged.extend_from_slice(&dims[1..]);
    x.unsqueeze(1)?.broadcast_as(expanded)?.contiguous()?.reshape(merged)
}

/// Cross-attention: key/value берутся из отдельной последовательности.
///
/// С непустым кешем проецируется только запрос, key/value берутся из кеша.
/// Если батч запросов кратен батчу памяти (beam search), каждый элемент
/// памяти обслуживает `Beams` подряд идущих запросов.
#[derive(Debug, Clone)]
pub struct MultiHeadedCrossAttention {
    core: AttentionCore,
}

impl MultiHeadedCrossAttention {
    pub fn new(cfg: &AttentionConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            core: AttentionCore::new(cfg, vb)?,
        })
    }

    pub fn core(&self) -> &AttentionCore {
        &self.core
    }

    /// Возвращает `[B_query, T1, n_feat]` и кеш памяти (только при инференсе).
    ///
    /// Кеш хранит key/value с батчем памяти, без расширения по beam.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        cache: Option<&KvCache>,
        train: bool,
    ) -> Result<(Tensor, Option<KvCache>)> {
        let (q, k, v) = match cache {
            Some(cache) => {
                cache.assert_consistent();
                assert!(!train, "cross-attention cache is inference-only");
                (
                    self.core.forward_query(query)?,
                    cache.key.clone(),
                    cache.value.clone(),
                )
            }
            None => self.core.forward_qkv(query, key, value)?,
        };
        let new_cache = if train {
            cache.cloned()
        } else {
            Some(KvCache::new(k.clone(), v.clone()))
        };

        let mut k = self.core.expand_kv(&k)?;
        let mut v = self.core.expand_kv(&v)?;
        let mut mask = mask.cloned();

        let batch = query.dim(0)?;
        let memory_batch = k.dim(0)?;
        if batch != memory_batch {
            assert!(!train, "beam expansion is only valid at inference");
            assert!(
                batch % memory_batch == 0,
                "query batch {batch} is not a multiple of memory batch {memory_batch}"
            );
            // запрос b*Beams + j читает память b
            let beams = batch / memory_batch;
            k = repeat_interleave_batch(&k, beams)?;
            v = repeat_interleave_batch(&v, beams)?;
            mask = match mask {
                Some(m) if m.dim(0)? == memory_batch => Some(repeat_interleave_batch(&m, beams)?),
                other => other,
            };
        }

        let scores = self.core.scores(&q, &k)?;
        let out = self.core.forward_attention(&v, &scores, mask.as_ref(), train)?;
        Ok((out, new_cache))
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

    fn build(cfg: &AttentionConfig) -> MultiHeadedCrossAttention {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        MultiHeadedCrossAttention::new(cfg, vb).unwrap()
    }

    fn repeat_beams(x: &Tensor, beams: usize) -> Tensor {
        let (b, t, d) = x.dims3().unwrap();
        x.unsqueeze(1)
            .unwrap()
            .broadcast_as((b, beams, t, d))
            .unwrap()
            .contiguous()
            .unwrap()
            .reshape((b * beams, t, d))
            .unwrap()
    }

    #[test]
    fn test_cached_memory_skips_key_projection() {
        let dev = Device::Cpu;
        let attn = build(&AttentionConfig::new(4, 16, 0.0));
        let query = Tensor::randn(0f32, 1f32, (2, 3, 16), &dev).unwrap();
        let memory = Tensor::randn(0f32, 1f32, (2, 7, 16), &dev).unwrap();

        let (first, cache) = attn.forward(&query, &memory, &memory, None, None, false).unwrap();
        let cache = cache.unwrap();
        assert_eq!(cache.key.dims(), &[2, 4, 7, 4]);

        let garbage = memory.zeros_like().unwrap();
        let (second, cache2) = attn
            .forward(&query, &garbage, &garbage, None, Some(&cache), false)
            .unwrap();
        assert!(max_abs_diff(&first, &second) < 1e-6);
        assert_eq!(cache2.unwrap().seq_len(), 7);
    }

    #[test]
    fn test_beam_expansion_equals_repeated_queries() {
        let dev = Device::Cpu;
        let attn = build(&AttentionConfig::new(8, 16, 0.0).with_kv_heads(2, 2));
        let query = Tensor::randn(0f32, 1f32, (2, 3, 16), &dev).unwrap();
        let memory = Tensor::randn(0f32, 1f32, (2, 7, 16), &dev).unwrap();
        let mask = Tensor::from_vec(
            vec![1u8, 1, 1, 1, 1, 0, 0, 1, 1, 1, 1, 1, 1, 1],
            (2, 1, 7),
            &dev,
        )
        .unwrap();

        let (plain, cache) = attn
            .forward(&query, &memory, &memory, Some(&mask), None, false)
            .unwrap();
        let cache = cache.unwrap();

        let beams = 3;
        let beam_query = repeat_beams(&query, beams);
        let (expanded, _) = attn
            .forward(&beam_query, &memory, &memory, Some(&mask), Some(&cache), false)
            .unwrap();
        assert_eq!(expanded.dims(), &[6, 3, 16]);
        assert!(max_abs_diff(&expanded, &repeat_beams(&plain, beams)) < 1e-5);
    }

    #[test]
    fn test_beam_expansion_without_mask_from_single_memory() {
        let dev = Device::Cpu;
        let attn = build(&AttentionConfig::new(4, 16, 0.0));
        let query = Tensor::randn(0f32, 1f32, (1, 2, 16), &dev).unwrap();
        let memory = Tensor::randn(0f32, 1f32, (1, 5, 16), &dev).unwrap();

        let (plain, cache) = attn.forward(&query, &memory, &memory, None, None, false).unwrap();
        let cache = cache.unwrap();

        let beam_query = repeat_beams(&query, 4);
        let (expanded, beam_cache) = attn
            .forward(&beam_query, &memory, &memory, None, Some(&cache), false)
            .unwrap();
        assert_eq!(expanded.dims(), &[4, 2, 16]);
        assert!(max_abs_diff(&expanded, &repeat_beams(&plain, 4)) < 1e-5);
        // кеш остаётся с батчем памяти
        assert_eq!(beam_cache.unwrap().key.dims(), &[1, 4, 5, 4]);
    }

    #[test]
    fn test_repeat_interleave_batch_order() {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[1f32, 2.], [3., 4.]], &dev).unwrap();
        let y: Vec<Vec<f32>> = repeat_interleave_batch(&x, 3).unwrap().to_vec2().unwrap();
        assert_eq!(
            y,
            vec![
                vec![1., 2.],
                vec![1., 2.],
                vec![1., 2.],
                vec![3., 4.],
                vec![3., 4.],
                vec![3., 4.]
            ]
        );
    }

    #[test]
    #[should_panic(expected = "beam expansion")]
    fn test_beam_expansion_rejected_in_training() {
        let dev = Device::Cpu;
        let attn = build(&AttentionConfig::new(4, 16, 0.0));
        let query = Tensor::randn(0f32, 1f32, (4, 3, 16), &dev).unwrap();
        let memory = Tensor::randn(0f32, 1f32, (2, 7, 16), &dev).unwrap();
        let _ = attn.forward(&query, &memory, &memory, None, None, true);
    }
}
