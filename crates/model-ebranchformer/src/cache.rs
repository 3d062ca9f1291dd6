//! Кеши для потокового (chunk-by-chunk) инференса.
//!
//! Все кеши — обычные значения: вызывающий код передаёт их в слой
//! и получает обновлённые обратно. `None` означает начало потока.

use candle_core::{Result, Tensor};

/// Пара key/value кешей формы `[batch, heads, time, d_k]`.
#[derive(Debug, Clone)]
pub struct KvCache {
    pub key: Tensor,
    pub value: Tensor,
}

impl KvCache {
    /// Создать кеш; key и value обязаны совпадать по batch и heads.
    pub fn new(key: Tensor, value: Tensor) -> Self {
        let cache = Self { key, value };
        cache.assert_consistent();
        cache
    }

    pub fn assert_consistent(&self) {
        let k = self.key.dims();
        let v = self.value.dims();
        assert!(
            k.len() >= 3 && k.len() == v.len(),
            "kv cache: ранги key {k:?} и value {v:?} не совпадают"
        );
        assert_eq!(k[0], v[0], "kv cache: batch key {k:?} != value {v:?}");
        assert_eq!(
            k[k.len() - 3],
            v[v.len() - 3],
            "kv cache: heads key {k:?} != value {v:?}"
        );
    }

    pub fn batch_size(&self) -> usize {
        self.key.dims()[0]
    }

    /// Длина закешированной последовательности.
    pub fn seq_len(&self) -> usize {
        let dims = self.key.dims();
        dims[dims.len() - 2]
    }

    /// Оставить только последние `keep` кадров.
    pub fn keep_last(&self, keep: usize) -> Result<Self> {
        let t = self.seq_len();
        let start = t.saturating_sub(keep);
        let axis = self.key.rank() - 2;
        Ok(Self {
            key: self.key.narrow(axis, start, t - start)?,
            value: self.value.narrow(axis, start, t - start)?,
        })
    }
}

/// Кеш relative-position attention: key ‖ value по последней оси,
/// форма `[batch, heads, time, 2 * d_k]`.
#[derive(Debug, Clone)]
pub struct PackedKvCache(pub Tensor);

impl PackedKvCache {
    pub fn pack(key: &Tensor, value: &Tensor) -> Result<Self> {
        Ok(Self(Tensor::cat(&[key, value], candle_core::D::Minus1)?))
    }

    /// Разделить на (key, value) пополам по последней оси.
    pub fn split(&self) -> Result<(Tensor, Tensor)> {
        let last = self.0.dim(candle_core::D::Minus1)?;
        assert!(last % 2 == 0, "packed kv cache: нечётная последняя ось {last}");
        let half = last / 2;
        let key = self.0.narrow(candle_core::D::Minus1, 0, half)?;
        let value = self.0.narrow(candle_core::D::Minus1, half, half)?;
        Ok((key, value))
    }

    pub fn seq_len(&self) -> usize {
        self.0.dims()[2]
    }

    pub fn keep_last(&self, keep: usize) -> Result<Self> {
        let t = self.seq_len();
        let start = t.saturating_sub(keep);
        Ok(Self(self.0.narrow(2, start, t - start)?))
    }
}

/// Кеш self-attention; формат определяется вариантом внимания.
#[derive(Debug, Clone)]
pub enum SelfAttentionCache {
    Split(KvCache),
    Packed(PackedKvCache),
}

impl SelfAttentionCache {
    pub fn seq_len(&self) -> usize {
        match self {
            Self::Split(c) => c.seq_len(),
            Self::Packed(c) => c.seq_len(),
        }
    }

    pub fn keep_last(&self, keep: usize) -> Result<Self> {
        Ok(match self {
            Self::Split(c) => Self::Split(c.keep_last(keep)?),
            Self::Packed(c) => Self::Packed(c.keep_last(keep)?),
        })
    }
}

/// Все кеши одного E-Branchformer слоя.
#[derive(Debug, Clone, Default)]
pub struct LayerCache {
    pub self_att: Option<SelfAttentionCache>,
    pub cross_att: Option<KvCache>,
    /// Левый контекст свёртки cgMLP `[batch, linear_units/2, kernel-1]`.
    pub cnn: Option<Tensor>,
    /// Левый контекст fusion-свёртки `[batch, 2*size, merge_kernel-1]`.
    pub fusion: Option<Tensor>,
}

/// Кеш всего энкодера для одной потоковой сессии.
#[derive(Debug, Clone)]
pub struct EncoderCache {
    pub layers: Vec<LayerCache>,
    /// Сколько кадров (после эмбеддинга) уже обработано.
    pub offset: usize,
}

impl EncoderCache {
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: (0..num_layers).map(|_| LayerCache::default()).collect(),
            offset: 0,
        }
    }

    /// Длина self-attention кеша (одинакова для всех слоёв).
    pub fn att_cache_len(&self) -> usize {
        self.layers
            .first()
            .and_then(|l| l.self_att.as_ref())
            .map(|c| c.seq_len())
            .unwrap_or(0)
    }

    pub fn reset(&mut self) {
        for layer in &mut self.layers {
            *layer = LayerCache::default();
        }
        self.offset = 0;
    }
}
