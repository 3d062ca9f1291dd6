//! # model-ebranchformer
//!
//! Потоковый E-Branchformer энкодер для распознавания речи на Candle.
//!
//! ## Архитектура слоя
//!
//! ```text
//! x ─► [macaron FF] ─┬─► LN ─► MHSA (rel-pos / plain) ─┐
//!                    └─► LN ─► cgMLP (causal conv) ────┤
//!                          fusion conv + merge_proj ◄──┘
//!                    ─► [FF] ─► cross-attention ─► LN
//! ```
//!
//! Внимание поддерживает MHA / MQA / GQA (`n_kv_head`, `head_dim`).
//! Все кеши (key/value, свёрточные) — явные значения: вызывающий код
//! передаёт [`LayerCache`] / [`EncoderCache`] и получает обновлённые.

pub mod activation;
pub mod attention;
pub mod cache;
pub mod cgmlp;
pub mod config;
pub mod conv;
pub mod encoder;
pub mod encoder_layer;
pub mod feed_forward;
pub mod mask;
pub mod position;

pub use activation::Activation;
pub use attention::{
    expand_kv_heads, rel_shift, AttentionCore, MultiHeadedAttention, MultiHeadedCrossAttention,
    RelPositionMultiHeadedAttention,
};
pub use cache::{EncoderCache, KvCache, LayerCache, PackedKvCache, SelfAttentionCache};
pub use cgmlp::{ConvolutionalGatingMLP, ConvolutionalSpatialGatingUnit};
pub use config::{
    AttentionConfig, CgMlpConfig, EBranchformerConfig, EncoderLayerConfig, SelfAttentionType,
    StochasticDepth,
};
pub use encoder::{EBranchformerEncoder, LinearEmbed};
pub use encoder_layer::{EBranchformerEncoderLayer, EncoderLayerOutput, FeedForward, SelfAttention};
pub use feed_forward::PositionwiseFeedForward;
pub use position::RelPositionalEncoding;
