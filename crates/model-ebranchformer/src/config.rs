//! Конфигурация E-Branchformer энкодера и его модулей.
//!
//! Верхнеуровневый [`EBranchformerConfig`] читается из JSON; конфиги
//! отдельных модулей ([`AttentionConfig`], [`CgMlpConfig`],
//! [`EncoderLayerConfig`]) выводятся из него и валидируются при
//! создании слоя, до первого forward.

use std::path::Path;

use asr_core::{AsrError, AsrResult};
use serde::{Deserialize, Serialize};

use crate::activation::Activation;

/// Тип self-attention в ветке 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelfAttentionType {
    /// Relative-position attention (Transformer-XL, pos_bias_u/v).
    #[default]
    RelSelfattn,
    /// Обычная multi-head attention без позиционной части.
    Selfattn,
}

/// Stochastic depth: одно значение на все слои или список по слоям.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StochasticDepth {
    Uniform(f64),
    PerLayer(Vec<f64>),
}

impl Default for StochasticDepth {
    fn default() -> Self {
        Self::Uniform(0.0)
    }
}

/// Конфигурация multi-head attention (MHA / MQA / GQA).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionConfig {
    /// Количество голов запросов.
    pub n_head: usize,
    /// Размерность входа/выхода.
    pub n_feat: usize,
    pub dropout_rate: f32,
    pub query_bias: bool,
    pub key_bias: bool,
    pub value_bias: bool,
    /// Количество голов key/value; `None` — как у запросов.
    pub n_kv_head: Option<usize>,
    /// Размерность головы; обязательна при `n_kv_head`.
    pub head_dim: Option<usize>,
    /// Relative shift для matrix_bd (только relative-position вариант).
    pub do_rel_shift: bool,
    /// Обучаемое масштабирование входа (только relative-position вариант).
    pub adaptive_scale: bool,
    /// Равномерная инициализация проекций `±(h*d_k)^-0.5`.
    pub init_weights: bool,
}

impl AttentionConfig {
    pub fn new(n_head: usize, n_feat: usize, dropout_rate: f32) -> Self {
        Self {
            n_head,
            n_feat,
            dropout_rate,
            query_bias: true,
            key_bias: true,
            value_bias: true,
            n_kv_head: None,
            head_dim: None,
            do_rel_shift: false,
            adaptive_scale: false,
            init_weights: false,
        }
    }

    /// Grouped-query / multi-query вариант.
    pub fn with_kv_heads(mut self, n_kv_head: usize, head_dim: usize) -> Self {
        self.n_kv_head = Some(n_kv_head);
        self.head_dim = Some(head_dim);
        self
    }

    /// Суммарная размерность запросов `n_head * d_k`.
    pub fn inner_dim(&self) -> usize {
        match self.head_dim {
            Some(d) => d * self.n_head,
            None => self.n_feat,
        }
    }

    /// Суммарная размерность key/value `n_kv_head * d_k`.
    pub fn inner_kv_dim(&self) -> usize {
        match (self.n_kv_head, self.head_dim) {
            (Some(h), Some(d)) => h * d,
            _ => self.inner_dim(),
        }
    }

    pub fn n_kv_head(&self) -> usize {
        self.n_kv_head.unwrap_or(self.n_head)
    }

    pub fn d_k(&self) -> usize {
        self.inner_dim() / self.n_head
    }

    pub fn validate(&self) -> AsrResult<()> {
        if self.n_head == 0 || self.n_feat == 0 {
            return Err(AsrError::Config(format!(
                "attention: n_head={} и n_feat={} должны быть > 0",
                self.n_head, self.n_feat
            )));
        }
        if self.n_kv_head.is_some() && self.head_dim.is_none() {
            return Err(AsrError::Config(
                "attention: head_dim обязателен, если задан n_kv_head".to_string(),
            ));
        }
        let n_kv = self.n_kv_head();
        if n_kv == 0 || n_kv > self.n_head || self.n_head % n_kv != 0 {
            return Err(AsrError::Config(format!(
                "attention: n_kv_head={} должен делить n_head={}",
                n_kv, self.n_head
            )));
        }
        if self.inner_dim() % self.n_head != 0 {
            return Err(AsrError::Config(format!(
                "attention: n_feat={} не делится на n_head={}",
                self.inner_dim(),
                self.n_head
            )));
        }
        if self.d_k() != self.inner_kv_dim() / n_kv {
            return Err(AsrError::Config(format!(
                "attention: d_k запросов ({}) != d_k key/value ({})",
                self.d_k(),
                self.inner_kv_dim() / n_kv
            )));
        }
        validate_dropout("attention", self.dropout_rate)
    }
}

/// Конфигурация convolutional gating MLP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CgMlpConfig {
    pub size: usize,
    pub linear_units: usize,
    pub kernel_size: usize,
    pub dropout_rate: f32,
    pub use_linear_after_conv: bool,
    pub gate_activation: Activation,
    pub causal: bool,
    /// Новые веса свёртки и Linear гейта ~ N(0, 1e-6), bias = 1:
    /// на старте гейт близок к константе 1.
    #[serde(default)]
    pub unit_gate_init: bool,
}

impl CgMlpConfig {
    pub fn validate(&self) -> AsrResult<()> {
        if self.linear_units == 0 || self.linear_units % 2 != 0 {
            return Err(AsrError::Config(format!(
                "cgmlp: linear_units={} должен быть чётным и > 0",
                self.linear_units
            )));
        }
        validate_dropout("cgmlp", self.dropout_rate)?;
        validate_kernel("cgmlp", self.kernel_size, self.causal)
    }
}

/// Конфигурация одного E-Branchformer слоя (без вложенных модулей).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderLayerConfig {
    pub size: usize,
    pub dropout_rate: f32,
    pub merge_conv_kernel: usize,
    pub causal: bool,
    pub stochastic_depth_rate: f64,
}

impl EncoderLayerConfig {
    pub fn validate(&self) -> AsrResult<()> {
        if !(0.0..1.0).contains(&self.stochastic_depth_rate) {
            return Err(AsrError::Config(format!(
                "stochastic_depth_rate={} вне [0, 1)",
                self.stochastic_depth_rate
            )));
        }
        validate_dropout("layer", self.dropout_rate)?;
        validate_kernel("merge conv", self.merge_conv_kernel, self.causal)
    }
}

/// Вероятность dropout должна лежать в `[0, 1)`.
fn validate_dropout(what: &str, rate: f32) -> AsrResult<()> {
    if !(0.0..1.0).contains(&rate) {
        return Err(AsrError::Config(format!("{what}: dropout_rate={rate} вне [0, 1)")));
    }
    Ok(())
}

fn validate_kernel(what: &str, kernel_size: usize, causal: bool) -> AsrResult<()> {
    if kernel_size == 0 {
        return Err(AsrError::Config(format!("{what}: kernel_size=0")));
    }
    if !causal && kernel_size % 2 == 0 {
        return Err(AsrError::Config(format!(
            "{what}: несимметричная свёртка требует нечётного kernel_size, получено {kernel_size}"
        )));
    }
    Ok(())
}

/// Конфигурация E-Branchformer энкодера.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EBranchformerConfig {
    /// Размерность входных признаков (fbank).
    pub input_dim: usize,
    /// Размерность модели.
    pub output_size: usize,
    pub attention_heads: usize,
    pub n_kv_head: Option<usize>,
    pub head_dim: Option<usize>,
    /// Размерность скрытого слоя feed-forward.
    pub linear_units: usize,
    pub cgmlp_linear_units: usize,
    pub cgmlp_conv_kernel: usize,
    pub use_linear_after_conv: bool,
    pub gate_activation: Activation,
    /// См. [`CgMlpConfig::unit_gate_init`].
    pub cgmlp_unit_gate_init: bool,
    pub merge_conv_kernel: usize,
    pub causal: bool,
    pub use_ffn: bool,
    pub macaron_ffn: bool,
    pub ffn_activation: Activation,
    pub num_blocks: usize,
    pub dropout_rate: f32,
    pub positional_dropout_rate: f32,
    pub attention_dropout_rate: f32,
    pub stochastic_depth_rate: StochasticDepth,
    pub selfattention_layer_type: SelfAttentionType,
    pub query_bias: bool,
    pub key_bias: bool,
    pub value_bias: bool,
    pub do_rel_shift: bool,
    pub adaptive_scale: bool,
    pub init_weights: bool,
    /// Размер статического чанка для маски внимания; 0 — полное внимание.
    pub static_chunk_size: usize,
    /// Длина предвычисленной таблицы позиционного кодирования.
    pub max_pos_len: usize,
}

impl Default for EBranchformerConfig {
    fn default() -> Self {
        Self::base()
    }
}

impl EBranchformerConfig {
    /// 12 слоёв, d_model=256, 4 головы.
    pub fn base() -> Self {
        Self {
            input_dim: 80,
            output_size: 256,
            attention_heads: 4,
            n_kv_head: None,
            head_dim: None,
            linear_units: 1024,
            cgmlp_linear_units: 1024,
            cgmlp_conv_kernel: 31,
            use_linear_after_conv: false,
            gate_activation: Activation::Identity,
            cgmlp_unit_gate_init: false,
            merge_conv_kernel: 3,
            causal: true,
            use_ffn: true,
            macaron_ffn: true,
            ffn_activation: Activation::Swish,
            num_blocks: 12,
            dropout_rate: 0.1,
            positional_dropout_rate: 0.1,
            attention_dropout_rate: 0.0,
            stochastic_depth_rate: StochasticDepth::Uniform(0.0),
            selfattention_layer_type: SelfAttentionType::RelSelfattn,
            query_bias: true,
            key_bias: true,
            value_bias: true,
            do_rel_shift: false,
            adaptive_scale: false,
            init_weights: false,
            static_chunk_size: 0,
            max_pos_len: 5000,
        }
    }

    /// Маленькая конфигурация для тестов и отладки.
    pub fn small() -> Self {
        Self {
            input_dim: 16,
            output_size: 32,
            attention_heads: 4,
            linear_units: 64,
            cgmlp_linear_units: 64,
            cgmlp_conv_kernel: 5,
            num_blocks: 2,
            max_pos_len: 256,
            ..Self::base()
        }
    }

    /// Загрузить конфигурацию из JSON-файла (отсутствующие поля — из `base()`).
    pub fn from_json_file(path: impl AsRef<Path>) -> AsrResult<Self> {
        let data = std::fs::read(path.as_ref())?;
        let config: Self = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AsrResult<()> {
        if self.num_blocks == 0 {
            return Err(AsrError::Config("num_blocks=0".to_string()));
        }
        if let StochasticDepth::PerLayer(rates) = &self.stochastic_depth_rate {
            if rates.len() != self.num_blocks {
                return Err(AsrError::Config(format!(
                    "stochastic_depth_rate: {} значений для {} слоёв",
                    rates.len(),
                    self.num_blocks
                )));
            }
        }
        validate_dropout("positional encoding", self.positional_dropout_rate)?;
        self.attention_config().validate()?;
        self.cgmlp_config().validate()?;
        for i in 0..self.num_blocks {
            self.layer_config(i).validate()?;
        }
        Ok(())
    }

    pub fn attention_config(&self) -> AttentionConfig {
        AttentionConfig {
            n_head: self.attention_heads,
            n_feat: self.output_size,
            dropout_rate: self.attention_dropout_rate,
            query_bias: self.query_bias,
            key_bias: self.key_bias,
            value_bias: self.value_bias,
            n_kv_head: self.n_kv_head,
            head_dim: self.head_dim,
            do_rel_shift: self.do_rel_shift,
            adaptive_scale: self.adaptive_scale,
            init_weights: self.init_weights,
        }
    }

    pub fn cgmlp_config(&self) -> CgMlpConfig {
        CgMlpConfig {
            size: self.output_size,
            linear_units: self.cgmlp_linear_units,
            kernel_size: self.cgmlp_conv_kernel,
            dropout_rate: self.dropout_rate,
            use_linear_after_conv: self.use_linear_after_conv,
            gate_activation: self.gate_activation,
            causal: self.causal,
            unit_gate_init: self.cgmlp_unit_gate_init,
        }
    }

    pub fn layer_config(&self, layer: usize) -> EncoderLayerConfig {
        EncoderLayerConfig {
            size: self.output_size,
            dropout_rate: self.dropout_rate,
            merge_conv_kernel: self.merge_conv_kernel,
            causal: self.causal,
            stochastic_depth_rate: self.stochastic_depth_rate(layer),
        }
    }

    pub fn stochastic_depth_rate(&self, layer: usize) -> f64 {
        match &self.stochastic_depth_rate {
            StochasticDepth::Uniform(p) => *p,
            StochasticDepth::PerLayer(rates) => rates.get(layer).copied().unwrap_or(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_config_is_valid() {
        EBranchformerConfig::base().validate().unwrap();
        EBranchformerConfig::small().validate().unwrap();
    }

    #[test]
    fn test_kv_heads_require_head_dim() {
        let mut cfg = AttentionConfig::new(8, 256, 0.0);
        cfg.n_kv_head = Some(2);
        assert!(matches!(cfg.validate(), Err(AsrError::Config(_))));

        let cfg = AttentionConfig::new(8, 256, 0.0).with_kv_heads(2, 32);
        cfg.validate().unwrap();
        assert_eq!(cfg.inner_dim(), 256);
        assert_eq!(cfg.inner_kv_dim(), 64);
        assert_eq!(cfg.d_k(), 32);
    }

    #[test]
    fn test_kv_heads_must_divide_heads() {
        let cfg = AttentionConfig::new(8, 256, 0.0).with_kv_heads(3, 32);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_symmetric_conv_needs_odd_kernel() {
        let cfg = CgMlpConfig {
            size: 8,
            linear_units: 16,
            kernel_size: 4,
            dropout_rate: 0.0,
            use_linear_after_conv: false,
            gate_activation: Activation::Identity,
            causal: false,
            unit_gate_init: false,
        };
        assert!(cfg.validate().is_err());
        CgMlpConfig { causal: true, ..cfg }.validate().unwrap();
    }

    #[test]
    fn test_json_partial_overrides() {
        let json = r#"{
            "output_size": 144,
            "attention_heads": 4,
            "num_blocks": 3,
            "gate_activation": "gelu",
            "selfattention_layer_type": "selfattn",
            "stochastic_depth_rate": [0.0, 0.1, 0.2]
        }"#;
        let cfg: EBranchformerConfig = serde_json::from_str(json).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.output_size, 144);
        assert_eq!(cfg.gate_activation, Activation::Gelu);
        assert_eq!(cfg.selfattention_layer_type, SelfAttentionType::Selfattn);
        assert_eq!(cfg.stochastic_depth_rate(2), 0.2);
        assert_eq!(cfg.merge_conv_kernel, 3);
    }

    #[test]
    fn test_per_layer_depth_length_checked() {
        let cfg = EBranchformerConfig {
            stochastic_depth_rate: StochasticDepth::PerLayer(vec![0.1]),
            ..EBranchformerConfig::small()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_dropout_rates_checked_per_module() {
        let small = EBranchformerConfig::small;

        let cfg = EBranchformerConfig {
            dropout_rate: 1.5,
            ..small()
        };
        assert!(matches!(cfg.cgmlp_config().validate(), Err(AsrError::Config(_))));
        assert!(matches!(cfg.layer_config(0).validate(), Err(AsrError::Config(_))));
        assert!(cfg.validate().is_err());

        let cfg = EBranchformerConfig {
            positional_dropout_rate: 1.0,
            ..small()
        };
        assert!(cfg.validate().is_err());

        let cfg = EBranchformerConfig {
            attention_dropout_rate: -0.1,
            ..small()
        };
        assert!(cfg.validate().is_err());

        let cfg = EBranchformerConfig {
            dropout_rate: 0.0,
            positional_dropout_rate: 0.99,
            ..small()
        };
        cfg.validate().unwrap();
    }
}
