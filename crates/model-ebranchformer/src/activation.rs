//! Функции активации энкодера.

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

/// Активация, выбранная по имени из конфигурации при создании модуля.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Тождественная; линейный гейт cgMLP.
    #[default]
    Identity,
    Gelu,
    Relu,
    /// Swish / SiLU.
    #[serde(alias = "silu")]
    Swish,
    Tanh,
    Sigmoid,
}

impl Activation {
    pub fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Identity => Ok(xs.clone()),
            Self::Gelu => xs.gelu_erf(),
            Self::Relu => xs.relu(),
            Self::Swish => xs.silu(),
            Self::Tanh => xs.tanh(),
            Self::Sigmoid => candle_nn::ops::sigmoid(xs),
        }
    }
}

impl candle_core::Module for Activation {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.apply(xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_names_round_trip_through_serde() {
        let a: Activation = serde_json::from_str("\"identity\"").unwrap();
        assert_eq!(a, Activation::Identity);
        let a: Activation = serde_json::from_str("\"silu\"").unwrap();
        assert_eq!(a, Activation::Swish);
        assert!(serde_json::from_str::<Activation>("\"mish\"").is_err());
    }

    #[test]
    fn test_identity_and_relu() {
        let x = Tensor::new(&[-1f32, 0.0, 2.0], &Device::Cpu).unwrap();
        let id: Vec<f32> = Activation::Identity.apply(&x).unwrap().to_vec1().unwrap();
        assert_eq!(id, vec![-1.0, 0.0, 2.0]);
        let relu: Vec<f32> = Activation::Relu.apply(&x).unwrap().to_vec1().unwrap();
        assert_eq!(relu, vec![0.0, 0.0, 2.0]);
    }
}
