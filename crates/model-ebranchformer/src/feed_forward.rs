//! Позиционный feed-forward: Linear → активация → dropout → Linear.

use candle_core::{Result, Tensor};
use candle_nn::{Dropout, Linear, ModuleT, VarBuilder};

use crate::activation::Activation;
use crate::attention::apply_linear;

#[derive(Debug, Clone)]
pub struct PositionwiseFeedForward {
    w_1: Linear,
    w_2: Linear,
    activation: Activation,
    dropout: Dropout,
}

impl PositionwiseFeedForward {
    pub fn new(
        idim: usize,
        hidden_units: usize,
        dropout_rate: f32,
        activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            w_1: candle_nn::linear(idim, hidden_units, vb.pp("w_1"))?,
            w_2: candle_nn::linear(hidden_units, idim, vb.pp("w_2"))?,
            activation,
            dropout: Dropout::new(dropout_rate),
        })
    }
}

impl ModuleT for PositionwiseFeedForward {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.activation.apply(&apply_linear(&self.w_1, xs)?)?;
        let h = self.dropout.forward(&h, train)?;
        apply_linear(&self.w_2, &h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_feed_forward_keeps_shape() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let ff = PositionwiseFeedForward::new(8, 32, 0.1, Activation::Swish, vb).unwrap();
        let xs = Tensor::randn(0f32, 1f32, (2, 5, 8), &dev).unwrap();
        assert_eq!(ff.forward_t(&xs, false).unwrap().dims(), &[2, 5, 8]);
        assert_eq!(ff.forward_t(&xs, true).unwrap().dims(), &[2, 5, 8]);
    }
}
