//! Синусоидальное относительное позиционное кодирование (как в Transformer-XL).

use candle_core::{Device, Result, Tensor};
use candle_nn::Dropout;
use tracing::warn;

/// Таблица `pe[pos, 2i] = sin(pos * w_i)`, `pe[pos, 2i+1] = cos(pos * w_i)`,
/// `w_i = 10000^(-2i/d_model)`.
fn sinusoid_table(len: usize, d_model: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; len * d_model];
    for pos in 0..len {
        for i in (0..d_model).step_by(2) {
            let div_term = (-(i as f64) * (10000f64.ln() / d_model as f64)).exp();
            let angle = pos as f64 * div_term;
            data[pos * d_model + i] = angle.sin() as f32;
            if i + 1 < d_model {
                data[pos * d_model + i + 1] = angle.cos() as f32;
            }
        }
    }
    Tensor::from_vec(data, (1, len, d_model), device)
}

/// Относительное позиционное кодирование.
///
/// `forward` масштабирует вход на `sqrt(d_model)` и возвращает позиционные
/// эмбеддинги отдельно, не прибавляя их к входу.
#[derive(Debug, Clone)]
pub struct RelPositionalEncoding {
    pe: Tensor,
    d_model: usize,
    xscale: f64,
    dropout: Dropout,
}

impl RelPositionalEncoding {
    pub fn new(d_model: usize, dropout_rate: f32, max_len: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            pe: sinusoid_table(max_len, d_model, device)?,
            d_model,
            xscale: (d_model as f64).sqrt(),
            dropout: Dropout::new(dropout_rate),
        })
    }

    pub fn max_len(&self) -> usize {
        self.pe.dims()[1]
    }

    /// `x` `[B, T, D]` → (`x * xscale`, `pos_emb [1, T, D]` с позиции `offset`).
    pub fn forward(&self, x: &Tensor, offset: usize, train: bool) -> Result<(Tensor, Tensor)> {
        let t = x.dim(1)?;
        let pos_emb = self.position_encoding(offset, t)?.to_dtype(x.dtype())?;
        let x = (x * self.xscale)?;
        Ok((
            self.dropout.forward(&x, train)?,
            self.dropout.forward(&pos_emb, train)?,
        ))
    }

    /// Эмбеддинги позиций `[offset, offset + size)`, форма `[1, size, D]`.
    ///
    /// Выход за пределы таблицы не ошибка: недостающая часть досчитывается.
    pub fn position_encoding(&self, offset: usize, size: usize) -> Result<Tensor> {
        let end = offset + size;
        if end <= self.max_len() {
            return self.pe.narrow(1, offset, size);
        }
        warn!(
            requested = end,
            max_len = self.max_len(),
            "позиционная таблица расширяется на лету"
        );
        sinusoid_table(end, self.d_model, self.pe.device())?.narrow(1, offset, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, IndexOp};

    #[test]
    fn test_table_starts_with_sin_zero_cos_one() {
        let dev = Device::Cpu;
        let pe = RelPositionalEncoding::new(8, 0.0, 16, &dev).unwrap();
        let first: Vec<f32> = pe.position_encoding(0, 1).unwrap().i((0, 0)).unwrap().to_vec1().unwrap();
        assert_eq!(first, vec![0., 1., 0., 1., 0., 1., 0., 1.]);
    }

    #[test]
    fn test_forward_scales_input_and_slices_offset() {
        let dev = Device::Cpu;
        let pe = RelPositionalEncoding::new(4, 0.0, 32, &dev).unwrap();
        let x = Tensor::ones((2, 3, 4), DType::F32, &dev).unwrap();
        let (y, pos) = pe.forward(&x, 5, false).unwrap();
        assert_eq!(pos.dims(), &[1, 3, 4]);
        let y: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert!(y.iter().all(|&v| (v - 2.0).abs() < 1e-6));

        let direct: Vec<f32> = pe.position_encoding(5, 3).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let from_forward: Vec<f32> = pos.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(direct, from_forward);
    }

    #[test]
    fn test_position_encoding_beyond_table() {
        let dev = Device::Cpu;
        let small = RelPositionalEncoding::new(6, 0.0, 4, &dev).unwrap();
        let large = RelPositionalEncoding::new(6, 0.0, 16, &dev).unwrap();
        let a: Vec<f32> = small.position_encoding(2, 6).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = large.position_encoding(2, 6).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }
}
