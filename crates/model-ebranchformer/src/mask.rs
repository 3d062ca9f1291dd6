//! Маски внимания: паддинг по длинам и чанковая (streaming) маска.
//!
//! Все маски — `u8`: `1` = позиция допустима, кроме [`make_pad_mask`],
//! где `1` отмечает паддинг.

use candle_core::{DType, Device, Result, Tensor};

fn positions(lengths: &Tensor, max_len: Option<usize>) -> Result<(Tensor, Tensor)> {
    let lengths = lengths.to_dtype(DType::U32)?;
    let max_len = match max_len {
        Some(len) => len,
        None => lengths.max(0)?.to_scalar::<u32>()? as usize,
    };
    let range = Tensor::arange(0u32, max_len as u32, lengths.device())?.unsqueeze(0)?;
    Ok((range, lengths.unsqueeze(1)?))
}

/// `[B]` длины → `[B, max_len]`, `1` на паддинге.
///
/// ```text
/// lengths = [5, 3, 2]
/// [[0, 0, 0, 0, 0],
///  [0, 0, 0, 1, 1],
///  [0, 0, 1, 1, 1]]
/// ```
pub fn make_pad_mask(lengths: &Tensor, max_len: Option<usize>) -> Result<Tensor> {
    let (range, lengths) = positions(lengths, max_len)?;
    range.broadcast_ge(&lengths)
}

/// Инверсия [`make_pad_mask`]: `1` на валидных кадрах.
pub fn make_non_pad_mask(lengths: &Tensor, max_len: Option<usize>) -> Result<Tensor> {
    let (range, lengths) = positions(lengths, max_len)?;
    range.broadcast_lt(&lengths)
}

/// Чанковая маска `[size, size]`: кадр видит свой чанк и все предыдущие
/// (или не больше `num_left_chunks` предыдущих).
///
/// ```text
/// size = 4, chunk_size = 2
/// [[1, 1, 0, 0],
///  [1, 1, 0, 0],
///  [1, 1, 1, 1],
///  [1, 1, 1, 1]]
/// ```
pub fn subsequent_chunk_mask(
    size: usize,
    chunk_size: usize,
    num_left_chunks: Option<usize>,
    device: &Device,
) -> Result<Tensor> {
    assert!(chunk_size > 0, "chunk_size must be positive");
    let mut data = vec![0u8; size * size];
    for i in 0..size {
        let chunk = i / chunk_size;
        let start = match num_left_chunks {
            Some(left) => chunk.saturating_sub(left) * chunk_size,
            None => 0,
        };
        let end = ((chunk + 1) * chunk_size).min(size);
        data[i * size + start..i * size + end].fill(1);
    }
    Tensor::from_vec(data, (size, size), device)
}

/// Совместить паддинг-маску `[B, 1, T]` со статической чанковой маской.
///
/// При `static_chunk_size == 0` маска возвращается как есть (полный контекст),
/// иначе результат `[B, T, T]`.
pub fn add_optional_chunk_mask(
    masks: &Tensor,
    static_chunk_size: usize,
    num_left_chunks: Option<usize>,
) -> Result<Tensor> {
    if static_chunk_size == 0 {
        return Ok(masks.clone());
    }
    let t = masks.dim(2)?;
    let chunk = subsequent_chunk_mask(t, static_chunk_size, num_left_chunks, masks.device())?.unsqueeze(0)?;
    masks.broadcast_mul(&chunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_mask_from_lengths() {
        let dev = Device::Cpu;
        let lengths = Tensor::new(&[5u32, 3, 2], &dev).unwrap();
        let mask: Vec<Vec<u8>> = make_pad_mask(&lengths, None).unwrap().to_vec2().unwrap();
        assert_eq!(
            mask,
            vec![vec![0, 0, 0, 0, 0], vec![0, 0, 0, 1, 1], vec![0, 0, 1, 1, 1]]
        );
        let inv: Vec<Vec<u8>> = make_non_pad_mask(&lengths, Some(6)).unwrap().to_vec2().unwrap();
        assert_eq!(inv[1], vec![1, 1, 1, 0, 0, 0]);
    }

    #[test]
    fn test_subsequent_chunk_mask() {
        let dev = Device::Cpu;
        let mask: Vec<Vec<u8>> = subsequent_chunk_mask(4, 2, None, &dev).unwrap().to_vec2().unwrap();
        assert_eq!(
            mask,
            vec![vec![1, 1, 0, 0], vec![1, 1, 0, 0], vec![1, 1, 1, 1], vec![1, 1, 1, 1]]
        );

        let limited: Vec<Vec<u8>> = subsequent_chunk_mask(6, 2, Some(1), &dev).unwrap().to_vec2().unwrap();
        assert_eq!(limited[5], vec![0, 0, 1, 1, 1, 1]);
        assert_eq!(limited[1], vec![1, 1, 0, 0, 0, 0]);
    }

    #[test]
    fn test_chunk_mask_combined_with_padding() {
        let dev = Device::Cpu;
        let lengths = Tensor::new(&[4u32, 3], &dev).unwrap();
        let masks = make_non_pad_mask(&lengths, Some(4)).unwrap().unsqueeze(1).unwrap();

        let full = add_optional_chunk_mask(&masks, 0, None).unwrap();
        assert_eq!(full.dims(), &[2, 1, 4]);

        let chunked = add_optional_chunk_mask(&masks, 2, None).unwrap();
        assert_eq!(chunked.dims(), &[2, 4, 4]);
        let second: Vec<Vec<u8>> = chunked.get(1).unwrap().to_vec2().unwrap();
        assert_eq!(second[3], vec![1, 1, 1, 0]);
        assert_eq!(second[0], vec![1, 1, 0, 0]);
    }
}
