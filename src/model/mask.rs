//! Padding masks built from sequence lengths.
//!
//! Masks are `u8` tensors `[B, T]` with 1 at padded positions (`t >= len`),
//! ready for `where_cond`.

use candle_core::{DType, Device, Result, Tensor};

/// Create a padding mask `[B, max_len]`: 1 where `t >= lengths[b]`.
pub fn padding_mask(lengths: &[usize], max_len: usize, device: &Device) -> Result<Tensor> {
    let mut mask_data = vec![0u8; lengths.len() * max_len];
    for (b, &len) in lengths.iter().enumerate() {
        for t in len.min(max_len)..max_len {
            mask_data[b * max_len + t] = 1;
        }
    }
    Tensor::from_vec(mask_data, (lengths.len(), max_len), device)
}

/// Replace every element of `xs` where `mask` is 1 with `value`.
///
/// `mask` must broadcast to the shape of `xs`.
pub fn masked_fill(xs: &Tensor, mask: &Tensor, value: f64) -> Result<Tensor> {
    let mask = mask.broadcast_as(xs.dims())?;
    let fill = Tensor::full(value, xs.dims(), xs.device())?.to_dtype(xs.dtype())?;
    mask.where_cond(&fill, xs)
}

/// Float `[B, max_len, 1]` tensor with 1.0 on valid positions.
pub fn valid_positions(lengths: &[usize], max_len: usize, device: &Device) -> Result<Tensor> {
    let pad = padding_mask(lengths, max_len, device)?;
    (1.0 - pad.to_dtype(DType::F32)?)?.unsqueeze(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding_mask_marks_tail() {
        let mask = padding_mask(&[3, 1], 4, &Device::Cpu).unwrap();
        let vals: Vec<Vec<u8>> = mask.to_vec2().unwrap();
        assert_eq!(vals, vec![vec![0, 0, 0, 1], vec![0, 1, 1, 1]]);
    }

    #[test]
    fn test_masked_fill_neg_inf() {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[1f32, 2.0, 3.0]], &dev).unwrap();
        let mask = padding_mask(&[2], 3, &dev).unwrap();
        let y: Vec<Vec<f32>> = masked_fill(&x, &mask, f64::NEG_INFINITY)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(y[0][..2], [1.0, 2.0]);
        assert!(y[0][2].is_infinite() && y[0][2] < 0.0);
    }

    #[test]
    fn test_valid_positions_shape() {
        let v = valid_positions(&[2, 3], 3, &Device::Cpu).unwrap();
        assert_eq!(v.dims(), &[2, 3, 1]);
        let vals: Vec<f32> = v.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(vals, vec![1.0, 1.0, 0.0, 1.0, 1.0, 1.0]);
    }
}
