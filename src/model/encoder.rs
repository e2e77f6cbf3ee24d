//! Text encoder: convolution stack + bidirectional LSTM.
//!
//! ```text
//! [B, E, S] → N × (ConvNorm(E, E, k) → BatchNorm → ReLU → Dropout(0.5))
//!           → transpose → BiLSTM(E → E/2 per direction) → [B, S, E]
//! ```
//!
//! During training the backward direction starts at each row's last valid
//! symbol, so padding never leaks into the recurrent state, and padded
//! outputs are zero. Inference runs a single unpadded sequence per row.
//!
//! ## Weight key paths
//!
//! ```text
//! convolutions.{i}.0.conv.weight            — Conv1d(E, E, k)
//! convolutions.{i}.1.{weight,bias,running_mean,running_var}
//! lstm.{weight,bias}_{ih,hh}_l0[_reverse]
//! ```

use candle_core::{DType, Module, ModuleT, Tensor};
use candle_nn::{BatchNorm, Conv1d, VarBuilder};

use crate::Result;
use crate::config::HParams;
use crate::model::layers::{Gain, LstmCell, conv_norm, dropout};
use crate::model::mask::valid_positions;

const CONV_DROPOUT: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct Encoder {
    convolutions: Vec<(Conv1d, BatchNorm)>,
    lstm_forward: LstmCell,
    lstm_backward: LstmCell,
}

impl Encoder {
    pub fn new(hparams: &HParams, vb: VarBuilder) -> Result<Self> {
        let dim = hparams.encoder_embedding_dim;
        let mut convolutions = Vec::with_capacity(hparams.encoder_n_convolutions);
        for i in 0..hparams.encoder_n_convolutions {
            let vb_i = vb.pp(format!("convolutions.{i}"));
            let conv = conv_norm(dim, dim, hparams.encoder_kernel_size, true, Gain::Relu, vb_i.pp("0"))?;
            let norm = candle_nn::batch_norm(dim, 1e-5, vb_i.pp("1"))?;
            convolutions.push((conv, norm));
        }
        let vb_lstm = vb.pp("lstm");
        let lstm_forward = LstmCell::new(dim, dim / 2, "_l0", vb_lstm.clone())?;
        let lstm_backward = LstmCell::new(dim, dim / 2, "_l0_reverse", vb_lstm)?;
        Ok(Self {
            convolutions,
            lstm_forward,
            lstm_backward,
        })
    }

    fn convolve(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = x.clone();
        for (conv, norm) in &self.convolutions {
            let y = norm.forward_t(&conv.forward(&x)?, train)?.relu()?;
            x = dropout(&y, CONV_DROPOUT, train)?;
        }
        Ok(x)
    }

    /// Training forward.
    ///
    /// - `x`: `[B, E, S]` symbol embeddings
    /// - `input_lengths`: valid length per row, each in `1..=S`
    ///
    /// Returns `[B, S, E]`, zero beyond each row's length.
    pub fn forward(&self, x: &Tensor, input_lengths: &[usize], train: bool) -> Result<Tensor> {
        let x = self.convolve(x, train)?.transpose(1, 2)?.contiguous()?;
        let (_b, s, _e) = x.dims3()?;

        let forward = self.lstm_forward.run(&x)?;
        let reverse_index = reverse_prefix_index(input_lengths, s, x.dims(), x.device())?;
        let reversed = x.gather(&reverse_index, 1)?;
        let hidden_index = reverse_prefix_index(input_lengths, s, forward.dims(), x.device())?;
        let backward = self
            .lstm_backward
            .run(&reversed)?
            .gather(&hidden_index, 1)?;

        let outputs = Tensor::cat(&[&forward, &backward], 2)?;
        let valid = valid_positions(input_lengths, s, x.device())?.to_dtype(outputs.dtype())?;
        Ok(outputs.broadcast_mul(&valid)?)
    }

    /// Inference forward over unpadded sequences: `[B, E, S]` → `[B, S, E]`.
    pub fn inference(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.convolve(x, false)?.transpose(1, 2)?.contiguous()?;
        let forward = self.lstm_forward.run(&x)?;
        let backward = self.lstm_backward.run(&x.flip(&[1])?)?.flip(&[1])?;
        Ok(Tensor::cat(&[&forward, &backward], 2)?)
    }
}

/// Gather index `[B, S, C]` that reverses each row's first `len` steps and
/// leaves the padding in place. Applying it twice is the identity.
fn reverse_prefix_index(
    lengths: &[usize],
    max_len: usize,
    dims: &[usize],
    device: &candle_core::Device,
) -> Result<Tensor> {
    let mut index = Vec::with_capacity(lengths.len() * max_len);
    for &len in lengths {
        for t in 0..max_len {
            let src = if t < len { len - 1 - t } else { t };
            index.push(src as u32);
        }
    }
    let index = Tensor::from_vec(index, (lengths.len(), max_len, 1), device)?;
    Ok(index.broadcast_as(dims)?.contiguous()?.to_dtype(DType::U32)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    fn small_hparams() -> HParams {
        HParams {
            symbols_embedding_dim: 8,
            encoder_embedding_dim: 8,
            encoder_kernel_size: 3,
            encoder_n_convolutions: 2,
            ..HParams::default()
        }
    }

    #[test]
    fn test_encoder_output_shape_and_zero_padding() {
        let dev = Device::Cpu;
        let (_vm, vb) = make_vb(&dev);
        let enc = Encoder::new(&small_hparams(), vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 8, 6), &dev).unwrap();
        let out = enc.forward(&x, &[6, 4], false).unwrap();
        assert_eq!(out.dims(), &[2, 6, 8]);

        let tail: f32 = out
            .get(1)
            .unwrap()
            .narrow(0, 4, 2)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(tail, 0.0);
    }

    #[test]
    fn test_full_length_rows_match_inference_path() {
        let dev = Device::Cpu;
        let (_vm, vb) = make_vb(&dev);
        let enc = Encoder::new(&small_hparams(), vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 8, 5), &dev).unwrap();
        let packed = enc.forward(&x, &[5, 5], false).unwrap();
        let plain = enc.inference(&x).unwrap();
        let diff: f32 = (packed - plain).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        assert!(diff < 1e-5, "diff {diff}");
    }

    #[test]
    fn test_padding_does_not_leak_into_valid_outputs() {
        let dev = Device::Cpu;
        let (_vm, vb) = make_vb(&dev);
        let enc = Encoder::new(&small_hparams(), vb).unwrap();

        // Backward LSTM over a 3-step row padded with garbage to 5 steps
        // must equal the backward LSTM over the bare row.
        let seq = Tensor::randn(0f32, 1.0, (1, 3, 8), &dev).unwrap();
        let garbage = Tensor::randn(5f32, 1.0, (1, 2, 8), &dev).unwrap();
        let padded = Tensor::cat(&[&seq, &garbage], 1).unwrap();

        let idx = reverse_prefix_index(&[3], 5, padded.dims(), &dev).unwrap();
        let reversed: Vec<f32> = padded
            .gather(&idx, 1)
            .unwrap()
            .narrow(1, 0, 3)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let expected: Vec<f32> = seq.flip(&[1]).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(reversed, expected);

        let alone = enc.lstm_backward.run(&seq.flip(&[1]).unwrap()).unwrap();
        let packed = enc
            .lstm_backward
            .run(&padded.gather(&idx, 1).unwrap())
            .unwrap()
            .narrow(1, 0, 3)
            .unwrap();
        let diff: f32 = (alone - packed).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        assert!(diff < 1e-6);
    }
}
