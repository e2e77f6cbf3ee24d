//! Residual mel refinement.
//!
//! ```text
//! [B, n_mel, T] → ConvNorm(n_mel → P) → BN → tanh → Dropout
//!              → (N − 2) × (ConvNorm(P → P) → BN → tanh → Dropout)
//!              → ConvNorm(P → n_mel) → BN → Dropout       → [B, n_mel, T]
//! ```
//!
//! The caller adds the result to the decoder output.

use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{BatchNorm, Conv1d, VarBuilder};

use crate::Result;
use crate::config::HParams;
use crate::model::layers::{Gain, conv_norm, dropout};

const POSTNET_DROPOUT: f64 = 0.5;

#[derive(Debug, Clone)]
struct PostnetLayer {
    conv: Conv1d,
    norm: BatchNorm,
    tanh: bool,
}

#[derive(Debug, Clone)]
pub struct Postnet {
    layers: Vec<PostnetLayer>,
}

impl Postnet {
    pub fn new(hparams: &HParams, vb: VarBuilder) -> Result<Self> {
        let n = hparams.postnet_n_convolutions;
        let k = hparams.postnet_kernel_size;
        let mut layers = Vec::with_capacity(n);
        for i in 0..n {
            let in_channels = if i == 0 {
                hparams.n_mel_channels
            } else {
                hparams.postnet_embedding_dim
            };
            let last = i + 1 == n;
            let (out_channels, gain) = if last {
                (hparams.n_mel_channels, Gain::Linear)
            } else {
                (hparams.postnet_embedding_dim, Gain::Tanh)
            };
            let vb_i = vb.pp(format!("convolutions.{i}"));
            layers.push(PostnetLayer {
                conv: conv_norm(in_channels, out_channels, k, true, gain, vb_i.pp("0"))?,
                norm: candle_nn::batch_norm(out_channels, 1e-5, vb_i.pp("1"))?,
                tanh: !last,
            });
        }
        Ok(Self { layers })
    }

    /// `[B, n_mel, T]` → refinement residual of the same shape.
    pub fn forward(&self, mel: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = mel.clone();
        for layer in &self.layers {
            let mut y = layer.norm.forward_t(&layer.conv.forward(&x)?, train)?;
            if layer.tanh {
                y = y.tanh()?;
            }
            x = dropout(&y, POSTNET_DROPOUT, train)?;
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_hparams() -> HParams {
        HParams {
            n_mel_channels: 4,
            postnet_embedding_dim: 6,
            postnet_kernel_size: 3,
            postnet_n_convolutions: 3,
            ..HParams::default()
        }
    }

    #[test]
    fn test_postnet_preserves_shape() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let postnet = Postnet::new(&small_hparams(), vb).unwrap();
        let mel = Tensor::randn(0f32, 1.0, (2, 4, 9), &dev).unwrap();
        assert_eq!(postnet.forward(&mel, false).unwrap().dims(), &[2, 4, 9]);
        assert_eq!(postnet.forward(&mel, true).unwrap().dims(), &[2, 4, 9]);
    }

    #[test]
    fn test_last_layer_is_linear() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let postnet = Postnet::new(&small_hparams(), vb).unwrap();
        let tanh: Vec<bool> = postnet.layers.iter().map(|l| l.tanh).collect();
        assert_eq!(tanh, vec![true, true, false]);
    }
}
