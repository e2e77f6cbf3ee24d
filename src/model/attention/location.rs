//! Location-sensitive additive attention (Chorowski et al. 2015).
//!
//! ```text
//! f   = location_dense(location_conv([w_prev; w_cum]))     [B, S, A]
//! e   = v(tanh(query_layer(h) + f + processed_memory))     [B, S]
//! e   = −∞ at padded positions
//! w   = softmax(e)
//! ctx = w · memory
//! ```

use candle_core::{D, Module, Tensor};
use candle_nn::{Conv1d, Linear, VarBuilder, ops};

use super::{
    Alignment, AlignmentScorer, AttentionState, state_mismatch, weighted_context, zeros_like_rows,
};
use crate::Result;
use crate::model::layers::{Gain, conv_norm, linear_norm};
use crate::model::mask::masked_fill;

/// Convolution over the (previous, cumulative) weight stack.
#[derive(Debug, Clone)]
struct LocationLayer {
    location_conv: Conv1d,
    location_dense: Linear,
}

impl LocationLayer {
    fn new(n_filters: usize, kernel_size: usize, attention_dim: usize, vb: VarBuilder) -> Result<Self> {
        let location_conv = conv_norm(2, n_filters, kernel_size, false, Gain::Linear, vb.pp("location_conv"))?;
        let location_dense = linear_norm(n_filters, attention_dim, false, Gain::Tanh, vb.pp("location_dense"))?;
        Ok(Self {
            location_conv,
            location_dense,
        })
    }

    /// `[B, 2, S]` → `[B, S, A]`.
    fn forward(&self, weights_cat: &Tensor) -> Result<Tensor> {
        let x = self.location_conv.forward(weights_cat)?.transpose(1, 2)?;
        Ok(self.location_dense.forward(&x)?)
    }
}

#[derive(Debug, Clone)]
pub struct LocationSensitiveAttention {
    query_layer: Linear,
    memory_layer: Linear,
    v: Linear,
    location_layer: LocationLayer,
}

impl LocationSensitiveAttention {
    pub fn new(
        attention_rnn_dim: usize,
        memory_dim: usize,
        attention_dim: usize,
        n_filters: usize,
        kernel_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            query_layer: linear_norm(attention_rnn_dim, attention_dim, false, Gain::Tanh, vb.pp("query_layer"))?,
            memory_layer: linear_norm(memory_dim, attention_dim, false, Gain::Tanh, vb.pp("memory_layer"))?,
            v: linear_norm(attention_dim, 1, false, Gain::Linear, vb.pp("v"))?,
            location_layer: LocationLayer::new(n_filters, kernel_size, attention_dim, vb.pp("location_layer"))?,
        })
    }

    /// Raw scores `[B, S]` before masking.
    fn alignment_energies(
        &self,
        query: &Tensor,
        processed_memory: &Tensor,
        weights_cat: &Tensor,
    ) -> Result<Tensor> {
        let processed_query = self.query_layer.forward(&query.unsqueeze(1)?)?;
        let processed_weights = self.location_layer.forward(weights_cat)?;
        let energies = processed_weights
            .broadcast_add(&processed_query)?
            .add(processed_memory)?
            .tanh()?;
        Ok(self.v.forward(&energies)?.squeeze(D::Minus1)?)
    }
}

impl AlignmentScorer for LocationSensitiveAttention {
    fn process_memory(&self, memory: &Tensor) -> Result<Tensor> {
        Ok(self.memory_layer.forward(memory)?)
    }

    fn init_state(&self, processed_memory: &Tensor) -> Result<AttentionState> {
        let zeros = zeros_like_rows(processed_memory, processed_memory.device())?;
        Ok(AttentionState::Location {
            weights: zeros.clone(),
            weights_cum: zeros,
        })
    }

    fn attend(
        &self,
        query: &Tensor,
        memory: &Tensor,
        processed_memory: &Tensor,
        state: &mut AttentionState,
        mask: Option<&Tensor>,
    ) -> Result<Alignment> {
        let AttentionState::Location {
            weights,
            weights_cum,
        } = state
        else {
            return Err(state_mismatch("location-sensitive"));
        };

        let weights_cat = Tensor::stack(&[&*weights, &*weights_cum], 1)?;
        let mut energies = self.alignment_energies(query, processed_memory, &weights_cat)?;
        if let Some(mask) = mask {
            energies = masked_fill(&energies, mask, f64::NEG_INFINITY)?;
        }

        let new_weights = ops::softmax_last_dim(&energies)?;
        let context = weighted_context(&new_weights, memory)?;

        *weights_cum = weights_cum.add(&new_weights)?;
        *weights = new_weights.clone();

        Ok(Alignment {
            context,
            weights: new_weights,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::mask::padding_mask;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    fn scorer(vb: VarBuilder) -> LocationSensitiveAttention {
        LocationSensitiveAttention::new(8, 6, 5, 3, 3, vb).unwrap()
    }

    #[test]
    fn test_weights_sum_to_one_without_mask() {
        let dev = Device::Cpu;
        let (_vm, vb) = make_vb(&dev);
        let attn = scorer(vb);
        let memory = Tensor::randn(0f32, 1.0, (2, 7, 6), &dev).unwrap();
        let processed = attn.process_memory(&memory).unwrap();
        let mut state = attn.init_state(&processed).unwrap();

        for _ in 0..3 {
            let query = Tensor::randn(0f32, 1.0, (2, 8), &dev).unwrap();
            let out = attn.attend(&query, &memory, &processed, &mut state, None).unwrap();
            assert_eq!(out.weights.dims(), &[2, 7]);
            assert_eq!(out.context.dims(), &[2, 6]);
            let sums: Vec<f32> = out.weights.sum(1).unwrap().to_vec1().unwrap();
            for s in sums {
                assert!((s - 1.0).abs() < 1e-5, "sum {s}");
            }
            let min: f32 = out.weights.min_all().unwrap().to_scalar().unwrap();
            assert!(min >= 0.0);
        }

        // Cumulative weights after three steps sum to 3 per row.
        let cum: Vec<f32> = state.cumulative_weights().unwrap().sum(1).unwrap().to_vec1().unwrap();
        for s in cum {
            assert!((s - 3.0).abs() < 1e-4, "cum {s}");
        }
    }

    #[test]
    fn test_masked_positions_get_zero_weight() {
        let dev = Device::Cpu;
        let (_vm, vb) = make_vb(&dev);
        let attn = scorer(vb);
        let memory = Tensor::randn(0f32, 1.0, (2, 5, 6), &dev).unwrap();
        let processed = attn.process_memory(&memory).unwrap();
        let mut state = attn.init_state(&processed).unwrap();
        let mask = padding_mask(&[5, 2], 5, &dev).unwrap();

        let query = Tensor::randn(0f32, 1.0, (2, 8), &dev).unwrap();
        let out = attn
            .attend(&query, &memory, &processed, &mut state, Some(&mask))
            .unwrap();
        let w: Vec<Vec<f32>> = out.weights.to_vec2().unwrap();
        assert!(w[1][2..].iter().all(|v| v.abs() < 1e-12));
        assert!((w[1][..2].iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!((w[0].iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_gmm_state_rejected() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let attn = scorer(vb);
        let memory = Tensor::zeros((1, 3, 6), DType::F32, &dev).unwrap();
        let processed = attn.process_memory(&memory).unwrap();
        let mut state = AttentionState::Gmm {
            mu_prev: Tensor::zeros((1, 2, 1), DType::F32, &dev).unwrap(),
            positions: Tensor::zeros((1, 1, 3), DType::F32, &dev).unwrap(),
        };
        let query = Tensor::zeros((1, 8), DType::F32, &dev).unwrap();
        assert!(attn.attend(&query, &memory, &processed, &mut state, None).is_err());
    }
}
