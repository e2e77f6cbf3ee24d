//! Gaussian-mixture monotonic attention (Graves 2013; Battenberg et al. 2019).
//!
//! ```text
//! [ω̂; Δ̂; σ̂] = mlp(h)                 mlp = Linear → tanh → Linear(3K)
//! (ω, Δ, σ, Z) = parameterise(ω̂, Δ̂, σ̂)   see [`GmmVersion`]
//! μ           = μ_prev + Δ            Δ ≥ 0, so μ never decreases
//! φ[j]        = Σ_k ω_k / Z_k · exp(−(j − μ_k)² / (2σ_k²))
//! φ[j]        = 1e-8 at padded positions
//! ctx         = φ · memory
//! ```
//!
//! `φ` is used as-is: no softmax, so the weights need not sum to one.

use candle_core::{D, Module, Tensor};
use candle_nn::{Linear, VarBuilder, ops};

use super::{Alignment, AlignmentScorer, AttentionState, state_mismatch, weighted_context};
use crate::Result;
use crate::config::GmmVersion;
use crate::model::layers::{Gain, linear_norm, softplus};
use crate::model::mask::masked_fill;

/// Floor added to every spread so the density never divides by zero.
pub const SIGMA_EPS: f64 = 1e-5;

/// Weight assigned to padded positions.
pub const SCORE_MASK_VALUE: f64 = 1e-8;

/// Mixture parameters for one step, each `[B, K, 1]`.
struct MixtureParams {
    omega: Tensor,
    delta: Tensor,
    sigma: Tensor,
    /// Normaliser, `None` for V0 (Z = 1).
    z: Option<Tensor>,
}

#[derive(Debug, Clone)]
pub struct GmmAttention {
    memory_layer: Linear,
    mlp_in: Linear,
    mlp_out: Linear,
    num_mixtures: usize,
    version: GmmVersion,
}

impl GmmAttention {
    pub fn new(
        attention_rnn_dim: usize,
        memory_dim: usize,
        attention_dim: usize,
        num_mixtures: usize,
        version: GmmVersion,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            memory_layer: linear_norm(memory_dim, attention_dim, false, Gain::Tanh, vb.pp("memory_layer"))?,
            mlp_in: candle_nn::linear(attention_rnn_dim, attention_dim, vb.pp("mlp.0"))?,
            mlp_out: candle_nn::linear(attention_dim, 3 * num_mixtures, vb.pp("mlp.2"))?,
            num_mixtures,
            version,
        })
    }

    fn mixture_params(&self, query: &Tensor) -> Result<MixtureParams> {
        let b = query.dim(0)?;
        let raw = self
            .mlp_out
            .forward(&self.mlp_in.forward(query)?.tanh()?)?
            .reshape((b, 3, self.num_mixtures))?;
        // Row slices of [B, 3, K] are strided once B > 1.
        let omega_hat = raw.narrow(1, 0, 1)?.squeeze(1)?.contiguous()?;
        let delta_hat = raw.narrow(1, 1, 1)?.squeeze(1)?.contiguous()?;
        let sigma_hat = raw.narrow(1, 2, 1)?.squeeze(1)?.contiguous()?;

        let (omega, delta, sigma) = match self.version {
            GmmVersion::V0 => (
                omega_hat.exp()?,
                delta_hat.exp()?,
                ((sigma_hat.neg()?.exp()? / 2.0)?.sqrt()? + SIGMA_EPS)?,
            ),
            GmmVersion::V1 => (
                ops::softmax_last_dim(&omega_hat)?,
                delta_hat.exp()?,
                (sigma_hat.exp()?.sqrt()? + SIGMA_EPS)?,
            ),
            GmmVersion::V2 => (
                ops::softmax_last_dim(&omega_hat)?,
                softplus(&delta_hat)?,
                (softplus(&sigma_hat)? + SIGMA_EPS)?,
            ),
        };
        let omega = omega.unsqueeze(D::Minus1)?;
        let delta = delta.unsqueeze(D::Minus1)?;
        let sigma = sigma.unsqueeze(D::Minus1)?;

        let z = match self.version {
            GmmVersion::V0 => None,
            GmmVersion::V1 | GmmVersion::V2 => {
                Some((sigma.sqr()? * (2.0 * std::f64::consts::PI))?.sqrt()?)
            }
        };
        Ok(MixtureParams {
            omega,
            delta,
            sigma,
            z,
        })
    }
}

impl AlignmentScorer for GmmAttention {
    fn process_memory(&self, memory: &Tensor) -> Result<Tensor> {
        Ok(self.memory_layer.forward(memory)?)
    }

    fn init_state(&self, processed_memory: &Tensor) -> Result<AttentionState> {
        let (b, s, _) = processed_memory.dims3()?;
        let dtype = processed_memory.dtype();
        let device = processed_memory.device();
        let mu_prev = Tensor::zeros((b, self.num_mixtures, 1), dtype, device)?;
        let positions = Tensor::arange(0u32, s as u32, device)?
            .to_dtype(dtype)?
            .reshape((1, 1, s))?;
        Ok(AttentionState::Gmm { mu_prev, positions })
    }

    fn attend(
        &self,
        query: &Tensor,
        memory: &Tensor,
        _processed_memory: &Tensor,
        state: &mut AttentionState,
        mask: Option<&Tensor>,
    ) -> Result<Alignment> {
        let AttentionState::Gmm { mu_prev, positions } = state else {
            return Err(state_mismatch("GMM"));
        };

        let params = self.mixture_params(query)?;
        let mu = mu_prev.add(&params.delta)?;

        // [1, 1, S] − [B, K, 1] → [B, K, S]
        let dist = positions.broadcast_sub(&mu)?.sqr()?;
        let density = (dist.broadcast_div(&params.sigma.sqr()?)? * -0.5)?.exp()?;
        let scale = match &params.z {
            Some(z) => params.omega.div(z)?,
            None => params.omega.clone(),
        };
        let mut alignment = density.broadcast_mul(&scale)?.sum(1)?;

        *mu_prev = mu;

        if let Some(mask) = mask {
            alignment = masked_fill(&alignment, mask, SCORE_MASK_VALUE)?;
        }
        let context = weighted_context(&alignment, memory)?;

        Ok(Alignment {
            context,
            weights: alignment,
        })
    }
}
