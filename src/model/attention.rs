//! Alignment scorers driven by the decoder once per step.
//!
//! Two interchangeable strategies share one call contract:
//!
//! ```text
//! (query [B, Q], memory [B, S, E], processed_memory [B, S, A], state, mask)
//!     → context [B, E], weights [B, S]
//! ```
//!
//! - [`location`] — location-sensitive additive attention; masked scores are
//!   set to −∞ and the result is softmax-normalised.
//! - [`gmm`] — Gaussian-mixture monotonic attention; weights are an
//!   unnormalised mixture density and masked positions get a small positive
//!   floor instead.
//!
//! The scorer is chosen once at construction. Its per-decode state lives in
//! an [`AttentionState`] owned by the caller.

pub mod gmm;
pub mod location;

use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;

use crate::config::{AttentionType, HParams};
use crate::{Error, Result};

pub use gmm::GmmAttention;
pub use location::LocationSensitiveAttention;

/// Per-decode attention state.
#[derive(Debug, Clone)]
pub enum AttentionState {
    /// Previous and cumulative weights, each `[B, S]`.
    Location { weights: Tensor, weights_cum: Tensor },
    /// Mixture means `[B, K, 1]` and source positions `[1, 1, S]`.
    Gmm { mu_prev: Tensor, positions: Tensor },
}

impl AttentionState {
    /// Mixture means of the GMM variant.
    pub fn mixture_means(&self) -> Option<&Tensor> {
        match self {
            AttentionState::Gmm { mu_prev, .. } => Some(mu_prev),
            AttentionState::Location { .. } => None,
        }
    }

    /// Cumulative weights of the location-sensitive variant.
    pub fn cumulative_weights(&self) -> Option<&Tensor> {
        match self {
            AttentionState::Location { weights_cum, .. } => Some(weights_cum),
            AttentionState::Gmm { .. } => None,
        }
    }
}

/// Result of one scoring step.
#[derive(Debug, Clone)]
pub struct Alignment {
    /// `[B, E]` weighted sum of memory rows.
    pub context: Tensor,
    /// `[B, S]` weight per source position.
    pub weights: Tensor,
}

/// Capability shared by both attention variants.
pub trait AlignmentScorer: std::fmt::Debug + Send + Sync {
    /// Project encoder memory `[B, S, E]` into scoring space `[B, S, A]`.
    fn process_memory(&self, memory: &Tensor) -> Result<Tensor>;

    /// Zeroed state for a decode over `processed_memory`.
    fn init_state(&self, processed_memory: &Tensor) -> Result<AttentionState>;

    /// Score one step and advance `state`.
    ///
    /// `mask` is `[B, S]` u8 with 1 at padded positions.
    fn attend(
        &self,
        query: &Tensor,
        memory: &Tensor,
        processed_memory: &Tensor,
        state: &mut AttentionState,
        mask: Option<&Tensor>,
    ) -> Result<Alignment>;
}

/// Build the scorer selected by `hparams.attention_type`.
pub fn build_scorer(
    hparams: &HParams,
    memory_dim: usize,
    vb: VarBuilder,
) -> Result<Box<dyn AlignmentScorer>> {
    let scorer: Box<dyn AlignmentScorer> = match hparams.attention_type {
        AttentionType::LocationSensitive => Box::new(LocationSensitiveAttention::new(
            hparams.attention_rnn_dim,
            memory_dim,
            hparams.attention_dim,
            hparams.attention_location_n_filters,
            hparams.attention_location_kernel_size,
            vb,
        )?),
        AttentionType::Gmm => Box::new(GmmAttention::new(
            hparams.attention_rnn_dim,
            memory_dim,
            hparams.attention_dim,
            hparams.gmm_mixtures,
            hparams.gmm_version,
            vb,
        )?),
    };
    Ok(scorer)
}

/// `weights [B, S]` × `memory [B, S, E]` → `[B, E]`.
pub(crate) fn weighted_context(weights: &Tensor, memory: &Tensor) -> Result<Tensor> {
    Ok(weights.unsqueeze(1)?.matmul(memory)?.squeeze(1)?)
}

pub(crate) fn state_mismatch(expected: &str) -> Error {
    Error::invalid_input(format!("attention state was not created by the {expected} scorer"))
}

pub(crate) fn zeros_like_rows(processed_memory: &Tensor, device: &Device) -> Result<Tensor> {
    let (b, s, _) = processed_memory.dims3()?;
    Ok(Tensor::zeros((b, s), processed_memory.dtype(), device)?)
}
