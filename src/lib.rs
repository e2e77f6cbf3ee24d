//! Tacotron 2 text-to-mel synthesis with location-sensitive or GMM attention.
//!
//! A candle-based sequence-to-sequence model. Symbols are embedded and
//! encoded once; an autoregressive decoder then attends over the encoder
//! output, emitting `n_frames_per_step` mel frames and a stop logit per
//! step. Optional emotion/intensity features are fused into the encoder
//! output before decoding.
//!
//! ## Architecture
//!
//! ```text
//! symbols → embedding → Encoder (3 × conv, BiLSTM) ──┐
//!                                                     ├→ memory
//! ed features ──────────── select + fuse ────────────┘
//!                                ↓
//!      Decoder (prenet → attention LSTM → scorer → decoder LSTM)
//!                                ↓
//!                  mel frames + stop logit per step
//!                                ↓
//!                     Postnet (residual refinement)
//! ```
//!
//! ## Modules
//!
//! - [`config`] — hyper-parameters, attention/fusion selection
//! - [`data`] — batch collation with length vectors
//! - [`model`] — encoder, attention scorers, decoder, postnet, loss

pub mod config;
pub mod data;
pub mod model;

mod error;

pub use error::{Error, Result};
