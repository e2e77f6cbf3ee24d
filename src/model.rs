//! Model components.
//!
//! ## Components
//!
//! - [`encoder`] — convolution stack + bidirectional LSTM over symbol embeddings
//! - [`attention`] — location-sensitive and GMM alignment scorers
//! - [`decoder`] — autoregressive decoder with explicit per-decode state
//! - [`postnet`] — residual convolutional mel refinement
//! - [`tacotron`] — embedding, ed fusion, and the two entry points
//! - [`loss`] — mel MSE + stop-token BCE

pub mod attention;
pub mod decoder;
pub mod encoder;
pub mod layers;
pub mod loss;
pub mod mask;
pub mod postnet;
pub mod tacotron;

pub use decoder::StopReason;
pub use loss::{LossBreakdown, Tacotron2Loss};
pub use tacotron::{InferenceOutput, Tacotron2, TacotronOutput};
