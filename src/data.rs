//! Training data plumbing.
//!
//! Audio decoding, STFT feature extraction and text normalisation happen
//! upstream; this module only turns already-extracted examples into padded
//! batches with explicit length vectors.

mod collate;

pub use collate::{Batch, Example, TextMelCollate};
