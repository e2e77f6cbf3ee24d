//! Model hyper-parameters.
//!
//! Defaults follow the classic Tacotron 2 setup (80 mel channels, 512-dim
//! encoder, 1024-dim recurrent cells). Every field has a default, so a JSON
//! file only needs to name what it changes.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Number of channels in the emotion/intensity auxiliary feature.
pub const ED_CHANNELS: usize = 12;

/// Number of channels in the symbol-position auxiliary feature.
pub const SP_CHANNELS: usize = 3;

/// Alignment scorer used by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AttentionType {
    /// Location-sensitive additive attention, softmax-normalised.
    LocationSensitive,
    /// Gaussian-mixture monotonic attention, unnormalised.
    Gmm,
}

impl FromStr for AttentionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "LST" | "location" | "location_sensitive" => Ok(Self::LocationSensitive),
            "GMM" | "gmm" => Ok(Self::Gmm),
            other => Err(Error::config(format!(
                "attention_type should be either 'LST' or 'GMM', got '{other}'"
            ))),
        }
    }
}

impl TryFrom<String> for AttentionType {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<AttentionType> for String {
    fn from(t: AttentionType) -> Self {
        t.to_string()
    }
}

impl fmt::Display for AttentionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocationSensitive => write!(f, "LST"),
            Self::Gmm => write!(f, "GMM"),
        }
    }
}

/// How auxiliary emotion/intensity features are fused into the encoder output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Combination {
    /// Append the selected channels to every encoder frame.
    Concatenation,
    /// Project the selected channels to encoder width and add.
    Addition,
}

impl FromStr for Combination {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "concatenation" => Ok(Self::Concatenation),
            "addition" => Ok(Self::Addition),
            other => Err(Error::config(format!(
                "combination should be either 'concatenation' or 'addition', got '{other}'"
            ))),
        }
    }
}

impl TryFrom<String> for Combination {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Combination> for String {
    fn from(c: Combination) -> Self {
        c.to_string()
    }
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concatenation => write!(f, "concatenation"),
            Self::Addition => write!(f, "addition"),
        }
    }
}

/// Parameterisation of the GMM attention mixture (Battenberg et al. 2019).
///
/// | version | spread σ                 | shift Δ     | weight ω | Z            |
/// |---------|--------------------------|-------------|----------|--------------|
/// | V0      | `sqrt(exp(-σ̂)/2) + eps`  | `exp(Δ̂)`    | `exp(ω̂)` | 1            |
/// | V1      | `sqrt(exp(σ̂)) + eps`     | `exp(Δ̂)`    | softmax  | `sqrt(2πσ²)` |
/// | V2      | `softplus(σ̂) + eps`      | softplus(Δ̂) | softmax  | `sqrt(2πσ²)` |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum GmmVersion {
    V0,
    V1,
    V2,
}

impl TryFrom<u8> for GmmVersion {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::V0),
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            other => Err(Error::config(format!(
                "gmm_version should be 0, 1 or 2, got {other}"
            ))),
        }
    }
}

impl From<GmmVersion> for u8 {
    fn from(v: GmmVersion) -> Self {
        match v {
            GmmVersion::V0 => 0,
            GmmVersion::V1 => 1,
            GmmVersion::V2 => 2,
        }
    }
}

/// Boolean selector over the 12 emotion/intensity channels.
///
/// The channel layout is opaque to the model; only the selector decides
/// which channels are fused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdSelector([bool; ED_CHANNELS]);

impl EdSelector {
    /// Expand three per-category toggles to 4 channels each.
    pub fn from_toggles(toggles: [bool; 3]) -> Self {
        let mut mask = [false; ED_CHANNELS];
        for (i, slot) in mask.iter_mut().enumerate() {
            *slot = toggles[i / 4];
        }
        Self(mask)
    }

    /// Indices of the selected channels, ascending.
    pub fn indices(&self) -> Vec<u32> {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, on)| **on)
            .map(|(i, _)| i as u32)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.0.iter().filter(|on| **on).count()
    }
}

/// Full model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HParams {
    // --- Symbols / encoder ---
    pub n_symbols: usize,
    pub symbols_embedding_dim: usize,
    pub encoder_kernel_size: usize,
    pub encoder_n_convolutions: usize,
    pub encoder_embedding_dim: usize,

    // --- Audio ---
    pub n_mel_channels: usize,

    // --- Decoder ---
    pub n_frames_per_step: usize,
    pub attention_rnn_dim: usize,
    pub decoder_rnn_dim: usize,
    pub prenet_dim: usize,
    pub prenet_dropout: f64,
    /// Keep prenet dropout active outside training.
    pub prenet_dropout_in_eval: bool,
    pub max_decoder_steps: usize,
    pub gate_threshold: f64,
    pub p_attention_dropout: f64,
    pub p_decoder_dropout: f64,

    // --- Attention ---
    pub attention_type: AttentionType,
    pub attention_dim: usize,
    pub attention_location_n_filters: usize,
    pub attention_location_kernel_size: usize,
    pub gmm_mixtures: usize,
    pub gmm_version: GmmVersion,

    // --- Postnet ---
    pub postnet_embedding_dim: usize,
    pub postnet_kernel_size: usize,
    pub postnet_n_convolutions: usize,

    // --- Output ---
    pub mask_padding: bool,

    // --- Auxiliary emotion/intensity fusion ---
    pub include_ed: bool,
    pub combination: Combination,
    pub concatenation_embedding: bool,
    /// Per-word, per-phone and per-utterance toggles; each selects 4 channels.
    pub phones_words_utterance: [bool; 3],
}

impl Default for HParams {
    fn default() -> Self {
        Self {
            n_symbols: 148,
            symbols_embedding_dim: 512,
            encoder_kernel_size: 5,
            encoder_n_convolutions: 3,
            encoder_embedding_dim: 512,
            n_mel_channels: 80,
            n_frames_per_step: 1,
            attention_rnn_dim: 1024,
            decoder_rnn_dim: 1024,
            prenet_dim: 256,
            prenet_dropout: 0.5,
            prenet_dropout_in_eval: false,
            max_decoder_steps: 1000,
            gate_threshold: 0.5,
            p_attention_dropout: 0.1,
            p_decoder_dropout: 0.1,
            attention_type: AttentionType::LocationSensitive,
            attention_dim: 128,
            attention_location_n_filters: 32,
            attention_location_kernel_size: 31,
            gmm_mixtures: 8,
            gmm_version: GmmVersion::V1,
            postnet_embedding_dim: 512,
            postnet_kernel_size: 5,
            postnet_n_convolutions: 5,
            mask_padding: true,
            include_ed: false,
            combination: Combination::Concatenation,
            concatenation_embedding: false,
            phones_words_utterance: [true, true, true],
        }
    }
}

impl HParams {
    /// Parse from JSON. Unknown enum values surface as [`Error::Config`].
    pub fn from_json_str(s: &str) -> Result<Self> {
        let hparams: Self =
            serde_json::from_str(s).map_err(|e| Error::config(e.to_string()))?;
        hparams.validate()?;
        Ok(hparams)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Selector over the auxiliary channels derived from the toggles.
    pub fn ed_selector(&self) -> EdSelector {
        EdSelector::from_toggles(self.phones_words_utterance)
    }

    /// Width of the memory the decoder attends over.
    pub fn memory_dim(&self) -> usize {
        if self.include_ed && self.combination == Combination::Concatenation {
            self.encoder_embedding_dim + self.ed_selector().count()
        } else {
            self.encoder_embedding_dim
        }
    }

    /// Reject configurations the model cannot be built from.
    pub fn validate(&self) -> Result<()> {
        if self.n_symbols == 0 {
            return Err(Error::config("n_symbols must be positive"));
        }
        if self.n_frames_per_step == 0 {
            return Err(Error::config("n_frames_per_step must be at least 1"));
        }
        if self.max_decoder_steps == 0 {
            return Err(Error::config("max_decoder_steps must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.gate_threshold) {
            return Err(Error::config(format!(
                "gate_threshold must lie in [0, 1], got {}",
                self.gate_threshold
            )));
        }
        for (name, p) in [
            ("prenet_dropout", self.prenet_dropout),
            ("p_attention_dropout", self.p_attention_dropout),
            ("p_decoder_dropout", self.p_decoder_dropout),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::config(format!("{name} must lie in [0, 1), got {p}")));
            }
        }
        if self.encoder_embedding_dim % 2 != 0 {
            return Err(Error::config(format!(
                "encoder_embedding_dim must be even for the bidirectional LSTM, got {}",
                self.encoder_embedding_dim
            )));
        }
        if self.symbols_embedding_dim != self.encoder_embedding_dim {
            return Err(Error::config(format!(
                "symbols_embedding_dim ({}) must equal encoder_embedding_dim ({})",
                self.symbols_embedding_dim, self.encoder_embedding_dim
            )));
        }
        for (name, k) in [
            ("encoder_kernel_size", self.encoder_kernel_size),
            ("postnet_kernel_size", self.postnet_kernel_size),
            (
                "attention_location_kernel_size",
                self.attention_location_kernel_size,
            ),
        ] {
            if k % 2 == 0 {
                return Err(Error::config(format!(
                    "{name} must be odd for same padding, got {k}"
                )));
            }
        }
        if self.postnet_n_convolutions < 2 {
            return Err(Error::config(format!(
                "postnet_n_convolutions must be at least 2, got {}",
                self.postnet_n_convolutions
            )));
        }
        if self.attention_type == AttentionType::Gmm && self.gmm_mixtures == 0 {
            return Err(Error::config("gmm_mixtures must be at least 1"));
        }
        if self.include_ed && self.ed_selector().count() == 0 {
            return Err(Error::config(
                "include_ed is set but phones_words_utterance selects no channel",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let hp = HParams::default();
        hp.validate().unwrap();
        assert_eq!(hp.memory_dim(), 512);
        assert_eq!(hp.gmm_mixtures, 8);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let hp = HParams::from_json_str(
            r#"{"attention_type": "GMM", "gmm_version": 2, "n_frames_per_step": 3}"#,
        )
        .unwrap();
        assert_eq!(hp.attention_type, AttentionType::Gmm);
        assert_eq!(hp.gmm_version, GmmVersion::V2);
        assert_eq!(hp.n_frames_per_step, 3);
        assert_eq!(hp.n_mel_channels, 80);
    }

    #[test]
    fn test_unknown_attention_type_is_config_error() {
        let err = HParams::from_json_str(r#"{"attention_type": "dot"}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err:?}");
        assert!(err.to_string().contains("attention_type"));
    }

    #[test]
    fn test_unknown_combination_is_config_error() {
        let err = HParams::from_json_str(r#"{"combination": "multiply"}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err:?}");
        assert!("sum".parse::<Combination>().is_err());
    }

    #[test]
    fn test_unknown_gmm_version_rejected() {
        let err = HParams::from_json_str(r#"{"gmm_version": 3}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_json_roundtrip_keeps_enum_spelling() {
        let hp = HParams {
            attention_type: AttentionType::Gmm,
            combination: Combination::Addition,
            ..HParams::default()
        };
        let json = serde_json::to_string(&hp).unwrap();
        assert!(json.contains(r#""attention_type":"GMM""#));
        assert!(json.contains(r#""combination":"addition""#));
        assert!(json.contains(r#""gmm_version":1"#));
    }

    #[test]
    fn test_ed_selector_repeats_each_toggle_four_times() {
        let sel = EdSelector::from_toggles([true, false, true]);
        assert_eq!(sel.count(), 8);
        assert_eq!(sel.indices(), vec![0, 1, 2, 3, 8, 9, 10, 11]);
    }

    #[test]
    fn test_memory_dim_grows_only_with_concatenation() {
        let concat = HParams {
            include_ed: true,
            phones_words_utterance: [true, true, false],
            ..HParams::default()
        };
        assert_eq!(concat.memory_dim(), 512 + 8);
        let add = HParams {
            combination: Combination::Addition,
            ..concat.clone()
        };
        assert_eq!(add.memory_dim(), 512);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = [
            HParams { n_frames_per_step: 0, ..HParams::default() },
            HParams { gate_threshold: 1.5, ..HParams::default() },
            HParams { encoder_embedding_dim: 511, symbols_embedding_dim: 511, ..HParams::default() },
            HParams { symbols_embedding_dim: 256, ..HParams::default() },
            HParams { postnet_kernel_size: 4, ..HParams::default() },
            HParams {
                include_ed: true,
                phones_words_utterance: [false, false, false],
                ..HParams::default()
            },
        ];
        for hp in bad {
            assert!(matches!(hp.validate(), Err(Error::Config(_))), "{hp:?}");
        }
    }
}
