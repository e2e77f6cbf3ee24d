//! Top-level Tacotron 2 model.
//!
//! ```text
//! text [B, S] → embedding → encoder → (ed fusion) → decoder → + postnet
//! ```
//!
//! [`Tacotron2::forward`] is the teacher-forced training path over a
//! collated [`Batch`]; [`Tacotron2::inference`] decodes free-running from
//! symbols alone.
//!
//! ## Weight key paths
//!
//! ```text
//! embedding.weight                         — [n_symbols, E]
//! encoder.*                                — see [`super::encoder`]
//! decoder.*                                — see [`super::decoder`]
//! postnet.*                                — see [`super::postnet`]
//! ed_embedding.linear_layer.{weight,bias}  — optional ed projection
//! ```

use std::path::Path;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, Init, Linear, VarBuilder};

use crate::config::{Combination, ED_CHANNELS, HParams};
use crate::data::Batch;
use crate::model::decoder::{Decoder, StopReason};
use crate::model::encoder::Encoder;
use crate::model::layers::{Gain, linear_norm};
use crate::model::mask::{masked_fill, padding_mask};
use crate::model::postnet::Postnet;
use crate::{Error, Result};

/// Stop-logit value written at invalid output steps.
pub const GATE_PAD_VALUE: f64 = 1e3;

/// Teacher-forced outputs.
#[derive(Debug, Clone)]
pub struct TacotronOutput {
    /// `[B, n_mel, T]` decoder output.
    pub mel_outputs: Tensor,
    /// `[B, n_mel, T]` decoder output plus postnet residual.
    pub mel_outputs_postnet: Tensor,
    /// `[B, T / r]` stop logits, one per decoder step.
    pub gate_outputs: Tensor,
    /// `[B, T / r, S]`
    pub alignments: Tensor,
}

/// Free-running outputs.
#[derive(Debug, Clone)]
pub struct InferenceOutput {
    pub mel_outputs: Tensor,
    pub mel_outputs_postnet: Tensor,
    pub gate_outputs: Tensor,
    pub alignments: Tensor,
    pub stop_reason: StopReason,
    /// Decoder steps taken; the mel has `steps · r` frames.
    pub steps: usize,
    /// Per row, the step at which its stop token first fired.
    pub stop_steps: Vec<Option<usize>>,
}

#[derive(Debug, Clone)]
enum FusionMode {
    /// Append selected channels, optionally through a square projection.
    Concatenate { projection: Option<Linear> },
    /// Project selected channels to the encoder width and add.
    Add { projection: Linear },
}

/// Fuses the selected emotion/intensity channels into encoder outputs.
#[derive(Debug, Clone)]
pub struct EdFusion {
    /// Selected channel indices, u32.
    indices: Tensor,
    mode: FusionMode,
}

impl EdFusion {
    pub fn new(hparams: &HParams, vb: VarBuilder) -> Result<Self> {
        let selected = hparams.ed_selector().indices();
        let n = selected.len();
        if n == 0 {
            return Err(Error::config("include_ed requires at least one selected ed channel"));
        }
        let indices = Tensor::from_vec(selected, n, vb.device())?;
        let vb = vb.pp("ed_embedding");
        let mode = match hparams.combination {
            Combination::Addition => FusionMode::Add {
                projection: linear_norm(n, hparams.encoder_embedding_dim, false, Gain::Tanh, vb)?,
            },
            Combination::Concatenation => FusionMode::Concatenate {
                projection: if hparams.concatenation_embedding {
                    Some(linear_norm(n, n, true, Gain::Linear, vb)?)
                } else {
                    None
                },
            },
        };
        Ok(Self { indices, mode })
    }

    /// `encoder_outputs [B, S, E]`, `ed [B, 12, S]` → fused memory.
    pub fn fuse(&self, encoder_outputs: &Tensor, ed: &Tensor) -> Result<Tensor> {
        let ed = ed
            .index_select(&self.indices, 1)?
            .transpose(1, 2)?
            .contiguous()?
            .to_dtype(encoder_outputs.dtype())?;
        let fused = match &self.mode {
            FusionMode::Concatenate { projection } => {
                let ed = match projection {
                    Some(p) => p.forward(&ed)?,
                    None => ed,
                };
                Tensor::cat(&[encoder_outputs, &ed], 2)?
            }
            FusionMode::Add { projection } => encoder_outputs.add(&projection.forward(&ed)?)?,
        };
        Ok(fused)
    }
}

#[derive(Debug)]
pub struct Tacotron2 {
    hparams: HParams,
    embedding: Embedding,
    encoder: Encoder,
    ed_fusion: Option<EdFusion>,
    decoder: Decoder,
    postnet: Postnet,
}

impl Tacotron2 {
    /// Build from `vb`. The configuration is validated first.
    pub fn new(hparams: &HParams, vb: VarBuilder) -> Result<Self> {
        hparams.validate()?;

        let n = hparams.n_symbols;
        let dim = hparams.symbols_embedding_dim;
        let std = (2.0 / (n + dim) as f64).sqrt();
        let val = 3f64.sqrt() * std;
        let weight = vb.pp("embedding").get_with_hints(
            (n, dim),
            "weight",
            Init::Uniform { lo: -val, up: val },
        )?;
        let embedding = Embedding::new(weight, dim);

        let encoder = Encoder::new(hparams, vb.pp("encoder"))?;
        let ed_fusion = if hparams.include_ed {
            Some(EdFusion::new(hparams, vb.clone())?)
        } else {
            None
        };
        let decoder = Decoder::new(hparams, vb.pp("decoder"))?;
        let postnet = Postnet::new(hparams, vb.pp("postnet"))?;

        tracing::debug!(
            attention = %hparams.attention_type,
            memory_dim = hparams.memory_dim(),
            n_frames_per_step = hparams.n_frames_per_step,
            "built Tacotron 2"
        );
        Ok(Self {
            hparams: hparams.clone(),
            embedding,
            encoder,
            ed_fusion,
            decoder,
            postnet,
        })
    }

    /// Load from a safetensors checkpoint.
    pub fn from_safetensors(
        hparams: &HParams,
        path: impl AsRef<Path>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!("Loading Tacotron 2 weights from {:?}", path);
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[path], dtype, device)
                .map_err(|e| Error::WeightLoad(format!("{}: {e}", path.display())))?
        };
        Self::new(hparams, vb).map_err(|e| match e {
            Error::Candle(e) => Error::WeightLoad(e.to_string()),
            other => other,
        })
    }

    pub fn hparams(&self) -> &HParams {
        &self.hparams
    }

    fn check_text(&self, text: &Tensor) -> Result<(usize, usize)> {
        if text.dtype() != DType::U32 {
            return Err(Error::invalid_input(format!(
                "symbol ids must be u32, got {:?}",
                text.dtype()
            )));
        }
        let (b, s) = text.dims2()?;
        if b == 0 || s == 0 {
            return Err(Error::invalid_input("empty symbol batch"));
        }
        let max_id: u32 = text.max_all()?.to_scalar()?;
        if max_id as usize >= self.hparams.n_symbols {
            return Err(Error::invalid_input(format!(
                "symbol id {max_id} out of range for {} symbols",
                self.hparams.n_symbols
            )));
        }
        Ok((b, s))
    }

    fn check_ed(&self, ed: &Tensor, b: usize, s: usize) -> Result<()> {
        let dims = ed.dims();
        if dims != [b, ED_CHANNELS, s] {
            return Err(Error::invalid_input(format!(
                "ed features have shape {dims:?}, expected [{b}, {ED_CHANNELS}, {s}]"
            )));
        }
        Ok(())
    }

    fn embed(&self, text: &Tensor) -> Result<Tensor> {
        Ok(self.embedding.forward(text)?.transpose(1, 2)?.contiguous()?)
    }

    fn fuse(&self, encoder_outputs: Tensor, ed: &Tensor) -> Result<Tensor> {
        match &self.ed_fusion {
            Some(fusion) => fusion.fuse(&encoder_outputs, ed),
            None => Ok(encoder_outputs),
        }
    }

    /// Teacher-forced forward over a collated batch.
    pub fn forward(&self, batch: &Batch, train: bool) -> Result<TacotronOutput> {
        let (b, s) = self.check_text(&batch.text_padded)?;
        if batch.input_lengths.len() != b || batch.output_lengths.len() != b {
            return Err(Error::invalid_input(format!(
                "batch of {b} has {} input and {} output lengths",
                batch.input_lengths.len(),
                batch.output_lengths.len()
            )));
        }
        if let Some(&len) = batch.input_lengths.iter().find(|&&l| l == 0 || l > s) {
            return Err(Error::invalid_input(format!("input length {len} outside 1..={s}")));
        }
        let (_, n_mel, t) = batch.mel_padded.dims3()?;
        if n_mel != self.hparams.n_mel_channels {
            return Err(Error::invalid_input(format!(
                "mel has {n_mel} channels, model expects {}",
                self.hparams.n_mel_channels
            )));
        }
        if let Some(&len) = batch.output_lengths.iter().find(|&&l| l > t) {
            return Err(Error::invalid_input(format!("output length {len} exceeds {t} frames")));
        }
        self.check_ed(&batch.ed_padded, b, s)?;

        let embedded = self.embed(&batch.text_padded)?;
        let encoder_outputs = self.encoder.forward(&embedded, &batch.input_lengths, train)?;
        let memory = self.fuse(encoder_outputs, &batch.ed_padded)?;

        let mels = batch.mel_padded.to_dtype(memory.dtype())?;
        let decoded = self
            .decoder
            .forward(&memory, &mels, &batch.input_lengths, train)?;
        let mel_outputs_postnet = decoded
            .mel_outputs
            .add(&self.postnet.forward(&decoded.mel_outputs, train)?)?;

        let output = TacotronOutput {
            mel_outputs: decoded.mel_outputs,
            mel_outputs_postnet,
            gate_outputs: decoded.gate_outputs,
            alignments: decoded.alignments,
        };
        if self.hparams.mask_padding {
            self.mask_output(output, &batch.output_lengths)
        } else {
            Ok(output)
        }
    }

    /// Zero mel frames at or beyond each output length and write
    /// [`GATE_PAD_VALUE`] to the stop logit of steps starting there.
    fn mask_output(&self, output: TacotronOutput, output_lengths: &[usize]) -> Result<TacotronOutput> {
        let device = output.mel_outputs.device();
        let t = output.mel_outputs.dim(2)?;
        let steps = output.gate_outputs.dim(1)?;
        let r = self.hparams.n_frames_per_step;

        let frame_mask = padding_mask(output_lengths, t, device)?.unsqueeze(1)?;
        let step_lengths: Vec<usize> = output_lengths.iter().map(|len| len.div_ceil(r)).collect();
        let step_mask = padding_mask(&step_lengths, steps, device)?;

        Ok(TacotronOutput {
            mel_outputs: masked_fill(&output.mel_outputs, &frame_mask, 0.0)?,
            mel_outputs_postnet: masked_fill(&output.mel_outputs_postnet, &frame_mask, 0.0)?,
            gate_outputs: masked_fill(&output.gate_outputs, &step_mask, GATE_PAD_VALUE)?,
            alignments: output.alignments,
        })
    }

    /// Free-running synthesis.
    ///
    /// - `text`: `[B, S]` u32 symbol ids, unpadded
    /// - `ed`: `[B, 12, S]` emotion/intensity features
    pub fn inference(&self, text: &Tensor, ed: &Tensor) -> Result<InferenceOutput> {
        let (b, s) = self.check_text(text)?;
        self.check_ed(ed, b, s)?;

        let embedded = self.embed(text)?;
        let encoder_outputs = self.encoder.inference(&embedded)?;
        let memory = self.fuse(encoder_outputs, ed)?;

        let decoded = self.decoder.inference(&memory)?;
        let steps = decoded.output.steps()?;
        let mel_outputs = decoded.output.mel_outputs;
        let mel_outputs_postnet = mel_outputs.add(&self.postnet.forward(&mel_outputs, false)?)?;

        tracing::debug!(steps, stop_reason = %decoded.stop_reason, "inference finished");
        Ok(InferenceOutput {
            mel_outputs,
            mel_outputs_postnet,
            gate_outputs: decoded.output.gate_outputs,
            alignments: decoded.output.alignments,
            stop_reason: decoded.stop_reason,
            steps,
            stop_steps: decoded.stop_steps,
        })
    }
}
