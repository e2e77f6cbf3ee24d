//! Autoregressive mel decoder.
//!
//! One decode is a [`DecodeSession`]: created zeroed by
//! [`Decoder::begin`] (initialized), advanced by [`DecodeSession::step`]
//! (stepping), and consumed by [`DecodeSession::finish`] (done). All state
//! that evolves across steps lives in the session's [`DecoderState`]; the
//! [`Decoder`] itself is immutable, so independent decodes can run in
//! parallel against one model.
//!
//! ## Step
//!
//! ```text
//! x        = prenet(previous frame group)                  [B, P]
//! (h₁, c₁) = attention_rnn([x; ctx_prev], (h₁, c₁))
//! ctx, w   = scorer(h₁, memory, processed_memory, state, mask)
//! (h₂, c₂) = decoder_rnn([h₁; ctx], (h₂, c₂))
//! mel      = linear_projection([h₂; ctx])                   [B, n_mel · r]
//! gate     = gate_layer([h₂; ctx])                          [B, 1]
//! ```
//!
//! With `r = n_frames_per_step`, one step emits `r` frames.

use candle_core::{D, DType, Module, Tensor};
use candle_nn::{Linear, VarBuilder, ops};

use crate::config::HParams;
use crate::model::attention::{AlignmentScorer, AttentionState, build_scorer};
use crate::model::layers::{Gain, LstmCell, dropout, linear_norm};
use crate::model::mask::padding_mask;
use crate::{Error, Result};

/// Two bias-free ReLU layers with dropout, applied to every decoder input.
#[derive(Debug, Clone)]
pub struct Prenet {
    layers: Vec<Linear>,
    p: f64,
}

impl Prenet {
    pub fn new(in_dim: usize, sizes: &[usize], p: f64, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(sizes.len());
        let mut in_size = in_dim;
        for (i, &out_size) in sizes.iter().enumerate() {
            layers.push(linear_norm(in_size, out_size, false, Gain::Linear, vb.pp(format!("layers.{i}")))?);
            in_size = out_size;
        }
        Ok(Self { layers, p })
    }

    pub fn forward(&self, x: &Tensor, dropout_active: bool) -> Result<Tensor> {
        let mut x = x.clone();
        for linear in &self.layers {
            x = dropout(&linear.forward(&x)?.relu()?, self.p, dropout_active)?;
        }
        Ok(x)
    }
}

/// Why free-running inference stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every sequence's stop probability exceeded the gate threshold.
    GateThreshold,
    /// `max_decoder_steps` was reached first; the output may be truncated.
    MaxDecoderSteps,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::GateThreshold => write!(f, "gate_threshold"),
            StopReason::MaxDecoderSteps => write!(f, "max_decoder_steps"),
        }
    }
}

/// Recurrent and attention state carried from one step to the next.
#[derive(Debug, Clone)]
pub struct DecoderState {
    pub attention_hidden: Tensor,
    pub attention_cell: Tensor,
    pub decoder_hidden: Tensor,
    pub decoder_cell: Tensor,
    /// `[B, E]` context from the previous step.
    pub attention_context: Tensor,
    pub attention: AttentionState,
}

/// Outputs of one step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// `[B, n_mel · r]`
    pub mel: Tensor,
    /// `[B, 1]` stop-token logit.
    pub gate: Tensor,
    /// `[B, S]`
    pub alignment: Tensor,
}

/// Stacked decoder outputs.
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    /// `[B, n_mel, steps · r]`
    pub mel_outputs: Tensor,
    /// `[B, steps]`
    pub gate_outputs: Tensor,
    /// `[B, steps, S]`
    pub alignments: Tensor,
}

impl DecoderOutput {
    pub fn steps(&self) -> Result<usize> {
        Ok(self.gate_outputs.dim(1)?)
    }
}

/// Free-running decode result.
#[derive(Debug, Clone)]
pub struct DecoderInference {
    pub output: DecoderOutput,
    pub stop_reason: StopReason,
    /// Per row, the step count at which its stop probability first exceeded
    /// the threshold; `None` if it never did. Rows can be trimmed to
    /// `steps · r` frames.
    pub stop_steps: Vec<Option<usize>>,
}

#[derive(Debug)]
pub struct Decoder {
    n_mel_channels: usize,
    n_frames_per_step: usize,
    memory_dim: usize,
    attention_rnn_dim: usize,
    decoder_rnn_dim: usize,
    max_decoder_steps: usize,
    gate_threshold: f64,
    p_attention_dropout: f64,
    p_decoder_dropout: f64,
    prenet_dropout_in_eval: bool,
    prenet: Prenet,
    attention_rnn: LstmCell,
    attention_layer: Box<dyn AlignmentScorer>,
    decoder_rnn: LstmCell,
    linear_projection: Linear,
    gate_layer: Linear,
}

impl Decoder {
    pub fn new(hparams: &HParams, vb: VarBuilder) -> Result<Self> {
        let memory_dim = hparams.memory_dim();
        let frame_dim = hparams.n_mel_channels * hparams.n_frames_per_step;
        let prenet = Prenet::new(
            frame_dim,
            &[hparams.prenet_dim, hparams.prenet_dim],
            hparams.prenet_dropout,
            vb.pp("prenet"),
        )?;
        let attention_rnn = LstmCell::new(
            hparams.prenet_dim + memory_dim,
            hparams.attention_rnn_dim,
            "",
            vb.pp("attention_rnn"),
        )?;
        let attention_layer = build_scorer(hparams, memory_dim, vb.pp("attention_layer"))?;
        let decoder_rnn = LstmCell::new(
            hparams.attention_rnn_dim + memory_dim,
            hparams.decoder_rnn_dim,
            "",
            vb.pp("decoder_rnn"),
        )?;
        let projection_in = hparams.decoder_rnn_dim + memory_dim;
        let linear_projection =
            linear_norm(projection_in, frame_dim, true, Gain::Linear, vb.pp("linear_projection"))?;
        let gate_layer = linear_norm(projection_in, 1, true, Gain::Sigmoid, vb.pp("gate_layer"))?;

        Ok(Self {
            n_mel_channels: hparams.n_mel_channels,
            n_frames_per_step: hparams.n_frames_per_step,
            memory_dim,
            attention_rnn_dim: hparams.attention_rnn_dim,
            decoder_rnn_dim: hparams.decoder_rnn_dim,
            max_decoder_steps: hparams.max_decoder_steps,
            gate_threshold: hparams.gate_threshold,
            p_attention_dropout: hparams.p_attention_dropout,
            p_decoder_dropout: hparams.p_decoder_dropout,
            prenet_dropout_in_eval: hparams.prenet_dropout_in_eval,
            prenet,
            attention_rnn,
            attention_layer,
            decoder_rnn,
            linear_projection,
            gate_layer,
        })
    }

    /// All-zero first input `[B, n_mel · r]`.
    pub fn go_frame(&self, memory: &Tensor) -> Result<Tensor> {
        let b = memory.dim(0)?;
        Ok(Tensor::zeros(
            (b, self.n_mel_channels * self.n_frames_per_step),
            memory.dtype(),
            memory.device(),
        )?)
    }

    /// Start a decode over `memory [B, S, E]`.
    ///
    /// `mask` is `[B, S]` u8 with 1 at padded positions, `None` for
    /// unpadded inference.
    pub fn begin(&self, memory: &Tensor, mask: Option<Tensor>) -> Result<DecodeSession<'_>> {
        let (b, s, e) = memory.dims3()?;
        if e != self.memory_dim {
            return Err(Error::invalid_input(format!(
                "memory has {e} features, decoder expects {}",
                self.memory_dim
            )));
        }
        let dtype = memory.dtype();
        let device = memory.device();
        let processed_memory = self.attention_layer.process_memory(memory)?;
        let attention = self.attention_layer.init_state(&processed_memory)?;
        let state = DecoderState {
            attention_hidden: Tensor::zeros((b, self.attention_rnn_dim), dtype, device)?,
            attention_cell: Tensor::zeros((b, self.attention_rnn_dim), dtype, device)?,
            decoder_hidden: Tensor::zeros((b, self.decoder_rnn_dim), dtype, device)?,
            decoder_cell: Tensor::zeros((b, self.decoder_rnn_dim), dtype, device)?,
            attention_context: Tensor::zeros((b, e), dtype, device)?,
            attention,
        };
        tracing::debug!(batch = b, source_len = s, memory_dim = e, "decode started");
        Ok(DecodeSession {
            decoder: self,
            memory: memory.clone(),
            processed_memory,
            mask,
            state,
            mel_outputs: Vec::new(),
            gate_outputs: Vec::new(),
            alignments: Vec::new(),
        })
    }

    /// `[B, n_mel, T]` → `[T / r, B, n_mel · r]`.
    fn parse_decoder_inputs(&self, decoder_inputs: &Tensor) -> Result<Tensor> {
        let (b, n_mel, t) = decoder_inputs.dims3()?;
        if n_mel != self.n_mel_channels {
            return Err(Error::invalid_input(format!(
                "mel targets have {n_mel} channels, expected {}",
                self.n_mel_channels
            )));
        }
        if t % self.n_frames_per_step != 0 {
            return Err(Error::invalid_input(format!(
                "mel target length {t} is not a multiple of n_frames_per_step {}",
                self.n_frames_per_step
            )));
        }
        let steps = t / self.n_frames_per_step;
        Ok(decoder_inputs
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, steps, n_mel * self.n_frames_per_step))?
            .transpose(0, 1)?)
    }

    /// Teacher-forced decode.
    ///
    /// - `memory`: `[B, S, E]` encoder output
    /// - `decoder_inputs`: `[B, n_mel, T]` ground-truth mels, `T` a multiple of `r`
    /// - `memory_lengths`: valid source length per row
    pub fn forward(
        &self,
        memory: &Tensor,
        decoder_inputs: &Tensor,
        memory_lengths: &[usize],
        train: bool,
    ) -> Result<DecoderOutput> {
        let (b, s, _) = memory.dims3()?;
        if memory_lengths.len() != b {
            return Err(Error::invalid_input(format!(
                "{} memory lengths for a batch of {b}",
                memory_lengths.len()
            )));
        }
        let go = self.go_frame(memory)?.unsqueeze(0)?;
        let frames = self.parse_decoder_inputs(decoder_inputs)?;
        let steps = frames.dim(0)?;
        let inputs = Tensor::cat(&[&go, &frames], 0)?;
        let inputs = self
            .prenet
            .forward(&inputs, train || self.prenet_dropout_in_eval)?;

        let mask = padding_mask(memory_lengths, s, memory.device())?;
        let mut session = self.begin(memory, Some(mask))?;
        for t in 0..steps {
            session.step(&inputs.get(t)?, train)?;
        }
        session.finish()
    }

    /// Free-running decode until the stop token fires or the step cap.
    pub fn inference(&self, memory: &Tensor) -> Result<DecoderInference> {
        let mut frame = self.go_frame(memory)?;
        let mut session = self.begin(memory, None)?;
        let mut stop_steps: Vec<Option<usize>> = vec![None; memory.dim(0)?];

        let stop_reason = loop {
            let input = self.prenet.forward(&frame, self.prenet_dropout_in_eval)?;
            let out = session.step(&input, false)?;

            let stop_probs: Vec<f32> = ops::sigmoid(&out.gate)?
                .squeeze(1)?
                .to_dtype(DType::F32)?
                .to_vec1()?;
            for (stop_step, prob) in stop_steps.iter_mut().zip(stop_probs) {
                if stop_step.is_none() && f64::from(prob) > self.gate_threshold {
                    *stop_step = Some(session.steps());
                }
            }
            if stop_steps.iter().all(Option::is_some) {
                break StopReason::GateThreshold;
            }
            if session.steps() >= self.max_decoder_steps {
                tracing::warn!(
                    max_decoder_steps = self.max_decoder_steps,
                    "reached max decoder steps before the stop token fired"
                );
                break StopReason::MaxDecoderSteps;
            }
            frame = out.mel;
        };

        let output = session.finish()?;
        Ok(DecoderInference {
            output,
            stop_reason,
            stop_steps,
        })
    }
}

/// One in-flight decode.
pub struct DecodeSession<'a> {
    decoder: &'a Decoder,
    memory: Tensor,
    processed_memory: Tensor,
    mask: Option<Tensor>,
    state: DecoderState,
    mel_outputs: Vec<Tensor>,
    gate_outputs: Vec<Tensor>,
    alignments: Vec<Tensor>,
}

impl DecodeSession<'_> {
    pub fn state(&self) -> &DecoderState {
        &self.state
    }

    /// Steps taken so far.
    pub fn steps(&self) -> usize {
        self.mel_outputs.len()
    }

    /// Advance one step. `decoder_input` is the prenet output `[B, P]`.
    pub fn step(&mut self, decoder_input: &Tensor, train: bool) -> Result<StepOutput> {
        let d = self.decoder;
        let state = &mut self.state;

        let cell_input = Tensor::cat(&[decoder_input, &state.attention_context], D::Minus1)?;
        let (hidden, cell) =
            d.attention_rnn
                .step(&cell_input, &state.attention_hidden, &state.attention_cell)?;
        state.attention_hidden = dropout(&hidden, d.p_attention_dropout, train)?;
        state.attention_cell = cell;

        let alignment = d.attention_layer.attend(
            &state.attention_hidden,
            &self.memory,
            &self.processed_memory,
            &mut state.attention,
            self.mask.as_ref(),
        )?;
        state.attention_context = alignment.context;

        let decoder_input = Tensor::cat(&[&state.attention_hidden, &state.attention_context], D::Minus1)?;
        let (hidden, cell) =
            d.decoder_rnn
                .step(&decoder_input, &state.decoder_hidden, &state.decoder_cell)?;
        state.decoder_hidden = dropout(&hidden, d.p_decoder_dropout, train)?;
        state.decoder_cell = cell;

        let hidden_context = Tensor::cat(&[&state.decoder_hidden, &state.attention_context], D::Minus1)?;
        let mel = d.linear_projection.forward(&hidden_context)?;
        let gate = d.gate_layer.forward(&hidden_context)?;

        self.mel_outputs.push(mel.clone());
        self.gate_outputs.push(gate.clone());
        self.alignments.push(alignment.weights.clone());

        Ok(StepOutput {
            mel,
            gate,
            alignment: alignment.weights,
        })
    }

    /// Stack per-step outputs along time and unfold frames per step.
    pub fn finish(self) -> Result<DecoderOutput> {
        if self.mel_outputs.is_empty() {
            return Err(Error::invalid_input("decode finished without any step"));
        }
        let d = self.decoder;
        let (b, _) = self.mel_outputs[0].dims2()?;
        let steps = self.mel_outputs.len();

        let alignments = Tensor::stack(&self.alignments, 1)?;
        let gate_outputs = Tensor::stack(&self.gate_outputs, 1)?.squeeze(2)?;
        let mel_outputs = Tensor::stack(&self.mel_outputs, 1)?
            .reshape((b, steps * d.n_frames_per_step, d.n_mel_channels))?
            .transpose(1, 2)?
            .contiguous()?;

        tracing::debug!(steps, frames = steps * d.n_frames_per_step, "decode finished");
        Ok(DecoderOutput {
            mel_outputs,
            gate_outputs,
            alignments,
        })
    }
}
