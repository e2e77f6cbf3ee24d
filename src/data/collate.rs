//! Zero-padding collation of variable-length (text, mel, auxiliary) examples.
//!
//! ```text
//! text  [S_i]          → text_padded [B, S_max]          (u32)
//! mel   [n_mel, T_i]   → mel_padded  [B, n_mel, T_pad]   T_pad = ceil(T_max / r) * r
//!                      → gate_padded [B, T_pad]          1.0 from T_i - 1 onward
//! ed    [12, S_i]      → ed_padded   [B, 12, S_max]
//! sp    [3, S_i]       → sp_padded   [B, 3, S_max]
//! ```
//!
//! Rows are sorted by descending symbol length; the same permutation is
//! applied to all five tensors.

use candle_core::{DType, Device, Tensor};

use crate::config::{ED_CHANNELS, SP_CHANNELS};
use crate::{Error, Result};

/// One training example as produced by the feature loader.
#[derive(Debug, Clone)]
pub struct Example {
    /// Symbol ids.
    pub text: Vec<u32>,
    /// Mel spectrogram `[n_mel, T]`.
    pub mel: Tensor,
    /// Emotion/intensity features `[12, S]`, one frame per symbol.
    pub ed: Tensor,
    /// Symbol-position features `[3, S]`.
    pub sp: Tensor,
}

/// A padded training batch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[B, S_max]` u32 symbol ids.
    pub text_padded: Tensor,
    /// Valid symbol count per row, descending.
    pub input_lengths: Vec<usize>,
    /// `[B, n_mel, T_pad]`.
    pub mel_padded: Tensor,
    /// `[B, T_pad]` stop-token targets.
    pub gate_padded: Tensor,
    /// Valid mel frame count per row.
    pub output_lengths: Vec<usize>,
    /// `[B, 12, S_max]`.
    pub ed_padded: Tensor,
    /// `[B, 3, S_max]`.
    pub sp_padded: Tensor,
    /// `order[i]` is the index in the input slice of batch row `i`.
    pub order: Vec<usize>,
}

impl Batch {
    pub fn batch_size(&self) -> usize {
        self.input_lengths.len()
    }

    /// Longest symbol sequence in the batch.
    pub fn max_input_len(&self) -> usize {
        self.input_lengths.first().copied().unwrap_or(0)
    }

    /// Copy every tensor to `device`.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            text_padded: self.text_padded.to_device(device)?,
            input_lengths: self.input_lengths.clone(),
            mel_padded: self.mel_padded.to_device(device)?,
            gate_padded: self.gate_padded.to_device(device)?,
            output_lengths: self.output_lengths.clone(),
            ed_padded: self.ed_padded.to_device(device)?,
            sp_padded: self.sp_padded.to_device(device)?,
            order: self.order.clone(),
        })
    }
}

/// Collator padding to a multiple of the decoder's frames-per-step.
#[derive(Debug, Clone)]
pub struct TextMelCollate {
    n_frames_per_step: usize,
    n_mel_channels: usize,
}

impl TextMelCollate {
    pub fn new(n_frames_per_step: usize, n_mel_channels: usize) -> Result<Self> {
        if n_frames_per_step == 0 {
            return Err(Error::config("n_frames_per_step must be at least 1"));
        }
        Ok(Self {
            n_frames_per_step,
            n_mel_channels,
        })
    }

    /// Round `len` up to the next multiple of frames-per-step.
    pub fn padded_target_len(&self, len: usize) -> usize {
        len.div_ceil(self.n_frames_per_step) * self.n_frames_per_step
    }

    fn check(&self, idx: usize, ex: &Example) -> Result<(usize, usize)> {
        let s = ex.text.len();
        if s == 0 {
            return Err(Error::invalid_input(format!("example {idx}: empty symbol sequence")));
        }
        let (n_mel, t) = ex.mel.dims2()?;
        if n_mel != self.n_mel_channels {
            return Err(Error::invalid_input(format!(
                "example {idx}: mel dimension mismatch: given {n_mel}, expected {}",
                self.n_mel_channels
            )));
        }
        if t == 0 {
            return Err(Error::invalid_input(format!("example {idx}: mel has no frames")));
        }
        for (name, tensor, channels) in [("ed", &ex.ed, ED_CHANNELS), ("sp", &ex.sp, SP_CHANNELS)] {
            let (c, frames) = tensor.dims2()?;
            if c != channels || frames != s {
                return Err(Error::invalid_input(format!(
                    "example {idx}: {name} has shape [{c}, {frames}], expected [{channels}, {s}]"
                )));
            }
        }
        Ok((s, t))
    }

    /// Pad and stack `examples` into a [`Batch`].
    pub fn collate(&self, examples: &[Example]) -> Result<Batch> {
        let first = examples
            .first()
            .ok_or_else(|| Error::invalid_input("cannot collate an empty batch"))?;
        let device = first.mel.device().clone();

        let mut dims = Vec::with_capacity(examples.len());
        for (i, ex) in examples.iter().enumerate() {
            dims.push(self.check(i, ex)?);
        }

        // Stable sort, longest symbol sequence first.
        let mut order: Vec<usize> = (0..examples.len()).collect();
        order.sort_by(|&a, &b| dims[b].0.cmp(&dims[a].0));

        let b = examples.len();
        let max_input_len = dims[order[0]].0;
        let max_target_len = dims.iter().map(|(_, t)| *t).max().unwrap_or(0);
        let max_target_len = self.padded_target_len(max_target_len);

        let mut text = vec![0u32; b * max_input_len];
        let mut gate = vec![0f32; b * max_target_len];
        let mut input_lengths = Vec::with_capacity(b);
        let mut output_lengths = Vec::with_capacity(b);
        let mut mels = Vec::with_capacity(b);
        let mut eds = Vec::with_capacity(b);
        let mut sps = Vec::with_capacity(b);

        for (row, &src) in order.iter().enumerate() {
            let ex = &examples[src];
            let (s, t) = dims[src];

            text[row * max_input_len..row * max_input_len + s].copy_from_slice(&ex.text);
            input_lengths.push(s);

            let gate_row = &mut gate[row * max_target_len..(row + 1) * max_target_len];
            gate_row[t - 1..].fill(1.0);
            output_lengths.push(t);

            mels.push(pad_frames(&ex.mel, max_target_len)?);
            eds.push(pad_frames(&ex.ed, max_input_len)?);
            sps.push(pad_frames(&ex.sp, max_input_len)?);
        }

        Ok(Batch {
            text_padded: Tensor::from_vec(text, (b, max_input_len), &device)?,
            input_lengths,
            mel_padded: Tensor::stack(&mels, 0)?,
            gate_padded: Tensor::from_vec(gate, (b, max_target_len), &device)?,
            output_lengths,
            ed_padded: Tensor::stack(&eds, 0)?,
            sp_padded: Tensor::stack(&sps, 0)?,
            order,
        })
    }
}

/// Right zero-pad a `[C, T]` matrix to `[C, len]` as f32.
fn pad_frames(x: &Tensor, len: usize) -> Result<Tensor> {
    let t = x.dim(1)?;
    let x = x.to_dtype(DType::F32)?;
    Ok(x.pad_with_zeros(1, 0, len - t)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(rows: usize, cols: usize, offset: f32) -> Tensor {
        let data: Vec<f32> = (0..rows * cols).map(|i| offset + i as f32 + 1.0).collect();
        Tensor::from_vec(data, (rows, cols), &Device::Cpu).unwrap()
    }

    fn example(s: usize, t: usize, n_mel: usize, offset: f32) -> Example {
        Example {
            text: (1..=s as u32).collect(),
            mel: ramp(n_mel, t, offset),
            ed: ramp(ED_CHANNELS, s, offset),
            sp: ramp(SP_CHANNELS, s, offset),
        }
    }

    #[test]
    fn test_two_sequence_batch_layout() {
        let collate = TextMelCollate::new(2, 4).unwrap();
        let batch = collate
            .collate(&[example(5, 10, 4, 0.0), example(3, 7, 4, 100.0)])
            .unwrap();

        assert_eq!(batch.input_lengths, vec![5, 3]);
        assert_eq!(batch.output_lengths, vec![10, 7]);
        assert_eq!(batch.text_padded.dims(), &[2, 5]);
        assert_eq!(batch.mel_padded.dims(), &[2, 4, 10]);
        assert_eq!(batch.ed_padded.dims(), &[2, ED_CHANNELS, 5]);
        assert_eq!(batch.sp_padded.dims(), &[2, SP_CHANNELS, 5]);

        let gate: Vec<Vec<f32>> = batch.gate_padded.to_vec2().unwrap();
        assert_eq!(gate[0], vec![0., 0., 0., 0., 0., 0., 0., 0., 0., 1.]);
        assert_eq!(gate[1], vec![0., 0., 0., 0., 0., 0., 1., 1., 1., 1.]);

        let mel: Vec<Vec<Vec<f32>>> = batch.mel_padded.to_vec3().unwrap();
        for channel in &mel[1] {
            assert!(channel[..7].iter().all(|v| *v > 0.0));
            assert_eq!(&channel[7..], &[0.0, 0.0, 0.0]);
        }

        let text: Vec<Vec<u32>> = batch.text_padded.to_vec2().unwrap();
        assert_eq!(text[1], vec![1, 2, 3, 0, 0]);
    }

    #[test]
    fn test_target_length_rounded_up_to_frames_per_step() {
        let collate = TextMelCollate::new(3, 2).unwrap();
        let batch = collate
            .collate(&[example(4, 7, 2, 0.0), example(2, 5, 2, 0.0)])
            .unwrap();
        assert_eq!(batch.mel_padded.dim(2).unwrap(), 9);
        assert_eq!(batch.gate_padded.dim(1).unwrap(), 9);

        // Already a multiple: no extra padding.
        let batch = collate.collate(&[example(4, 6, 2, 0.0)]).unwrap();
        assert_eq!(batch.mel_padded.dim(2).unwrap(), 6);
    }

    #[test]
    fn test_sort_permutation_applied_to_every_tensor() {
        let collate = TextMelCollate::new(1, 3).unwrap();
        let short = example(2, 4, 3, 500.0);
        let long = example(6, 3, 3, 0.0);
        let batch = collate.collate(&[short.clone(), long.clone()]).unwrap();

        assert_eq!(batch.order, vec![1, 0]);
        assert_eq!(batch.input_lengths, vec![6, 2]);
        assert_eq!(batch.output_lengths, vec![3, 4]);

        // Valid prefixes equal the source data, padding is exactly zero.
        let mel1 = batch.mel_padded.get(1).unwrap().narrow(1, 0, 4).unwrap();
        let diff: f32 = (mel1 - &short.mel)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(diff, 0.0);

        let ed1: Vec<Vec<f32>> = batch.ed_padded.get(1).unwrap().to_vec2().unwrap();
        let src: Vec<Vec<f32>> = short.ed.to_vec2().unwrap();
        for (padded, orig) in ed1.iter().zip(&src) {
            assert_eq!(&padded[..2], orig.as_slice());
            assert!(padded[2..].iter().all(|v| *v == 0.0));
        }

        let sp0: Vec<Vec<f32>> = batch.sp_padded.get(0).unwrap().to_vec2().unwrap();
        assert_eq!(sp0, long.sp.to_vec2::<f32>().unwrap());

        let mel0_tail: f32 = batch
            .mel_padded
            .get(0)
            .unwrap()
            .narrow(1, 3, 1)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(mel0_tail, 0.0);
    }

    #[test]
    fn test_mel_channel_mismatch_rejected() {
        let collate = TextMelCollate::new(1, 80).unwrap();
        let err = collate.collate(&[example(3, 5, 4, 0.0)]).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)), "got {err:?}");
        assert!(err.to_string().contains("mel dimension mismatch"));
    }

    #[test]
    fn test_auxiliary_frames_must_match_symbols() {
        let collate = TextMelCollate::new(1, 2).unwrap();
        let mut ex = example(3, 5, 2, 0.0);
        ex.ed = ramp(ED_CHANNELS, 4, 0.0);
        assert!(matches!(collate.collate(&[ex]), Err(Error::InvalidInput(_))));

        assert!(matches!(collate.collate(&[]), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_batch_accessors_and_device_copy() {
        let collate = TextMelCollate::new(1, 2).unwrap();
        let batch = collate
            .collate(&[example(2, 3, 2, 0.0), example(4, 5, 2, 10.0), example(3, 2, 2, 20.0)])
            .unwrap();
        assert_eq!(batch.batch_size(), 3);
        assert_eq!(batch.max_input_len(), 4);

        let moved = batch.to_device(&Device::Cpu).unwrap();
        assert_eq!(moved.input_lengths, batch.input_lengths);
        assert_eq!(moved.order, vec![1, 2, 0]);
        let a: Vec<Vec<Vec<f32>>> = moved.mel_padded.to_vec3().unwrap();
        let b: Vec<Vec<Vec<f32>>> = batch.mel_padded.to_vec3().unwrap();
        assert_eq!(a, b);
    }
}
