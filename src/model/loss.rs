//! Training loss: mel MSE before and after the postnet plus stop-token BCE.

use candle_core::{DType, Tensor};

use crate::model::layers::softplus;
use crate::model::tacotron::TacotronOutput;
use crate::{Error, Result};

/// Loss components, each a scalar tensor.
#[derive(Debug, Clone)]
pub struct LossBreakdown {
    pub mel: Tensor,
    pub mel_postnet: Tensor,
    pub gate: Tensor,
    pub total: Tensor,
}

impl LossBreakdown {
    /// `(mel, mel_postnet, gate, total)` as host floats.
    pub fn to_scalars(&self) -> Result<(f32, f32, f32, f32)> {
        let f = |t: &Tensor| -> Result<f32> { Ok(t.to_dtype(DType::F32)?.to_scalar()?) };
        Ok((f(&self.mel)?, f(&self.mel_postnet)?, f(&self.gate)?, f(&self.total)?))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Tacotron2Loss {
    n_frames_per_step: usize,
}

impl Tacotron2Loss {
    pub fn new(n_frames_per_step: usize) -> Result<Self> {
        if n_frames_per_step == 0 {
            return Err(Error::config("n_frames_per_step must be at least 1"));
        }
        Ok(Self { n_frames_per_step })
    }

    /// Reduce frame-level stop targets `[B, T]` to one per decoder step
    /// `[B, T / r]` by keeping the last frame of each group.
    pub fn gate_targets_per_step(&self, gate_padded: &Tensor) -> Result<Tensor> {
        let r = self.n_frames_per_step;
        let (b, t) = gate_padded.dims2()?;
        if t % r != 0 {
            return Err(Error::invalid_input(format!(
                "gate target length {t} is not a multiple of n_frames_per_step {r}"
            )));
        }
        if r == 1 {
            return Ok(gate_padded.clone());
        }
        Ok(gate_padded
            .reshape((b, t / r, r))?
            .narrow(2, r - 1, 1)?
            .squeeze(2)?)
    }

    pub fn compute(
        &self,
        output: &TacotronOutput,
        mel_target: &Tensor,
        gate_target: &Tensor,
    ) -> Result<LossBreakdown> {
        let mel_target = mel_target.to_dtype(output.mel_outputs.dtype())?;
        let gate_target = self
            .gate_targets_per_step(gate_target)?
            .to_dtype(output.gate_outputs.dtype())?;
        if gate_target.dims() != output.gate_outputs.dims() {
            return Err(Error::invalid_input(format!(
                "gate targets {:?} do not match gate outputs {:?}",
                gate_target.dims(),
                output.gate_outputs.dims()
            )));
        }

        let mel = candle_nn::loss::mse(&output.mel_outputs, &mel_target)?;
        let mel_postnet = candle_nn::loss::mse(&output.mel_outputs_postnet, &mel_target)?;
        let gate = bce_with_logits(&output.gate_outputs, &gate_target)?;
        let total = ((&mel + &mel_postnet)? + &gate)?;
        Ok(LossBreakdown {
            mel,
            mel_postnet,
            gate,
            total,
        })
    }
}

/// Mean of `softplus(x) - x * z`, stable for large logits.
fn bce_with_logits(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let per_element = (softplus(logits)? - logits.mul(targets)?)?;
    Ok(per_element.mean_all()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn output(mel: &Tensor, gate: Tensor) -> TacotronOutput {
        TacotronOutput {
            mel_outputs: mel.clone(),
            mel_outputs_postnet: mel.clone(),
            gate_outputs: gate,
            alignments: Tensor::zeros((1, 1, 1), DType::F32, mel.device()).unwrap(),
        }
    }

    #[test]
    fn test_gate_targets_keep_last_frame_of_each_step() {
        let dev = Device::Cpu;
        let loss = Tacotron2Loss::new(2).unwrap();
        let gate = Tensor::new(&[[0f32, 0., 0., 0., 0., 0., 1., 1., 1., 1.]], &dev).unwrap();
        let per_step: Vec<Vec<f32>> = loss.gate_targets_per_step(&gate).unwrap().to_vec2().unwrap();
        assert_eq!(per_step, vec![vec![0., 0., 0., 1., 1.]]);
    }

    #[test]
    fn test_zero_logits_give_ln2() {
        let dev = Device::Cpu;
        let mel = Tensor::ones((1, 2, 3), DType::F32, &dev).unwrap();
        let gate_target = Tensor::new(&[[0f32, 0., 1.]], &dev).unwrap();
        let out = output(&mel, Tensor::zeros((1, 3), DType::F32, &dev).unwrap());
        let (m, p, g, total) = Tacotron2Loss::new(1)
            .unwrap()
            .compute(&out, &mel, &gate_target)
            .unwrap()
            .to_scalars()
            .unwrap();
        assert_eq!(m, 0.0);
        assert_eq!(p, 0.0);
        assert!((g - std::f32::consts::LN_2).abs() < 1e-6, "{g}");
        assert!((total - g).abs() < 1e-6);
    }

    #[test]
    fn test_sentinel_logits_are_finite() {
        let dev = Device::Cpu;
        let mel = Tensor::zeros((1, 2, 2), DType::F32, &dev).unwrap();
        let target = Tensor::ones((1, 2, 2), DType::F32, &dev).unwrap();
        let gate = Tensor::new(&[[1e3f32, 1e3]], &dev).unwrap();
        let gate_target = Tensor::ones((1, 2), DType::F32, &dev).unwrap();
        let (m, _, g, total) = Tacotron2Loss::new(1)
            .unwrap()
            .compute(&output(&mel, gate), &target, &gate_target)
            .unwrap()
            .to_scalars()
            .unwrap();
        assert!((m - 1.0).abs() < 1e-6);
        assert!(g.abs() < 1e-6);
        assert!((total - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_mismatched_gate_rejected() {
        let dev = Device::Cpu;
        let mel = Tensor::zeros((1, 2, 4), DType::F32, &dev).unwrap();
        let out = output(&mel, Tensor::zeros((1, 3), DType::F32, &dev).unwrap());
        let gate_target = Tensor::zeros((1, 4), DType::F32, &dev).unwrap();
        let res = Tacotron2Loss::new(2).unwrap().compute(&out, &mel, &gate_target);
        assert!(matches!(res, Err(Error::InvalidInput(_))));
    }
}
