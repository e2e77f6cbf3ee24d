//! Shared building blocks: Xavier-initialised dense/conv layers, an LSTM
//! cell, dropout and softplus.
//!
//! Weight key layout follows the PyTorch checkpoints:
//!
//! ```text
//! {name}.linear_layer.{weight,bias}   — dense layer
//! {name}.conv.{weight,bias}           — 1-D convolution
//! {name}.weight_ih / weight_hh / bias_ih / bias_hh   — LSTM cell (+ suffix)
//! ```

use candle_core::{D, Result, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, Init, Linear, VarBuilder, ops};

/// Activation that follows a layer; sets the Xavier gain used at init.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Gain {
    Linear,
    Relu,
    Tanh,
    Sigmoid,
}

impl Gain {
    pub fn value(self) -> f64 {
        match self {
            Gain::Linear | Gain::Sigmoid => 1.0,
            Gain::Relu => 2f64.sqrt(),
            Gain::Tanh => 5.0 / 3.0,
        }
    }
}

fn xavier(fan_in: usize, fan_out: usize, gain: Gain) -> Init {
    let bound = gain.value() * (6.0 / (fan_in + fan_out) as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

fn default_bias(fan_in: usize) -> Init {
    let bound = 1.0 / (fan_in as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

/// Dense layer with Xavier-uniform weights.
pub fn linear_norm(
    in_dim: usize,
    out_dim: usize,
    bias: bool,
    gain: Gain,
    vb: VarBuilder,
) -> Result<Linear> {
    let vb = vb.pp("linear_layer");
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", xavier(in_dim, out_dim, gain))?;
    let bias = if bias {
        Some(vb.get_with_hints(out_dim, "bias", default_bias(in_dim))?)
    } else {
        None
    };
    Ok(Linear::new(weight, bias))
}

/// Same-padded 1-D convolution with Xavier-uniform weights.
///
/// `kernel_size` must be odd so the output keeps the input length.
pub fn conv_norm(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    bias: bool,
    gain: Gain,
    vb: VarBuilder,
) -> Result<Conv1d> {
    let vb = vb.pp("conv");
    let init = xavier(in_channels * kernel_size, out_channels * kernel_size, gain);
    let weight = vb.get_with_hints((out_channels, in_channels, kernel_size), "weight", init)?;
    let bias = if bias {
        Some(vb.get_with_hints(out_channels, "bias", default_bias(in_channels * kernel_size))?)
    } else {
        None
    };
    let cfg = Conv1dConfig {
        padding: (kernel_size - 1) / 2,
        ..Default::default()
    };
    Ok(Conv1d::new(weight, bias, cfg))
}

/// Dropout that is a no-op unless `active`.
pub fn dropout(xs: &Tensor, p: f64, active: bool) -> Result<Tensor> {
    if active && p > 0.0 {
        ops::dropout(xs, p as f32)
    } else {
        Ok(xs.clone())
    }
}

/// `log(1 + exp(x))`, computed as `relu(x) + log1p(exp(-|x|))`.
pub fn softplus(xs: &Tensor) -> Result<Tensor> {
    let tail = (xs.abs()?.neg()?.exp()? + 1.0)?.log()?;
    xs.relu()? + tail
}

/// Single LSTM cell, gate order (i, f, g, o).
#[derive(Debug, Clone)]
pub struct LstmCell {
    w_ih: Tensor, // [4H, in]
    w_hh: Tensor, // [4H, H]
    b_ih: Tensor, // [4H]
    b_hh: Tensor, // [4H]
    hidden_size: usize,
}

impl LstmCell {
    /// Load a cell; `suffix` distinguishes stacked/reverse weights
    /// (`""` for `nn.LSTMCell`, `"_l0"` / `"_l0_reverse"` for `nn.LSTM`).
    pub fn new(input_size: usize, hidden_size: usize, suffix: &str, vb: VarBuilder) -> Result<Self> {
        let bound = 1.0 / (hidden_size as f64).sqrt();
        let init = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let gates = 4 * hidden_size;
        let w_ih = vb.get_with_hints((gates, input_size), &format!("weight_ih{suffix}"), init)?;
        let w_hh = vb.get_with_hints((gates, hidden_size), &format!("weight_hh{suffix}"), init)?;
        let b_ih = vb.get_with_hints(gates, &format!("bias_ih{suffix}"), init)?;
        let b_hh = vb.get_with_hints(gates, &format!("bias_hh{suffix}"), init)?;
        Ok(Self {
            w_ih,
            w_hh,
            b_ih,
            b_hh,
            hidden_size,
        })
    }

    /// One step: `x [B, in]`, `(h, c) [B, H]` → `(h', c')`.
    pub fn step(&self, x: &Tensor, h: &Tensor, c: &Tensor) -> Result<(Tensor, Tensor)> {
        let gates = x
            .matmul(&self.w_ih.t()?)?
            .broadcast_add(&self.b_ih)?
            .add(&h.matmul(&self.w_hh.t()?)?)?
            .broadcast_add(&self.b_hh)?;
        let chunks = gates.chunk(4, D::Minus1)?;
        let i = ops::sigmoid(&chunks[0])?;
        let f = ops::sigmoid(&chunks[1])?;
        let g = chunks[2].tanh()?;
        let o = ops::sigmoid(&chunks[3])?;

        let c_next = ((f * c)? + (i * g)?)?;
        let h_next = (o * c_next.tanh()?)?;
        Ok((h_next, c_next))
    }

    /// Run over `xs [B, T, in]` from zero state, returning `[B, T, H]`.
    pub fn run(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, t, _) = xs.dims3()?;
        let mut h = Tensor::zeros((b, self.hidden_size), xs.dtype(), xs.device())?;
        let mut c = h.clone();
        let mut outputs = Vec::with_capacity(t);
        for step in 0..t {
            let x = xs.narrow(1, step, 1)?.squeeze(1)?.contiguous()?;
            (h, c) = self.step(&x, &h, &c)?;
            outputs.push(h.clone());
        }
        Tensor::stack(&outputs, 1)
    }
}
