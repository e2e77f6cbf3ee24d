//! Tacotron 2 CLI: symbols → refined mel spectrogram.
//!
//! Loads a safetensors checkpoint (or builds a randomly initialised model
//! when `--weights` is omitted), decodes one symbol sequence free-running,
//! and writes the postnet mel `[n_mel, T]` as `.npy`.
//!
//! # Output
//!
//! Prints a one-line JSON summary to stdout on success:
//!
//! ```json
//! {"path":"/tmp/mel.npy","frames":412,"steps":412,"stop_reason":"gate_threshold"}
//! ```

use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use tacotron_gmm::config::{ED_CHANNELS, HParams};
use tacotron_gmm::model::Tacotron2;

#[derive(Parser, Debug)]
#[command(
    name = "tacotron-synth",
    about = "Tacotron 2 text-to-mel synthesis",
    long_about = "Decode a symbol sequence into a mel spectrogram.\n\
                  The refined mel is written to --output as .npy; a JSON summary line is printed to stdout."
)]
struct Args {
    /// Hyper-parameter JSON file. Missing fields take their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Safetensors checkpoint. Omit for a randomly initialised model.
    #[arg(long, short = 'w')]
    weights: Option<PathBuf>,

    /// Comma-separated symbol ids, e.g. "12,40,7".
    #[arg(long, short = 's', required_unless_present = "print_config")]
    symbols: Option<String>,

    /// Emotion/intensity features as a `[12, S]` .npy file. Zeros if omitted.
    #[arg(long)]
    ed: Option<PathBuf>,

    /// Output .npy path for the refined mel.
    #[arg(long, short = 'o', required_unless_present = "print_config")]
    output: Option<PathBuf>,

    /// Run on CPU even if a GPU is available.
    #[arg(long)]
    cpu: bool,

    /// Print the effective hyper-parameters as JSON and exit.
    #[arg(long)]
    print_config: bool,
}

fn parse_symbols(s: &str) -> anyhow::Result<Vec<u32>> {
    let ids = s
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| t.parse::<u32>().map_err(|e| anyhow::anyhow!("bad symbol id '{t}': {e}")))
        .collect::<anyhow::Result<Vec<_>>>()?;
    if ids.is_empty() {
        anyhow::bail!("no symbol ids given");
    }
    Ok(ids)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let hparams = match &args.config {
        Some(path) => HParams::from_json_file(path)
            .map_err(|e| anyhow::anyhow!("failed to load config {}: {e}", path.display()))?,
        None => HParams::default(),
    };

    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&hparams)?);
        return Ok(());
    }

    let (Some(symbols), Some(output)) = (&args.symbols, &args.output) else {
        anyhow::bail!("--symbols and --output are required");
    };
    let symbols = parse_symbols(symbols)?;

    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };
    let dtype = DType::F32;
    tracing::info!("Using device: {:?}", device);

    let varmap = VarMap::new();
    let model = match &args.weights {
        Some(path) => Tacotron2::from_safetensors(&hparams, path, dtype, &device)?,
        None => {
            tracing::warn!("no --weights given, using a randomly initialised model");
            Tacotron2::new(&hparams, VarBuilder::from_varmap(&varmap, dtype, &device))?
        }
    };

    let s = symbols.len();
    let text = Tensor::from_vec(symbols, (1, s), &device)?;
    let ed = match &args.ed {
        Some(path) => {
            let ed = Tensor::read_npy(path)?.to_dtype(dtype)?.to_device(&device)?;
            if ed.dims() != [ED_CHANNELS, s] {
                anyhow::bail!(
                    "ed features have shape {:?}, expected [{ED_CHANNELS}, {s}]",
                    ed.dims()
                );
            }
            ed.unsqueeze(0)?
        }
        None => Tensor::zeros((1, ED_CHANNELS, s), dtype, &device)?,
    };

    tracing::info!("Decoding {} symbols with {} attention...", s, hparams.attention_type);
    let out = model
        .inference(&text, &ed)
        .map_err(|e| anyhow::anyhow!("inference failed: {e}"))?;

    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mel = out.mel_outputs_postnet.squeeze(0)?.to_device(&Device::Cpu)?;
    mel.write_npy(output)?;

    let summary = serde_json::json!({
        "path": output.display().to_string(),
        "frames": mel.dim(1)?,
        "steps": out.steps,
        "stop_reason": out.stop_reason.to_string(),
    });
    println!("{summary}");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_symbols() {
        assert_eq!(parse_symbols("1, 2,3").unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_symbols("7,").unwrap(), vec![7]);
        assert!(parse_symbols("").is_err());
        assert!(parse_symbols("1,x").is_err());
    }
}
