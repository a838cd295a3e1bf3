use std::{fs, path::Path, sync::Arc, time::Instant};

use anyhow::{Context as _, Result};
use clap::Parser;
use lumen::{
    Context, KernelStrategies, Pipeline, PipelineConfig, TokenIdTokenizer, Tokenizer, models::to_rgb8, weights::{NpyDirectory, save_npy}
};
use lumen_env::WEIGHTS_DIR;
use lumen_instrumentation::{AppConfig, init_tracing};
use tracing::info;

mod cli;

use cli::{CliConfig, CliError};

fn main() -> Result<()> {
    let cli = CliConfig::parse();
    cli.validate()?;

    let mut app_config = AppConfig::from_env()?;
    app_config.log_level = cli.log_level(app_config.log_level);
    let app_config = AppConfig::initialise(app_config)?;
    init_tracing(app_config)?;

    let weights = match &cli.weights {
        Some(dir) => dir.clone(),
        None => WEIGHTS_DIR
            .get()?
            .ok_or_else(|| CliError::missing_argument(format!("--weights or {}", WEIGHTS_DIR.key())))?,
    };
    if !weights.is_dir() {
        return Err(CliError::file_path_error(weights.display().to_string()).into());
    }

    let strategies = cli.strategies(KernelStrategies::from_env());
    let ctx = Context::host(Arc::new(NpyDirectory::new(&weights))).with_strategies(strategies);
    let pipeline = Pipeline::new(PipelineConfig {
        seed: cli.seed,
        release_decoder_stages: cli.low_memory,
        ..PipelineConfig::default()
    })?;
    info!(weights = %weights.display(), ?strategies, steps = cli.steps, seed = cli.seed, "starting generation");

    let started = Instant::now();
    let tokens = TokenIdTokenizer.encode(&cli.tokens)?;
    let cond = pipeline.encode(&ctx, &tokens)?;
    let latent = pipeline.sample(&ctx, &cond, cli.steps, None)?;

    let output = cli.output_path();
    if cli.latent_only {
        let [channels, height, width] = pipeline.latent_shape();
        save_npy(&output, &[channels, height, width], &latent)
            .with_context(|| format!("writing latent to {}", output.display()))?;
    } else {
        let pixels = pipeline.decode(&ctx, &latent)?;
        write_ppm(&output, &to_rgb8(&pixels)?)?;
    }
    info!(output = %output.display(), elapsed_ms = started.elapsed().as_millis() as u64, "generation finished");
    Ok(())
}

/// Binary PPM of a square image given as interleaved RGB bytes.
fn write_ppm(path: &Path, rgb: &[u8]) -> Result<()> {
    let side = (rgb.len() / 3).isqrt();
    if side * side * 3 != rgb.len() {
        anyhow::bail!("{} bytes do not form a square RGB image", rgb.len());
    }
    let mut bytes = format!("P6\n{side} {side}\n255\n").into_bytes();
    bytes.extend_from_slice(rgb);
    fs::write(path, bytes).with_context(|| format!("writing image to {}", path.display()))
}
