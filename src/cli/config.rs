use std::path::PathBuf;

use clap::Parser;
use lumen::context::{ConvStrategy, KernelStrategies, MatmulStrategy};
use tracing::Level;

use super::CliError;

/// Command-line interface configuration for the lumen text-to-image driver
#[derive(Debug, Parser)]
#[command(name = "lumen")]
#[command(about = "Text-to-image diffusion on the lumen execution core", long_about = None)]
pub struct CliConfig {
    /// Directory holding one `.npy` file per weight (falls back to LUMEN_WEIGHTS_DIR)
    #[arg(long, value_name = "DIR")]
    pub weights: Option<PathBuf>,

    /// Prompt as comma or space separated token ids
    #[arg(long, value_name = "IDS", default_value = "")]
    pub tokens: String,

    /// Number of DDIM steps
    #[arg(long, default_value_t = 50)]
    pub steps: usize,

    /// Seed of the initial latent noise
    #[arg(long, default_value_t = lumen::sampler::DEFAULT_SEED)]
    pub seed: u64,

    /// Output file: a binary PPM image, or a `.npy` latent with --latent-only
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Convolution strategy override
    #[arg(long, value_enum, value_name = "STRATEGY")]
    pub conv_strategy: Option<ConvChoice>,

    /// Projection strategy override
    #[arg(long, value_enum, value_name = "STRATEGY")]
    pub matmul_strategy: Option<MatmulChoice>,

    /// Stop after sampling and write the latent
    #[arg(long)]
    pub latent_only: bool,

    /// Release decoder weights stage by stage
    #[arg(long)]
    pub low_memory: bool,

    /// Enable verbose output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum, PartialEq, Eq)]
pub enum ConvChoice {
    /// One pass over the input per output element.
    Direct,
    /// Unfold windows to columns and multiply.
    Im2col,
    /// Pick per layer from the output size.
    Auto,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum, PartialEq, Eq)]
pub enum MatmulChoice {
    Naive,
    Blocked,
    Auto,
}

impl From<ConvChoice> for ConvStrategy {
    fn from(choice: ConvChoice) -> Self {
        match choice {
            ConvChoice::Direct => ConvStrategy::Direct,
            ConvChoice::Im2col => ConvStrategy::Im2Col,
            ConvChoice::Auto => ConvStrategy::Auto,
        }
    }
}

impl From<MatmulChoice> for MatmulStrategy {
    fn from(choice: MatmulChoice) -> Self {
        match choice {
            MatmulChoice::Naive => MatmulStrategy::Naive,
            MatmulChoice::Blocked => MatmulStrategy::Blocked,
            MatmulChoice::Auto => MatmulStrategy::Auto,
        }
    }
}

impl CliConfig {
    pub fn validate(&self) -> Result<(), CliError> {
        if self.steps == 0 || self.steps >= lumen::sampler::TRAIN_TIMESTEPS {
            return Err(CliError::config_error(format!(
                "--steps must be between 1 and {}",
                lumen::sampler::TRAIN_TIMESTEPS - 1
            )));
        }
        if let Some(dir) = &self.weights
            && !dir.is_dir()
        {
            return Err(CliError::file_path_error(dir.display().to_string()));
        }
        Ok(())
    }

    pub fn output_path(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(|| {
            PathBuf::from(if self.latent_only { "latent.npy" } else { "image.ppm" })
        })
    }

    /// Flags take precedence over the environment.
    pub fn strategies(&self, from_env: KernelStrategies) -> KernelStrategies {
        KernelStrategies {
            conv: self.conv_strategy.map_or(from_env.conv, Into::into),
            matmul: self.matmul_strategy.map_or(from_env.matmul, Into::into),
        }
    }

    /// Log level raised by `-v`, never lowered.
    pub fn log_level(&self, configured: Level) -> Level {
        let requested = match self.verbose {
            0 => return configured,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        };
        configured.max(requested)
    }
}

#[cfg(test)]
mod config_test {
    use super::*;

    fn parse(args: &[&str]) -> CliConfig {
        CliConfig::try_parse_from(std::iter::once("lumen").chain(args.iter().copied())).expect("valid arguments")
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);
        assert_eq!(config.steps, 50);
        assert_eq!(config.seed, 42);
        assert_eq!(config.output_path(), PathBuf::from("image.ppm"));
        assert_eq!(config.strategies(KernelStrategies::default()), KernelStrategies::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_flags_override_environment() {
        let config = parse(&["--conv-strategy", "im2col", "--latent-only", "-vv"]);
        let env = KernelStrategies {
            conv: ConvStrategy::Direct,
            matmul: MatmulStrategy::Blocked,
        };
        let chosen = config.strategies(env);
        assert_eq!(chosen.conv, ConvStrategy::Im2Col);
        assert_eq!(chosen.matmul, MatmulStrategy::Blocked);
        assert_eq!(config.output_path(), PathBuf::from("latent.npy"));
        assert_eq!(config.log_level(Level::INFO), Level::TRACE);
        assert_eq!(parse(&[]).log_level(Level::WARN), Level::WARN);
    }

    #[test]
    fn test_validation() {
        assert!(parse(&["--steps", "0"]).validate().is_err());
        assert!(parse(&["--steps", "1000"]).validate().is_err());
        assert!(parse(&["--weights", "/definitely/not/here"]).validate().is_err());
        assert!(CliConfig::try_parse_from(["lumen", "--conv-strategy", "fft"]).is_err());
    }
}
