//! Runtime-selectable kernel strategies.

use std::str::FromStr;

use lumen_env::{CONV_STRATEGY, MATMUL_STRATEGY};
use tracing::warn;

/// Output positions at or above which `Auto` convolution unfolds to a matrix product.
const IM2COL_MIN_POSITIONS: usize = 256;
/// Multiply-accumulate count at or above which `Auto` projections use the blocked kernel.
const BLOCKED_MIN_MACS: usize = 1 << 18;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConvStrategy {
    /// One pass over the input per output element.
    Direct,
    /// Unfold windows with `im2col` and multiply with `conv2d_matmul`.
    Im2Col,
    /// Choose from the operand shape.
    #[default]
    Auto,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MatmulStrategy {
    Naive,
    /// Register-blocked rows (`reg_linear`).
    Blocked,
    #[default]
    Auto,
}

/// A conv strategy after `Auto` has been decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConvPath {
    Direct,
    /// 1×1, stride 1, no padding: the input already is the column matrix.
    Pointwise,
    Im2Col,
}

impl FromStr for ConvStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(ConvStrategy::Direct),
            "im2col" | "unfold" => Ok(ConvStrategy::Im2Col),
            "auto" => Ok(ConvStrategy::Auto),
            other => Err(format!("unknown convolution strategy '{other}'")),
        }
    }
}

impl FromStr for MatmulStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "naive" => Ok(MatmulStrategy::Naive),
            "blocked" | "reg" => Ok(MatmulStrategy::Blocked),
            "auto" => Ok(MatmulStrategy::Auto),
            other => Err(format!("unknown matmul strategy '{other}'")),
        }
    }
}

impl ConvStrategy {
    pub fn resolve(self, kernel: usize, stride: usize, padding: usize, out_size: usize) -> ConvPath {
        if kernel == 1 && stride == 1 && padding == 0 && self != ConvStrategy::Direct {
            return ConvPath::Pointwise;
        }
        match self {
            ConvStrategy::Direct => ConvPath::Direct,
            ConvStrategy::Im2Col => ConvPath::Im2Col,
            ConvStrategy::Auto if out_size * out_size >= IM2COL_MIN_POSITIONS => ConvPath::Im2Col,
            ConvStrategy::Auto => ConvPath::Direct,
        }
    }
}

impl MatmulStrategy {
    /// True when the blocked kernel should run for an `[m, k] x [k, n]` product.
    pub fn use_blocked(self, m: usize, k: usize, n: usize) -> bool {
        match self {
            MatmulStrategy::Naive => false,
            MatmulStrategy::Blocked => true,
            MatmulStrategy::Auto => m >= 4 && m.saturating_mul(k).saturating_mul(n) >= BLOCKED_MIN_MACS,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KernelStrategies {
    pub conv: ConvStrategy,
    pub matmul: MatmulStrategy,
}

impl KernelStrategies {
    /// Strategies from `LUMEN_CONV_STRATEGY` / `LUMEN_MATMUL_STRATEGY`; unset or unknown
    /// values fall back to `Auto`.
    pub fn from_env() -> Self {
        Self {
            conv: detect(CONV_STRATEGY.get()),
            matmul: detect(MATMUL_STRATEGY.get()),
        }
    }
}

fn detect<T: FromStr<Err = String> + Default>(value: Result<Option<String>, lumen_env::EnvVarError>) -> T {
    match value {
        Ok(Some(name)) if !name.is_empty() => name.parse().unwrap_or_else(|err: String| {
            warn!("{err}, using auto");
            T::default()
        }),
        Ok(_) => T::default(),
        Err(err) => {
            warn!(%err, "failed to read strategy override");
            T::default()
        }
    }
}

#[cfg(test)]
mod strategy_test {
    use serial_test::serial;

    use super::*;

    #[test]
    fn test_auto_conv_follows_shape() {
        assert_eq!(ConvStrategy::Auto.resolve(3, 1, 1, 64), ConvPath::Im2Col);
        assert_eq!(ConvStrategy::Auto.resolve(3, 2, 1, 8), ConvPath::Direct);
        assert_eq!(ConvStrategy::Auto.resolve(1, 1, 0, 8), ConvPath::Pointwise);
        assert_eq!(ConvStrategy::Direct.resolve(1, 1, 0, 64), ConvPath::Direct);
        assert_eq!(ConvStrategy::Im2Col.resolve(3, 1, 1, 2), ConvPath::Im2Col);
    }

    #[test]
    fn test_auto_matmul_follows_shape() {
        assert!(!MatmulStrategy::Auto.use_blocked(2, 4, 4));
        assert!(MatmulStrategy::Auto.use_blocked(4096, 320, 320));
        assert!(MatmulStrategy::Blocked.use_blocked(1, 1, 1));
        assert!(!MatmulStrategy::Naive.use_blocked(4096, 320, 320));
    }

    #[test]
    #[serial]
    fn test_strategies_read_environment() {
        let _conv = CONV_STRATEGY.set_guard("Direct".to_string()).unwrap();
        let _matmul = MATMUL_STRATEGY.set_guard("bogus".to_string()).unwrap();
        let strategies = KernelStrategies::from_env();
        assert_eq!(strategies.conv, ConvStrategy::Direct);
        assert_eq!(strategies.matmul, MatmulStrategy::Auto);
    }
}
