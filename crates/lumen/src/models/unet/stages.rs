//! The stage table: which layers make up each U-Net stage, derived from the config.

use super::UnetConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerPlan {
    ConvIn { in_channels: usize, out_channels: usize },
    Res { in_channels: usize, out_channels: usize },
    Transformer { channels: usize },
    /// Stride-2 3×3 conv, stored as `op`.
    Downsample { channels: usize },
    Upsample { channels: usize },
}

impl LayerPlan {
    pub fn out_channels(&self) -> usize {
        match *self {
            LayerPlan::ConvIn { out_channels, .. } | LayerPlan::Res { out_channels, .. } => out_channels,
            LayerPlan::Transformer { channels } | LayerPlan::Downsample { channels } | LayerPlan::Upsample { channels } => channels,
        }
    }
}

/// Input, middle and output stages.
///
/// Every input stage leaves one skip activation; every output stage consumes the most
/// recent one, concatenated after its input along the channel axis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageTable {
    pub input: Vec<Vec<LayerPlan>>,
    pub middle: Vec<LayerPlan>,
    pub output: Vec<Vec<LayerPlan>>,
}

impl StageTable {
    pub fn build(config: &UnetConfig) -> Self {
        let mc = config.model_channels;
        let levels = config.channel_mult.len();
        let attends = |level: usize| config.attention_levels.get(level).copied().unwrap_or(false);

        let mut input = vec![vec![LayerPlan::ConvIn {
            in_channels: config.in_channels,
            out_channels: mc,
        }]];
        let mut skips = vec![mc];
        let mut ch = mc;
        for (level, mult) in config.channel_mult.iter().enumerate() {
            for _ in 0..config.num_res_blocks {
                let mut stage = vec![LayerPlan::Res {
                    in_channels: ch,
                    out_channels: mult * mc,
                }];
                ch = mult * mc;
                if attends(level) {
                    stage.push(LayerPlan::Transformer { channels: ch });
                }
                input.push(stage);
                skips.push(ch);
            }
            if level + 1 != levels {
                input.push(vec![LayerPlan::Downsample { channels: ch }]);
                skips.push(ch);
            }
        }

        let middle = vec![
            LayerPlan::Res {
                in_channels: ch,
                out_channels: ch,
            },
            LayerPlan::Transformer { channels: ch },
            LayerPlan::Res {
                in_channels: ch,
                out_channels: ch,
            },
        ];

        let mut output = Vec::with_capacity(input.len());
        for (level, mult) in config.channel_mult.iter().enumerate().rev() {
            for i in 0..=config.num_res_blocks {
                let skip = skips.pop().unwrap_or_default();
                let mut stage = vec![LayerPlan::Res {
                    in_channels: ch + skip,
                    out_channels: mult * mc,
                }];
                ch = mult * mc;
                if attends(level) {
                    stage.push(LayerPlan::Transformer { channels: ch });
                }
                if level != 0 && i == config.num_res_blocks {
                    stage.push(LayerPlan::Upsample { channels: ch });
                }
                output.push(stage);
            }
        }

        Self { input, middle, output }
    }

    /// Channel count of every skip activation, in the order the output stages consume them.
    pub fn skip_channels(&self) -> Vec<usize> {
        self.input
            .iter()
            .rev()
            .filter_map(|stage| stage.last().map(LayerPlan::out_channels))
            .collect()
    }

    /// Channels leaving the last output stage.
    pub fn out_channels(&self) -> usize {
        self.output
            .last()
            .and_then(|stage| stage.last())
            .map_or(0, LayerPlan::out_channels)
    }
}

#[cfg(test)]
mod stages_test {
    use super::*;

    #[test]
    fn test_default_table_matches_reference_layout() {
        let table = StageTable::build(&UnetConfig::default());
        assert_eq!((table.input.len(), table.middle.len(), table.output.len()), (12, 3, 12));
        assert_eq!(table.input[3], vec![LayerPlan::Downsample { channels: 320 }]);
        assert_eq!(table.input[10], vec![LayerPlan::Res {
            in_channels: 1280,
            out_channels: 1280
        }]);

        let concat_in: Vec<usize> = table
            .output
            .iter()
            .map(|stage| match stage[0] {
                LayerPlan::Res { in_channels, .. } => in_channels,
                other => panic!("output stage starts with {other:?}"),
            })
            .collect();
        assert_eq!(concat_in, vec![2560, 2560, 2560, 2560, 2560, 1920, 1920, 1280, 960, 960, 640, 640]);

        let upsampled: Vec<usize> = table
            .output
            .iter()
            .enumerate()
            .filter(|(_, stage)| matches!(stage.last(), Some(LayerPlan::Upsample { .. })))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(upsampled, vec![2, 5, 8]);
        assert_eq!(table.out_channels(), 320);
    }

    #[test]
    fn test_skips_pair_with_output_stages() {
        let config = UnetConfig::tiny();
        let table = StageTable::build(&config);
        let skips = table.skip_channels();
        assert_eq!(skips.len(), table.output.len());

        let mut ch = table.middle[2].out_channels();
        for (stage, skip) in table.output.iter().zip(skips) {
            let LayerPlan::Res { in_channels, out_channels } = stage[0] else {
                panic!("output stage must start with a residual block");
            };
            assert_eq!(in_channels, ch + skip);
            ch = out_channels;
        }
    }
}
