use std::time::Instant;

use super::{Module, child_name};
use crate::{
    Context, DeviceBuffer, Pending, backend::CompletionToken, context::ConvPath, error::Result, kernels::{Conv2dDirectOp, Conv2dMatmulOp, ConvGeometry, Im2ColOp}, weights::Weight
};

/// Square 2-D convolution over a single `[C, S, S]` image; `S` is inferred from the input.
pub struct Conv2d {
    name: String,
    weight: Weight,
    bias: Weight,
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    downsample: bool,
}

impl Conv2d {
    pub fn new(name: impl Into<String>, in_channels: usize, out_channels: usize, kernel: usize, stride: usize, padding: usize) -> Self {
        let name = name.into();
        Self {
            weight: Weight::new(child_name(&name, "weight"), vec![out_channels, in_channels, kernel, kernel]),
            bias: Weight::new(child_name(&name, "bias"), vec![out_channels]),
            name,
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            downsample: false,
        }
    }

    /// 3×3 stride-2 convolution with padding 1 that halves even spatial sizes.
    pub fn downsample(name: impl Into<String>, channels: usize) -> Self {
        Self {
            downsample: true,
            ..Self::new(name, channels, channels, 3, 2, 1)
        }
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn geometry(&self, input_len: usize) -> Result<ConvGeometry> {
        let infer = if self.downsample { ConvGeometry::infer_downsample } else { ConvGeometry::infer };
        infer(self.in_channels, self.out_channels, self.kernel, self.stride, self.padding, input_len)
    }

    pub fn forward(&self, ctx: &Context, input: &DeviceBuffer, waits: &[CompletionToken]) -> Result<Pending> {
        let started = Instant::now();
        let geometry = self.geometry(input.len())?;
        let weight = self.weight.materialize(ctx)?;
        let bias = self.bias.materialize(ctx)?;

        let path = ctx
            .strategies()
            .conv
            .resolve(geometry.kernel, geometry.stride, geometry.padding, geometry.out_size);
        let (buffer, token) = match path {
            ConvPath::Direct => ctx.call::<Conv2dDirectOp>((input, &weight, Some(&bias), geometry), waits)?,
            ConvPath::Pointwise => ctx.call::<Conv2dMatmulOp>((input, &weight, Some(&bias), geometry), waits)?,
            ConvPath::Im2Col => {
                let (columns, unfolded) = ctx.call::<Im2ColOp>((input, geometry), waits)?;
                ctx.call::<Conv2dMatmulOp>((&columns, &weight, Some(&bias), geometry), &[unfolded])?
            }
        };
        let out = Pending::new(buffer, token);
        ctx.module_output(&self.name, &out, started)?;
        Ok(out)
    }
}

impl Module for Conv2d {
    fn name(&self) -> &str {
        &self.name
    }

    fn visit_weights<'a>(&'a self, visitor: &mut dyn FnMut(&'a Weight)) {
        visitor(&self.weight);
        visitor(&self.bias);
    }
}
