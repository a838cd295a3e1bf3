use super::*;

/// Square convolution geometry derived from a buffer size and the layer's parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConvGeometry {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
    pub size: usize,
    pub out_size: usize,
}

impl ConvGeometry {
    /// Infer the spatial size from `input_len` elements of `[in_channels, S, S]`.
    ///
    /// `(S + 2·padding − kernel)` must be a multiple of `stride`.
    pub fn infer(in_channels: usize, out_channels: usize, kernel: usize, stride: usize, padding: usize, input_len: usize) -> Result<Self> {
        Self::infer_with_slack(in_channels, out_channels, kernel, stride, padding, input_len, 0)
    }

    /// Like [`ConvGeometry::infer`], but windows may stop short of the trailing padding.
    ///
    /// This is the stride-2 downsampling case (`64 + 2 − 3 = 63`): the untouched remainder
    /// lies entirely inside the zero padding, so no input value is dropped.
    pub fn infer_downsample(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        input_len: usize,
    ) -> Result<Self> {
        Self::infer_with_slack(in_channels, out_channels, kernel, stride, padding, input_len, padding)
    }

    fn infer_with_slack(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        input_len: usize,
        slack: usize,
    ) -> Result<Self> {
        if in_channels == 0 || input_len % in_channels != 0 {
            return Err(EngineError::InvalidShape(format!(
                "conv input of {input_len} values does not split into {in_channels} channels"
            )));
        }
        let area = input_len / in_channels;
        let size = area.isqrt();
        if size * size != area {
            return Err(EngineError::InvalidShape(format!("conv channel plane of {area} values is not square")));
        }
        let padded = size + 2 * padding;
        if stride == 0 || padded < kernel || (padded - kernel) % stride > slack {
            return Err(EngineError::InvalidShape(format!(
                "conv window {kernel} with stride {stride} does not tile a padded size of {padded}"
            )));
        }
        Ok(Self {
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            size,
            out_size: (padded - kernel) / stride + 1,
        })
    }

    pub fn positions(&self) -> usize {
        self.out_size * self.out_size
    }

    /// Rows of the unfolded column matrix.
    pub fn depth(&self) -> usize {
        self.in_channels * self.kernel * self.kernel
    }

    pub fn output_len(&self) -> usize {
        self.out_channels * self.positions()
    }

    fn check_operands(&self, weight: &DeviceBuffer, bias: Option<&DeviceBuffer>) -> Result<()> {
        if weight.len() != self.out_channels * self.depth() {
            return Err(EngineError::mismatch("conv2d weight", self.out_channels * self.depth(), weight.len()));
        }
        if let Some(bias) = bias
            && bias.len() != self.out_channels
        {
            return Err(EngineError::mismatch("conv2d bias", self.out_channels, bias.len()));
        }
        Ok(())
    }
}

/// Direct convolution (`conv2d`).
pub struct Conv2dDirectOp;

impl KernelInvocable for Conv2dDirectOp {
    type Args<'a> = (&'a DeviceBuffer, &'a DeviceBuffer, Option<&'a DeviceBuffer>, ConvGeometry);

    fn new(ctx: &Context, args: Self::Args<'_>) -> Result<(KernelCall, DeviceBuffer)> {
        let (input, weight, bias, geometry) = args;
        if input.len() != geometry.in_channels * geometry.size * geometry.size {
            return Err(EngineError::mismatch("conv2d input", geometry.in_channels * geometry.size * geometry.size, input.len()));
        }
        geometry.check_operands(weight, bias)?;
        let output = ctx.alloc(geometry.output_len())?;
        let call = KernelCall::new(
            KernelFunction::Conv2d,
            vec![
                input.into(),
                weight.into(),
                bias.into(),
                (&output).into(),
                dim(geometry.in_channels)?,
                dim(geometry.out_channels)?,
                dim(geometry.size)?,
                dim(geometry.kernel)?,
                dim(geometry.stride)?,
                dim(geometry.padding)?,
                dim(geometry.out_size)?,
            ],
        );
        Ok((call, output))
    }
}

/// Unfold convolution windows into columns (`im2col`).
pub struct Im2ColOp;

impl KernelInvocable for Im2ColOp {
    type Args<'a> = (&'a DeviceBuffer, ConvGeometry);

    fn new(ctx: &Context, args: Self::Args<'_>) -> Result<(KernelCall, DeviceBuffer)> {
        let (input, geometry) = args;
        let columns = ctx.alloc(geometry.depth() * geometry.positions())?;
        let call = KernelCall::new(
            KernelFunction::Im2Col,
            vec![
                input.into(),
                (&columns).into(),
                dim(geometry.in_channels)?,
                dim(geometry.size)?,
                dim(geometry.kernel)?,
                dim(geometry.stride)?,
                dim(geometry.padding)?,
                dim(geometry.out_size)?,
            ],
        );
        Ok((call, columns))
    }
}

/// Weight × column matrix plus bias (`conv2d_matmul`).
pub struct Conv2dMatmulOp;

impl KernelInvocable for Conv2dMatmulOp {
    type Args<'a> = (&'a DeviceBuffer, &'a DeviceBuffer, Option<&'a DeviceBuffer>, ConvGeometry);

    fn new(ctx: &Context, args: Self::Args<'_>) -> Result<(KernelCall, DeviceBuffer)> {
        let (columns, weight, bias, geometry) = args;
        if columns.len() != geometry.depth() * geometry.positions() {
            return Err(EngineError::mismatch("conv2d columns", geometry.depth() * geometry.positions(), columns.len()));
        }
        geometry.check_operands(weight, bias)?;
        let output = ctx.alloc(geometry.output_len())?;
        let call = KernelCall::new(
            KernelFunction::Conv2dMatmul,
            vec![
                columns.into(),
                weight.into(),
                bias.into(),
                (&output).into(),
                dim(geometry.out_channels)?,
                dim(geometry.depth())?,
                dim(geometry.positions())?,
            ],
        );
        Ok((call, output))
    }
}
