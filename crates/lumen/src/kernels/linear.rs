use super::*;

/// Public, user-facing, zero-sized struct for the projection `input · Wᵀ + b`.
///
/// Runs `linear` or the register-blocked `reg_linear`, as the context's matmul strategy decides.
pub struct LinearOp;

pub struct LinearArgs<'a> {
    pub input: &'a DeviceBuffer,
    /// `[out_features, in_features]`
    pub weight: &'a DeviceBuffer,
    pub bias: Option<&'a DeviceBuffer>,
    pub in_features: usize,
    pub out_features: usize,
    /// Write here instead of allocating. Must not be the input.
    pub output: Option<&'a DeviceBuffer>,
}

impl KernelInvocable for LinearOp {
    type Args<'a> = LinearArgs<'a>;

    fn new(ctx: &Context, args: Self::Args<'_>) -> Result<(KernelCall, DeviceBuffer)> {
        let LinearArgs {
            input,
            weight,
            bias,
            in_features: k,
            out_features: n,
            output,
        } = args;
        if k == 0 || input.len() % k != 0 {
            return Err(EngineError::InvalidShape(format!(
                "linear input of {} values is not a whole number of {k}-feature rows",
                input.len()
            )));
        }
        if weight.len() != n * k {
            return Err(EngineError::mismatch("linear weight", n * k, weight.len()));
        }
        if let Some(bias) = bias
            && bias.len() != n
        {
            return Err(EngineError::mismatch("linear bias", n, bias.len()));
        }
        let m = input.len() / k;
        let output = match output {
            Some(output) if output.same(input) => {
                return Err(EngineError::InvalidArgument("linear input and output must be distinct buffers".into()));
            }
            Some(output) if output.len() != m * n => return Err(EngineError::mismatch("linear output", m * n, output.len())),
            Some(output) => output.clone(),
            None => ctx.alloc(m * n)?,
        };

        let function = if ctx.strategies().matmul.use_blocked(m, k, n) {
            KernelFunction::RegLinear
        } else {
            KernelFunction::Linear
        };
        let call = KernelCall::new(
            function,
            vec![input.into(), weight.into(), bias.into(), (&output).into(), dim(m)?, dim(k)?, dim(n)?],
        );
        Ok((call, output))
    }
}
