use std::time::Instant;

use super::{Module, child_name};
use crate::{
    Context, DeviceBuffer, Pending, backend::CompletionToken, error::Result, kernels::{LinearArgs, LinearOp}, weights::Weight
};

/// `output = input · Wᵀ + b` over rows of `in_features`.
pub struct Linear {
    name: String,
    weight: Weight,
    bias: Option<Weight>,
    in_features: usize,
    out_features: usize,
}

impl Linear {
    /// Weights `{name}.weight` `[out, in]` and, with `bias`, `{name}.bias` `[out]`.
    pub fn new(name: impl Into<String>, in_features: usize, out_features: usize, bias: bool) -> Self {
        let name = name.into();
        let weight_name = child_name(&name, "weight");
        let bias_name = bias.then(|| child_name(&name, "bias"));
        Self::with_names(name, weight_name, bias_name, in_features, out_features)
    }

    pub fn with_names(
        name: impl Into<String>,
        weight_name: impl Into<String>,
        bias_name: Option<String>,
        in_features: usize,
        out_features: usize,
    ) -> Self {
        Self {
            name: name.into(),
            weight: Weight::new(weight_name, vec![out_features, in_features]),
            bias: bias_name.map(|bias| Weight::new(bias, vec![out_features])),
            in_features,
            out_features,
        }
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn forward(&self, ctx: &Context, input: &DeviceBuffer, waits: &[CompletionToken]) -> Result<Pending> {
        self.run(ctx, input, None, waits)
    }

    /// Write into a caller-owned buffer, which must differ from `input`.
    pub fn forward_into(&self, ctx: &Context, input: &DeviceBuffer, output: &DeviceBuffer, waits: &[CompletionToken]) -> Result<Pending> {
        self.run(ctx, input, Some(output), waits)
    }

    fn run(&self, ctx: &Context, input: &DeviceBuffer, output: Option<&DeviceBuffer>, waits: &[CompletionToken]) -> Result<Pending> {
        let started = Instant::now();
        let weight = self.weight.materialize(ctx)?;
        let bias = self.bias.as_ref().map(|bias| bias.materialize(ctx)).transpose()?;
        let (buffer, token) = ctx.call::<LinearOp>(
            LinearArgs {
                input,
                weight: &weight,
                bias: bias.as_ref(),
                in_features: self.in_features,
                out_features: self.out_features,
                output,
            },
            waits,
        )?;
        let out = Pending::new(buffer, token);
        ctx.module_output(&self.name, &out, started)?;
        Ok(out)
    }
}

impl Module for Linear {
    fn name(&self) -> &str {
        &self.name
    }

    fn visit_weights<'a>(&'a self, visitor: &mut dyn FnMut(&'a Weight)) {
        visitor(&self.weight);
        if let Some(bias) = &self.bias {
            visitor(bias);
        }
    }
}

#[cfg(test)]
mod linear_test {
    use super::*;
    use crate::{
        ErrorKind, nn::test_util::{assert_close, host_ctx, random_store, random_vec}, weights::WeightStore
    };

    #[test]
    fn test_forward_matches_reference() {
        let linear = Linear::new("proj", 8, 3, true);
        let store = random_store(&linear, 1);
        let w = store.load("proj.weight").unwrap().data;
        let b = store.load("proj.bias").unwrap().data;
        let ctx = host_ctx(store);

        let x = random_vec(5 * 8, 2);
        let input = ctx.upload(&x).unwrap();
        let out = linear.forward(&ctx, &input, &[]).unwrap();
        let actual = ctx.read(&out.buffer, &out.waits()).unwrap();

        let expected: Vec<f32> = x
            .chunks(8)
            .flat_map(|row| (0..3).map(|o| row.iter().zip(&w[o * 8..(o + 1) * 8]).map(|(a, c)| a * c).sum::<f32>() + b[o]).collect::<Vec<_>>())
            .collect();
        assert_close(&actual, &expected, 1e-4);
    }

    #[test]
    fn test_rejects_partial_rows_and_aliasing() {
        let linear = Linear::new("q", 4, 4, false);
        let ctx = host_ctx(random_store(&linear, 3));
        let ragged = ctx.upload(&[1.0; 6]).unwrap();
        assert_eq!(linear.forward(&ctx, &ragged, &[]).unwrap_err().kind(), ErrorKind::ShapeMismatch);

        let input = ctx.upload(&[1.0; 8]).unwrap();
        assert!(linear.forward_into(&ctx, &input, &input, &[]).is_err());
        let output = ctx.alloc(8).unwrap();
        let out = linear.forward_into(&ctx, &input, &output, &[]).unwrap();
        assert!(out.buffer.same(&output));
    }

    #[test]
    fn test_declares_weights_by_name() {
        let with_bias = Linear::new("mlp.c_fc", 2, 8, true);
        let names: Vec<_> = with_bias.weights().iter().map(|w| w.name().to_string()).collect();
        assert_eq!(names, vec!["mlp.c_fc.weight", "mlp.c_fc.bias"]);
        assert_eq!(with_bias.weight_bytes(), (16 + 8) * 4);
        assert_eq!(Linear::new("to_k", 2, 2, false).weights().len(), 1);
    }
}
