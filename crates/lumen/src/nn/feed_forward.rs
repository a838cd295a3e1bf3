use std::time::Instant;

use super::{Linear, Module, child_name};
use crate::{
    Context, DeviceBuffer, Pending, backend::CompletionToken, error::Result, kernels::GeluMultiplyOp, weights::Weight
};

/// Gated GELU: project to `2·inner`, then `value · gelu(gate)`.
pub struct Geglu {
    name: String,
    proj: Linear,
    inner: usize,
}

impl Geglu {
    pub fn new(name: impl Into<String>, dim: usize, inner: usize) -> Self {
        let name = name.into();
        Self {
            proj: Linear::new(child_name(&name, "proj"), dim, 2 * inner, true),
            name,
            inner,
        }
    }

    pub fn forward(&self, ctx: &Context, x: &DeviceBuffer, waits: &[CompletionToken]) -> Result<Pending> {
        let started = Instant::now();
        let projected = self.proj.forward(ctx, x, waits)?;
        let (buffer, token) = ctx.call::<GeluMultiplyOp>((&projected.buffer, self.inner), &projected.waits())?;
        let out = Pending::new(buffer, token);
        ctx.module_output(&self.name, &out, started)?;
        Ok(out)
    }
}

impl Module for Geglu {
    fn name(&self) -> &str {
        &self.name
    }

    fn visit_weights<'a>(&'a self, visitor: &mut dyn FnMut(&'a Weight)) {
        self.proj.visit_weights(visitor);
    }
}

/// `net.0` (GEGLU to `4·dim`) followed by `net.2` (back to `dim`).
pub struct FeedForward {
    name: String,
    geglu: Geglu,
    out: Linear,
}

impl FeedForward {
    pub const MULTIPLIER: usize = 4;

    pub fn new(name: impl Into<String>, dim: usize) -> Self {
        let name = name.into();
        let inner = dim * Self::MULTIPLIER;
        Self {
            geglu: Geglu::new(child_name(&name, "net.0"), dim, inner),
            out: Linear::new(child_name(&name, "net.2"), inner, dim, true),
            name,
        }
    }

    pub fn forward(&self, ctx: &Context, x: &DeviceBuffer, waits: &[CompletionToken]) -> Result<Pending> {
        let started = Instant::now();
        let gated = self.geglu.forward(ctx, x, waits)?;
        let out = self.out.forward(ctx, &gated.buffer, &gated.waits())?;
        ctx.module_output(&self.name, &out, started)?;
        Ok(out)
    }
}

impl Module for FeedForward {
    fn name(&self) -> &str {
        &self.name
    }

    fn visit_weights<'a>(&'a self, visitor: &mut dyn FnMut(&'a Weight)) {
        self.geglu.visit_weights(visitor);
        self.out.visit_weights(visitor);
    }
}

#[cfg(test)]
mod feed_forward_test {
    use super::*;
    use crate::nn::test_util::{host_ctx, random_store, random_vec};

    #[test]
    fn test_feed_forward_shapes_and_names() {
        let ff = FeedForward::new("ff", 4);
        let names: Vec<_> = ff.weights().iter().map(|w| (w.name().to_string(), w.shape().to_vec())).collect();
        assert_eq!(
            names,
            vec![
                ("ff.net.0.proj.weight".to_string(), vec![32, 4]),
                ("ff.net.0.proj.bias".to_string(), vec![32]),
                ("ff.net.2.weight".to_string(), vec![4, 16]),
                ("ff.net.2.bias".to_string(), vec![4]),
            ]
        );

        let ctx = host_ctx(random_store(&ff, 3));
        let input = ctx.upload(&random_vec(3 * 4, 4)).unwrap();
        let out = ff.forward(&ctx, &input, &[]).unwrap();
        let values = ctx.read(&out.buffer, &out.waits()).unwrap();
        assert_eq!(values.len(), 12);
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_geglu_gates_value_half() {
        let geglu = Geglu::new("gate", 1, 1);
        let mut store = crate::weights::MemoryWeightStore::new();
        // value = x, gate = 2x
        store.insert("gate.proj.weight", vec![2, 1], vec![1.0, 2.0]);
        store.insert("gate.proj.bias", vec![2], vec![0.0, 0.0]);
        let ctx = host_ctx(store);
        let input = ctx.upload(&[3.0]).unwrap();
        let out = geglu.forward(&ctx, &input, &[]).unwrap();
        let value = ctx.read(&out.buffer, &out.waits()).unwrap()[0];
        assert!((value - 3.0 * crate::backend::host::gelu(6.0)).abs() < 1e-5);
    }
}
