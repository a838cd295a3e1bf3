use std::time::Instant;

use super::{Linear, Module, child_name};
use crate::{
    Context, DeviceBuffer, EngineError, Pending, backend::CompletionToken, context::{DispatchGraph, NodeId}, error::Result, kernels::{BatchDims, MaskedScoresOp, PermuteOp, ScoresOp, SliceOp, SoftmaxOp, WeightedSumOp}, weights::Weight
};

/// Additive causal mask for `tokens` positions: `0` on and below the diagonal, `-inf` above.
pub fn causal_mask(tokens: usize) -> Vec<f32> {
    let mut mask = vec![0.0; tokens * tokens];
    for (i, row) in mask.chunks_mut(tokens.max(1)).enumerate() {
        row[i + 1..].fill(f32::NEG_INFINITY);
    }
    mask
}

#[derive(Clone, Copy, Debug)]
struct Heads {
    count: usize,
    dim: usize,
}

impl Heads {
    fn new(width: usize, head_dim: usize) -> Result<Self> {
        if head_dim == 0 || width % head_dim != 0 {
            return Err(EngineError::InvalidShape(format!("width {width} does not split into heads of {head_dim}")));
        }
        Ok(Self {
            count: width / head_dim,
            dim: head_dim,
        })
    }

    fn width(&self) -> usize {
        self.count * self.dim
    }

    fn scale(&self) -> f32 {
        1.0 / (self.dim as f32).sqrt()
    }

    fn tokens(&self, op: &'static str, buffer: &DeviceBuffer) -> Result<usize> {
        if buffer.len() % self.width() != 0 {
            return Err(EngineError::mismatch(op, buffer.len().next_multiple_of(self.width()), buffer.len()));
        }
        Ok(buffer.len() / self.width())
    }

    /// `[tokens, heads, dim] -> [heads, tokens, dim]`
    fn split(&self, graph: &mut DispatchGraph<'_>, buffer: &DeviceBuffer, node: NodeId) -> Result<(DeviceBuffer, NodeId)> {
        let tokens = buffer.len() / self.width();
        graph.call::<PermuteOp>((buffer, [tokens, self.count, self.dim]), &[node])
    }

    /// Scores, softmax and weighted sum over split heads, merged back to `[rows, width]`.
    fn attend(
        &self,
        graph: &mut DispatchGraph<'_>,
        (query, q): (&DeviceBuffer, NodeId),
        (key, k): (&DeviceBuffer, NodeId),
        (value, v): (&DeviceBuffer, NodeId),
        mask: Option<&DeviceBuffer>,
    ) -> Result<(DeviceBuffer, NodeId)> {
        let dims = BatchDims {
            batch: self.count,
            rows: query.len() / self.width(),
            cols: key.len() / self.width(),
            depth: self.dim,
        };
        let (scores, s) = match mask {
            Some(mask) => graph.call::<MaskedScoresOp>((query, key, mask, dims, self.scale()), &[q, k])?,
            None => graph.call::<ScoresOp>((query, key, dims, self.scale()), &[q, k])?,
        };
        let (probs, p) = graph.call::<SoftmaxOp>((&scores, dims.cols), &[s])?;
        let (heads, h) = graph.call::<WeightedSumOp>((&probs, value, dims), &[p, v])?;
        graph.call::<PermuteOp>((&heads, [self.count, dims.rows, self.dim]), &[h])
    }
}

/// Attention with separate projections; self-attention when no context is given.
pub struct CrossAttention {
    name: String,
    to_q: Linear,
    to_k: Linear,
    to_v: Linear,
    to_out: Linear,
    heads: Heads,
}

impl CrossAttention {
    pub fn new(name: impl Into<String>, query_dim: usize, context_dim: usize, head_dim: usize) -> Result<Self> {
        let name = name.into();
        let heads = Heads::new(query_dim, head_dim)?;
        let inner = heads.width();
        Ok(Self {
            to_q: Linear::new(child_name(&name, "to_q"), query_dim, inner, false),
            to_k: Linear::new(child_name(&name, "to_k"), context_dim, inner, false),
            to_v: Linear::new(child_name(&name, "to_v"), context_dim, inner, false),
            to_out: Linear::new(child_name(&name, "to_out.0"), inner, query_dim, true),
            name,
            heads,
        })
    }

    pub fn heads(&self) -> usize {
        self.heads.count
    }

    /// `x` is `[n, query_dim]`; `context`, when given, is `[m, context_dim]`.
    pub fn forward(&self, ctx: &Context, x: &DeviceBuffer, context: Option<&DeviceBuffer>, waits: &[CompletionToken]) -> Result<Pending> {
        let started = Instant::now();
        let context = context.unwrap_or(x);
        if x.len() % self.to_q.in_features() != 0 {
            return Err(EngineError::mismatch("cross attention query", x.len().next_multiple_of(self.to_q.in_features()), x.len()));
        }
        if context.len() % self.to_k.in_features() != 0 {
            return Err(EngineError::mismatch(
                "cross attention context",
                context.len().next_multiple_of(self.to_k.in_features()),
                context.len(),
            ));
        }

        let mut graph = DispatchGraph::new(ctx, waits);
        let entry = [DispatchGraph::ENTRY];
        let (q, q_done) = graph.module(&entry, |ctx, waits| self.to_q.forward(ctx, x, waits))?;
        let (k, k_done) = graph.module(&entry, |ctx, waits| self.to_k.forward(ctx, context, waits))?;
        let (v, v_done) = graph.module(&entry, |ctx, waits| self.to_v.forward(ctx, context, waits))?;
        let q = self.heads.split(&mut graph, &q, q_done)?;
        let k = self.heads.split(&mut graph, &k, k_done)?;
        let v = self.heads.split(&mut graph, &v, v_done)?;
        let (merged, m) = self.heads.attend(&mut graph, (&q.0, q.1), (&k.0, k.1), (&v.0, v.1), None)?;
        let (out, o) = graph.module(&[m], |ctx, waits| self.to_out.forward(ctx, &merged, waits))?;

        let out = graph.finish(out, o)?;
        ctx.module_output(&self.name, &out, started)?;
        Ok(out)
    }
}

impl Module for CrossAttention {
    fn name(&self) -> &str {
        &self.name
    }

    fn visit_weights<'a>(&'a self, visitor: &mut dyn FnMut(&'a Weight)) {
        for linear in [&self.to_q, &self.to_k, &self.to_v, &self.to_out] {
            linear.visit_weights(visitor);
        }
    }
}

/// Self-attention with one packed `[3·dim, dim]` input projection (`in_proj_weight`).
pub struct MultiHeadAttention {
    name: String,
    in_proj: Linear,
    out_proj: Linear,
    heads: Heads,
}

impl MultiHeadAttention {
    pub fn new(name: impl Into<String>, dim: usize, heads: usize) -> Result<Self> {
        let name = name.into();
        if heads == 0 || dim % heads != 0 {
            return Err(EngineError::InvalidShape(format!("width {dim} does not split into {heads} heads")));
        }
        Ok(Self {
            in_proj: Linear::with_names(
                child_name(&name, "in_proj"),
                child_name(&name, "in_proj_weight"),
                Some(child_name(&name, "in_proj_bias")),
                dim,
                3 * dim,
            ),
            out_proj: Linear::new(child_name(&name, "out_proj"), dim, dim, true),
            heads: Heads::new(dim, dim / heads)?,
            name,
        })
    }

    pub fn heads(&self) -> usize {
        self.heads.count
    }

    /// `x` is `[n, dim]`; `mask`, when given, is an additive `[n, n]` mask.
    pub fn forward(&self, ctx: &Context, x: &DeviceBuffer, mask: Option<&DeviceBuffer>, waits: &[CompletionToken]) -> Result<Pending> {
        let started = Instant::now();
        let tokens = self.heads.tokens("multi-head attention input", x)?;
        let dim = self.heads.width();

        let mut graph = DispatchGraph::new(ctx, waits);
        let (packed, projected) = graph.module(&[DispatchGraph::ENTRY], |ctx, waits| self.in_proj.forward(ctx, x, waits))?;
        // [n, 3, dim] -> [3, n, dim]; q, k and v are then contiguous thirds
        let (planes, split) = graph.call::<PermuteOp>((&packed, [tokens, 3, dim]), &[projected])?;
        let mut parts = Vec::with_capacity(3);
        for index in 0..3 {
            let (part, sliced) = graph.call::<SliceOp>((&planes, index * tokens * dim, tokens * dim), &[split])?;
            parts.push(self.heads.split(&mut graph, &part, sliced)?);
        }
        let [(q, q_done), (k, k_done), (v, v_done)]: [(DeviceBuffer, NodeId); 3] = parts
            .try_into()
            .map_err(|_| EngineError::InvalidArgument("packed projection did not split in three".into()))?;
        let (merged, m) = self.heads.attend(&mut graph, (&q, q_done), (&k, k_done), (&v, v_done), mask)?;
        let (out, o) = graph.module(&[m], |ctx, waits| self.out_proj.forward(ctx, &merged, waits))?;

        let out = graph.finish(out, o)?;
        ctx.module_output(&self.name, &out, started)?;
        Ok(out)
    }
}

impl Module for MultiHeadAttention {
    fn name(&self) -> &str {
        &self.name
    }

    fn visit_weights<'a>(&'a self, visitor: &mut dyn FnMut(&'a Weight)) {
        self.in_proj.visit_weights(visitor);
        self.out_proj.visit_weights(visitor);
    }
}
