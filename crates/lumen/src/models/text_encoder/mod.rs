//! Causal text transformer producing the conditioning sequence.

use std::time::Instant;

use tracing::debug_span;

use super::report_weights;
use crate::{
    Context, DeviceBuffer, EngineError, Pending, backend::CompletionToken, error::Result, kernels::EmbeddingOp, nn::{LayerNorm, Module, ResidualAttentionBlock, causal_mask, child_name}, tokenizer::SpecialTokens, weights::Weight
};

/// Text transformer hyperparameters; defaults are the 1024-wide, 23-layer encoder over
/// 77 tokens with a 49408-entry vocabulary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextEncoderConfig {
    pub vocab_size: usize,
    pub context_length: usize,
    pub width: usize,
    pub heads: usize,
    pub layers: usize,
    pub special_tokens: SpecialTokens,
}

impl Default for TextEncoderConfig {
    fn default() -> Self {
        Self {
            vocab_size: 49408,
            context_length: 77,
            width: 1024,
            heads: 16,
            layers: 23,
            special_tokens: SpecialTokens::default(),
        }
    }
}

impl TextEncoderConfig {
    pub fn tiny() -> Self {
        Self {
            vocab_size: 64,
            context_length: 6,
            width: 16,
            heads: 2,
            layers: 2,
            special_tokens: SpecialTokens { start: 62, end: 63, pad: 0 },
        }
    }
}

pub struct TextEncoder {
    name: String,
    config: TextEncoderConfig,
    token_embedding: Weight,
    positional_embedding: Weight,
    attn_mask: Weight,
    resblocks: Vec<ResidualAttentionBlock>,
    ln_final: LayerNorm,
}

impl TextEncoder {
    pub fn new(name: impl Into<String>, config: TextEncoderConfig) -> Result<Self> {
        let name = name.into();
        let (width, tokens) = (config.width, config.context_length);
        let resblocks = (0..config.layers)
            .map(|i| ResidualAttentionBlock::new(child_name(&name, format!("transformer.resblocks.{i}")), width, config.heads))
            .collect::<Result<_>>()?;
        Ok(Self {
            token_embedding: Weight::new(child_name(&name, "token_embedding.weight"), vec![config.vocab_size, width]),
            positional_embedding: Weight::new(child_name(&name, "positional_embedding"), vec![tokens, width]),
            attn_mask: Weight::new(child_name(&name, "attn_mask"), vec![tokens, tokens]),
            resblocks,
            ln_final: LayerNorm::new(child_name(&name, "ln_final"), width),
            name,
            config,
        })
    }

    pub fn config(&self) -> &TextEncoderConfig {
        &self.config
    }

    pub fn load(&self, ctx: &Context) -> Result<u64> {
        self.init(ctx)?;
        let blocks = self.resblocks.iter().map(|block| block as &dyn Module);
        Ok(report_weights(&self.name, blocks.chain([&self.ln_final as &dyn Module])))
    }

    /// The stored causal mask when the store has one, otherwise a generated one.
    fn mask(&self, ctx: &Context) -> Result<DeviceBuffer> {
        if ctx.store().contains(self.attn_mask.name()) {
            self.attn_mask.materialize(ctx)
        } else {
            ctx.upload(&causal_mask(self.config.context_length))
        }
    }

    /// Encode exactly `context_length` token ids into a `[context_length, width]` sequence.
    pub fn encode(&self, ctx: &Context, tokens: &[u32], waits: &[CompletionToken]) -> Result<Pending> {
        let _span = debug_span!("text_encoder", tokens = tokens.len()).entered();
        let started = Instant::now();
        if tokens.len() != self.config.context_length {
            return Err(EngineError::mismatch("text encoder tokens", self.config.context_length, tokens.len()));
        }
        let table = self.token_embedding.materialize(ctx)?;
        let positional = self.positional_embedding.materialize(ctx)?;
        let mask = self.mask(ctx)?;

        let (embedded, token) = ctx.call::<EmbeddingOp>((&table, Some(&positional), self.config.width, tokens), waits)?;
        let mut h = Pending::new(embedded, token);
        for block in &self.resblocks {
            h = block.forward(ctx, &h.buffer, Some(&mask), &h.waits())?;
        }
        let out = self.ln_final.forward(ctx, &h.buffer, &h.waits())?;
        ctx.module_output(&self.name, &out, started)?;
        Ok(out)
    }
}

impl Module for TextEncoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn visit_weights<'a>(&'a self, visitor: &mut dyn FnMut(&'a Weight)) {
        visitor(&self.token_embedding);
        visitor(&self.positional_embedding);
        for block in &self.resblocks {
            block.visit_weights(visitor);
        }
        self.ln_final.visit_weights(visitor);
    }
}

#[cfg(test)]
mod text_encoder_test {
    use super::*;
    use crate::nn::test_util::{host_ctx, random_store};

    #[test]
    fn test_default_layout() {
        let encoder = TextEncoder::new("text_encoder", TextEncoderConfig::default()).unwrap();
        let weights = encoder.weights();
        assert_eq!(weights[0].shape(), &[49408, 1024]);
        assert_eq!(weights[1].shape(), &[77, 1024]);
        assert!(weights.iter().any(|w| w.name() == "text_encoder.transformer.resblocks.22.mlp.c_fc.weight" && w.shape() == [4096, 1024]));
        assert!(!weights.iter().any(|w| w.name().contains("resblocks.23")));
        assert_eq!(weights.last().map(|w| w.name()), Some("text_encoder.ln_final.bias"));
    }

    #[test]
    fn test_encode_is_causal() {
        let config = TextEncoderConfig::tiny();
        let encoder = TextEncoder::new("text_encoder", config.clone()).unwrap();
        let ctx = host_ctx(random_store(&encoder, 61));
        encoder.load(&ctx).unwrap();

        let run = |tokens: &[u32]| {
            let out = encoder.encode(&ctx, tokens, &[]).unwrap();
            ctx.read(&out.buffer, &out.waits()).unwrap()
        };
        let a = run(&[1, 5, 9, 2, 0, 0]);
        let b = run(&[1, 5, 9, 2, 7, 3]);
        assert_eq!(a.len(), config.context_length * config.width);
        assert_eq!(a[..4 * config.width], b[..4 * config.width]);
        assert_ne!(a[4 * config.width..], b[4 * config.width..]);

        assert!(encoder.encode(&ctx, &[1, 2, 3], &[]).is_err());
        assert!(encoder.encode(&ctx, &[1, 2, 3, 4, 5, 64], &[]).is_err());
    }

    #[test]
    fn test_stored_mask_is_used() {
        let config = TextEncoderConfig::tiny();
        let encoder = TextEncoder::new("te", config.clone()).unwrap();
        let mut store = random_store(&encoder, 62);
        // all-visible mask: the first token now sees the rest
        store.insert("te.attn_mask", vec![6, 6], vec![0.0; 36]);
        let masked_ctx = host_ctx(random_store(&encoder, 62));
        let open_ctx = host_ctx(store);

        let tokens = [1, 5, 9, 2, 7, 3];
        let masked = encoder.encode(&masked_ctx, &tokens, &[]).unwrap();
        let masked = masked_ctx.read(&masked.buffer, &masked.waits()).unwrap();
        let encoder = TextEncoder::new("te", config).unwrap();
        let open = encoder.encode(&open_ctx, &tokens, &[]).unwrap();
        let open = open_ctx.read(&open.buffer, &open.waits()).unwrap();
        assert_ne!(masked[..16], open[..16]);
    }
}
