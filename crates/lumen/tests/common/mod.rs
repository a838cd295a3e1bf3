#![allow(dead_code)]

use std::sync::Arc;

use lumen::{
    Context, nn::Module, weights::{MemoryWeightStore, WeightStore}
};
use rand::{Rng, SeedableRng, rngs::StdRng};

/// Deterministic weights for every module, norm scales near one.
pub fn seeded_store<'a>(modules: impl IntoIterator<Item = &'a dyn Module>, seed: u64) -> MemoryWeightStore {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut store = MemoryWeightStore::new();
    for module in modules {
        for weight in module.weights() {
            let fan_in = weight.shape().iter().skip(1).product::<usize>().max(1) as f32;
            let is_norm_scale = weight.shape().len() == 1 && weight.name().ends_with(".weight");
            let data = (0..weight.element_count())
                .map(|_| {
                    let noise = rng.random::<f32>() * 2.0 - 1.0;
                    if is_norm_scale { 1.0 + 0.1 * noise } else { noise / fan_in.sqrt() }
                })
                .collect();
            store.insert(weight.name(), weight.shape().to_vec(), data);
        }
    }
    store
}

pub fn host_context(store: impl WeightStore + 'static) -> Context {
    Context::host(Arc::new(store)).with_reduction_width(16)
}

pub fn random_vec(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.random::<f32>() * 2.0 - 1.0).collect()
}
