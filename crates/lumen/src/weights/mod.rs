//! Named weights and the stores they are loaded from.

pub mod npy;
mod store;

use parking_lot::Mutex;
use tracing::debug;

use lumen_instrumentation::{MetricEvent, record_metric};

pub use npy::{NpyArray, NpyError, read_npy, save_npy, write_npy};
pub use store::{MemoryWeightStore, NpyDirectory, WeightStore};

use crate::{Context, DeviceBuffer, EngineError, error::Result};

/// An immutable f32 tensor owned by exactly one module.
///
/// The device copy is created on the first `materialize` and reused afterwards.
pub struct Weight {
    name: String,
    shape: Vec<usize>,
    buffer: Mutex<Option<DeviceBuffer>>,
}

impl Weight {
    pub fn new(name: impl Into<String>, shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            shape,
            buffer: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn size_bytes(&self) -> u64 {
        (self.element_count() * std::mem::size_of::<f32>()) as u64
    }

    pub fn is_materialized(&self) -> bool {
        self.buffer.lock().is_some()
    }

    /// Load the weight through the context's store and upload it, once.
    ///
    /// Only the element count is checked against the declared shape, so a `[1, 320]` dump
    /// serves a `[320]` bias. A count mismatch is a shape mismatch; a missing or unreadable
    /// file is a resource load failure.
    pub fn materialize(&self, ctx: &Context) -> Result<DeviceBuffer> {
        let mut slot = self.buffer.lock();
        if let Some(buffer) = slot.as_ref() {
            return Ok(buffer.clone());
        }

        let array = ctx.store().load(&self.name)?;
        if array.data.len() != self.element_count() {
            return Err(EngineError::WeightShapeMismatch {
                name: self.name.clone(),
                expected: self.shape.clone(),
                actual: array.shape,
            });
        }
        let buffer = ctx.upload(&array.data)?;
        debug!(weight = %self.name, bytes = buffer.size_bytes(), "materialized weight");
        record_metric!(MetricEvent::WeightMaterialized {
            name: self.name.clone(),
            bytes: buffer.size_bytes() as u64,
        });
        *slot = Some(buffer.clone());
        Ok(buffer)
    }

    /// Drop the device copy. The next `materialize` reloads it.
    pub fn release(&self) {
        self.buffer.lock().take();
    }
}

impl std::fmt::Debug for Weight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Weight")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .field("materialized", &self.is_materialized())
            .finish()
    }
}

#[cfg(test)]
mod weights_test {
    use std::sync::Arc;

    use super::*;
    use crate::ErrorKind;

    fn ctx_with(store: MemoryWeightStore) -> Context {
        Context::host(Arc::new(store))
    }

    #[test]
    fn test_materialize_is_idempotent() {
        let mut store = MemoryWeightStore::new();
        store.insert("proj.weight", vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let ctx = ctx_with(store);

        let weight = Weight::new("proj.weight", vec![2, 2]);
        let first = weight.materialize(&ctx).unwrap();
        let second = weight.materialize(&ctx).unwrap();
        assert!(first.same(&second));
        assert_eq!(ctx.read(&first, &[]).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);

        weight.release();
        assert!(!weight.is_materialized());
        let third = weight.materialize(&ctx).unwrap();
        assert!(!third.same(&first));
    }

    #[test]
    fn test_element_count_must_match_file() {
        let mut store = MemoryWeightStore::new();
        store.insert("conv.bias", vec![3], vec![0.0; 3]);
        let ctx = ctx_with(store);

        let err = Weight::new("conv.bias", vec![4]).materialize(&ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShapeMismatch);

        let err = Weight::new("missing.weight", vec![1]).materialize(&ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceLoad);
    }

    #[test]
    fn test_unit_axes_in_file_are_accepted() {
        let mut store = MemoryWeightStore::new();
        store.insert("norm.bias", vec![1, 3], vec![0.5, 1.5, 2.5]);
        let ctx = ctx_with(store);

        let weight = Weight::new("norm.bias", vec![3]);
        let buffer = weight.materialize(&ctx).unwrap();
        assert_eq!(ctx.read(&buffer, &[]).unwrap(), vec![0.5, 1.5, 2.5]);
        assert_eq!(weight.shape(), &[3]);
    }
}
