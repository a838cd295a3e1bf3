use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;

use super::npy::{self, NpyArray, NpyError};
use crate::{EngineError, error::Result};

/// Source of named weight arrays.
pub trait WeightStore: Send + Sync {
    fn load(&self, name: &str) -> Result<NpyArray>;

    fn contains(&self, name: &str) -> bool;
}

/// Weights stored as one `.npy` file per name: `{root}/{name}.npy`.
#[derive(Debug, Clone)]
pub struct NpyDirectory {
    root: PathBuf,
}

impl NpyDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.npy"))
    }

    /// Write `data` under `name`, creating parent directories.
    pub fn save(&self, name: &str, shape: &[usize], data: &[f32]) -> Result<()> {
        let path = self.path_for(name);
        let to_load_error = |source: NpyError| EngineError::ResourceLoad {
            name: name.to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| to_load_error(e.into()))?;
        }
        npy::save_npy(&path, shape, data).map_err(to_load_error)
    }
}

impl WeightStore for NpyDirectory {
    fn load(&self, name: &str) -> Result<NpyArray> {
        npy::read_npy(self.path_for(name)).map_err(|source| EngineError::ResourceLoad {
            name: name.to_string(),
            source,
        })
    }

    fn contains(&self, name: &str) -> bool {
        self.path_for(name).is_file()
    }
}

/// In-memory weights, used for synthetic models and tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryWeightStore {
    arrays: FxHashMap<String, NpyArray>,
}

impl MemoryWeightStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>) {
        self.arrays.insert(name.into(), NpyArray::new(shape, data));
    }

    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.arrays.keys().map(String::as_str)
    }
}

impl WeightStore for MemoryWeightStore {
    fn load(&self, name: &str) -> Result<NpyArray> {
        self.arrays
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::WeightNotFound(name.to_string()))
    }

    fn contains(&self, name: &str) -> bool {
        self.arrays.contains_key(name)
    }
}
