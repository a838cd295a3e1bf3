use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::info;

use super::{Context, Pending};
use crate::{backend::CompletionToken, error::Result, weights::WeightStore};

/// One queued kernel and the tokens it waited on.
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchRecord {
    pub kernel: &'static str,
    pub token: CompletionToken,
    pub waits: Vec<CompletionToken>,
}

/// Observer installed on a [`Context`] and called during every forward.
pub trait ForwardHook: Send + Sync {
    fn on_dispatch(&self, _record: &DispatchRecord) {}

    /// Called once a module has queued its last operation.
    fn on_module_output(&self, _ctx: &Context, _module: &str, _output: &Pending) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModuleDiff {
    pub module: String,
    pub max_abs_diff: f32,
    pub passed: bool,
}

pub fn max_abs_diff(actual: &[f32], expected: &[f32]) -> f32 {
    if actual.len() != expected.len() {
        return f32::INFINITY;
    }
    actual.iter().zip(expected).map(|(a, b)| (a - b).abs()).fold(0.0, f32::max)
}

#[derive(Default)]
enum Capture {
    #[default]
    Nothing,
    Named(FxHashSet<String>),
    Everything,
}

/// Records the dispatch DAG and reads back selected module outputs.
///
/// Capturing an output forces a synchronization point, so only capture what is compared.
#[derive(Default)]
pub struct RecordingHook {
    capture: Capture,
    dispatches: Mutex<Vec<DispatchRecord>>,
    modules: Mutex<Vec<String>>,
    outputs: Mutex<FxHashMap<String, Vec<f32>>>,
}

impl RecordingHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capturing<I, S>(modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            capture: Capture::Named(modules.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn capturing_all() -> Self {
        Self {
            capture: Capture::Everything,
            ..Self::default()
        }
    }

    pub fn dispatches(&self) -> Vec<DispatchRecord> {
        self.dispatches.lock().clone()
    }

    /// Module names in the order their forwards finished queueing.
    pub fn modules(&self) -> Vec<String> {
        self.modules.lock().clone()
    }

    pub fn output(&self, module: &str) -> Option<Vec<f32>> {
        self.outputs.lock().get(module).cloned()
    }

    pub fn compare(&self, module: &str, reference: &[f32]) -> Option<f32> {
        self.outputs.lock().get(module).map(|actual| max_abs_diff(actual, reference))
    }

    /// Compare every captured output with the same-named array in `references`.
    pub fn verify(&self, references: &dyn WeightStore, tolerance: f32) -> Result<Vec<ModuleDiff>> {
        let outputs = self.outputs.lock();
        let mut names: Vec<&String> = outputs.keys().filter(|name| references.contains(name)).collect();
        names.sort();
        let mut report = Vec::with_capacity(names.len());
        for name in names {
            let reference = references.load(name)?;
            let diff = max_abs_diff(&outputs[name], &reference.data);
            info!(module = %name, max_abs_diff = diff, "verified module output");
            report.push(ModuleDiff {
                module: name.clone(),
                max_abs_diff: diff,
                passed: diff <= tolerance,
            });
        }
        Ok(report)
    }

    fn wants(&self, module: &str) -> bool {
        match &self.capture {
            Capture::Nothing => false,
            Capture::Named(names) => names.contains(module),
            Capture::Everything => true,
        }
    }
}

impl ForwardHook for RecordingHook {
    fn on_dispatch(&self, record: &DispatchRecord) {
        self.dispatches.lock().push(record.clone());
    }

    fn on_module_output(&self, ctx: &Context, module: &str, output: &Pending) -> Result<()> {
        self.modules.lock().push(module.to_string());
        if self.wants(module) {
            let values = ctx.read(&output.buffer, &output.waits())?;
            self.outputs.lock().insert(module.to_string(), values);
        }
        Ok(())
    }
}

#[cfg(test)]
mod hook_test {
    use super::*;

    #[test]
    fn test_diff_reports_worst_element() {
        assert_eq!(max_abs_diff(&[1.0, 2.0, 3.0], &[1.0, 2.5, 2.0]), 1.0);
        assert_eq!(max_abs_diff(&[1.0], &[1.0, 2.0]), f32::INFINITY);
    }

    #[test]
    fn test_capture_selection() {
        let hook = RecordingHook::capturing(["unet.out"]);
        assert!(hook.wants("unet.out"));
        assert!(!hook.wants("unet.input_blocks.0"));
        assert!(RecordingHook::capturing_all().wants("anything"));
        assert!(!RecordingHook::new().wants("anything"));
    }
}
