//! Process environment abstractions shared across the lumen crates.

pub mod engine;
pub mod guard;
pub mod instrument;
pub mod value;

use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use engine::EngineEnvVar;
use instrument::InstrumentEnvVar;

/// Namespaced environment variable identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnvVar {
    /// Logging and metrics settings.
    Instrument(InstrumentEnvVar),
    /// Execution engine settings (kernel strategies, weight location, queue depth).
    Engine(EngineEnvVar),
}

impl From<InstrumentEnvVar> for EnvVar {
    fn from(value: InstrumentEnvVar) -> Self {
        Self::Instrument(value)
    }
}

impl From<EngineEnvVar> for EnvVar {
    fn from(value: EngineEnvVar) -> Self {
        Self::Engine(value)
    }
}

impl EnvVar {
    /// Canonical process environment key.
    pub const fn key(self) -> &'static str {
        match self {
            EnvVar::Instrument(inner) => inner.key(),
            EnvVar::Engine(inner) => inner.key(),
        }
    }
}

/// Process environment facade that serialises every mutation behind one mutex.
pub struct Environment;

impl Environment {
    /// Acquire the global environment mutex.
    ///
    /// A poisoned lock is recovered: the guarded data is `()`, so a panic while holding it
    /// cannot leave anything half-written.
    pub fn lock() -> MutexGuard<'static, ()> {
        static ENV_MUTEX: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_MUTEX.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read the variable as UTF-8 if present.
    pub fn get(var: impl Into<EnvVar>) -> Option<String> {
        std::env::var(var.into().key()).ok()
    }

    /// Returns true when the variable is present, whatever its value.
    pub fn is_set(var: impl Into<EnvVar>) -> bool {
        std::env::var_os(var.into().key()).is_some()
    }

    /// Set the variable, taking the global lock for the duration of the write.
    pub fn set(var: impl Into<EnvVar>, value: &str) {
        let mut guard = Self::lock();
        Self::set_locked(var.into(), value, &mut guard);
    }

    /// Remove the variable, taking the global lock for the duration of the write.
    pub fn remove(var: impl Into<EnvVar>) {
        let mut guard = Self::lock();
        Self::remove_locked(var.into(), &mut guard);
    }

    pub(crate) fn set_locked(var: EnvVar, value: &str, _guard: &mut MutexGuard<'static, ()>) {
        // SAFETY: the guard proves the caller holds the global environment mutex, so no
        // other thread in this process mutates the environment concurrently.
        unsafe { std::env::set_var(var.key(), value) };
    }

    pub(crate) fn remove_locked(var: EnvVar, _guard: &mut MutexGuard<'static, ()>) {
        // SAFETY: see `set_locked`.
        unsafe { std::env::remove_var(var.key()) };
    }
}
