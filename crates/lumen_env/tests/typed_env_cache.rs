use std::sync::OnceLock;

use lumen_env::{EngineEnvVar, EnvVarGuard, MAX_PENDING_OPS};
use serial_test::serial;

#[test]
#[serial]
fn test_get_cached_latches_first_value() {
    let _clear = EnvVarGuard::unset(EngineEnvVar::MaxPendingOps);
    static CACHE: OnceLock<Option<usize>> = OnceLock::new();

    {
        let _set = EnvVarGuard::set(EngineEnvVar::MaxPendingOps, "8");
        assert_eq!(MAX_PENDING_OPS.get_cached(&CACHE), Some(8));
    }

    {
        let _set = EnvVarGuard::set(EngineEnvVar::MaxPendingOps, "16");
        assert_eq!(MAX_PENDING_OPS.get_cached(&CACHE), Some(8));
    }
}

#[test]
#[serial]
fn test_guard_restores_previous_value() {
    let _outer = EnvVarGuard::set(EngineEnvVar::MaxPendingOps, "4");
    {
        let _inner = MAX_PENDING_OPS.set_guard(32).expect("format usize");
        assert_eq!(MAX_PENDING_OPS.get().expect("parse"), Some(32));
    }
    assert_eq!(MAX_PENDING_OPS.get().expect("parse"), Some(4));
}
