//! Common imports for tests.

pub use crate::executor::{Behavior, RecordedCall, ScriptedExecutor};
pub use crate::fixtures::{
    bundle, cronjob_caveat, manifest_fixture, namespaces_caveat, rpc_origin_caveat,
    test_registry,
};
pub use crate::init_test_tracing;
