//! Shared helpers for converge-core integration tests.

use std::sync::Arc;
use std::time::Duration;

use converge_core::{
    DesiredState, MemoryRemote, PolicyTable, Reconciler, ReconcilerConfig, ResourceConfig,
    normalize_desired,
};
use serde_json::Value;

/// A reconciler wired to an in-memory remote.
pub struct Harness {
    pub remote: Arc<MemoryRemote>,
    pub reconciler: Reconciler,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_policies(PolicyTable::default())
    }

    pub fn with_policies(policies: PolicyTable) -> Self {
        let remote = Arc::new(MemoryRemote::new());
        let reconciler = Reconciler::new(remote.clone(), remote.clone(), policies);
        Self { remote, reconciler }
    }

    pub fn with_timeout(self, call_timeout: Duration) -> Self {
        Self {
            remote: self.remote,
            reconciler: self.reconciler.with_config(ReconcilerConfig { call_timeout }),
        }
    }
}

/// Normalize a desired-state document written as JSON.
pub fn desired(raw: Value) -> DesiredState {
    let config: ResourceConfig = serde_json::from_value(raw).expect("valid config document");
    normalize_desired(&config).expect("valid desired state")
}
