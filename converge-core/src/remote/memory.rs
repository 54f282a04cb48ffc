//! In-memory remote used by tests and dry runs.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Mutation, StateMutator, StateSource};
use crate::descriptor::wire;
use crate::error::RemoteError;
use crate::kind::SubResourceKind;

#[derive(Default)]
struct Inner {
    bodies: HashMap<(String, SubResourceKind), Value>,
    log: Vec<(String, SubResourceKind, Mutation)>,
    apply_count: usize,
    fetch_failures: HashMap<SubResourceKind, RemoteError>,
    /// Keyed by the zero-based index of the apply call that fails.
    apply_failures: BTreeMap<usize, RemoteError>,
    delay: Option<Duration>,
}

/// Remote that keeps wire bodies in a map and applies mutations with
/// [`wire::project`].
///
/// Supports failure injection and artificial latency for tests.
#[derive(Default)]
pub struct MemoryRemote {
    inner: Mutex<Inner>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw wire body, as if written by someone else.
    pub async fn seed(&self, resource: &str, kind: SubResourceKind, body: Value) {
        let mut inner = self.inner.lock().await;
        inner.bodies.insert((resource.to_string(), kind), body);
    }

    /// Store an existing resource with no sub-resources.
    pub async fn seed_resource(&self, resource: &str) {
        self.seed(
            resource,
            SubResourceKind::Resource,
            serde_json::json!({ "Name": resource }),
        )
        .await;
    }

    pub async fn body(&self, resource: &str, kind: SubResourceKind) -> Option<Value> {
        let inner = self.inner.lock().await;
        inner.bodies.get(&(resource.to_string(), kind)).cloned()
    }

    /// Every mutation applied so far, in call order.
    pub async fn mutations(&self) -> Vec<(String, SubResourceKind, Mutation)> {
        self.inner.lock().await.log.clone()
    }

    pub async fn mutation_count(&self) -> usize {
        self.inner.lock().await.log.len()
    }

    /// Make every fetch of `kind` fail with `error`.
    pub async fn fail_fetch(&self, kind: SubResourceKind, error: RemoteError) {
        self.inner.lock().await.fetch_failures.insert(kind, error);
    }

    /// Make the `index`-th apply call (zero-based, counted from creation)
    /// fail with `error`.
    pub async fn fail_apply_at(&self, index: usize, error: RemoteError) {
        self.inner.lock().await.apply_failures.insert(index, error);
    }

    /// Delay every call by `delay` before it takes effect.
    pub async fn set_delay(&self, delay: Option<Duration>) {
        self.inner.lock().await.delay = delay;
    }

    async fn pause(&self) {
        let delay = self.inner.lock().await.delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn resource_exists(inner: &Inner, resource: &str) -> bool {
        inner
            .bodies
            .contains_key(&(resource.to_string(), SubResourceKind::Resource))
    }
}

#[async_trait]
impl StateSource for MemoryRemote {
    async fn fetch(&self, resource: &str, kind: SubResourceKind) -> Result<Value, RemoteError> {
        self.pause().await;
        let inner = self.inner.lock().await;
        if let Some(err) = inner.fetch_failures.get(&kind) {
            return Err(err.clone());
        }
        if !Self::resource_exists(&inner, resource) {
            return Err(RemoteError::NotFound(format!("resource {}", resource)));
        }
        inner
            .bodies
            .get(&(resource.to_string(), kind))
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("{} of {}", kind, resource)))
    }
}

#[async_trait]
impl StateMutator for MemoryRemote {
    async fn apply(
        &self,
        resource: &str,
        kind: SubResourceKind,
        mutation: &Mutation,
    ) -> Result<(), RemoteError> {
        self.pause().await;
        let mut inner = self.inner.lock().await;
        let index = inner.apply_count;
        inner.apply_count += 1;
        if let Some(err) = inner.apply_failures.remove(&index) {
            return Err(err);
        }

        let exists = Self::resource_exists(&inner, resource);
        match mutation {
            Mutation::CreateResource => {}
            _ if !exists => {
                return Err(RemoteError::NotFound(format!("resource {}", resource)));
            }
            _ => {}
        }

        let key = (resource.to_string(), kind);
        let next = wire::project(resource, kind, inner.bodies.get(&key), mutation)
            .map_err(|e| RemoteError::Permanent(e.to_string()))?;

        if let Mutation::DeleteResource { .. } = mutation {
            inner.bodies.retain(|(name, _), _| name != resource);
        } else {
            match next {
                Some(body) => {
                    inner.bodies.insert(key, body);
                }
                None => {
                    inner.bodies.remove(&key);
                }
            }
        }

        debug!(resource, %kind, op = mutation.name(), "Applied mutation");
        inner
            .log
            .push((resource.to_string(), kind, mutation.clone()));
        Ok(())
    }
}
