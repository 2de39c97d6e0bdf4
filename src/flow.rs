//! Flow identity resolver: FlowKey to storage FlowId, cached per session

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, trace};

use crate::Result;
use crate::sink::Storage;
use crate::types::{FlowId, FlowKey, SessionId};

/// Resolves flows to storage ids, registering each flow at most once.
///
/// Concurrent resolutions of the same key share one registration; callers
/// arriving while it is in flight wait for its result. A failed registration
/// leaves the key unresolved so the next packet retries.
pub struct FlowResolver {
    session_id: SessionId,
    storage: Arc<dyn Storage>,
    cache: DashMap<FlowKey, Arc<OnceCell<FlowId>>>,
}

impl FlowResolver {
    pub fn new(session_id: SessionId, storage: Arc<dyn Storage>) -> Self {
        Self { session_id, storage, cache: DashMap::new() }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Cached id or a fresh registration through the storage collaborator.
    pub async fn resolve(&self, flow: &FlowKey) -> Result<FlowId> {
        if let Some(id) = self.cached(flow) {
            return Ok(id);
        }

        let cell = self.cache.entry(flow.clone()).or_default().clone();
        let id = cell
            .get_or_try_init(|| async {
                let id = self.storage.register_flow(self.session_id, flow).await?;
                debug!(flow = %flow, flow_id = id, "Registered flow");
                Ok::<_, crate::Error>(id)
            })
            .await?;
        trace!(flow = %flow, flow_id = *id, "Resolved flow");
        Ok(*id)
    }

    /// Id of an already registered flow.
    pub fn cached(&self, flow: &FlowKey) -> Option<FlowId> {
        self.cache.get(flow).and_then(|cell| cell.get().copied())
    }

    /// Number of flows with a known id.
    pub fn len(&self) -> usize {
        self.cache.iter().filter(|entry| entry.value().initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached id, here and in the storage collaborator.
    pub async fn clear(&self) {
        self.cache.clear();
        self.storage.clear_cache().await;
    }
}

impl std::fmt::Debug for FlowResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowResolver")
            .field("session_id", &self.session_id)
            .field("flows", &self.cache.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemoryStorage;
    use crate::test_utils::{SlowStorage, flow_key};

    #[tokio::test]
    async fn resolves_and_caches() {
        let storage = Arc::new(MemoryStorage::new());
        let resolver = FlowResolver::new(1, storage.clone());
        let flow = flow_key(443);

        assert_eq!(resolver.cached(&flow), None);
        let id = resolver.resolve(&flow).await.unwrap();
        assert_eq!(resolver.resolve(&flow).await.unwrap(), id);
        assert_eq!(resolver.cached(&flow), Some(id));
        assert_eq!(storage.flow_registrations(), 1);
        assert_eq!(resolver.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resolution_registers_once() {
        let storage = Arc::new(SlowStorage::default());
        let resolver = Arc::new(FlowResolver::new(1, storage.clone()));
        let flow = flow_key(8080);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let resolver = Arc::clone(&resolver);
                let flow = flow.clone();
                tokio::spawn(async move { resolver.resolve(&flow).await })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(storage.registrations(), 1);
    }

    #[tokio::test]
    async fn clear_forgets_everything() {
        let storage = Arc::new(MemoryStorage::new());
        let resolver = FlowResolver::new(1, storage.clone());
        let first = resolver.resolve(&flow_key(1)).await.unwrap();

        resolver.clear().await;
        assert!(resolver.is_empty());

        let second = resolver.resolve(&flow_key(1)).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(storage.flow_registrations(), 2);
    }
}
