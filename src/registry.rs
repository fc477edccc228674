//! Namespace Registry: the only place connections are created.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::connection::{ConnectionManager, Transport};
use crate::errors::{Resource, SyncError};
use crate::model::Namespace;
use crate::sync_config::SyncConfig;

/// Maps each namespace to exactly one [`ConnectionManager`], created lazily.
pub struct NamespaceRegistry {
    config: SyncConfig,
    transport: Arc<dyn Transport>,
    errors: broadcast::Sender<SyncError>,
    connections: Mutex<HashMap<Namespace, Arc<ConnectionManager>>>,
}

impl NamespaceRegistry {
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        errors: broadcast::Sender<SyncError>,
    ) -> Self {
        Self {
            config,
            transport,
            errors,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Existing connection for `namespace`, if one was created.
    pub fn get(&self, namespace: Namespace) -> Option<Arc<ConnectionManager>> {
        self.connections.lock().get(&namespace).cloned()
    }

    /// Connection for `namespace`, creating it on first reference.
    ///
    /// Construction happens under the map lock so two callers can never
    /// race to build the same namespace. Fails fast once the configured
    /// number of open namespaces is reached.
    pub fn get_or_create(&self, namespace: Namespace) -> Result<Arc<ConnectionManager>, SyncError> {
        let mut connections = self.connections.lock();
        if let Some(existing) = connections.get(&namespace) {
            return Ok(Arc::clone(existing));
        }

        let limit = self.config.registry.max_namespaces;
        if connections.len() >= limit {
            tracing::warn!(namespace = %namespace, limit, "namespace limit reached");
            return Err(SyncError::CapacityExceeded {
                resource: Resource::Namespaces,
                limit,
            });
        }

        let manager = Arc::new(ConnectionManager::new(
            namespace,
            &self.config,
            Arc::clone(&self.transport),
            self.errors.clone(),
        ));
        connections.insert(namespace, Arc::clone(&manager));
        tracing::debug!(namespace = %namespace, open = connections.len(), "namespace created");
        Ok(manager)
    }

    /// Run `f` against the namespace's connection only if it exists.
    pub fn with_namespace<R>(
        &self,
        namespace: Namespace,
        f: impl FnOnce(&ConnectionManager) -> R,
    ) -> Option<R> {
        let manager = self.get(namespace)?;
        Some(f(&manager))
    }

    /// Disconnect and forget a namespace, freeing its slot.
    pub fn release(&self, namespace: Namespace) -> bool {
        let removed = self.connections.lock().remove(&namespace);
        match removed {
            Some(manager) => {
                manager.disconnect();
                tracing::debug!(namespace = %namespace, "namespace released");
                true
            }
            None => false,
        }
    }

    /// Open namespaces, sorted.
    pub fn namespaces(&self) -> Vec<Namespace> {
        let mut names: Vec<_> = self.connections.lock().keys().copied().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
