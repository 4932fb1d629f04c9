//! Agent registry for runtime descriptor lookup.
//!
//! A thread-safe catalog of [`AgentDescriptor`]s indexed by id, searchable by
//! capability tag in registration order. Registration normally happens at
//! startup; afterwards the catalog is read-only except for an explicit
//! [`AgentRegistry::reload`], which swaps the whole catalog under the write
//! lock so no reader ever observes a half-applied reload.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use maestro_types::agent::AgentDescriptor;
use maestro_types::error::RegistryError;

static GLOBAL_REGISTRY: OnceLock<AgentRegistry> = OnceLock::new();

#[derive(Debug, Default)]
struct Catalog {
    by_id: HashMap<String, Arc<AgentDescriptor>>,
    order: Vec<String>,
}

impl Catalog {
    fn insert(&mut self, descriptor: AgentDescriptor) {
        let id = descriptor.id.clone();
        if self.by_id.insert(id.clone(), Arc::new(descriptor)).is_none() {
            self.order.push(id);
        }
    }
}

/// Registry of agent capability descriptors.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    catalog: RwLock<Catalog>,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from descriptors, in order.
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = AgentDescriptor>) -> Self {
        let registry = Self::new();
        for descriptor in descriptors {
            registry.register(descriptor);
        }
        registry
    }

    /// Add or replace a descriptor by id.
    ///
    /// A replaced descriptor keeps its original registration position.
    pub fn register(&self, descriptor: AgentDescriptor) {
        tracing::debug!(agent_id = %descriptor.id, "registering agent descriptor");
        self.write().insert(descriptor);
    }

    /// Look up a descriptor by id.
    pub fn find(&self, id: &str) -> Result<Arc<AgentDescriptor>, RegistryError> {
        self.read()
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// All descriptors carrying `tag`, in registration order.
    pub fn find_by_capability(&self, tag: &str) -> Vec<Arc<AgentDescriptor>> {
        let catalog = self.read();
        catalog
            .order
            .iter()
            .filter_map(|id| catalog.by_id.get(id))
            .filter(|d| d.has_capability(tag))
            .cloned()
            .collect()
    }

    /// All descriptors, in registration order.
    pub fn list(&self) -> Vec<Arc<AgentDescriptor>> {
        let catalog = self.read();
        catalog
            .order
            .iter()
            .filter_map(|id| catalog.by_id.get(id))
            .cloned()
            .collect()
    }

    /// Replace the entire catalog atomically.
    pub fn reload(&self, descriptors: impl IntoIterator<Item = AgentDescriptor>) {
        let mut fresh = Catalog::default();
        for descriptor in descriptors {
            fresh.insert(descriptor);
        }
        let count = fresh.order.len();
        *self.write() = fresh;
        tracing::info!(agents = count, "agent registry reloaded");
    }

    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Writers never leave the catalog half-updated, so a poisoned lock is recovered.
    fn read(&self) -> RwLockReadGuard<'_, Catalog> {
        self.catalog.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Catalog> {
        self.catalog.write().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Process-wide instance
// ---------------------------------------------------------------------------

/// Install the process-wide registry. Succeeds once per process.
pub fn install_global(registry: AgentRegistry) -> Result<&'static AgentRegistry, RegistryError> {
    GLOBAL_REGISTRY
        .set(registry)
        .map_err(|_| RegistryError::AlreadyInstalled)?;
    GLOBAL_REGISTRY.get().ok_or(RegistryError::AlreadyInstalled)
}

/// The process-wide registry, if one was installed.
pub fn global() -> Option<&'static AgentRegistry> {
    GLOBAL_REGISTRY.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str, tags: &[&str]) -> AgentDescriptor {
        let mut d = AgentDescriptor::new(id);
        d.capability_tags = tags.iter().map(|t| t.to_string()).collect();
        d
    }

    #[test]
    fn test_register_and_find() {
        let registry = AgentRegistry::new();
        registry.register(agent("writer", &["drafting"]));
        assert_eq!(registry.find("writer").unwrap().id, "writer");
        assert_eq!(
            registry.find("ghost").unwrap_err(),
            RegistryError::NotFound("ghost".to_string())
        );
    }

    #[test]
    fn test_register_replaces_in_place() {
        let registry = AgentRegistry::from_descriptors([
            agent("a", &["x"]),
            agent("b", &["x"]),
        ]);
        registry.register(agent("a", &["x", "y"]));

        assert_eq!(registry.len(), 2);
        let ids: Vec<String> = registry
            .find_by_capability("x")
            .iter()
            .map(|d| d.id.clone())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(registry.find("a").unwrap().has_capability("y"));
    }

    #[test]
    fn test_find_by_capability_registration_order() {
        let registry = AgentRegistry::from_descriptors([
            agent("c", &["search"]),
            agent("a", &["write"]),
            agent("b", &["search", "write"]),
        ]);
        let ids: Vec<String> = registry
            .find_by_capability("search")
            .iter()
            .map(|d| d.id.clone())
            .collect();
        assert_eq!(ids, vec!["c", "b"]);
        assert!(registry.find_by_capability("none").is_empty());
    }

    #[test]
    fn test_reload_swaps_catalog() {
        let registry = AgentRegistry::from_descriptors([agent("old", &[])]);
        let held = registry.find("old").unwrap();

        registry.reload([agent("new", &[])]);

        assert!(registry.find("old").is_err());
        assert!(registry.find("new").is_ok());
        // Outstanding handles stay valid after a reload.
        assert_eq!(held.id, "old");
    }

    #[test]
    fn test_concurrent_reads_during_reload() {
        let registry = Arc::new(AgentRegistry::from_descriptors([agent("a", &["t"])]));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        // Either catalog is acceptable, never a partial one.
                        let found = registry.find_by_capability("t");
                        assert_eq!(found.len(), 1);
                    }
                })
            })
            .collect();

        for i in 0..50 {
            registry.reload([agent(&format!("agent-{i}"), &["t"])]);
        }
        for handle in readers {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_global_installs_once() {
        install_global(AgentRegistry::from_descriptors([agent("g", &[])])).unwrap();
        let err = install_global(AgentRegistry::new()).unwrap_err();
        assert_eq!(err, RegistryError::AlreadyInstalled);
        assert!(global().unwrap().find("g").is_ok());
    }
}
