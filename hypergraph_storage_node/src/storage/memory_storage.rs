use crate::error::{Result, StorageNodeError};
use crate::storage::{merge_truth_values, LocalKnowledgeStore, ValueMerge};
use crate::types::{Atom, TruthValue};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

const DEFAULT_MAX_ENTRIES: usize = 1_000_000;

#[derive(Clone, Debug)]
pub struct MemoryStorageConfig {
    /// Maximum number of atoms held before stores are refused
    pub max_entries: usize,
}

impl Default for MemoryStorageConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

/// Volatile local store keyed by atom handle
#[derive(Clone, Debug)]
pub struct MemoryKnowledgeStore {
    atoms: Arc<DashMap<String, Atom>>,
    config: MemoryStorageConfig,
}

impl Default for MemoryKnowledgeStore {
    fn default() -> Self {
        Self::new(MemoryStorageConfig::default())
    }
}

impl MemoryKnowledgeStore {
    pub fn new(config: MemoryStorageConfig) -> Self {
        Self {
            atoms: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self::new(MemoryStorageConfig { max_entries })
    }

    pub fn contains(&self, handle: &str) -> bool {
        self.atoms.contains_key(handle)
    }
}

impl ValueMerge for MemoryKnowledgeStore {
    fn merge(&self, local: &TruthValue, incoming: &TruthValue) -> TruthValue {
        merge_truth_values(local, incoming)
    }
}

#[async_trait]
impl LocalKnowledgeStore for MemoryKnowledgeStore {
    async fn store(&self, atom: Atom) -> Result<()> {
        if !self.atoms.contains_key(&atom.handle) && self.atoms.len() >= self.config.max_entries {
            return Err(StorageNodeError::Storage(format!(
                "memory store full ({} atoms), cannot store {}",
                self.config.max_entries, atom.handle
            )));
        }
        debug!("Storing atom {} in memory", atom.handle);
        self.atoms.insert(atom.handle.clone(), atom);
        Ok(())
    }

    async fn fetch(&self, handle: &str) -> Result<Option<Atom>> {
        Ok(self.atoms.get(handle).map(|entry| entry.value().clone()))
    }

    async fn remove(&self, handle: &str) -> Result<bool> {
        Ok(self.atoms.remove(handle).is_some())
    }

    async fn all_atoms(&self) -> Result<Vec<Atom>> {
        let mut atoms: Vec<Atom> = self.atoms.iter().map(|entry| entry.value().clone()).collect();
        atoms.sort_by(|a, b| a.handle.cmp(&b.handle));
        Ok(atoms)
    }

    async fn size(&self) -> Result<usize> {
        Ok(self.atoms.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AtomSpace;

    #[tokio::test]
    async fn test_memory_store_basic() {
        let store = MemoryKnowledgeStore::default();
        let atom = Atom::concept("cat").with_truth_value(0.9, 0.4);

        store.store(atom.clone()).await.unwrap();
        assert_eq!(store.fetch("ConceptNode:cat").await.unwrap(), Some(atom));
        assert_eq!(store.size().await.unwrap(), 1);

        assert!(store.remove("ConceptNode:cat").await.unwrap());
        assert!(!store.remove("ConceptNode:cat").await.unwrap());
        assert_eq!(store.fetch("ConceptNode:cat").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let store = MemoryKnowledgeStore::with_capacity(1);
        store.store(Atom::concept("a")).await.unwrap();
        // Replacing an existing handle does not need extra room
        store.store(Atom::concept("a").with_truth_value(0.1, 0.1)).await.unwrap();
        assert!(matches!(store.store(Atom::concept("b")).await, Err(StorageNodeError::Storage(_))));
    }

    #[tokio::test]
    async fn test_bulk_operations() {
        let store = MemoryKnowledgeStore::default();
        let space: AtomSpace = vec![Atom::concept("a"), Atom::concept("b")].into_iter().collect();
        store.store_all(&space).await.unwrap();

        let mut loaded = AtomSpace::new();
        store.load_all(&mut loaded).await.unwrap();
        assert_eq!(loaded, space);
    }
}
