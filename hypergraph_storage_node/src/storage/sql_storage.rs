// SQLite-backed local knowledge store
//
// Atoms are kept as JSON documents keyed by handle. Each call opens its own
// connection on the blocking pool so the async runtime never waits on disk.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Result, StorageNodeError};
use crate::storage::{merge_truth_values, LocalKnowledgeStore, ValueMerge};
use crate::types::{Atom, TruthValue};

#[derive(Debug, Clone)]
pub struct SqlKnowledgeStore {
    db_path: PathBuf,
}

impl SqlKnowledgeStore {
    /// Open (creating if needed) the database at `db_path`
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let store = Self {
            db_path: db_path.as_ref().to_path_buf(),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<()> {
        debug!("Initializing atom table at {:?}", self.db_path);

        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&self.db_path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS atoms (
                handle TEXT PRIMARY KEY,
                atom_type TEXT NOT NULL,
                data TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_atoms_type ON atoms(atom_type)",
            [],
        )?;
        Ok(())
    }

    async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)?;
            f(&conn)
        })
        .await?
    }
}

fn decode_atom(data: &str) -> Result<Atom> {
    serde_json::from_str(data)
        .map_err(|e| StorageNodeError::Storage(format!("corrupt atom row: {}", e)))
}

impl ValueMerge for SqlKnowledgeStore {
    fn merge(&self, local: &TruthValue, incoming: &TruthValue) -> TruthValue {
        merge_truth_values(local, incoming)
    }
}

#[async_trait]
impl LocalKnowledgeStore for SqlKnowledgeStore {
    async fn store(&self, atom: Atom) -> Result<()> {
        let data = serde_json::to_string(&atom)?;
        self.with_connection(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO atoms (handle, atom_type, data, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![atom.handle, atom.atom_type, data, chrono::Utc::now().timestamp_millis()],
            )?;
            Ok(())
        })
        .await
    }

    async fn fetch(&self, handle: &str) -> Result<Option<Atom>> {
        let handle = handle.to_string();
        self.with_connection(move |conn| {
            let data: Option<String> = conn
                .query_row("SELECT data FROM atoms WHERE handle = ?1", params![handle], |row| {
                    row.get(0)
                })
                .optional()?;
            data.as_deref().map(decode_atom).transpose()
        })
        .await
    }

    async fn remove(&self, handle: &str) -> Result<bool> {
        let handle = handle.to_string();
        self.with_connection(move |conn| {
            let removed = conn.execute("DELETE FROM atoms WHERE handle = ?1", params![handle])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn all_atoms(&self) -> Result<Vec<Atom>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT data FROM atoms ORDER BY handle")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut atoms = Vec::new();
            for row in rows {
                atoms.push(decode_atom(&row?)?);
            }
            Ok(atoms)
        })
        .await
    }

    async fn size(&self) -> Result<usize> {
        self.with_connection(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM atoms", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sql_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("atoms.db");

        let store = SqlKnowledgeStore::open(&path).unwrap();
        let link = Atom::link("ListLink", vec!["ConceptNode:a".into(), "ConceptNode:b".into()])
            .with_truth_value(0.7, 0.2);
        store.store(Atom::concept("a")).await.unwrap();
        store.store(link.clone()).await.unwrap();

        let reopened = SqlKnowledgeStore::open(&path).unwrap();
        assert_eq!(reopened.size().await.unwrap(), 2);
        assert_eq!(reopened.fetch(&link.handle).await.unwrap(), Some(link));

        assert!(reopened.remove("ConceptNode:a").await.unwrap());
        assert!(!reopened.remove("ConceptNode:a").await.unwrap());
        assert_eq!(reopened.all_atoms().await.unwrap().len(), 1);
    }
}
