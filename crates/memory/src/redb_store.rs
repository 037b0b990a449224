/// Durable metadata store backed by [`redb`].
///
/// Holds the full [`Memory`] record (its embedding included — the live ANN
/// vector used for search lives separately in the [`VectorIndex`], this is
/// the durable copy that survives a vector-index rebuild) plus a
/// content-addressed embedding cache keyed by SHA-256 of `content`, so
/// re-identical content is never re-embedded.
///
/// # Tables
///
/// | Name               | Key                          | Value                        |
/// |--------------------|-------------------------------|-------------------------------|
/// | `memories`         | `"{owner}/{project}/{branch}/{id}"` | bincode [`Memory`]      |
/// | `scope_index`      | collection name               | newline-separated memory keys |
/// | `embedding_cache`  | SHA-256 hex of content         | bincode `Vec<f32>`           |
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bincode::config;
use lru::LruCache;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{ContextdError, Result};
use crate::schema::{Memory, Scope};

const MEMORIES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("memories");
const SCOPE_INDEX_TABLE: TableDefinition<&str, &str> = TableDefinition::new("scope_index");
const EMBEDDING_CACHE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("embedding_cache");

/// Number of full [`Memory`] records held in the hot-path LRU cache.
const LRU_CAPACITY: usize = 512;

/// Snapshot of the LRU cache performance counters.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub capacity: usize,
    pub len: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_pct: f32,
}

pub struct RedbStore {
    db: Database,
    path: PathBuf,
    cache: Mutex<LruCache<String, Memory>>,
    cache_hits: Mutex<u64>,
    cache_misses: Mutex<u64>,
}

fn memory_key(scope: &Scope, id: Uuid) -> String {
    format!("{}/{}/{}/{}", scope.owner_id, scope.project_id, scope.branch, id)
}

fn content_hash(content: &str) -> String {
    let mut h = Sha256::new();
    h.update(content.as_bytes());
    format!("{:x}", h.finalize())
}

impl RedbStore {
    /// Open or create the redb database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(&path)
            .map_err(|e| ContextdError::fatal(format!("opening redb store at {}: {e}", path.display())))?;

        {
            let tx = db.begin_write()?;
            tx.open_table(MEMORIES_TABLE)?;
            tx.open_table(SCOPE_INDEX_TABLE)?;
            tx.open_table(EMBEDDING_CACHE_TABLE)?;
            tx.commit()?;
        }

        Ok(Self {
            db,
            path,
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(LRU_CAPACITY).unwrap())),
            cache_hits: Mutex::new(0),
            cache_misses: Mutex::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or fully overwrite a memory record. Idempotent on `id`: a
    /// second `put` with the same id replaces the stored fields.
    pub fn put(&self, memory: &Memory) -> Result<()> {
        let scope = memory.scope();
        let key = memory_key(&scope, memory.id);
        let bytes = bincode::serde::encode_to_vec(memory, config::standard())
            .map_err(ContextdError::from)?;

        let collection = scope.collection_name();
        let tx = self.db.begin_write()?;
        {
            let mut memories = tx.open_table(MEMORIES_TABLE)?;
            memories.insert(key.as_str(), bytes.as_slice())?;

            let mut scope_index = tx.open_table(SCOPE_INDEX_TABLE)?;
            let existing = scope_index
                .get(collection.as_str())?
                .map(|v| v.value().to_string())
                .unwrap_or_default();
            if !existing.lines().any(|line| line == key) {
                let updated = if existing.is_empty() {
                    key.clone()
                } else {
                    format!("{existing}\n{key}")
                };
                scope_index.insert(collection.as_str(), updated.as_str())?;
            }
        }
        tx.commit()?;

        self.cache.lock().unwrap().put(key, memory.clone());
        Ok(())
    }

    pub fn get(&self, scope: &Scope, id: Uuid) -> Result<Option<Memory>> {
        let key = memory_key(scope, id);

        if let Some(hit) = self.cache.lock().unwrap().get(&key) {
            *self.cache_hits.lock().unwrap() += 1;
            return Ok(Some(hit.clone()));
        }
        *self.cache_misses.lock().unwrap() += 1;

        let tx = self.db.begin_read()?;
        let table = tx.open_table(MEMORIES_TABLE)?;
        match table.get(key.as_str())? {
            None => Ok(None),
            Some(v) => {
                let (memory, _): (Memory, usize) =
                    bincode::serde::decode_from_slice(v.value(), config::standard())
                        .map_err(ContextdError::from)?;
                self.cache.lock().unwrap().put(key, memory.clone());
                Ok(Some(memory))
            }
        }
    }

    pub fn delete(&self, scope: &Scope, id: Uuid) -> Result<bool> {
        let key = memory_key(scope, id);
        let collection = scope.collection_name();

        let tx = self.db.begin_write()?;
        let existed;
        {
            let mut memories = tx.open_table(MEMORIES_TABLE)?;
            existed = memories.remove(key.as_str())?.is_some();

            if existed {
                let mut scope_index = tx.open_table(SCOPE_INDEX_TABLE)?;
                let remaining: String = scope_index
                    .get(collection.as_str())?
                    .map(|v| v.value().to_string())
                    .unwrap_or_default()
                    .lines()
                    .filter(|line| *line != key)
                    .collect::<Vec<_>>()
                    .join("\n");
                scope_index.insert(collection.as_str(), remaining.as_str())?;
            }
        }
        tx.commit()?;

        self.cache.lock().unwrap().pop(&key);
        Ok(existed)
    }

    /// All memory records currently stored for a scope's collection,
    /// including archived ones — callers apply their own filters.
    pub fn all_for_scope(&self, scope: &Scope) -> Result<Vec<Memory>> {
        let collection = scope.collection_name();
        let tx = self.db.begin_read()?;
        let scope_index = tx.open_table(SCOPE_INDEX_TABLE)?;
        let keys: Vec<String> = scope_index
            .get(collection.as_str())?
            .map(|v| v.value().to_string())
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect();

        let memories_table = tx.open_table(MEMORIES_TABLE)?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(v) = memories_table.get(key.as_str())? {
                let (memory, _): (Memory, usize) =
                    bincode::serde::decode_from_slice(v.value(), config::standard())
                        .map_err(ContextdError::from)?;
                out.push(memory);
            }
        }
        Ok(out)
    }

    /// Look up a cached embedding for `content` by its SHA-256 hash.
    pub fn cached_embedding(&self, content: &str) -> Result<Option<Vec<f32>>> {
        let hash = content_hash(content);
        let tx = self.db.begin_read()?;
        let table = tx.open_table(EMBEDDING_CACHE_TABLE)?;
        match table.get(hash.as_str())? {
            None => Ok(None),
            Some(v) => {
                let (embedding, _): (Vec<f32>, usize) =
                    bincode::serde::decode_from_slice(v.value(), config::standard())
                        .map_err(ContextdError::from)?;
                Ok(Some(embedding))
            }
        }
    }

    pub fn cache_embedding(&self, content: &str, embedding: &[f32]) -> Result<()> {
        let hash = content_hash(content);
        let bytes = bincode::serde::encode_to_vec(embedding, config::standard())
            .map_err(ContextdError::from)?;
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(EMBEDDING_CACHE_TABLE)?;
            table.insert(hash.as_str(), bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn cache_stats(&self) -> CacheStats {
        let cache = self.cache.lock().unwrap();
        let hits = *self.cache_hits.lock().unwrap();
        let misses = *self.cache_misses.lock().unwrap();
        CacheStats {
            capacity: LRU_CAPACITY,
            len: cache.len(),
            hits,
            misses,
            hit_rate_pct: if hits + misses == 0 {
                0.0
            } else {
                (hits as f32 / (hits + misses) as f32) * 100.0
            },
        }
    }

    /// Every memory record across all scopes, for callers that need to
    /// discover which tenants/projects currently hold data (the scheduler's
    /// active-scope sweep).
    pub fn all_memories(&self) -> Result<Vec<Memory>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(MEMORIES_TABLE)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            let (memory, _): (Memory, usize) =
                bincode::serde::decode_from_slice(v.value(), config::standard())
                    .map_err(ContextdError::from)?;
            out.push(memory);
        }
        Ok(out)
    }

    pub fn len_for_scope(&self, scope: &Scope) -> Result<usize> {
        Ok(self.all_for_scope(scope)?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(MEMORIES_TABLE)?;
        Ok(table.is_empty()?)
    }
}
