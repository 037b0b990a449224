use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use contextd_llm::{Embedder, embed_with_retry};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::error::{ContextdError, Result};
use crate::identity::validate_owner_id;
use crate::schema::{Memory, MemoryKind, MemoryState, QueryFilters, Scope, ScoredMemory};
use crate::secret::scrub_memory_fields;
use crate::redb_store::RedbStore;
use crate::vector_index::VectorIndex;

/// Number of embed attempts before a `Put` surfaces a transient error to the
/// caller (§4.1 "retried up to a bounded number of attempts").
const DEFAULT_MAX_EMBED_ATTEMPTS: u32 = 4;

fn memory_metadata(memory: &Memory) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert("kind".to_string(), format!("{:?}", memory.kind).to_lowercase());
    metadata.insert("state".to_string(), format!("{:?}", memory.state).to_lowercase());
    metadata.insert("tags".to_string(), memory.tags.iter().cloned().collect::<Vec<_>>().join(","));
    metadata
}

/// Tenant- and project-scoped CRUD + semantic-search interface over the
/// vector index. Owns embedding generation, metadata schema, and collection
/// lifecycle; never talks to the network itself beyond the `Embedder` and
/// `VectorIndex` handles it is constructed with.
pub struct MemoryStore {
    redb: Arc<RedbStore>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    /// Per-collection-name locks. Guarded by a top-level read/write lock per
    /// §5; entries are never evicted during process lifetime.
    scope_locks: RwLock<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    created_collections: RwLock<std::collections::HashSet<String>>,
    max_embed_attempts: u32,
}

impl MemoryStore {
    pub fn new(redb: Arc<RedbStore>, index: Arc<dyn VectorIndex>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            redb,
            index,
            embedder,
            scope_locks: RwLock::new(HashMap::new()),
            created_collections: RwLock::new(std::collections::HashSet::new()),
            max_embed_attempts: DEFAULT_MAX_EMBED_ATTEMPTS,
        }
    }

    pub fn with_max_embed_attempts(mut self, attempts: u32) -> Self {
        self.max_embed_attempts = attempts;
        self
    }

    fn scope_lock(&self, collection: &str) -> Arc<tokio::sync::Mutex<()>> {
        if let Some(lock) = self.scope_locks.read().unwrap().get(collection) {
            return lock.clone();
        }
        self.scope_locks
            .write()
            .unwrap()
            .entry(collection.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Double-checked-locked collection creation: a race between two writers
    /// to a fresh namespace results in exactly one `CreateCollection` call.
    async fn ensure_collection(&self, collection: &str, dim: usize, _guard: &tokio::sync::MutexGuard<'_, ()>) -> Result<()> {
        if self.created_collections.read().unwrap().contains(collection) {
            return Ok(());
        }
        self.index.create_collection(collection, dim).await?;
        self.created_collections
            .write()
            .unwrap()
            .insert(collection.to_string());
        Ok(())
    }

    #[instrument(skip(self, memory), fields(id = %memory.id))]
    pub async fn put(&self, memory: Memory) -> Result<Uuid> {
        validate_owner_id(&memory.owner_id)?;
        let scope = memory.scope();
        let collection = scope.collection_name();
        let mut memory = memory;

        scrub_memory_fields(&mut memory.title, &mut memory.description, &mut memory.content);

        let lock = self.scope_lock(&collection);
        let guard = lock.lock().await;

        if memory.embedding.is_empty() {
            memory.embedding = match self.redb.cached_embedding(&memory.content)? {
                Some(cached) => cached,
                None => {
                    let vectors = embed_with_retry(
                        self.embedder.as_ref(),
                        &[memory.content.clone()],
                        self.max_embed_attempts,
                    )
                    .await
                    .map_err(|e| ContextdError::transient(e.to_string()))?;
                    let embedding = vectors.into_iter().next().unwrap_or_default();
                    self.redb.cache_embedding(&memory.content, &embedding)?;
                    embedding
                }
            };
        }

        if memory.embedding.is_empty() {
            return Err(ContextdError::fatal("embedder returned an empty vector"));
        }

        self.ensure_collection(&collection, memory.embedding.len(), &guard).await?;

        memory.updated_at = chrono::Utc::now();
        self.redb.put(&memory)?;
        self.index
            .upsert(
                &collection,
                &memory.id.to_string(),
                &memory.embedding,
                memory_metadata(&memory),
            )
            .await?;

        Ok(memory.id)
    }

    /// Tenant-scoped read. A record whose `owner_id` does not match is
    /// reported as `NotFound` — no disclosure that the id exists under a
    /// different owner.
    #[instrument(skip(self))]
    pub async fn get(&self, scope: &Scope, id: Uuid) -> Result<Memory> {
        validate_owner_id(&scope.owner_id)?;
        match self.redb.get(scope, id)? {
            Some(memory) if memory.owner_id == scope.owner_id => Ok(memory),
            _ => Err(ContextdError::not_found(format!("memory {id} not found"))),
        }
    }

    #[instrument(skip(self, text))]
    pub async fn query(
        &self,
        scope: &Scope,
        text: &str,
        k: usize,
        filters: QueryFilters,
    ) -> Result<Vec<ScoredMemory>> {
        validate_owner_id(&scope.owner_id)?;
        let collection = scope.collection_name();

        let query_embedding = embed_with_retry(self.embedder.as_ref(), &[text.to_string()], self.max_embed_attempts)
            .await
            .map_err(|e| ContextdError::transient(e.to_string()))?
            .into_iter()
            .next()
            .unwrap_or_default();

        let mut metadata_filter = HashMap::new();
        metadata_filter.insert(
            "state".to_string(),
            format!("{:?}", filters.effective_state()).to_lowercase(),
        );
        if let Some(kind) = filters.kind {
            metadata_filter.insert("kind".to_string(), format!("{:?}", kind).to_lowercase());
        }

        // Over-fetch so post-hoc tag filtering still has enough candidates.
        let fetch_k = if filters.tags.is_empty() { k } else { k.saturating_mul(4).max(k) };
        let hits = self
            .index
            .query(&collection, &query_embedding, fetch_k, &metadata_filter)
            .await?;

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let Ok(id) = hit.id.parse::<Uuid>() else { continue };
            let Some(memory) = self.redb.get(scope, id)? else { continue };
            if memory.owner_id != scope.owner_id {
                continue;
            }
            if !filters.tags.is_empty() && !filters.tags.is_subset(&memory.tags) {
                continue;
            }
            results.push(ScoredMemory {
                memory,
                score: hit.score.clamp(0.0, 1.0),
            });
        }

        results.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.memory.updated_at.cmp(&a.memory.updated_at))
                .then_with(|| a.memory.id.cmp(&b.memory.id))
        });
        results.truncate(k);

        let hit_ids: Vec<Uuid> = results.iter().map(|r| r.memory.id).collect();
        self.spawn_usage_increment(scope.clone(), hit_ids);

        Ok(results)
    }

    /// Best-effort, non-blocking `usage_count` increment — must not delay
    /// the response (§4.1). Errors are logged, never surfaced.
    fn spawn_usage_increment(&self, scope: Scope, ids: Vec<Uuid>) {
        if ids.is_empty() {
            return;
        }
        let redb = self.redb.clone();
        tokio::spawn(async move {
            for id in ids {
                match redb.get(&scope, id) {
                    Ok(Some(mut memory)) => {
                        memory.usage_count = memory.usage_count.saturating_add(1);
                        if let Err(err) = redb.put(&memory) {
                            warn!(%id, %err, "usage_count increment failed");
                        }
                    }
                    Ok(None) => {}
                    Err(err) => warn!(%id, %err, "usage_count lookup failed"),
                }
            }
        });
    }

    /// Mark `id` archived with a back-reference to `consolidation_id`. Fails
    /// with `Conflict` if already archived under a different consolidation.
    #[instrument(skip(self))]
    pub async fn archive(&self, scope: &Scope, id: Uuid, consolidation_id: Uuid) -> Result<()> {
        let collection = scope.collection_name();
        let lock = self.scope_lock(&collection);
        let _guard = lock.lock().await;

        let mut memory = self.get(scope, id).await?;

        if memory.state == MemoryState::Archived {
            match memory.consolidation_id {
                Some(existing) if existing == consolidation_id => return Ok(()),
                Some(_) => {
                    return Err(ContextdError::conflict(format!(
                        "memory {id} already archived under a different consolidation"
                    )));
                }
                None => {}
            }
        }

        memory.state = MemoryState::Archived;
        memory.consolidation_id = Some(consolidation_id);
        memory.updated_at = chrono::Utc::now();

        self.redb.put(&memory)?;
        self.index
            .upsert(&collection, &memory.id.to_string(), &memory.embedding, memory_metadata(&memory))
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, scope: &Scope, id: Uuid) -> Result<()> {
        let collection = scope.collection_name();
        let lock = self.scope_lock(&collection);
        let _guard = lock.lock().await;

        // Enforce tenant scoping before performing the delete.
        self.get(scope, id).await?;
        self.redb.delete(scope, id)?;
        self.index.delete(&collection, &id.to_string()).await?;
        Ok(())
    }

    pub fn redb(&self) -> &Arc<RedbStore> {
        &self.redb
    }
}
