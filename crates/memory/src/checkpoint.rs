//! Session snapshot persistence. The full session payload is an opaque
//! binary blob on disk; a `checkpoint`-kind memory carries the searchable
//! summary. Blob writes follow the same tmp-file-then-rename pattern used
//! elsewhere in this crate for crash safety.
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{ContextdError, Result};
use crate::schema::{Memory, MemoryKind, Scope};
use crate::store::MemoryStore;

/// `{session_id, owner_id, project_id, branch, title, summary, token_count,
/// messages_digest, created_at}` (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub session_id: Uuid,
    pub owner_id: String,
    pub project_id: String,
    pub branch: String,
    pub title: String,
    pub summary: String,
    pub token_count: u64,
    pub messages_digest: String,
    pub created_at: DateTime<Utc>,
    /// Opaque full session payload, written to the blob file and not
    /// embedded or indexed.
    pub payload: Vec<u8>,
}

impl Snapshot {
    fn scope(&self) -> Scope {
        Scope {
            owner_id: self.owner_id.clone(),
            project_id: self.project_id.clone(),
            branch: self.branch.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CheckpointFilters {
    pub project_id: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

pub struct Checkpoint {
    store: std::sync::Arc<MemoryStore>,
    data_dir: PathBuf,
}

impl Checkpoint {
    pub fn new(store: std::sync::Arc<MemoryStore>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            data_dir: data_dir.into(),
        }
    }

    fn blob_path(&self, session_id: Uuid) -> PathBuf {
        self.data_dir.join("checkpoints").join(format!("{session_id}.blob"))
    }

    /// Writes the blob, then the summary memory. On memory-write failure the
    /// blob is removed as a compensating action (§4.4).
    pub async fn save(&self, snapshot: Snapshot) -> Result<Uuid> {
        let path = self.blob_path(snapshot.session_id);
        let bytes = bincode::serde::encode_to_vec(&snapshot, bincode::config::standard())
            .map_err(ContextdError::from)?;
        self.write_blob(&path, &bytes).await?;

        let scope = snapshot.scope();
        let mut memory = Memory::new(
            &scope,
            MemoryKind::Checkpoint,
            snapshot.title.clone(),
            format!("checkpoint for session {}", snapshot.session_id),
            snapshot.summary.clone(),
        );
        memory.metadata.insert("session_id".to_string(), snapshot.session_id.to_string());
        memory
            .metadata
            .insert("token_count".to_string(), snapshot.token_count.to_string());
        memory
            .metadata
            .insert("messages_digest".to_string(), snapshot.messages_digest.clone());

        match self.store.put(memory).await {
            Ok(id) => Ok(id),
            Err(err) => {
                let _ = tokio::fs::remove_file(&path).await;
                Err(err)
            }
        }
    }

    /// Loads the blob for `session_id`, bound to `owner_id`. A mismatch is
    /// reported as `NotFound`, never `Invalid` — callers must not learn
    /// whether the session exists under a different owner.
    pub async fn resume(&self, owner_id: &str, session_id: Uuid) -> Result<Vec<u8>> {
        let path = self.blob_path(session_id);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(ContextdError::not_found(format!("no checkpoint for session {session_id}")));
        }
        let bytes = tokio::fs::read(&path).await?;
        let snapshot: Snapshot = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .map(|(s, _)| s)
            .map_err(ContextdError::from)?;
        if snapshot.owner_id != owner_id {
            return Err(ContextdError::not_found(format!("no checkpoint for session {session_id}")));
        }
        Ok(snapshot.payload)
    }

    /// Checkpoint summaries for a scope, newest first.
    pub async fn list(&self, scope: &Scope, filters: CheckpointFilters) -> Result<Vec<Memory>> {
        let mut all = self.store.redb().all_for_scope(scope)?;
        all.retain(|m| {
            m.kind == MemoryKind::Checkpoint
                && filters
                    .project_id
                    .as_ref()
                    .map(|p| p == &m.project_id)
                    .unwrap_or(true)
        });
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let limit = if filters.limit == 0 { all.len() } else { filters.limit };
        Ok(all.into_iter().skip(filters.offset).take(limit).collect())
    }

    async fn write_blob(&self, path: &Path, snapshot: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = {
            let filename = path.file_name().map(|f| f.to_string_lossy().to_string()).unwrap_or_default();
            path.with_file_name(format!("{filename}.tmp"))
        };

        let write_result: std::io::Result<()> = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .mode_or_default()
                .open(&tmp_path)
                .await?;
            file.write_all(snapshot).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(err) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }
}

/// Extension to set owner-only permissions at creation time on unix, and a
/// no-op elsewhere.
trait OpenOptionsExt {
    fn mode_or_default(self) -> Self;
}

impl OpenOptionsExt for tokio::fs::OpenOptions {
    #[cfg(unix)]
    fn mode_or_default(mut self) -> Self {
        use std::os::unix::fs::OpenOptionsExt as _;
        self.mode(0o600);
        self
    }

    #[cfg(not(unix))]
    fn mode_or_default(self) -> Self {
        self
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use contextd_llm::Embedder;

    use super::*;
    use crate::redb_store::RedbStore;
    use crate::vector_index::InMemoryVectorIndex;

    struct FixedEmbedder;

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, texts: &[String]) -> contextd_llm::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.1, 0.2]).collect())
        }
    }

    fn test_checkpoint() -> (Checkpoint, Scope, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new(
            Arc::new(RedbStore::open(dir.path().join("s.redb")).unwrap()),
            Arc::new(InMemoryVectorIndex::new()),
            Arc::new(FixedEmbedder),
        ));
        let checkpoint = Checkpoint::new(store, dir.path().to_path_buf());
        let scope = Scope::main(crate::identity::derive_owner_id("alice"), "proj".to_string());
        (checkpoint, scope, dir)
    }

    fn snapshot(scope: &Scope, title: &str, payload: &[u8]) -> Snapshot {
        Snapshot {
            session_id: Uuid::new_v4(),
            owner_id: scope.owner_id.clone(),
            project_id: scope.project_id.clone(),
            branch: scope.branch.clone(),
            title: title.to_string(),
            summary: "summary text".to_string(),
            token_count: 128,
            messages_digest: "deadbeef".to_string(),
            created_at: Utc::now(),
            payload: payload.to_vec(),
        }
    }

    #[tokio::test]
    async fn save_then_resume_round_trips_payload() {
        let (checkpoint, scope, _dir) = test_checkpoint();
        let snap = snapshot(&scope, "t", b"session bytes");
        let session_id = snap.session_id;
        checkpoint.save(snap).await.unwrap();

        let payload = checkpoint.resume(&scope.owner_id, session_id).await.unwrap();
        assert_eq!(payload, b"session bytes");
    }

    #[tokio::test]
    async fn resume_rejects_mismatched_owner() {
        let (checkpoint, scope, _dir) = test_checkpoint();
        let snap = snapshot(&scope, "t", b"session bytes");
        let session_id = snap.session_id;
        checkpoint.save(snap).await.unwrap();

        let err = checkpoint.resume("not-the-owner", session_id).await.unwrap_err();
        assert!(matches!(err, ContextdError::NotFound(_)));
    }

    #[tokio::test]
    async fn resume_reports_not_found_for_unknown_session() {
        let (checkpoint, _scope, _dir) = test_checkpoint();
        let err = checkpoint.resume("anyone", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ContextdError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_orders_by_created_at_descending() {
        let (checkpoint, scope, _dir) = test_checkpoint();
        let mut older = snapshot(&scope, "older", b"a");
        older.created_at = Utc::now() - chrono::Duration::hours(2);
        let mut newer = snapshot(&scope, "newer", b"b");
        newer.created_at = Utc::now();

        checkpoint.save(older).await.unwrap();
        checkpoint.save(newer).await.unwrap();

        let listed = checkpoint.list(&scope, CheckpointFilters::default()).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].title, "newer");
        assert_eq!(listed[1].title, "older");
    }

    #[tokio::test]
    async fn list_respects_limit_and_offset() {
        let (checkpoint, scope, _dir) = test_checkpoint();
        for i in 0..3 {
            let mut snap = snapshot(&scope, &format!("s{i}"), b"x");
            snap.created_at = Utc::now() - chrono::Duration::seconds(i);
            checkpoint.save(snap).await.unwrap();
        }

        let filters = CheckpointFilters {
            project_id: None,
            limit: 1,
            offset: 1,
        };
        let listed = checkpoint.list(&scope, filters).await.unwrap();
        assert_eq!(listed.len(), 1);
    }
}
