use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::Result;

/// A point returned from a `VectorIndex::query` call: the point id, its
/// cosine similarity score (not yet clamped/normalised — callers do that),
/// and the metadata dictionary stored alongside it.
#[derive(Debug, Clone)]
pub struct IndexHit {
    pub id: String,
    pub score: f32,
    pub metadata: HashMap<String, String>,
}

/// Metadata-tagged ANN index over named collections. The core treats this as
/// an external, pluggable key-value + ANN service: it creates collections,
/// upserts points, queries, and deletes, but never re-implements the index
/// itself.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn create_collection(&self, name: &str, dim: usize) -> Result<()>;
    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        vector: &[f32],
        metadata: HashMap<String, String>,
    ) -> Result<()>;
    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        metadata_filter: &HashMap<String, String>,
    ) -> Result<Vec<IndexHit>>;
    async fn delete(&self, collection: &str, id: &str) -> Result<()>;
}

struct Collection {
    dim: usize,
    points: HashMap<String, (Vec<f32>, HashMap<String, String>)>,
}

/// In-process fallback implementation used by default and in tests, so the
/// crate builds and exercises its contract with no external service running.
/// Not durable across restarts — production deployments wire a real backend
/// (e.g. the `qdrant` feature) through the service registry instead.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn create_collection(&self, name: &str, dim: usize) -> Result<()> {
        let mut collections = self.collections.write().unwrap();
        collections.entry(name.to_string()).or_insert_with(|| Collection {
            dim,
            points: HashMap::new(),
        });
        Ok(())
    }

    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        vector: &[f32],
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        let mut collections = self.collections.write().unwrap();
        let entry = collections
            .entry(collection.to_string())
            .or_insert_with(|| Collection {
                dim: vector.len(),
                points: HashMap::new(),
            });
        if !entry.points.is_empty() && entry.dim != vector.len() {
            return Err(crate::error::ContextdError::fatal(format!(
                "embedding dimension mismatch: collection expects {}, got {}",
                entry.dim,
                vector.len()
            )));
        }
        entry.dim = vector.len();
        entry
            .points
            .insert(id.to_string(), (vector.to_vec(), metadata));
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        metadata_filter: &HashMap<String, String>,
    ) -> Result<Vec<IndexHit>> {
        let collections = self.collections.read().unwrap();
        let Some(coll) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<IndexHit> = coll
            .points
            .iter()
            .filter(|(_, (_, metadata))| {
                metadata_filter
                    .iter()
                    .all(|(k, v)| metadata.get(k).map(|mv| mv == v).unwrap_or(false))
            })
            .map(|(id, (point, metadata))| IndexHit {
                id: id.clone(),
                score: cosine_similarity(vector, point),
                metadata: metadata.clone(),
            })
            .collect();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        scored.truncate(k);
        Ok(scored)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let mut collections = self.collections.write().unwrap();
        if let Some(coll) = collections.get_mut(collection) {
            coll.points.remove(id);
        }
        Ok(())
    }
}

/// Cosine similarity clamped to `[0, 1]`; mismatched lengths or a zero vector
/// on either side score 0 rather than panicking.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(0.0, 1.0)
}

#[cfg(feature = "qdrant")]
pub mod qdrant_backend {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use qdrant_client::Payload;
    use qdrant_client::qdrant::{
        CreateCollectionBuilder, Distance, PointStruct, SearchPointsBuilder, UpsertPointsBuilder,
        VectorParamsBuilder, point_id::PointIdOptions,
    };
    use qdrant_client::Qdrant;

    use super::{IndexHit, VectorIndex};
    use crate::error::{ContextdError, Result};

    /// Default `VectorIndex` backend: a thin wrapper around `qdrant-client`.
    /// Transient connection failures surface as `ContextdError::Transient` so
    /// the caller's retry policy (§4.1) applies uniformly.
    pub struct QdrantVectorIndex {
        client: Qdrant,
    }

    impl QdrantVectorIndex {
        pub fn new(url: impl AsRef<str>) -> Result<Self> {
            let client = Qdrant::from_url(url.as_ref())
                .build()
                .map_err(|e| ContextdError::transient(e.to_string()))?;
            Ok(Self { client })
        }
    }

    #[async_trait]
    impl VectorIndex for QdrantVectorIndex {
        async fn create_collection(&self, name: &str, dim: usize) -> Result<()> {
            let exists = self
                .client
                .collection_exists(name)
                .await
                .map_err(|e| ContextdError::transient(e.to_string()))?;
            if exists {
                return Ok(());
            }
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(name)
                        .vectors_config(VectorParamsBuilder::new(dim as u64, Distance::Cosine)),
                )
                .await
                .map_err(|e| ContextdError::transient(e.to_string()))?;
            Ok(())
        }

        async fn upsert(
            &self,
            collection: &str,
            id: &str,
            vector: &[f32],
            metadata: HashMap<String, String>,
        ) -> Result<()> {
            let payload: Payload = metadata
                .into_iter()
                .map(|(k, v)| (k, v.into()))
                .collect::<HashMap<_, _>>()
                .into();
            let point = PointStruct::new(id.to_string(), vector.to_vec(), payload);
            self.client
                .upsert_points(UpsertPointsBuilder::new(collection, vec![point]))
                .await
                .map_err(|e| ContextdError::transient(e.to_string()))?;
            Ok(())
        }

        async fn query(
            &self,
            collection: &str,
            vector: &[f32],
            k: usize,
            _metadata_filter: &HashMap<String, String>,
        ) -> Result<Vec<IndexHit>> {
            let result = self
                .client
                .search_points(
                    SearchPointsBuilder::new(collection, vector.to_vec(), k as u64)
                        .with_payload(true),
                )
                .await
                .map_err(|e| ContextdError::transient(e.to_string()))?;

            Ok(result
                .result
                .into_iter()
                .filter_map(|point| {
                    let id = match point.id?.point_id_options? {
                        PointIdOptions::Uuid(u) => u,
                        PointIdOptions::Num(n) => n.to_string(),
                    };
                    let metadata = point
                        .payload
                        .into_iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
                        .collect();
                    Some(IndexHit {
                        id,
                        score: point.score.clamp(0.0, 1.0),
                        metadata,
                    })
                })
                .collect())
        }

        async fn delete(&self, collection: &str, id: &str) -> Result<()> {
            use qdrant_client::qdrant::{DeletePointsBuilder, PointsIdsList};
            self.client
                .delete_points(
                    DeletePointsBuilder::new(collection).points(PointsIdsList {
                        ids: vec![id.to_string().into()],
                    }),
                )
                .await
                .map_err(|e| ContextdError::transient(e.to_string()))?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn query_orders_by_descending_score() {
        let index = InMemoryVectorIndex::new();
        index.create_collection("c", 2).await.unwrap();
        index
            .upsert("c", "a", &[1.0, 0.0], HashMap::new())
            .await
            .unwrap();
        index
            .upsert("c", "b", &[0.0, 1.0], HashMap::new())
            .await
            .unwrap();

        let hits = index.query("c", &[1.0, 0.0], 2, &HashMap::new()).await.unwrap();
        assert_eq!(hits[0].id, "a");
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn query_respects_metadata_filter() {
        let index = InMemoryVectorIndex::new();
        index.create_collection("c", 2).await.unwrap();
        let mut active = HashMap::new();
        active.insert("state".to_string(), "active".to_string());
        let mut archived = HashMap::new();
        archived.insert("state".to_string(), "archived".to_string());
        index.upsert("c", "a", &[1.0, 0.0], active).await.unwrap();
        index.upsert("c", "b", &[1.0, 0.0], archived).await.unwrap();

        let mut filter = HashMap::new();
        filter.insert("state".to_string(), "active".to_string());
        let hits = index.query("c", &[1.0, 0.0], 10, &filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
    }

    #[tokio::test]
    async fn dimension_mismatch_is_fatal() {
        let index = InMemoryVectorIndex::new();
        index.create_collection("c", 2).await.unwrap();
        index.upsert("c", "a", &[1.0, 0.0], HashMap::new()).await.unwrap();
        let err = index.upsert("c", "b", &[1.0, 0.0, 0.0], HashMap::new()).await;
        assert!(err.is_err());
    }

    #[test]
    fn cosine_similarity_matches_known_values() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), 1.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }
}
