//! Background consolidation engine: clusters near-duplicate active memories
//! by embedding similarity, synthesizes one canonical memory per cluster via
//! an external LLM call, archives the sources with back-references, and
//! recomputes confidence as a usage-weighted average.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use contextd_llm::Synthesizer;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::schema::{Memory, MemoryKind, MemoryState, Scope};
use crate::store::MemoryStore;
use crate::vector_index::cosine_similarity;

const DEFAULT_THRESHOLD: f32 = 0.8;
const DEFAULT_WINDOW: Duration = Duration::from_secs(24 * 3600);
const DEFAULT_MAX_CLUSTERS_PER_RUN: usize = 50;

/// `{threshold, window, force_all, dry_run, max_clusters_per_run}` (§6).
#[derive(Debug, Clone)]
pub struct ConsolidationOptions {
    pub threshold: f32,
    pub window: Duration,
    pub force_all: bool,
    pub dry_run: bool,
    pub max_clusters_per_run: usize,
}

impl Default for ConsolidationOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            window: DEFAULT_WINDOW,
            force_all: false,
            dry_run: false,
            max_clusters_per_run: DEFAULT_MAX_CLUSTERS_PER_RUN,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClusterOutcome {
    Consolidated {
        consolidated_id: Uuid,
        source_ids: Vec<Uuid>,
    },
    SynthesisFailed {
        source_ids: Vec<Uuid>,
        reason: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct ConsolidationResult {
    pub created: usize,
    pub archived: usize,
    pub skipped: usize,
    pub clusters: Vec<ClusterOutcome>,
}

#[derive(Default)]
struct ScopeTracking {
    /// When the last run for this scope started. Used to skip reprocessing
    /// memories seen in the last window (§4.2 "State tracking") unless
    /// `ForceAll` is set; a soft optimization only — losing it on restart
    /// just means the window filter in `run_once` bounds the work instead.
    last_run_started_at: Option<DateTime<Utc>>,
    in_flight: bool,
}

fn scope_key(scope: &Scope) -> (String, String) {
    (scope.owner_id.clone(), scope.project_id.clone())
}

pub struct Distiller {
    store: Arc<MemoryStore>,
    synthesizer: Arc<dyn Synthesizer>,
    tracking: RwLock<HashMap<(String, String), ScopeTracking>>,
}

impl Distiller {
    pub fn new(store: Arc<MemoryStore>, synthesizer: Arc<dyn Synthesizer>) -> Self {
        Self {
            store,
            synthesizer,
            tracking: RwLock::new(HashMap::new()),
        }
    }

    /// Reduce near-duplicate active memories in `scope` into consolidated
    /// memories. A second call that overlaps an in-flight run for the same
    /// scope is a no-op (§9 open question resolution). A call that arrives
    /// before `options.window` has elapsed since this scope's last run is
    /// also a no-op unless `force_all` is set (§4.2 "State tracking").
    #[instrument(skip(self, options))]
    pub async fn consolidate_all(
        &self,
        scope: &Scope,
        options: ConsolidationOptions,
    ) -> Result<ConsolidationResult> {
        let key = scope_key(scope);
        {
            let mut tracking = self.tracking.write().unwrap();
            let entry = tracking.entry(key.clone()).or_default();
            if entry.in_flight {
                return Ok(ConsolidationResult::default());
            }
            if !options.force_all {
                if let Some(last_run_started_at) = entry.last_run_started_at {
                    let window = chrono::Duration::from_std(options.window).unwrap_or(chrono::Duration::hours(24));
                    if Utc::now() - last_run_started_at < window {
                        return Ok(ConsolidationResult::default());
                    }
                }
            }
            entry.in_flight = true;
        }

        let result = self.run_once(scope, &options).await;

        {
            let mut tracking = self.tracking.write().unwrap();
            let entry = tracking.entry(key).or_default();
            entry.in_flight = false;
            entry.last_run_started_at = Some(Utc::now());
        }

        result
    }

    async fn run_once(&self, scope: &Scope, options: &ConsolidationOptions) -> Result<ConsolidationResult> {
        let window_start = Utc::now() - chrono::Duration::from_std(options.window).unwrap_or(chrono::Duration::hours(24));

        let all_active: Vec<Memory> = self
            .store
            .redb()
            .all_for_scope(scope)?
            .into_iter()
            .filter(|m| m.is_active() && m.kind != MemoryKind::Consolidated)
            .filter(|m| options.force_all || m.updated_at >= window_start)
            .collect();

        let clusters = cluster_memories(&all_active, options.threshold);
        let mut ordered_clusters = clusters;
        ordered_clusters.sort_by_key(|c| c.iter().min().copied());
        ordered_clusters.truncate(options.max_clusters_per_run);

        let mut result = ConsolidationResult::default();
        let by_id: HashMap<Uuid, &Memory> = all_active.iter().map(|m| (m.id, m)).collect();

        for cluster_ids in ordered_clusters {
            let mut members: Vec<&Memory> = cluster_ids.iter().filter_map(|id| by_id.get(id).copied()).collect();
            members.sort_by_key(|m| m.created_at);

            let prompt = "Synthesize these near-duplicate memories into one canonical memory.";
            let inputs: Vec<String> = members.iter().map(|m| m.content.clone()).collect();

            match self.synthesizer.synthesize(prompt, &inputs).await {
                Ok(output) => {
                    let confidence = weighted_confidence(&members);
                    let mut consolidated = Memory::new(
                        scope,
                        MemoryKind::Consolidated,
                        output.title,
                        output.description,
                        output.content,
                    );
                    consolidated.confidence = confidence;
                    consolidated.source_ids = members.iter().map(|m| m.id).collect();

                    if options.dry_run {
                        result.created += 1;
                        result.archived += members.len();
                        result.clusters.push(ClusterOutcome::Consolidated {
                            consolidated_id: consolidated.id,
                            source_ids: members.iter().map(|m| m.id).collect(),
                        });
                        continue;
                    }

                    let consolidated_id = self.store.put(consolidated).await?;
                    for member in &members {
                        self.store.archive(scope, member.id, consolidated_id).await?;
                    }

                    result.created += 1;
                    result.archived += members.len();
                    result.clusters.push(ClusterOutcome::Consolidated {
                        consolidated_id,
                        source_ids: members.iter().map(|m| m.id).collect(),
                    });
                }
                Err(err) => {
                    warn!(scope = ?scope, error = %err, "cluster synthesis failed — skipping cluster");
                    result.skipped += 1;
                    result.clusters.push(ClusterOutcome::SynthesisFailed {
                        source_ids: members.iter().map(|m| m.id).collect(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        Ok(result)
    }
}

/// Greedy, O(n²), single-link clustering. Memories are visited in ascending
/// `id` order for reproducibility; a memory joins the first existing cluster
/// whose similarity to any member meets `threshold`, else starts a new
/// (possibly singleton) cluster. Singleton clusters are discarded.
fn cluster_memories(memories: &[Memory], threshold: f32) -> Vec<Vec<Uuid>> {
    let mut sorted: Vec<&Memory> = memories.iter().collect();
    sorted.sort_by_key(|m| m.id);

    let mut clusters: Vec<Vec<usize>> = Vec::new();
    for (i, candidate) in sorted.iter().enumerate() {
        let mut joined = None;
        for (ci, cluster) in clusters.iter().enumerate() {
            let matches = cluster.iter().any(|&j| {
                cosine_similarity(&sorted[j].embedding, &candidate.embedding) >= threshold
            });
            if matches {
                joined = Some(ci);
                break;
            }
        }
        match joined {
            Some(ci) => clusters[ci].push(i),
            None => clusters.push(vec![i]),
        }
    }

    clusters
        .into_iter()
        .filter(|c| c.len() >= 2)
        .map(|c| c.into_iter().map(|i| sorted[i].id).collect())
        .collect()
}

/// `Σ conf_i · (usage_i + 1) / Σ (usage_i + 1)`, clamped to `[0, 1]`.
fn weighted_confidence(members: &[&Memory]) -> f32 {
    let mut numerator = 0.0_f32;
    let mut denominator = 0.0_f32;
    for member in members {
        let weight = member.usage_count as f32 + 1.0;
        numerator += member.confidence * weight;
        denominator += weight;
    }
    if denominator == 0.0 {
        return 0.0;
    }
    (numerator / denominator).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use contextd_llm::{Embedder, LlmError, SynthesisOutput};

    use super::*;
    use crate::redb_store::RedbStore;
    use crate::schema::MemoryKind;
    use crate::vector_index::InMemoryVectorIndex;

    struct FixedEmbedder;

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, texts: &[String]) -> contextd_llm::Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    if t.contains("429") {
                        vec![1.0, 0.0, 0.0]
                    } else {
                        vec![0.0, 1.0, 0.0]
                    }
                })
                .collect())
        }
    }

    struct EchoSynthesizer;

    #[async_trait]
    impl Synthesizer for EchoSynthesizer {
        async fn synthesize(&self, _prompt: &str, inputs: &[String]) -> contextd_llm::Result<SynthesisOutput> {
            Ok(SynthesisOutput {
                title: "consolidated".to_string(),
                description: "merged duplicates".to_string(),
                content: inputs.join(" / "),
                attribution: format!("from {} sources", inputs.len()),
            })
        }
    }

    struct FailingSynthesizer;

    #[async_trait]
    impl Synthesizer for FailingSynthesizer {
        async fn synthesize(&self, _prompt: &str, _inputs: &[String]) -> contextd_llm::Result<SynthesisOutput> {
            Err(LlmError::Invalid("malformed output".to_string()))
        }
    }

    fn owner(tag: &str) -> String {
        crate::identity::derive_owner_id(tag)
    }

    fn test_setup(synthesizer: Arc<dyn Synthesizer>) -> (Arc<MemoryStore>, Distiller) {
        let dir = Box::leak(Box::new(tempfile::tempdir().unwrap()));
        let store = Arc::new(MemoryStore::new(
            Arc::new(RedbStore::open(dir.path().join("s.redb")).unwrap()),
            Arc::new(InMemoryVectorIndex::new()),
            Arc::new(FixedEmbedder),
        ));
        let distiller = Distiller::new(store.clone(), synthesizer);
        (store, distiller)
    }

    #[tokio::test]
    async fn cluster_and_consolidate_matches_spec_scenario() {
        let (store, distiller) = test_setup(Arc::new(EchoSynthesizer));
        let scope = Scope::main(owner("alice"), "proj".to_string());

        store
            .put(Memory::new(&scope, MemoryKind::Fact, "a", "d", "retry on 429"))
            .await
            .unwrap();
        store
            .put(Memory::new(&scope, MemoryKind::Fact, "b", "d", "retry HTTP 429 after delay"))
            .await
            .unwrap();
        store
            .put(Memory::new(&scope, MemoryKind::Fact, "c", "d", "handle 500 errors"))
            .await
            .unwrap();

        let mut options = ConsolidationOptions::default();
        options.force_all = true;
        let result = distiller.consolidate_all(&scope, options).await.unwrap();

        assert_eq!(result.created, 1);
        assert_eq!(result.archived, 2);
        assert_eq!(result.skipped, 0);
    }

    #[tokio::test]
    async fn confidence_weighting_matches_spec_example() {
        let (store, distiller) = test_setup(Arc::new(EchoSynthesizer));
        let scope = Scope::main(owner("alice"), "proj".to_string());

        let mut low = Memory::new(&scope, MemoryKind::Fact, "a", "d", "retry on 429");
        low.confidence = 0.5;
        low.usage_count = 0;
        let mut high = Memory::new(&scope, MemoryKind::Fact, "b", "d", "retry HTTP 429 after delay");
        high.confidence = 1.0;
        high.usage_count = 9;

        store.put(low).await.unwrap();
        store.put(high).await.unwrap();

        let mut options = ConsolidationOptions::default();
        options.force_all = true;
        let result = distiller.consolidate_all(&scope, options).await.unwrap();
        assert_eq!(result.created, 1);

        let ClusterOutcome::Consolidated { consolidated_id, .. } = &result.clusters[0] else {
            panic!("expected a consolidated outcome");
        };
        let consolidated = store.get(&scope, *consolidated_id).await.unwrap();
        assert!((consolidated.confidence - 0.9545).abs() < 0.001);
    }

    #[tokio::test]
    async fn unrelated_memory_is_left_active() {
        let (store, distiller) = test_setup(Arc::new(EchoSynthesizer));
        let scope = Scope::main(owner("alice"), "proj".to_string());

        store
            .put(Memory::new(&scope, MemoryKind::Fact, "a", "d", "retry on 429"))
            .await
            .unwrap();
        store
            .put(Memory::new(&scope, MemoryKind::Fact, "b", "d", "retry HTTP 429 after delay"))
            .await
            .unwrap();
        let unrelated_id = store
            .put(Memory::new(&scope, MemoryKind::Fact, "c", "d", "handle 500 errors"))
            .await
            .unwrap();

        let mut options = ConsolidationOptions::default();
        options.force_all = true;
        distiller.consolidate_all(&scope, options).await.unwrap();

        let unrelated = store.get(&scope, unrelated_id).await.unwrap();
        assert_eq!(unrelated.state, MemoryState::Active);
    }

    #[tokio::test]
    async fn dry_run_makes_no_observable_writes() {
        let (store, distiller) = test_setup(Arc::new(EchoSynthesizer));
        let scope = Scope::main(owner("alice"), "proj".to_string());

        let a = store
            .put(Memory::new(&scope, MemoryKind::Fact, "a", "d", "retry on 429"))
            .await
            .unwrap();
        let b = store
            .put(Memory::new(&scope, MemoryKind::Fact, "b", "d", "retry HTTP 429 after delay"))
            .await
            .unwrap();

        let mut options = ConsolidationOptions::default();
        options.force_all = true;
        options.dry_run = true;
        let result = distiller.consolidate_all(&scope, options).await.unwrap();

        assert_eq!(result.created, 1);
        assert_eq!(result.archived, 2);

        assert_eq!(store.get(&scope, a).await.unwrap().state, MemoryState::Active);
        assert_eq!(store.get(&scope, b).await.unwrap().state, MemoryState::Active);
    }

    #[tokio::test]
    async fn failed_synthesis_skips_only_that_cluster() {
        let (store, distiller) = test_setup(Arc::new(FailingSynthesizer));
        let scope = Scope::main(owner("alice"), "proj".to_string());

        store
            .put(Memory::new(&scope, MemoryKind::Fact, "a", "d", "retry on 429"))
            .await
            .unwrap();
        store
            .put(Memory::new(&scope, MemoryKind::Fact, "b", "d", "retry HTTP 429 after delay"))
            .await
            .unwrap();

        let mut options = ConsolidationOptions::default();
        options.force_all = true;
        let result = distiller.consolidate_all(&scope, options).await.unwrap();

        assert_eq!(result.created, 0);
        assert_eq!(result.skipped, 1);
    }

    #[tokio::test]
    async fn rerun_with_unchanged_inputs_is_idempotent() {
        let (store, distiller) = test_setup(Arc::new(EchoSynthesizer));
        let scope = Scope::main(owner("alice"), "proj".to_string());

        store
            .put(Memory::new(&scope, MemoryKind::Fact, "a", "d", "retry on 429"))
            .await
            .unwrap();
        store
            .put(Memory::new(&scope, MemoryKind::Fact, "b", "d", "retry HTTP 429 after delay"))
            .await
            .unwrap();

        let mut options = ConsolidationOptions::default();
        options.force_all = true;
        let first = distiller.consolidate_all(&scope, options.clone()).await.unwrap();
        assert_eq!(first.created, 1);

        // Second run: sources are now archived (not Consolidated, but no
        // longer active), so nothing new is clustered.
        let second = distiller.consolidate_all(&scope, options).await.unwrap();
        assert_eq!(second.created, 0);
    }

    #[test]
    fn threshold_boundary_clusters_at_exact_equality() {
        let scope = Scope::main(owner("alice"), "proj".to_string());
        let mut a = Memory::new(&scope, MemoryKind::Fact, "a", "d", "x");
        a.embedding = vec![1.0, 0.0];
        let mut b = Memory::new(&scope, MemoryKind::Fact, "b", "d", "y");
        b.embedding = vec![0.8, 0.6];
        let sim = cosine_similarity(&a.embedding, &b.embedding);
        let clusters = cluster_memories(&[a, b], sim);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 2);
    }
}
