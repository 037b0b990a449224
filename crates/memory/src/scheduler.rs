//! Interval-driven background runner that invokes the distiller over every
//! active scope, grounded in the daemon's `tokio::select!` main loop.
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info, instrument};

use crate::distiller::{ConsolidationOptions, Distiller};
use crate::redb_store::RedbStore;
use crate::schema::Scope;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(24 * 3600);
const DEFAULT_PER_RUN_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub per_run_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            per_run_timeout: DEFAULT_PER_RUN_TIMEOUT,
        }
    }
}

/// Drives periodic consolidation. `shutdown()` requests a graceful stop: the
/// current run is allowed up to `per_run_timeout` to finish before the loop
/// exits.
pub struct Scheduler {
    distiller: Arc<Distiller>,
    redb: Arc<RedbStore>,
    config: SchedulerConfig,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    pub fn new(distiller: Arc<Distiller>, redb: Arc<RedbStore>, config: SchedulerConfig) -> Self {
        Self {
            distiller,
            redb,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Runs until `shutdown()` is called. The first tick fires at
    /// `interval / 2` to avoid every daemon in a fleet waking in lockstep.
    #[instrument(skip(self))]
    pub async fn run(&self) {
        let half_interval = self.config.interval / 2;
        let mut interval = tokio::time::interval(self.config.interval);
        interval.reset_after(half_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_once().await;
                }
                _ = self.shutdown.notified() => {
                    info!("scheduler shutting down");
                    break;
                }
            }
        }
    }

    async fn run_once(&self) {
        let scopes = self.active_scopes();
        for scope in scopes {
            let outcome = tokio::time::timeout(
                self.config.per_run_timeout,
                self.distiller.consolidate_all(&scope, ConsolidationOptions::default()),
            )
            .await;

            match outcome {
                Ok(Ok(result)) => {
                    info!(
                        owner = %scope.owner_id,
                        project = %scope.project_id,
                        created = result.created,
                        archived = result.archived,
                        skipped = result.skipped,
                        "consolidation run complete"
                    );
                }
                Ok(Err(err)) => {
                    error!(owner = %scope.owner_id, project = %scope.project_id, %err, "consolidation run failed");
                }
                Err(_) => {
                    error!(owner = %scope.owner_id, project = %scope.project_id, "consolidation run timed out");
                }
            }
        }
    }

    /// Distinct `(owner_id, project_id)` scopes with at least one active
    /// memory on the main branch. Per-branch runs are left to a future
    /// extension; the spec scopes scheduled consolidation to "every active
    /// project."
    fn active_scopes(&self) -> Vec<Scope> {
        let mut seen = HashSet::new();
        let mut scopes = Vec::new();
        for memory in self.redb.all_memories().unwrap_or_default() {
            let key = (memory.owner_id.clone(), memory.project_id.clone(), memory.branch.clone());
            if seen.insert(key) {
                scopes.push(Scope {
                    owner_id: memory.owner_id,
                    project_id: memory.project_id,
                    branch: memory.branch,
                });
            }
        }
        scopes
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use contextd_llm::{Embedder, Synthesizer, SynthesisOutput};

    use super::*;
    use crate::schema::{Memory, MemoryKind};
    use crate::store::MemoryStore;
    use crate::vector_index::InMemoryVectorIndex;

    struct FixedEmbedder;

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, texts: &[String]) -> contextd_llm::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.1, 0.2]).collect())
        }
    }

    struct EchoSynthesizer;

    #[async_trait]
    impl Synthesizer for EchoSynthesizer {
        async fn synthesize(&self, _prompt: &str, inputs: &[String]) -> contextd_llm::Result<SynthesisOutput> {
            Ok(SynthesisOutput {
                title: "c".to_string(),
                description: "d".to_string(),
                content: inputs.join(" "),
                attribution: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn run_once_consolidates_every_scope_with_active_memories() {
        let dir = Box::leak(Box::new(tempfile::tempdir().unwrap()));
        let redb = Arc::new(RedbStore::open(dir.path().join("s.redb")).unwrap());
        let store = Arc::new(MemoryStore::new(
            redb.clone(),
            Arc::new(InMemoryVectorIndex::new()),
            Arc::new(FixedEmbedder),
        ));
        let distiller = Arc::new(Distiller::new(store.clone(), Arc::new(EchoSynthesizer)));
        let scheduler = Scheduler::new(distiller, redb.clone(), SchedulerConfig::default());

        let scope = Scope::main(crate::identity::derive_owner_id("alice"), "proj".to_string());
        store
            .put(Memory::new(&scope, MemoryKind::Fact, "a", "d", "x"))
            .await
            .unwrap();
        store
            .put(Memory::new(&scope, MemoryKind::Fact, "b", "d", "y"))
            .await
            .unwrap();

        // Exercises the same code path `run()` invokes on each tick.
        scheduler.run_once().await;

        let all = redb.all_for_scope(&scope).unwrap();
        assert!(all.iter().any(|m| m.kind == MemoryKind::Consolidated));
    }

    #[tokio::test]
    async fn shutdown_notify_unblocks_run_loop() {
        let dir = Box::leak(Box::new(tempfile::tempdir().unwrap()));
        let redb = Arc::new(RedbStore::open(dir.path().join("s.redb")).unwrap());
        let store = Arc::new(MemoryStore::new(
            redb.clone(),
            Arc::new(InMemoryVectorIndex::new()),
            Arc::new(FixedEmbedder),
        ));
        let distiller = Arc::new(Distiller::new(store, Arc::new(EchoSynthesizer)));
        let mut config = SchedulerConfig::default();
        config.interval = Duration::from_secs(3600);
        let scheduler = Arc::new(Scheduler::new(distiller, redb, config));

        let handle = scheduler.clone();
        let join = tokio::spawn(async move { handle.run().await });
        scheduler.shutdown();
        tokio::time::timeout(Duration::from_secs(5), join).await.unwrap().unwrap();
    }
}
