pub mod checkpoint;
pub mod distiller;
pub mod error;
pub mod hooks;
pub mod identity;
pub mod redb_store;
pub mod registry;
pub mod scheduler;
pub mod schema;
pub mod secret;
pub mod store;
pub mod vector_index;

pub use checkpoint::{Checkpoint, CheckpointFilters, Snapshot};
pub use distiller::{ClusterOutcome, ConsolidationOptions, ConsolidationResult, Distiller};
pub use error::{ContextdError, Result};
pub use hooks::{HookEvent, HookHandler, HookManager, ThresholdHandler, ThresholdWatcher};
pub use identity::{derive_owner_id, validate_owner_id};
pub use redb_store::{CacheStats, RedbStore};
pub use registry::ServiceRegistry;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use schema::{Memory, MemoryId, MemoryKind, MemoryState, QueryFilters, Scope, ScoredMemory};
pub use secret::{SecretScrubber, scrub, scrub_memory_fields};
pub use store::MemoryStore;
pub use vector_index::{IndexHit, InMemoryVectorIndex, VectorIndex, cosine_similarity};

#[cfg(feature = "qdrant")]
pub use vector_index::qdrant_backend::QdrantVectorIndex;
