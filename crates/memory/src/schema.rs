use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type MemoryId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Fact,
    Pattern,
    Remediation,
    Checkpoint,
    Consolidated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemoryState {
    Active,
    Archived,
}

/// Scoping key for a tenant's namespace. `branch` defaults to `"main"` and
/// is preserved verbatim, including embedded `/` characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub owner_id: String,
    pub project_id: String,
    pub branch: String,
}

impl Scope {
    pub fn main(owner_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            project_id: project_id.into(),
            branch: "main".to_string(),
        }
    }

    pub fn branch(
        owner_id: impl Into<String>,
        project_id: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            project_id: project_id.into(),
            branch: branch.into(),
        }
    }

    /// `"{owner_id}_{project_id}_memories"` for `main`, otherwise
    /// `"{owner_id}_{project_id}_{branch}"`.
    pub fn collection_name(&self) -> String {
        if self.branch == "main" {
            format!("{}_{}_memories", self.owner_id, self.project_id)
        } else {
            format!("{}_{}_{}", self.owner_id, self.project_id, self.branch)
        }
    }
}

/// A durable unit of knowledge. See the data model for field semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: MemoryId,
    pub owner_id: String,
    pub project_id: String,
    pub branch: String,
    pub kind: MemoryKind,
    pub title: String,
    pub description: String,
    pub content: String,
    pub tags: BTreeSet<String>,
    pub embedding: Vec<f32>,
    pub confidence: f32,
    pub usage_count: u64,
    pub state: MemoryState,
    pub consolidation_id: Option<MemoryId>,
    /// Populated only when `kind = Consolidated`; the set of memory ids
    /// whose `consolidation_id` points at this memory.
    #[serde(default)]
    pub source_ids: BTreeSet<MemoryId>,
    /// Reserved key `schema_version` lives in here alongside any
    /// caller-supplied metadata; unknown keys round-trip verbatim.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Memory {
    pub fn new(
        scope: &Scope,
        kind: MemoryKind,
        title: impl Into<String>,
        description: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: scope.owner_id.clone(),
            project_id: scope.project_id.clone(),
            branch: scope.branch.clone(),
            kind,
            title: title.into(),
            description: description.into(),
            content: content.into(),
            tags: BTreeSet::new(),
            embedding: Vec::new(),
            confidence: 1.0,
            usage_count: 0,
            state: MemoryState::Active,
            consolidation_id: None,
            source_ids: BTreeSet::new(),
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn scope(&self) -> Scope {
        Scope {
            owner_id: self.owner_id.clone(),
            project_id: self.project_id.clone(),
            branch: self.branch.clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, MemoryState::Active)
    }
}

/// A query result: a memory plus its cosine-normalised relevance score.
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub memory: Memory,
    pub score: f32,
}

/// Metadata filters accepted by `MemoryStore::query`. `state` defaults to
/// `Some(Active)` when omitted by the caller — archived memories are never
/// surfaced unless explicitly requested.
#[derive(Debug, Clone, Default)]
pub struct QueryFilters {
    pub kind: Option<MemoryKind>,
    pub tags: BTreeSet<String>,
    pub state: Option<MemoryState>,
}

impl QueryFilters {
    pub fn effective_state(&self) -> MemoryState {
        self.state.unwrap_or(MemoryState::Active)
    }
}
