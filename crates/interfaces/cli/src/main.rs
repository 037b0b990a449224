use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sha2::Digest;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use contextd_config::ContextdConfig;
use contextd_llm::{HttpEmbedder, HttpSynthesizer};
use contextd_memory::{
    Checkpoint, CheckpointFilters, ConsolidationOptions, Distiller, InMemoryVectorIndex,
    MemoryKind, MemoryStore, QueryFilters, RedbStore, Scheduler, SchedulerConfig, Scope,
    Snapshot, VectorIndex, derive_owner_id,
};

#[derive(Debug, Parser)]
#[command(name = "contextd", version, about = "Context daemon: durable memory for assistant sessions")]
struct Cli {
    #[arg(long, global = true, default_value = "config/contextd.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write a memory, embedding it and upserting it into the vector index.
    Put {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        project: String,
        #[arg(long, default_value = "main")]
        branch: String,
        #[arg(long, value_enum, default_value = "fact")]
        kind: CliMemoryKind,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        content: String,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
    },
    /// Fetch a single memory by id.
    Get {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        project: String,
        #[arg(long, default_value = "main")]
        branch: String,
        #[arg(long)]
        id: Uuid,
    },
    /// Semantic search over a scope's active memories.
    Query {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        project: String,
        #[arg(long, default_value = "main")]
        branch: String,
        #[arg(long)]
        text: String,
        #[arg(long, default_value_t = 10)]
        k: usize,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
    },
    /// Run one consolidation pass over a scope.
    Consolidate {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        project: String,
        #[arg(long, default_value = "main")]
        branch: String,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        force_all: bool,
    },
    /// Save, resume, or list session checkpoints.
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
    /// Run the daemon: the scheduler's periodic consolidation loop.
    Serve,
    /// Write a default config file to the resolved `--config` path.
    InitConfig,
}

#[derive(Debug, Subcommand)]
enum CheckpointCommands {
    Save {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        project: String,
        #[arg(long, default_value = "main")]
        branch: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        summary: String,
        #[arg(long)]
        payload_file: PathBuf,
    },
    Resume {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        session_id: Uuid,
        #[arg(long)]
        out_file: PathBuf,
    },
    List {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        project: String,
        #[arg(long, default_value = "main")]
        branch: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliMemoryKind {
    Fact,
    Pattern,
    Remediation,
}

impl From<CliMemoryKind> for MemoryKind {
    fn from(kind: CliMemoryKind) -> Self {
        match kind {
            CliMemoryKind::Fact => MemoryKind::Fact,
            CliMemoryKind::Pattern => MemoryKind::Pattern,
            CliMemoryKind::Remediation => MemoryKind::Remediation,
        }
    }
}

#[cfg(feature = "qdrant")]
fn build_vector_index(config: &ContextdConfig) -> Result<Arc<dyn VectorIndex>> {
    if config.vector_index.backend == "memory" {
        return Ok(Arc::new(InMemoryVectorIndex::new()));
    }
    let index = contextd_memory::QdrantVectorIndex::new(&config.vector_index.qdrant_url)
        .context("connecting to qdrant")?;
    Ok(Arc::new(index))
}

#[cfg(not(feature = "qdrant"))]
fn build_vector_index(_config: &ContextdConfig) -> Result<Arc<dyn VectorIndex>> {
    Ok(Arc::new(InMemoryVectorIndex::new()))
}

fn build_store(config: &ContextdConfig) -> Result<Arc<MemoryStore>> {
    let redb_path = PathBuf::from(&config.store.data_dir).join("contextd.redb");
    let redb = Arc::new(RedbStore::open(&redb_path).context("opening redb store")?);
    let index = build_vector_index(config)?;
    let embedder = Arc::new(HttpEmbedder::new(&config.embedder.base_url));
    Ok(Arc::new(
        MemoryStore::new(redb, index, embedder).with_max_embed_attempts(config.embedder.max_embed_attempts),
    ))
}

fn build_distiller(config: &ContextdConfig, store: Arc<MemoryStore>) -> Arc<Distiller> {
    let synthesizer = Arc::new(HttpSynthesizer::new(&config.llm.base_url, &config.llm.model));
    Arc::new(Distiller::new(store, synthesizer))
}

fn build_checkpoint(config: &ContextdConfig, store: Arc<MemoryStore>) -> Arc<Checkpoint> {
    Arc::new(Checkpoint::new(store, PathBuf::from(&config.store.data_dir)))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();

    if let Commands::InitConfig = &cli.command {
        let config = ContextdConfig::default();
        config.save_to(&cli.config)?;
        println!("wrote default config to {}", cli.config.display());
        return Ok(());
    }

    let config = ContextdConfig::load_from(&cli.config)?;

    match cli.command {
        Commands::InitConfig => unreachable!("handled above"),
        Commands::Put {
            owner,
            project,
            branch,
            kind,
            title,
            description,
            content,
            tags,
        } => {
            let store = build_store(&config)?;
            let scope = Scope::branch(derive_owner_id(&owner), project, branch);
            let mut memory = contextd_memory::Memory::new(&scope, kind.into(), title, description, content);
            memory.tags = tags.into_iter().collect();
            let id = store.put(memory).await?;
            println!("{id}");
        }
        Commands::Get {
            owner,
            project,
            branch,
            id,
        } => {
            let store = build_store(&config)?;
            let scope = Scope::branch(derive_owner_id(&owner), project, branch);
            let memory = store.get(&scope, id).await?;
            println!("{}", serde_json::to_string_pretty(&memory)?);
        }
        Commands::Query {
            owner,
            project,
            branch,
            text,
            k,
            tags,
        } => {
            let store = build_store(&config)?;
            let scope = Scope::branch(derive_owner_id(&owner), project, branch);
            let mut filters = QueryFilters::default();
            filters.tags = tags.into_iter().collect();
            let results = store.query(&scope, &text, k, filters).await?;
            for result in &results {
                println!("{:.4}  {}  {}", result.score, result.memory.id, result.memory.title);
            }
        }
        Commands::Consolidate {
            owner,
            project,
            branch,
            dry_run,
            force_all,
        } => {
            let store = build_store(&config)?;
            let distiller = build_distiller(&config, store);
            let scope = Scope::branch(derive_owner_id(&owner), project, branch);
            let options = ConsolidationOptions {
                threshold: config.distiller.threshold,
                window: std::time::Duration::from_secs(config.distiller.window_seconds),
                force_all,
                dry_run,
                max_clusters_per_run: config.distiller.max_clusters_per_run,
            };
            let result = distiller.consolidate_all(&scope, options).await?;
            println!(
                "created={} archived={} skipped={}",
                result.created, result.archived, result.skipped
            );
        }
        Commands::Checkpoint { command } => match command {
            CheckpointCommands::Save {
                owner,
                project,
                branch,
                title,
                summary,
                payload_file,
            } => {
                let store = build_store(&config)?;
                let checkpoint = build_checkpoint(&config, store);
                let payload = std::fs::read(&payload_file)
                    .with_context(|| format!("reading {}", payload_file.display()))?;
                let owner_id = derive_owner_id(&owner);
                let mut hasher = sha2::Sha256::new();
                hasher.update(&payload);
                let digest = format!("{:x}", hasher.finalize());
                let snapshot = Snapshot {
                    session_id: Uuid::new_v4(),
                    owner_id,
                    project_id: project,
                    branch,
                    title,
                    summary,
                    token_count: 0,
                    messages_digest: digest,
                    created_at: chrono::Utc::now(),
                    payload,
                };
                let session_id = snapshot.session_id;
                checkpoint.save(snapshot).await?;
                println!("{session_id}");
            }
            CheckpointCommands::Resume {
                owner,
                session_id,
                out_file,
            } => {
                let store = build_store(&config)?;
                let checkpoint = build_checkpoint(&config, store);
                let owner_id = derive_owner_id(&owner);
                let payload = checkpoint.resume(&owner_id, session_id).await?;
                std::fs::write(&out_file, &payload)
                    .with_context(|| format!("writing {}", out_file.display()))?;
                println!("wrote {}", out_file.display());
            }
            CheckpointCommands::List {
                owner,
                project,
                branch,
                limit,
            } => {
                let store = build_store(&config)?;
                let checkpoint = build_checkpoint(&config, store);
                let scope = Scope::branch(derive_owner_id(&owner), project, branch);
                let filters = CheckpointFilters {
                    limit,
                    ..Default::default()
                };
                let checkpoints = checkpoint.list(&scope, filters).await?;
                for memory in &checkpoints {
                    println!("{}  {}  {}", memory.created_at, memory.id, memory.title);
                }
            }
        },
        Commands::Serve => {
            let store = build_store(&config)?;
            let redb = store.redb().clone();
            let distiller = build_distiller(&config, store);
            let scheduler_config = SchedulerConfig {
                interval: std::time::Duration::from_secs(config.scheduler.interval_seconds),
                per_run_timeout: std::time::Duration::from_secs(config.scheduler.per_run_timeout_seconds),
            };
            let scheduler = Scheduler::new(distiller, redb, scheduler_config);

            let shutdown = scheduler.shutdown_handle();
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                shutdown.notify_one();
            });

            tracing::info!("contextd scheduler starting");
            scheduler.run().await;
        }
    }

    Ok(())
}
