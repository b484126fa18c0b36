//! `ingraphd` — the pipeline orchestrator daemon's CLI entry point.
//!
//! Wires the Graph Store Adapter, LLM Gateway, Job State Store, and the four
//! registered steps into an `Orchestrator`, then exposes job submission,
//! status, cancellation, and log-streaming as subcommands. Grounded on the
//! teacher's `orca` binary (clap subcommand tree over a shared service
//! layer) and `orchestrator-server` binary (tracing-subscriber init from
//! `RUST_LOG`, config-load-then-connect ordering).

mod config;

use clap::{Parser, Subcommand};
use config::EngineConfig;
use ingraph_jobs::{Job, JobFilter, JobStore, Page, SqliteJobStore};
use ingraph_llm::{GatewayConfig, HttpProvider, HttpProviderConfig, LlmGateway, LlmProvider, MockProvider, ModelRoutes};
use ingraph_pipeline::{Orchestrator, PipelineConfig, StepRegistry};
use ingraph_steps::ast::ParserCommand;
use ingraph_steps::{AstStep, DocumentationStep, FilesystemStep, SummarizerStep};
use ingraph_storage::{CandidateChain, GraphStore, RetryConfig, SqliteGraphStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "ingraphd")]
#[command(about = "Ingestion pipeline orchestrator daemon", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Path to the engine's YAML configuration (spec §6).
    #[arg(short, long, default_value = "ingraph.yaml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the graph store's schema (uniqueness constraints, vector indexes).
    InitSchema,

    /// Submit a repository for ingestion and run its pipeline to completion in-process.
    Run {
        /// Path to the repository to ingest.
        repo_path: String,
        /// Externally-specified job id; a fresh one is generated if omitted.
        #[arg(long)]
        job_id: Option<Uuid>,
    },

    /// Print a previously submitted job's status as JSON.
    Status {
        job_id: Uuid,
    },

    /// List known jobs.
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(rust_log).init();

    let cli = Cli::parse();
    let config = EngineConfig::from_file(&cli.config)?;

    match cli.command {
        Commands::InitSchema => init_schema(&config).await,
        Commands::Run { repo_path, job_id } => run_job(&config, repo_path, job_id).await,
        Commands::Status { job_id } => print_status(&config, job_id).await,
        Commands::List => list_jobs(&config).await,
    }
}

async fn build_graph_store(config: &EngineConfig) -> anyhow::Result<Arc<dyn GraphStore>> {
    let chain = CandidateChain::new(config.graph_store.candidates.clone())?;
    let retry = RetryConfig {
        max_attempts: config.graph_store.max_attempts,
        ..RetryConfig::default()
    };
    let store = SqliteGraphStore::connect(&chain, &retry).await?;
    Ok(Arc::new(store))
}

/// Builds the gateway against a real HTTP-compatible endpoint when
/// `llm.base_url` is configured, otherwise falls back to `MockProvider` for
/// local/dev runs that never call a vendor.
fn build_llm_gateway(config: &EngineConfig) -> anyhow::Result<Arc<LlmGateway>> {
    let provider: Arc<dyn LlmProvider> = match (&config.llm.base_url, &config.llm.api_key) {
        (Some(base_url), Some(api_key)) => {
            Arc::new(HttpProvider::new(HttpProviderConfig::new(base_url, api_key))?)
        }
        _ => {
            tracing::warn!("no llm.base_url configured, using MockProvider");
            Arc::new(MockProvider::canned("(mock summary)").with_embedding_dim(8))
        }
    };
    let routes = ModelRoutes::new(
        config.llm.models.chat.clone(),
        config.llm.models.reasoning.clone(),
        config.llm.models.embedding.clone(),
    );
    let gateway_config = GatewayConfig {
        max_retries: config.llm.max_retries,
        backoff_base_ms: config.llm.backoff_base_ms,
        backoff_cap_ms: config.llm.backoff_cap_ms,
    };
    Ok(Arc::new(LlmGateway::new(provider, routes, gateway_config)))
}

fn build_registry(store: Arc<dyn GraphStore>, gateway: Arc<LlmGateway>, config: &EngineConfig) -> StepRegistry {
    let parser = ParserCommand::new(config.ast_parser.program.clone()).with_args(config.ast_parser.args.clone());

    let mut registry = StepRegistry::new();
    registry.register(Arc::new(FilesystemStep::new(store.clone())));
    registry.register(Arc::new(AstStep::new(parser)));
    registry.register(Arc::new(SummarizerStep::new(store.clone(), gateway.clone())));
    registry.register(Arc::new(DocumentationStep::new(store, gateway)));
    registry
}

async fn build_orchestrator(config: &EngineConfig) -> anyhow::Result<Orchestrator> {
    let store = build_graph_store(config).await?;
    let gateway = build_llm_gateway(config)?;
    let registry = build_registry(store, gateway, config);
    let job_store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::connect(&config.job_store.uri).await?);
    let pipeline_config = PipelineConfig {
        descriptors: config.steps.clone(),
    };
    Ok(Orchestrator::new(registry, job_store, pipeline_config)?)
}

async fn init_schema(config: &EngineConfig) -> anyhow::Result<()> {
    let store = build_graph_store(config).await?;
    store.initialize_schema().await?;
    tracing::info!("graph store schema initialized");
    Ok(())
}

async fn run_job(config: &EngineConfig, repo_path: String, job_id: Option<Uuid>) -> anyhow::Result<()> {
    let orchestrator = build_orchestrator(config).await?;
    let job_id = job_id.unwrap_or_else(Uuid::new_v4);

    orchestrator.submit(job_id, repo_path, serde_json::json!({})).await?;
    tracing::info!(%job_id, "job submitted");

    match orchestrator.run(job_id, CancellationToken::new()).await {
        Ok(()) => {
            tracing::info!(%job_id, "job completed");
            Ok(())
        }
        Err(err) => {
            tracing::error!(%job_id, error = %err, "job did not complete");
            Err(err.into())
        }
    }
}

async fn print_status(config: &EngineConfig, job_id: Uuid) -> anyhow::Result<()> {
    let job_store = SqliteJobStore::connect(&config.job_store.uri).await?;
    let job: Job = job_store.get(job_id).await?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

async fn list_jobs(config: &EngineConfig) -> anyhow::Result<()> {
    let job_store = SqliteJobStore::connect(&config.job_store.uri).await?;
    let jobs = job_store.list(JobFilter::default(), Page::default()).await?;
    for job in jobs {
        println!("{}\t{:?}\t{}", job.id, job.aggregate_state(), job.repository_path);
    }
    Ok(())
}
