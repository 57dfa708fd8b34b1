use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, info};

use gantry_core::ids::GraphId;
use gantry_engine::{EngineConfig, RunEngine};
use gantry_graph::cache::{ttl_from_env, ttl_from_override, GraphBuildCache};
use gantry_graph::echo::EchoGraphFactory;
use gantry_store::Database;
use gantry_telemetry::{init_telemetry, TelemetryConfig};

const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "gantry", about = "Run orchestration engine host", version)]
struct Args {
    /// Database file. Defaults to ~/.gantry/gantry.db.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Graph cache TTL override in milliseconds. Non-positive or
    /// non-numeric values fall back to the five-minute default.
    #[arg(long)]
    cache_ttl_ms: Option<String>,

    /// Human-readable logs instead of JSON lines.
    #[arg(long)]
    pretty_logs: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    init_telemetry(&TelemetryConfig {
        json: !args.pretty_logs,
        ..TelemetryConfig::default()
    });
    info!("starting gantry");

    let db_path = args.db.unwrap_or_else(default_db_path);
    if let Some(dir) = db_path.parent() {
        std::fs::create_dir_all(dir).expect("Failed to create database directory");
    }
    let db = Database::open(&db_path).expect("Failed to open database");
    info!(path = %db_path.display(), "database opened");

    let ttl = match args.cache_ttl_ms.as_deref() {
        Some(raw) => ttl_from_override(Some(raw)),
        None => ttl_from_env(),
    };
    let cache = Arc::new(GraphBuildCache::new(ttl));
    info!(ttl_ms = ttl.as_millis() as u64, "graph cache ready");

    let engine = RunEngine::new(
        db,
        Arc::new(EchoGraphFactory),
        cache.clone(),
        EngineConfig::default(),
    );

    ensure_default_assistant(&engine);
    info!(
        threads = engine.threads().count().unwrap_or(0),
        assistants = engine.assistants().count().unwrap_or(0),
        "store loaded"
    );

    // Background eviction alongside the lazy per-access checks.
    tokio::spawn({
        let cache = cache.clone();
        async move {
            let mut interval = tokio::time::interval(CACHE_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let evicted = cache.sweep();
                if evicted > 0 {
                    debug!(evicted, "expired graph cache entries removed");
                }
            }
        }
    });

    info!("gantry ready");

    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for ctrl+c");

    info!("shutting down");
    engine.abort_all();
}

/// Make sure a default echo assistant exists so a fresh install can run
/// something immediately.
fn ensure_default_assistant(engine: &RunEngine) {
    let graph_id = GraphId::new("echo");
    let existing = engine
        .assistants()
        .search(Some(&graph_id), None, 1, 0)
        .expect("Failed to query assistants");
    if existing.is_empty() {
        let assistant = engine
            .assistants()
            .create(
                &graph_id,
                &serde_json::json!({}),
                &serde_json::json!({"builtin": true}),
            )
            .expect("Failed to create default assistant");
        info!(assistant_id = %assistant.id, "default echo assistant created");
    }
}

fn default_db_path() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".gantry")
        .join("gantry.db")
}
