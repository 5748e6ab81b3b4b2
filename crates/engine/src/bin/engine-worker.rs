//! engine-worker — the faultline evaluation worker.
//!
//! Composition root wiring the whole pipeline:
//! - time-series store fed by the sample ingress channel, which reads
//!   newline-delimited JSON samples from stdin
//! - git-sync reconciler over the rules directory
//! - actor manager and orchestrator draining the request queue
//! - realtime tick scheduler
//!
//! Storage is PostgreSQL when `DATABASE_URL` is set, otherwise the
//! in-memory store (local runs and demos).

use std::sync::Arc;

use clap::Parser;
use tokio::sync::Notify;
use tracing::{info, warn};

use faultline_core::config::{load_dotenv, Config};
use faultline_engine::{feed_jsonl, sample_channel, ActorManager, Orchestrator, TickScheduler};
use faultline_rules::{
    EvaluatorProvider, FsRuleRepository, Reconciler, RuleInstantiator, StaticTopology,
};
use faultline_storage::{PostgresStore, Store};
use faultline_timeseries::TimeSeriesStore;

// ── CLI ─────────────────────────────────────────────────────────────

/// Faultline engine worker — rule evaluation over streaming telemetry.
#[derive(Parser, Debug)]
#[command(name = "engine-worker", version, about)]
struct Cli {
    /// Path to the rules checkout directory.
    #[arg(long, env = "RULES_DIR", default_value = "data/rules")]
    rules_dir: String,

    /// Path to a topology YAML file (entities, models, point
    /// relationships).
    #[arg(long, env = "TOPOLOGY_FILE")]
    topology_file: Option<String>,

    /// Sample ingress channel capacity.
    #[arg(long, env = "INGRESS_CAPACITY", default_value_t = 4096)]
    ingress_capacity: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    config.reconciler.rules_dir = cli.rules_dir.clone().into();

    let store = match &config.postgres.url {
        Some(url) => {
            let backend = Arc::new(PostgresStore::connect(url).await?);
            info!("connected to postgres store");
            Store::postgres(backend)
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory store");
            Store::in_memory().0
        }
    };

    let series = Arc::new(TimeSeriesStore::new(&config.buffer));
    let provider = Arc::new(EvaluatorProvider::with_builtins());

    let topology = Arc::new(match &cli.topology_file {
        Some(path) => {
            let contents = std::fs::read_to_string(path)?;
            let topo = StaticTopology::from_yaml(&contents)?;
            info!(path = %path, "loaded topology");
            topo
        }
        None => {
            warn!("no topology file configured, starting with an empty topology");
            StaticTopology::new()
        }
    });

    let instantiator = Arc::new(RuleInstantiator::new(topology, store.instances.clone()));
    let repo = Arc::new(FsRuleRepository::new(config.reconciler.rules_dir.clone()));
    let reconciler = Arc::new(Reconciler::new(
        repo,
        store.clone(),
        instantiator,
        provider.clone(),
        config.reconciler.clone(),
    ));

    let manager = Arc::new(ActorManager::new(
        store.clone(),
        series.clone(),
        provider,
        config.engine.clone(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        manager.clone(),
        config.engine.clone(),
    ));
    let scheduler = TickScheduler::new(orchestrator.clone(), config.engine.polling_interval);

    let (ingress, ingress_loop) = sample_channel(series.clone(), cli.ingress_capacity);

    let shutdown = Arc::new(Notify::new());
    let mut tasks = Vec::new();

    {
        let reconciler = reconciler.clone();
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            reconciler.run(shutdown).await;
        }));
    }
    {
        let orchestrator = orchestrator.clone();
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            orchestrator.run(shutdown).await;
        }));
    }
    {
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            ingress_loop.run(shutdown).await;
        }));
    }
    {
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            scheduler.run(shutdown).await;
        }));
    }
    {
        // Telemetry source: newline-delimited JSON samples on stdin.
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let reader = tokio::io::BufReader::new(tokio::io::stdin());
            tokio::select! {
                n = feed_jsonl(reader, &ingress) => {
                    info!(samples = n, "sample input closed");
                }
                _ = shutdown.notified() => {}
            }
        }));
    }

    // First reconciliation pass right away instead of waiting a full
    // interval.
    reconciler.trigger();

    info!("engine-worker started");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    // In-flight steps abandon at their pre-persistence check; their
    // requests stay Pending and are restored on the next start.
    manager.begin_shutdown();
    shutdown.notify_waiters();
    for task in tasks {
        let _ = task.await;
    }
    info!("engine-worker exited cleanly");
    Ok(())
}
