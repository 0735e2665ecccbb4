// =============================================================================
// Quorum Trade Fabric — Main Entry Point
// =============================================================================
//
// Wires the memory store, metadata ledger, communication bus, and the
// agent ensemble into one process. Three commands:
//
//   start   — full boot: agents running, cycle loop on the configured
//             cadence, graceful ctrl-c shutdown
//   cycle   — boot, run exactly one coordination cycle, print decisions
//   health  — boot components without agent loops, print health summary
//
// All components are constructed once here and passed by reference; there
// are no hidden globals.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod agents;
mod bus;
mod config;
mod coordinator;
mod errors;
mod execution;
mod indicators;
mod ledger;
mod memory;
mod registry;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::agents::base::AgentDeps;
use crate::agents::portfolio::PortfolioTracker;
use crate::agents::rules::RuleSetAgent;
use crate::agents::runtime::{LoadControl, RuntimeAgent};
use crate::agents::scraper::StockScraper;
use crate::agents::strategy::StrategyAgent;
use crate::agents::timing::TimingAgent;
use crate::agents::tool_control::ToolControlAgent;
use crate::bus::{AgentsOut, InputRouter};
use crate::config::RuntimeConfig;
use crate::coordinator::{Coordinator, CoordinatorOverview};
use crate::execution::PaperExecutor;
use crate::ledger::MetadataLedger;
use crate::memory::compactor::RetentionPolicy;
use crate::memory::MemoryStore;
use crate::registry::{AgentDescriptor, AgentRegistry, HealthSummary};

#[derive(Parser)]
#[command(
    name = "quorum-bot",
    about = "Quorum Trade Fabric — multi-agent coordination for penny equities"
)]
struct Cli {
    /// Path to the runtime configuration file.
    #[arg(long, default_value = "quorum_config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the full fabric and run coordination cycles until ctrl-c.
    Start,
    /// Run exactly one coordination cycle and print the decisions.
    Cycle,
    /// Boot the components and print the health summary.
    Health,
}

/// Everything `main` wires together.
struct Fabric {
    config: RuntimeConfig,
    memory: Arc<MemoryStore>,
    router: Arc<InputRouter>,
    fanout: Arc<AgentsOut>,
    runtime: Arc<RuntimeAgent>,
    registry: Arc<AgentRegistry>,
    coordinator: Arc<Coordinator>,
    executor: Arc<PaperExecutor>,
}

impl Fabric {
    /// Construct every component in dependency order.
    fn build(config: RuntimeConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("cannot create data dir {}", config.data_dir.display()))?;

        let ledger = Arc::new(
            MetadataLedger::open(config.data_dir.join("metadata.db"))
                .context("metadata ledger failed to open")?,
        );
        let memory = Arc::new(
            MemoryStore::open(&config, ledger.clone()).context("memory store failed to open")?,
        );
        let router = Arc::new(InputRouter::new(memory.clone()));
        let fanout = Arc::new(AgentsOut::new(
            &config.data_dir,
            memory.clone(),
            ledger.clone(),
            router.clone(),
        ));
        let deps = AgentDeps {
            memory: memory.clone(),
            router: router.clone(),
            fanout: fanout.clone(),
        };

        let scraper = Arc::new(StockScraper::new(
            deps.clone(),
            ledger.clone(),
            config.watchlist.clone(),
        ));
        let strategy = Arc::new(StrategyAgent::new(
            deps.clone(),
            scraper.clone(),
            ledger.clone(),
            config.watchlist.clone(),
        ));
        let timing = Arc::new(TimingAgent::new(deps.clone()));
        let rules = Arc::new(RuleSetAgent::new(deps.clone()));
        let runtime = Arc::new(RuntimeAgent::new(deps.clone(), config.max_concurrent_tasks));
        let portfolio = Arc::new(PortfolioTracker::new(deps.clone()));
        let tools = Arc::new(ToolControlAgent::new(deps.clone()));

        let registry = Arc::new(AgentRegistry::new(memory.clone()));
        registry.register(scraper.clone(), false)?;
        registry.register(strategy.clone(), false)?;
        registry.register(timing.clone(), false)?;
        registry.register(rules.clone(), false)?;
        registry.register(runtime.clone(), false)?;
        registry.register(portfolio.clone(), false)?;
        registry.register(tools, true)?;

        // Late-bound hook so the runtime agent can shed load through the
        // registry without a strong back-edge.
        let load_control: Arc<dyn LoadControl> = registry.clone();
        runtime.set_load_control(Arc::downgrade(&load_control));

        let coordinator = Arc::new(Coordinator::new(
            deps,
            &config,
            strategy,
            timing,
            rules,
            portfolio.clone(),
            scraper.clone(),
        ));
        let executor = Arc::new(PaperExecutor::new(portfolio, scraper, coordinator.clone()));

        Ok(Self {
            config,
            memory,
            router,
            fanout,
            runtime,
            registry,
            coordinator,
            executor,
        })
    }
}

/// Structured payload for the `health` command.
#[derive(Serialize)]
struct HealthReport {
    health: HealthSummary,
    agents: Vec<AgentDescriptor>,
    coordinator: CoordinatorOverview,
    retrieval: crate::bus::input_router::RetrievalStats,
    fanout: crate::bus::fanout::FanoutStats,
    runtime: crate::agents::runtime::RuntimeStats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // A malformed config is fatal: refuse to serve.
    let config = RuntimeConfig::load_or_default(&cli.config)?;
    info!(
        mode = %config.coordination_mode,
        watchlist = ?config.watchlist,
        data_dir = %config.data_dir.display(),
        "Quorum Trade Fabric starting"
    );

    let fabric = Fabric::build(config)?;

    match cli.command {
        Command::Start => run_start(fabric, &cli.config).await,
        Command::Cycle => run_cycle(fabric).await,
        Command::Health => run_health(fabric),
    }
}

async fn run_start(fabric: Fabric, config_path: &std::path::Path) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Background service loops ─────────────────────────────────────────
    tokio::spawn(memory::compactor::run_compactor(
        fabric.memory.clone(),
        RetentionPolicy::from_config(&fabric.config),
        shutdown_rx.clone(),
    ));
    tokio::spawn(bus::fanout::run_flush_loop(
        fabric.fanout.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(registry::run_health_loop(
        fabric.registry.clone(),
        fabric.memory.clone(),
        shutdown_rx.clone(),
    ));

    // ── Agents ───────────────────────────────────────────────────────────
    fabric.registry.start_all();
    info!(agents = fabric.registry.agent_names().len(), "agents running");

    // ── Paper execution monitor ──────────────────────────────────────────
    tokio::spawn(fabric.executor.clone().run(shutdown_rx.clone()));

    // ── Coordination cycle loop ──────────────────────────────────────────
    let coordinator = fabric.coordinator.clone();
    let executor = fabric.executor.clone();
    let scan_interval = fabric.config.scan_interval_secs;
    let mut cycle_rx = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(tokio::time::Duration::from_secs(scan_interval.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = coordinator.execute_cycle().await;
                    for decision in &report.executed {
                        executor.execute_decision(decision);
                    }
                    info!(
                        decisions = report.decisions.len(),
                        executed = report.executed.len(),
                        "cycle finished"
                    );
                }
                _ = cycle_rx.changed() => {
                    if *cycle_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });

    info!("all subsystems running; press ctrl-c to stop");

    // ── Graceful shutdown ────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received; stopping gracefully");

    let _ = shutdown_tx.send(true);
    fabric.registry.stop_all().await;
    fabric.fanout.flush();

    if let Err(e) = fabric.config.save(config_path) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("Quorum Trade Fabric shut down complete");
    Ok(())
}

async fn run_cycle(fabric: Fabric) -> anyhow::Result<()> {
    let report = fabric.coordinator.execute_cycle().await;
    fabric.fanout.flush();
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_health(fabric: Fabric) -> anyhow::Result<()> {
    let metrics = fabric.runtime.sample_metrics();
    let report = HealthReport {
        health: fabric
            .registry
            .health_check(fabric.memory.degraded_subsystems()),
        agents: fabric.registry.descriptors(Some(&metrics)),
        coordinator: fabric.coordinator.overview(),
        retrieval: fabric.router.stats(),
        fanout: fabric.fanout.stats(),
        runtime: fabric.runtime.stats(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
