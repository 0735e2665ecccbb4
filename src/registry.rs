// =============================================================================
// Agent Registry & Health — lifecycle supervision and health scoring
// =============================================================================
//
// Register-once, start/stop/pause primitives over named agents. Starting
// an agent spawns its process loop under a supervisor that restarts it on
// a crash with bounded exponential backoff. Stopping signals the loop and
// grants a grace window before force-terminating.
//
// Health: an agent whose heartbeat is stale past five minutes or whose
// error count exceeds five is unhealthy. The periodic check writes a
// `health_check` memory with the unhealthy set and the system score
// (total - unhealthy) / total.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::{interval, timeout, Duration};
use tracing::{info, warn};

use crate::agents::base::{Agent, PerformanceCounters};
use crate::agents::runtime::{LoadControl, SystemMetrics};
use crate::errors::{CoreError, CoreResult};
use crate::memory::record::{content_types, MemoryMetadata};
use crate::memory::MemoryStore;
use crate::types::LifecycleState;

/// Heartbeats older than this many minutes mark an agent unhealthy.
const STALE_HEARTBEAT_MINUTES: i64 = 5;

/// Error counts above this mark an agent unhealthy.
const MAX_HEALTHY_ERRORS: u32 = 5;

/// Grace window for a process loop to exit after the shutdown signal.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Supervisor restart policy.
const MAX_RESTARTS: u32 = 3;

/// Cadence of the periodic health check.
const HEALTH_CHECK_INTERVAL_SECS: u64 = 60;

/// Registry view of one agent (§3 agent descriptor).
#[derive(Debug, Clone, Serialize)]
pub struct AgentDescriptor {
    pub name: String,
    pub kind: String,
    pub state: LifecycleState,
    pub last_heartbeat: DateTime<Utc>,
    pub counters: PerformanceCounters,
    pub cpu_share: f64,
    pub memory_share: f64,
    pub error_count: u32,
    pub restart_count: u32,
}

/// Output of a health check pass.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub status: String,
    pub total_agents: usize,
    pub unhealthy_agents: Vec<String>,
    /// (total - unhealthy) / total; 1.0 with no agents registered.
    pub health_score: f64,
    pub degraded_subsystems: Vec<String>,
}

struct RegisteredAgent {
    agent: Arc<dyn Agent>,
    low_priority: bool,
    paused_for_load: bool,
    restart_count: u32,
    shutdown: Option<watch::Sender<bool>>,
    supervisor: Option<tokio::task::JoinHandle<()>>,
}

pub struct AgentRegistry {
    memory: Arc<MemoryStore>,
    agents: RwLock<HashMap<String, Mutex<RegisteredAgent>>>,
}

impl AgentRegistry {
    pub fn new(memory: Arc<MemoryStore>) -> Self {
        Self {
            memory,
            agents: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Registration & lifecycle
    // -------------------------------------------------------------------------

    /// Register an agent once. Low-priority agents are the first paused
    /// under load.
    pub fn register(&self, agent: Arc<dyn Agent>, low_priority: bool) -> CoreResult<()> {
        let name = agent.name().to_string();
        let mut agents = self.agents.write();
        if agents.contains_key(&name) {
            return Err(CoreError::AgentCrash {
                agent: name,
                reason: "already registered".to_string(),
            });
        }
        info!(agent = %name, low_priority, "agent registered");
        agents.insert(
            name,
            Mutex::new(RegisteredAgent {
                agent,
                low_priority,
                paused_for_load: false,
                restart_count: 0,
                shutdown: None,
                supervisor: None,
            }),
        );
        Ok(())
    }

    pub fn agent_names(&self) -> Vec<String> {
        self.agents.read().keys().cloned().collect()
    }

    /// Start an agent's process loop under crash supervision.
    pub fn start(self: &Arc<Self>, name: &str) -> CoreResult<()> {
        let agents = self.agents.read();
        let entry = agents.get(name).ok_or_else(|| CoreError::AgentCrash {
            agent: name.to_string(),
            reason: "not registered".to_string(),
        })?;
        let mut registered = entry.lock();
        if registered.supervisor.is_some() {
            return Ok(());
        }

        registered.agent.core().start();

        let (tx, rx) = watch::channel(false);
        let agent = registered.agent.clone();
        let registry = Arc::downgrade(self);
        let agent_name = name.to_string();

        let supervisor = tokio::spawn(async move {
            let mut restarts = 0u32;
            loop {
                let a = agent.clone();
                let loop_rx = rx.clone();
                let run = tokio::spawn(async move { a.process(loop_rx).await });

                match run.await {
                    // Clean exit: the loop saw the shutdown signal.
                    Ok(()) => break,
                    Err(join_err) => {
                        let reason = format!("process loop failed: {join_err}");
                        agent.core().mark_error(&reason);
                        restarts += 1;
                        if let Some(registry) = registry.upgrade() {
                            registry.note_restart(&agent_name);
                        }
                        if restarts > MAX_RESTARTS || *rx.borrow() {
                            warn!(agent = %agent_name, restarts, "supervisor giving up");
                            break;
                        }
                        let backoff = Duration::from_secs(1 << restarts.min(6));
                        warn!(agent = %agent_name, restarts, backoff_secs = backoff.as_secs(), "restarting crashed agent");
                        tokio::time::sleep(backoff).await;
                        agent.core().start();
                    }
                }
            }
        });

        registered.shutdown = Some(tx);
        registered.supervisor = Some(supervisor);
        Ok(())
    }

    /// Start every registered agent.
    pub fn start_all(self: &Arc<Self>) {
        for name in self.agent_names() {
            if let Err(e) = self.start(&name) {
                warn!(agent = %name, error = %e, "agent failed to start");
            }
        }
    }

    /// Signal an agent's loop to stop; force-terminate after the grace
    /// window.
    pub async fn stop(&self, name: &str) -> CoreResult<()> {
        let (shutdown, supervisor, agent) = {
            let agents = self.agents.read();
            let entry = agents.get(name).ok_or_else(|| CoreError::AgentCrash {
                agent: name.to_string(),
                reason: "not registered".to_string(),
            })?;
            let mut registered = entry.lock();
            (
                registered.shutdown.take(),
                registered.supervisor.take(),
                registered.agent.clone(),
            )
        };

        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }

        if let Some(supervisor) = supervisor {
            match timeout(STOP_GRACE, supervisor).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(agent = %name, grace_secs = STOP_GRACE.as_secs(), "grace window expired; force-terminating");
                    let metadata =
                        MemoryMetadata::new(content_types::ERROR_PATTERN, "agent_registry", 0.7)
                            .with("agent", name)
                            .with("issue", "forced_termination");
                    let _ = self.memory.store_text(
                        &format!("Agent {name} force-terminated after grace window"),
                        metadata,
                    );
                }
            }
        }

        agent.core().stop();
        Ok(())
    }

    /// Stop every running agent.
    pub async fn stop_all(&self) {
        for name in self.agent_names() {
            if let Err(e) = self.stop(&name).await {
                warn!(agent = %name, error = %e, "agent failed to stop");
            }
        }
    }

    pub fn pause(&self, name: &str) -> CoreResult<()> {
        let agents = self.agents.read();
        let entry = agents.get(name).ok_or_else(|| CoreError::AgentCrash {
            agent: name.to_string(),
            reason: "not registered".to_string(),
        })?;
        entry.lock().agent.core().pause();
        Ok(())
    }

    pub fn resume(&self, name: &str) -> CoreResult<()> {
        let agents = self.agents.read();
        let entry = agents.get(name).ok_or_else(|| CoreError::AgentCrash {
            agent: name.to_string(),
            reason: "not registered".to_string(),
        })?;
        entry.lock().agent.core().resume();
        Ok(())
    }

    fn note_restart(&self, name: &str) {
        if let Some(entry) = self.agents.read().get(name) {
            entry.lock().restart_count += 1;
        }
    }

    // -------------------------------------------------------------------------
    // Health
    // -------------------------------------------------------------------------

    /// Descriptors for every registered agent. CPU/memory shares are an
    /// even split of the latest system metrics when available.
    pub fn descriptors(&self, system: Option<&SystemMetrics>) -> Vec<AgentDescriptor> {
        let agents = self.agents.read();
        let count = agents.len().max(1) as f64;
        agents
            .values()
            .map(|entry| {
                let registered = entry.lock();
                let core = registered.agent.core();
                AgentDescriptor {
                    name: core.name().to_string(),
                    kind: core.kind().to_string(),
                    state: core.state(),
                    last_heartbeat: core.last_heartbeat(),
                    counters: core.counters(),
                    cpu_share: system.map(|m| m.cpu_pct / count).unwrap_or(0.0),
                    memory_share: system.map(|m| m.memory_pct / count).unwrap_or(0.0),
                    error_count: core.error_count(),
                    restart_count: registered.restart_count,
                }
            })
            .collect()
    }

    /// Evaluate health and write the `health_check` memory.
    pub fn health_check(&self, degraded_subsystems: Vec<String>) -> HealthSummary {
        let now = Utc::now();
        let agents = self.agents.read();
        let total = agents.len();

        let unhealthy: Vec<String> = agents
            .values()
            .filter_map(|entry| {
                let registered = entry.lock();
                let core = registered.agent.core();
                let stale =
                    now - core.last_heartbeat() > ChronoDuration::minutes(STALE_HEARTBEAT_MINUTES);
                let erratic = core.error_count() > MAX_HEALTHY_ERRORS;
                (stale || erratic).then(|| core.name().to_string())
            })
            .collect();
        drop(agents);

        let health_score = if total == 0 {
            1.0
        } else {
            (total - unhealthy.len()) as f64 / total as f64
        };
        let status = if !degraded_subsystems.is_empty() {
            "degraded"
        } else if unhealthy.is_empty() {
            "healthy"
        } else {
            "unhealthy"
        };

        for name in &unhealthy {
            warn!(agent = %name, "agent is unhealthy");
        }

        let metadata = MemoryMetadata::new(content_types::HEALTH_CHECK, "agent_registry", 0.5)
            .with("total_agents", total)
            .with("unhealthy", json!(unhealthy))
            .with("health_score", health_score)
            .with("status", status);
        let _ = self.memory.store_text(
            &format!(
                "Health check: {}/{} agents healthy (score {health_score:.2})",
                total - unhealthy.len(),
                total
            ),
            metadata,
        );

        HealthSummary {
            status: status.to_string(),
            total_agents: total,
            unhealthy_agents: unhealthy,
            health_score,
            degraded_subsystems,
        }
    }
}

impl LoadControl for AgentRegistry {
    fn pause_low_priority(&self, count: usize) -> usize {
        let agents = self.agents.read();
        let mut paused = 0usize;
        for entry in agents.values() {
            if paused == count {
                break;
            }
            let mut registered = entry.lock();
            if registered.low_priority
                && !registered.paused_for_load
                && registered.agent.core().state() == LifecycleState::Active
            {
                registered.agent.core().pause();
                registered.paused_for_load = true;
                paused += 1;
            }
        }
        paused
    }

    fn resume_paused(&self) {
        let agents = self.agents.read();
        for entry in agents.values() {
            let mut registered = entry.lock();
            if registered.paused_for_load {
                registered.agent.core().resume();
                registered.paused_for_load = false;
            }
        }
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.agents.read().len())
            .finish()
    }
}

/// Periodic health loop; spawned once at startup.
pub async fn run_health_loop(
    registry: Arc<AgentRegistry>,
    memory: Arc<MemoryStore>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = HEALTH_CHECK_INTERVAL_SECS, "health loop started");
    let mut ticker = interval(Duration::from_secs(HEALTH_CHECK_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                registry.health_check(memory.degraded_subsystems());
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("health loop stopping");
                    break;
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::base::{AgentCore, AgentDeps};
    use crate::agents::testutil::test_deps;
    use async_trait::async_trait;

    /// Minimal agent whose loop ticks until shutdown.
    struct TickAgent {
        core: AgentCore,
    }

    impl TickAgent {
        fn new(name: &str, deps: AgentDeps) -> Self {
            Self {
                core: AgentCore::new(name, "testing", deps),
            }
        }
    }

    #[async_trait]
    impl Agent for TickAgent {
        fn core(&self) -> &AgentCore {
            &self.core
        }

        async fn process(&self, mut shutdown: watch::Receiver<bool>) {
            let mut ticker = interval(Duration::from_millis(10));
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.core.heartbeat(),
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }
    }

    fn build_registry(dir: &std::path::Path) -> (Arc<AgentRegistry>, AgentDeps) {
        let deps = test_deps(dir);
        (Arc::new(AgentRegistry::new(deps.memory.clone())), deps)
    }

    #[test]
    fn register_once_only() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, deps) = build_registry(dir.path());

        let agent = Arc::new(TickAgent::new("ticker", deps.clone()));
        registry.register(agent.clone(), false).unwrap();
        assert!(registry.register(agent, false).is_err());
    }

    #[tokio::test]
    async fn start_and_stop_transition_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, deps) = build_registry(dir.path());

        let agent = Arc::new(TickAgent::new("ticker", deps));
        registry.register(agent.clone(), false).unwrap();

        registry.start("ticker").unwrap();
        assert_eq!(agent.core().state(), LifecycleState::Active);

        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.stop("ticker").await.unwrap();
        assert_eq!(agent.core().state(), LifecycleState::Inactive);
    }

    #[tokio::test]
    async fn health_check_flags_erratic_agents() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, deps) = build_registry(dir.path());

        let healthy = Arc::new(TickAgent::new("healthy", deps.clone()));
        let erratic = Arc::new(TickAgent::new("erratic", deps));
        registry.register(healthy, false).unwrap();
        registry.register(erratic.clone(), false).unwrap();

        for i in 0..=MAX_HEALTHY_ERRORS {
            erratic.core().mark_error(&format!("failure {i}"));
        }

        let summary = registry.health_check(vec![]);
        assert_eq!(summary.total_agents, 2);
        assert_eq!(summary.unhealthy_agents, vec!["erratic".to_string()]);
        assert!((summary.health_score - 0.5).abs() < 1e-12);
        assert_eq!(summary.status, "unhealthy");
    }

    #[test]
    fn degraded_subsystems_degrade_status() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, deps) = build_registry(dir.path());
        registry
            .register(Arc::new(TickAgent::new("only", deps)), false)
            .unwrap();

        let summary = registry.health_check(vec!["encoder".to_string()]);
        assert_eq!(summary.status, "degraded");
        assert_eq!(summary.degraded_subsystems, vec!["encoder".to_string()]);
    }

    #[test]
    fn empty_registry_is_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _deps) = build_registry(dir.path());
        let summary = registry.health_check(vec![]);
        assert!((summary.health_score - 1.0).abs() < 1e-12);
        assert_eq!(summary.status, "healthy");
    }

    #[tokio::test]
    async fn load_control_pauses_and_resumes_low_priority() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, deps) = build_registry(dir.path());

        let important = Arc::new(TickAgent::new("important", deps.clone()));
        let sweeper = Arc::new(TickAgent::new("sweeper", deps));
        registry.register(important.clone(), false).unwrap();
        registry.register(sweeper.clone(), true).unwrap();
        registry.start_all();

        let paused = registry.pause_low_priority(2);
        assert_eq!(paused, 1);
        assert_eq!(sweeper.core().state(), LifecycleState::Paused);
        assert_eq!(important.core().state(), LifecycleState::Active);

        registry.resume_paused();
        assert_eq!(sweeper.core().state(), LifecycleState::Active);

        registry.stop_all().await;
    }

    #[test]
    fn descriptors_report_counters_and_state() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, deps) = build_registry(dir.path());
        let agent = Arc::new(TickAgent::new("described", deps));
        registry.register(agent.clone(), false).unwrap();

        agent.core().learn_from_outcome("test", "won", true, 5.0);

        let descriptors = registry.descriptors(None);
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].name, "described");
        assert_eq!(descriptors[0].counters.decisions_made, 1);
        assert_eq!(descriptors[0].restart_count, 0);
    }
}
