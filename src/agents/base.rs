// =============================================================================
// Base Agent — lifecycle, counters, and memory-assisted decisioning
// =============================================================================
//
// Every specialized agent embeds an `AgentCore` and implements the `Agent`
// trait. The core owns the lifecycle state machine, the rolling
// performance counters, and the memory wrappers that auto-attach agent
// identity to every stored record.
//
// Counters are monotonically non-decreasing; accuracy is defined only when
// total > 0 and always equals successful / total. Status and learning
// memories are written durably before the corresponding transition
// completes.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{AgentEvent, AgentMessage, AgentsOut, EventPayload, InputRouter};
use crate::errors::CoreResult;
use crate::memory::record::{content_types, MemoryMetadata, MemoryRecord};
use crate::memory::MemoryStore;
use crate::types::LifecycleState;

/// Rolling performance counters shared by every agent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceCounters {
    pub decisions_made: u64,
    pub successful: u64,
    pub failed: u64,
    /// successful / (successful + failed); 0.0 until the first outcome.
    pub accuracy: f64,
    pub total_pnl: f64,
}

/// Shared plumbing injected into every agent at construction.
#[derive(Clone)]
pub struct AgentDeps {
    pub memory: Arc<MemoryStore>,
    pub router: Arc<InputRouter>,
    pub fanout: Arc<AgentsOut>,
}

pub struct AgentCore {
    name: String,
    kind: String,
    id: String,
    state: RwLock<LifecycleState>,
    counters: RwLock<PerformanceCounters>,
    last_heartbeat: RwLock<DateTime<Utc>>,
    error_count: AtomicU32,
    /// Receiving half of this agent's inbox, registered with the router
    /// at construction. Drained cooperatively by the process loop.
    inbox: Mutex<mpsc::UnboundedReceiver<AgentMessage>>,
    deps: AgentDeps,
}

impl AgentCore {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, deps: AgentDeps) -> Self {
        let name = name.into();
        let inbox = deps.router.register_inbox(name.clone());
        Self {
            name,
            kind: kind.into(),
            id: Uuid::new_v4().to_string(),
            state: RwLock::new(LifecycleState::Inactive),
            counters: RwLock::new(PerformanceCounters::default()),
            last_heartbeat: RwLock::new(Utc::now()),
            error_count: AtomicU32::new(0),
            inbox: Mutex::new(inbox),
            deps,
        }
    }

    /// Drain queued inbox messages without blocking.
    pub fn drain_inbox(&self) -> Vec<AgentMessage> {
        let mut inbox = self.inbox.lock();
        let mut messages = Vec::new();
        while let Ok(message) = inbox.try_recv() {
            messages.push(message);
        }
        messages
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn router(&self) -> &Arc<InputRouter> {
        &self.deps.router
    }

    pub fn fanout(&self) -> &Arc<AgentsOut> {
        &self.deps.fanout
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    /// Transition inactive/paused -> active, writing the status memory
    /// before the transition completes.
    pub fn start(&self) {
        *self.state.write() = LifecycleState::Starting;
        self.record_status("starting");
        *self.state.write() = LifecycleState::Active;
        self.record_status("active");
        info!(agent = %self.name, "agent started");
    }

    /// Transition -> inactive, writing the status memory first.
    pub fn stop(&self) {
        *self.state.write() = LifecycleState::Stopping;
        self.record_status("stopping");
        *self.state.write() = LifecycleState::Inactive;
        self.record_status("inactive");
        info!(agent = %self.name, "agent stopped");
    }

    pub fn pause(&self) {
        *self.state.write() = LifecycleState::Pausing;
        self.record_status("pausing");
        *self.state.write() = LifecycleState::Paused;
        self.record_status("paused");
        info!(agent = %self.name, "agent paused");
    }

    pub fn resume(&self) {
        if self.state() == LifecycleState::Paused {
            *self.state.write() = LifecycleState::Active;
            self.record_status("active");
            info!(agent = %self.name, "agent resumed");
        }
    }

    /// Record a crash: error state, bumped error count, error memory.
    pub fn mark_error(&self, reason: &str) {
        *self.state.write() = LifecycleState::Error;
        self.error_count.fetch_add(1, Ordering::SeqCst);
        warn!(agent = %self.name, reason, "agent entered error state");
        let _ = self.store_memory_with(
            &format!("Agent {} error: {reason}", self.name),
            content_types::ERROR_PATTERN,
            0.7,
            json!({ "reason": reason }),
        );
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::SeqCst)
    }

    pub fn heartbeat(&self) {
        *self.last_heartbeat.write() = Utc::now();
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        *self.last_heartbeat.read()
    }

    fn record_status(&self, state: &str) {
        // The memory write happens before the caller observes the completed
        // transition: best-effort, but failures are logged loudly.
        if let Err(e) = self.store_memory_with(
            &format!("Agent {} is {state}", self.name),
            content_types::STATUS_UPDATE,
            0.3,
            json!({ "state": state }),
        ) {
            warn!(agent = %self.name, error = %e, "status memory write failed");
        }

        self.deps.fanout.emit(AgentEvent::new(
            self.name.clone(),
            EventPayload::Status {
                agent: self.name.clone(),
                state: state.to_string(),
                details: json!({ "kind": self.kind, "id": self.id }),
            },
        ));
    }

    // -------------------------------------------------------------------------
    // Memory helpers
    // -------------------------------------------------------------------------

    /// Store a memory with the agent's identity auto-attached. Returns the
    /// record id.
    pub fn store_memory(
        &self,
        content: &str,
        memory_type: &str,
        importance: f64,
    ) -> CoreResult<String> {
        self.store_memory_with(content, memory_type, importance, json!({}))
    }

    /// Store a memory with extra type-specific fields.
    pub fn store_memory_with(
        &self,
        content: &str,
        memory_type: &str,
        importance: f64,
        extra: serde_json::Value,
    ) -> CoreResult<String> {
        let mut metadata = MemoryMetadata::new(memory_type, self.name.clone(), importance)
            .with("agent_kind", self.kind.clone())
            .with("agent_id", self.id.clone());
        if let serde_json::Value::Object(map) = extra {
            for (key, value) in map {
                metadata = metadata.with(key, value);
            }
        }
        let record = self.deps.memory.store_text(content, metadata)?;
        Ok(record.id)
    }

    /// Query memories scoped to this agent's kind, mapping cosine distance
    /// to relevance = 1 - distance.
    pub fn retrieve_memories(
        &self,
        query: &str,
        memory_type: Option<&str>,
        limit: usize,
    ) -> Vec<(f64, MemoryRecord)> {
        // Over-fetch before filtering so the kind scope doesn't starve the
        // result set.
        let scored = self.deps.memory.query_scored(query, limit.saturating_mul(4).max(limit));
        let mut results: Vec<(f64, MemoryRecord)> = scored
            .into_iter()
            .filter(|(_, record)| {
                let same_kind = record
                    .metadata
                    .get("agent_kind")
                    .and_then(|v| v.as_str())
                    .map(|k| k == self.kind)
                    .unwrap_or(false);
                let same_name = record.source() == self.name;
                if !(same_kind || same_name) {
                    return false;
                }
                match memory_type {
                    Some(t) => record.content_type() == t,
                    None => true,
                }
            })
            .map(|(similarity, record)| {
                // distance = 1 - similarity, relevance = 1 - distance
                (similarity as f64, record)
            })
            .collect();
        results.truncate(limit);
        results
    }

    /// Sugar: past learning experiences similar to the current situation.
    pub fn get_similar_experiences(
        &self,
        situation: &str,
        limit: usize,
    ) -> Vec<(f64, MemoryRecord)> {
        self.retrieve_memories(situation, Some(content_types::LEARNING_EXPERIENCE), limit)
    }

    // -------------------------------------------------------------------------
    // Outcome accounting
    // -------------------------------------------------------------------------

    /// Update counters from a decision outcome and write the learning
    /// memory durably before returning.
    pub fn learn_from_outcome(&self, decision: &str, outcome: &str, success: bool, pnl: f64) {
        {
            let mut counters = self.counters.write();
            counters.decisions_made += 1;
            if success {
                counters.successful += 1;
            } else {
                counters.failed += 1;
            }
            let total = counters.successful + counters.failed;
            counters.accuracy = counters.successful as f64 / total as f64;
            counters.total_pnl += pnl;
        }

        let result = self.store_memory_with(
            &format!(
                "Decision: {decision} | Outcome: {outcome} | {} with P&L {pnl:.2}",
                if success { "SUCCESS" } else { "FAILURE" }
            ),
            content_types::LEARNING_EXPERIENCE,
            if success { 0.7 } else { 0.8 },
            json!({ "success": success, "pnl": pnl }),
        );
        if let Err(e) = result {
            warn!(agent = %self.name, error = %e, "learning memory write failed");
        }
    }

    pub fn counters(&self) -> PerformanceCounters {
        self.counters.read().clone()
    }
}

impl std::fmt::Debug for AgentCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentCore")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

/// The contract every specialized agent implements. `process` is the
/// cooperative main loop: it must tick, yield at every await point, and
/// exit promptly once the shutdown signal flips.
#[async_trait]
pub trait Agent: Send + Sync {
    fn core(&self) -> &AgentCore;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn kind(&self) -> &str {
        self.core().kind()
    }

    async fn process(&self, shutdown: watch::Receiver<bool>);
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testutil::test_deps;

    #[test]
    fn lifecycle_transitions_write_status_memories() {
        let dir = tempfile::tempdir().unwrap();
        let deps = test_deps(dir.path());
        let core = AgentCore::new("test_agent", "testing", deps.clone());

        assert_eq!(core.state(), LifecycleState::Inactive);
        core.start();
        assert_eq!(core.state(), LifecycleState::Active);
        core.stop();
        assert_eq!(core.state(), LifecycleState::Inactive);

        let statuses: Vec<_> = deps
            .memory
            .scan(50)
            .into_iter()
            .filter(|r| r.content_type() == content_types::STATUS_UPDATE)
            .collect();
        // starting, active, stopping, inactive
        assert_eq!(statuses.len(), 4);
    }

    #[test]
    fn counters_are_monotonic_and_accuracy_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let core = AgentCore::new("test_agent", "testing", test_deps(dir.path()));

        core.learn_from_outcome("buy AAPL", "profit", true, 25.0);
        core.learn_from_outcome("buy TSLA", "loss", false, -10.0);
        core.learn_from_outcome("buy NVDA", "profit", true, 15.0);

        let counters = core.counters();
        assert_eq!(counters.decisions_made, 3);
        assert_eq!(counters.successful, 2);
        assert_eq!(counters.failed, 1);
        assert!((counters.accuracy - 2.0 / 3.0).abs() < 1e-12);
        assert!((counters.total_pnl - 30.0).abs() < 1e-9);
    }

    #[test]
    fn stored_memories_carry_agent_identity() {
        let dir = tempfile::tempdir().unwrap();
        let deps = test_deps(dir.path());
        let core = AgentCore::new("timing_agent", "timing", deps.clone());

        let id = core
            .store_memory("session analysis complete", content_types::TIMING_ANALYSIS, 0.6)
            .unwrap();

        let record = deps.memory.get(&id).unwrap();
        assert_eq!(record.source(), "timing_agent");
        assert_eq!(record.metadata.get("agent_kind").unwrap(), "timing");
        assert!(record.metadata.get("agent_id").is_some());
    }

    #[test]
    fn retrieval_is_scoped_to_agent_kind() {
        let dir = tempfile::tempdir().unwrap();
        let deps = test_deps(dir.path());
        let timing = AgentCore::new("timing_agent", "timing", deps.clone());
        let strategy = AgentCore::new("strategy_agent", "strategy", deps);

        timing
            .store_memory("regular session momentum works", content_types::TIMING_OUTCOME, 0.6)
            .unwrap();
        strategy
            .store_memory("regular session momentum works", content_types::TIMING_OUTCOME, 0.6)
            .unwrap();

        let results = timing.retrieve_memories("regular session momentum works", None, 10);
        assert!(!results.is_empty());
        for (_, record) in results {
            assert_eq!(record.metadata.get("agent_kind").unwrap(), "timing");
        }
    }

    #[test]
    fn similar_experiences_only_return_learning_memories() {
        let dir = tempfile::tempdir().unwrap();
        let core = AgentCore::new("rules_agent", "rules", test_deps(dir.path()));

        core.learn_from_outcome("enable breakout rule", "won", true, 5.0);
        core.store_memory("unrelated status", content_types::STATUS_UPDATE, 0.2)
            .unwrap();

        let experiences = core.get_similar_experiences("enable breakout rule", 10);
        assert!(!experiences.is_empty());
        for (_, record) in experiences {
            assert_eq!(record.content_type(), content_types::LEARNING_EXPERIENCE);
        }
    }

    #[tokio::test]
    async fn fanout_notifications_arrive_in_the_inbox() {
        let dir = tempfile::tempdir().unwrap();
        let deps = test_deps(dir.path());
        let runtime = AgentCore::new("runtime_agent", "runtime", deps.clone());
        let scraper = AgentCore::new("stock_scraper", "data", deps.clone());

        // An error event routes to runtime_agent (and coordinator), not
        // back to the source.
        deps.fanout.emit(AgentEvent::new(
            "stock_scraper",
            EventPayload::Error {
                message: "feed stalled".to_string(),
                severity: crate::bus::ErrorSeverity::High,
                context: json!({}),
            },
        ));

        let messages = runtime.drain_inbox();
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            AgentMessage::EventNotification { source, .. } => {
                assert_eq!(source, "stock_scraper");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(scraper.drain_inbox().is_empty(), "source must not self-notify");
    }

    #[test]
    fn mark_error_bumps_count_and_state() {
        let dir = tempfile::tempdir().unwrap();
        let core = AgentCore::new("scraper", "data", test_deps(dir.path()));

        core.mark_error("simulated feed failure");
        core.mark_error("second failure");

        assert_eq!(core.state(), LifecycleState::Error);
        assert_eq!(core.error_count(), 2);
    }
}
