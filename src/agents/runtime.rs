// =============================================================================
// Runtime Agent — system janitor and priority task executor
// =============================================================================
//
// Maintains an OS metrics snapshot on a five-second cadence and owns the
// fabric's priority task queue.  Execution honours an adaptive
// `max_concurrent` cap (2–20):
//   - CPU above 80%: decrement the cap and pause low-priority agents.
//   - Memory above 85%: trim the in-memory metric history.
//   - Quiet system: relax the cap back up to the ceiling.
//
// Tasks exceeding their timeout, or visibly stuck past ten minutes, are
// aborted. Failed tasks retry up to three times at demoted priority.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use sysinfo::{Disks, System};
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::AgentMessage;
use crate::memory::record::content_types;

use super::base::{Agent, AgentCore, AgentDeps};

/// Concurrency cap bounds.
const MIN_CONCURRENT: usize = 2;
const MAX_CONCURRENT: usize = 20;

/// Load thresholds for adaptive behaviour.
const HIGH_CPU_PCT: f64 = 80.0;
const HIGH_MEMORY_PCT: f64 = 85.0;
const QUIET_CPU_PCT: f64 = 60.0;

/// Retry policy for failed tasks.
const MAX_ATTEMPTS: u32 = 3;

/// Tasks with no completion after this long are considered stuck.
const STUCK_AFTER: Duration = Duration::from_secs(600);

/// Metric history ring size (~1 hour at the 5s cadence).
const METRIC_HISTORY_CAP: usize = 720;
const METRIC_HISTORY_TRIMMED: usize = 60;

/// Scheduler cadence; metrics refresh every fifth tick.
const TICK_MILLIS: u64 = 1_000;
const METRICS_EVERY_TICKS: u64 = 5;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

/// One OS metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SystemMetrics {
    pub cpu_pct: f64,
    pub memory_pct: f64,
    pub disk_pct: f64,
    pub load_avg: f64,
    pub process_count: usize,
    pub sampled_at: DateTime<Utc>,
}

/// Executor statistics for the health surface.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    pub max_concurrent: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

/// The work a submitted task performs, reusable across retries.
pub type TaskFn = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<Value, String>> + Send>> + Send + Sync,
>;

/// A hook into the registry for cross-agent load shedding.
pub trait LoadControl: Send + Sync {
    /// Pause up to `count` low-priority agents; returns how many paused.
    fn pause_low_priority(&self, count: usize) -> usize;
    /// Resume everything previously paused for load.
    fn resume_paused(&self);
}

struct QueuedTask {
    id: String,
    name: String,
    priority: TaskPriority,
    timeout: Option<Duration>,
    deps: Vec<String>,
    attempts: u32,
    submitted_at: Instant,
    work: TaskFn,
}

struct RunningTask {
    name: String,
    timeout: Option<Duration>,
    deps: Vec<String>,
    attempts: u32,
    started_at: Instant,
    handle: tokio::task::JoinHandle<Result<Value, String>>,
    work: TaskFn,
}

// ---------------------------------------------------------------------------
// Runtime Agent
// ---------------------------------------------------------------------------

pub struct RuntimeAgent {
    core: AgentCore,
    sys: Mutex<System>,
    metrics: RwLock<VecDeque<SystemMetrics>>,
    queue: Mutex<Vec<QueuedTask>>,
    running: Mutex<HashMap<String, RunningTask>>,
    completed: Mutex<HashSet<String>>,
    failed: Mutex<HashMap<String, String>>,
    max_concurrent: AtomicUsize,
    load_control: RwLock<Option<Weak<dyn LoadControl>>>,
    /// Set while low-priority agents are paused for load.
    shedding: Mutex<bool>,
}

impl RuntimeAgent {
    pub const NAME: &'static str = "runtime_agent";

    pub fn new(deps: AgentDeps, initial_max_concurrent: usize) -> Self {
        Self {
            core: AgentCore::new(Self::NAME, "runtime", deps),
            sys: Mutex::new(System::new()),
            metrics: RwLock::new(VecDeque::with_capacity(METRIC_HISTORY_CAP)),
            queue: Mutex::new(Vec::new()),
            running: Mutex::new(HashMap::new()),
            completed: Mutex::new(HashSet::new()),
            failed: Mutex::new(HashMap::new()),
            max_concurrent: AtomicUsize::new(
                initial_max_concurrent.clamp(MIN_CONCURRENT, MAX_CONCURRENT),
            ),
            load_control: RwLock::new(None),
            shedding: Mutex::new(false),
        }
    }

    /// Late-bound registry hook for load shedding; a weak reference keeps
    /// the component graph acyclic.
    pub fn set_load_control(&self, control: Weak<dyn LoadControl>) {
        *self.load_control.write() = Some(control);
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            max_concurrent: self.max_concurrent(),
            queued: self.queue.lock().len(),
            running: self.running.lock().len(),
            completed: self.completed.lock().len(),
            failed: self.failed.lock().len(),
        }
    }

    // -------------------------------------------------------------------------
    // Task submission
    // -------------------------------------------------------------------------

    /// Submit a task for execution. Returns the task id.
    pub fn submit(
        &self,
        name: impl Into<String>,
        priority: TaskPriority,
        timeout: Option<Duration>,
        deps: Vec<String>,
        work: TaskFn,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let task = QueuedTask {
            id: id.clone(),
            name: name.into(),
            priority,
            timeout,
            deps,
            attempts: 0,
            submitted_at: Instant::now(),
            work,
        };
        debug!(task = %task.name, id = %id, priority = ?priority, "task submitted");
        self.queue.lock().push(task);
        id
    }

    pub fn is_completed(&self, task_id: &str) -> bool {
        self.completed.lock().contains(task_id)
    }

    pub fn failure(&self, task_id: &str) -> Option<String> {
        self.failed.lock().get(task_id).cloned()
    }

    // -------------------------------------------------------------------------
    // Scheduling
    // -------------------------------------------------------------------------

    /// One scheduler pass: reap finished work, abort overdue work, then
    /// start queued tasks up to the concurrency cap.
    pub async fn tick(&self) {
        self.reap_finished().await;
        self.abort_overdue();
        self.start_ready();
    }

    async fn reap_finished(&self) {
        let finished_ids: Vec<String> = self
            .running
            .lock()
            .iter()
            .filter(|(_, task)| task.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for id in finished_ids {
            let Some(task) = self.running.lock().remove(&id) else {
                continue;
            };
            let RunningTask {
                name,
                timeout,
                deps,
                attempts,
                handle,
                work,
                ..
            } = task;
            match handle.await {
                Ok(Ok(_)) => {
                    debug!(task = %name, id = %id, "task completed");
                    self.completed.lock().insert(id);
                }
                Ok(Err(reason)) => {
                    self.handle_failure(id, name, timeout, deps, attempts, work, &reason)
                }
                Err(join_err) => {
                    let reason = if join_err.is_cancelled() {
                        "cancelled".to_string()
                    } else {
                        format!("panicked: {join_err}")
                    };
                    self.handle_failure(id, name, timeout, deps, attempts, work, &reason);
                }
            }
        }
    }

    fn abort_overdue(&self) {
        let mut running = self.running.lock();
        for (id, task) in running.iter_mut() {
            if task.handle.is_finished() {
                continue;
            }
            let elapsed = task.started_at.elapsed();
            let timed_out = task.timeout.map(|t| elapsed > t).unwrap_or(false);
            let stuck = elapsed > STUCK_AFTER;
            if timed_out || stuck {
                warn!(
                    task = %task.name,
                    id = %id,
                    elapsed_secs = elapsed.as_secs(),
                    stuck,
                    "aborting overdue task"
                );
                task.handle.abort();
                if stuck {
                    let _ = self.core.store_memory_with(
                        &format!("Stuck task aborted: {} after {}s", task.name, elapsed.as_secs()),
                        content_types::ERROR_PATTERN,
                        0.7,
                        json!({ "task": task.name, "elapsed_secs": elapsed.as_secs() }),
                    );
                }
            }
        }
    }

    fn handle_failure(
        &self,
        id: String,
        name: String,
        timeout: Option<Duration>,
        deps: Vec<String>,
        attempts: u32,
        work: TaskFn,
        reason: &str,
    ) {
        if attempts + 1 < MAX_ATTEMPTS {
            debug!(task = %name, id = %id, attempts = attempts + 1, reason, "task failed; requeueing at demoted priority");
            self.queue.lock().push(QueuedTask {
                id,
                name,
                // Retries always run behind fresh work.
                priority: TaskPriority::Low,
                timeout,
                deps,
                attempts: attempts + 1,
                submitted_at: Instant::now(),
                work,
            });
        } else {
            warn!(task = %name, id = %id, reason, "task failed permanently");
            self.failed.lock().insert(id, reason.to_string());
        }
    }

    fn start_ready(&self) {
        let cap = self.max_concurrent();
        loop {
            {
                if self.running.lock().len() >= cap {
                    return;
                }
            }
            let Some(task) = self.pop_ready() else {
                return;
            };

            let work = task.work.clone();
            let handle = tokio::spawn(async move { (work)().await });
            debug!(task = %task.name, id = %task.id, "task started");
            self.running.lock().insert(
                task.id,
                RunningTask {
                    name: task.name,
                    timeout: task.timeout,
                    deps: task.deps,
                    attempts: task.attempts,
                    started_at: Instant::now(),
                    handle,
                    work: task.work,
                },
            );
        }
    }

    /// Pop the highest-priority task whose dependencies have completed.
    /// Tasks with a failed dependency fail immediately.
    fn pop_ready(&self) -> Option<QueuedTask> {
        let mut queue = self.queue.lock();
        let completed = self.completed.lock();
        let failed = self.failed.lock();

        // Fail-fast for tasks whose dependency already failed.
        let mut doomed: Vec<usize> = Vec::new();
        for (i, task) in queue.iter().enumerate() {
            if task.deps.iter().any(|d| failed.contains_key(d)) {
                doomed.push(i);
            }
        }
        drop(failed);
        for i in doomed.into_iter().rev() {
            let task = queue.remove(i);
            warn!(task = %task.name, id = %task.id, "task dropped: dependency failed");
            self.failed
                .lock()
                .insert(task.id, "dependency failed".to_string());
        }

        let best = queue
            .iter()
            .enumerate()
            .filter(|(_, task)| task.deps.iter().all(|d| completed.contains(d)))
            .min_by(|(_, a), (_, b)| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| a.submitted_at.cmp(&b.submitted_at))
            })
            .map(|(i, _)| i)?;
        Some(queue.remove(best))
    }

    // -------------------------------------------------------------------------
    // Metrics & adaptive concurrency
    // -------------------------------------------------------------------------

    /// Sample the OS and append to the metric history ring.
    pub fn sample_metrics(&self) -> SystemMetrics {
        let snapshot = {
            let mut sys = self.sys.lock();
            sys.refresh_all();

            let memory_pct = if sys.total_memory() > 0 {
                sys.used_memory() as f64 / sys.total_memory() as f64 * 100.0
            } else {
                0.0
            };

            let disks = Disks::new_with_refreshed_list();
            let (total, available) = disks
                .iter()
                .fold((0u64, 0u64), |(t, a), d| (t + d.total_space(), a + d.available_space()));
            let disk_pct = if total > 0 {
                (total - available) as f64 / total as f64 * 100.0
            } else {
                0.0
            };

            SystemMetrics {
                cpu_pct: sys.global_cpu_usage() as f64,
                memory_pct,
                disk_pct,
                load_avg: System::load_average().one,
                process_count: sys.processes().len(),
                sampled_at: Utc::now(),
            }
        };

        let mut metrics = self.metrics.write();
        metrics.push_back(snapshot.clone());
        while metrics.len() > METRIC_HISTORY_CAP {
            metrics.pop_front();
        }
        snapshot
    }

    /// Apply the adaptive concurrency policy for one metrics snapshot.
    pub fn adapt_to_load(&self, metrics: &SystemMetrics) {
        if metrics.cpu_pct > HIGH_CPU_PCT {
            let current = self.max_concurrent();
            if current > MIN_CONCURRENT {
                self.max_concurrent.store(current - 1, Ordering::SeqCst);
                warn!(
                    cpu_pct = metrics.cpu_pct,
                    max_concurrent = current - 1,
                    "high CPU: reduced task concurrency"
                );
            }
            self.shed_load();
            self.record_optimization("high_cpu", "reduced_concurrency");
        } else if metrics.memory_pct > HIGH_MEMORY_PCT {
            let mut history = self.metrics.write();
            if history.len() > METRIC_HISTORY_TRIMMED {
                let excess = history.len() - METRIC_HISTORY_TRIMMED;
                history.drain(..excess);
            }
            drop(history);
            warn!(memory_pct = metrics.memory_pct, "high memory: trimmed metric history");
            self.record_optimization("high_memory", "trimmed_history");
        } else if metrics.cpu_pct < QUIET_CPU_PCT {
            let current = self.max_concurrent();
            let queue_len = self.queue.lock().len();
            if current < MAX_CONCURRENT && queue_len <= current * 2 {
                self.max_concurrent.store(current + 1, Ordering::SeqCst);
                debug!(max_concurrent = current + 1, "quiet system: relaxed task concurrency");
            }
            self.unshed_load();
        }
    }

    fn shed_load(&self) {
        let mut shedding = self.shedding.lock();
        if *shedding {
            return;
        }
        if let Some(control) = self.load_control.read().as_ref().and_then(|w| w.upgrade()) {
            let paused = control.pause_low_priority(2);
            if paused > 0 {
                *shedding = true;
                info!(paused, "low-priority agents paused for load");
            }
        }
    }

    fn unshed_load(&self) {
        let mut shedding = self.shedding.lock();
        if !*shedding {
            return;
        }
        if let Some(control) = self.load_control.read().as_ref().and_then(|w| w.upgrade()) {
            control.resume_paused();
            *shedding = false;
            info!("load-paused agents resumed");
        }
    }

    fn record_optimization(&self, issue: &str, action: &str) {
        let _ = self.core.store_memory_with(
            &format!("Runtime optimization: {issue} -> {action}"),
            content_types::SYSTEM_METRICS,
            0.5,
            json!({ "issue": issue, "action": action }),
        );
    }

    fn store_metrics_memory(&self, metrics: &SystemMetrics) {
        let _ = self.core.store_memory_with(
            &format!(
                "System metrics: CPU {:.1}%, memory {:.1}%, load {:.2}",
                metrics.cpu_pct, metrics.memory_pct, metrics.load_avg
            ),
            content_types::SYSTEM_METRICS,
            0.3,
            json!({
                "cpu_pct": metrics.cpu_pct,
                "memory_pct": metrics.memory_pct,
                "disk_pct": metrics.disk_pct,
                "load_avg": metrics.load_avg,
            }),
        );
    }
}

#[async_trait]
impl Agent for RuntimeAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn process(&self, mut shutdown: watch::Receiver<bool>) {
        info!(max_concurrent = self.max_concurrent(), "runtime agent loop started");
        let mut ticker = interval(Duration::from_millis(TICK_MILLIS));
        let mut tick_count: u64 = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tick_count += 1;
                    self.core.heartbeat();
                    for message in self.core.drain_inbox() {
                        if let AgentMessage::EventNotification { class, source, .. } = message {
                            debug!(class = %class, source = %source, "peer notification received");
                        }
                    }
                    self.tick().await;
                    if tick_count % METRICS_EVERY_TICKS == 0 {
                        let metrics = self.sample_metrics();
                        self.adapt_to_load(&metrics);
                        // Persist a metrics memory once a minute.
                        if tick_count % 60 == 0 {
                            self.store_metrics_memory(&metrics);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // Abort anything still in flight before exiting.
                        for (_, task) in self.running.lock().drain() {
                            task.handle.abort();
                        }
                        info!("runtime agent loop stopping");
                        break;
                    }
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
    use crate::agents::testutil::test_deps;

    fn ok_task(value: i64) -> TaskFn {
        Arc::new(move || {
            Box::pin(async move { Ok(json!(value)) })
        })
    }

    fn failing_task() -> TaskFn {
        Arc::new(|| Box::pin(async { Err("boom".to_string()) }))
    }

    fn build_agent(dir: &std::path::Path) -> RuntimeAgent {
        RuntimeAgent::new(test_deps(dir), 4)
    }

    #[tokio::test]
    async fn submitted_task_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let agent = build_agent(dir.path());

        let id = agent.submit("simple", TaskPriority::Normal, None, vec![], ok_task(42));
        agent.tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        agent.tick().await;

        assert!(agent.is_completed(&id));
        assert_eq!(agent.stats().running, 0);
    }

    #[tokio::test]
    async fn higher_priority_starts_first_under_a_tight_cap() {
        let dir = tempfile::tempdir().unwrap();
        let agent = RuntimeAgent::new(test_deps(dir.path()), 2);
        // Cap of 2 is the floor; queue three tasks and watch order.
        let _low = agent.submit("low", TaskPriority::Low, None, vec![], ok_task(1));
        let critical = agent.submit("critical", TaskPriority::Critical, None, vec![], ok_task(2));
        let high = agent.submit("high", TaskPriority::High, None, vec![], ok_task(3));

        agent.tick().await;
        // Only two slots: critical and high must be the ones running or done.
        let stats = agent.stats();
        assert_eq!(stats.running + stats.completed, 2);
        assert_eq!(stats.queued, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        agent.tick().await;
        assert!(agent.is_completed(&critical));
        assert!(agent.is_completed(&high));
    }

    #[tokio::test]
    async fn failed_task_retries_then_fails_permanently() {
        let dir = tempfile::tempdir().unwrap();
        let agent = build_agent(dir.path());

        let id = agent.submit("flaky", TaskPriority::Normal, None, vec![], failing_task());

        // Three attempts: run, reap+requeue, run, ...
        for _ in 0..(MAX_ATTEMPTS * 2 + 2) {
            agent.tick().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(!agent.is_completed(&id));
        assert_eq!(agent.failure(&id).as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn timed_out_task_is_aborted() {
        let dir = tempfile::tempdir().unwrap();
        let agent = build_agent(dir.path());

        let id = agent.submit(
            "sleeper",
            TaskPriority::Normal,
            Some(Duration::from_millis(30)),
            vec![],
            Arc::new(|| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(json!(null))
                })
            }),
        );

        agent.tick().await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        // Abort pass, then reap pass; retries burn out on the same timeout.
        for _ in 0..(MAX_ATTEMPTS * 2 + 2) {
            agent.tick().await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert!(!agent.is_completed(&id));
        assert!(agent.failure(&id).is_some());
    }

    #[tokio::test]
    async fn dependencies_gate_execution() {
        let dir = tempfile::tempdir().unwrap();
        let agent = build_agent(dir.path());

        let first = agent.submit("first", TaskPriority::Normal, None, vec![], ok_task(1));
        let second = agent.submit(
            "second",
            TaskPriority::Critical,
            None,
            vec![first.clone()],
            ok_task(2),
        );

        agent.tick().await;
        // Second cannot start before first completes, despite priority.
        assert!(!agent.is_completed(&second));

        tokio::time::sleep(Duration::from_millis(50)).await;
        agent.tick().await; // reap first, start second
        tokio::time::sleep(Duration::from_millis(50)).await;
        agent.tick().await; // reap second

        assert!(agent.is_completed(&first));
        assert!(agent.is_completed(&second));
    }

    #[tokio::test]
    async fn dependency_failure_dooms_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let agent = build_agent(dir.path());

        let first = agent.submit("doomed-dep", TaskPriority::Normal, None, vec![], failing_task());
        let second = agent.submit(
            "dependent",
            TaskPriority::Normal,
            None,
            vec![first.clone()],
            ok_task(1),
        );

        for _ in 0..(MAX_ATTEMPTS * 2 + 4) {
            agent.tick().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(agent.failure(&second).as_deref(), Some("dependency failed"));
    }

    #[test]
    fn adaptive_concurrency_respects_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let agent = build_agent(dir.path());

        let hot = SystemMetrics {
            cpu_pct: 95.0,
            memory_pct: 40.0,
            disk_pct: 10.0,
            load_avg: 8.0,
            process_count: 100,
            sampled_at: Utc::now(),
        };
        // Drive the cap to the floor and keep pushing.
        for _ in 0..10 {
            agent.adapt_to_load(&hot);
        }
        assert_eq!(agent.max_concurrent(), MIN_CONCURRENT);

        let quiet = SystemMetrics {
            cpu_pct: 10.0,
            ..hot.clone()
        };
        for _ in 0..50 {
            agent.adapt_to_load(&quiet);
        }
        assert_eq!(agent.max_concurrent(), MAX_CONCURRENT);
    }

    #[test]
    fn high_memory_trims_history() {
        let dir = tempfile::tempdir().unwrap();
        let agent = build_agent(dir.path());

        {
            let mut history = agent.metrics.write();
            for i in 0..200 {
                history.push_back(SystemMetrics {
                    cpu_pct: 10.0,
                    memory_pct: 50.0,
                    disk_pct: 10.0,
                    load_avg: 1.0,
                    process_count: i,
                    sampled_at: Utc::now(),
                });
            }
        }

        let swollen = SystemMetrics {
            cpu_pct: 10.0,
            memory_pct: 95.0,
            disk_pct: 10.0,
            load_avg: 1.0,
            process_count: 0,
            sampled_at: Utc::now(),
        };
        agent.adapt_to_load(&swollen);

        assert!(agent.metrics.read().len() <= METRIC_HISTORY_TRIMMED);
    }

    #[test]
    fn initial_cap_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let deps = test_deps(dir.path());
        let tiny = RuntimeAgent::new(deps.clone(), 0);
        assert_eq!(tiny.max_concurrent(), MIN_CONCURRENT);
        let huge = RuntimeAgent::new(deps, 500);
        assert_eq!(huge.max_concurrent(), MAX_CONCURRENT);
    }
}
