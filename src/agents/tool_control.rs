// =============================================================================
// Tool Control Agent — registry, timed execution, and recommendation
// =============================================================================
//
// Tools are named handles (builtin async closures or external commands)
// with a category, priority, dependency list, and parameter schema.
// Every execution is timed and scored:
//
//   efficiency = min(1, 10 / avg_duration_secs) * success_rate
//   score      = 0.7 * efficiency + 0.3 * success_rate
//
// `recommend` sorts eligible tools by score. Tools whose success rate
// drops below 0.7 after enough samples are flagged for maintenance.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::{interval, timeout, Duration};
use tracing::{debug, info, warn};

use crate::bus::AgentMessage;
use crate::errors::{CoreError, CoreResult};
use crate::memory::record::content_types;

use super::base::{Agent, AgentCore, AgentDeps};

/// Score weights.
const PERFORMANCE_WEIGHT: f64 = 0.7;
const RELIABILITY_WEIGHT: f64 = 0.3;

/// Maintenance flagging thresholds.
const MAINTENANCE_SUCCESS_RATE: f64 = 0.7;
const MAINTENANCE_MIN_SAMPLES: u32 = 5;

/// Execution history ring size.
const HISTORY_CAP: usize = 100;

const TICK_INTERVAL_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// Tool model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    DataCollection,
    Analysis,
    Strategy,
    Execution,
    Monitoring,
    Utility,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Registered,
    Available,
    Error,
    Maintenance,
}

/// What invoking a tool actually runs.
#[derive(Clone)]
pub enum ToolHandle {
    /// In-process async function.
    Builtin(
        Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value, String>> + Send>> + Send + Sync>,
    ),
    /// External command; parameters are appended as a JSON argument.
    Command { program: String, args: Vec<String> },
}

impl std::fmt::Debug for ToolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Builtin(_) => write!(f, "Builtin(..)"),
            Self::Command { program, args } => write!(f, "Command({program} {args:?})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Tool {
    pub name: String,
    pub category: ToolCategory,
    pub priority: u32,
    pub handle: ToolHandle,
    pub dependencies: Vec<String>,
    /// JSON schema-ish description of accepted parameters.
    pub parameter_schema: Value,
}

/// Rolling execution statistics per tool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolStats {
    pub total_executions: u32,
    pub successful_executions: u32,
    pub success_rate: f64,
    pub total_duration_secs: f64,
    pub avg_duration_secs: f64,
    pub efficiency_score: f64,
    pub performance_score: f64,
}

/// One entry in the execution history ring.
#[derive(Debug, Clone, Serialize)]
pub struct ToolExecution {
    pub tool: String,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub success: bool,
    pub error: Option<String>,
}

struct ToolEntry {
    tool: Tool,
    status: ToolStatus,
    stats: ToolStats,
}

// ---------------------------------------------------------------------------
// Tool Control Agent
// ---------------------------------------------------------------------------

pub struct ToolControlAgent {
    core: AgentCore,
    tools: RwLock<HashMap<String, ToolEntry>>,
    history: Mutex<VecDeque<ToolExecution>>,
}

impl ToolControlAgent {
    pub const NAME: &'static str = "tool_control_agent";

    pub fn new(deps: AgentDeps) -> Self {
        let agent = Self {
            core: AgentCore::new(Self::NAME, "tooling", deps),
            tools: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAP)),
        };
        agent.register_builtin_tools();
        agent
    }

    /// Seed the registry with the fabric's builtin tools.
    fn register_builtin_tools(&self) {
        let builtin = |name: &str,
                       category: ToolCategory,
                       priority: u32,
                       schema: Value,
                       f: Arc<
            dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>
                + Send
                + Sync,
        >| Tool {
            name: name.to_string(),
            category,
            priority,
            handle: ToolHandle::Builtin(f),
            dependencies: vec![],
            parameter_schema: schema,
        };

        let tools = vec![
            builtin(
                "market_data_fetch",
                ToolCategory::DataCollection,
                1,
                json!({ "symbol": "string" }),
                Arc::new(|params| {
                    Box::pin(async move {
                        let symbol = params
                            .get("symbol")
                            .and_then(|v| v.as_str())
                            .unwrap_or("UNKNOWN")
                            .to_string();
                        Ok(json!({ "symbol": symbol, "fetched_at": Utc::now().to_rfc3339() }))
                    })
                }),
            ),
            builtin(
                "technical_analysis",
                ToolCategory::Analysis,
                2,
                json!({ "closes": "number[]" }),
                Arc::new(|params| {
                    Box::pin(async move {
                        let closes: Vec<f64> = params
                            .get("closes")
                            .and_then(|v| v.as_array())
                            .map(|a| a.iter().filter_map(|v| v.as_f64()).collect())
                            .unwrap_or_default();
                        Ok(json!({
                            "rsi_14": crate::indicators::rsi(&closes, 14),
                            "sma_20": crate::indicators::sma(&closes, 20),
                        }))
                    })
                }),
            ),
            builtin(
                "signal_scan",
                ToolCategory::Strategy,
                2,
                json!({ "max_price": "number", "min_volume": "number" }),
                Arc::new(|params| {
                    Box::pin(async move {
                        Ok(json!({ "requested": params, "scanned_at": Utc::now().to_rfc3339() }))
                    })
                }),
            ),
            builtin(
                "portfolio_check",
                ToolCategory::Monitoring,
                3,
                json!({}),
                Arc::new(|_| Box::pin(async { Ok(json!({ "status": "ok" })) })),
            ),
            builtin(
                "system_diagnostics",
                ToolCategory::Utility,
                3,
                json!({}),
                Arc::new(|_| {
                    Box::pin(async {
                        Ok(json!({ "checked_at": Utc::now().to_rfc3339(), "healthy": true }))
                    })
                }),
            ),
        ];

        for tool in tools {
            // Builtin registration cannot fail: no dependencies.
            let _ = self.register(tool);
        }
        info!(count = self.tools.read().len(), "builtin tools registered");
    }

    // -------------------------------------------------------------------------
    // Registry
    // -------------------------------------------------------------------------

    /// Register a tool. Dependencies must already be registered.
    pub fn register(&self, tool: Tool) -> CoreResult<()> {
        let mut tools = self.tools.write();
        for dep in &tool.dependencies {
            if !tools.contains_key(dep) {
                return Err(CoreError::ToolExecutionFailed {
                    tool: tool.name.clone(),
                    reason: format!("unknown dependency '{dep}'"),
                });
            }
        }
        debug!(tool = %tool.name, category = ?tool.category, "tool registered");
        tools.insert(
            tool.name.clone(),
            ToolEntry {
                tool,
                status: ToolStatus::Registered,
                stats: ToolStats {
                    success_rate: 1.0,
                    efficiency_score: 1.0,
                    performance_score: 1.0,
                    ..ToolStats::default()
                },
            },
        );
        Ok(())
    }

    /// Mark a registered tool available for execution.
    pub fn initialize(&self, name: &str) -> CoreResult<()> {
        let mut tools = self.tools.write();
        let entry = tools.get_mut(name).ok_or_else(|| CoreError::ToolExecutionFailed {
            tool: name.to_string(),
            reason: "not registered".to_string(),
        })?;
        entry.status = ToolStatus::Available;
        Ok(())
    }

    pub fn status(&self, name: &str) -> Option<ToolStatus> {
        self.tools.read().get(name).map(|e| e.status)
    }

    pub fn stats(&self, name: &str) -> Option<ToolStats> {
        self.tools.read().get(name).map(|e| e.stats.clone())
    }

    pub fn recent_executions(&self, limit: usize) -> Vec<ToolExecution> {
        let history = self.history.lock();
        history.iter().rev().take(limit).cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    /// Execute a tool with a timeout; records duration and outcome either
    /// way.
    pub async fn execute(
        &self,
        name: &str,
        params: Value,
        time_limit: Duration,
    ) -> CoreResult<Value> {
        let handle = {
            let tools = self.tools.read();
            let entry = tools.get(name).ok_or_else(|| CoreError::ToolExecutionFailed {
                tool: name.to_string(),
                reason: "not registered".to_string(),
            })?;
            if entry.status == ToolStatus::Maintenance {
                return Err(CoreError::ToolExecutionFailed {
                    tool: name.to_string(),
                    reason: "flagged for maintenance".to_string(),
                });
            }
            entry.tool.handle.clone()
        };

        let started = Instant::now();
        let started_at = Utc::now();

        let outcome: Result<Value, String> = match handle {
            ToolHandle::Builtin(f) => match timeout(time_limit, f(params)).await {
                Ok(result) => result,
                Err(_) => Err("timeout".to_string()),
            },
            ToolHandle::Command { program, args } => {
                let mut command = tokio::process::Command::new(&program);
                command.args(&args).arg(params.to_string());
                match timeout(time_limit, command.output()).await {
                    Ok(Ok(output)) if output.status.success() => {
                        Ok(json!(String::from_utf8_lossy(&output.stdout).trim()))
                    }
                    Ok(Ok(output)) => Err(format!(
                        "exit {}: {}",
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    )),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("timeout".to_string()),
                }
            }
        };

        let duration = started.elapsed().as_secs_f64();
        let success = outcome.is_ok();
        self.record_execution(name, started_at, duration, success, outcome.as_ref().err());

        outcome.map_err(|reason| CoreError::ToolExecutionFailed {
            tool: name.to_string(),
            reason,
        })
    }

    fn record_execution(
        &self,
        name: &str,
        started_at: DateTime<Utc>,
        duration_secs: f64,
        success: bool,
        error: Option<&String>,
    ) {
        let flagged = {
            let mut tools = self.tools.write();
            let Some(entry) = tools.get_mut(name) else {
                return;
            };
            let stats = &mut entry.stats;
            stats.total_executions += 1;
            if success {
                stats.successful_executions += 1;
            }
            stats.success_rate =
                stats.successful_executions as f64 / stats.total_executions as f64;
            stats.total_duration_secs += duration_secs;
            stats.avg_duration_secs = stats.total_duration_secs / stats.total_executions as f64;
            stats.efficiency_score = if stats.avg_duration_secs > 0.0 {
                (10.0 / stats.avg_duration_secs).min(1.0) * stats.success_rate
            } else {
                stats.success_rate
            };
            stats.performance_score = PERFORMANCE_WEIGHT * stats.efficiency_score
                + RELIABILITY_WEIGHT * stats.success_rate;

            let should_flag = stats.total_executions >= MAINTENANCE_MIN_SAMPLES
                && stats.success_rate < MAINTENANCE_SUCCESS_RATE
                && entry.status != ToolStatus::Maintenance;
            if should_flag {
                entry.status = ToolStatus::Maintenance;
            }
            should_flag
        };

        {
            let mut history = self.history.lock();
            history.push_back(ToolExecution {
                tool: name.to_string(),
                started_at,
                duration_secs,
                success,
                error: error.cloned(),
            });
            while history.len() > HISTORY_CAP {
                history.pop_front();
            }
        }

        if flagged {
            warn!(tool = name, "tool flagged for maintenance (low success rate)");
            let _ = self.core.store_memory_with(
                &format!("Tool {name} flagged for maintenance after repeated failures"),
                content_types::ERROR_PATTERN,
                0.6,
                json!({ "tool": name, "issue": "low_success_rate" }),
            );
        }
    }

    // -------------------------------------------------------------------------
    // Recommendation
    // -------------------------------------------------------------------------

    /// Tools eligible under the filters, best performance score first.
    pub fn recommend(&self, category: Option<ToolCategory>, min_priority: Option<u32>) -> Vec<String> {
        let tools = self.tools.read();
        let mut eligible: Vec<(String, f64)> = tools
            .values()
            .filter(|entry| entry.status != ToolStatus::Maintenance)
            .filter(|entry| category.map(|c| entry.tool.category == c).unwrap_or(true))
            .filter(|entry| min_priority.map(|p| entry.tool.priority <= p).unwrap_or(true))
            .map(|entry| (entry.tool.name.clone(), entry.stats.performance_score))
            .collect();

        eligible.sort_by(|(_, a), (_, b)| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        eligible.into_iter().map(|(name, _)| name).collect()
    }
}

#[async_trait]
impl Agent for ToolControlAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn process(&self, mut shutdown: watch::Receiver<bool>) {
        info!("tool control agent loop started");
        let mut ticker = interval(Duration::from_secs(TICK_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.core.heartbeat();
                    for message in self.core.drain_inbox() {
                        if let AgentMessage::EventNotification { class, source, .. } = message {
                            debug!(class = %class, source = %source, "peer notification received");
                        }
                    }
                    // Periodic self-check keeps the diagnostics tool's
                    // stats fresh for recommendations.
                    if let Err(e) = self
                        .execute("system_diagnostics", json!({}), Duration::from_secs(10))
                        .await
                    {
                        warn!(error = %e, "diagnostics tool run failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("tool control agent loop stopping");
                        break;
                    }
                }
            }
        }
    }
}
