// =============================================================================
// Output Fan-out — single ingress for every agent emission
// =============================================================================
//
// For each batch of events:
//   1. Stamp processed_at and append to the Agents.out event log buffer.
//   2. Classify by payload tag.
//   3. Per-class persistence: signal/trade/position rows into the ledger;
//      strategy/performance into their append-only jsonl buffers; errors
//      get elevated logging plus an error-pattern memory.
//   4. Score importance; events at or above 0.3 become memory records
//      (source `agents_out`, type `agent_log_<class>`).
//   5. Notify interested agents via the input router, excluding the source.
//
// Buffers flush when they reach FLUSH_SIZE or the periodic tick fires,
// whichever comes first. A flush drains under one lock and performs a
// single append per file.
// =============================================================================

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

use crate::errors::CoreResult;
use crate::ledger::{MetadataLedger, PositionRow, SignalRow, TradeRow};
use crate::memory::record::{content_types, MemoryMetadata};
use crate::memory::MemoryStore;

use super::events::{AgentEvent, AgentMessage, ErrorSeverity, EventClass, EventPayload};
use super::input_router::InputRouter;

/// Buffer flush threshold (entries) and periodic flush cadence.
const FLUSH_SIZE: usize = 10;
const FLUSH_INTERVAL_SECS: u64 = 30;

/// Events at or above this importance are memorised.
const MEMORIZE_THRESHOLD: f64 = 0.3;

/// Volume past which an event earns an importance bonus.
const HIGH_VOLUME: f64 = 1_000_000.0;

/// Fan-out statistics for the health surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FanoutStats {
    pub events_processed: u64,
    pub memories_created: u64,
    pub notifications_sent: u64,
    pub ledger_failures: u64,
    pub per_class: HashMap<String, u64>,
}

pub struct AgentsOut {
    memory: Arc<MemoryStore>,
    ledger: Arc<MetadataLedger>,
    router: Arc<InputRouter>,

    event_log: PathBuf,
    strategy_log: PathBuf,
    performance_log: PathBuf,

    event_buffer: Mutex<Vec<serde_json::Value>>,
    strategy_buffer: Mutex<Vec<serde_json::Value>>,
    performance_buffer: Mutex<Vec<serde_json::Value>>,

    stats: Mutex<FanoutStats>,
}

impl AgentsOut {
    pub fn new(
        data_dir: &std::path::Path,
        memory: Arc<MemoryStore>,
        ledger: Arc<MetadataLedger>,
        router: Arc<InputRouter>,
    ) -> Self {
        Self {
            memory,
            ledger,
            router,
            event_log: data_dir.join("Agents.out"),
            strategy_log: data_dir.join("Generated_Strategies.jsonl"),
            performance_log: data_dir.join("Performance_Metrics.jsonl"),
            event_buffer: Mutex::new(Vec::new()),
            strategy_buffer: Mutex::new(Vec::new()),
            performance_buffer: Mutex::new(Vec::new()),
            stats: Mutex::new(FanoutStats::default()),
        }
    }

    pub fn stats(&self) -> FanoutStats {
        self.stats.lock().clone()
    }

    // -------------------------------------------------------------------------
    // Ingestion
    // -------------------------------------------------------------------------

    /// Process a batch of events in emission order.
    pub fn process(&self, events: Vec<AgentEvent>) {
        for mut event in events {
            event.processed_at = Some(Utc::now());
            self.process_one(&event);
        }
        self.flush_if_full();
    }

    /// Convenience for single-event emitters.
    pub fn emit(&self, event: AgentEvent) {
        self.process(vec![event]);
    }

    fn process_one(&self, event: &AgentEvent) {
        let class = event.class();
        {
            let mut stats = self.stats.lock();
            stats.events_processed += 1;
            *stats.per_class.entry(class.to_string()).or_insert(0) += 1;
        }

        if let Ok(raw) = serde_json::to_value(event) {
            self.event_buffer.lock().push(raw);
        }

        self.persist(event);

        let importance = importance(event);
        if importance >= MEMORIZE_THRESHOLD {
            self.memorize(event, importance);
        }

        self.notify(event, class);
    }

    // -------------------------------------------------------------------------
    // Per-class persistence
    // -------------------------------------------------------------------------

    fn persist(&self, event: &AgentEvent) {
        let result = match &event.payload {
            EventPayload::Signal {
                signal_id,
                symbol,
                strategy,
                confidence,
                price,
                volume,
                timeframe,
                indicators,
            } => self.ledger.insert_signal(&SignalRow {
                id: signal_id.clone(),
                symbol: symbol.clone(),
                kind: strategy.clone(),
                confidence: *confidence,
                price: *price,
                volume: *volume,
                timeframe: timeframe.clone(),
                indicators: indicators.clone(),
                metadata: json!({ "source": event.source }),
                processed: false,
                created_at: event.emitted_at,
            }),
            EventPayload::Trade {
                trade_id,
                symbol,
                side,
                quantity,
                price,
                pnl,
                fees,
                strategy,
                signal_id,
                status,
            } => self.ledger.insert_trade(&TradeRow {
                id: trade_id.clone(),
                symbol: symbol.clone(),
                side: *side,
                quantity: *quantity,
                price: *price,
                pnl: *pnl,
                fees: *fees,
                strategy: strategy.clone(),
                signal_id: signal_id.clone(),
                status: *status,
                created_at: event.emitted_at,
            }),
            EventPayload::Position {
                position_id,
                symbol,
                quantity,
                avg_price,
                current_price,
                unrealized_pnl,
                realized_pnl,
                stop_price,
                target_price,
                status,
            } => self.ledger.upsert_position(&PositionRow {
                id: position_id.clone(),
                symbol: symbol.clone(),
                quantity: *quantity,
                avg_price: *avg_price,
                current_price: *current_price,
                unrealized_pnl: *unrealized_pnl,
                realized_pnl: *realized_pnl,
                stop_price: *stop_price,
                target_price: *target_price,
                status: *status,
                created_at: event.emitted_at,
                updated_at: Utc::now(),
            }),
            EventPayload::Strategy { .. } => {
                if let Ok(raw) = serde_json::to_value(event) {
                    self.strategy_buffer.lock().push(raw);
                }
                Ok(())
            }
            EventPayload::Performance { .. } => {
                if let Ok(raw) = serde_json::to_value(event) {
                    self.performance_buffer.lock().push(raw);
                }
                Ok(())
            }
            EventPayload::Error {
                message,
                severity,
                context,
            } => {
                error!(
                    source = %event.source,
                    severity = %severity,
                    context = %context,
                    "agent error event: {message}"
                );
                let metadata =
                    MemoryMetadata::new(content_types::ERROR_PATTERN, event.source.clone(), 0.6)
                        .with("severity", severity.to_string())
                        .with("context", context.clone());
                self.memory
                    .store_text(&format!("Error from {}: {message}", event.source), metadata)
                    .map(|_| ())
            }
            EventPayload::CoordinationDecision { .. }
            | EventPayload::Status { .. }
            | EventPayload::Other { .. } => Ok(()),
        };

        if let Err(e) = result {
            // A failed ledger write surfaces as a typed error and an
            // error-pattern memory; the emitter retries next cycle.
            self.stats.lock().ledger_failures += 1;
            warn!(event_id = %event.id, class = %event.class(), error = %e, "event persistence failed");
            let metadata =
                MemoryMetadata::new(content_types::ERROR_PATTERN, "agents_out", 0.6)
                    .with("event_id", event.id.clone())
                    .with("class", event.class().to_string());
            let _ = self
                .memory
                .store_text(&format!("Ledger write failed for event {}: {e}", event.id), metadata);
        }
    }

    // -------------------------------------------------------------------------
    // Memorisation
    // -------------------------------------------------------------------------

    fn memorize(&self, event: &AgentEvent, importance: f64) {
        let text = describe(event);
        let mut metadata = MemoryMetadata::new(
            format!("agent_log_{}", event.class()),
            "agents_out",
            importance,
        )
        .with("original_source", event.source.clone())
        .with("event_id", event.id.clone());
        if let Some(symbol) = event.payload.symbol() {
            metadata = metadata.with("symbol", symbol);
        }

        match self.memory.store_text(&text, metadata) {
            Ok(_) => self.stats.lock().memories_created += 1,
            Err(e) => warn!(event_id = %event.id, error = %e, "event memorisation failed"),
        }
    }

    // -------------------------------------------------------------------------
    // Notification
    // -------------------------------------------------------------------------

    fn notify(&self, event: &AgentEvent, class: EventClass) {
        let mut interested = interested_agents(class);

        // The coordinator always hears about confident or consequential
        // events.
        let confident = event.payload.confidence().map(|c| c > 0.7).unwrap_or(false);
        if confident || matches!(class, EventClass::Trade | EventClass::Error) {
            interested.push("coordinator");
        }

        interested.sort_unstable();
        interested.dedup();

        let summary = describe(event);
        for agent in interested {
            if agent == event.source {
                continue;
            }
            if !self.router.has_inbox(agent) {
                continue;
            }
            let message = AgentMessage::EventNotification {
                class,
                event_id: event.id.clone(),
                source: event.source.clone(),
                summary: summary.clone(),
            };
            match self.router.send(agent, message) {
                Ok(()) => self.stats.lock().notifications_sent += 1,
                Err(e) => debug!(agent, error = %e, "notification dropped"),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Flushing
    // -------------------------------------------------------------------------

    fn flush_if_full(&self) {
        if self.event_buffer.lock().len() >= FLUSH_SIZE
            || self.strategy_buffer.lock().len() >= FLUSH_SIZE
            || self.performance_buffer.lock().len() >= FLUSH_SIZE
        {
            self.flush();
        }
    }

    /// Drain all buffers to their log files. Atomic per buffer: the drain
    /// happens under the buffer lock, the append is a single write call.
    pub fn flush(&self) {
        Self::flush_buffer(&self.event_buffer, &self.event_log);
        Self::flush_buffer(&self.strategy_buffer, &self.strategy_log);
        Self::flush_buffer(&self.performance_buffer, &self.performance_log);
    }

    fn flush_buffer(buffer: &Mutex<Vec<serde_json::Value>>, path: &PathBuf) {
        let drained: Vec<serde_json::Value> = {
            let mut buf = buffer.lock();
            if buf.is_empty() {
                return;
            }
            buf.drain(..).collect()
        };

        let mut block = String::with_capacity(drained.len() * 128);
        for entry in &drained {
            block.push_str(&entry.to_string());
            block.push('\n');
        }

        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| file.write_all(block.as_bytes()));

        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "buffer flush failed; entries dropped");
        } else {
            debug!(path = %path.display(), entries = drained.len(), "buffer flushed");
        }
    }
}

impl std::fmt::Debug for AgentsOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentsOut")
            .field("event_buffer", &self.event_buffer.lock().len())
            .field("strategy_buffer", &self.strategy_buffer.lock().len())
            .field("performance_buffer", &self.performance_buffer.lock().len())
            .finish()
    }
}

/// Run the periodic flush loop. Spawned once at startup.
pub async fn run_flush_loop(fanout: Arc<AgentsOut>, mut shutdown: watch::Receiver<bool>) {
    info!(interval_secs = FLUSH_INTERVAL_SECS, "fan-out flush loop started");
    let mut ticker = interval(Duration::from_secs(FLUSH_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = ticker.tick() => fanout.flush(),
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    fanout.flush();
                    info!("fan-out flush loop stopping");
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Importance scoring
// ---------------------------------------------------------------------------

/// Importance of an event in [0, 1]: a base of 0.1, a class-dependent
/// constant, a confidence share, volume/price bonuses, and an error
/// severity bump.
pub fn importance(event: &AgentEvent) -> f64 {
    let mut score = 0.1;

    score += match event.class() {
        EventClass::Signal => 0.8,
        EventClass::Trade => 0.9,
        EventClass::Position => 0.7,
        EventClass::Strategy => 0.6,
        EventClass::Performance => 0.7,
        EventClass::Error => 0.5,
        EventClass::CoordinationDecision => 0.9,
        EventClass::Status | EventClass::Other => 0.2,
    };

    if let Some(confidence) = event.payload.confidence() {
        if confidence > 0.0 {
            score += confidence * 0.3;
        }
    }

    if event.payload.volume().map(|v| v > HIGH_VOLUME).unwrap_or(false) {
        score += 0.2;
    }

    if event.payload.price().map(|p| p > 0.0).unwrap_or(false) {
        score += 0.1;
    }

    if let EventPayload::Error { severity, .. } = &event.payload {
        score += match severity {
            ErrorSeverity::High => 0.4,
            ErrorSeverity::Critical => 0.6,
            _ => 0.0,
        };
    }

    score.min(1.0)
}

/// Static routing table: which agents care about each event class.
fn interested_agents(class: EventClass) -> Vec<&'static str> {
    match class {
        EventClass::Signal => vec!["strategy_agent", "rules_agent", "risk_agent", "timing_agent"],
        EventClass::Trade => vec!["portfolio_tracker", "tax_estimator", "performance_tracker"],
        EventClass::Position => vec!["risk_agent", "portfolio_tracker"],
        EventClass::Strategy => vec!["coordinator", "performance_tracker"],
        EventClass::Performance => vec!["coordinator", "strategy_agent"],
        EventClass::Error => vec!["runtime_agent", "coordinator"],
        EventClass::CoordinationDecision | EventClass::Status | EventClass::Other => vec![],
    }
}

/// Templated one-line description per class, used for memory content and
/// notification summaries.
fn describe(event: &AgentEvent) -> String {
    match &event.payload {
        EventPayload::Signal {
            symbol,
            strategy,
            confidence,
            price,
            ..
        } => format!(
            "Signal from {}: {strategy} on {symbol} at {price:.2} ({:.0}% confidence)",
            event.source,
            confidence * 100.0
        ),
        EventPayload::Trade {
            symbol,
            side,
            quantity,
            price,
            status,
            ..
        } => format!(
            "Trade from {}: {side} {quantity} {symbol} at {price:.2} [{status}]",
            event.source
        ),
        EventPayload::Position {
            symbol,
            quantity,
            unrealized_pnl,
            status,
            ..
        } => format!(
            "Position update from {}: {symbol} qty {quantity} unrealized {unrealized_pnl:.2} [{status}]",
            event.source
        ),
        EventPayload::Strategy { name, .. } => {
            format!("Strategy output from {}: {name}", event.source)
        }
        EventPayload::Performance { name, .. } => {
            format!("Performance report from {}: {name}", event.source)
        }
        EventPayload::Error { message, severity, .. } => {
            format!("Error from {} [{severity}]: {message}", event.source)
        }
        EventPayload::CoordinationDecision {
            symbol,
            action,
            confidence,
            ..
        } => format!(
            "Coordination decision: {action} {symbol} ({:.0}% confidence)",
            confidence * 100.0
        ),
        EventPayload::Status { agent, state, .. } => {
            format!("Status update: {agent} is {state}")
        }
        EventPayload::Other { tag, .. } => {
            format!("Unclassified event '{tag}' from {}", event.source)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_store;
    use crate::types::{TradeSide, TradeStatus};

    fn build_fanout(dir: &std::path::Path) -> (Arc<AgentsOut>, Arc<MemoryStore>, Arc<MetadataLedger>, Arc<InputRouter>) {
        let (memory, ledger) = test_store(dir);
        let router = Arc::new(InputRouter::new(memory.clone()));
        let fanout = Arc::new(AgentsOut::new(dir, memory.clone(), ledger.clone(), router.clone()));
        (fanout, memory, ledger, router)
    }

    fn signal_event(confidence: f64, volume: f64) -> AgentEvent {
        AgentEvent::new(
            "strategy_agent",
            EventPayload::Signal {
                signal_id: uuid::Uuid::new_v4().to_string(),
                symbol: "AAPL".to_string(),
                strategy: "momentum".to_string(),
                confidence,
                price: 150.0,
                volume,
                timeframe: "1d".to_string(),
                indicators: json!({"rsi": 72.0}),
            },
        )
    }

    #[test]
    fn importance_matches_the_formula() {
        // signal: 0.1 + 0.8 + 0.82*0.3 + 0.2 (volume) + 0.1 (price) = min(1, 1.446)
        let event = signal_event(0.82, 2_000_000.0);
        assert!((importance(&event) - 1.0).abs() < 1e-9);

        // low-volume, low-confidence signal: 0.1 + 0.8 + 0.06 + 0.1 = 1.06 -> 1.0 capped
        let event = signal_event(0.2, 100.0);
        assert!((importance(&event) - 1.0).abs() < 1e-9);

        // status event: 0.1 + 0.2 = 0.3
        let event = AgentEvent::new(
            "runtime_agent",
            EventPayload::Status {
                agent: "runtime_agent".to_string(),
                state: "active".to_string(),
                details: json!({}),
            },
        );
        assert!((importance(&event) - 0.3).abs() < 1e-9);

        // critical error: 0.1 + 0.5 + 0.6 = 1.2 -> capped at 1.0
        let event = AgentEvent::new(
            "scraper",
            EventPayload::Error {
                message: "feed dead".to_string(),
                severity: ErrorSeverity::Critical,
                context: json!({}),
            },
        );
        assert!((importance(&event) - 1.0).abs() < 1e-9);

        // medium error: 0.1 + 0.5 = 0.6
        let event = AgentEvent::new(
            "scraper",
            EventPayload::Error {
                message: "slow feed".to_string(),
                severity: ErrorSeverity::Medium,
                context: json!({}),
            },
        );
        assert!((importance(&event) - 0.6).abs() < 1e-9);
    }

    #[test]
    fn importance_is_always_in_bounds() {
        let events = vec![
            signal_event(1.0, 10_000_000.0),
            signal_event(0.0, 0.0),
            AgentEvent::new(
                "x",
                EventPayload::Other {
                    tag: "weird".to_string(),
                    details: json!(null),
                },
            ),
        ];
        for event in events {
            let score = importance(&event);
            assert!((0.0..=1.0).contains(&score), "importance {score} out of bounds");
        }
    }

    #[test]
    fn signal_event_lands_in_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let (fanout, _memory, ledger, _router) = build_fanout(dir.path());

        fanout.emit(signal_event(0.8, 500_000.0));

        let signals = ledger.recent_signals(10).unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].symbol, "AAPL");
    }

    #[test]
    fn trade_event_lands_in_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let (fanout, _memory, ledger, _router) = build_fanout(dir.path());

        fanout.emit(AgentEvent::new(
            "portfolio_tracker",
            EventPayload::Trade {
                trade_id: "t-1".to_string(),
                symbol: "SNDL".to_string(),
                side: TradeSide::Buy,
                quantity: 100.0,
                price: 2.0,
                pnl: 0.0,
                fees: 0.5,
                strategy: "momentum".to_string(),
                signal_id: None,
                status: TradeStatus::Executed,
            },
        ));

        assert_eq!(ledger.recent_trades(10).unwrap().len(), 1);
    }

    #[test]
    fn important_events_are_memorized() {
        let dir = tempfile::tempdir().unwrap();
        let (fanout, memory, _ledger, _router) = build_fanout(dir.path());

        fanout.emit(signal_event(0.9, 2_000_000.0));

        let logged: Vec<_> = memory
            .scan(50)
            .into_iter()
            .filter(|r| r.content_type() == "agent_log_signal")
            .collect();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].source(), "agents_out");
    }

    #[tokio::test]
    async fn interested_agents_are_notified_but_not_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let (fanout, _memory, _ledger, router) = build_fanout(dir.path());

        let mut timing_rx = router.register_inbox("timing_agent");
        let mut strategy_rx = router.register_inbox("strategy_agent");

        // Emitted by strategy_agent: timing gets it, strategy must not.
        fanout.emit(signal_event(0.9, 100.0));

        match timing_rx.recv().await.unwrap() {
            AgentMessage::EventNotification { class, source, .. } => {
                assert_eq!(class, EventClass::Signal);
                assert_eq!(source, "strategy_agent");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(strategy_rx.try_recv().is_err(), "source must not self-notify");
    }

    #[tokio::test]
    async fn coordinator_hears_high_confidence_signals() {
        let dir = tempfile::tempdir().unwrap();
        let (fanout, _memory, _ledger, router) = build_fanout(dir.path());
        let mut coord_rx = router.register_inbox("coordinator");

        fanout.emit(signal_event(0.85, 100.0));
        assert!(coord_rx.recv().await.is_some());
    }

    #[test]
    fn buffers_flush_to_jsonl_files() {
        let dir = tempfile::tempdir().unwrap();
        let (fanout, _memory, _ledger, _router) = build_fanout(dir.path());

        fanout.emit(AgentEvent::new(
            "strategy_agent",
            EventPayload::Strategy {
                name: "momentum-v2".to_string(),
                details: json!({"rsi_threshold": 70}),
            },
        ));
        fanout.flush();

        let content = std::fs::read_to_string(dir.path().join("Generated_Strategies.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("momentum-v2"));

        let out = std::fs::read_to_string(dir.path().join("Agents.out")).unwrap();
        assert!(!out.is_empty());
    }

    #[test]
    fn error_events_create_error_pattern_memories() {
        let dir = tempfile::tempdir().unwrap();
        let (fanout, memory, _ledger, _router) = build_fanout(dir.path());

        fanout.emit(AgentEvent::new(
            "scraper",
            EventPayload::Error {
                message: "simulated outage".to_string(),
                severity: ErrorSeverity::High,
                context: json!({"symbol": "AAPL"}),
            },
        ));

        let patterns: Vec<_> = memory
            .scan(50)
            .into_iter()
            .filter(|r| r.content_type() == content_types::ERROR_PATTERN)
            .collect();
        assert_eq!(patterns.len(), 1);
    }
}
