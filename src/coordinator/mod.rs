// =============================================================================
// Coordinator — phased decision pipeline with weighted consensus
// =============================================================================
//
// Drives each watchlist symbol through Market -> Signal -> Timing ->
// Rules -> Synthesis. Each phase runs as its own task under a timeout;
// a phase that times out, errors, or panics contributes nothing and the
// synthesis proceeds with the remaining sources. A single symbol's
// failure never blocks the cycle.
//
// Synthesis is a weighted average of per-source confidences gated by the
// operating mode's consensus threshold, followed by the timing override,
// the entry-rule gate, position sizing, risk scoring, and the mode's
// post-adjustment.
// =============================================================================

pub mod decision;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::agents::base::{AgentCore, AgentDeps, PerformanceCounters};
use crate::agents::portfolio::PortfolioTracker;
use crate::agents::rules::{MarketView, RuleEvaluation, RuleKind, RuleSetAgent};
use crate::agents::scraper::StockScraper;
use crate::agents::strategy::{MarketConditions, StrategyAgent, StrategySignal};
use crate::agents::timing::{TimingAgent, TimingAnalysis};
use crate::bus::{AgentEvent, EventPayload, RetrievalContext};
use crate::config::RuntimeConfig;
use crate::errors::CoreError;
use crate::indicators;
use crate::memory::record::content_types;
use crate::types::{CoordinationMode, SignalStrength, StrategyKind, TradeAction, TradingPhase};

pub use decision::TradingDecision;

/// Decisions older than this are garbage-collected from the executed map.
const EXECUTED_DECISION_TTL_HOURS: i64 = 24;

/// Confidence cap on emitted decisions.
const DECISION_CONFIDENCE_CAP: f64 = 0.95;

/// Per-mode consensus threshold and position risk cap.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ModeParams {
    pub consensus_threshold: f64,
    pub max_position_risk: f64,
}

impl ModeParams {
    pub fn for_mode(mode: CoordinationMode) -> Self {
        match mode {
            CoordinationMode::Conservative => Self {
                consensus_threshold: 0.80,
                max_position_risk: 0.03,
            },
            CoordinationMode::Balanced => Self {
                consensus_threshold: 0.70,
                max_position_risk: 0.05,
            },
            CoordinationMode::Aggressive => Self {
                consensus_threshold: 0.60,
                max_position_risk: 0.07,
            },
            CoordinationMode::Autonomous => Self {
                consensus_threshold: 0.50,
                max_position_risk: 0.10,
            },
        }
    }
}

/// Everything one symbol's phases produced, handed to synthesis.
#[derive(Debug, Clone, Default)]
pub struct SynthesisInputs {
    pub signal: Option<StrategySignal>,
    pub timing: Option<TimingAnalysis>,
    pub rule_evaluations: Vec<RuleEvaluation>,
    pub conditions: Option<MarketConditions>,
}

/// Result of one coordination cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub decisions: Vec<TradingDecision>,
    pub executed: Vec<TradingDecision>,
}

/// Snapshot for the health surface.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorOverview {
    pub mode: CoordinationMode,
    pub phase: TradingPhase,
    pub pending_decisions: usize,
    pub executed_decisions: usize,
    pub counters: PerformanceCounters,
    pub agent_weights: HashMap<String, f64>,
}

pub struct Coordinator {
    core: AgentCore,
    strategy: Arc<StrategyAgent>,
    timing: Arc<TimingAgent>,
    rules: Arc<RuleSetAgent>,
    portfolio: Arc<PortfolioTracker>,
    scraper: Arc<StockScraper>,

    mode: RwLock<CoordinationMode>,
    phase: RwLock<TradingPhase>,
    weights: HashMap<String, f64>,
    watchlist: Vec<String>,
    phase_timeout: Duration,
    /// Global per-trade risk cap, applied after the mode cap.
    max_risk_per_trade: f64,

    pending: Mutex<HashMap<String, TradingDecision>>,
    executed: Mutex<HashMap<String, TradingDecision>>,
}

impl Coordinator {
    pub const NAME: &'static str = "coordinator";

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        deps: AgentDeps,
        config: &RuntimeConfig,
        strategy: Arc<StrategyAgent>,
        timing: Arc<TimingAgent>,
        rules: Arc<RuleSetAgent>,
        portfolio: Arc<PortfolioTracker>,
        scraper: Arc<StockScraper>,
    ) -> Self {
        Self {
            core: AgentCore::new(Self::NAME, "coordinator", deps),
            strategy,
            timing,
            rules,
            portfolio,
            scraper,
            mode: RwLock::new(config.coordination_mode),
            phase: RwLock::new(TradingPhase::MarketAnalysis),
            weights: config.agent_weights.clone(),
            watchlist: config.watchlist.clone(),
            phase_timeout: Duration::from_secs(config.phase_timeout_secs),
            max_risk_per_trade: config.max_risk_per_trade,
            pending: Mutex::new(HashMap::new()),
            executed: Mutex::new(HashMap::new()),
        }
    }

    pub fn core(&self) -> &AgentCore {
        &self.core
    }

    pub fn mode(&self) -> CoordinationMode {
        *self.mode.read()
    }

    pub fn phase(&self) -> TradingPhase {
        *self.phase.read()
    }

    /// Switch the operating mode; thresholds and caps follow immediately.
    pub fn set_mode(&self, mode: CoordinationMode) {
        *self.mode.write() = mode;
        let params = ModeParams::for_mode(mode);
        info!(
            mode = %mode,
            consensus_threshold = params.consensus_threshold,
            max_position_risk = params.max_position_risk,
            "coordination mode updated"
        );
        let _ = self.core.store_memory_with(
            &format!("Coordination mode changed to {mode}"),
            content_types::STATUS_UPDATE,
            0.6,
            json!({
                "mode": mode.to_string(),
                "consensus_threshold": params.consensus_threshold,
                "max_position_risk": params.max_position_risk,
            }),
        );
    }

    pub fn overview(&self) -> CoordinatorOverview {
        CoordinatorOverview {
            mode: self.mode(),
            phase: self.phase(),
            pending_decisions: self.pending.lock().len(),
            executed_decisions: self.executed.lock().len(),
            counters: self.core.counters(),
            agent_weights: self.weights.clone(),
        }
    }

    fn weight_for(&self, source: &str) -> f64 {
        let key = if source == "market" { "market_data" } else { source };
        self.weights.get(key).copied().unwrap_or(0.0)
    }

    // -------------------------------------------------------------------------
    // Phased pipeline
    // -------------------------------------------------------------------------

    /// Run one phase as its own task under the phase timeout. Timeouts,
    /// and panics inside the phase, produce `None`: an empty
    /// contribution.
    async fn run_phase<T, F>(&self, phase: TradingPhase, symbol: &str, fut: F) -> Option<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        *self.phase.write() = phase;
        match timeout(self.phase_timeout, tokio::spawn(fut)).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(join_err)) => {
                warn!(symbol, phase = %phase, error = %join_err, "phase crashed; continuing without contribution");
                let _ = self.core.store_memory_with(
                    &format!("Phase {phase} crashed for {symbol}: {join_err}"),
                    content_types::ERROR_PATTERN,
                    0.6,
                    json!({ "symbol": symbol, "phase": phase.to_string() }),
                );
                None
            }
            Err(_) => {
                let err = CoreError::PhaseTimeout {
                    phase: phase.to_string(),
                    seconds: self.phase_timeout.as_secs(),
                };
                warn!(symbol, error = %err, "continuing without contribution");
                None
            }
        }
    }

    /// Coordinate one symbol through the full pipeline. Returns `None`
    /// when consensus is not met or nothing contributed.
    pub async fn coordinate_decision(&self, symbol: &str) -> Option<TradingDecision> {
        debug!(symbol, "coordinating trading decision");

        // Pull prior coordination context for this symbol through the
        // input router so the retrieval cache stays warm per symbol.
        let prior = self.core.router().retrieve(
            Self::NAME,
            content_types::COORDINATION_DECISION,
            &RetrievalContext::for_symbol(symbol),
        );
        if !prior.is_empty() {
            debug!(symbol, prior = prior.len(), "prior coordination context retrieved");
        }

        // Phase 1: market analysis.
        let conditions = {
            let strategy = self.strategy.clone();
            self.run_phase(TradingPhase::MarketAnalysis, symbol, async move {
                strategy.analyze_market_conditions().await
            })
            .await
        };

        // Phase 2: signal generation.
        let signal = {
            let strategy = self.strategy.clone();
            let sym = symbol.to_string();
            let cond = conditions.clone().unwrap_or_default();
            self.run_phase(TradingPhase::SignalGeneration, symbol, async move {
                strategy.generate_signals(&[sym.clone()], &cond).await
            })
            .await
            .and_then(|signals| signals.into_iter().find(|s| s.symbol == symbol))
        };

        // Phase 3: timing optimization.
        let timing = {
            let timing_agent = self.timing.clone();
            let sym = symbol.to_string();
            let kind = signal
                .as_ref()
                .map(|s| s.strategy)
                .unwrap_or(StrategyKind::Momentum);
            self.run_phase(TradingPhase::TimingOptimization, symbol, async move {
                timing_agent.analyze(&sym, kind).await
            })
            .await
        };

        // Phase 4: rule validation over a market view enriched with the
        // strategy signal.
        let rule_evaluations = {
            let view = self.build_market_view(symbol, signal.as_ref(), conditions.as_ref());
            let rules = self.rules.clone();
            let sym = symbol.to_string();
            self.run_phase(TradingPhase::RuleValidation, symbol, async move {
                rules.evaluate(&sym, &view, None)
            })
            .await
            .unwrap_or_default()
        };

        // Phase 5: synthesis.
        *self.phase.write() = TradingPhase::ExecutionPlanning;
        let decision = self.synthesize(
            symbol,
            SynthesisInputs {
                signal,
                timing,
                rule_evaluations,
                conditions,
            },
        );

        if let Some(decision) = &decision {
            self.pending.lock().insert(symbol.to_string(), decision.clone());
            info!(
                symbol,
                action = %decision.action,
                confidence = decision.confidence,
                risk = decision.risk_score,
                "trading decision synthesized"
            );
        }

        *self.phase.write() = TradingPhase::Monitoring;
        decision
    }

    /// Rule-evaluation inputs: snapshot-derived indicator metrics plus the
    /// strategy signal and portfolio state.
    fn build_market_view(
        &self,
        symbol: &str,
        signal: Option<&StrategySignal>,
        conditions: Option<&MarketConditions>,
    ) -> MarketView {
        let mut view = MarketView::new();

        let bars = self.scraper.history(symbol, 60);
        if !bars.is_empty() {
            let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
            let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();
            let price = *closes.last().unwrap_or(&0.0);

            view.put("price", price);
            if let Some(rsi) = indicators::rsi(&closes, 14) {
                view.put("rsi", rsi);
            }
            if let Some(ema_20) = indicators::ema(&closes, 20) {
                if ema_20 > 0.0 {
                    view.put("price_vs_ema_20", price / ema_20 - 1.0);
                }
            }
            if bars.len() >= 21 {
                let window = &bars[bars.len() - 21..bars.len() - 1];
                let resistance = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
                let support = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
                if resistance > 0.0 {
                    view.put("price_vs_resistance", price / resistance - 1.0);
                }
                view.put("support_level", support);
                view.put("resistance_level", resistance);
            }
            if volumes.len() >= 20 {
                let avg: f64 = volumes[volumes.len() - 20..].iter().sum::<f64>() / 20.0;
                if avg > 0.0 {
                    view.put("volume_ratio", volumes.last().unwrap_or(&0.0) / avg);
                }
            }
            if let (Some(sma_20), Some(sma_50)) =
                (indicators::sma(&closes, 20), indicators::sma(&closes, 50))
            {
                view.put("sma_trend", sma_20 - sma_50);
            }
        }

        if let Some(conditions) = conditions {
            view.put("volatility", conditions.volatility);
            view.put("vix", conditions.vix);
        }

        if let Some(signal) = signal {
            view.put("price", signal.entry_price);
            view.put("position_size", signal.position_size);
            if let Some(rsi) = signal.indicators.get("rsi").and_then(|v| v.as_f64()) {
                view.put("rsi", rsi);
            }
            if let Some(vr) = signal.indicators.get("volume_ratio").and_then(|v| v.as_f64()) {
                view.put("volume_ratio", vr);
            }
        }

        view.put("open_positions", self.portfolio.open_positions().len() as f64);
        view
    }

    // -------------------------------------------------------------------------
    // Synthesis
    // -------------------------------------------------------------------------

    /// The weighted decision rule. Pure with respect to the agents: only
    /// the provided inputs and the coordinator's own configuration matter.
    pub fn synthesize(&self, symbol: &str, inputs: SynthesisInputs) -> Option<TradingDecision> {
        let mode = self.mode();
        let params = ModeParams::for_mode(mode);

        // Collect per-source confidences in a fixed order.
        let mut sources: Vec<(&str, f64)> = Vec::new();
        let mut reasoning: Vec<String> = Vec::new();

        if let Some(signal) = &inputs.signal {
            sources.push(("strategy", signal.confidence));
            reasoning.push(format!(
                "Strategy: {} {} ({:.0}%)",
                signal.strength,
                signal.strategy,
                signal.confidence * 100.0
            ));
        }
        if let Some(timing) = &inputs.timing {
            sources.push(("timing", timing.confidence));
            reasoning.push(format!(
                "Timing: {} ({:.0}%)",
                timing.call,
                timing.confidence * 100.0
            ));
        }
        let triggered: Vec<&RuleEvaluation> =
            inputs.rule_evaluations.iter().filter(|e| e.triggered).collect();
        if !triggered.is_empty() {
            let rule_confidence =
                triggered.iter().map(|e| e.confidence).sum::<f64>() / triggered.len() as f64;
            sources.push(("rules", rule_confidence));
            reasoning.push(format!(
                "Rules: {} triggered ({:.0}%)",
                triggered.len(),
                rule_confidence * 100.0
            ));
        }
        if let Some(conditions) = &inputs.conditions {
            let market = market_confidence(conditions);
            sources.push(("market", market));
            reasoning.push(format!(
                "Market: {} ({:.0}%)",
                conditions.trend,
                market * 100.0
            ));
        }

        if sources.is_empty() {
            debug!(symbol, "no sources contributed; no decision");
            return None;
        }

        let total_weight: f64 = sources.iter().map(|(s, _)| self.weight_for(s)).sum();
        if total_weight <= 0.0 {
            return None;
        }
        let mut overall = sources
            .iter()
            .map(|(s, c)| c * self.weight_for(s))
            .sum::<f64>()
            / total_weight;

        // Consensus gate.
        if overall < params.consensus_threshold {
            info!(
                symbol,
                overall,
                threshold = params.consensus_threshold,
                "insufficient consensus; no decision"
            );
            let _ = self.core.store_memory_with(
                &format!(
                    "Insufficient consensus for {symbol}: {:.1}% < {:.1}%",
                    overall * 100.0,
                    params.consensus_threshold * 100.0
                ),
                content_types::COORDINATION_DECISION,
                0.4,
                json!({
                    "symbol": symbol,
                    "consensus_met": false,
                    "overall_confidence": overall,
                    "threshold": params.consensus_threshold,
                }),
            );
            return None;
        }

        // Initial action from the strategy signal's strength.
        let mut action = TradeAction::Hold;
        let (entry_price, stop_loss, take_profit) = match &inputs.signal {
            Some(signal) => {
                if signal.strength >= SignalStrength::Strong {
                    action = TradeAction::Buy;
                } else if signal.strength == SignalStrength::Moderate && overall > 0.8 {
                    action = TradeAction::Buy;
                }
                (signal.entry_price, signal.stop_loss, signal.take_profit)
            }
            None => (0.0, 0.0, 0.0),
        };

        // Timing override.
        if let Some(timing) = &inputs.timing {
            if action == TradeAction::Buy {
                if timing.call.is_bearish() {
                    action = TradeAction::Hold;
                    reasoning.push("timing conflict".to_string());
                } else if timing.call.is_bullish() {
                    overall = (overall * 1.10).min(DECISION_CONFIDENCE_CAP);
                }
            }
        }

        // Rule gate: a buy needs at least one triggered entry rule.
        let entry_triggered = triggered.iter().any(|e| e.kind == RuleKind::Entry);
        if action == TradeAction::Buy && !entry_triggered {
            action = TradeAction::Hold;
            reasoning.push("entry blocked by rules".to_string());
        }

        // Position sizing.
        let mut position_size = 0.02 + overall * 0.03;
        if entry_price > 0.0 && stop_loss > 0.0 {
            let stop_distance = (entry_price - stop_loss).abs() / entry_price;
            if stop_distance > 0.0 {
                position_size *= (0.02 / stop_distance).min(1.0);
            }
        }
        position_size = position_size
            .min(params.max_position_risk)
            .min(self.max_risk_per_trade);

        // Risk score.
        let volatility = inputs.conditions.as_ref().map(|c| c.volatility).unwrap_or(0.2);
        let vix = inputs.conditions.as_ref().map(|c| c.vix).unwrap_or(20.0);
        let mut risk_score = (volatility * 2.0).min(0.4)
            + (1.0 - overall) * 0.3
            + position_size * 5.0
            + if vix > 25.0 { 0.2 } else { 0.0 };
        risk_score = risk_score.min(1.0);

        // Mode post-adjustment, applied last.
        match mode {
            CoordinationMode::Conservative => {
                if overall < 0.8 {
                    action = TradeAction::Hold;
                }
                position_size *= 0.7;
                overall *= 0.9;
            }
            CoordinationMode::Aggressive => {
                if action == TradeAction::Hold && overall > 0.6 {
                    action = TradeAction::Buy;
                }
                position_size *= 1.3;
                overall *= 1.05;
            }
            CoordinationMode::Autonomous => {
                if risk_score > 0.7 {
                    position_size *= 0.8;
                }
            }
            CoordinationMode::Balanced => {}
        }
        let confidence = overall.min(DECISION_CONFIDENCE_CAP);
        let position_size = position_size
            .min(params.max_position_risk)
            .min(self.max_risk_per_trade);

        let contributing_agents: Vec<String> =
            sources.iter().map(|(s, _)| s.to_string()).collect();
        let triggered_rule_ids: Vec<String> =
            triggered.iter().map(|e| e.rule_id.clone()).collect();

        let decision = TradingDecision::new(
            symbol,
            action,
            confidence,
            position_size,
            entry_price,
            stop_loss,
            take_profit,
            contributing_agents.clone(),
            triggered_rule_ids,
            inputs.signal.as_ref().map(|s| s.strategy),
            risk_score,
            reasoning.join(" | "),
        );

        // Full attribution in memory, plus the decision event on the bus.
        let confidences: serde_json::Map<String, serde_json::Value> = sources
            .iter()
            .map(|(s, c)| (s.to_string(), json!({ "confidence": c, "weight": self.weight_for(s) })))
            .collect();
        let _ = self.core.store_memory_with(
            &format!(
                "Coordination decision: {action} {symbol} with {:.0}% confidence (risk {:.2})",
                confidence * 100.0,
                risk_score
            ),
            content_types::COORDINATION_DECISION,
            confidence,
            json!({
                "symbol": symbol,
                "action": action.to_string(),
                "confidence": confidence,
                "position_size": decision.position_size,
                "risk_score": risk_score,
                "contributing_agents": contributing_agents,
                "agent_inputs": confidences,
                "mode": mode.to_string(),
                "phase": self.phase().to_string(),
            }),
        );
        self.core.fanout().emit(AgentEvent::new(
            Self::NAME,
            EventPayload::CoordinationDecision {
                decision_id: decision.id.clone(),
                symbol: symbol.to_string(),
                action,
                confidence,
                position_size: decision.position_size,
                risk_score,
                contributing_agents,
            },
        ));

        Some(decision)
    }

    // -------------------------------------------------------------------------
    // Cycle execution
    // -------------------------------------------------------------------------

    /// One pass over the active watchlist: coordinate every symbol, rank
    /// the actionable decisions, and record the top slice as executed.
    pub async fn execute_cycle(&self) -> CycleReport {
        info!(symbols = self.watchlist.len(), mode = %self.mode(), "coordination cycle starting");
        self.core.heartbeat();
        let notifications = self.core.drain_inbox().len();
        if notifications > 0 {
            debug!(notifications, "peer notifications drained before cycle");
        }
        self.gc_executed();

        let mut decisions = Vec::new();
        for symbol in &self.watchlist {
            if let Some(decision) = self.coordinate_decision(symbol).await {
                decisions.push(decision);
            }
        }

        let mut actionable: Vec<TradingDecision> = decisions
            .iter()
            .filter(|d| d.action != TradeAction::Hold)
            .cloned()
            .collect();
        actionable.sort_by(|a, b| {
            b.execution_score()
                .partial_cmp(&a.execution_score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let max_positions = if self.mode() == CoordinationMode::Conservative {
            3
        } else {
            5
        };
        let executed: Vec<TradingDecision> =
            actionable.into_iter().take(max_positions).collect();

        {
            let mut map = self.executed.lock();
            for decision in &executed {
                map.insert(decision.symbol.clone(), decision.clone());
            }
        }

        info!(
            decisions = decisions.len(),
            executed = executed.len(),
            "coordination cycle complete"
        );
        CycleReport {
            decisions,
            executed,
        }
    }

    /// Drop executed decisions older than 24 hours.
    pub fn gc_executed(&self) -> usize {
        let cutoff = Utc::now() - ChronoDuration::hours(EXECUTED_DECISION_TTL_HOURS);
        let mut map = self.executed.lock();
        let before = map.len();
        map.retain(|_, decision| decision.created_at >= cutoff);
        before - map.len()
    }

    #[cfg(test)]
    pub(crate) fn insert_executed(&self, decision: TradingDecision) {
        self.executed.lock().insert(decision.symbol.clone(), decision);
    }

    pub fn executed_decision(&self, symbol: &str) -> Option<TradingDecision> {
        self.executed.lock().get(symbol).cloned()
    }

    // -------------------------------------------------------------------------
    // Outcome attribution
    // -------------------------------------------------------------------------

    /// Record the outcome of an executed decision and distribute credit to
    /// every contributing agent. A symbol with no executed decision is a
    /// no-op.
    pub fn record_outcome(&self, symbol: &str, success: bool, pnl: f64) {
        let Some(decision) = self.executed.lock().get(symbol).cloned() else {
            debug!(symbol, "outcome for unknown decision ignored");
            return;
        };

        self.core.learn_from_outcome(
            &format!("Coordination decision: {} {symbol}", decision.action),
            &format!(
                "{} with P&L {pnl:.2}",
                if success { "profit" } else { "loss" }
            ),
            success,
            pnl,
        );

        for agent in &decision.contributing_agents {
            match agent.as_str() {
                "strategy" => {
                    if let Some(kind) = decision.strategy {
                        self.strategy.record_outcome(symbol, kind, success, pnl);
                    }
                }
                "timing" => {
                    let kind = decision.strategy.unwrap_or(StrategyKind::Momentum);
                    self.timing.record_outcome(
                        symbol,
                        kind,
                        decision.created_at,
                        Utc::now(),
                        success,
                        pnl,
                    );
                }
                "rules" => {
                    for rule_id in &decision.triggered_rule_ids {
                        self.rules.record_outcome(rule_id, symbol, success, pnl);
                    }
                }
                _ => {}
            }
        }

        let _ = self.core.store_memory_with(
            &format!(
                "Coordination outcome: {symbol} {} with P&L {pnl:.2}",
                if success { "SUCCESS" } else { "FAILURE" }
            ),
            content_types::COORDINATION_OUTCOME,
            if success { 0.7 } else { 0.8 },
            json!({
                "symbol": symbol,
                "success": success,
                "pnl": pnl,
                "original_confidence": decision.confidence,
                "original_risk_score": decision.risk_score,
                "contributing_agents": decision.contributing_agents,
            }),
        );

        self.executed.lock().remove(symbol);
        info!(symbol, success, pnl, "coordination outcome recorded");
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("mode", &self.mode())
            .field("phase", &self.phase())
            .field("watchlist", &self.watchlist.len())
            .finish()
    }
}

/// Market confidence from current conditions (clamped to [0.1, 0.9]):
/// moderate volatility and a friendly trend raise it, stress lowers it.
pub fn market_confidence(conditions: &MarketConditions) -> f64 {
    use crate::types::MarketTrend;

    let mut confidence: f64 = 0.5;

    if (0.15..=0.25).contains(&conditions.volatility) {
        confidence += 0.2;
    } else if conditions.volatility > 0.35 {
        confidence -= 0.3;
    }

    match conditions.trend {
        MarketTrend::Bullish => confidence += 0.2,
        MarketTrend::Bearish => confidence -= 0.1,
        MarketTrend::Neutral => {}
    }

    if conditions.vix < 20.0 {
        confidence += 0.1;
    } else if conditions.vix > 30.0 {
        confidence -= 0.2;
    }

    confidence.clamp(0.1, 0.9)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::rules::RuleEvaluation;
    use crate::agents::testutil::test_deps;
    use crate::agents::timing::TimingAnalysis;
    use crate::ledger::MetadataLedger;
    use crate::types::{
        MarketRegime, MarketSession, MarketTrend, RiskLevel, TimingCall, VolatilityWindow,
    };

    fn build_coordinator(dir: &std::path::Path, mode: CoordinationMode) -> Coordinator {
        let deps = test_deps(dir);
        let ledger = Arc::new(MetadataLedger::open_in_memory().unwrap());
        let watchlist = vec!["AAPL".to_string(), "TSLA".to_string()];
        let scraper = Arc::new(StockScraper::new(deps.clone(), ledger.clone(), watchlist.clone()));
        let strategy = Arc::new(StrategyAgent::new(
            deps.clone(),
            scraper.clone(),
            ledger.clone(),
            watchlist.clone(),
        ));
        let timing = Arc::new(TimingAgent::new(deps.clone()));
        let rules = Arc::new(RuleSetAgent::new(deps.clone()));
        let portfolio = Arc::new(PortfolioTracker::new(deps.clone()));

        let mut config = RuntimeConfig::default();
        config.coordination_mode = mode;
        config.watchlist = watchlist;

        Coordinator::new(deps, &config, strategy, timing, rules, portfolio, scraper)
    }

    fn strong_signal(confidence: f64) -> StrategySignal {
        StrategySignal {
            id: "sig-1".to_string(),
            symbol: "AAPL".to_string(),
            strategy: StrategyKind::Momentum,
            strength: SignalStrength::from_confidence(confidence),
            confidence,
            entry_price: 150.0,
            stop_loss: 147.0,
            take_profit: 156.0,
            risk_level: RiskLevel::Medium,
            position_size: 0.04,
            reasoning: "test signal".to_string(),
            indicators: json!({ "rsi": 72.0, "volume_ratio": 2.4 }),
            timestamp: Utc::now(),
            expected_duration_secs: 14_400,
        }
    }

    fn timing_with(call: TimingCall, confidence: f64) -> TimingAnalysis {
        TimingAnalysis {
            symbol: "AAPL".to_string(),
            session: MarketSession::Regular,
            call,
            optimal_entry: Utc::now(),
            optimal_exit: Utc::now(),
            volatility_window: VolatilityWindow::Medium,
            confidence,
            reasoning: "test timing".to_string(),
            expected_hold_secs: 3_600,
            risk_level: RiskLevel::Medium,
        }
    }

    fn entry_eval(confidence: f64, triggered: bool) -> RuleEvaluation {
        RuleEvaluation {
            rule_id: "momentum_entry_1".to_string(),
            kind: RuleKind::Entry,
            symbol: "AAPL".to_string(),
            triggered,
            value: 0.03,
            threshold: 0.0,
            condition_met: triggered,
            confidence,
            reasoning: "test rule".to_string(),
            timestamp: Utc::now(),
        }
    }

    fn bullish_conditions() -> MarketConditions {
        MarketConditions {
            price_change: 0.01,
            volatility: 0.20,
            trend: MarketTrend::Bullish,
            volume: 1_000_000.0,
            vix: 18.0,
            regime: MarketRegime::Normal,
        }
    }

    fn high_consensus_inputs() -> SynthesisInputs {
        SynthesisInputs {
            signal: Some(strong_signal(0.82)),
            timing: Some(timing_with(TimingCall::Buy, 0.70)),
            rule_evaluations: vec![entry_eval(0.75, true)],
            conditions: Some(bullish_conditions()),
        }
    }

    #[test]
    fn mode_params_match_the_table() {
        let conservative = ModeParams::for_mode(CoordinationMode::Conservative);
        assert!((conservative.consensus_threshold - 0.80).abs() < 1e-12);
        assert!((conservative.max_position_risk - 0.03).abs() < 1e-12);

        let balanced = ModeParams::for_mode(CoordinationMode::Balanced);
        assert!((balanced.consensus_threshold - 0.70).abs() < 1e-12);
        assert!((balanced.max_position_risk - 0.05).abs() < 1e-12);

        let aggressive = ModeParams::for_mode(CoordinationMode::Aggressive);
        assert!((aggressive.consensus_threshold - 0.60).abs() < 1e-12);
        assert!((aggressive.max_position_risk - 0.07).abs() < 1e-12);

        let autonomous = ModeParams::for_mode(CoordinationMode::Autonomous);
        assert!((autonomous.consensus_threshold - 0.50).abs() < 1e-12);
        assert!((autonomous.max_position_risk - 0.10).abs() < 1e-12);
    }

    #[test]
    fn market_confidence_follows_the_formula() {
        // Bullish, calm: 0.5 + 0.2 + 0.2 + 0.1 = 1.0 -> clamped 0.9.
        assert!((market_confidence(&bullish_conditions()) - 0.9).abs() < 1e-12);

        // Stressed: high volatility, bearish, high VIX.
        let stressed = MarketConditions {
            volatility: 0.40,
            trend: MarketTrend::Bearish,
            vix: 35.0,
            ..bullish_conditions()
        };
        // 0.5 - 0.3 - 0.1 - 0.2 = -0.1 -> clamped 0.1.
        assert!((market_confidence(&stressed) - 0.1).abs() < 1e-12);

        // Neutral everything: 0.5.
        let neutral = MarketConditions {
            volatility: 0.30,
            trend: MarketTrend::Neutral,
            vix: 25.0,
            ..bullish_conditions()
        };
        assert!((market_confidence(&neutral) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn high_consensus_synthesizes_buy() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = build_coordinator(dir.path(), CoordinationMode::Balanced);

        let decision = coordinator.synthesize("AAPL", high_consensus_inputs()).unwrap();

        assert_eq!(decision.action, TradeAction::Buy);
        assert!(decision.confidence >= 0.70, "consensus gate respected");
        assert!(decision.position_size <= 0.05, "mode cap respected");
        assert!((decision.position_size - 0.045).abs() < 0.005);
        assert_eq!(
            decision.contributing_agents,
            vec!["strategy", "timing", "rules", "market"]
        );
        assert_eq!(decision.entry_price, 150.0);
        assert_eq!(decision.stop_loss, 147.0);
    }

    #[test]
    fn rule_gate_blocks_unvalidated_entry() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = build_coordinator(dir.path(), CoordinationMode::Balanced);

        let mut inputs = high_consensus_inputs();
        // Rules evaluated but no entry rule triggered.
        inputs.rule_evaluations = vec![entry_eval(0.75, false)];

        let decision = coordinator.synthesize("AAPL", inputs).unwrap();
        assert_eq!(decision.action, TradeAction::Hold);
        assert!(decision.reasoning.contains("entry blocked by rules"));
        assert!(!decision.contributing_agents.contains(&"rules".to_string()));
    }

    #[test]
    fn timing_conflict_demotes_buy_to_hold() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = build_coordinator(dir.path(), CoordinationMode::Balanced);

        let mut inputs = high_consensus_inputs();
        inputs.timing = Some(timing_with(TimingCall::StrongSell, 0.70));

        let decision = coordinator.synthesize("AAPL", inputs).unwrap();
        assert_eq!(decision.action, TradeAction::Hold);
        assert!(decision.reasoning.contains("timing conflict"));
    }

    #[test]
    fn conservative_mode_clamps_subthreshold_consensus() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = build_coordinator(dir.path(), CoordinationMode::Conservative);

        // Tuned inputs that synthesize to ~0.74 in balanced weighting:
        // below the conservative 0.80 gate, so no decision is emitted.
        let inputs = SynthesisInputs {
            signal: Some(strong_signal(0.78)),
            timing: Some(timing_with(TimingCall::Buy, 0.68)),
            rule_evaluations: vec![entry_eval(0.72, true)],
            conditions: Some(MarketConditions {
                trend: MarketTrend::Neutral,
                vix: 22.0,
                ..bullish_conditions()
            }),
        };

        assert!(coordinator.synthesize("AAPL", inputs).is_none());
    }

    #[test]
    fn synthesis_tolerates_missing_timing_source() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = build_coordinator(dir.path(), CoordinationMode::Balanced);

        let mut inputs = high_consensus_inputs();
        inputs.timing = None;

        let decision = coordinator.synthesize("AAPL", inputs).unwrap();
        // Decision still emitted from the remaining sources, with sound
        // attribution.
        assert!(!decision.contributing_agents.contains(&"timing".to_string()));
        assert_eq!(
            decision.contributing_agents,
            vec!["strategy", "rules", "market"]
        );
    }

    #[test]
    fn no_sources_means_no_decision() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = build_coordinator(dir.path(), CoordinationMode::Balanced);
        assert!(coordinator.synthesize("AAPL", SynthesisInputs::default()).is_none());
    }

    #[test]
    fn mode_caps_hold_for_every_mode() {
        for mode in [
            CoordinationMode::Conservative,
            CoordinationMode::Balanced,
            CoordinationMode::Aggressive,
            CoordinationMode::Autonomous,
        ] {
            let dir = tempfile::tempdir().unwrap();
            let coordinator = build_coordinator(dir.path(), mode);
            let params = ModeParams::for_mode(mode);

            // Very confident inputs to push sizing against the cap.
            let inputs = SynthesisInputs {
                signal: Some(strong_signal(0.94)),
                timing: Some(timing_with(TimingCall::StrongBuy, 0.92)),
                rule_evaluations: vec![entry_eval(0.9, true)],
                conditions: Some(bullish_conditions()),
            };

            if let Some(decision) = coordinator.synthesize("AAPL", inputs) {
                assert!(
                    decision.position_size <= params.max_position_risk + 1e-12,
                    "{mode}: size {} over cap {}",
                    decision.position_size,
                    params.max_position_risk
                );
                assert!(decision.confidence <= DECISION_CONFIDENCE_CAP);
                if decision.action != TradeAction::Hold {
                    assert!(decision.confidence >= params.consensus_threshold * 0.9 - 1e-12);
                }
            }
        }
    }

    #[test]
    fn risk_score_stays_in_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = build_coordinator(dir.path(), CoordinationMode::Balanced);

        let inputs = SynthesisInputs {
            signal: Some(strong_signal(0.90)),
            timing: Some(timing_with(TimingCall::StrongBuy, 0.88)),
            rule_evaluations: vec![entry_eval(0.9, true)],
            conditions: Some(MarketConditions {
                volatility: 0.5,
                vix: 40.0,
                ..bullish_conditions()
            }),
        };

        let decision = coordinator.synthesize("AAPL", inputs).unwrap();
        assert!((0.0..=1.0).contains(&decision.risk_score));
    }

    #[tokio::test]
    async fn phase_panic_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = build_coordinator(dir.path(), CoordinationMode::Balanced);

        let result: Option<u32> = coordinator
            .run_phase(TradingPhase::TimingOptimization, "AAPL", async {
                panic!("injected agent crash")
            })
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn phase_timeout_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let mut coordinator = build_coordinator(dir.path(), CoordinationMode::Balanced);
        coordinator.phase_timeout = Duration::from_millis(20);

        let result: Option<u32> = coordinator
            .run_phase(TradingPhase::MarketAnalysis, "AAPL", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                7
            })
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn cycle_processes_every_symbol_despite_failures() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = build_coordinator(dir.path(), CoordinationMode::Balanced);

        // Whatever the simulation produces, the cycle must finish and the
        // executed slice must respect the actionable ordering.
        let report = coordinator.execute_cycle().await;
        assert!(report.executed.len() <= 5);
        for decision in &report.executed {
            assert!(decision.action != TradeAction::Hold);
        }
        assert_eq!(coordinator.phase(), TradingPhase::Monitoring);
    }

    #[test]
    fn gc_drops_stale_executed_decisions() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = build_coordinator(dir.path(), CoordinationMode::Balanced);

        let mut stale = TradingDecision::new(
            "AAPL",
            TradeAction::Buy,
            0.8,
            0.04,
            150.0,
            147.0,
            156.0,
            vec!["strategy".to_string()],
            vec![],
            Some(StrategyKind::Momentum),
            0.4,
            String::new(),
        );
        stale.created_at = Utc::now() - ChronoDuration::hours(30);
        coordinator.insert_executed(stale);

        let fresh = TradingDecision::new(
            "TSLA",
            TradeAction::Buy,
            0.8,
            0.04,
            200.0,
            196.0,
            210.0,
            vec!["strategy".to_string()],
            vec![],
            Some(StrategyKind::Momentum),
            0.4,
            String::new(),
        );
        coordinator.insert_executed(fresh);

        assert_eq!(coordinator.gc_executed(), 1);
        assert!(coordinator.executed_decision("AAPL").is_none());
        assert!(coordinator.executed_decision("TSLA").is_some());
    }

    #[test]
    fn record_outcome_attributes_to_contributors_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = build_coordinator(dir.path(), CoordinationMode::Balanced);

        let decision = TradingDecision::new(
            "AAPL",
            TradeAction::Buy,
            0.85,
            0.04,
            150.0,
            147.0,
            156.0,
            vec!["strategy".to_string(), "timing".to_string(), "rules".to_string()],
            vec!["momentum_entry_1".to_string()],
            Some(StrategyKind::Momentum),
            0.4,
            String::new(),
        );
        coordinator.insert_executed(decision);

        coordinator.record_outcome("AAPL", true, 42.0);

        // Coordinator counters updated.
        let counters = coordinator.core().counters();
        assert_eq!(counters.decisions_made, 1);
        assert_eq!(counters.successful, 1);
        assert!((counters.total_pnl - 42.0).abs() < 1e-9);

        // Strategy agent credited.
        let stats = coordinator.strategy.stats(StrategyKind::Momentum).unwrap();
        assert_eq!(stats.total_trades, 1);
        assert_eq!(stats.winning_trades, 1);

        // Rule credited.
        let rule = coordinator.rules.rule("momentum_entry_1").unwrap();
        assert_eq!(rule.success_count, 1);

        // Decision removed; a second outcome is a no-op.
        assert!(coordinator.executed_decision("AAPL").is_none());
        coordinator.record_outcome("AAPL", false, -10.0);
        assert_eq!(coordinator.core().counters().decisions_made, 1);
    }

    #[test]
    fn outcome_for_unknown_symbol_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = build_coordinator(dir.path(), CoordinationMode::Balanced);
        coordinator.record_outcome("GHOST", true, 10.0);
        assert_eq!(coordinator.core().counters().decisions_made, 0);
    }
}
