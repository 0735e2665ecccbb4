// =============================================================================
// Timing Agent — session analysis and entry/exit windows with learned accuracy
// =============================================================================
//
// Session boundaries are configurable wall-clock windows (US-equity
// defaults). The base confidence is a function of strategy kind and
// session; it is then adjusted by historical session accuracy, historical
// strategy accuracy, and the accuracy of similar past experiences, and
// clamped to [0.1, 0.95].
//
// Historical accuracies are rebuilt from `timing_outcome` memories at
// startup, so the agent resumes learning where it left off.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Timelike, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{debug, info};

use crate::bus::AgentMessage;
use crate::memory::record::content_types;
use crate::types::{MarketSession, RiskLevel, StrategyKind, TimingCall, VolatilityWindow};

use super::base::{Agent, AgentCore, AgentDeps};

/// Confidence clamp after all adjustments.
const CONFIDENCE_FLOOR: f64 = 0.1;
const CONFIDENCE_CEIL: f64 = 0.95;

/// Heartbeat cadence for the background loop.
const TICK_INTERVAL_SECS: u64 = 60;

/// Wall-clock session windows.
#[derive(Debug, Clone)]
pub struct SessionWindows {
    pub pre_market: (NaiveTime, NaiveTime),
    pub regular: (NaiveTime, NaiveTime),
    pub after_hours: (NaiveTime, NaiveTime),
}

impl Default for SessionWindows {
    fn default() -> Self {
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).expect("valid time");
        Self {
            pre_market: (t(4, 0), t(9, 30)),
            regular: (t(9, 30), t(16, 0)),
            after_hours: (t(16, 0), t(20, 0)),
        }
    }
}

impl SessionWindows {
    pub fn session_at(&self, time: NaiveTime) -> MarketSession {
        if time >= self.pre_market.0 && time < self.pre_market.1 {
            MarketSession::PreMarket
        } else if time >= self.regular.0 && time < self.regular.1 {
            MarketSession::Regular
        } else if time >= self.after_hours.0 && time < self.after_hours.1 {
            MarketSession::AfterHours
        } else {
            MarketSession::Closed
        }
    }
}

/// Result of a timing analysis for one symbol under one strategy.
#[derive(Debug, Clone, Serialize)]
pub struct TimingAnalysis {
    pub symbol: String,
    pub session: MarketSession,
    pub call: TimingCall,
    pub optimal_entry: DateTime<Utc>,
    pub optimal_exit: DateTime<Utc>,
    pub volatility_window: VolatilityWindow,
    pub confidence: f64,
    pub reasoning: String,
    pub expected_hold_secs: u64,
    pub risk_level: RiskLevel,
}

/// (total, successful) accuracy accumulator.
#[derive(Debug, Clone, Copy, Default)]
struct AccuracyCounter {
    total: u64,
    successful: u64,
}

impl AccuracyCounter {
    fn accuracy(&self) -> Option<f64> {
        (self.total > 0).then(|| self.successful as f64 / self.total as f64)
    }

    fn record(&mut self, success: bool) {
        self.total += 1;
        if success {
            self.successful += 1;
        }
    }
}

pub struct TimingAgent {
    core: AgentCore,
    windows: SessionWindows,
    session_performance: RwLock<HashMap<MarketSession, AccuracyCounter>>,
    strategy_performance: RwLock<HashMap<StrategyKind, AccuracyCounter>>,
}

impl TimingAgent {
    pub const NAME: &'static str = "timing_agent";

    pub fn new(deps: AgentDeps) -> Self {
        let agent = Self {
            core: AgentCore::new(Self::NAME, "timing", deps),
            windows: SessionWindows::default(),
            session_performance: RwLock::new(HashMap::new()),
            strategy_performance: RwLock::new(HashMap::new()),
        };
        agent.load_timing_patterns();
        agent
    }

    pub fn with_sessions(mut self, windows: SessionWindows) -> Self {
        self.windows = windows;
        self
    }

    /// Rebuild accuracy maps from prior `timing_outcome` memories.
    fn load_timing_patterns(&self) {
        let memories = self.core.retrieve_memories(
            "timing signal performance session volatility",
            Some(content_types::TIMING_OUTCOME),
            50,
        );
        let mut sessions = self.session_performance.write();
        let mut strategies = self.strategy_performance.write();
        for (_, record) in &memories {
            let success = record
                .metadata
                .get("success")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if let Some(session) = record
                .metadata
                .get("session")
                .and_then(|v| v.as_str())
                .and_then(parse_session)
            {
                sessions.entry(session).or_default().record(success);
            }
            if let Some(strategy) = record
                .metadata
                .get("strategy")
                .and_then(|v| v.as_str())
                .and_then(parse_strategy)
            {
                strategies.entry(strategy).or_default().record(success);
            }
        }
        if !memories.is_empty() {
            info!(outcomes = memories.len(), "timing patterns rehydrated from memory");
        }
    }

    pub fn current_session(&self, now: DateTime<Utc>) -> MarketSession {
        self.windows.session_at(now.time())
    }

    // -------------------------------------------------------------------------
    // Analysis
    // -------------------------------------------------------------------------

    /// Analyse optimal entry/exit timing for `symbol` under `strategy`.
    pub async fn analyze(&self, symbol: &str, strategy: StrategyKind) -> TimingAnalysis {
        self.analyze_at(symbol, strategy, Utc::now())
    }

    /// Deterministic variant used by tests and replay.
    pub fn analyze_at(
        &self,
        symbol: &str,
        strategy: StrategyKind,
        now: DateTime<Utc>,
    ) -> TimingAnalysis {
        let session = self.current_session(now);
        let mut analysis = self.base_analysis(symbol, strategy, session, now);

        // Memory adjustments: session, strategy, and similar-experience
        // accuracy each pull the base confidence toward observed reality.
        let mut notes = Vec::new();

        if let Some(acc) = self.session_accuracy(session) {
            analysis.confidence += (acc - 0.5) * 0.3;
            notes.push(format!("session_accuracy:{:.0}%", acc * 100.0));
        }
        if let Some(acc) = self.strategy_accuracy(strategy) {
            analysis.confidence += (acc - 0.5) * 0.3;
            notes.push(format!("strategy_accuracy:{:.0}%", acc * 100.0));
        }
        if let Some((count, acc)) = self.similar_experience_accuracy(symbol, strategy, session) {
            analysis.confidence += (acc - 0.5) * 0.2;
            notes.push(format!("similar_experiences:{count} accuracy:{:.0}%", acc * 100.0));
        }

        analysis.confidence = analysis.confidence.clamp(CONFIDENCE_FLOOR, CONFIDENCE_CEIL);
        analysis.call = derive_call(session, analysis.confidence);
        if !notes.is_empty() {
            analysis.reasoning = format!("{} | Memory adjustments: {}", analysis.reasoning, notes.join(", "));
        }

        let _ = self.core.store_memory_with(
            &format!(
                "Timing analysis for {symbol}: {strategy} in {session} session. Entry {}, exit {}, confidence {:.0}%",
                analysis.optimal_entry.format("%H:%M"),
                analysis.optimal_exit.format("%H:%M"),
                analysis.confidence * 100.0
            ),
            content_types::TIMING_ANALYSIS,
            analysis.confidence,
            json!({
                "symbol": symbol,
                "strategy": strategy.to_string(),
                "session": session.to_string(),
                "call": analysis.call.to_string(),
                "confidence": analysis.confidence,
            }),
        );

        debug!(symbol, strategy = %strategy, session = %session, confidence = analysis.confidence, "timing analysis complete");
        analysis
    }

    /// Session-and-strategy base table: entry/exit offsets, volatility
    /// window, base confidence, risk.
    fn base_analysis(
        &self,
        symbol: &str,
        strategy: StrategyKind,
        session: MarketSession,
        now: DateTime<Utc>,
    ) -> TimingAnalysis {
        let minutes = |m: i64| ChronoDuration::minutes(m);
        let hours = |h: i64| ChronoDuration::hours(h);

        let (entry, exit, window, confidence, reasoning, risk) = match strategy {
            StrategyKind::Momentum | StrategyKind::Swing | StrategyKind::TrendFollowing => {
                match session {
                    MarketSession::PreMarket => (
                        now + minutes(30),
                        now + minutes(90),
                        VolatilityWindow::High,
                        0.75,
                        "Pre-market momentum with volume confirmation",
                        RiskLevel::Medium,
                    ),
                    MarketSession::Regular if now.hour() < 11 => (
                        now + minutes(15),
                        now + hours(2),
                        VolatilityWindow::High,
                        0.85,
                        "Regular hours opening momentum",
                        RiskLevel::Medium,
                    ),
                    MarketSession::Regular => (
                        now + minutes(30),
                        now + hours(1),
                        VolatilityWindow::Medium,
                        0.65,
                        "Afternoon momentum with reduced volatility",
                        RiskLevel::Low,
                    ),
                    _ => (
                        now + minutes(30),
                        now + hours(2),
                        VolatilityWindow::High,
                        0.70,
                        "Wait for next market open for momentum play",
                        RiskLevel::Medium,
                    ),
                }
            }
            StrategyKind::MeanReversion => {
                if session == MarketSession::Regular && now.hour() >= 14 {
                    (
                        now + minutes(15),
                        now + minutes(90),
                        VolatilityWindow::Low,
                        0.80,
                        "Late session mean reversion opportunity",
                        RiskLevel::Low,
                    )
                } else {
                    (
                        now + hours(2),
                        now + hours(3),
                        VolatilityWindow::Medium,
                        0.60,
                        "Wait for volatility to settle for mean reversion",
                        RiskLevel::Medium,
                    )
                }
            }
            StrategyKind::Scalping => {
                if session == MarketSession::Regular {
                    (
                        now + minutes(5),
                        now + minutes(30),
                        VolatilityWindow::High,
                        0.75,
                        "High-frequency scalping during regular hours",
                        RiskLevel::High,
                    )
                } else {
                    (
                        now + minutes(10),
                        now + minutes(45),
                        VolatilityWindow::Medium,
                        0.60,
                        "Extended scalp during off-hours",
                        RiskLevel::Medium,
                    )
                }
            }
            StrategyKind::Breakout => (
                now + minutes(10),
                now + minutes(45),
                VolatilityWindow::Medium,
                0.50,
                "Default timing window",
                RiskLevel::Medium,
            ),
        };

        TimingAnalysis {
            symbol: symbol.to_string(),
            session,
            call: TimingCall::Hold,
            optimal_entry: entry,
            optimal_exit: exit,
            volatility_window: window,
            confidence,
            reasoning: reasoning.to_string(),
            expected_hold_secs: (exit - entry).num_seconds().max(0) as u64,
            risk_level: risk,
        }
    }

    fn session_accuracy(&self, session: MarketSession) -> Option<f64> {
        self.session_performance.read().get(&session).and_then(|c| c.accuracy())
    }

    fn strategy_accuracy(&self, strategy: StrategyKind) -> Option<f64> {
        self.strategy_performance.read().get(&strategy).and_then(|c| c.accuracy())
    }

    /// Accuracy over similar past timing outcomes, if any.
    fn similar_experience_accuracy(
        &self,
        symbol: &str,
        strategy: StrategyKind,
        session: MarketSession,
    ) -> Option<(usize, f64)> {
        let situation = format!("symbol:{symbol} session:{session} strategy:{strategy}");
        let similar = self
            .core
            .retrieve_memories(&situation, Some(content_types::TIMING_OUTCOME), 5);
        if similar.is_empty() {
            return None;
        }
        let successes = similar
            .iter()
            .filter(|(_, r)| {
                r.metadata
                    .get("success")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false)
            })
            .count();
        Some((similar.len(), successes as f64 / similar.len() as f64))
    }

    // -------------------------------------------------------------------------
    // Outcome recording
    // -------------------------------------------------------------------------

    /// Record the outcome of a timed trade: counters, accuracy maps, and a
    /// `timing_outcome` memory for future rehydration.
    pub fn record_outcome(
        &self,
        symbol: &str,
        strategy: StrategyKind,
        entry: DateTime<Utc>,
        exit: DateTime<Utc>,
        success: bool,
        pnl: f64,
    ) {
        let session = self.windows.session_at(entry.time());
        self.session_performance
            .write()
            .entry(session)
            .or_default()
            .record(success);
        self.strategy_performance
            .write()
            .entry(strategy)
            .or_default()
            .record(success);

        self.core.learn_from_outcome(
            &format!("{strategy} timing on {symbol} in {session} session"),
            &format!("held {}m", (exit - entry).num_minutes()),
            success,
            pnl,
        );

        let _ = self.core.store_memory_with(
            &format!(
                "Timing outcome: {symbol} {strategy} in {session} session {} with P&L {pnl:.2}",
                if success { "succeeded" } else { "failed" }
            ),
            content_types::TIMING_OUTCOME,
            if success { 0.6 } else { 0.7 },
            json!({
                "symbol": symbol,
                "strategy": strategy.to_string(),
                "session": session.to_string(),
                "success": success,
                "pnl": pnl,
                "entry": entry.to_rfc3339(),
                "exit": exit.to_rfc3339(),
            }),
        );
    }
}

#[async_trait]
impl Agent for TimingAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn process(&self, mut shutdown: watch::Receiver<bool>) {
        info!("timing agent loop started");
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
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("timing agent loop stopping");
                        break;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

/// Directional call from session and adjusted confidence. Closed markets
/// never get an actionable call.
fn derive_call(session: MarketSession, confidence: f64) -> TimingCall {
    if session == MarketSession::Closed {
        return TimingCall::Hold;
    }
    if confidence >= 0.85 {
        TimingCall::StrongBuy
    } else if confidence >= 0.70 {
        TimingCall::Buy
    } else if confidence < 0.30 {
        TimingCall::StrongSell
    } else if confidence < 0.45 {
        TimingCall::Sell
    } else {
        TimingCall::Hold
    }
}

fn parse_session(raw: &str) -> Option<MarketSession> {
    match raw {
        "pre_market" => Some(MarketSession::PreMarket),
        "regular" => Some(MarketSession::Regular),
        "after_hours" => Some(MarketSession::AfterHours),
        "closed" => Some(MarketSession::Closed),
        _ => None,
    }
}

fn parse_strategy(raw: &str) -> Option<StrategyKind> {
    match raw {
        "momentum" => Some(StrategyKind::Momentum),
        "mean_reversion" => Some(StrategyKind::MeanReversion),
        "breakout" => Some(StrategyKind::Breakout),
        "scalping" => Some(StrategyKind::Scalping),
        "swing" => Some(StrategyKind::Swing),
        "trend_following" => Some(StrategyKind::TrendFollowing),
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testutil::test_deps;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 14, hour, minute, 0).unwrap()
    }

    #[test]
    fn session_windows_classify_correctly() {
        let windows = SessionWindows::default();
        assert_eq!(windows.session_at(at(5, 0).time()), MarketSession::PreMarket);
        assert_eq!(windows.session_at(at(9, 30).time()), MarketSession::Regular);
        assert_eq!(windows.session_at(at(15, 59).time()), MarketSession::Regular);
        assert_eq!(windows.session_at(at(17, 0).time()), MarketSession::AfterHours);
        assert_eq!(windows.session_at(at(22, 0).time()), MarketSession::Closed);
        assert_eq!(windows.session_at(at(2, 0).time()), MarketSession::Closed);
    }

    #[test]
    fn base_confidence_table_momentum() {
        let dir = tempfile::tempdir().unwrap();
        let agent = TimingAgent::new(test_deps(dir.path()));

        // Opening momentum is the strongest window.
        let opening = agent.analyze_at("AAPL", StrategyKind::Momentum, at(10, 0));
        assert!((opening.confidence - 0.85).abs() < 1e-9);
        assert_eq!(opening.session, MarketSession::Regular);

        let afternoon = agent.analyze_at("AAPL", StrategyKind::Momentum, at(13, 0));
        assert!((afternoon.confidence - 0.65).abs() < 1e-9);

        let pre = agent.analyze_at("AAPL", StrategyKind::Momentum, at(5, 0));
        assert!((pre.confidence - 0.75).abs() < 1e-9);
        assert_eq!(pre.volatility_window, VolatilityWindow::High);
    }

    #[test]
    fn base_confidence_table_mean_reversion_and_scalping() {
        let dir = tempfile::tempdir().unwrap();
        let agent = TimingAgent::new(test_deps(dir.path()));

        let late = agent.analyze_at("AAPL", StrategyKind::MeanReversion, at(14, 30));
        assert!((late.confidence - 0.80).abs() < 1e-9);
        assert_eq!(late.volatility_window, VolatilityWindow::Low);

        let early = agent.analyze_at("AAPL", StrategyKind::MeanReversion, at(10, 0));
        assert!((early.confidence - 0.60).abs() < 1e-9);

        let scalp = agent.analyze_at("AAPL", StrategyKind::Scalping, at(11, 0));
        assert!((scalp.confidence - 0.75).abs() < 1e-9);
        assert_eq!(scalp.risk_level, RiskLevel::High);
    }

    #[test]
    fn confidence_is_always_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let agent = TimingAgent::new(test_deps(dir.path()));

        // Poison the accuracy maps with failures to drag confidence down.
        for _ in 0..20 {
            agent.record_outcome(
                "AAPL",
                StrategyKind::Momentum,
                at(10, 0),
                at(11, 0),
                false,
                -5.0,
            );
        }

        let analysis = agent.analyze_at("AAPL", StrategyKind::Momentum, at(10, 0));
        assert!(analysis.confidence >= CONFIDENCE_FLOOR);
        assert!(analysis.confidence <= CONFIDENCE_CEIL);
        // 0.85 base - 0.15 (session) - 0.15 (strategy) - similar adj => well below base.
        assert!(analysis.confidence < 0.85);
    }

    #[test]
    fn outcomes_update_accuracy_maps() {
        let dir = tempfile::tempdir().unwrap();
        let agent = TimingAgent::new(test_deps(dir.path()));

        agent.record_outcome("AAPL", StrategyKind::Scalping, at(10, 0), at(10, 30), true, 3.0);
        agent.record_outcome("AAPL", StrategyKind::Scalping, at(10, 0), at(10, 30), true, 2.0);
        agent.record_outcome("AAPL", StrategyKind::Scalping, at(10, 0), at(10, 30), false, -1.0);

        let acc = agent.strategy_accuracy(StrategyKind::Scalping).unwrap();
        assert!((acc - 2.0 / 3.0).abs() < 1e-9);
        let session_acc = agent.session_accuracy(MarketSession::Regular).unwrap();
        assert!((session_acc - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn outcomes_rehydrate_on_restart() {
        let dir = tempfile::tempdir().unwrap();
        let deps = test_deps(dir.path());
        {
            let agent = TimingAgent::new(deps.clone());
            agent.record_outcome("AAPL", StrategyKind::Momentum, at(10, 0), at(11, 0), true, 4.0);
            agent.record_outcome("AAPL", StrategyKind::Momentum, at(10, 0), at(11, 0), true, 4.0);
        }

        // A fresh agent over the same memory store sees the history.
        let reborn = TimingAgent::new(deps);
        let acc = reborn.strategy_accuracy(StrategyKind::Momentum);
        assert_eq!(acc, Some(1.0));
    }

    #[test]
    fn closed_session_never_calls_direction() {
        let dir = tempfile::tempdir().unwrap();
        let agent = TimingAgent::new(test_deps(dir.path()));
        let analysis = agent.analyze_at("AAPL", StrategyKind::Momentum, at(23, 0));
        assert_eq!(analysis.session, MarketSession::Closed);
        assert_eq!(analysis.call, TimingCall::Hold);
    }

    #[test]
    fn call_derivation_thresholds() {
        assert_eq!(derive_call(MarketSession::Regular, 0.90), TimingCall::StrongBuy);
        assert_eq!(derive_call(MarketSession::Regular, 0.75), TimingCall::Buy);
        assert_eq!(derive_call(MarketSession::Regular, 0.55), TimingCall::Hold);
        assert_eq!(derive_call(MarketSession::Regular, 0.40), TimingCall::Sell);
        assert_eq!(derive_call(MarketSession::Regular, 0.20), TimingCall::StrongSell);
        assert_eq!(derive_call(MarketSession::Closed, 0.95), TimingCall::Hold);
    }
}
