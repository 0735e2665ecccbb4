// =============================================================================
// Strategy Agent — six strategy families over simulated market history
// =============================================================================
//
// Each strategy has a fixed rule; confidence is the sum of rule-specific
// contributions, adjusted by market regime and by the strategy's
// historical win rate, then clamped to [0.1, 0.95].
//
// Position sizing: base = 0.02 + confidence * 0.03, scaled down for wide
// stops, capped at the agent's maximum.
//
// Signals below the minimum confidence are dropped; surviving signals are
// de-duplicated per symbol (highest confidence wins) and capped at the
// top ten to avoid overtrading.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{AgentEvent, EventPayload};
use crate::indicators;
use crate::ledger::{MetadataLedger, StrategyPerformanceRow};
use crate::memory::record::content_types;
use crate::types::{Bar, MarketRegime, MarketTrend, RiskLevel, SignalStrength, StrategyKind};

use super::base::{Agent, AgentCore, AgentDeps};
use super::scraper::StockScraper;

/// Confidence floor/ceiling after all adjustments.
const CONFIDENCE_FLOOR: f64 = 0.1;
const CONFIDENCE_CEIL: f64 = 0.95;

/// Signals below this confidence are dropped.
const MIN_SIGNAL_CONFIDENCE: f64 = 0.6;

/// Cap on surviving signals per generation pass.
const MAX_SIGNALS: usize = 10;

/// Hard cap on position size as a portfolio fraction.
const MAX_POSITION_SIZE: f64 = 0.1;

/// Benchmark symbol used for market-condition analysis.
const BENCHMARK: &str = "SPY";

/// Signal generation cadence for the background loop.
const GENERATE_INTERVAL_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Current market-wide conditions, derived from the benchmark symbol.
#[derive(Debug, Clone, Serialize)]
pub struct MarketConditions {
    pub price_change: f64,
    /// Annualised 20-bar volatility.
    pub volatility: f64,
    pub trend: MarketTrend,
    pub volume: f64,
    pub vix: f64,
    pub regime: MarketRegime,
}

impl Default for MarketConditions {
    fn default() -> Self {
        Self {
            price_change: 0.0,
            volatility: 0.2,
            trend: MarketTrend::Neutral,
            volume: 0.0,
            vix: 20.0,
            regime: MarketRegime::Normal,
        }
    }
}

/// One generated strategy signal.
#[derive(Debug, Clone, Serialize)]
pub struct StrategySignal {
    pub id: String,
    pub symbol: String,
    pub strategy: StrategyKind,
    pub strength: SignalStrength,
    pub confidence: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub risk_level: RiskLevel,
    pub position_size: f64,
    pub reasoning: String,
    pub indicators: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub expected_duration_secs: u64,
}

/// Per-strategy rolling performance.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StrategyStats {
    pub total_trades: u32,
    pub winning_trades: u32,
    pub total_pnl: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
}

/// Fixed per-strategy rule parameters.
#[derive(Debug, Clone)]
pub struct StrategyParams {
    pub momentum_rsi_threshold: f64,
    pub momentum_volume_multiplier: f64,
    pub momentum_min_return: f64,
    pub reversion_rsi_oversold: f64,
    pub reversion_bollinger_std: f64,
    pub breakout_volume_threshold: f64,
    pub breakout_price_threshold: f64,
    pub scalping_min_move: f64,
    pub scalping_profit_target: f64,
    pub scalping_stop: f64,
    pub swing_min_return: f64,
    pub trend_min_rsi: f64,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            momentum_rsi_threshold: 70.0,
            momentum_volume_multiplier: 2.0,
            momentum_min_return: 0.02,
            reversion_rsi_oversold: 30.0,
            reversion_bollinger_std: 2.0,
            breakout_volume_threshold: 1.5,
            breakout_price_threshold: 0.05,
            scalping_min_move: 0.005,
            scalping_profit_target: 0.01,
            scalping_stop: 0.005,
            swing_min_return: 0.05,
            trend_min_rsi: 50.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Strategy Agent
// ---------------------------------------------------------------------------

pub struct StrategyAgent {
    core: AgentCore,
    scraper: Arc<StockScraper>,
    ledger: Arc<MetadataLedger>,
    params: StrategyParams,
    performance: RwLock<HashMap<StrategyKind, StrategyStats>>,
    watchlist: Vec<String>,
}

impl StrategyAgent {
    pub const NAME: &'static str = "strategy_agent";

    pub fn new(
        deps: AgentDeps,
        scraper: Arc<StockScraper>,
        ledger: Arc<MetadataLedger>,
        watchlist: Vec<String>,
    ) -> Self {
        let agent = Self {
            core: AgentCore::new(Self::NAME, "strategy", deps),
            scraper,
            ledger,
            params: StrategyParams::default(),
            performance: RwLock::new(HashMap::new()),
            watchlist,
        };
        agent.load_performance();
        agent
    }

    /// Rehydrate per-strategy win rates from prior strategy_performance
    /// memories.
    fn load_performance(&self) {
        let memories = self.core.retrieve_memories(
            "strategy performance trades win_rate profit",
            Some(content_types::STRATEGY_PERFORMANCE),
            20,
        );
        let mut performance = self.performance.write();
        for (_, record) in memories {
            let Some(kind) = record
                .metadata
                .get("strategy")
                .and_then(|v| v.as_str())
                .and_then(parse_strategy_kind)
            else {
                continue;
            };
            let stats = performance.entry(kind).or_default();
            if stats.total_trades == 0 {
                stats.total_trades = record
                    .metadata
                    .get("total_trades")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32;
                stats.winning_trades = record
                    .metadata
                    .get("winning_trades")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32;
                stats.total_pnl = record
                    .metadata
                    .get("total_pnl")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0);
                stats.win_rate = record
                    .metadata
                    .get("win_rate")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0);
            }
        }
        if !performance.is_empty() {
            info!(strategies = performance.len(), "strategy performance rehydrated from memory");
        }
    }

    // -------------------------------------------------------------------------
    // Market conditions
    // -------------------------------------------------------------------------

    /// Assess market-wide conditions from the benchmark symbol and record
    /// the analysis in memory.
    pub async fn analyze_market_conditions(&self) -> MarketConditions {
        let bars = self.scraper.history(BENCHMARK, 60);
        if bars.len() < 21 {
            return MarketConditions::default();
        }

        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();

        let current = *closes.last().unwrap_or(&0.0);
        let previous = closes.get(closes.len().saturating_sub(2)).copied().unwrap_or(current);
        let price_change = if previous > 0.0 {
            (current - previous) / previous
        } else {
            0.0
        };

        let volatility = indicators::annualized_volatility(&closes, 20).unwrap_or(0.2);
        let volume = if volumes.len() >= 10 {
            volumes[volumes.len() - 10..].iter().sum::<f64>() / 10.0
        } else {
            volumes.last().copied().unwrap_or(0.0)
        };

        let sma_20 = indicators::sma(&closes, 20).unwrap_or(current);
        let sma_50 = indicators::sma(&closes, 50).unwrap_or(sma_20);
        let trend = if sma_20 > sma_50 * 1.001 {
            MarketTrend::Bullish
        } else if sma_20 < sma_50 * 0.999 {
            MarketTrend::Bearish
        } else {
            MarketTrend::Neutral
        };

        // No live VIX feed in the simulated build: proxy it from realised
        // volatility on the same scale.
        let vix = (volatility * 100.0).clamp(10.0, 80.0);

        let regime = determine_regime(volatility, price_change);

        let conditions = MarketConditions {
            price_change,
            volatility,
            trend,
            volume,
            vix,
            regime,
        };

        let _ = self.core.store_memory_with(
            &format!(
                "Market analysis: {trend} trend with {:.1}% volatility, VIX {vix:.1}, regime {regime}",
                volatility * 100.0
            ),
            content_types::MARKET_ANALYSIS,
            0.6,
            json!({
                "price_change": price_change,
                "volatility": volatility,
                "trend": trend.to_string(),
                "vix": vix,
                "regime": regime.to_string(),
            }),
        );

        conditions
    }

    // -------------------------------------------------------------------------
    // Signal generation
    // -------------------------------------------------------------------------

    /// Generate ranked signals for the given symbols under `conditions`.
    pub async fn generate_signals(
        &self,
        symbols: &[String],
        conditions: &MarketConditions,
    ) -> Vec<StrategySignal> {
        let mut signals = Vec::new();

        for symbol in symbols {
            let bars = self.scraper.history(symbol, 60);
            if bars.len() < 31 {
                debug!(symbol, bars = bars.len(), "insufficient history for signal generation");
                continue;
            }

            for kind in StrategyKind::ALL {
                if let Some(mut signal) = self.evaluate_strategy(kind, symbol, &bars, conditions) {
                    self.adjust_for_performance(&mut signal);
                    if signal.confidence >= MIN_SIGNAL_CONFIDENCE {
                        signals.push(signal);
                    }
                }
            }
        }

        // De-duplicate per symbol keeping the highest confidence, rank by
        // confidence, cap to avoid overtrading.
        let mut best: HashMap<String, StrategySignal> = HashMap::new();
        for signal in signals {
            match best.get(&signal.symbol) {
                Some(existing) if existing.confidence >= signal.confidence => {}
                _ => {
                    best.insert(signal.symbol.clone(), signal);
                }
            }
        }
        let mut ranked: Vec<StrategySignal> = best.into_values().collect();
        ranked.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked.truncate(MAX_SIGNALS);

        for signal in &ranked {
            let _ = self.core.store_memory_with(
                &format!(
                    "Signal: {} {} on {} at {:.2} ({:.0}% confidence) - {}",
                    signal.strength,
                    signal.strategy,
                    signal.symbol,
                    signal.entry_price,
                    signal.confidence * 100.0,
                    signal.reasoning
                ),
                content_types::TRADING_SIGNAL,
                signal.confidence,
                json!({
                    "symbol": signal.symbol,
                    "strategy": signal.strategy.to_string(),
                    "strength": signal.strength.to_string(),
                    "confidence": signal.confidence,
                    "entry_price": signal.entry_price,
                }),
            );
        }

        ranked
    }

    fn evaluate_strategy(
        &self,
        kind: StrategyKind,
        symbol: &str,
        bars: &[Bar],
        conditions: &MarketConditions,
    ) -> Option<StrategySignal> {
        match kind {
            StrategyKind::Momentum => self.momentum(symbol, bars, conditions, 10, 14_400),
            StrategyKind::MeanReversion => self.mean_reversion(symbol, bars, conditions),
            StrategyKind::Breakout => self.breakout(symbol, bars, conditions),
            StrategyKind::Scalping => self.scalping(symbol, bars, conditions),
            // Swing is momentum at a longer horizon with a longer hold.
            StrategyKind::Swing => self.swing(symbol, bars, conditions),
            StrategyKind::TrendFollowing => self.trend_following(symbol, bars, conditions),
        }
    }

    fn momentum(
        &self,
        symbol: &str,
        bars: &[Bar],
        conditions: &MarketConditions,
        lookback: usize,
        duration_secs: u64,
    ) -> Option<StrategySignal> {
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();
        let price = *closes.last()?;

        let rsi = indicators::rsi(&closes, 14)?;
        let avg_volume = volumes[volumes.len().saturating_sub(20)..]
            .iter()
            .sum::<f64>()
            / volumes.len().min(20) as f64;
        let volume_ratio = if avg_volume > 0.0 {
            volumes.last()? / avg_volume
        } else {
            0.0
        };
        let momentum = indicators::simple_return(&closes, lookback)?;

        let fired = rsi > self.params.momentum_rsi_threshold
            && volume_ratio > self.params.momentum_volume_multiplier
            && momentum > self.params.momentum_min_return;
        if !fired {
            return None;
        }

        let mut confidence = 0.5;
        confidence += ((rsi - 70.0) / 30.0).min(0.2);
        confidence += ((volume_ratio - 2.0) / 3.0).min(0.2);
        confidence += (momentum * 10.0).min(0.1);
        confidence = self.adjust_for_market(confidence, conditions);

        let atr = indicators::atr(bars, 14)?;
        let stop_loss = price - atr * 2.0;
        let take_profit = price + atr * 3.0;

        Some(self.build_signal(
            symbol,
            StrategyKind::Momentum,
            confidence,
            price,
            stop_loss,
            take_profit,
            conditions,
            format!(
                "Momentum: RSI {rsi:.1}, volume {volume_ratio:.1}x, {lookback}-bar return {:.2}%",
                momentum * 100.0
            ),
            json!({ "rsi": rsi, "volume_ratio": volume_ratio, "momentum": momentum, "atr": atr }),
            duration_secs,
        ))
    }

    fn mean_reversion(
        &self,
        symbol: &str,
        bars: &[Bar],
        conditions: &MarketConditions,
    ) -> Option<StrategySignal> {
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let price = *closes.last()?;

        let rsi = indicators::rsi(&closes, 14)?;
        let bands = indicators::bollinger(&closes, 20, self.params.reversion_bollinger_std)?;

        // Long-side only: oversold bounce toward the middle band.
        let fired = rsi < self.params.reversion_rsi_oversold && price < bands.lower;
        if !fired {
            return None;
        }

        let mut confidence = 0.5;
        confidence += ((30.0 - rsi) / 30.0).min(0.3);
        confidence = self.adjust_for_market(confidence, conditions);

        let atr = indicators::atr(bars, 14)?;
        let stop_loss = price - atr * 2.0;
        let take_profit = bands.middle.min(price + atr * 3.0);

        Some(self.build_signal(
            symbol,
            StrategyKind::MeanReversion,
            confidence,
            price,
            stop_loss,
            take_profit,
            conditions,
            format!("Mean reversion: RSI {rsi:.1}, price below lower Bollinger band"),
            json!({ "rsi": rsi, "bollinger_upper": bands.upper, "bollinger_lower": bands.lower }),
            7_200,
        ))
    }

    fn breakout(
        &self,
        symbol: &str,
        bars: &[Bar],
        conditions: &MarketConditions,
    ) -> Option<StrategySignal> {
        if bars.len() < 22 {
            return None;
        }
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();
        let price = *closes.last()?;

        // Resistance from the 20 bars preceding the current one.
        let window = &bars[bars.len() - 21..bars.len() - 1];
        let resistance = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);

        let avg_volume = volumes[volumes.len() - 21..volumes.len() - 1].iter().sum::<f64>() / 20.0;
        let volume_ratio = if avg_volume > 0.0 {
            volumes.last()? / avg_volume
        } else {
            0.0
        };

        let fired = price > resistance * (1.0 + self.params.breakout_price_threshold)
            && volume_ratio > self.params.breakout_volume_threshold;
        if !fired {
            return None;
        }

        let margin = price / resistance - 1.0;
        let mut confidence = 0.5;
        confidence += ((volume_ratio - 1.5) / 2.0).min(0.2);
        confidence += (margin * 2.0).min(0.2);
        confidence = self.adjust_for_market(confidence, conditions);

        let atr = indicators::atr(bars, 14)?;
        Some(self.build_signal(
            symbol,
            StrategyKind::Breakout,
            confidence,
            price,
            resistance.min(price - atr),
            price + atr * 3.0,
            conditions,
            format!(
                "Breakout above {resistance:.2} with {volume_ratio:.1}x volume ({:.1}% margin)",
                margin * 100.0
            ),
            json!({ "resistance": resistance, "volume_ratio": volume_ratio, "margin": margin }),
            10_800,
        ))
    }

    fn scalping(
        &self,
        symbol: &str,
        bars: &[Bar],
        conditions: &MarketConditions,
    ) -> Option<StrategySignal> {
        // Only scalp in sufficiently volatile conditions.
        if conditions.volatility < 0.2 {
            return None;
        }
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let price = *closes.last()?;

        let short_momentum = indicators::simple_return(&closes, 3)?;
        if short_momentum < self.params.scalping_min_move {
            return None;
        }

        let confidence = 0.7 + (short_momentum * 100.0).min(0.2);

        Some(self.build_signal(
            symbol,
            StrategyKind::Scalping,
            confidence,
            price,
            price * (1.0 - self.params.scalping_stop),
            price * (1.0 + self.params.scalping_profit_target),
            conditions,
            format!("Scalp: {:.2}% 3-bar momentum", short_momentum * 100.0),
            json!({ "short_momentum": short_momentum }),
            300,
        ))
    }

    fn swing(
        &self,
        symbol: &str,
        bars: &[Bar],
        conditions: &MarketConditions,
    ) -> Option<StrategySignal> {
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let price = *closes.last()?;

        let swing_return = indicators::simple_return(&closes, 30)?;
        let rsi = indicators::rsi(&closes, 14)?;

        // A sustained move that hasn't gone vertical yet.
        let fired = swing_return > self.params.swing_min_return && (45.0..75.0).contains(&rsi);
        if !fired {
            return None;
        }

        let mut confidence = 0.5;
        confidence += (swing_return * 3.0).min(0.2);
        confidence += ((rsi - 45.0) / 60.0).min(0.1);
        confidence = self.adjust_for_market(confidence, conditions);

        let atr = indicators::atr(bars, 14)?;
        Some(self.build_signal(
            symbol,
            StrategyKind::Swing,
            confidence,
            price,
            price - atr * 3.0,
            price + atr * 5.0,
            conditions,
            format!(
                "Swing: {:.1}% 30-bar move with RSI {rsi:.1}",
                swing_return * 100.0
            ),
            json!({ "swing_return": swing_return, "rsi": rsi }),
            259_200,
        ))
    }

    fn trend_following(
        &self,
        symbol: &str,
        bars: &[Bar],
        conditions: &MarketConditions,
    ) -> Option<StrategySignal> {
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let price = *closes.last()?;

        let sma_20 = indicators::sma(&closes, 20)?;
        let sma_50 = indicators::sma(&closes, 50)?;
        let rsi = indicators::rsi(&closes, 14)?;

        let fired = sma_20 > sma_50 && price > sma_20 && rsi > self.params.trend_min_rsi;
        if !fired {
            return None;
        }

        let separation = (sma_20 - sma_50) / sma_50;
        let mut confidence = 0.5;
        confidence += (separation * 20.0).min(0.2);
        confidence += ((rsi - 50.0) / 100.0).min(0.1);
        confidence = self.adjust_for_market(confidence, conditions);

        let atr = indicators::atr(bars, 14)?;
        Some(self.build_signal(
            symbol,
            StrategyKind::TrendFollowing,
            confidence,
            price,
            sma_20.min(price - atr * 2.0),
            price + atr * 4.0,
            conditions,
            format!(
                "Trend: SMA20 {:.2} over SMA50 {:.2}, RSI {rsi:.1}",
                sma_20, sma_50
            ),
            json!({ "sma_20": sma_20, "sma_50": sma_50, "rsi": rsi }),
            86_400,
        ))
    }

    /// Market-regime adjustment shared by the trend-sensitive strategies.
    fn adjust_for_market(&self, mut confidence: f64, conditions: &MarketConditions) -> f64 {
        if conditions.trend == MarketTrend::Bullish {
            confidence += 0.1;
        }
        if conditions.volatility > 0.3 {
            confidence -= 0.1;
        }
        confidence
    }

    #[allow(clippy::too_many_arguments)]
    fn build_signal(
        &self,
        symbol: &str,
        strategy: StrategyKind,
        confidence: f64,
        entry_price: f64,
        stop_loss: f64,
        take_profit: f64,
        conditions: &MarketConditions,
        reasoning: String,
        indicator_snapshot: serde_json::Value,
        expected_duration_secs: u64,
    ) -> StrategySignal {
        let confidence = confidence.clamp(CONFIDENCE_FLOOR, CONFIDENCE_CEIL);
        let risk_level = if conditions.volatility > 0.35 || confidence < 0.6 {
            RiskLevel::High
        } else if conditions.volatility > 0.25 || confidence < 0.7 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        StrategySignal {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            strategy,
            strength: SignalStrength::from_confidence(confidence),
            confidence,
            entry_price,
            stop_loss,
            take_profit,
            risk_level,
            position_size: position_size(confidence, stop_loss, entry_price),
            reasoning,
            indicators: indicator_snapshot,
            timestamp: Utc::now(),
            expected_duration_secs,
        }
    }

    /// Blend the strategy's historical win rate into the signal after ten
    /// recorded trades, then re-derive strength from the new confidence.
    fn adjust_for_performance(&self, signal: &mut StrategySignal) {
        let performance = self.performance.read();
        if let Some(stats) = performance.get(&signal.strategy) {
            if stats.total_trades > 10 {
                signal.confidence = (signal.confidence + (stats.win_rate - 0.5) * 0.6)
                    .clamp(CONFIDENCE_FLOOR, CONFIDENCE_CEIL);
                signal.strength = SignalStrength::from_confidence(signal.confidence);
            }
            if stats.profit_factor > 0.0 && stats.profit_factor < 1.0 {
                signal.position_size = (signal.position_size * 0.8).min(MAX_POSITION_SIZE);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Outcome recording
    // -------------------------------------------------------------------------

    /// Record the outcome of a trade driven by one of this agent's
    /// signals; updates rolling stats and persists them.
    pub fn record_outcome(&self, symbol: &str, strategy: StrategyKind, success: bool, pnl: f64) {
        let stats_snapshot = {
            let mut performance = self.performance.write();
            let stats = performance.entry(strategy).or_default();
            stats.total_trades += 1;
            if success {
                stats.winning_trades += 1;
            }
            stats.total_pnl += pnl;
            if pnl > 0.0 {
                stats.gross_profit += pnl;
            } else {
                stats.gross_loss += pnl.abs();
            }
            stats.win_rate = stats.winning_trades as f64 / stats.total_trades as f64;
            stats.profit_factor = if stats.gross_loss > 0.0 {
                stats.gross_profit / stats.gross_loss
            } else if stats.gross_profit > 0.0 {
                f64::INFINITY
            } else {
                0.0
            };
            stats.clone()
        };

        self.core.learn_from_outcome(
            &format!("{strategy} signal on {symbol}"),
            &format!("{} with P&L {pnl:.2}", if success { "won" } else { "lost" }),
            success,
            pnl,
        );

        let _ = self.core.store_memory_with(
            &format!(
                "Strategy performance update: {strategy} now has {:.1}% win rate over {} trades",
                stats_snapshot.win_rate * 100.0,
                stats_snapshot.total_trades
            ),
            content_types::STRATEGY_PERFORMANCE,
            0.7,
            json!({
                "strategy": strategy.to_string(),
                "symbol": symbol,
                "total_trades": stats_snapshot.total_trades,
                "winning_trades": stats_snapshot.winning_trades,
                "total_pnl": stats_snapshot.total_pnl,
                "win_rate": stats_snapshot.win_rate,
                "profit_factor": if stats_snapshot.profit_factor.is_finite() {
                    stats_snapshot.profit_factor
                } else {
                    0.0
                },
            }),
        );

        if let Err(e) = self.ledger.upsert_strategy_performance(&StrategyPerformanceRow {
            id: Uuid::new_v4().to_string(),
            strategy: strategy.to_string(),
            total_trades: stats_snapshot.total_trades,
            winning_trades: stats_snapshot.winning_trades,
            total_pnl: stats_snapshot.total_pnl,
            max_drawdown: 0.0,
            sharpe_ratio: 0.0,
            updated_at: Utc::now(),
        }) {
            warn!(strategy = %strategy, error = %e, "strategy performance ledger write failed");
        }
    }

    pub fn stats(&self, strategy: StrategyKind) -> Option<StrategyStats> {
        self.performance.read().get(&strategy).cloned()
    }
}

#[async_trait]
impl Agent for StrategyAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn process(&self, mut shutdown: watch::Receiver<bool>) {
        info!("strategy agent loop started");
        let mut ticker = interval(Duration::from_secs(GENERATE_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.core.heartbeat();
                    self.core.drain_inbox();
                    let conditions = self.analyze_market_conditions().await;
                    let signals = self.generate_signals(&self.watchlist, &conditions).await;
                    for signal in &signals {
                        self.core.fanout().emit(AgentEvent::new(
                            Self::NAME,
                            EventPayload::Signal {
                                signal_id: signal.id.clone(),
                                symbol: signal.symbol.clone(),
                                strategy: signal.strategy.to_string(),
                                confidence: signal.confidence,
                                price: signal.entry_price,
                                volume: 0.0,
                                timeframe: "1m".to_string(),
                                indicators: signal.indicators.clone(),
                            },
                        ));
                    }
                    debug!(signals = signals.len(), regime = %conditions.regime, "signal pass complete");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("strategy agent loop stopping");
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

/// Volatility/price-change regime classification.
fn determine_regime(volatility: f64, price_change: f64) -> MarketRegime {
    if volatility > 0.25 {
        MarketRegime::HighVolatility
    } else if volatility < 0.15 {
        if price_change.abs() < 0.005 {
            MarketRegime::LowVolatilityConsolidation
        } else {
            MarketRegime::Trending
        }
    } else {
        MarketRegime::Normal
    }
}

/// Risk-scaled position size: base 2–5% by confidence, shrunk for wide
/// stops, capped at the agent maximum.
fn position_size(confidence: f64, stop_loss: f64, entry_price: f64) -> f64 {
    if entry_price <= 0.0 || stop_loss <= 0.0 {
        return 0.01;
    }
    let base = 0.02 + confidence * 0.03;
    let stop_distance = (entry_price - stop_loss).abs() / entry_price;
    let scaled = if stop_distance > 0.0 {
        base * (0.02 / stop_distance).min(1.0)
    } else {
        base
    };
    scaled.min(MAX_POSITION_SIZE)
}

fn parse_strategy_kind(raw: &str) -> Option<StrategyKind> {
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

    fn build_agent(dir: &std::path::Path) -> StrategyAgent {
        let deps = test_deps(dir);
        let ledger = Arc::new(MetadataLedger::open_in_memory().unwrap());
        let scraper = Arc::new(StockScraper::new(
            deps.clone(),
            ledger.clone(),
            vec!["SNDL".to_string()],
        ));
        StrategyAgent::new(deps, scraper, ledger, vec!["SNDL".to_string()])
    }

    #[test]
    fn regime_thresholds() {
        assert_eq!(determine_regime(0.30, 0.0), MarketRegime::HighVolatility);
        assert_eq!(determine_regime(0.10, 0.001), MarketRegime::LowVolatilityConsolidation);
        assert_eq!(determine_regime(0.10, 0.02), MarketRegime::Trending);
        assert_eq!(determine_regime(0.20, 0.02), MarketRegime::Normal);
    }

    #[test]
    fn position_size_scales_with_confidence_and_stop() {
        // Tight stop (2%): full base size.
        let tight = position_size(0.8, 98.0, 100.0);
        assert!((tight - (0.02 + 0.8 * 0.03)).abs() < 1e-9);

        // Wide stop (10%): scaled down by 0.02 / 0.10.
        let wide = position_size(0.8, 90.0, 100.0);
        assert!((wide - (0.02 + 0.8 * 0.03) * 0.2).abs() < 1e-9);

        // Degenerate input: minimum size.
        assert!((position_size(0.8, 0.0, 100.0) - 0.01).abs() < 1e-9);

        // Never above the cap.
        assert!(position_size(0.95, 99.9999, 100.0) <= MAX_POSITION_SIZE);
    }

    #[tokio::test]
    async fn market_conditions_are_sane() {
        let dir = tempfile::tempdir().unwrap();
        let agent = build_agent(dir.path());

        let conditions = agent.analyze_market_conditions().await;
        assert!(conditions.volatility >= 0.0);
        assert!((10.0..=80.0).contains(&conditions.vix));
    }

    #[tokio::test]
    async fn generated_signals_respect_floor_and_cap() {
        let dir = tempfile::tempdir().unwrap();
        let agent = build_agent(dir.path());

        let conditions = agent.analyze_market_conditions().await;
        let signals = agent
            .generate_signals(&["SNDL".to_string()], &conditions)
            .await;

        assert!(signals.len() <= MAX_SIGNALS);
        for signal in &signals {
            assert!(signal.confidence >= MIN_SIGNAL_CONFIDENCE);
            assert!(signal.confidence <= CONFIDENCE_CEIL);
            assert!(signal.position_size <= MAX_POSITION_SIZE);
            assert!(signal.entry_price > 0.0);
        }
    }

    #[test]
    fn momentum_fires_only_on_joint_conditions() {
        let dir = tempfile::tempdir().unwrap();
        let agent = build_agent(dir.path());
        let conditions = MarketConditions::default();

        // Strong uptrend with a volume burst on the last bar.
        let mut bars: Vec<Bar> = (0..40)
            .map(|i| {
                let price: f64 = 2.0 * (1.0 + 0.01f64).powi(i as i32);
                Bar {
                    ts: i as i64 * 60_000,
                    open: price,
                    high: price * 1.005,
                    low: price * 0.995,
                    close: price,
                    volume: 100_000.0,
                }
            })
            .collect();
        bars.last_mut().unwrap().volume = 500_000.0;

        let signal = agent.momentum("SNDL", &bars, &conditions, 10, 14_400);
        assert!(signal.is_some());
        let signal = signal.unwrap();
        assert_eq!(signal.strategy, StrategyKind::Momentum);
        assert!(signal.stop_loss < signal.entry_price);
        assert!(signal.take_profit > signal.entry_price);

        // Same path without the volume burst: no signal.
        let mut quiet = bars.clone();
        quiet.last_mut().unwrap().volume = 100_000.0;
        assert!(agent.momentum("SNDL", &quiet, &conditions, 10, 14_400).is_none());
    }

    #[test]
    fn mean_reversion_fires_when_oversold_below_band() {
        let dir = tempfile::tempdir().unwrap();
        let agent = build_agent(dir.path());
        let conditions = MarketConditions::default();

        // Flat, then a hard multi-bar selloff.
        let mut bars: Vec<Bar> = (0..35)
            .map(|i| Bar {
                ts: i as i64 * 60_000,
                open: 5.0,
                high: 5.05,
                low: 4.95,
                close: 5.0,
                volume: 100_000.0,
            })
            .collect();
        for (i, drop) in [4.6, 4.2, 3.9, 3.6, 3.4].iter().enumerate() {
            bars.push(Bar {
                ts: (35 + i) as i64 * 60_000,
                open: *drop + 0.1,
                high: *drop + 0.15,
                low: *drop - 0.05,
                close: *drop,
                volume: 150_000.0,
            });
        }

        let signal = agent.mean_reversion("SNDL", &bars, &conditions);
        assert!(signal.is_some());
        assert_eq!(signal.unwrap().strategy, StrategyKind::MeanReversion);
    }

    #[test]
    fn performance_blend_kicks_in_after_ten_trades() {
        let dir = tempfile::tempdir().unwrap();
        let agent = build_agent(dir.path());

        // 12 trades, 10 wins: win rate well above 0.5.
        for i in 0..12 {
            agent.record_outcome("SNDL", StrategyKind::Momentum, i < 10, if i < 10 { 5.0 } else { -5.0 });
        }

        let mut signal = StrategySignal {
            id: "s".to_string(),
            symbol: "SNDL".to_string(),
            strategy: StrategyKind::Momentum,
            strength: SignalStrength::Moderate,
            confidence: 0.65,
            entry_price: 2.0,
            stop_loss: 1.96,
            take_profit: 2.1,
            risk_level: RiskLevel::Medium,
            position_size: 0.03,
            reasoning: String::new(),
            indicators: json!({}),
            timestamp: Utc::now(),
            expected_duration_secs: 60,
        };
        agent.adjust_for_performance(&mut signal);

        // 0.65 + (0.8333 - 0.5) * 0.6 ≈ 0.85
        assert!(signal.confidence > 0.65);
        assert!(signal.confidence <= CONFIDENCE_CEIL);
    }

    #[test]
    fn record_outcome_updates_stats_and_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let agent = build_agent(dir.path());

        agent.record_outcome("SNDL", StrategyKind::Breakout, true, 12.0);
        agent.record_outcome("SNDL", StrategyKind::Breakout, false, -4.0);

        let stats = agent.stats(StrategyKind::Breakout).unwrap();
        assert_eq!(stats.total_trades, 2);
        assert_eq!(stats.winning_trades, 1);
        assert!((stats.win_rate - 0.5).abs() < 1e-9);
        assert!((stats.profit_factor - 3.0).abs() < 1e-9);

        let row = agent
            .ledger
            .strategy_performance("breakout")
            .unwrap()
            .unwrap();
        assert_eq!(row.total_trades, 2);
    }
}
