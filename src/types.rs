// =============================================================================
// Shared types used across the Quorum trading fabric
// =============================================================================

use serde::{Deserialize, Serialize};

/// Risk posture of the coordinator. Selects the consensus threshold and the
/// per-position risk cap (see `coordinator`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationMode {
    Conservative,
    Balanced,
    Aggressive,
    Autonomous,
}

impl Default for CoordinationMode {
    fn default() -> Self {
        Self::Balanced
    }
}

impl std::fmt::Display for CoordinationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conservative => write!(f, "conservative"),
            Self::Balanced => write!(f, "balanced"),
            Self::Aggressive => write!(f, "aggressive"),
            Self::Autonomous => write!(f, "autonomous"),
        }
    }
}

/// Observable stage of the per-symbol decision pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingPhase {
    MarketAnalysis,
    SignalGeneration,
    RuleValidation,
    TimingOptimization,
    ExecutionPlanning,
    Monitoring,
}

impl Default for TradingPhase {
    fn default() -> Self {
        Self::MarketAnalysis
    }
}

impl std::fmt::Display for TradingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MarketAnalysis => write!(f, "market_analysis"),
            Self::SignalGeneration => write!(f, "signal_generation"),
            Self::RuleValidation => write!(f, "rule_validation"),
            Self::TimingOptimization => write!(f, "timing_optimization"),
            Self::ExecutionPlanning => write!(f, "execution_planning"),
            Self::Monitoring => write!(f, "monitoring"),
        }
    }
}

/// Lifecycle state of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Inactive,
    Starting,
    Active,
    Pausing,
    Paused,
    Stopping,
    Error,
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self::Inactive
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inactive => write!(f, "inactive"),
            Self::Starting => write!(f, "starting"),
            Self::Active => write!(f, "active"),
            Self::Pausing => write!(f, "pausing"),
            Self::Paused => write!(f, "paused"),
            Self::Stopping => write!(f, "stopping"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Final action of a coordinated trading decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeAction {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
            Self::Hold => write!(f, "hold"),
        }
    }
}

/// Side of an executed trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Ledger status of a trade row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Pending,
    Executed,
    Cancelled,
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Executed => write!(f, "executed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Ledger status of a position row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// The strategy families the Strategy Agent evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Momentum,
    MeanReversion,
    Breakout,
    Scalping,
    Swing,
    TrendFollowing,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 6] = [
        StrategyKind::Momentum,
        StrategyKind::MeanReversion,
        StrategyKind::Breakout,
        StrategyKind::Scalping,
        StrategyKind::Swing,
        StrategyKind::TrendFollowing,
    ];
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Momentum => write!(f, "momentum"),
            Self::MeanReversion => write!(f, "mean_reversion"),
            Self::Breakout => write!(f, "breakout"),
            Self::Scalping => write!(f, "scalping"),
            Self::Swing => write!(f, "swing"),
            Self::TrendFollowing => write!(f, "trend_following"),
        }
    }
}

/// Qualitative strength of a strategy signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStrength {
    Weak,
    Moderate,
    Strong,
    VeryStrong,
}

impl SignalStrength {
    /// Map a confidence value to its strength bucket.
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.85 {
            Self::VeryStrong
        } else if confidence >= 0.75 {
            Self::Strong
        } else if confidence >= 0.65 {
            Self::Moderate
        } else {
            Self::Weak
        }
    }
}

impl std::fmt::Display for SignalStrength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Weak => write!(f, "weak"),
            Self::Moderate => write!(f, "moderate"),
            Self::Strong => write!(f, "strong"),
            Self::VeryStrong => write!(f, "very_strong"),
        }
    }
}

/// Qualitative risk bucket attached to signals and timing analyses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Broad direction of the market, derived from moving-average structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketTrend {
    Bullish,
    Bearish,
    Neutral,
}

impl std::fmt::Display for MarketTrend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "bullish"),
            Self::Bearish => write!(f, "bearish"),
            Self::Neutral => write!(f, "neutral"),
        }
    }
}

/// Volatility-derived market regime label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    HighVolatility,
    LowVolatilityConsolidation,
    Trending,
    Normal,
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HighVolatility => write!(f, "high_volatility"),
            Self::LowVolatilityConsolidation => write!(f, "low_volatility_consolidation"),
            Self::Trending => write!(f, "trending"),
            Self::Normal => write!(f, "normal"),
        }
    }
}

/// US-equity trading session buckets used by the Timing Agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketSession {
    PreMarket,
    Regular,
    AfterHours,
    Closed,
}

impl std::fmt::Display for MarketSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreMarket => write!(f, "pre_market"),
            Self::Regular => write!(f, "regular"),
            Self::AfterHours => write!(f, "after_hours"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Expected volatility inside a timing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolatilityWindow {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for VolatilityWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Directional call produced by the Timing Agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingCall {
    StrongBuy,
    Buy,
    Hold,
    Sell,
    StrongSell,
}

impl TimingCall {
    pub fn is_bullish(self) -> bool {
        matches!(self, Self::Buy | Self::StrongBuy)
    }

    pub fn is_bearish(self) -> bool {
        matches!(self, Self::Sell | Self::StrongSell)
    }
}

impl std::fmt::Display for TimingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StrongBuy => write!(f, "strong_buy"),
            Self::Buy => write!(f, "buy"),
            Self::Hold => write!(f, "hold"),
            Self::Sell => write!(f, "sell"),
            Self::StrongSell => write!(f, "strong_sell"),
        }
    }
}

/// One OHLCV bar of market history, oldest-first in slices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    /// Bar close timestamp (unix millis).
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_serialises_snake_case() {
        let json = serde_json::to_string(&CoordinationMode::Conservative).unwrap();
        assert_eq!(json, "\"conservative\"");
        let back: CoordinationMode = serde_json::from_str("\"autonomous\"").unwrap();
        assert_eq!(back, CoordinationMode::Autonomous);
    }

    #[test]
    fn strength_buckets_match_thresholds() {
        assert_eq!(SignalStrength::from_confidence(0.90), SignalStrength::VeryStrong);
        assert_eq!(SignalStrength::from_confidence(0.80), SignalStrength::Strong);
        assert_eq!(SignalStrength::from_confidence(0.70), SignalStrength::Moderate);
        assert_eq!(SignalStrength::from_confidence(0.50), SignalStrength::Weak);
    }

    #[test]
    fn timing_call_direction_helpers() {
        assert!(TimingCall::StrongBuy.is_bullish());
        assert!(TimingCall::Sell.is_bearish());
        assert!(!TimingCall::Hold.is_bullish());
        assert!(!TimingCall::Hold.is_bearish());
    }

    #[test]
    fn display_matches_wire_names() {
        assert_eq!(
            MarketRegime::LowVolatilityConsolidation.to_string(),
            "low_volatility_consolidation"
        );
        assert_eq!(TradingPhase::RuleValidation.to_string(), "rule_validation");
        assert_eq!(StrategyKind::MeanReversion.to_string(), "mean_reversion");
    }
}
