// =============================================================================
// Trading Decision — auditable record of every coordinated decision
// =============================================================================
//
// Synthesized per symbol per cycle. Captures the action, the weighted
// confidence, the sizing and risk numbers, and the full attribution: which
// agents contributed and which rules triggered, so outcomes can be
// credited back after the fact.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::types::{StrategyKind, TradeAction};

/// Complete auditable record of a coordinated trading decision.
#[derive(Debug, Clone, Serialize)]
pub struct TradingDecision {
    /// Unique identifier for this decision (UUID v4).
    pub id: String,

    /// Symbol the decision pertains to.
    pub symbol: String,

    pub action: TradeAction,

    /// Weighted consensus confidence, capped at 0.95.
    pub confidence: f64,

    /// Fraction of portfolio to commit; never above the mode's risk cap.
    pub position_size: f64,

    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,

    /// Sources whose confidence entered the weighted sum.
    pub contributing_agents: Vec<String>,

    /// Entry/exit rules that triggered during validation, for outcome
    /// attribution.
    pub triggered_rule_ids: Vec<String>,

    /// Strategy family behind the winning signal, when one contributed.
    pub strategy: Option<StrategyKind>,

    /// Composite risk score in [0, 1].
    pub risk_score: f64,

    /// Human-readable synthesis trail.
    pub reasoning: String,

    pub created_at: DateTime<Utc>,
}

impl TradingDecision {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        action: TradeAction,
        confidence: f64,
        position_size: f64,
        entry_price: f64,
        stop_loss: f64,
        take_profit: f64,
        contributing_agents: Vec<String>,
        triggered_rule_ids: Vec<String>,
        strategy: Option<StrategyKind>,
        risk_score: f64,
        reasoning: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            action,
            confidence,
            position_size,
            entry_price,
            stop_loss,
            take_profit,
            contributing_agents,
            triggered_rule_ids,
            strategy,
            risk_score,
            reasoning,
            created_at: Utc::now(),
        }
    }

    /// Ranking key for cycle execution: confident, low-risk decisions run
    /// first.
    pub fn execution_score(&self) -> f64 {
        self.confidence - self.risk_score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_score_prefers_confident_low_risk() {
        let make = |confidence: f64, risk: f64| {
            TradingDecision::new(
                "SNDL",
                TradeAction::Buy,
                confidence,
                0.03,
                2.0,
                1.9,
                2.2,
                vec!["strategy".to_string()],
                vec![],
                Some(StrategyKind::Momentum),
                risk,
                String::new(),
            )
        };
        let safe = make(0.8, 0.2);
        let risky = make(0.9, 0.8);
        assert!(safe.execution_score() > risky.execution_score());
    }
}
