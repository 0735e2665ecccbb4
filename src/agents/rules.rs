// =============================================================================
// Rule Set Agent — typed trading rules with learned accuracy and synthesis
// =============================================================================
//
// Rules are typed {entry, exit, risk_management, position_sizing,
// market_condition} and evaluate one named metric from a MarketView
// against an operator/threshold, with optional auxiliary gates from the
// rule's parameter map.
//
// Guard rails:
//   - Debounce: a rule that triggered within the last five minutes does
//     not trigger again.
//   - Disablement: at twenty or more recorded outcomes with accuracy
//     below 0.3, the rule disables itself and writes a memory record.
//   - Adaptive learning: given enough (pattern, outcome) pairs, the most
//     predictive feature becomes a new entry rule, persisted as an
//     `adaptive_rule` memory and rehydrated on startup.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::AgentMessage;
use crate::errors::CoreError;
use crate::memory::record::content_types;

use super::base::{Agent, AgentCore, AgentDeps};

/// Minimum gap in minutes between two triggers of the same rule.
const DEBOUNCE_MINUTES: i64 = 5;

/// Accuracy floor and sample size for automatic disablement.
const DISABLE_ACCURACY: f64 = 0.3;
const DISABLE_MIN_OUTCOMES: u32 = 20;

/// Rules with enough outcomes but accuracy below this never trigger.
const MIN_TRIGGER_ACCURACY: f64 = 0.3;
const MIN_TRIGGER_SAMPLE: u32 = 10;

/// Adaptive learning thresholds.
const ADAPTIVE_MIN_PATTERNS: usize = 10;
const ADAPTIVE_MIN_SUCCESSES: usize = 5;
const ADAPTIVE_MIN_SCORE: f64 = 0.7;

const CONFIDENCE_FLOOR: f64 = 0.1;
const CONFIDENCE_CEIL: f64 = 0.95;

const TICK_INTERVAL_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// Rule model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Entry,
    Exit,
    RiskManagement,
    PositionSizing,
    MarketCondition,
}

impl std::fmt::Display for RuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entry => write!(f, "entry"),
            Self::Exit => write!(f, "exit"),
            Self::RiskManagement => write!(f, "risk_management"),
            Self::PositionSizing => write!(f, "position_sizing"),
            Self::MarketCondition => write!(f, "market_condition"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    GreaterThan,
    LessThan,
    GreaterEqual,
    LessEqual,
    Equal,
    NotEqual,
    Between,
    CrossesAbove,
    CrossesBelow,
}

impl std::fmt::Display for RuleOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GreaterThan => write!(f, ">"),
            Self::LessThan => write!(f, "<"),
            Self::GreaterEqual => write!(f, ">="),
            Self::LessEqual => write!(f, "<="),
            Self::Equal => write!(f, "="),
            Self::NotEqual => write!(f, "!="),
            Self::Between => write!(f, "between"),
            Self::CrossesAbove => write!(f, "crosses_above"),
            Self::CrossesBelow => write!(f, "crosses_below"),
        }
    }
}

/// One typed trading rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingRule {
    pub id: String,
    pub kind: RuleKind,
    pub name: String,
    pub description: String,
    /// Human-readable condition text.
    pub condition: String,
    /// Metric read from the MarketView.
    pub metric: String,
    /// Auxiliary gate parameters (see `aux_gates_pass`).
    pub parameters: Value,
    pub operator: RuleOperator,
    pub threshold: f64,
    /// Upper bound for `Between`.
    pub threshold_high: Option<f64>,
    pub priority: u32,
    pub enabled: bool,
    #[serde(default)]
    pub success_count: u32,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub accuracy: f64,
    #[serde(default)]
    pub last_triggered: Option<DateTime<Utc>>,
}

impl TradingRule {
    fn outcomes(&self) -> u32 {
        self.success_count + self.failure_count
    }
}

/// Result of evaluating one rule for one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct RuleEvaluation {
    pub rule_id: String,
    pub kind: RuleKind,
    pub symbol: String,
    pub triggered: bool,
    pub value: f64,
    pub threshold: f64,
    pub condition_met: bool,
    pub confidence: f64,
    pub reasoning: String,
    pub timestamp: DateTime<Utc>,
}

/// Named metrics visible to rule evaluation. Built by the coordinator
/// from snapshots, strategy signals, and portfolio state.
#[derive(Debug, Clone, Default)]
pub struct MarketView {
    values: HashMap<String, f64>,
}

impl MarketView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, metric: impl Into<String>, value: f64) -> Self {
        self.values.insert(metric.into(), value);
        self
    }

    pub fn put(&mut self, metric: impl Into<String>, value: f64) {
        self.values.insert(metric.into(), value);
    }

    pub fn get(&self, metric: &str) -> Option<f64> {
        self.values.get(metric).copied()
    }
}

// ---------------------------------------------------------------------------
// Rule Set Agent
// ---------------------------------------------------------------------------

pub struct RuleSetAgent {
    core: AgentCore,
    rules: RwLock<HashMap<String, TradingRule>>,
}

impl RuleSetAgent {
    pub const NAME: &'static str = "rules_agent";

    pub fn new(deps: AgentDeps) -> Self {
        let agent = Self {
            core: AgentCore::new(Self::NAME, "rules", deps),
            rules: RwLock::new(HashMap::new()),
        };
        agent.seed_default_rules();
        agent.rehydrate_adaptive_rules();
        agent
    }

    pub fn rule(&self, id: &str) -> Option<TradingRule> {
        self.rules.read().get(id).cloned()
    }

    pub fn rules_of_kind(&self, kind: RuleKind) -> Vec<TradingRule> {
        self.rules
            .read()
            .values()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    pub fn add_rule(&self, rule: TradingRule) {
        self.rules.write().insert(rule.id.clone(), rule);
    }

    // -------------------------------------------------------------------------
    // Default rule set
    // -------------------------------------------------------------------------

    fn seed_default_rules(&self) {
        let defaults = vec![
            TradingRule {
                id: "momentum_entry_1".to_string(),
                kind: RuleKind::Entry,
                name: "Momentum Breakout Entry".to_string(),
                description: "Enter long when price breaks above EMA with volume confirmation".to_string(),
                condition: "price > ema_20 AND volume > avg_volume * 1.5 AND rsi > 50".to_string(),
                metric: "price_vs_ema_20".to_string(),
                parameters: json!({ "min_volume_ratio": 1.5, "min_rsi": 50.0 }),
                operator: RuleOperator::GreaterThan,
                threshold: 0.0,
                threshold_high: None,
                priority: 1,
                enabled: true,
                success_count: 0,
                failure_count: 0,
                accuracy: 0.0,
                last_triggered: None,
            },
            TradingRule {
                id: "oversold_entry_1".to_string(),
                kind: RuleKind::Entry,
                name: "Oversold Bounce Entry".to_string(),
                description: "Enter long when RSI is oversold and price near support".to_string(),
                condition: "rsi < 30 AND price > support_level * 0.98".to_string(),
                metric: "rsi".to_string(),
                parameters: json!({ "min_price_vs_support": 0.98 }),
                operator: RuleOperator::LessThan,
                threshold: 30.0,
                threshold_high: None,
                priority: 2,
                enabled: true,
                success_count: 0,
                failure_count: 0,
                accuracy: 0.0,
                last_triggered: None,
            },
            TradingRule {
                id: "breakout_entry_1".to_string(),
                kind: RuleKind::Entry,
                name: "Volume Breakout Entry".to_string(),
                description: "Enter on high volume breakout above resistance".to_string(),
                condition: "price > resistance_level AND volume > avg_volume * 2.0".to_string(),
                metric: "price_vs_resistance".to_string(),
                parameters: json!({ "min_volume_ratio": 2.0 }),
                operator: RuleOperator::GreaterThan,
                threshold: 0.0,
                threshold_high: None,
                priority: 1,
                enabled: true,
                success_count: 0,
                failure_count: 0,
                accuracy: 0.0,
                last_triggered: None,
            },
            TradingRule {
                id: "profit_exit_1".to_string(),
                kind: RuleKind::Exit,
                name: "Profit Target Exit".to_string(),
                description: "Exit when profit target is reached".to_string(),
                condition: "current_profit >= profit_target".to_string(),
                metric: "current_profit".to_string(),
                parameters: json!({}),
                operator: RuleOperator::GreaterEqual,
                threshold: 0.05,
                threshold_high: None,
                priority: 1,
                enabled: true,
                success_count: 0,
                failure_count: 0,
                accuracy: 0.0,
                last_triggered: None,
            },
            TradingRule {
                id: "stop_loss_exit_1".to_string(),
                kind: RuleKind::Exit,
                name: "Stop Loss Exit".to_string(),
                description: "Exit when the stop loss limit is hit".to_string(),
                condition: "current_loss >= stop_loss_limit".to_string(),
                metric: "current_loss".to_string(),
                parameters: json!({}),
                operator: RuleOperator::GreaterEqual,
                threshold: 0.03,
                threshold_high: None,
                priority: 1,
                enabled: true,
                success_count: 0,
                failure_count: 0,
                accuracy: 0.0,
                last_triggered: None,
            },
            TradingRule {
                id: "trailing_stop_exit_1".to_string(),
                kind: RuleKind::Exit,
                name: "Trailing Stop Exit".to_string(),
                description: "Exit when price falls back from the high-water mark".to_string(),
                condition: "drawdown_from_high >= trailing_stop_pct".to_string(),
                metric: "drawdown_from_high".to_string(),
                parameters: json!({}),
                operator: RuleOperator::GreaterEqual,
                threshold: 0.02,
                threshold_high: None,
                priority: 2,
                enabled: true,
                success_count: 0,
                failure_count: 0,
                accuracy: 0.0,
                last_triggered: None,
            },
            TradingRule {
                id: "position_size_1".to_string(),
                kind: RuleKind::PositionSizing,
                name: "Risk-Based Position Sizing".to_string(),
                description: "Position size stays within the per-trade risk budget".to_string(),
                condition: "position_size <= max_position_size".to_string(),
                metric: "position_size".to_string(),
                parameters: json!({}),
                operator: RuleOperator::LessEqual,
                threshold: 0.1,
                threshold_high: None,
                priority: 1,
                enabled: true,
                success_count: 0,
                failure_count: 0,
                accuracy: 0.0,
                last_triggered: None,
            },
            TradingRule {
                id: "max_positions_1".to_string(),
                kind: RuleKind::RiskManagement,
                name: "Maximum Positions Limit".to_string(),
                description: "Limit the total number of open positions".to_string(),
                condition: "open_positions < max_positions".to_string(),
                metric: "open_positions".to_string(),
                parameters: json!({}),
                operator: RuleOperator::LessThan,
                threshold: 5.0,
                threshold_high: None,
                priority: 1,
                enabled: true,
                success_count: 0,
                failure_count: 0,
                accuracy: 0.0,
                last_triggered: None,
            },
            TradingRule {
                id: "correlation_1".to_string(),
                kind: RuleKind::RiskManagement,
                name: "Correlation Risk Management".to_string(),
                description: "Avoid stacking highly correlated positions".to_string(),
                condition: "position_correlation < max_correlation".to_string(),
                metric: "position_correlation".to_string(),
                parameters: json!({}),
                operator: RuleOperator::LessThan,
                threshold: 0.7,
                threshold_high: None,
                priority: 2,
                enabled: true,
                success_count: 0,
                failure_count: 0,
                accuracy: 0.0,
                last_triggered: None,
            },
            TradingRule {
                id: "volatility_1".to_string(),
                kind: RuleKind::MarketCondition,
                name: "High Volatility Filter".to_string(),
                description: "Stand down when the fear gauge runs hot".to_string(),
                condition: "vix < high_volatility_threshold".to_string(),
                metric: "vix".to_string(),
                parameters: json!({}),
                operator: RuleOperator::LessThan,
                threshold: 30.0,
                threshold_high: None,
                priority: 1,
                enabled: true,
                success_count: 0,
                failure_count: 0,
                accuracy: 0.0,
                last_triggered: None,
            },
            TradingRule {
                id: "trend_1".to_string(),
                kind: RuleKind::MarketCondition,
                name: "Market Trend Filter".to_string(),
                description: "Only trade in the direction of the major trend".to_string(),
                condition: "sma_20 > sma_50".to_string(),
                metric: "sma_trend".to_string(),
                parameters: json!({}),
                operator: RuleOperator::GreaterThan,
                threshold: 0.0,
                threshold_high: None,
                priority: 1,
                enabled: true,
                success_count: 0,
                failure_count: 0,
                accuracy: 0.0,
                last_triggered: None,
            },
        ];

        let mut rules = self.rules.write();
        for rule in defaults {
            rules.insert(rule.id.clone(), rule);
        }
        info!(count = rules.len(), "default rule set seeded");
    }

    /// Reload previously learned rules from `adaptive_rule` memories.
    fn rehydrate_adaptive_rules(&self) {
        let memories = self.core.retrieve_memories(
            "adaptive rule learned generated",
            Some(content_types::ADAPTIVE_RULE),
            20,
        );
        let mut loaded = 0usize;
        for (_, record) in memories {
            match serde_json::from_str::<TradingRule>(&record.content) {
                Ok(rule) => {
                    self.rules.write().entry(rule.id.clone()).or_insert(rule);
                    loaded += 1;
                }
                Err(e) => warn!(id = %record.id, error = %e, "unparseable adaptive rule memory"),
            }
        }
        if loaded > 0 {
            info!(loaded, "adaptive rules rehydrated from memory");
        }
    }

    // -------------------------------------------------------------------------
    // Evaluation
    // -------------------------------------------------------------------------

    /// Evaluate every enabled rule (optionally restricted to `kind`)
    /// against the market view. Rules whose metric is absent are skipped.
    pub fn evaluate(
        &self,
        symbol: &str,
        view: &MarketView,
        kind: Option<RuleKind>,
    ) -> Vec<RuleEvaluation> {
        let now = Utc::now();
        let candidates: Vec<TradingRule> = self
            .rules
            .read()
            .values()
            .filter(|r| r.enabled && kind.map(|k| r.kind == k).unwrap_or(true))
            .cloned()
            .collect();

        let mut evaluations = Vec::with_capacity(candidates.len());
        for rule in candidates {
            let Some(value) = view.get(&rule.metric) else {
                continue;
            };

            let condition_met =
                apply_operator(&rule, value, view) && aux_gates_pass(&rule.parameters, view);
            let triggered = condition_met && self.should_trigger(&rule, now);
            let confidence = rule_confidence(&rule, view);

            let accuracy_str = if rule.outcomes() > 0 {
                format!("{:.0}%", rule.accuracy * 100.0)
            } else {
                "NEW".to_string()
            };
            let reasoning = format!(
                "{}: {} | value {value:.3} vs threshold {:.3} | confidence {:.0}% | historical accuracy {accuracy_str}",
                rule.name,
                if condition_met { "TRIGGERED" } else { "NOT MET" },
                rule.threshold,
                confidence * 100.0
            );

            if triggered {
                self.rules.write().entry(rule.id.clone()).and_modify(|r| {
                    r.last_triggered = Some(now);
                });
                info!(rule = %rule.id, symbol, value, "rule triggered");
                let _ = self.core.store_memory_with(
                    &format!("Rule evaluation: {} for {symbol} - {reasoning}", rule.id),
                    content_types::RULE_EVALUATION,
                    confidence,
                    json!({
                        "rule_id": rule.id,
                        "symbol": symbol,
                        "triggered": true,
                        "value": value,
                        "threshold": rule.threshold,
                        "confidence": confidence,
                    }),
                );
            }

            evaluations.push(RuleEvaluation {
                rule_id: rule.id.clone(),
                kind: rule.kind,
                symbol: symbol.to_string(),
                triggered,
                value,
                threshold: rule.threshold,
                condition_met,
                confidence,
                reasoning,
                timestamp: now,
            });
        }

        evaluations
    }

    /// Debounce and accuracy gates on top of a met condition.
    fn should_trigger(&self, rule: &TradingRule, now: DateTime<Utc>) -> bool {
        if rule.outcomes() > MIN_TRIGGER_SAMPLE && rule.accuracy < MIN_TRIGGER_ACCURACY {
            return false;
        }
        if let Some(last) = rule.last_triggered {
            if now - last < ChronoDuration::minutes(DEBOUNCE_MINUTES) {
                return false;
            }
        }
        true
    }

    // -------------------------------------------------------------------------
    // Outcome recording & disablement
    // -------------------------------------------------------------------------

    /// Record the outcome of a trade a rule participated in. At twenty or
    /// more outcomes with accuracy below 0.3, the rule disables itself.
    pub fn record_outcome(&self, rule_id: &str, symbol: &str, success: bool, pnl: f64) {
        let disabled = {
            let mut rules = self.rules.write();
            let Some(rule) = rules.get_mut(rule_id) else {
                debug!(rule_id, "outcome for unknown rule ignored");
                return;
            };
            if success {
                rule.success_count += 1;
            } else {
                rule.failure_count += 1;
            }
            rule.accuracy = rule.success_count as f64 / rule.outcomes() as f64;

            let should_disable =
                rule.outcomes() >= DISABLE_MIN_OUTCOMES && rule.accuracy < DISABLE_ACCURACY;
            if should_disable && rule.enabled {
                rule.enabled = false;
                let err = CoreError::RuleDisabled(rule_id.to_string());
                warn!(accuracy = rule.accuracy, "{err}");
            }
            should_disable
        };

        let _ = self.core.store_memory_with(
            &format!(
                "Rule outcome: {rule_id} on {symbol} {} with P&L {pnl:.2}",
                if success { "succeeded" } else { "failed" }
            ),
            content_types::RULE_PERFORMANCE,
            if success { 0.5 } else { 0.6 },
            json!({ "rule_id": rule_id, "symbol": symbol, "success": success, "pnl": pnl }),
        );

        if disabled {
            let _ = self.core.store_memory_with(
                &format!("Rule {rule_id} disabled after sustained poor accuracy"),
                content_types::RULE_PERFORMANCE,
                0.8,
                json!({ "rule_id": rule_id, "disabled": true }),
            );
        }
    }

    // -------------------------------------------------------------------------
    // Adaptive learning
    // -------------------------------------------------------------------------

    /// Derive a new entry rule from (pattern, outcome) pairs: the feature
    /// most consistent across successful patterns, provided its score
    /// clears the floor, becomes an operator/threshold rule.
    pub fn learn_adaptive_rule(
        &self,
        patterns: &[serde_json::Map<String, Value>],
        outcomes: &[bool],
    ) -> Option<TradingRule> {
        if patterns.len() < ADAPTIVE_MIN_PATTERNS || patterns.len() != outcomes.len() {
            return None;
        }
        let successful: Vec<&serde_json::Map<String, Value>> = patterns
            .iter()
            .zip(outcomes.iter())
            .filter(|(_, &ok)| ok)
            .map(|(p, _)| p)
            .collect();
        if successful.len() < ADAPTIVE_MIN_SUCCESSES {
            return None;
        }

        let (feature, score, spec) = best_feature(&successful)?;
        if score < ADAPTIVE_MIN_SCORE {
            return None;
        }

        let rule = match spec {
            FeatureSpec::Numeric { mean, min, max } => {
                // Above-mean when the successful mean sits in the upper
                // half of the observed range, below-mean otherwise.
                let operator = if mean >= (min + max) / 2.0 {
                    RuleOperator::GreaterThan
                } else {
                    RuleOperator::LessThan
                };
                TradingRule {
                    id: format!("adaptive_{feature}_{}", short_id()),
                    kind: RuleKind::Entry,
                    name: format!("Adaptive {feature} rule"),
                    description: format!(
                        "Learned from {} successful patterns (score {score:.2})",
                        successful.len()
                    ),
                    condition: format!("{feature} {operator} {mean:.3}"),
                    metric: feature.clone(),
                    parameters: json!({}),
                    operator,
                    threshold: mean,
                    threshold_high: None,
                    priority: 2,
                    enabled: true,
                    success_count: 0,
                    failure_count: 0,
                    accuracy: 0.0,
                    last_triggered: None,
                }
            }
            FeatureSpec::Categorical { mode } => TradingRule {
                id: format!("adaptive_{feature}_{}", short_id()),
                kind: RuleKind::Entry,
                name: format!("Adaptive {feature} rule"),
                description: format!(
                    "Learned from {} successful patterns (score {score:.2})",
                    successful.len()
                ),
                condition: format!("{feature} = {mode}"),
                metric: format!("{feature}_is_{mode}"),
                parameters: json!({ "category": mode }),
                operator: RuleOperator::Equal,
                threshold: 1.0,
                threshold_high: None,
                priority: 2,
                enabled: true,
                success_count: 0,
                failure_count: 0,
                accuracy: 0.0,
                last_triggered: None,
            },
        };

        let rule_json = serde_json::to_string(&rule).ok()?;
        let _ = self.core.store_memory_with(
            &rule_json,
            content_types::ADAPTIVE_RULE,
            0.8,
            json!({
                "rule_id": rule.id,
                "patterns_analyzed": patterns.len(),
                "success_rate": successful.len() as f64 / patterns.len() as f64,
                "feature": feature,
                "score": score,
            }),
        );

        info!(rule = %rule.id, feature, score, "adaptive rule learned");
        self.rules.write().insert(rule.id.clone(), rule.clone());
        Some(rule)
    }
}

#[async_trait]
impl Agent for RuleSetAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn process(&self, mut shutdown: watch::Receiver<bool>) {
        info!("rule set agent loop started");
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
                        info!("rule set agent loop stopping");
                        break;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation helpers
// ---------------------------------------------------------------------------

fn apply_operator(rule: &TradingRule, value: f64, view: &MarketView) -> bool {
    let threshold = rule.threshold;
    match rule.operator {
        RuleOperator::GreaterThan => value > threshold,
        RuleOperator::LessThan => value < threshold,
        RuleOperator::GreaterEqual => value >= threshold,
        RuleOperator::LessEqual => value <= threshold,
        RuleOperator::Equal => (value - threshold).abs() < 1e-3,
        RuleOperator::NotEqual => (value - threshold).abs() >= 1e-3,
        RuleOperator::Between => {
            let high = rule.threshold_high.unwrap_or(threshold);
            value >= threshold && value <= high
        }
        RuleOperator::CrossesAbove => {
            let prev = view
                .get(&format!("prev_{}", rule.metric))
                .unwrap_or(value);
            prev <= threshold && threshold < value
        }
        RuleOperator::CrossesBelow => {
            let prev = view
                .get(&format!("prev_{}", rule.metric))
                .unwrap_or(value);
            prev >= threshold && threshold > value
        }
    }
}

/// Auxiliary gates: additional conditions a rule's parameters impose on
/// top of the primary metric comparison.
fn aux_gates_pass(parameters: &Value, view: &MarketView) -> bool {
    if let Some(min) = parameters.get("min_volume_ratio").and_then(|v| v.as_f64()) {
        if view.get("volume_ratio").map(|v| v < min).unwrap_or(true) {
            return false;
        }
    }
    if let Some(min) = parameters.get("min_rsi").and_then(|v| v.as_f64()) {
        if view.get("rsi").map(|v| v < min).unwrap_or(true) {
            return false;
        }
    }
    if let Some(buffer) = parameters.get("min_price_vs_support").and_then(|v| v.as_f64()) {
        let price = view.get("price").unwrap_or(0.0);
        let support = view.get("support_level").unwrap_or(0.0);
        if support > 0.0 && price < support * buffer {
            return false;
        }
    }
    true
}

/// Rule trigger confidence: performance history, volume, volatility band
/// and priority each contribute, clamped to [0.1, 0.95].
fn rule_confidence(rule: &TradingRule, view: &MarketView) -> f64 {
    let mut confidence = 0.5;

    if rule.outcomes() > 0 {
        confidence += (rule.accuracy - 0.5) * 0.4;
    }

    if let Some(volume_ratio) = view.get("volume_ratio") {
        confidence += ((volume_ratio - 1.0) * 0.05).clamp(0.0, 0.1);
    }

    if let Some(volatility) = view.get("volatility") {
        if (0.15..=0.25).contains(&volatility) {
            confidence += 0.1;
        } else if volatility > 0.35 {
            confidence -= 0.2;
        }
    }

    confidence += (rule.priority as f64 / 5.0) * 0.1;

    confidence.clamp(CONFIDENCE_FLOOR, CONFIDENCE_CEIL)
}

// ---------------------------------------------------------------------------
// Adaptive feature analysis
// ---------------------------------------------------------------------------

enum FeatureSpec {
    Numeric { mean: f64, min: f64, max: f64 },
    Categorical { mode: String },
}

/// Score each feature across successful patterns: numeric features by
/// consistency (1 / (1 + cv)), categorical by mode frequency. Returns the
/// best (feature, score, spec).
fn best_feature(successful: &[&serde_json::Map<String, Value>]) -> Option<(String, f64, FeatureSpec)> {
    let mut keys: Vec<String> = Vec::new();
    for pattern in successful {
        for key in pattern.keys() {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
    }

    let mut best: Option<(String, f64, FeatureSpec)> = None;
    for key in keys {
        let numeric: Vec<f64> = successful
            .iter()
            .filter_map(|p| p.get(&key).and_then(|v| v.as_f64()))
            .collect();

        let candidate = if numeric.len() == successful.len() && !numeric.is_empty() {
            let mean = numeric.iter().sum::<f64>() / numeric.len() as f64;
            let variance =
                numeric.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / numeric.len() as f64;
            let std = variance.sqrt();
            if mean == 0.0 {
                continue;
            }
            let score = 1.0 / (1.0 + std / mean.abs());
            let min = numeric.iter().copied().fold(f64::INFINITY, f64::min);
            let max = numeric.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            (key.clone(), score, FeatureSpec::Numeric { mean, min, max })
        } else {
            let strings: Vec<&str> = successful
                .iter()
                .filter_map(|p| p.get(&key).and_then(|v| v.as_str()))
                .collect();
            if strings.is_empty() {
                continue;
            }
            let mut counts: HashMap<&str, usize> = HashMap::new();
            for s in &strings {
                *counts.entry(s).or_insert(0) += 1;
            }
            let (mode, count) = counts.into_iter().max_by_key(|(_, c)| *c)?;
            let score = count as f64 / strings.len() as f64;
            (
                key.clone(),
                score,
                FeatureSpec::Categorical {
                    mode: mode.to_string(),
                },
            )
        };

        match &best {
            Some((_, best_score, _)) if *best_score >= candidate.1 => {}
            _ => best = Some(candidate),
        }
    }
    best
}

fn short_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testutil::test_deps;

    fn build_agent(dir: &std::path::Path) -> RuleSetAgent {
        RuleSetAgent::new(test_deps(dir))
    }

    fn entry_view() -> MarketView {
        MarketView::new()
            .set("price", 2.5)
            .set("price_vs_ema_20", 0.03)
            .set("price_vs_resistance", -0.02)
            .set("rsi", 62.0)
            .set("volume_ratio", 2.2)
            .set("volatility", 0.2)
            .set("vix", 18.0)
            .set("sma_trend", 0.05)
            .set("support_level", 2.3)
    }

    #[test]
    fn defaults_are_seeded_across_all_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let agent = build_agent(dir.path());

        assert_eq!(agent.rules_of_kind(RuleKind::Entry).len(), 3);
        assert_eq!(agent.rules_of_kind(RuleKind::Exit).len(), 3);
        assert_eq!(agent.rules_of_kind(RuleKind::RiskManagement).len(), 2);
        assert_eq!(agent.rules_of_kind(RuleKind::PositionSizing).len(), 1);
        assert_eq!(agent.rules_of_kind(RuleKind::MarketCondition).len(), 2);
    }

    #[test]
    fn momentum_entry_triggers_on_met_conditions() {
        let dir = tempfile::tempdir().unwrap();
        let agent = build_agent(dir.path());

        let evals = agent.evaluate("SNDL", &entry_view(), Some(RuleKind::Entry));
        let momentum = evals.iter().find(|e| e.rule_id == "momentum_entry_1").unwrap();
        assert!(momentum.condition_met);
        assert!(momentum.triggered);
        assert!((CONFIDENCE_FLOOR..=CONFIDENCE_CEIL).contains(&momentum.confidence));
    }

    #[test]
    fn aux_gates_block_triggering() {
        let dir = tempfile::tempdir().unwrap();
        let agent = build_agent(dir.path());

        // Volume ratio below the 1.5x gate.
        let view = entry_view().set("volume_ratio", 1.1);
        let evals = agent.evaluate("SNDL", &view, Some(RuleKind::Entry));
        let momentum = evals.iter().find(|e| e.rule_id == "momentum_entry_1").unwrap();
        assert!(!momentum.condition_met);
    }

    #[test]
    fn debounce_suppresses_rapid_retriggers() {
        let dir = tempfile::tempdir().unwrap();
        let agent = build_agent(dir.path());
        let view = entry_view();

        let first = agent.evaluate("SNDL", &view, Some(RuleKind::Entry));
        assert!(first.iter().any(|e| e.rule_id == "momentum_entry_1" && e.triggered));

        // Immediately after: condition still met, trigger suppressed.
        let second = agent.evaluate("SNDL", &view, Some(RuleKind::Entry));
        let momentum = second.iter().find(|e| e.rule_id == "momentum_entry_1").unwrap();
        assert!(momentum.condition_met);
        assert!(!momentum.triggered);
    }

    #[test]
    fn rule_disables_after_sustained_poor_accuracy() {
        let dir = tempfile::tempdir().unwrap();
        let agent = build_agent(dir.path());

        // 20 outcomes, 2 successes: accuracy 0.1 < 0.3.
        for i in 0..20 {
            agent.record_outcome("momentum_entry_1", "SNDL", i < 2, if i < 2 { 1.0 } else { -1.0 });
        }

        let rule = agent.rule("momentum_entry_1").unwrap();
        assert!(!rule.enabled);
        assert!((rule.accuracy - 0.1).abs() < 1e-9);

        // Disabled rules no longer evaluate.
        let evals = agent.evaluate("SNDL", &entry_view(), Some(RuleKind::Entry));
        assert!(!evals.iter().any(|e| e.rule_id == "momentum_entry_1"));
    }

    #[test]
    fn confidence_reflects_accuracy_and_priority() {
        let dir = tempfile::tempdir().unwrap();
        let agent = build_agent(dir.path());

        // 10 outcomes at 90% accuracy.
        for i in 0..10 {
            agent.record_outcome("oversold_entry_1", "SNDL", i < 9, 1.0);
        }
        let rule = agent.rule("oversold_entry_1").unwrap();
        let view = entry_view();
        let confidence = rule_confidence(&rule, &view);

        // 0.5 + (0.9-0.5)*0.4 + volume 0.06 + band 0.1 + priority 0.04 = 0.86
        assert!((confidence - 0.86).abs() < 1e-9);
    }

    #[test]
    fn operators_cover_the_full_set() {
        let dir = tempfile::tempdir().unwrap();
        let agent = build_agent(dir.path());

        let mut rule = agent.rule("volatility_1").unwrap();
        let view = MarketView::new().set("vix", 25.0).set("prev_vix", 35.0);

        rule.operator = RuleOperator::LessThan;
        rule.threshold = 30.0;
        assert!(apply_operator(&rule, 25.0, &view));

        rule.operator = RuleOperator::Between;
        rule.threshold = 20.0;
        rule.threshold_high = Some(28.0);
        assert!(apply_operator(&rule, 25.0, &view));
        assert!(!apply_operator(&rule, 35.0, &view));

        rule.operator = RuleOperator::CrossesBelow;
        rule.threshold = 30.0;
        rule.metric = "vix".to_string();
        // prev 35 >= 30 > 25: crossed below.
        assert!(apply_operator(&rule, 25.0, &view));

        rule.operator = RuleOperator::CrossesAbove;
        assert!(!apply_operator(&rule, 25.0, &view));
    }

    #[test]
    fn adaptive_rule_emerges_from_consistent_feature() {
        let dir = tempfile::tempdir().unwrap();
        let agent = build_agent(dir.path());

        // 12 patterns, 7 successes; volume_ratio tightly clustered around
        // 2.0 on the successful ones, skewed toward the top of its range.
        let mut patterns = Vec::new();
        let mut outcomes = Vec::new();
        for i in 0..12 {
            let success = i < 7;
            let mut pattern = serde_json::Map::new();
            let ratio = if success {
                if i < 3 { 2.0 } else { 2.1 }
            } else {
                0.5 + i as f64
            };
            pattern.insert("volume_ratio".to_string(), json!(ratio));
            patterns.push(pattern);
            outcomes.push(success);
        }

        let rule = agent.learn_adaptive_rule(&patterns, &outcomes).unwrap();
        assert_eq!(rule.kind, RuleKind::Entry);
        assert_eq!(rule.metric, "volume_ratio");
        assert_eq!(rule.operator, RuleOperator::GreaterThan);
        assert!(rule.enabled);
        // threshold = mean of successful ratios
        let expected = (3.0 * 2.0 + 4.0 * 2.1) / 7.0;
        assert!((rule.threshold - expected).abs() < 1e-9);

        // Exactly one adaptive rule was added.
        let adaptive: Vec<_> = agent
            .rules
            .read()
            .keys()
            .filter(|k| k.starts_with("adaptive_"))
            .cloned()
            .collect();
        assert_eq!(adaptive.len(), 1);
    }

    #[test]
    fn adaptive_rule_requires_enough_data() {
        let dir = tempfile::tempdir().unwrap();
        let agent = build_agent(dir.path());

        let pattern = |v: f64| {
            let mut m = serde_json::Map::new();
            m.insert("volume_ratio".to_string(), json!(v));
            m
        };

        // Too few patterns.
        let few: Vec<_> = (0..5).map(|_| pattern(2.0)).collect();
        assert!(agent.learn_adaptive_rule(&few, &[true; 5]).is_none());

        // Enough patterns, too few successes.
        let many: Vec<_> = (0..12).map(|_| pattern(2.0)).collect();
        let mut outcomes = vec![false; 12];
        outcomes[0] = true;
        assert!(agent.learn_adaptive_rule(&many, &outcomes).is_none());
    }

    #[test]
    fn adaptive_rules_rehydrate_on_restart() {
        let dir = tempfile::tempdir().unwrap();
        let deps = test_deps(dir.path());
        let learned_id = {
            let agent = RuleSetAgent::new(deps.clone());
            let mut patterns = Vec::new();
            let mut outcomes = Vec::new();
            for i in 0..12 {
                let mut m = serde_json::Map::new();
                m.insert("volume_ratio".to_string(), json!(2.0 + (i % 3) as f64 * 0.01));
                patterns.push(m);
                outcomes.push(i < 8);
            }
            agent.learn_adaptive_rule(&patterns, &outcomes).unwrap().id
        };

        let reborn = RuleSetAgent::new(deps);
        assert!(reborn.rule(&learned_id).is_some(), "rule should survive restart");
    }
}
