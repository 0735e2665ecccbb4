// =============================================================================
// Memory Record — the atomic unit of associative memory
// =============================================================================
//
// A record is append-only: edits are new records. The metadata contract
// guarantees `content_type`, `source` and a clamped `importance_score` on
// every record; type-specific fields are additive via `extra`.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known `content_type` values. The set is open: unknown types are
/// stored as-is and simply never match typed retrieval filters.
pub mod content_types {
    pub const TRADING_SIGNAL: &str = "trading_signal";
    pub const TRADE_EXECUTION: &str = "trade_execution";
    pub const COORDINATION_DECISION: &str = "coordination_decision";
    pub const COORDINATION_OUTCOME: &str = "coordination_outcome";
    pub const LEARNING_EXPERIENCE: &str = "learning_experience";
    pub const RULE_EVALUATION: &str = "rule_evaluation";
    pub const RULE_PERFORMANCE: &str = "rule_performance";
    pub const TIMING_ANALYSIS: &str = "timing_analysis";
    pub const TIMING_OUTCOME: &str = "timing_outcome";
    pub const MARKET_ANALYSIS: &str = "market_analysis";
    pub const SYSTEM_METRICS: &str = "system_metrics";
    pub const AGENT_DATA_TRANSFER: &str = "agent_data_transfer";
    pub const STATUS_UPDATE: &str = "status_update";
    pub const ADAPTIVE_RULE: &str = "adaptive_rule";
    pub const HEALTH_CHECK: &str = "health_check";
    pub const ERROR_PATTERN: &str = "error_pattern";
    pub const STRATEGY_PERFORMANCE: &str = "strategy_performance";
}

/// Metadata attached to every memory record.
///
/// `content_type`, `source` and `importance_score` are always present;
/// everything else rides in `extra` and round-trips untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryMetadata {
    pub content_type: String,
    /// Name of the emitting agent.
    pub source: String,
    /// Importance in [0, 1]; clamped on construction.
    pub importance_score: f64,
    /// Type-specific additive fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl MemoryMetadata {
    pub fn new(
        content_type: impl Into<String>,
        source: impl Into<String>,
        importance_score: f64,
    ) -> Self {
        Self {
            content_type: content_type.into(),
            source: source.into(),
            importance_score: importance_score.clamp(0.0, 1.0),
            extra: serde_json::Map::new(),
        }
    }

    /// Attach a type-specific field. Values are arbitrary JSON.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Read a type-specific field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }
}

/// A single associative memory record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique identifier, never reused (UUID v4).
    pub id: String,
    /// Source text the vector was derived from.
    pub content: String,
    /// Dense vector; length always equals the configured dimension.
    pub vector: Vec<f32>,
    pub metadata: MemoryMetadata,
    pub created_at: DateTime<Utc>,
}

impl MemoryRecord {
    pub fn importance(&self) -> f64 {
        self.metadata.importance_score
    }

    pub fn content_type(&self) -> &str {
        &self.metadata.content_type
    }

    pub fn source(&self) -> &str {
        &self.metadata.source
    }
}
