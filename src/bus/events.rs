// =============================================================================
// Agent Events — the closed set of emissions agents push through the bus
// =============================================================================
//
// Payloads are tagged variants rather than free-form maps: the fan-out
// classifies on the tag, and unknown tags arrive as `Other` and are logged
// rather than dropped.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::memory::record::MemoryRecord;
use crate::types::{PositionStatus, TradeAction, TradeSide, TradeStatus};

/// Severity attached to error events; feeds the importance formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Classification buckets used for routing and importance scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventClass {
    Signal,
    Trade,
    Position,
    Strategy,
    Performance,
    Error,
    CoordinationDecision,
    Status,
    Other,
}

impl std::fmt::Display for EventClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signal => write!(f, "signal"),
            Self::Trade => write!(f, "trade"),
            Self::Position => write!(f, "position"),
            Self::Strategy => write!(f, "strategy"),
            Self::Performance => write!(f, "performance"),
            Self::Error => write!(f, "error"),
            Self::CoordinationDecision => write!(f, "coordination_decision"),
            Self::Status => write!(f, "status"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Tagged event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Signal {
        signal_id: String,
        symbol: String,
        strategy: String,
        confidence: f64,
        price: f64,
        volume: f64,
        timeframe: String,
        indicators: Value,
    },
    Trade {
        trade_id: String,
        symbol: String,
        side: TradeSide,
        quantity: f64,
        price: f64,
        pnl: f64,
        fees: f64,
        strategy: String,
        signal_id: Option<String>,
        status: TradeStatus,
    },
    Position {
        position_id: String,
        symbol: String,
        quantity: f64,
        avg_price: f64,
        current_price: f64,
        unrealized_pnl: f64,
        realized_pnl: f64,
        stop_price: Option<f64>,
        target_price: Option<f64>,
        status: PositionStatus,
    },
    Strategy {
        name: String,
        details: Value,
    },
    Performance {
        name: String,
        details: Value,
    },
    Error {
        message: String,
        severity: ErrorSeverity,
        context: Value,
    },
    CoordinationDecision {
        decision_id: String,
        symbol: String,
        action: TradeAction,
        confidence: f64,
        position_size: f64,
        risk_score: f64,
        contributing_agents: Vec<String>,
    },
    Status {
        agent: String,
        state: String,
        details: Value,
    },
    Other {
        tag: String,
        details: Value,
    },
}

impl EventPayload {
    pub fn class(&self) -> EventClass {
        match self {
            Self::Signal { .. } => EventClass::Signal,
            Self::Trade { .. } => EventClass::Trade,
            Self::Position { .. } => EventClass::Position,
            Self::Strategy { .. } => EventClass::Strategy,
            Self::Performance { .. } => EventClass::Performance,
            Self::Error { .. } => EventClass::Error,
            Self::CoordinationDecision { .. } => EventClass::CoordinationDecision,
            Self::Status { .. } => EventClass::Status,
            Self::Other { .. } => EventClass::Other,
        }
    }

    /// Confidence carried by the payload, when the class has one.
    pub fn confidence(&self) -> Option<f64> {
        match self {
            Self::Signal { confidence, .. } | Self::CoordinationDecision { confidence, .. } => {
                Some(*confidence)
            }
            _ => None,
        }
    }

    pub fn price(&self) -> Option<f64> {
        match self {
            Self::Signal { price, .. } | Self::Trade { price, .. } => Some(*price),
            Self::Position { current_price, .. } => Some(*current_price),
            _ => None,
        }
    }

    pub fn volume(&self) -> Option<f64> {
        match self {
            Self::Signal { volume, .. } => Some(*volume),
            _ => None,
        }
    }

    pub fn symbol(&self) -> Option<&str> {
        match self {
            Self::Signal { symbol, .. }
            | Self::Trade { symbol, .. }
            | Self::Position { symbol, .. }
            | Self::CoordinationDecision { symbol, .. } => Some(symbol),
            _ => None,
        }
    }
}

/// One emission from one agent, in the order emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub id: String,
    /// Name of the emitting agent.
    pub source: String,
    pub payload: EventPayload,
    pub emitted_at: DateTime<Utc>,
    /// Stamped by the fan-out when the event is ingested.
    pub processed_at: Option<DateTime<Utc>>,
}

impl AgentEvent {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            payload,
            emitted_at: Utc::now(),
            processed_at: None,
        }
    }

    pub fn class(&self) -> EventClass {
        self.payload.class()
    }
}

/// Messages delivered into a registered agent's inbox.
#[derive(Debug, Clone)]
pub enum AgentMessage {
    /// Fan-out notification that a peer emitted something relevant.
    EventNotification {
        class: EventClass,
        event_id: String,
        source: String,
        summary: String,
    },
    /// A ranked memory slice delivered by the input router.
    MemorySlice {
        query_type: String,
        records: Vec<MemoryRecord>,
    },
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_tag_roundtrips() {
        let payload = EventPayload::Signal {
            signal_id: "s-1".to_string(),
            symbol: "AAPL".to_string(),
            strategy: "momentum".to_string(),
            confidence: 0.82,
            price: 150.0,
            volume: 2_000_000.0,
            timeframe: "1d".to_string(),
            indicators: json!({"rsi": 72.0}),
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "signal");

        let back: EventPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back.class(), EventClass::Signal);
        assert_eq!(back.confidence(), Some(0.82));
    }

    #[test]
    fn unknown_work_rides_in_other() {
        let payload = EventPayload::Other {
            tag: "vendor_specific".to_string(),
            details: json!({"anything": true}),
        };
        assert_eq!(payload.class(), EventClass::Other);
        assert!(payload.confidence().is_none());
    }

    #[test]
    fn event_stamps_id_and_emitted_at() {
        let event = AgentEvent::new(
            "strategy_agent",
            EventPayload::Status {
                agent: "strategy_agent".to_string(),
                state: "active".to_string(),
                details: json!({}),
            },
        );
        assert!(!event.id.is_empty());
        assert!(event.processed_at.is_none());
        assert_eq!(event.class(), EventClass::Status);
    }
}
