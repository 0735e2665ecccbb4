// =============================================================================
// Portfolio Tracker — open positions, fills, and P&L accounting
// =============================================================================
//
// Accepts fills from the execution collaborator and maintains one open
// position per symbol: buys open or extend (average price), sells reduce
// or close (realized P&L lands on the same position before it flips to
// closed). Every mutation is emitted as a `position` event through the
// fan-out, which mirrors the ledger row.
//
// Invariant: an open position always has quantity > 0.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{AgentEvent, AgentMessage, EventPayload};
use crate::ledger::PositionRow;
use crate::types::{PositionStatus, TradeSide, TradeStatus};

use super::base::{Agent, AgentCore, AgentDeps};

const TICK_INTERVAL_SECS: u64 = 30;

/// An executed trade delivered by the execution collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct Fill {
    pub trade_id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: f64,
    pub price: f64,
    pub fees: f64,
    pub strategy: String,
    pub signal_id: Option<String>,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
}

/// Realized/unrealized P&L totals.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PnlSummary {
    pub realized: f64,
    pub unrealized: f64,
}

pub struct PortfolioTracker {
    core: AgentCore,
    /// Open positions keyed by symbol — the unique-open-per-symbol key.
    open: RwLock<HashMap<String, PositionRow>>,
    realized_total: RwLock<f64>,
}

impl PortfolioTracker {
    pub const NAME: &'static str = "portfolio_tracker";

    pub fn new(deps: AgentDeps) -> Self {
        Self {
            core: AgentCore::new(Self::NAME, "portfolio", deps),
            open: RwLock::new(HashMap::new()),
            realized_total: RwLock::new(0.0),
        }
    }

    // -------------------------------------------------------------------------
    // Fills
    // -------------------------------------------------------------------------

    /// Apply an executed fill to the book. Returns the realized P&L of the
    /// fill (non-zero only when reducing or closing).
    pub fn apply_fill(&self, fill: &Fill) -> f64 {
        if fill.quantity <= 0.0 || fill.price <= 0.0 {
            warn!(symbol = %fill.symbol, quantity = fill.quantity, price = fill.price, "ignoring degenerate fill");
            return 0.0;
        }

        let (position, realized) = {
            let mut open = self.open.write();
            match fill.side {
                TradeSide::Buy => {
                    let now = Utc::now();
                    let position = open
                        .entry(fill.symbol.clone())
                        .and_modify(|p| {
                            // Extend: volume-weighted average entry.
                            let total_cost = p.avg_price * p.quantity + fill.price * fill.quantity;
                            p.quantity += fill.quantity;
                            p.avg_price = total_cost / p.quantity;
                            p.current_price = fill.price;
                            p.updated_at = now;
                            if fill.stop_price.is_some() {
                                p.stop_price = fill.stop_price;
                            }
                            if fill.target_price.is_some() {
                                p.target_price = fill.target_price;
                            }
                        })
                        .or_insert_with(|| PositionRow {
                            id: Uuid::new_v4().to_string(),
                            symbol: fill.symbol.clone(),
                            quantity: fill.quantity,
                            avg_price: fill.price,
                            current_price: fill.price,
                            unrealized_pnl: 0.0,
                            realized_pnl: 0.0,
                            stop_price: fill.stop_price,
                            target_price: fill.target_price,
                            status: PositionStatus::Open,
                            created_at: now,
                            updated_at: now,
                        });
                    Self::refresh_unrealized(position);
                    (position.clone(), 0.0)
                }
                TradeSide::Sell => {
                    let Some(mut position) = open.remove(&fill.symbol) else {
                        warn!(symbol = %fill.symbol, "sell fill with no open position ignored");
                        return 0.0;
                    };

                    let close_qty = fill.quantity.min(position.quantity);
                    let realized = (fill.price - position.avg_price) * close_qty - fill.fees;
                    position.realized_pnl += realized;
                    position.quantity -= close_qty;
                    position.current_price = fill.price;
                    position.updated_at = Utc::now();

                    if position.quantity > 0.0 {
                        Self::refresh_unrealized(&mut position);
                        open.insert(fill.symbol.clone(), position.clone());
                    } else {
                        position.quantity = 0.0;
                        position.unrealized_pnl = 0.0;
                        position.status = PositionStatus::Closed;
                    }

                    *self.realized_total.write() += realized;
                    (position, realized)
                }
            }
        };

        info!(
            symbol = %fill.symbol,
            side = %fill.side,
            quantity = fill.quantity,
            price = fill.price,
            realized,
            status = %position.status,
            "fill applied"
        );

        self.emit_trade(fill);
        self.emit_position(&position);
        realized
    }

    /// Update the mark for a symbol and recompute unrealized P&L.
    pub fn mark_to_market(&self, symbol: &str, price: f64) {
        if price <= 0.0 {
            return;
        }
        let updated = {
            let mut open = self.open.write();
            match open.get_mut(symbol) {
                Some(position) => {
                    position.current_price = price;
                    position.updated_at = Utc::now();
                    Self::refresh_unrealized(position);
                    Some(position.clone())
                }
                None => None,
            }
        };
        if let Some(position) = updated {
            debug!(symbol, price, unrealized = position.unrealized_pnl, "marked to market");
            self.emit_position(&position);
        }
    }

    pub fn open_positions(&self) -> Vec<PositionRow> {
        self.open.read().values().cloned().collect()
    }

    pub fn position(&self, symbol: &str) -> Option<PositionRow> {
        self.open.read().get(symbol).cloned()
    }

    pub fn pnl_summary(&self) -> PnlSummary {
        let unrealized = self.open.read().values().map(|p| p.unrealized_pnl).sum();
        PnlSummary {
            realized: *self.realized_total.read(),
            unrealized,
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn refresh_unrealized(position: &mut PositionRow) {
        position.unrealized_pnl =
            (position.current_price - position.avg_price) * position.quantity;
    }

    fn emit_trade(&self, fill: &Fill) {
        self.core.fanout().emit(AgentEvent::new(
            Self::NAME,
            EventPayload::Trade {
                trade_id: fill.trade_id.clone(),
                symbol: fill.symbol.clone(),
                side: fill.side,
                quantity: fill.quantity,
                price: fill.price,
                pnl: 0.0,
                fees: fill.fees,
                strategy: fill.strategy.clone(),
                signal_id: fill.signal_id.clone(),
                status: TradeStatus::Executed,
            },
        ));
    }

    fn emit_position(&self, position: &PositionRow) {
        self.core.fanout().emit(AgentEvent::new(
            Self::NAME,
            EventPayload::Position {
                position_id: position.id.clone(),
                symbol: position.symbol.clone(),
                quantity: position.quantity,
                avg_price: position.avg_price,
                current_price: position.current_price,
                unrealized_pnl: position.unrealized_pnl,
                realized_pnl: position.realized_pnl,
                stop_price: position.stop_price,
                target_price: position.target_price,
                status: position.status,
            },
        ));
    }
}

#[async_trait]
impl Agent for PortfolioTracker {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn process(&self, mut shutdown: watch::Receiver<bool>) {
        info!("portfolio tracker loop started");
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
                        info!("portfolio tracker loop stopping");
                        break;
                    }
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::base::AgentDeps;
    use crate::bus::{AgentsOut, InputRouter};
    use crate::ledger::MetadataLedger;
    use crate::memory::test_store;
    use std::sync::Arc;

    fn build(dir: &std::path::Path) -> (PortfolioTracker, Arc<MetadataLedger>) {
        let (memory, ledger) = test_store(dir);
        let router = Arc::new(InputRouter::new(memory.clone()));
        let fanout = Arc::new(AgentsOut::new(dir, memory.clone(), ledger.clone(), router.clone()));
        let deps = AgentDeps {
            memory,
            router,
            fanout,
        };
        (PortfolioTracker::new(deps), ledger)
    }

    fn buy(symbol: &str, quantity: f64, price: f64) -> Fill {
        Fill {
            trade_id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side: TradeSide::Buy,
            quantity,
            price,
            fees: 0.0,
            strategy: "momentum".to_string(),
            signal_id: None,
            stop_price: Some(price * 0.97),
            target_price: Some(price * 1.05),
        }
    }

    fn sell(symbol: &str, quantity: f64, price: f64) -> Fill {
        Fill {
            trade_id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side: TradeSide::Sell,
            quantity,
            price,
            fees: 0.0,
            strategy: "momentum".to_string(),
            signal_id: None,
            stop_price: None,
            target_price: None,
        }
    }

    #[test]
    fn buy_opens_position_with_quantity() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, _ledger) = build(dir.path());

        tracker.apply_fill(&buy("SNDL", 100.0, 2.0));

        let position = tracker.position("SNDL").unwrap();
        assert_eq!(position.status, PositionStatus::Open);
        assert!(position.quantity > 0.0);
        assert!((position.avg_price - 2.0).abs() < 1e-12);
    }

    #[test]
    fn second_buy_averages_entry_price() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, _ledger) = build(dir.path());

        tracker.apply_fill(&buy("SNDL", 100.0, 2.0));
        tracker.apply_fill(&buy("SNDL", 100.0, 3.0));

        let position = tracker.position("SNDL").unwrap();
        assert!((position.quantity - 200.0).abs() < 1e-12);
        assert!((position.avg_price - 2.5).abs() < 1e-12);
    }

    #[test]
    fn partial_sell_realizes_pnl_and_keeps_position_open() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, _ledger) = build(dir.path());

        tracker.apply_fill(&buy("SNDL", 100.0, 2.0));
        let realized = tracker.apply_fill(&sell("SNDL", 40.0, 2.5));

        assert!((realized - 20.0).abs() < 1e-9);
        let position = tracker.position("SNDL").unwrap();
        assert_eq!(position.status, PositionStatus::Open);
        assert!((position.quantity - 60.0).abs() < 1e-12);
        assert!((position.realized_pnl - 20.0).abs() < 1e-9);
    }

    #[test]
    fn full_sell_closes_position_with_realized_pnl() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, _ledger) = build(dir.path());

        tracker.apply_fill(&buy("SNDL", 100.0, 2.0));
        let realized = tracker.apply_fill(&sell("SNDL", 100.0, 1.8));

        assert!((realized + 20.0).abs() < 1e-9);
        assert!(tracker.position("SNDL").is_none());
        assert!(tracker.open_positions().is_empty());
        let summary = tracker.pnl_summary();
        assert!((summary.realized + 20.0).abs() < 1e-9);
    }

    #[test]
    fn mark_to_market_updates_unrealized() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, _ledger) = build(dir.path());

        tracker.apply_fill(&buy("SNDL", 100.0, 2.0));
        tracker.mark_to_market("SNDL", 2.3);

        let summary = tracker.pnl_summary();
        assert!((summary.unrealized - 30.0).abs() < 1e-9);

        // Unknown symbols and bad prices are no-ops.
        tracker.mark_to_market("GHOST", 10.0);
        tracker.mark_to_market("SNDL", 0.0);
        let summary = tracker.pnl_summary();
        assert!((summary.unrealized - 30.0).abs() < 1e-9);
    }

    #[test]
    fn sell_without_position_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, _ledger) = build(dir.path());

        let realized = tracker.apply_fill(&sell("GHOST", 10.0, 5.0));
        assert_eq!(realized, 0.0);
        assert!(tracker.open_positions().is_empty());
    }

    #[test]
    fn fills_mirror_into_ledger_rows_via_fanout() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, ledger) = build(dir.path());

        tracker.apply_fill(&buy("SNDL", 100.0, 2.0));

        // Trade row and position row both land through the fan-out.
        assert_eq!(ledger.recent_trades(10).unwrap().len(), 1);
        assert!(ledger.open_position("SNDL").unwrap().is_some());

        tracker.apply_fill(&sell("SNDL", 100.0, 2.4));
        assert!(ledger.open_position("SNDL").unwrap().is_none());
    }
}
