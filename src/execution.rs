// =============================================================================
// Paper Executor — simulated fills that close the learning loop
// =============================================================================
//
// The fabric emits decisions; a live execution collaborator is out of
// scope. In demo operation this executor stands in for it: executed buy
// decisions become simulated fills against the scraper's prices, open
// positions are marked to market every tick, and stop/target exits feed
// outcomes back to the coordinator so every contributing agent learns.
// =============================================================================

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{debug, info};
use uuid::Uuid;

use crate::agents::portfolio::{Fill, PortfolioTracker};
use crate::agents::scraper::StockScraper;
use crate::coordinator::{Coordinator, TradingDecision};
use crate::types::{TradeAction, TradeSide};

/// Paper capital backing simulated position sizing.
const PAPER_CAPITAL: f64 = 10_000.0;

/// Cadence of the mark-to-market / exit monitor.
const MONITOR_INTERVAL_SECS: u64 = 30;

pub struct PaperExecutor {
    portfolio: Arc<PortfolioTracker>,
    scraper: Arc<StockScraper>,
    coordinator: Arc<Coordinator>,
}

impl PaperExecutor {
    pub fn new(
        portfolio: Arc<PortfolioTracker>,
        scraper: Arc<StockScraper>,
        coordinator: Arc<Coordinator>,
    ) -> Self {
        Self {
            portfolio,
            scraper,
            coordinator,
        }
    }

    /// Turn an executed buy decision into a simulated fill. Hold and sell
    /// decisions, degenerate prices, and already-open symbols are skipped.
    pub fn execute_decision(&self, decision: &TradingDecision) {
        if decision.action != TradeAction::Buy || decision.entry_price <= 0.0 {
            return;
        }
        if self.portfolio.position(&decision.symbol).is_some() {
            debug!(symbol = %decision.symbol, "position already open; fill skipped");
            return;
        }

        let quantity = (PAPER_CAPITAL * decision.position_size) / decision.entry_price;
        if quantity <= 0.0 {
            return;
        }

        self.portfolio.apply_fill(&Fill {
            trade_id: Uuid::new_v4().to_string(),
            symbol: decision.symbol.clone(),
            side: TradeSide::Buy,
            quantity,
            price: decision.entry_price,
            fees: 0.0,
            strategy: decision
                .strategy
                .map(|s| s.to_string())
                .unwrap_or_else(|| "coordinated".to_string()),
            signal_id: None,
            stop_price: (decision.stop_loss > 0.0).then_some(decision.stop_loss),
            target_price: (decision.take_profit > 0.0).then_some(decision.take_profit),
        });

        info!(
            symbol = %decision.symbol,
            quantity,
            entry = decision.entry_price,
            stop = decision.stop_loss,
            target = decision.take_profit,
            "paper fill applied"
        );
    }

    /// One monitor pass: refresh marks from the scraper and close any
    /// position through its stop or target, feeding the outcome back.
    pub fn monitor_tick(&self) {
        for position in self.portfolio.open_positions() {
            let snapshot = self.scraper.snapshot_one(&position.symbol);
            self.portfolio.mark_to_market(&position.symbol, snapshot.price);

            let stop_hit = position
                .stop_price
                .map(|stop| snapshot.price <= stop)
                .unwrap_or(false);
            let target_hit = position
                .target_price
                .map(|target| snapshot.price >= target)
                .unwrap_or(false);
            if !stop_hit && !target_hit {
                continue;
            }

            let realized = self.portfolio.apply_fill(&Fill {
                trade_id: Uuid::new_v4().to_string(),
                symbol: position.symbol.clone(),
                side: TradeSide::Sell,
                quantity: position.quantity,
                price: snapshot.price,
                fees: 0.0,
                strategy: "exit".to_string(),
                signal_id: None,
                stop_price: None,
                target_price: None,
            });

            info!(
                symbol = %position.symbol,
                exit = snapshot.price,
                realized,
                reason = if target_hit { "target" } else { "stop" },
                "paper position closed"
            );
            self.coordinator
                .record_outcome(&position.symbol, realized > 0.0, realized);
        }
    }

    /// Background monitor loop; spawned once at startup.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = MONITOR_INTERVAL_SECS, "paper execution monitor started");
        let mut ticker = interval(Duration::from_secs(MONITOR_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.monitor_tick(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("paper execution monitor stopping");
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
    use crate::agents::rules::RuleSetAgent;
    use crate::agents::strategy::StrategyAgent;
    use crate::agents::timing::TimingAgent;
    use crate::bus::{AgentsOut, InputRouter};
    use crate::config::RuntimeConfig;
    use crate::ledger::MetadataLedger;
    use crate::memory::test_store;
    use crate::types::StrategyKind;

    fn build(dir: &std::path::Path) -> (PaperExecutor, Arc<PortfolioTracker>, Arc<Coordinator>) {
        let (memory, ledger) = test_store(dir);
        let router = Arc::new(InputRouter::new(memory.clone()));
        let fanout = Arc::new(AgentsOut::new(dir, memory.clone(), ledger.clone(), router.clone()));
        let deps = AgentDeps {
            memory,
            router,
            fanout,
        };

        let watchlist = vec!["SNDL".to_string()];
        let scraper = Arc::new(StockScraper::new(deps.clone(), ledger.clone(), watchlist.clone()));
        let strategy = Arc::new(StrategyAgent::new(
            deps.clone(),
            scraper.clone(),
            ledger,
            watchlist.clone(),
        ));
        let timing = Arc::new(TimingAgent::new(deps.clone()));
        let rules = Arc::new(RuleSetAgent::new(deps.clone()));
        let portfolio = Arc::new(PortfolioTracker::new(deps.clone()));

        let mut config = RuntimeConfig::default();
        config.watchlist = watchlist;
        let coordinator = Arc::new(Coordinator::new(
            deps,
            &config,
            strategy,
            timing,
            rules,
            portfolio.clone(),
            scraper.clone(),
        ));

        (
            PaperExecutor::new(portfolio.clone(), scraper, coordinator.clone()),
            portfolio,
            coordinator,
        )
    }

    fn buy_decision(symbol: &str, entry: f64, stop: f64, target: f64) -> TradingDecision {
        TradingDecision::new(
            symbol,
            TradeAction::Buy,
            0.85,
            0.04,
            entry,
            stop,
            target,
            vec!["strategy".to_string()],
            vec![],
            Some(StrategyKind::Momentum),
            0.4,
            String::new(),
        )
    }

    #[test]
    fn buy_decision_becomes_a_position() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, portfolio, _coordinator) = build(dir.path());

        executor.execute_decision(&buy_decision("SNDL", 2.0, 1.9, 2.4));

        let position = portfolio.position("SNDL").unwrap();
        // quantity = 10_000 * 0.04 / 2.0
        assert!((position.quantity - 200.0).abs() < 1e-9);
        assert_eq!(position.stop_price, Some(1.9));
    }

    #[test]
    fn hold_decisions_and_duplicates_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, portfolio, _coordinator) = build(dir.path());

        let mut hold = buy_decision("SNDL", 2.0, 1.9, 2.4);
        hold.action = TradeAction::Hold;
        executor.execute_decision(&hold);
        assert!(portfolio.position("SNDL").is_none());

        executor.execute_decision(&buy_decision("SNDL", 2.0, 1.9, 2.4));
        let before = portfolio.position("SNDL").unwrap().quantity;
        executor.execute_decision(&buy_decision("SNDL", 2.0, 1.9, 2.4));
        assert!((portfolio.position("SNDL").unwrap().quantity - before).abs() < 1e-12);
    }

    #[test]
    fn monitor_closes_through_stop_and_reports_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, portfolio, coordinator) = build(dir.path());

        // A stop above any plausible simulated price forces the exit on
        // the first monitor pass.
        let decision = buy_decision("SNDL", 1_000.0, 999.0, 2_000.0);
        coordinator.insert_executed(decision.clone());
        executor.execute_decision(&decision);
        assert!(portfolio.position("SNDL").is_some());

        executor.monitor_tick();

        assert!(portfolio.position("SNDL").is_none(), "stop should close the position");
        // Outcome flowed back: the executed decision was consumed and the
        // coordinator counters moved.
        assert!(coordinator.executed_decision("SNDL").is_none());
        assert_eq!(coordinator.core().counters().decisions_made, 1);
        assert_eq!(coordinator.core().counters().failed, 1);
    }
}
