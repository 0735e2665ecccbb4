// =============================================================================
// Stock Scraper — on-demand market snapshots from a simulated source
// =============================================================================
//
// Snapshots are self-consistent: per-symbol timestamps are strictly
// monotonic and every snapshot is flagged `data_source = "simulation"`.
// The simulation is a seeded bounded random walk (seed = SHA-256 of the
// symbol), so runs are reproducible for a fixed symbol set.
//
// Each produced snapshot is mirrored into the market_snapshots ledger
// table, and a rolling in-memory bar history serves the Strategy Agent's
// indicator math.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ledger::{MetadataLedger, SnapshotRow};
use crate::types::Bar;

use super::base::{Agent, AgentCore, AgentDeps};

/// Rolling bar history cap per symbol.
const HISTORY_CAP: usize = 500;
/// Bar interval for the simulated feed (one minute).
const BAR_INTERVAL_MS: i64 = 60_000;
/// Background refresh cadence for the watchlist.
const REFRESH_INTERVAL_SECS: u64 = 30;

/// One self-consistent market snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub price: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub rsi_14: Option<f64>,
    pub sma_20: Option<f64>,
    pub volume_ratio: Option<f64>,
    pub data_source: String,
    pub ts: DateTime<Utc>,
}

/// Per-symbol simulation state.
struct SymbolSim {
    rng: ChaCha8Rng,
    history: Vec<Bar>,
    last_ts: i64,
}

impl SymbolSim {
    fn new(symbol: &str, start_ts: i64) -> Self {
        let digest = Sha256::digest(symbol.as_bytes());
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&digest);
        let mut rng = ChaCha8Rng::from_seed(seed);

        // Penny-stock price band seeded from the symbol: $0.50 – $8.00.
        let start_price = 0.5 + rng.gen::<f64>() * 7.5;
        let base_volume = 200_000.0 + rng.gen::<f64>() * 2_800_000.0;

        let mut sim = Self {
            rng,
            history: Vec::with_capacity(HISTORY_CAP),
            last_ts: start_ts,
        };
        sim.seed_history(start_price, base_volume);
        sim
    }

    /// Warm up enough history for the longest indicator window.
    fn seed_history(&mut self, start_price: f64, base_volume: f64) {
        let mut price = start_price;
        for _ in 0..60 {
            let bar = self.next_bar_from(price, base_volume);
            price = bar.close;
            self.push(bar);
        }
    }

    fn base_volume(&self) -> f64 {
        // Recover a stable volume base from recent history.
        if self.history.is_empty() {
            1_000_000.0
        } else {
            let sum: f64 = self.history.iter().rev().take(20).map(|b| b.volume).sum();
            sum / self.history.iter().rev().take(20).count() as f64
        }
    }

    fn next_bar(&mut self) -> Bar {
        let price = self.history.last().map(|b| b.close).unwrap_or(1.0);
        let base_volume = self.base_volume();
        let bar = self.next_bar_from(price, base_volume);
        self.push(bar.clone());
        bar
    }

    fn next_bar_from(&mut self, prev_close: f64, base_volume: f64) -> Bar {
        // Bounded random walk: ±2% per bar with occasional volume bursts.
        let pct = (self.rng.gen::<f64>() - 0.5) * 0.04;
        let open = prev_close;
        let close = (prev_close * (1.0 + pct)).max(0.05);
        let spread = (self.rng.gen::<f64>() * 0.01 + 0.002) * close;
        let high = open.max(close) + spread;
        let low = (open.min(close) - spread).max(0.01);

        let burst = if self.rng.gen::<f64>() < 0.05 { 5.0 } else { 1.0 };
        let volume = base_volume * (0.5 + self.rng.gen::<f64>()) * burst;

        self.last_ts += BAR_INTERVAL_MS;
        Bar {
            ts: self.last_ts,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    fn push(&mut self, bar: Bar) {
        self.history.push(bar);
        if self.history.len() > HISTORY_CAP {
            let excess = self.history.len() - HISTORY_CAP;
            self.history.drain(..excess);
        }
    }
}

pub struct StockScraper {
    core: AgentCore,
    ledger: Arc<MetadataLedger>,
    sims: RwLock<HashMap<String, SymbolSim>>,
    /// Symbols refreshed by the background loop.
    watchlist: Vec<String>,
}

impl StockScraper {
    pub const NAME: &'static str = "stock_scraper";

    pub fn new(deps: AgentDeps, ledger: Arc<MetadataLedger>, watchlist: Vec<String>) -> Self {
        Self {
            core: AgentCore::new(Self::NAME, "data", deps),
            ledger,
            sims: RwLock::new(HashMap::new()),
            watchlist,
        }
    }

    /// Produce one fresh snapshot per requested symbol.
    pub fn snapshot(&self, symbols: &[String]) -> Vec<MarketSnapshot> {
        symbols.iter().map(|symbol| self.snapshot_one(symbol)).collect()
    }

    pub fn snapshot_one(&self, symbol: &str) -> MarketSnapshot {
        let mut sims = self.sims.write();
        let sim = sims
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolSim::new(symbol, Utc::now().timestamp_millis()));

        let bar = sim.next_bar();
        let closes: Vec<f64> = sim.history.iter().map(|b| b.close).collect();
        let volumes: Vec<f64> = sim.history.iter().map(|b| b.volume).collect();

        let rsi_14 = crate::indicators::rsi(&closes, 14);
        let sma_20 = crate::indicators::sma(&closes, 20);
        let volume_ratio = if volumes.len() >= 20 {
            let avg: f64 = volumes[volumes.len() - 20..].iter().sum::<f64>() / 20.0;
            (avg > 0.0).then(|| bar.volume / avg)
        } else {
            None
        };

        let snapshot = MarketSnapshot {
            symbol: symbol.to_string(),
            price: bar.close,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
            rsi_14,
            sma_20,
            volume_ratio,
            data_source: "simulation".to_string(),
            ts: Utc.timestamp_millis_opt(bar.ts).single().unwrap_or_else(Utc::now),
        };

        if let Err(e) = self.ledger.insert_snapshot(&SnapshotRow {
            id: Uuid::new_v4().to_string(),
            symbol: snapshot.symbol.clone(),
            timeframe: "1m".to_string(),
            open: snapshot.open,
            high: snapshot.high,
            low: snapshot.low,
            close: snapshot.close,
            volume: snapshot.volume,
            indicators: json!({
                "rsi_14": snapshot.rsi_14,
                "sma_20": snapshot.sma_20,
                "volume_ratio": snapshot.volume_ratio,
                "data_source": snapshot.data_source,
            }),
            created_at: snapshot.ts,
        }) {
            warn!(symbol, error = %e, "snapshot ledger write failed");
        }

        snapshot
    }

    /// Rolling bar history for a symbol, oldest first. Generates warm-up
    /// history on first touch.
    pub fn history(&self, symbol: &str, bars: usize) -> Vec<Bar> {
        let mut sims = self.sims.write();
        let sim = sims
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolSim::new(symbol, Utc::now().timestamp_millis()));
        let len = sim.history.len();
        sim.history[len.saturating_sub(bars)..].to_vec()
    }

    /// Penny-stock mover scan: symbols whose latest simulated snapshot is
    /// at or below `max_price` with volume at or above `min_volume`.
    pub fn scan_for_movers(&self, max_price: f64, min_volume: f64) -> Vec<String> {
        self.watchlist
            .iter()
            .filter(|symbol| {
                let snap = self.snapshot_one(symbol);
                snap.price <= max_price && snap.volume >= min_volume
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Agent for StockScraper {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn process(&self, mut shutdown: watch::Receiver<bool>) {
        info!(symbols = self.watchlist.len(), "stock scraper loop started");
        let mut ticker = interval(Duration::from_secs(REFRESH_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.core.heartbeat();
                    self.core.drain_inbox();
                    let snapshots = self.snapshot(&self.watchlist);
                    let movers = self.scan_for_movers(5.0, 500_000.0);
                    debug!(
                        count = snapshots.len(),
                        movers = movers.len(),
                        "watchlist snapshots refreshed"
                    );
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("stock scraper loop stopping");
                        break;
                    }
                }
            }
        }
    }
}
