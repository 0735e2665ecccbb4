// =============================================================================
// Runtime Configuration — Hot-reloadable fabric settings with atomic save
// =============================================================================
//
// Central configuration hub for the Quorum trading fabric.  Every tunable
// parameter lives here so that the fabric can be reconfigured without a
// rebuild.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// Validation happens at load time: a config that parses but carries
// unusable values (zero embedding dimension, empty watchlist, all-zero
// agent weights) is rejected as `ConfigInvalid` and the process refuses
// to serve.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::CoreError;
use crate::types::CoordinationMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_embedding_model() -> String {
    "hash-v1".to_string()
}

fn default_embedding_dimension() -> usize {
    384
}

fn default_retention_max_records() -> usize {
    10_000
}

fn default_retention_max_age_hours() -> i64 {
    720
}

fn default_retention_min_age_minutes() -> i64 {
    60
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./quorum_data")
}

fn default_scan_interval_secs() -> u64 {
    300
}

fn default_max_risk_per_trade() -> f64 {
    0.05
}

fn default_max_concurrent_tasks() -> usize {
    10
}

fn default_phase_timeout_secs() -> u64 {
    30
}

fn default_watchlist() -> Vec<String> {
    vec![
        "AAPL".to_string(),
        "MSFT".to_string(),
        "TSLA".to_string(),
        "NVDA".to_string(),
        "SPY".to_string(),
        "QQQ".to_string(),
    ]
}

fn default_agent_weights() -> HashMap<String, f64> {
    let mut weights = HashMap::new();
    weights.insert("memory".to_string(), 0.10);
    weights.insert("timing".to_string(), 0.20);
    weights.insert("strategy".to_string(), 0.25);
    weights.insert("rules".to_string(), 0.20);
    weights.insert("runtime".to_string(), 0.10);
    weights.insert("market_data".to_string(), 0.05);
    weights.insert("portfolio".to_string(), 0.05);
    weights.insert("signals".to_string(), 0.05);
    weights
}

// =============================================================================
// Vector backend selection
// =============================================================================

/// Primary vector backend for the memory store.
///
/// `Chroma` names an external vector service; this build has no transport
/// for it, so selecting it degrades to `Local` with a single observable
/// degradation event (see `memory`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorBackend {
    Chroma,
    Local,
}

impl Default for VectorBackend {
    fn default() -> Self {
        Self::Local
    }
}

impl std::fmt::Display for VectorBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chroma => write!(f, "chromadb"),
            Self::Local => write!(f, "local"),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Quorum fabric.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Memory store --------------------------------------------------------

    /// Embedding model identifier. Only the built-in deterministic hash
    /// encoder (`hash-v1`) ships with this build; any other name falls back
    /// to it and reports a degradation.
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Dimension of stored vectors. Must match every vector in the store.
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,

    /// Maximum number of records retained by the compactor.
    #[serde(default = "default_retention_max_records")]
    pub retention_max_records: usize,

    /// Maximum record age in hours before the compactor may evict it.
    #[serde(default = "default_retention_max_age_hours")]
    pub retention_max_age_hours: i64,

    /// Records younger than this are never evicted, regardless of pressure.
    #[serde(default = "default_retention_min_age_minutes")]
    pub retention_min_age_minutes: i64,

    /// Primary vector backend.
    #[serde(default)]
    pub vector_backend: VectorBackend,

    // --- Persistence ---------------------------------------------------------

    /// Root directory for metadata.db, local_index/, logs/ and the
    /// append-only event logs.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    // --- Coordination --------------------------------------------------------

    /// Cycle cadence in seconds for the `start` command.
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    /// Global cap on any single position size, applied after mode caps.
    #[serde(default = "default_max_risk_per_trade")]
    pub max_risk_per_trade: f64,

    /// Coordinator operating mode.
    #[serde(default)]
    pub coordination_mode: CoordinationMode,

    /// Per-source synthesis weights. Re-normalised to sum 1.0 at load.
    #[serde(default = "default_agent_weights")]
    pub agent_weights: HashMap<String, f64>,

    /// Per-phase timeout in seconds for the coordinator pipeline.
    #[serde(default = "default_phase_timeout_secs")]
    pub phase_timeout_secs: u64,

    /// Symbols the coordinator considers each cycle.
    #[serde(default = "default_watchlist")]
    pub watchlist: Vec<String>,

    // --- Runtime agent -------------------------------------------------------

    /// Initial cap on concurrently executing runtime tasks (adaptive 2–20).
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            embedding_model: default_embedding_model(),
            embedding_dimension: default_embedding_dimension(),
            retention_max_records: default_retention_max_records(),
            retention_max_age_hours: default_retention_max_age_hours(),
            retention_min_age_minutes: default_retention_min_age_minutes(),
            vector_backend: VectorBackend::default(),
            data_dir: default_data_dir(),
            scan_interval_secs: default_scan_interval_secs(),
            max_risk_per_trade: default_max_risk_per_trade(),
            coordination_mode: CoordinationMode::default(),
            agent_weights: default_agent_weights(),
            phase_timeout_secs: default_phase_timeout_secs(),
            watchlist: default_watchlist(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning. A file that parses but fails
    /// validation is a fatal `ConfigInvalid`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .map_err(|e| CoreError::ConfigInvalid(format!("{}: {e}", path.display())))?;

        config.apply_env_overrides();
        config.validate()?;
        config.normalize_weights();

        info!(
            path = %path.display(),
            watchlist = ?config.watchlist,
            mode = %config.coordination_mode,
            backend = %config.vector_backend,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Build a validated default configuration, honouring env overrides.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        match Self::load(&path) {
            Ok(config) => Ok(config),
            Err(e) if e.downcast_ref::<CoreError>().is_some() => Err(e),
            Err(_) => {
                let mut config = Self::default();
                config.apply_env_overrides();
                config.validate()?;
                config.normalize_weights();
                Ok(config)
            }
        }
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Override the watchlist from `QUORUM_WATCHLIST` (comma-separated) if set.
    fn apply_env_overrides(&mut self) {
        if let Ok(symbols) = std::env::var("QUORUM_WATCHLIST") {
            let parsed: Vec<String> = symbols
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.watchlist = parsed;
            }
        }
    }

    /// Reject configurations that parse but cannot serve.
    fn validate(&self) -> Result<()> {
        if self.embedding_dimension == 0 {
            return Err(CoreError::ConfigInvalid("embedding dimension is zero".into()).into());
        }
        if self.watchlist.is_empty() {
            return Err(CoreError::ConfigInvalid("watchlist is empty".into()).into());
        }
        if self.agent_weights.values().all(|w| *w <= 0.0) {
            return Err(CoreError::ConfigInvalid("all agent weights are zero".into()).into());
        }
        if self.agent_weights.values().any(|w| *w < 0.0 || !w.is_finite()) {
            return Err(CoreError::ConfigInvalid("agent weights must be finite and >= 0".into()).into());
        }
        if !(0.0..=1.0).contains(&self.max_risk_per_trade) {
            return Err(
                CoreError::ConfigInvalid("max_risk_per_trade outside [0, 1]".into()).into(),
            );
        }
        Ok(())
    }

    /// Scale agent weights so they sum to exactly 1.0.
    fn normalize_weights(&mut self) {
        let total: f64 = self.agent_weights.values().sum();
        if total > 0.0 {
            for weight in self.agent_weights.values_mut() {
                *weight /= total;
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

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.embedding_model, "hash-v1");
        assert_eq!(cfg.embedding_dimension, 384);
        assert_eq!(cfg.vector_backend, VectorBackend::Local);
        assert_eq!(cfg.coordination_mode, CoordinationMode::Balanced);
        assert_eq!(cfg.watchlist.len(), 6);
        assert_eq!(cfg.watchlist[0], "AAPL");
        assert_eq!(cfg.max_concurrent_tasks, 10);
        assert_eq!(cfg.phase_timeout_secs, 30);
        assert!((cfg.max_risk_per_trade - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.embedding_dimension, 384);
        assert_eq!(cfg.retention_max_records, 10_000);
        assert_eq!(cfg.scan_interval_secs, 300);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "coordination_mode": "aggressive", "watchlist": ["GME"] }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.coordination_mode, CoordinationMode::Aggressive);
        assert_eq!(cfg.watchlist, vec!["GME"]);
        assert_eq!(cfg.embedding_model, "hash-v1");
    }

    #[test]
    fn weights_normalise_to_one() {
        let mut cfg = RuntimeConfig::default();
        cfg.agent_weights.insert("strategy".to_string(), 0.50);
        cfg.normalize_weights();
        let total: f64 = cfg.agent_weights.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn zero_dimension_is_rejected() {
        let mut cfg = RuntimeConfig::default();
        cfg.embedding_dimension = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_watchlist_is_rejected() {
        let mut cfg = RuntimeConfig::default();
        cfg.watchlist.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.watchlist, cfg2.watchlist);
        assert_eq!(cfg.embedding_dimension, cfg2.embedding_dimension);
        assert_eq!(cfg.coordination_mode, cfg2.coordination_mode);
    }

    #[test]
    fn save_and_load_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut cfg = RuntimeConfig::default();
        cfg.watchlist = vec!["SNDL".to_string(), "NOK".to_string()];
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.watchlist, vec!["SNDL", "NOK"]);
    }
}
