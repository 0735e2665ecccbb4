// =============================================================================
// Retention Compactor — background enforcement of memory retention policy
// =============================================================================
//
// Wakes every 60 seconds to enforce `max_records` and `max_age`.  Eviction
// favours lowest importance, then oldest `created_at`.  Records younger
// than the configured minimum age are never evicted.
// =============================================================================

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{debug, info};

use super::MemoryStore;
use crate::config::RuntimeConfig;

/// Interval at which the compactor evaluates the store.
const COMPACT_INTERVAL_SECS: u64 = 60;

/// Retention limits, derived from the runtime config.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub max_records: usize,
    pub max_age: ChronoDuration,
    pub min_age: ChronoDuration,
}

impl RetentionPolicy {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            max_records: config.retention_max_records,
            max_age: ChronoDuration::hours(config.retention_max_age_hours),
            min_age: ChronoDuration::minutes(config.retention_min_age_minutes),
        }
    }
}

/// One compaction pass. Returns the number of evicted records.
pub fn compact(store: &MemoryStore, policy: &RetentionPolicy) -> usize {
    let now = Utc::now();
    let mut evicted = 0usize;

    let mut records = store.snapshot();

    // Age-based eviction first: anything past max_age goes, min-age guard
    // permitting (a max_age below min_age evicts nothing).
    records.retain(|record| {
        let age = now - record.created_at;
        if age > policy.max_age && age > policy.min_age {
            store.evict(&record.id);
            evicted += 1;
            false
        } else {
            true
        }
    });

    // Count-based eviction: drop lowest importance, then oldest, skipping
    // records still inside the minimum-age window.
    if records.len() > policy.max_records {
        records.sort_by(|a, b| {
            a.importance()
                .partial_cmp(&b.importance())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        let excess = records.len() - policy.max_records;
        let mut dropped = 0usize;
        for record in &records {
            if dropped == excess {
                break;
            }
            if now - record.created_at <= policy.min_age {
                continue;
            }
            store.evict(&record.id);
            dropped += 1;
        }
        evicted += dropped;
    }

    if evicted > 0 {
        info!(evicted, remaining = store.len(), "memory compaction pass complete");
    } else {
        debug!(records = store.len(), "memory compaction pass: nothing to evict");
    }

    evicted
}

/// Run the compactor loop. Spawned once at startup; exits when the
/// shutdown signal flips.
pub async fn run_compactor(
    store: Arc<MemoryStore>,
    policy: RetentionPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        max_records = policy.max_records,
        max_age_hours = policy.max_age.num_hours(),
        "retention compactor started"
    );

    let mut ticker = interval(Duration::from_secs(COMPACT_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                compact(&store, &policy);
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("retention compactor stopping");
                    break;
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
    use crate::memory::record::{content_types, MemoryMetadata, MemoryRecord};
    use crate::memory::test_store;
    use uuid::Uuid;

    fn record_aged(store: &MemoryStore, importance: f64, age_minutes: i64) -> String {
        let id = Uuid::new_v4().to_string();
        let text = format!("aged record {id}");
        let record = MemoryRecord {
            id: id.clone(),
            content: text.clone(),
            vector: store.encode(&text),
            metadata: MemoryMetadata::new(content_types::STATUS_UPDATE, "test", importance),
            created_at: Utc::now() - ChronoDuration::minutes(age_minutes),
        };
        store.store(record).unwrap();
        id
    }

    #[test]
    fn evicts_past_max_age() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _ledger) = test_store(dir.path());

        let old = record_aged(&store, 0.9, 60 * 48);
        let fresh = record_aged(&store, 0.1, 5);

        let policy = RetentionPolicy {
            max_records: 100,
            max_age: ChronoDuration::hours(24),
            min_age: ChronoDuration::minutes(10),
        };
        let evicted = compact(&store, &policy);

        assert_eq!(evicted, 1);
        assert!(store.get(&old).is_none());
        assert!(store.get(&fresh).is_some());
    }

    #[test]
    fn count_eviction_prefers_low_importance_then_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _ledger) = test_store(dir.path());

        let low = record_aged(&store, 0.1, 120);
        let mid_old = record_aged(&store, 0.5, 180);
        let mid_new = record_aged(&store, 0.5, 90);
        let high = record_aged(&store, 0.9, 120);

        let policy = RetentionPolicy {
            max_records: 2,
            max_age: ChronoDuration::hours(720),
            min_age: ChronoDuration::minutes(10),
        };
        compact(&store, &policy);

        assert!(store.get(&low).is_none(), "lowest importance evicted first");
        assert!(store.get(&mid_old).is_none(), "ties broken by age");
        assert!(store.get(&mid_new).is_some());
        assert!(store.get(&high).is_some());
    }

    #[test]
    fn min_age_guard_protects_young_records() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _ledger) = test_store(dir.path());

        let young_low = record_aged(&store, 0.05, 1);
        let old_high = record_aged(&store, 0.9, 120);

        let policy = RetentionPolicy {
            max_records: 1,
            max_age: ChronoDuration::hours(720),
            min_age: ChronoDuration::minutes(30),
        };
        compact(&store, &policy);

        // The young record is protected even though it ranks lowest; the
        // eviction falls through to the next eligible candidate.
        assert!(store.get(&young_low).is_some());
        assert!(store.get(&old_high).is_none());
    }
}
