// =============================================================================
// Local Index — hot in-process tier plus per-record JSON spill
// =============================================================================
//
// Tiering:
//   (a) hot HashMap keyed by id — rebuilt from (c) on restart
//   (c) local_index/<id>.json   — cold spill, written before a store is
//                                 acknowledged
//
// The similarity query is an exact cosine scan over the hot tier.  Ordering
// contract: similarity desc, then importance desc, then created_at desc.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::record::MemoryRecord;

/// Cosine similarity between two equal-length vectors.
///
/// Vectors from the hash encoder are unit length, which reduces this to a
/// dot product, but the general form keeps externally supplied vectors
/// correct too.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

pub struct LocalIndex {
    records: RwLock<HashMap<String, MemoryRecord>>,
    spill_dir: PathBuf,
}

impl LocalIndex {
    /// Open (or create) the index rooted at `spill_dir`.
    pub fn open(spill_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let spill_dir = spill_dir.into();
        std::fs::create_dir_all(&spill_dir)?;
        Ok(Self {
            records: RwLock::new(HashMap::new()),
            spill_dir,
        })
    }

    pub fn spill_dir(&self) -> &Path {
        &self.spill_dir
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Insert a record. The JSON spill is written first (atomic tmp +
    /// rename); only then does the record enter the hot tier.
    ///
    /// Returns `Err` when the spill write failed — the caller decides
    /// whether to degrade to memory-only persistence.
    pub fn insert(&self, record: MemoryRecord) -> std::io::Result<()> {
        self.write_spill(&record)?;
        self.records.write().insert(record.id.clone(), record);
        Ok(())
    }

    /// Insert into the hot tier only. Used after a spill failure when the
    /// store has degraded to memory-only persistence.
    pub fn insert_memory_only(&self, record: MemoryRecord) {
        self.records.write().insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &str) -> Option<MemoryRecord> {
        self.records.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.read().contains_key(id)
    }

    /// Remove a record from both tiers. A missing spill file is not an
    /// error (memory-only records never had one).
    pub fn remove(&self, id: &str) -> Option<MemoryRecord> {
        let removed = self.records.write().remove(id);
        if removed.is_some() {
            let path = self.spill_path(id);
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(id, error = %e, "failed to remove spill file");
                }
            }
        }
        removed
    }

    /// Exact cosine scan over the hot tier. Ties broken by importance
    /// desc, then recency desc.
    pub fn query_similar(&self, vector: &[f32], limit: usize) -> Vec<(f32, MemoryRecord)> {
        let records = self.records.read();
        let mut scored: Vec<(f32, MemoryRecord)> = records
            .values()
            .map(|r| (cosine_similarity(vector, &r.vector), r.clone()))
            .collect();

        scored.sort_by(|(sa, ra), (sb, rb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    rb.importance()
                        .partial_cmp(&ra.importance())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| rb.created_at.cmp(&ra.created_at))
        });

        scored.truncate(limit);
        scored
    }

    /// Recency-ordered slice of the hot tier.
    pub fn scan_recent(&self, limit: usize) -> Vec<MemoryRecord> {
        let records = self.records.read();
        let mut all: Vec<MemoryRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all.truncate(limit);
        all
    }

    /// Snapshot of all records (compactor eviction scan).
    pub fn snapshot(&self) -> Vec<MemoryRecord> {
        self.records.read().values().cloned().collect()
    }

    /// Rebuild the hot tier from the spill directory. Returns the number
    /// of records recovered. Unreadable files are skipped with a warning.
    pub fn recover(&self) -> usize {
        let entries = match std::fs::read_dir(&self.spill_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.spill_dir.display(), error = %e, "spill directory unreadable");
                return 0;
            }
        };

        let mut recovered = 0usize;
        let mut records = self.records.write();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|text| serde_json::from_str::<MemoryRecord>(&text).map_err(|e| e.to_string()))
            {
                Ok(record) => {
                    records.insert(record.id.clone(), record);
                    recovered += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping corrupt spill file");
                }
            }
        }

        debug!(recovered, "local index recovered from spill");
        recovered
    }

    fn spill_path(&self, id: &str) -> PathBuf {
        self.spill_dir.join(format!("{id}.json"))
    }

    fn write_spill(&self, record: &MemoryRecord) -> std::io::Result<()> {
        let path = self.spill_path(&record.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}
