// =============================================================================
// Memory Store — content-addressed associative memory shared by all agents
// =============================================================================
//
// Three concentric tiers:
//   (a) in-process hot index keyed by id
//   (b) vector backend with similarity search; `local` is the in-process
//       cosine scan, `chromadb` names an external service this build has no
//       transport for and degrades to local with one observable event
//   (c) per-record JSON spill under local_index/ for cold recovery
//
// A write is acknowledged only after (c) succeeds; (a) and (b) are
// best-effort caches rebuilt from (c) on restart.  Every stored record is
// mirrored into the ledger's embedding bookkeeping table.
//
// Degradation observability: each fallback (hash encoder, backend
// unavailable, spill-only persistence) emits exactly one `system_metrics`
// record per transition into the degraded state, not per occurrence.
// =============================================================================

pub mod compactor;
pub mod encoder;
pub mod index;
pub mod record;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{RuntimeConfig, VectorBackend};
use crate::errors::CoreResult;
use crate::ledger::{EmbeddingRow, MetadataLedger};

use self::encoder::Encoder;
use self::index::LocalIndex;
use self::record::{content_types, MemoryMetadata, MemoryRecord};

/// Name under which the store emits its own degradation events.
const STORE_SOURCE: &str = "memory_store";

pub struct MemoryStore {
    encoder: Encoder,
    index: LocalIndex,
    ledger: Arc<MetadataLedger>,
    backend: VectorBackend,
    /// Set when the configured backend is unreachable and queries serve
    /// from the local scan instead.
    backend_degraded: AtomicBool,
    /// Set after the first failed spill write; persistence continues
    /// memory-only from then on.
    spill_degraded: AtomicBool,
}

impl MemoryStore {
    /// Open the store rooted under `config.data_dir`, recover the hot tier
    /// from the spill directory, and report any configuration-time
    /// degradations.
    pub fn open(config: &RuntimeConfig, ledger: Arc<MetadataLedger>) -> CoreResult<Self> {
        let spill_dir = config.data_dir.join("local_index");
        let index = LocalIndex::open(&spill_dir).map_err(|e| {
            crate::errors::CoreError::StorageUnavailable(format!(
                "cannot create spill directory {}: {e}",
                spill_dir.display()
            ))
        })?;

        let store = Self {
            encoder: Encoder::new(config.embedding_model.clone(), config.embedding_dimension),
            index,
            ledger,
            backend: config.vector_backend,
            backend_degraded: AtomicBool::new(false),
            spill_degraded: AtomicBool::new(false),
        };

        let recovered = store.index.recover();
        info!(
            recovered,
            backend = %store.backend,
            model = store.encoder.model(),
            dimension = store.encoder.dimension(),
            "memory store opened"
        );

        if store.backend == VectorBackend::Chroma
            && !store.backend_degraded.swap(true, Ordering::SeqCst)
        {
            store.note_degradation(
                "vector_backend",
                "chromadb backend unreachable in this build; serving similarity from local scan",
            );
        }

        Ok(store)
    }

    pub fn dimension(&self) -> usize {
        self.encoder.dimension()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Subsystems currently running with reduced guarantees, for the
    /// health surface.
    pub fn degraded_subsystems(&self) -> Vec<String> {
        let mut degraded = Vec::new();
        if self.encoder.is_fallback() {
            degraded.push("encoder".to_string());
        }
        if self.backend_degraded.load(Ordering::SeqCst) {
            degraded.push("vector_backend".to_string());
        }
        if self.spill_degraded.load(Ordering::SeqCst) {
            degraded.push("local_spill".to_string());
        }
        degraded
    }

    // -------------------------------------------------------------------------
    // Contract surface
    // -------------------------------------------------------------------------

    /// Encode `text` into a vector of the configured dimension.
    /// Deterministic for a fixed model configuration.
    pub fn encode(&self, text: &str) -> Vec<f32> {
        if self.encoder.take_fallback_transition() {
            self.note_degradation(
                "encoder",
                &format!(
                    "embedding model '{}' unavailable; deterministic hash encoder in use",
                    self.encoder.model()
                ),
            );
        }
        self.encoder.encode(text)
    }

    /// Assemble a record: assign an id, stamp `created_at`.
    ///
    /// A vector of the wrong dimension is replaced by re-encoding the text,
    /// so the dimension invariant holds for every packaged record.
    pub fn package(&self, text: &str, vector: Vec<f32>, metadata: MemoryMetadata) -> MemoryRecord {
        let vector = if vector.len() == self.encoder.dimension() {
            vector
        } else {
            warn!(
                got = vector.len(),
                expected = self.encoder.dimension(),
                "packaged vector has wrong dimension; re-encoding from text"
            );
            self.encode(text)
        };

        MemoryRecord {
            id: Uuid::new_v4().to_string(),
            content: text.to_string(),
            vector,
            metadata,
            created_at: Utc::now(),
        }
    }

    /// Persist a record durably and mirror its bookkeeping row.
    ///
    /// The spill write happens first; on spill failure the store degrades
    /// to memory-only persistence (one observable event) and keeps
    /// serving. Storing the same id twice overwrites idempotently.
    pub fn store(&self, record: MemoryRecord) -> CoreResult<MemoryRecord> {
        match self.index.insert(record.clone()) {
            Ok(()) => {}
            Err(e) => {
                self.index.insert_memory_only(record.clone());
                if !self.spill_degraded.swap(true, Ordering::SeqCst) {
                    warn!(error = %e, "spill write failed; degrading to memory-only persistence");
                    self.note_degradation(
                        "local_spill",
                        &format!("spill write failed ({e}); persistence is memory-only"),
                    );
                } else {
                    debug!(error = %e, id = %record.id, "spill write failed (already degraded)");
                }
            }
        }

        let bookkeeping = EmbeddingRow {
            id: record.id.clone(),
            content_hash: content_hash(&record.content),
            content_type: record.content_type().to_string(),
            source: record.source().to_string(),
            importance: record.importance(),
            access_count: 0,
            last_access: None,
            created_at: record.created_at,
        };
        if let Err(e) = self.ledger.upsert_embedding(&bookkeeping) {
            warn!(id = %record.id, error = %e, "embedding bookkeeping mirror failed");
        }

        debug!(
            id = %record.id,
            content_type = record.content_type(),
            importance = record.importance(),
            "memory written"
        );
        Ok(record)
    }

    /// Convenience: encode, package and store in one step.
    pub fn store_text(&self, text: &str, metadata: MemoryMetadata) -> CoreResult<MemoryRecord> {
        let vector = self.encode(text);
        let record = self.package(text, vector, metadata);
        self.store(record)
    }

    /// Up to `k` records ordered by descending cosine similarity against
    /// `encode(text)`; ties broken by importance, then recency.
    pub fn query(&self, text: &str, k: usize) -> Vec<MemoryRecord> {
        let vector = self.encode(text);
        let results = self.index.query_similar(&vector, k);

        for (_, record) in &results {
            if let Err(e) = self.ledger.touch_embedding(&record.id) {
                debug!(id = %record.id, error = %e, "access bookkeeping update failed");
            }
        }

        results.into_iter().map(|(_, record)| record).collect()
    }

    /// Like `query`, but also returns the similarity score per record.
    pub fn query_scored(&self, text: &str, k: usize) -> Vec<(f32, MemoryRecord)> {
        let vector = self.encode(text);
        self.index.query_similar(&vector, k)
    }

    /// Recency-ordered slice of the store.
    pub fn scan(&self, limit: usize) -> Vec<MemoryRecord> {
        self.index.scan_recent(limit)
    }

    pub fn get(&self, id: &str) -> Option<MemoryRecord> {
        self.index.get(id)
    }

    // -------------------------------------------------------------------------
    // Compaction support
    // -------------------------------------------------------------------------

    /// Full snapshot for the compactor's eviction scan.
    pub(crate) fn snapshot(&self) -> Vec<MemoryRecord> {
        self.index.snapshot()
    }

    /// Remove a record from every tier, including its bookkeeping row.
    pub(crate) fn evict(&self, id: &str) {
        self.index.remove(id);
        if let Err(e) = self.ledger.delete_embedding(id) {
            debug!(id, error = %e, "bookkeeping delete failed during eviction");
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Record a transition into a degraded state as a `system_metrics`
    /// memory. Callers guard with their transition flags so each
    /// degradation is reported exactly once.
    fn note_degradation(&self, subsystem: &str, detail: &str) {
        warn!(subsystem, detail, "memory subsystem degraded");
        let metadata = MemoryMetadata::new(content_types::SYSTEM_METRICS, STORE_SOURCE, 0.8)
            .with("event", "degradation")
            .with("subsystem", subsystem);
        let text = format!("Degraded {subsystem}: {detail}");
        let vector = self.encoder.encode(&text);
        let record = self.package(&text, vector, metadata);
        if let Err(e) = self.store(record) {
            warn!(error = %e, "failed to store degradation event");
        }
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("records", &self.index.len())
            .field("backend", &self.backend)
            .field("encoder", &self.encoder)
            .finish()
    }
}

/// Hex SHA-256 of record content, used for bookkeeping dedup.
fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Build a store over a temp directory with a fresh in-memory ledger.
#[cfg(test)]
pub(crate) fn test_store(dir: &std::path::Path) -> (Arc<MemoryStore>, Arc<MetadataLedger>) {
    let mut config = RuntimeConfig::default();
    config.data_dir = dir.to_path_buf();
    config.embedding_dimension = 64;
    let ledger = Arc::new(MetadataLedger::open_in_memory().unwrap());
    let store = Arc::new(MemoryStore::open(&config, ledger.clone()).unwrap());
    (store, ledger)
}
