// =============================================================================
// Input Router — per-agent memory retrieval, relevance filtering, delivery
// =============================================================================
//
// Answers "what do I know that is relevant to this situation?" for any
// agent: compose a query, consult the LRU cache, fall through to the
// memory store, filter for relevance, rank and truncate. Every uncached
// retrieval leaves an `agent_data_transfer` trace in memory.
//
// Delivery is message-passing only: each registered agent owns the
// receiving half of an unbounded channel; `send` enqueues and never blocks.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::{CoreError, CoreResult};
use crate::memory::record::{content_types, MemoryMetadata, MemoryRecord};
use crate::memory::MemoryStore;

use super::events::AgentMessage;

/// Retrieval result cap and cache sizing.
const RETRIEVAL_LIMIT: usize = 10;
const CACHE_HIGH_WATER: usize = 100;
const CACHE_LOW_WATER: usize = 50;

/// Records at or above this importance are relevant to every agent.
const ALWAYS_RELEVANT_IMPORTANCE: f64 = 0.7;

/// Salient context fields for a retrieval, hashed into the cache key and
/// concatenated into the query string in a fixed order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievalContext {
    pub symbol: Option<String>,
    pub signal_type: Option<String>,
    pub timeframe: Option<String>,
    pub strategy: Option<String>,
    pub market_regime: Option<String>,
}

impl RetrievalContext {
    pub fn for_symbol(symbol: impl Into<String>) -> Self {
        Self {
            symbol: Some(symbol.into()),
            ..Self::default()
        }
    }

    fn query_fragment(&self) -> String {
        let mut parts = Vec::new();
        if let Some(symbol) = &self.symbol {
            parts.push(format!("symbol:{symbol}"));
        }
        if let Some(signal_type) = &self.signal_type {
            parts.push(format!("signal:{signal_type}"));
        }
        if let Some(timeframe) = &self.timeframe {
            parts.push(format!("timeframe:{timeframe}"));
        }
        if let Some(strategy) = &self.strategy {
            parts.push(format!("strategy:{strategy}"));
        }
        if let Some(regime) = &self.market_regime {
            parts.push(format!("regime:{regime}"));
        }
        parts.join(" ")
    }

    fn stable_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.symbol.hash(&mut hasher);
        self.signal_type.hash(&mut hasher);
        self.timeframe.hash(&mut hasher);
        self.strategy.hash(&mut hasher);
        self.market_regime.hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    agent: String,
    query_type: String,
    context_hash: u64,
}

/// Retrieval statistics exposed on the health surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalStats {
    pub total_retrievals: u64,
    pub cache_hits: u64,
}

pub struct InputRouter {
    memory: Arc<MemoryStore>,
    inboxes: RwLock<HashMap<String, mpsc::UnboundedSender<AgentMessage>>>,
    /// Insertion-ordered cache; eviction drops the oldest insertions.
    /// Memory is append-only, so stale hits merely under-weight very
    /// recent records.
    cache: Mutex<VecDeque<(CacheKey, Vec<MemoryRecord>)>>,
    total_retrievals: AtomicU64,
    cache_hits: AtomicU64,
}

impl InputRouter {
    pub fn new(memory: Arc<MemoryStore>) -> Self {
        Self {
            memory,
            inboxes: RwLock::new(HashMap::new()),
            cache: Mutex::new(VecDeque::new()),
            total_retrievals: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Inbox registration & delivery
    // -------------------------------------------------------------------------

    /// Register an agent's inbox; the returned receiver is owned by the
    /// agent's process loop. Re-registering replaces the previous sender.
    pub fn register_inbox(&self, agent: impl Into<String>) -> mpsc::UnboundedReceiver<AgentMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let agent = agent.into();
        info!(agent = %agent, "inbox registered");
        self.inboxes.write().insert(agent, tx);
        rx
    }

    /// Enqueue a message for `agent`. Success means queued, not delivered.
    pub fn send(&self, agent: &str, message: AgentMessage) -> CoreResult<()> {
        let inboxes = self.inboxes.read();
        let sender = inboxes.get(agent).ok_or_else(|| CoreError::AgentCrash {
            agent: agent.to_string(),
            reason: "no registered inbox".to_string(),
        })?;
        sender.send(message).map_err(|_| CoreError::AgentCrash {
            agent: agent.to_string(),
            reason: "inbox receiver dropped".to_string(),
        })
    }

    pub fn has_inbox(&self, agent: &str) -> bool {
        self.inboxes.read().contains_key(agent)
    }

    // -------------------------------------------------------------------------
    // Retrieval
    // -------------------------------------------------------------------------

    /// Retrieve up to 10 memories relevant to `agent` for `query_type`
    /// under `context`, preferring cached slices.
    pub fn retrieve(
        &self,
        agent: &str,
        query_type: &str,
        context: &RetrievalContext,
    ) -> Vec<MemoryRecord> {
        self.total_retrievals.fetch_add(1, Ordering::Relaxed);

        let key = CacheKey {
            agent: agent.to_string(),
            query_type: query_type.to_string(),
            context_hash: context.stable_hash(),
        };

        if let Some(cached) = self.cache_lookup(&key) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(agent, query_type, count = cached.len(), "retrieval served from cache");
            return cached;
        }

        // Fixed composition order: agent, query type, context fields.
        let query = format!("{agent} {query_type} {}", context.query_fragment());
        let candidates = self.memory.query(query.trim(), RETRIEVAL_LIMIT);

        let mut relevant: Vec<MemoryRecord> = candidates
            .into_iter()
            .filter(|record| Self::is_relevant(record, agent, query_type))
            .collect();

        relevant.sort_by(|a, b| {
            b.importance()
                .partial_cmp(&a.importance())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        relevant.truncate(RETRIEVAL_LIMIT);

        self.cache_insert(key, relevant.clone());
        self.log_transfer(agent, query_type, relevant.len());

        relevant
    }

    pub fn stats(&self) -> RetrievalStats {
        RetrievalStats {
            total_retrievals: self.total_retrievals.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// A record is relevant when it came from the agent itself, its type
    /// overlaps the query type, or it is important enough for everyone.
    fn is_relevant(record: &MemoryRecord, agent: &str, query_type: &str) -> bool {
        if record.source() == agent {
            return true;
        }
        let content_type = record.content_type();
        if content_type.contains(query_type) || query_type.contains(content_type) {
            return true;
        }
        record.importance() >= ALWAYS_RELEVANT_IMPORTANCE
    }

    fn cache_lookup(&self, key: &CacheKey) -> Option<Vec<MemoryRecord>> {
        let cache = self.cache.lock();
        cache
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, records)| records.clone())
    }

    fn cache_insert(&self, key: CacheKey, records: Vec<MemoryRecord>) {
        let mut cache = self.cache.lock();
        cache.retain(|(k, _)| *k != key);
        cache.push_back((key, records));

        if cache.len() > CACHE_HIGH_WATER {
            let drop_count = cache.len() - CACHE_LOW_WATER;
            cache.drain(..drop_count);
            debug!(dropped = drop_count, "retrieval cache trimmed");
        }
    }

    fn log_transfer(&self, agent: &str, query_type: &str, count: usize) {
        let text = format!("Delivered {count} memories to {agent} for {query_type}");
        let metadata =
            MemoryMetadata::new(content_types::AGENT_DATA_TRANSFER, "agent_in", 0.3)
                .with("target_agent", agent)
                .with("query_type", query_type)
                .with("memory_count", count);
        if let Err(e) = self.memory.store_text(&text, metadata) {
            warn!(agent, error = %e, "failed to store data-transfer trace");
        }
    }
}

impl std::fmt::Debug for InputRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputRouter")
            .field("inboxes", &self.inboxes.read().len())
            .field("cache_entries", &self.cache.lock().len())
            .finish()
    }
}
