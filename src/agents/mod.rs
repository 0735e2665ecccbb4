// =============================================================================
// Specialized agents — each a Base Agent plus a domain policy
// =============================================================================

pub mod base;
pub mod portfolio;
pub mod rules;
pub mod runtime;
pub mod scraper;
pub mod strategy;
pub mod timing;
pub mod tool_control;

pub use base::{Agent, AgentCore, AgentDeps, PerformanceCounters};

/// Shared test scaffolding: a full set of agent dependencies over a temp
/// directory with an in-memory ledger.
#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Arc;

    use super::base::AgentDeps;
    use crate::bus::{AgentsOut, InputRouter};
    use crate::memory::test_store;

    pub(crate) fn test_deps(dir: &std::path::Path) -> AgentDeps {
        let (memory, ledger) = test_store(dir);
        let router = Arc::new(InputRouter::new(memory.clone()));
        let fanout = Arc::new(AgentsOut::new(dir, memory.clone(), ledger, router.clone()));
        AgentDeps {
            memory,
            router,
            fanout,
        }
    }
}
