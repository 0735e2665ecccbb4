// =============================================================================
// Agent-to-agent communication bus
// =============================================================================
//
// `input_router` (ingress): per-agent memory retrieval and inbox delivery.
// `fanout` (egress): ingest every agent emission, persist, memorise,
// notify. Inter-agent communication is message-passing only; no agent
// holds a reference to another agent's mutable state.
// =============================================================================

pub mod events;
pub mod fanout;
pub mod input_router;

pub use events::{AgentEvent, AgentMessage, ErrorSeverity, EventClass, EventPayload};
pub use fanout::AgentsOut;
pub use input_router::{InputRouter, RetrievalContext};
