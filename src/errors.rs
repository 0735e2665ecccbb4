// =============================================================================
// Error taxonomy — typed failures at component boundaries
// =============================================================================
//
// Components return `CoreError` across their public boundaries; internal
// recovery (retries, fallbacks) stays local. The binary glue in main.rs
// converts to `anyhow::Error` for reporting.
// =============================================================================

use thiserror::Error;

/// Typed errors surfaced across component boundaries.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed configuration. Fatal at startup; the process refuses to
    /// serve.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Vector backend and local spill both failed; the store degrades to
    /// in-memory only.
    #[error("memory storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A ledger write failed. No partial rows are left behind; the emitter
    /// retries on its next cycle.
    #[error("ledger write failed: {0}")]
    LedgerWriteFailed(String),

    /// An agent's process loop raised; its lifecycle moves to `error`.
    #[error("agent '{agent}' crashed: {reason}")]
    AgentCrash { agent: String, reason: String },

    /// A coordinator phase exceeded its deadline; treated as "no
    /// contribution" for synthesis.
    #[error("phase '{phase}' timed out after {seconds}s")]
    PhaseTimeout { phase: String, seconds: u64 },

    /// A rule was automatically disabled on sustained poor accuracy.
    #[error("rule '{0}' disabled for poor accuracy")]
    RuleDisabled(String),

    /// A managed tool returned an error or exceeded its timeout.
    #[error("tool '{tool}' execution failed: {reason}")]
    ToolExecutionFailed { tool: String, reason: String },
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::LedgerWriteFailed(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_component() {
        let err = CoreError::PhaseTimeout {
            phase: "signal_generation".to_string(),
            seconds: 30,
        };
        assert_eq!(err.to_string(), "phase 'signal_generation' timed out after 30s");

        let err = CoreError::ConfigInvalid("embedding dimension is zero".to_string());
        assert!(err.to_string().contains("invalid configuration"));
    }

    #[test]
    fn sqlite_errors_map_to_ledger_failures() {
        let sqlite_err = rusqlite::Error::InvalidQuery;
        let core: CoreError = sqlite_err.into();
        assert!(matches!(core, CoreError::LedgerWriteFailed(_)));
    }
}
