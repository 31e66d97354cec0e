//! Pool error types.

use thiserror::Error;

use scanfleet_core::EngineState;

/// Errors from engine registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("engine already registered: {0}")]
    DuplicateEngine(String),

    #[error("unknown engine: {0}")]
    UnknownEngine(String),

    #[error("unknown tier: {0}")]
    UnknownTier(String),

    /// Attempted no-op self-transition. Reported, never applied;
    /// callers log it and move on.
    #[error("engine {name} is already {state}")]
    SelfTransition { name: String, state: EngineState },

    #[error("engine {name}: no transition from {from} to {to}")]
    InvalidTransition {
        name: String,
        from: EngineState,
        to: EngineState,
    },
}

pub type PoolResult<T> = Result<T, PoolError>;
