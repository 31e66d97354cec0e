//! Core error types.

use thiserror::Error;

use crate::engine::EngineState;

/// Errors from scan size classification and tier lookup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TierError {
    #[error("no configured tier covers a LOC estimate of {0}")]
    NoMatchingTier(i64),

    #[error("unknown tier: {0}")]
    UnknownTier(String),
}

/// Errors from an attempted engine state transition.
///
/// A `SelfTransition` is a consistency warning rather than a fault;
/// callers log it and move on without touching the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("engine is already {0}")]
    SelfTransition(EngineState),

    #[error("no transition from {from} to {to}")]
    Invalid { from: EngineState, to: EngineState },
}

/// Errors from fleet configuration validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("no tiers configured")]
    NoTiers,

    #[error("tier {0} has max_loc <= min_loc")]
    TierBounds(String),

    #[error("tier {0} overlaps tier {1}")]
    TierOverlap(String, String),

    #[error("duplicate tier name: {0}")]
    DuplicateTier(String),

    #[error("tier {0} has min_idle greater than max_count")]
    IdleAboveMax(String),

    #[error("{field} must be positive")]
    ZeroValue { field: &'static str },
}

/// Errors surfaced by a scan-manager API client implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("engine registration rejected: {0}")]
    Registration(String),

    #[error("scan manager unreachable: {0}")]
    Transport(String),
}

pub type RemoteResult<T> = Result<T, RemoteError>;
