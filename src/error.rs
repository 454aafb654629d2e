//! Error Taxonomy
//!
//! Mirrors the error classes that lifecycle operations can surface to a
//! caller. Transient and data-corruption errors inside the tick loop are
//! caught and logged rather than propagated as `EngineError` — see
//! `lifecycle::run_tick`.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("session {0} not found")]
    NotFound(Uuid),

    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("operation in progress")]
    OperationInProgress,

    #[error("a session is already active: {0}")]
    SingleSessionLock(Uuid),

    #[error("speed {0} out of range [1, 200]")]
    InvalidSpeed(u32),

    #[error("unknown throughput mode: {0}")]
    UnknownThroughputMode(String),

    #[error("wrong throughput mode for this operation: {0:?}")]
    WrongMode(crate::external_orders::ThroughputMode),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
