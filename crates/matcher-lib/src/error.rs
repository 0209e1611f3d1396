//! Engine error types

use thiserror::Error;

/// Errors that cross the engine boundary.
///
/// Matching outcomes (Bound, Deferred, Failed) are values, not errors;
/// see [`crate::models::MatchResult`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("intent not found: {0}")]
    IntentNotFound(String),

    #[error("offer not found: {0}")]
    OfferNotFound(String),

    #[error("intent already submitted: {0}")]
    DuplicateIntent(String),

    #[error("offer already advertised: {0}")]
    DuplicateOffer(String),

    #[error("feedback batch is empty")]
    InsufficientSignal,
}

impl EngineError {
    pub fn invalid(message: impl Into<String>) -> Self {
        EngineError::InvalidInput(message.into())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
