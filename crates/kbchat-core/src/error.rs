//! Typed error for the retrieval-augmented pipeline.
//!
//! Callers must be able to tell "could not answer because retrieval or
//! generation failed" apart from bad input and from storage failures, so
//! every collaborator failure is mapped onto one of these variants instead
//! of being folded into a generic error.

use std::fmt;

use thiserror::Error;

/// The external collaborator a [`Error::ProviderUnavailable`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Embedding,
    Language,
    Extraction,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Provider::Embedding => "embedding",
            Provider::Language => "language model",
            Provider::Extraction => "extraction",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Empty input, malformed URL, invalid user id. Nothing was persisted.
    #[error("validation error: {0}")]
    Validation(String),

    /// The session token was missing or did not verify.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A collaborator was unreachable or returned an error.
    #[error("{provider} provider unavailable: {message}")]
    ProviderUnavailable { provider: Provider, message: String },

    /// Query-time embedding failed; no results were produced.
    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    /// Reformulation or answer generation failed; the turn was not persisted.
    #[error("generation failed: {0}")]
    GenerationFailed(String),

    /// The durable store rejected a read or write.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl Error {
    pub fn provider(provider: Provider, message: impl Into<String>) -> Self {
        Error::ProviderUnavailable {
            provider,
            message: message.into(),
        }
    }

    pub fn persistence(err: impl fmt::Display) -> Self {
        Error::Persistence(err.to_string())
    }

    /// Whether the same request may succeed when retried unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ProviderUnavailable { .. }
                | Error::RetrievalUnavailable(_)
                | Error::GenerationFailed(_)
        )
    }

    /// Machine-readable code used by the HTTP error body.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "bad_request",
            Error::Unauthorized(_) => "unauthorized",
            Error::ProviderUnavailable { .. } => "provider_unavailable",
            Error::RetrievalUnavailable(_) => "retrieval_unavailable",
            Error::GenerationFailed(_) => "generation_failed",
            Error::Persistence(_) => "persistence",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
