//! Error taxonomy for the header sync engine.
//!
//! Cancellation is a control signal rather than a failure: streams that are
//! deliberately closed surface [`Error::Cancelled`], which every layer absorbs
//! silently. Everything else is either recoverable through resubscription
//! (transport failures while retry budget remains, validator rejections) or
//! fatal and surfaced as a single error event at the provider boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The stream was deliberately cancelled. Never surfaced as a failure.
    #[error("stream cancelled")]
    Cancelled,

    /// A stream or network failure. Recoverable while retry budget remains.
    #[error("transport error: {0}")]
    Transport(String),

    /// The chain-state validator refused a batch as structurally invalid or
    /// non-linking. Fed back as a forced-reconnect signal, not a failure.
    #[error("invalid block headers: {0}")]
    InvalidHeaders(String),

    /// An operation was called in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Configuration validation failed at construction time.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Any other failure, e.g. a fault inside the chain-state validator.
    /// Always fatal, never retried.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether this is the distinguished cancellation code.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
