use thiserror::Error;

use crate::call::CallState;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from call session management
#[derive(Error, Debug)]
pub enum Error {
    /// A call with this Call-ID is already in the table
    #[error("Call already exists: {0}")]
    CallExists(String),

    /// No call with this Call-ID
    #[error("Call not found: {0}")]
    CallNotFound(String),

    /// A state transition ran backwards; the call is ended cleanly
    /// rather than left inconsistent
    #[error("Invalid state transition for call {call_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        call_id: String,
        from: CallState,
        to: CallState,
    },

    /// The relay engine refused (port exhaustion maps to SIP 503)
    #[error(transparent)]
    Relay(#[from] tandem_rtp_core::Error),
}
