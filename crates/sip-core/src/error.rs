use thiserror::Error;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in SIP/SDP handling
///
/// Datagram parsing itself is fail-soft and never produces one of these;
/// the variants cover the builder helpers and the header dissection done
/// by callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A required header was absent from a message
    #[error("Missing required header: {0}")]
    MissingHeader(String),

    /// A header was present but its value could not be interpreted
    #[error("Invalid header {name}: {value}")]
    InvalidHeader {
        /// Header name
        name: String,
        /// Offending value
        value: String,
    },

    /// A MAC address failed validation (must be 12 hex digits)
    #[error("Invalid MAC address: {0}")]
    InvalidMacAddress(String),

    /// SDP body could not be interpreted as an audio session
    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),
}
