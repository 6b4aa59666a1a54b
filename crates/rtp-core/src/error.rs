use thiserror::Error;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from the RTP relay engine
#[derive(Error, Debug)]
pub enum Error {
    /// No free port pairs remain in the configured range
    #[error("RTP port pool exhausted")]
    PoolExhausted,

    /// The relay socket could not be bound
    #[error("Failed to bind relay port {port}: {source}")]
    Bind {
        /// Port the bind was attempted on
        port: u16,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// No relay is active for the given call
    #[error("No active relay for call {0}")]
    UnknownCall(String),
}
