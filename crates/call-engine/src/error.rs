use thiserror::Error;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Engine-level errors.
///
/// [`Error::to_status`] is the single place protocol refusals become SIP
/// status codes; everything the router or session layer can fail with
/// funnels through it.
#[derive(Error, Debug)]
pub enum Error {
    /// The INVITE's From/To headers carried no extensions
    #[error("Could not parse extensions from headers")]
    UnparsableAddress,

    /// The callee exists but has no active registration
    #[error("Extension {0} is not registered")]
    CalleeNotRegistered(String),

    /// The dialed number matches no dialplan pattern
    #[error("Extension {0} not allowed by dialplan")]
    DialplanDenied(String),

    /// A collaborator hook refused or is absent for a diverted call
    #[error("No collaborator available for {0}")]
    CollaboratorUnavailable(&'static str),

    /// New calls are refused while the server drains for shutdown
    #[error("Server is shutting down")]
    Draining,

    /// Session layer failure
    #[error(transparent)]
    Session(#[from] tandem_session_core::Error),

    /// I/O failure on the SIP socket
    #[error("SIP socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The SIP status this error answers a request with.
    pub fn to_status(&self) -> (u16, &'static str) {
        use tandem_session_core::Error as SessionError;
        match self {
            Error::UnparsableAddress => (400, "Bad Request"),
            Error::CalleeNotRegistered(_) => (404, "Not Found"),
            Error::DialplanDenied(_) => (403, "Forbidden"),
            Error::CollaboratorUnavailable(_) => (404, "Not Found"),
            Error::Draining => (503, "Service Unavailable"),
            Error::Session(SessionError::Relay(_)) => (503, "Service Unavailable"),
            Error::Session(SessionError::CallExists(_)) => (482, "Loop Detected"),
            Error::Session(_) => (500, "Server Internal Error"),
            Error::Io(_) => (500, "Server Internal Error"),
        }
    }
}
