use thiserror::Error;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from registration handling
#[derive(Error, Debug)]
pub enum Error {
    /// The REGISTER's From header carried no usable extension
    #[error("No extension in From header: {0}")]
    MissingExtension(String),

    /// The extension is not provisioned
    #[error("Unknown extension: {0}")]
    UnknownExtension(String),

    /// Credentials were presented but did not verify
    #[error("Authentication failed for extension {0}")]
    AuthenticationFailed(String),

    /// The store collaborator failed
    #[error(transparent)]
    Store(#[from] tandem_infra_common::StoreError),
}
