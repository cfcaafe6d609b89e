//! Error types surfaced to callers of the client.

use thiserror::Error;

/// Errors returned by [`Multiplexer`](crate::Multiplexer) operations.
///
/// A server error reply is *not* a `ClientError`: it arrives as
/// `Ok(Frame::Error(..))` and the connection stays healthy. These variants
/// cover the cases where no reply could be obtained at all.
///
/// The type is `Clone` because one connection failure fans out to every
/// request queued on that connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// No connection to the routed endpoint could be obtained.
    #[error("no connection available: {0}")]
    ConnectionUnavailable(String),

    /// The connection carrying the request failed before a reply arrived.
    ///
    /// `sent` tells whether the request bytes had already been handed to
    /// the transport. When `true` the server may have executed the command.
    #[error("connection lost (request sent: {sent})")]
    ConnectionLost { sent: bool },

    /// No reply arrived within the configured request timeout.
    #[error("request timed out")]
    Timeout,

    /// The client was shut down.
    #[error("client is shut down")]
    Shutdown,

    /// The server answered a subscribe request with an error.
    #[error("subscription rejected: {0}")]
    SubscriptionRejected(String),

    /// An endpoint string could not be parsed as `host:port`.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// A configuration value failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientError {
    /// Returns true if the failed request may have reached the server.
    pub fn maybe_executed(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectionLost { sent: true } | ClientError::Timeout
        )
    }
}
