use crate::binary::error::BinaryError;
use crate::signal::error::SignalError;
use crate::socket::error::SocketError;
use crate::store::error::StoreError;
use thiserror::Error;

/// Coarse error taxonomy. Every public failure carries one of these so
/// callers can branch without matching on the concrete source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Timeout,
    Protocol,
    Crypto,
    Auth,
    Rate,
    User,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is not connected")]
    NotConnected,
    #[error("client is already connected")]
    AlreadyConnected,
    #[error("client is not logged in")]
    NotLoggedIn,
    #[error("request timed out")]
    Timeout,
    #[error("connection closed while waiting for a response")]
    ConnectionClosed,
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),
    #[error("malformed stanza: {0}")]
    Binary(#[from] BinaryError),
    #[error("signal failure: {0}")]
    Signal(#[from] SignalError),
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
    #[error("server returned error {code}: {text}")]
    ServerError { code: u16, text: String },
    #[error("authentication rejected: {0}")]
    AuthFailure(u16),
    #[error("{0}")]
    Internal(String),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Socket(_) | ClientError::ConnectionClosed => ErrorKind::Transport,
            ClientError::Timeout => ErrorKind::Timeout,
            ClientError::Binary(_) | ClientError::ServerError { .. } => ErrorKind::Protocol,
            ClientError::Signal(_) => ErrorKind::Crypto,
            ClientError::AuthFailure(_) | ClientError::NotLoggedIn => ErrorKind::Auth,
            ClientError::RateLimited(_) => ErrorKind::Rate,
            ClientError::NotConnected
            | ClientError::AlreadyConnected
            | ClientError::InvalidArgument(_) => ErrorKind::User,
            ClientError::Store(_) | ClientError::Internal(_) => ErrorKind::Protocol,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_per_taxonomy() {
        assert_eq!(ClientError::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(ClientError::NotConnected.kind(), ErrorKind::User);
        assert_eq!(ClientError::AuthFailure(401).kind(), ErrorKind::Auth);
        assert_eq!(
            ClientError::RateLimited("429".into()).kind(),
            ErrorKind::Rate
        );
    }
}
