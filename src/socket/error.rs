use thiserror::Error;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("socket is closed")]
    SocketClosed,
    #[error("socket is already open")]
    SocketAlreadyOpen,
    #[error("frame too large: {got} bytes (max {max})")]
    FrameTooLarge { max: usize, got: usize },
    #[error("noise handshake failed: {0}")]
    NoiseHandshake(String),
    #[error("crypto failure: {0}")]
    Crypto(String),
    #[error("websocket failure: {0}")]
    WebSocket(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_websockets::Error> for SocketError {
    fn from(e: tokio_websockets::Error) -> Self {
        SocketError::WebSocket(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SocketError>;
