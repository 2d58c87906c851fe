use thiserror::Error;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("Socket is closed")]
    SocketClosed,
    #[error("Socket is already open")]
    SocketAlreadyOpen,
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_websockets::Error),
    #[error("Invalid endpoint URI: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SocketError>;
