use thiserror::Error;

/// Failure taxonomy for the whole crate. Nothing panics across the public
/// boundary: transport trouble is reported through `ConnectionStatus`,
/// everything else comes back as one of these values.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json decode error: {0}")]
    Decode(#[from] simd_json::Error),
    #[error("json encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("not connected")]
    NotConnected,
    #[error("betting window is closed")]
    BetsLocked,
    #[error("request timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
    #[error("request cancelled by caller")]
    Cancelled,
    #[error("connection closed by server: {0}")]
    ServerClosed(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for EngineError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}
