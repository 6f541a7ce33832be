use std::io;

/// Failure reported to a caller of `emit`, `call` or `batch`.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no connection")]
    NoConnection,
    #[error("transport terminated")]
    Terminated,
    #[error("encode failed: {0}")]
    Encode(#[from] obsdeck_protocol::ProtocolError),
    #[error("request failed with code {code}: {comment}")]
    RequestFailed { code: u32, comment: String },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

/// Reasons a connection attempt or an established session ended.
/// These stay inside the network thread and only drive reconnection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("websocket: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("handshake: {0}")]
    Handshake(String),
    #[error("remote requires a password")]
    AuthRequired,
    #[error("unsupported rpc version {0}")]
    UnsupportedRpcVersion(u32),
    #[error("connection closed")]
    Closed,
    #[error("terminated")]
    Terminated,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] io::Error),
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
