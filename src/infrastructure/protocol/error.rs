use super::types::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn server process '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("peer returned JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("request '{method}' timed out")]
    Timeout { method: String },
    #[error("request '{method}' cancelled")]
    Cancelled { method: String },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("server did not advertise the capability required by '{method}'")]
    Unsupported { method: String },
    #[error("initialize handshake failed: {0}")]
    Handshake(String),
    #[error("reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },
}

impl ProtocolError {
    /// Wire error code this failure maps to when it has to cross the
    /// protocol boundary.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ProtocolError::Timeout { .. } => ErrorCode::TimeoutError,
            ProtocolError::Rpc { code, .. } => {
                ErrorCode::from_code(*code).unwrap_or(ErrorCode::InternalError)
            }
            _ => ErrorCode::InternalError,
        }
    }
}
