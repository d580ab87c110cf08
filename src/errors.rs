use thiserror::Error;

use crate::types::Side;

pub type RestResult<T> = std::result::Result<T, RestError>;

/// Errors from the REST trading collaborator. [`RestError::Transport`] is
/// the transient kind and is retried with bounded attempts; everything else
/// is definitive and surfaces immediately.
#[derive(Debug, Error)]
pub enum RestError {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("request rejected by exchange: status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("invalid response from exchange: {0}")]
    InvalidResponse(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RestError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RestError::Transport(_))
    }
}

pub type WsResult<T> = std::result::Result<T, WsError>;

/// Errors from the streaming session transport.
#[derive(Debug, Error)]
pub enum WsError {
    #[error("invalid websocket message: {0}")]
    InvalidMessage(String),
    #[error("unsupported websocket scheme {0}")]
    UnsupportedScheme(String),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Error querying an empty book side before any data arrived.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("order book has no {side} levels yet")]
pub struct EmptyBookError {
    pub side: Side,
}

/// Normal-data conditions the grid policy signals instead of placing an
/// order. Both are handled locally by the engine: the order is skipped and
/// retried on the next triggering event.
#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum PolicyError {
    #[error("price {price} outside configured band [{min}, {max}]")]
    OutOfBand { price: f64, min: f64, max: f64 },
    #[error("insufficient funds for {side} at {price}: need {required}, have {available}")]
    InsufficientFunds {
        side: Side,
        price: f64,
        required: f64,
        available: f64,
    },
}

/// Errors from the order lifecycle engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Unexpected event for a known order or an order the engine has no
    /// record of. Logged by the caller; state is corrected from the
    /// server-reported data rather than aborting.
    #[error("protocol inconsistency: {0}")]
    Inconsistency(String),
    #[error(transparent)]
    Rest(#[from] RestError),
    #[error(transparent)]
    EmptyBook(#[from] EmptyBookError),
}

/// Unrecoverable session failure. The runner reacts by cancelling all open
/// orders for the symbol and terminating.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Ws(#[from] WsError),
    #[error(transparent)]
    Rest(#[from] RestError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("fatal session error: {0}")]
    Fatal(String),
}

/// Errors from the instruction signer.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid api secret: {0}")]
    InvalidSecret(String),
    #[error(transparent)]
    Base64(#[from] base64::DecodeError),
}
