//! Error types for each layer of the bridge.
//!
//! Configuration errors stop `enable`; connection errors drive a reconnect; decode errors
//! drop one frame; template and delivery errors are scoped to one destination of one event.

use tokio_tungstenite::tungstenite;

/// Malformed or incomplete settings. The session never starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("please enter the correct host server")]
    MissingHostServer,
    #[error("invalid host server: {0}")]
    InvalidHostServer(String),
    #[error("client token is not configured (set client_token or HOOKRELAY_CLIENT_TOKEN)")]
    MissingToken,
    #[error("invalid webhook URL: {0}")]
    InvalidUrl(String),
    #[error("invalid method {method:?} for webhook {url}")]
    InvalidMethod { url: String, method: String },
    #[error("invalid header {name:?} for webhook {url}")]
    InvalidHeader { url: String, name: String },
}

/// Dial, handshake, heartbeat, or read failure on the upstream stream.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("invalid stream request: {0}")]
    Request(#[source] tungstenite::Error),
    #[error("dial error: {0}")]
    Dial(#[source] tungstenite::Error),
    #[error("write heartbeat message error: {0}")]
    Heartbeat(#[source] tungstenite::Error),
    #[error("write close message error: {0}")]
    Close(#[source] tungstenite::Error),
    #[error("read message error: {0}")]
    Read(#[source] tungstenite::Error),
    #[error("read message error: close {code} ({reason})")]
    RemoteClosed { code: u16, reason: String },
    #[error("reader task failed: {0}")]
    Reader(String),
}

/// One inbound frame could not be decoded; the frame is dropped.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame is not valid UTF-8")]
    NotUtf8,
    #[error("unsupported message format: {0}")]
    Json(#[from] serde_json::Error),
}

/// A body template failed to parse or render.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("unclosed placeholder at byte {0}")]
    Unclosed(usize),
    #[error("empty placeholder at byte {0}")]
    EmptyPlaceholder(usize),
    #[error("unknown template field {0:?}")]
    UnknownField(String),
    #[error("failed to marshal body: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failure delivering one event to one destination. Final: never retried.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("delivery to {url} cancelled")]
    Cancelled { url: String },
    #[error("failed to process webhook body for {url}: {source}")]
    Template {
        url: String,
        #[source]
        source: TemplateError,
    },
    #[error("failed to send webhook request to {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to send webhook request to {url}: unexpected status code: {status}")]
    Status { url: String, status: u16 },
}

impl DeliveryError {
    /// URL of the destination this error belongs to.
    pub fn url(&self) -> &str {
        match self {
            DeliveryError::Cancelled { url }
            | DeliveryError::Template { url, .. }
            | DeliveryError::Transport { url, .. }
            | DeliveryError::Status { url, .. } => url,
        }
    }
}
