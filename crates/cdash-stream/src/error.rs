use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("stream request to {url} failed: {message}")]
    Connect { url: String, message: String },
    #[error("stream {url} answered with status {status}")]
    Status { url: String, status: u16 },
    #[error("stream read failed: {0}")]
    Read(String),
    #[error("stream ended")]
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("server responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("response decode failed: {0}")]
    Decode(String),
    #[error("response did not include a link to follow")]
    MissingLink,
}
