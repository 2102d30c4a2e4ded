// Crate-wide error taxonomy. Per-module errors (TorrentError, PeerError, DiskError,
// TrackerError, MetaInfoError, ...) convert into this via #[from]; callers that need
// to decide fatal-to-task vs. close-peer-only match on the variant, not the source.

#[derive(Debug, thiserror::Error)]
pub enum EngineError {

    #[error("malformed torrent: {0}")]
    MalformedTorrent(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("hash mismatch for piece {index}")]
    HashMismatch { index: usize },

    #[error("timeout")]
    Timeout,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for EngineError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        EngineError::ChannelClosed
    }
}
