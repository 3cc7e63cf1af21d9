use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClusterError>;

/// Errors surfaced by cluster calls and by per-partition response codes.
///
/// `Clone` because a broker executor fans one connection failure out to
/// every request in a batch and keeps it cached for the cooldown window.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("offset out of range")]
    OffsetOutOfRange,
    #[error("not leader for partition")]
    NotLeaderForPartition,
    #[error("unknown topic or partition")]
    UnknownTopicOrPartition,
    #[error("broker connection lost")]
    Disconnected,
    #[error("request timed out")]
    Timeout,
    #[error("io: {0}")]
    Io(String),
}
