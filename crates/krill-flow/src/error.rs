// Error taxonomy for the consumer and producer engines.
use krill_cluster::ClusterError;
use std::sync::Arc;
use thiserror::Error;

/// Why a message stream could not be spawned.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// A live stream already exists for this partition.
    #[error("{topic}/{partition} is already being consumed")]
    AlreadyConsuming { topic: String, partition: i32 },
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// A consumer-side failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsumeError {
    /// The broker holds a record larger than the maximum fetch size.
    #[error("message larger than the maximum fetch size")]
    MessageTooLarge,
    /// The response was missing the block for the requested partition, or
    /// the block carried nothing usable.
    #[error("incomplete fetch response")]
    IncompleteResponse,
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// A [`ConsumeError`] tagged with the partition it came from; what a
/// stream's error channel delivers.
#[derive(Debug, Clone, Error)]
#[error("error consuming {topic}/{partition}: {cause}")]
pub struct StreamError {
    pub topic: Arc<str>,
    pub partition: i32,
    pub cause: ConsumeError,
}

/// Why a produce submission failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProduceError {
    /// The producer has been stopped.
    #[error("producer is closed")]
    Closed,
    /// The record was still in flight when the shutdown window elapsed.
    #[error("record dropped during producer shutdown")]
    Dropped,
    #[error(transparent)]
    Sink(#[from] ClusterError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_error_names_the_partition() {
        let error = StreamError {
            topic: Arc::from("orders"),
            partition: 7,
            cause: ConsumeError::MessageTooLarge,
        };
        let rendered = error.to_string();
        assert!(rendered.contains("orders/7"));
        assert!(rendered.contains("maximum fetch size"));
    }

    #[test]
    fn cluster_errors_convert_transparently() {
        let consume: ConsumeError = ClusterError::OffsetOutOfRange.into();
        assert_eq!(consume.to_string(), "offset out of range");

        let produce: ProduceError = ClusterError::Disconnected.into();
        assert_eq!(produce.to_string(), "broker connection lost");
    }
}