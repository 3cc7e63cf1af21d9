//! Cluster-facing contracts for the krill message-flow engines.
//!
//! # Purpose
//! The engines in `krill-flow` never speak the Kafka wire protocol
//! themselves. Everything cluster-shaped is consumed through the contracts
//! defined here: a metadata and offset oracle ([`ClusterClient`]), a
//! per-broker fetch endpoint ([`BrokerLink`]), and the channel bundle of an
//! asynchronous producer pipeline ([`AsyncSink`]).
//!
//! # Design notes
//! The traits are object safe so the engines can hold `Arc<dyn ...>` across
//! leader changes; the data types are plain owned values so responses can be
//! shared and requests can be rebuilt freely.

mod error;
mod fetch;
mod produce;

pub use error::{ClusterError, Result};
pub use fetch::{FetchBlock, FetchRequest, FetchResponse, Record, RequestBlock};
pub use produce::{AsyncSink, FailedRecord, ProduceRecord, ProduceReply};

use async_trait::async_trait;
use std::sync::Arc;

/// Which end of a partition's live offset range to look up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetAt {
    Oldest,
    Newest,
}

/// Metadata, offset and connection oracle for one Kafka cluster.
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// Returns the oldest or newest offset of a partition.
    async fn get_offset(&self, topic: &str, partition: i32, at: OffsetAt) -> Result<i64>;

    /// Forces a metadata refresh for the topic.
    async fn refresh_metadata(&self, topic: &str) -> Result<()>;

    /// Returns a connection to the current leader of the partition.
    async fn leader(&self, topic: &str, partition: i32) -> Result<Arc<dyn BrokerLink>>;

    /// Opens the asynchronous producer pipeline behind the cluster.
    async fn async_producer(&self) -> Result<AsyncSink>;
}

/// One established broker connection.
#[async_trait]
pub trait BrokerLink: Send + Sync + 'static {
    /// Numeric broker id, stable across reconnects.
    fn id(&self) -> i32;

    /// Issues one fetch round-trip on this connection.
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse>;

    /// Tears the connection down. A later `leader()` lookup may hand out a
    /// fresh link to the same broker.
    async fn close(&self);
}
