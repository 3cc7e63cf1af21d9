//! Per-partition consumption multiplexed over shared broker connections.
//!
//! # Purpose
//! A [`StreamFactory`](factory::StreamFactory) spawns one
//! [`MessageStream`](stream::MessageStream) per `(topic, partition)` and
//! guarantees uniqueness. Each stream is a worker in the sense of the
//! [`Mapper`](mapper::Mapper) contract: an external mapper binds it to the
//! [`BrokerExecutor`](executor::BrokerExecutor) of its current leader broker
//! and rebinds it on request. Executors batch the fetch requests of every
//! stream bound to one broker into single wire round-trips and fan the
//! responses back out.

pub mod executor;
pub mod factory;
pub mod mapper;
pub mod stream;

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Identity of a per-partition stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamId {
    topic: Arc<str>,
    partition: i32,
}

impl StreamId {
    pub fn new(topic: &str, partition: i32) -> Self {
        StreamId {
            topic: Arc::from(topic),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub(crate) fn topic_arc(&self) -> &Arc<str> {
        &self.topic
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// One consumer-visible record.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: Arc<str>,
    pub partition: i32,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub offset: i64,
    /// Broker-reported offset of the next record to be written; the
    /// partition lag is `high_water_mark - offset`.
    pub high_water_mark: i64,
}
