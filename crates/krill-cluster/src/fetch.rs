// Fetch round-trip data types: a request carries one block per hungry
// partition, a response carries one block per served partition.
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;

use crate::ClusterError;

/// One record as handed back by a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
}

/// Per-partition slice of a fetch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestBlock {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub max_bytes: i32,
}

/// A batched fetch request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Minimum payload the broker should accumulate before answering.
    pub min_bytes: i32,
    /// Server-side long-poll ceiling.
    pub max_wait: Duration,
    pub blocks: Vec<RequestBlock>,
}

impl FetchRequest {
    pub fn new(min_bytes: i32, max_wait: Duration) -> Self {
        FetchRequest {
            min_bytes,
            max_wait,
            blocks: Vec::new(),
        }
    }

    pub fn add_block(&mut self, topic: &str, partition: i32, offset: i64, max_bytes: i32) {
        self.blocks.push(RequestBlock {
            topic: topic.to_string(),
            partition,
            offset,
            max_bytes,
        });
    }
}

/// Per-partition slice of a fetch response.
#[derive(Debug, Clone, Default)]
pub struct FetchBlock {
    /// Per-partition error code reported by the broker, if any.
    pub error: Option<ClusterError>,
    /// Offset of the next record the broker will append.
    pub high_water_mark: i64,
    pub records: Vec<Record>,
    /// True when the tail record was cut off by the request's max-bytes.
    pub partial_trailing_record: bool,
}

/// A batched fetch response, addressable by topic and partition.
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    blocks: HashMap<String, HashMap<i32, FetchBlock>>,
}

impl FetchResponse {
    pub fn new() -> Self {
        FetchResponse::default()
    }

    pub fn add_block(&mut self, topic: &str, partition: i32, block: FetchBlock) {
        self.blocks
            .entry(topic.to_string())
            .or_default()
            .insert(partition, block);
    }

    pub fn block(&self, topic: &str, partition: i32) -> Option<&FetchBlock> {
        self.blocks
            .get(topic)
            .and_then(|partitions| partitions.get(&partition))
    }
}
