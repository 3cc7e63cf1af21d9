//! Message-flow engines of the krill Kafka proxy.
//!
//! Two subsystems share this crate:
//!
//! - the consumer side: per-partition [`MessageStream`]s spawned by a
//!   [`StreamFactory`], multiplexed over shared broker connections by
//!   [`BrokerExecutor`](consumer::executor::BrokerExecutor)s, with leader
//!   reassignment driven through the [`Mapper`](consumer::mapper::Mapper)
//!   contract;
//! - the producer side: a [`GracefulProducer`] that fronts an asynchronous
//!   sink and drains in-flight submissions inside a bounded shutdown window
//!   instead of dropping them on the floor.
//!
//! Cluster access (wire protocol, metadata, connections) lives behind the
//! contracts of the `krill-cluster` crate.

pub mod config;
pub mod consumer;
pub mod error;
pub mod producer;

mod chan;

pub use config::{Config, ConsumerConfig, ProducerConfig};
pub use consumer::factory::{StartOffset, StreamFactory};
pub use consumer::stream::MessageStream;
pub use consumer::{Message, StreamId};
pub use error::{ConsumeError, ProduceError, SpawnError, StreamError};
pub use producer::{GracefulProducer, ProduceResult};
