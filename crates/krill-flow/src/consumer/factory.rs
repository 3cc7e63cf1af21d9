// Registry and spawner of per-partition message streams.
use async_trait::async_trait;
use krill_cluster::{BrokerLink, ClusterClient, OffsetAt};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::consumer::StreamId;
use crate::consumer::executor::BrokerExecutor;
use crate::consumer::mapper::{Mapper, Resolver, WorkerLink};
use crate::consumer::stream::MessageStream;
use crate::error::SpawnError;

/// Where to start consuming: a literal offset or one of the live range ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    Oldest,
    Newest,
    At(i64),
}

pub(crate) type Registry = HashSet<StreamId>;

/// Spawns message streams and guarantees at most one per `(topic, partition)`.
///
/// The factory also implements the [`Resolver`] hooks the mapper calls to
/// locate leader brokers and to build executors for them.
pub struct StreamFactory {
    client: Arc<dyn ClusterClient>,
    config: Config,
    mapper: Arc<dyn Mapper>,
    children: Arc<Mutex<Registry>>,
}

impl StreamFactory {
    pub fn new(client: Arc<dyn ClusterClient>, config: Config, mapper: Arc<dyn Mapper>) -> Arc<Self> {
        Arc::new(StreamFactory {
            client,
            config,
            mapper,
            children: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Spawns a stream for the partition, resolving `offset` against the
    /// live range first. Returns the stream and the offset its first fetch
    /// will actually request.
    ///
    /// The range ends may move between the lookup here and the first fetch;
    /// the fetch reconciles, possibly with an out-of-range error.
    pub async fn spawn_message_stream(
        &self,
        topic: &str,
        partition: i32,
        offset: StartOffset,
    ) -> Result<(MessageStream, i64), SpawnError> {
        let concrete_offset = self.choose_starting_offset(topic, partition, offset).await?;

        let id = StreamId::new(topic, partition);
        {
            let mut children = self.children.lock().expect("stream registry poisoned");
            if !children.insert(id.clone()) {
                return Err(SpawnError::AlreadyConsuming {
                    topic: topic.to_string(),
                    partition,
                });
            }
        }
        let stream = MessageStream::spawn(
            id.clone(),
            concrete_offset,
            &self.config.consumer,
            Arc::clone(&self.mapper),
            Arc::clone(&self.children),
        );
        tracing::info!(stream = %id, offset = concrete_offset, "message stream spawned");
        metrics::counter!("krill_streams_spawned_total").increment(1);
        self.mapper.worker_spawned(stream.link());
        Ok((stream, concrete_offset))
    }

    /// Stops the mapper. Every stream must have been stopped first.
    pub async fn stop(&self) {
        let remaining = self
            .children
            .lock()
            .expect("stream registry poisoned")
            .len();
        if remaining > 0 {
            tracing::warn!(remaining, "factory stopped with live streams");
        }
        self.mapper.stop().await;
    }

    async fn choose_starting_offset(
        &self,
        topic: &str,
        partition: i32,
        offset: StartOffset,
    ) -> Result<i64, SpawnError> {
        let newest = self
            .client
            .get_offset(topic, partition, OffsetAt::Newest)
            .await?;
        let oldest = self
            .client
            .get_offset(topic, partition, OffsetAt::Oldest)
            .await?;

        Ok(match offset {
            StartOffset::Newest => newest,
            StartOffset::Oldest => oldest,
            StartOffset::At(requested) if requested > newest => newest,
            StartOffset::At(requested) if requested < oldest => oldest,
            StartOffset::At(requested) => requested,
        })
    }
}

#[async_trait]
impl Resolver for StreamFactory {
    async fn resolve_broker(
        &self,
        worker: &WorkerLink,
    ) -> krill_cluster::Result<Arc<dyn BrokerLink>> {
        self.client.refresh_metadata(worker.id().topic()).await?;
        self.client
            .leader(worker.id().topic(), worker.id().partition())
            .await
    }

    fn spawn_executor(&self, broker: Arc<dyn BrokerLink>) -> BrokerExecutor {
        BrokerExecutor::spawn(broker, &self.config.consumer)
    }
}
