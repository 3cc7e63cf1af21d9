//! Per-broker fetch batching.
//!
//! # Design notes
//! Two loops cooperate per broker connection. The aggregator buffers
//! incoming fetch requests and offers the buffer to the sender; the handoff
//! completes only when the sender is free, so batches grow exactly while
//! the wire is busy. The sender turns one batch into one wire request and
//! fans the single response out to every requester. After a connection
//! failure it answers whole batches with the recorded error for one backoff
//! interval, which keeps a dead broker from soaking up the worker pool.

use krill_cluster::{BrokerLink, ClusterError, FetchRequest, FetchResponse};
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{ConsumerConfig, EXECUTOR_QUEUE_DEPTH};

/// One partition's ask against a broker, carrying the reply slot the answer
/// must land on.
#[derive(Debug)]
pub struct FetchReq {
    pub topic: Arc<str>,
    pub partition: i32,
    pub offset: i64,
    pub max_bytes: i32,
    /// Last known lag of the requesting stream, for observability.
    pub lag: i64,
    pub reply: oneshot::Sender<FetchReply>,
}

/// One answer to a [`FetchReq`]: a shared response on success, the
/// connection error otherwise.
#[derive(Debug, Clone)]
pub struct FetchReply {
    pub response: Option<Arc<FetchResponse>>,
    pub error: Option<ClusterError>,
}

/// Cloneable address of a running executor; what the mapper hands to
/// workers.
#[derive(Clone)]
pub struct ExecutorHandle {
    broker_id: i32,
    requests_tx: mpsc::Sender<FetchReq>,
}

impl ExecutorHandle {
    pub fn broker_id(&self) -> i32 {
        self.broker_id
    }

    pub(crate) fn request_sender(&self) -> mpsc::Sender<FetchReq> {
        self.requests_tx.clone()
    }

    /// Handle over a bare channel, for tests that play the executor role.
    #[cfg(test)]
    pub(crate) fn for_tests(broker_id: i32, requests_tx: mpsc::Sender<FetchReq>) -> Self {
        ExecutorHandle {
            broker_id,
            requests_tx,
        }
    }
}

/// A batcher and sender bound to one broker connection.
pub struct BrokerExecutor {
    handle: ExecutorHandle,
    broker: Arc<dyn BrokerLink>,
    aggregator: JoinHandle<()>,
    sender: JoinHandle<()>,
}

impl BrokerExecutor {
    /// Starts the aggregator and sender loops for `broker`.
    pub fn spawn(broker: Arc<dyn BrokerLink>, config: &ConsumerConfig) -> Self {
        let (requests_tx, requests_rx) = mpsc::channel(EXECUTOR_QUEUE_DEPTH);
        let (batch_tx, batch_rx) = mpsc::channel(1);
        let aggregator = tokio::spawn(run_aggregator_loop(requests_rx, batch_tx));
        let sender = tokio::spawn(run_sender_loop(
            Arc::clone(&broker),
            batch_rx,
            config.fetch_min_bytes,
            config.max_wait_time,
            config.retry_backoff,
        ));
        BrokerExecutor {
            handle: ExecutorHandle {
                broker_id: broker.id(),
                requests_tx,
            },
            broker,
            aggregator,
            sender,
        }
    }

    pub fn handle(&self) -> ExecutorHandle {
        self.handle.clone()
    }

    pub fn broker(&self) -> &Arc<dyn BrokerLink> {
        &self.broker
    }

    /// Releases the executor's own request sender and waits for both loops.
    /// The request channel closes once the last assigned stream lets go of
    /// its handle; requests already queued still receive replies.
    pub async fn stop(self) {
        drop(self.handle);
        let _ = self.aggregator.await;
        let _ = self.sender.await;
    }
}

/// Collects fetch requests into a batch while the sender is busy and hands
/// the batch over the moment it is free.
async fn run_aggregator_loop(
    mut requests_rx: mpsc::Receiver<FetchReq>,
    batch_tx: mpsc::Sender<Vec<FetchReq>>,
) {
    let mut batch: Vec<FetchReq> = Vec::new();
    loop {
        tokio::select! {
            request = requests_rx.recv() => match request {
                Some(request) => batch.push(request),
                None => break,
            },
            permit = batch_tx.reserve(), if !batch.is_empty() => match permit {
                Ok(permit) => permit.send(mem::take(&mut batch)),
                Err(_) => return,
            },
        }
    }
    // The input channel closed with requests still buffered; they were
    // accepted, so they still get replies.
    if !batch.is_empty() {
        let _ = batch_tx.send(batch).await;
    }
}

/// Executes batches: one wire call per batch, one reply per request.
async fn run_sender_loop(
    broker: Arc<dyn BrokerLink>,
    mut batch_rx: mpsc::Receiver<Vec<FetchReq>>,
    fetch_min_bytes: i32,
    max_wait_time: Duration,
    retry_backoff: Duration,
) {
    let mut last_error: Option<(ClusterError, Instant)> = None;
    while let Some(batch) = batch_rx.recv().await {
        // Reject fetches for a while after a connection failure so the
        // cluster has time to recuperate.
        if let Some((error, at)) = &last_error
            && at.elapsed() < retry_backoff
        {
            metrics::counter!("krill_fetch_short_circuited_total")
                .increment(batch.len() as u64);
            for request in batch {
                let _ = request.reply.send(FetchReply {
                    response: None,
                    error: Some(error.clone()),
                });
            }
            continue;
        }

        let mut wire = FetchRequest::new(fetch_min_bytes, max_wait_time);
        for request in &batch {
            wire.add_block(&request.topic, request.partition, request.offset, request.max_bytes);
        }
        let (response, error) = match broker.fetch(wire).await {
            Ok(response) => (Some(Arc::new(response)), None),
            Err(error) => {
                last_error = Some((error.clone(), Instant::now()));
                broker.close().await;
                tracing::info!(broker = broker.id(), error = %error, "broker connection reset");
                (None, Some(error))
            }
        };
        metrics::counter!("krill_fetch_batches_total").increment(1);
        for request in batch {
            let _ = request.reply.send(FetchReply {
                response: response.clone(),
                error: error.clone(),
            });
        }
    }
}
