//! Producer front-end with graceful shutdown.
//!
//! # Purpose
//! The asynchronous sink behind the cluster client drops whatever it holds
//! the moment it is closed. [`GracefulProducer`] fronts it with a dispatcher
//! that tracks every accepted submission and, on [`stop`](GracefulProducer::stop),
//! keeps handling acknowledgements for a bounded window so in-flight records
//! get their verdict before the sink is torn down.
//!
//! # Design notes
//! The dispatcher intake is a two-stroke machine: it accepts one record,
//! forwards it to the sink, and only then accepts the next, which keeps
//! back-pressure on callers. Verdicts are handled on either stroke. The
//! merger folds the sink's success and error channels into one result
//! stream and closes it once both sink channels have closed; that close is
//! how the dispatcher learns that nothing else is in flight.

use bytes::Bytes;
use krill_cluster::{AsyncSink, ClusterClient, ClusterError, FailedRecord, ProduceRecord};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::chan::reserve_opt;
use crate::config::{PRODUCER_QUEUE_DEPTH, ProducerConfig};
use crate::error::ProduceError;

/// Bound on key/value previews in failure logs.
const REPR_MAX_BYTES: usize = 4096;

/// Verdict on one submission: the record and the sink error, if any.
#[derive(Debug)]
pub struct ProduceResult {
    pub record: ProduceRecord,
    pub error: Option<ClusterError>,
}

/// Async produce front-end that survives an orderly shutdown.
pub struct GracefulProducer {
    // `None` once `stop()` has taken it; the drop is what closes the intake.
    dispatcher_tx: std::sync::Mutex<Option<mpsc::Sender<ProduceRecord>>>,
    dispatcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    merger: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl GracefulProducer {
    /// Starts the dispatcher and merger over `sink`. Failures of
    /// fire-and-forget submissions go to `dead_letter` when one is given.
    pub fn spawn(
        sink: AsyncSink,
        config: ProducerConfig,
        dead_letter: Option<mpsc::Sender<ProduceResult>>,
    ) -> Self {
        let AsyncSink {
            input,
            successes,
            errors,
            close,
        } = sink;
        let (dispatcher_tx, dispatcher_rx) = mpsc::channel(PRODUCER_QUEUE_DEPTH);
        let (result_tx, result_rx) = mpsc::channel(PRODUCER_QUEUE_DEPTH);
        let merger = tokio::spawn(run_merger_loop(successes, errors, result_tx));
        let dispatcher = tokio::spawn(run_dispatcher_loop(
            dispatcher_rx,
            input,
            result_rx,
            close,
            config.shutdown_timeout,
            dead_letter,
        ));
        GracefulProducer {
            dispatcher_tx: std::sync::Mutex::new(Some(dispatcher_tx)),
            dispatcher: tokio::sync::Mutex::new(Some(dispatcher)),
            merger: tokio::sync::Mutex::new(Some(merger)),
        }
    }

    /// Spawns a producer over the cluster client's async sink.
    pub async fn from_client(
        client: &dyn ClusterClient,
        config: ProducerConfig,
        dead_letter: Option<mpsc::Sender<ProduceResult>>,
    ) -> Result<Self, ProduceError> {
        let sink = client.async_producer().await?;
        Ok(GracefulProducer::spawn(sink, config, dead_letter))
    }

    /// Submits a record and waits for the sink's verdict.
    pub async fn produce(
        &self,
        topic: &str,
        key: Option<Bytes>,
        value: Bytes,
    ) -> Result<(), ProduceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let record = ProduceRecord {
            topic: topic.to_string(),
            key,
            value,
            reply: Some(reply_tx),
        };
        self.intake()?.send(record).await.map_err(|_| ProduceError::Closed)?;
        match reply_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(ProduceError::Sink(error)),
            // The reply sender went down with the record in the force-close
            // phase.
            Err(_) => Err(ProduceError::Dropped),
        }
    }

    /// Submits a record without waiting for the verdict. Success is silent;
    /// failures are routed to the dead-letter channel.
    pub async fn produce_async(&self, topic: &str, key: Option<Bytes>, value: Bytes) {
        let record = ProduceRecord {
            topic: topic.to_string(),
            key,
            value,
            reply: None,
        };
        let Ok(intake) = self.intake() else {
            tracing::debug!(topic, "async submission after producer stop discarded");
            return;
        };
        if intake.send(record).await.is_err() {
            tracing::debug!(topic, "async submission after producer stop discarded");
        }
    }

    /// Closes the intake, drains pending acknowledgements within the
    /// configured shutdown window, then force-closes the sink and handles
    /// whatever verdicts it still emits. Idempotent.
    pub async fn stop(&self) {
        let intake = self
            .dispatcher_tx
            .lock()
            .expect("producer intake poisoned")
            .take();
        drop(intake);
        if let Some(handle) = self.dispatcher.lock().await.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.merger.lock().await.take() {
            let _ = handle.await;
        }
    }

    fn intake(&self) -> Result<mpsc::Sender<ProduceRecord>, ProduceError> {
        self.dispatcher_tx
            .lock()
            .expect("producer intake poisoned")
            .clone()
            .ok_or(ProduceError::Closed)
    }
}

async fn run_dispatcher_loop(
    mut dispatcher_rx: mpsc::Receiver<ProduceRecord>,
    sink_tx: mpsc::Sender<ProduceRecord>,
    mut result_rx: mpsc::Receiver<ProduceResult>,
    close_tx: oneshot::Sender<()>,
    shutdown_timeout: Duration,
    dead_letter: Option<mpsc::Sender<ProduceResult>>,
) {
    let mut pending: usize = 0;
    let mut staged: Option<ProduceRecord> = None;
    let mut results_open = true;
    loop {
        let forward_tx = staged.is_some().then(|| sink_tx.clone());
        tokio::select! {
            record = dispatcher_rx.recv(), if staged.is_none() => match record {
                Some(record) => {
                    pending += 1;
                    staged = Some(record);
                }
                None => break,
            },
            permit = reserve_opt(forward_tx) => match (permit, staged.take()) {
                (Ok(permit), Some(record)) => {
                    permit.send(record);
                }
                (Err(_), Some(record)) => {
                    // Sink input gone: fail the record on the spot.
                    pending -= 1;
                    handle_produce_result(
                        ProduceResult { record, error: Some(ClusterError::Disconnected) },
                        &dead_letter,
                    )
                    .await;
                }
                (_, None) => {}
            },
            result = result_rx.recv(), if results_open => match result {
                Some(result) => {
                    pending -= 1;
                    handle_produce_result(result, &dead_letter).await;
                }
                None => results_open = false,
            },
        }
    }

    // Graceful drain: give the sink a window to flush what it holds.
    tracing::info!(pending, "producer stopping, draining in-flight submissions");
    let deadline = sleep(shutdown_timeout);
    tokio::pin!(deadline);
    while pending > 0 && results_open {
        tokio::select! {
            _ = &mut deadline => break,
            result = result_rx.recv() => match result {
                Some(result) => {
                    pending -= 1;
                    handle_produce_result(result, &dead_letter).await;
                }
                None => results_open = false,
            },
        }
    }

    // Force close: the sink drops what it still holds and closes its output
    // channels; handle every verdict that beats the teardown.
    tracing::info!(pending, "force-closing producer sink");
    let _ = close_tx.send(());
    while let Some(result) = result_rx.recv().await {
        pending = pending.saturating_sub(1);
        handle_produce_result(result, &dead_letter).await;
    }
    if pending > 0 {
        metrics::counter!("krill_produce_dropped_total").increment(pending as u64);
        tracing::warn!(dropped = pending, "submissions dropped at producer shutdown");
    }
}

/// Folds the sink's success and error channels into uniform results; exits
/// only after both have closed, then closes the result channel.
async fn run_merger_loop(
    mut successes: mpsc::Receiver<ProduceRecord>,
    mut errors: mpsc::Receiver<FailedRecord>,
    result_tx: mpsc::Sender<ProduceResult>,
) {
    let mut successes_open = true;
    let mut errors_open = true;
    while successes_open || errors_open {
        tokio::select! {
            record = successes.recv(), if successes_open => match record {
                Some(record) => {
                    if result_tx
                        .send(ProduceResult { record, error: None })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                None => successes_open = false,
            },
            failed = errors.recv(), if errors_open => match failed {
                Some(FailedRecord { record, error }) => {
                    if result_tx
                        .send(ProduceResult { record, error: Some(error) })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                None => errors_open = false,
            },
        }
    }
}

/// Answers the submitter (sync) or the dead-letter channel (async failure),
/// exactly once per result.
async fn handle_produce_result(
    result: ProduceResult,
    dead_letter: &Option<mpsc::Sender<ProduceResult>>,
) {
    let ProduceResult { mut record, error } = result;
    if let Some(reply) = record.reply.take() {
        let verdict = match &error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        };
        let _ = reply.send(verdict);
    }
    let Some(error) = error else {
        metrics::counter!("krill_produce_acked_total").increment(1);
        return;
    };
    metrics::counter!("krill_produce_failed_total").increment(1);
    tracing::error!(
        topic = %record.topic,
        key = %preview(record.key.as_ref()),
        value = %preview(Some(&record.value)),
        error = %error,
        "failed to submit record"
    );
    if let Some(dead_letter) = dead_letter {
        let _ = dead_letter
            .send(ProduceResult {
                record,
                error: Some(error),
            })
            .await;
    }
}

/// Bounded preview of a record field for failure logs.
fn preview(field: Option<&Bytes>) -> String {
    let Some(bytes) = field else {
        return "<none>".to_string();
    };
    match std::str::from_utf8(bytes) {
        Ok(text) if text.len() <= REPR_MAX_BYTES => text.to_string(),
        Ok(text) => {
            let mut cut = REPR_MAX_BYTES;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            format!("{}... ({} bytes more)", &text[..cut], text.len() - cut)
        }
        Err(_) => format!("<{} binary bytes>", bytes.len()),
    }
}
