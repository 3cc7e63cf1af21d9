//! The per-partition worker.
//!
//! # Design notes
//! A stream is one select loop over six arms: assignments from the mapper,
//! the slot to hand a fetch request to its executor, the reply to the
//! outstanding fetch, the slot to push the next parsed message to the
//! caller, the reassign retry timer, and the stop signal. Arms two through
//! five are optional; a disabled arm is an unarmed `Option` parked on a
//! never-resolving future (see `chan`). The loop keeps the message channel
//! fed by fetching from the assigned broker executor as needed, and never
//! has more than one fetch outstanding.

use krill_cluster::ClusterError;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::error::SendError;
use tokio::sync::mpsc::OwnedPermit;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep, sleep};

use crate::chan::{recv_opt, reserve_opt, tick_opt};
use crate::config::ConsumerConfig;
use crate::consumer::executor::{ExecutorHandle, FetchReply, FetchReq};
use crate::consumer::factory::Registry;
use crate::consumer::mapper::{Assignment, Mapper, WorkerLink};
use crate::consumer::{Message, StreamId};
use crate::error::{ConsumeError, StreamError};

/// A running per-partition consumer.
///
/// Created by the stream factory; consumed messages arrive on
/// [`recv`](MessageStream::recv). Dropping the handle without calling
/// [`stop`](MessageStream::stop) also shuts the worker down, but skips the
/// synchronous handshake with the factory and mapper.
pub struct MessageStream {
    id: StreamId,
    messages_rx: mpsc::Receiver<Message>,
    errors_rx: mpsc::Receiver<StreamError>,
    closing_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
    link: WorkerLink,
    mapper: Arc<dyn Mapper>,
    registry: Arc<Mutex<Registry>>,
}

impl std::fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStream").field("id", &self.id).finish_non_exhaustive()
    }
}

impl MessageStream {
    pub(crate) fn spawn(
        id: StreamId,
        offset: i64,
        config: &ConsumerConfig,
        mapper: Arc<dyn Mapper>,
        registry: Arc<Mutex<Registry>>,
    ) -> Self {
        let (assignment_tx, assignment_rx) = mpsc::channel(1);
        let (messages_tx, messages_rx) = mpsc::channel(config.channel_buffer_size);
        let (errors_tx, errors_rx) = mpsc::channel(config.channel_buffer_size);
        let (closing_tx, closing_rx) = oneshot::channel();
        let link = WorkerLink::new(id.clone(), assignment_tx);
        let worker = StreamWorker {
            id: id.clone(),
            config: config.clone(),
            mapper: Arc::clone(&mapper),
            link: link.clone(),
            assignment_rx,
            messages_tx,
            errors_tx,
            closing_rx,
            offset,
            fetch_size: config.fetch_default_bytes,
            lag: 0,
            assigned: None,
            request_enabled: false,
            in_flight: None,
            backlog: VecDeque::new(),
            retry_timer: None,
            last_reassign: None,
        };
        let task = tokio::spawn(run_stream_loop(worker));
        MessageStream {
            id,
            messages_rx,
            errors_rx,
            closing_tx,
            task,
            link,
            mapper,
            registry,
        }
    }

    pub fn id(&self) -> &StreamId {
        &self.id
    }

    /// Receives the next fetched message; `None` once the stream stopped.
    pub async fn recv(&mut self) -> Option<Message> {
        self.messages_rx.recv().await
    }

    /// The message channel itself, for callers that select over it.
    pub fn messages(&mut self) -> &mut mpsc::Receiver<Message> {
        &mut self.messages_rx
    }

    /// Consumer errors. Only populated when `return_errors` is set; sends
    /// are non-blocking, so an undrained channel silently sheds errors.
    pub fn errors(&mut self) -> &mut mpsc::Receiver<StreamError> {
        &mut self.errors_rx
    }

    /// Stops the worker loop, unregisters the stream from its factory and
    /// tells the mapper the worker is gone. Messages still buffered in the
    /// handle are discarded.
    pub async fn stop(self) {
        let _ = self.closing_tx.send(());
        let _ = self.task.await;
        self.registry
            .lock()
            .expect("stream registry poisoned")
            .remove(&self.id);
        self.mapper.worker_stopped(self.link.clone());
        tracing::info!(stream = %self.id, "message stream stopped");
    }

    pub(crate) fn link(&self) -> WorkerLink {
        self.link.clone()
    }
}

struct StreamWorker {
    id: StreamId,
    config: ConsumerConfig,
    mapper: Arc<dyn Mapper>,
    link: WorkerLink,
    assignment_rx: mpsc::Receiver<Assignment>,
    messages_tx: mpsc::Sender<Message>,
    errors_tx: mpsc::Sender<StreamError>,
    closing_rx: oneshot::Receiver<()>,

    /// Offset the next fetch must request; monotonically non-decreasing.
    offset: i64,
    fetch_size: i32,
    lag: i64,

    assigned: Option<ExecutorHandle>,
    request_enabled: bool,
    in_flight: Option<oneshot::Receiver<FetchReply>>,
    backlog: VecDeque<Message>,
    retry_timer: Option<Pin<Box<Sleep>>>,
    last_reassign: Option<Instant>,
}

enum Event {
    Assignment(Option<Assignment>),
    RequestSlot(Result<OwnedPermit<FetchReq>, SendError<()>>),
    Reply(Option<FetchReply>),
    DeliverSlot(Result<OwnedPermit<Message>, SendError<()>>),
    RetryFired,
    Closing,
}

async fn run_stream_loop(mut worker: StreamWorker) {
    tracing::debug!(stream = %worker.id, offset = worker.offset, "message stream started");
    loop {
        let fetch_tx = if worker.request_enabled {
            worker.assigned.as_ref().map(ExecutorHandle::request_sender)
        } else {
            None
        };
        let deliver_tx = (!worker.backlog.is_empty()).then(|| worker.messages_tx.clone());

        let event = tokio::select! {
            assignment = worker.assignment_rx.recv() => Event::Assignment(assignment),
            permit = reserve_opt(fetch_tx) => Event::RequestSlot(permit),
            reply = recv_opt(&mut worker.in_flight) => Event::Reply(reply),
            permit = reserve_opt(deliver_tx) => Event::DeliverSlot(permit),
            _ = tick_opt(&mut worker.retry_timer) => Event::RetryFired,
            _ = &mut worker.closing_rx => Event::Closing,
        };

        match event {
            Event::Assignment(Some(Some(executor))) => {
                tracing::debug!(stream = %worker.id, broker = executor.broker_id(), "executor assigned");
                worker.assigned = Some(executor);
                worker.retry_timer = None;
                // Let an outstanding fetch or a half-drained batch finish
                // before requesting from the new executor.
                if worker.in_flight.is_none() && worker.backlog.is_empty() {
                    worker.request_enabled = true;
                }
            }
            Event::Assignment(Some(None)) => worker.reassign("no leader assigned"),
            // The assignment channel cannot close while the worker holds its
            // own link; nothing to do if it somehow does.
            Event::Assignment(None) => {}
            Event::RequestSlot(Ok(permit)) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                permit.send(FetchReq {
                    topic: Arc::clone(worker.id.topic_arc()),
                    partition: worker.id.partition(),
                    offset: worker.offset,
                    max_bytes: worker.fetch_size,
                    lag: worker.lag,
                    reply: reply_tx,
                });
                worker.request_enabled = false;
                worker.in_flight = Some(reply_rx);
            }
            Event::RequestSlot(Err(_)) => {
                // The executor is tearing down underneath us.
                worker.request_enabled = false;
                worker.reassign("executor gone");
            }
            Event::Reply(reply) => {
                worker.in_flight = None;
                let reply = reply.unwrap_or(FetchReply {
                    response: None,
                    error: Some(ClusterError::Disconnected),
                });
                match worker.parse_fetch_reply(reply) {
                    Ok(messages) if messages.is_empty() => {
                        worker.request_enabled = true;
                    }
                    Ok(messages) => {
                        worker.backlog = messages;
                    }
                    Err(cause) => {
                        tracing::info!(stream = %worker.id, error = %cause, "fetch failed");
                        let fatal =
                            matches!(cause, ConsumeError::Cluster(ClusterError::OffsetOutOfRange));
                        worker.report_error(cause);
                        if fatal {
                            // Retrying cannot help: the requested offset no
                            // longer exists on the broker.
                            break;
                        }
                        worker.reassign("fetch error");
                    }
                }
            }
            Event::DeliverSlot(Ok(permit)) => {
                if let Some(message) = worker.backlog.pop_front() {
                    worker.offset = message.offset + 1;
                    worker.lag = message.high_water_mark - message.offset;
                    metrics::counter!("krill_messages_emitted_total").increment(1);
                    permit.send(message);
                }
                if worker.backlog.is_empty() {
                    worker.request_enabled = true;
                }
            }
            Event::DeliverSlot(Err(_)) => {
                tracing::debug!(stream = %worker.id, "message receiver dropped, stopping");
                break;
            }
            Event::RetryFired => {
                worker.mapper.worker_reassign(worker.link.clone());
                tracing::debug!(stream = %worker.id, "reassign retried on timer");
                worker.retry_timer = Some(Box::pin(sleep(worker.config.retry_backoff)));
            }
            Event::Closing => break,
        }
    }
    tracing::debug!(stream = %worker.id, offset = worker.offset, "message stream loop done");
    // Dropping the worker closes the message and error channels.
}

impl StreamWorker {
    /// Drops the current executor and asks the mapper for a new one,
    /// rate-limited to once per backoff interval; the retry timer covers
    /// the deferred case.
    fn reassign(&mut self, reason: &str) {
        self.assigned = None;
        self.request_enabled = false;
        let now = Instant::now();
        let cooled = self
            .last_reassign
            .is_none_or(|at| now - at > self.config.retry_backoff);
        if cooled {
            tracing::info!(stream = %self.id, reason, "requesting reassignment");
            self.last_reassign = Some(now);
            self.mapper.worker_reassign(self.link.clone());
        } else {
            tracing::debug!(stream = %self.id, reason, "reassignment deferred to retry timer");
        }
        self.retry_timer = Some(Box::pin(sleep(self.config.retry_backoff)));
    }

    /// Turns a fetch reply into deliverable messages, adapting the fetch
    /// size along the way.
    fn parse_fetch_reply(&mut self, reply: FetchReply) -> Result<VecDeque<Message>, ConsumeError> {
        if let Some(error) = reply.error {
            return Err(error.into());
        }
        let Some(response) = reply.response else {
            return Err(ConsumeError::IncompleteResponse);
        };
        let Some(block) = response.block(self.id.topic(), self.id.partition()) else {
            return Err(ConsumeError::IncompleteResponse);
        };
        if let Some(error) = &block.error {
            return Err(error.clone().into());
        }

        if block.records.is_empty() {
            // Nothing this round. A partial trailing record means the next
            // record does not fit the current fetch size; otherwise we just
            // poll again and wait for one to be produced.
            if block.partial_trailing_record {
                let max = self.config.fetch_max_bytes;
                if max > 0 && self.fetch_size == max {
                    tracing::info!(stream = %self.id, offset = self.offset, "oversized record skipped");
                    metrics::counter!("krill_oversized_skipped_total").increment(1);
                    self.report_error(ConsumeError::MessageTooLarge);
                    // Skip the poisoned offset so the stream keeps moving.
                    self.offset += 1;
                    self.fetch_size = self.config.fetch_default_bytes;
                } else {
                    self.fetch_size = self.fetch_size.saturating_mul(2);
                    if max > 0 && self.fetch_size > max {
                        self.fetch_size = max;
                    }
                }
            }
            return Ok(VecDeque::new());
        }

        // Records arrived, so the adaptive fetch size has done its job.
        self.fetch_size = self.config.fetch_default_bytes;
        let mut messages = VecDeque::with_capacity(block.records.len());
        for record in &block.records {
            // The broker may return records from earlier in the block than
            // the requested offset.
            if record.offset < self.offset {
                continue;
            }
            messages.push_back(Message {
                topic: Arc::clone(self.id.topic_arc()),
                partition: self.id.partition(),
                key: record.key.clone(),
                value: record.value.clone(),
                offset: record.offset,
                high_water_mark: block.high_water_mark,
            });
        }
        if messages.is_empty() {
            return Err(ConsumeError::IncompleteResponse);
        }
        Ok(messages)
    }

    fn report_error(&mut self, cause: ConsumeError) {
        metrics::counter!("krill_stream_errors_total").increment(1);
        if !self.config.return_errors {
            tracing::debug!(stream = %self.id, error = %cause, "stream error suppressed");
            return;
        }
        let error = StreamError {
            topic: Arc::clone(self.id.topic_arc()),
            partition: self.id.partition(),
            cause,
        };
        // The error channel is advisory: shed rather than stall the loop.
        let _ = self.errors_tx.try_send(error);
    }
}
