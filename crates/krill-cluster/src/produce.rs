// Submission and acknowledgement types for the asynchronous producer sink.
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::ClusterError;

/// The verdict a synchronous submitter is waiting on.
pub type ProduceReply = std::result::Result<(), ClusterError>;

/// One record submitted for production.
///
/// A synchronous caller rides along as the `reply` sender; the producer
/// front-end answers it exactly once when the sink acknowledges or rejects
/// the record. Fire-and-forget submissions carry no reply slot.
#[derive(Debug)]
pub struct ProduceRecord {
    pub topic: String,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub reply: Option<oneshot::Sender<ProduceReply>>,
}

/// A record the sink failed to deliver, with the cause attached.
#[derive(Debug)]
pub struct FailedRecord {
    pub record: ProduceRecord,
    pub error: ClusterError,
}

/// Channel bundle of an asynchronous producer pipeline.
///
/// The sink accepts records on `input`, reports delivered records on
/// `successes` and failed ones (with the original record) on `errors`.
/// Sending on `close` asks the sink to stop flushing, drop what it still
/// holds and close both output channels.
pub struct AsyncSink {
    pub input: mpsc::Sender<ProduceRecord>,
    pub successes: mpsc::Receiver<ProduceRecord>,
    pub errors: mpsc::Receiver<FailedRecord>,
    pub close: oneshot::Sender<()>,
}
