// Select-arm helpers for optional channels.
//
// The worker loops encode "this arm is disabled" as an `Option`; an arm
// whose slot is `None` parks on a future that never resolves, which is the
// select-friendly rendition of a nil channel.
use std::future;
use std::pin::Pin;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::mpsc::{OwnedPermit, Sender};
use tokio::sync::oneshot;
use tokio::time::Sleep;

/// Waits for send capacity on `tx`, or forever when the arm is disabled.
pub(crate) async fn reserve_opt<T>(tx: Option<Sender<T>>) -> Result<OwnedPermit<T>, SendError<()>> {
    match tx {
        Some(tx) => tx.reserve_owned().await,
        None => future::pending().await,
    }
}

/// Waits for the reply in `slot`, or forever when none is outstanding.
/// Returns `None` when the other side dropped without answering.
pub(crate) async fn recv_opt<T>(slot: &mut Option<oneshot::Receiver<T>>) -> Option<T> {
    match slot {
        Some(rx) => rx.await.ok(),
        None => future::pending().await,
    }
}

/// Waits for the timer in `slot`, or forever when it is unarmed.
pub(crate) async fn tick_opt(slot: &mut Option<Pin<Box<Sleep>>>) {
    match slot {
        Some(timer) => timer.as_mut().await,
        None => future::pending().await,
    }
}
