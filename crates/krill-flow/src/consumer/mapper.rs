//! Contracts between the engines and the worker-to-executor mapper.
//!
//! # Purpose
//! The mapper owns executor lifetimes and decides which broker executor each
//! worker talks to. The engines do not implement one; they expose what a
//! mapper needs: every stream presents itself as a [`WorkerLink`], the
//! factory implements [`Resolver`], and assignments come back through the
//! worker's assignment channel as [`Assignment`] values.

use async_trait::async_trait;
use krill_cluster::BrokerLink;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::consumer::StreamId;
use crate::consumer::executor::{BrokerExecutor, ExecutorHandle};

/// What the mapper posts to a worker: the executor for its current leader
/// broker, or `None` when no leader is known.
pub type Assignment = Option<ExecutorHandle>;

/// The worker half the mapper holds on to: an identity plus the channel
/// that accepts assignments.
#[derive(Clone)]
pub struct WorkerLink {
    id: StreamId,
    assignment_tx: mpsc::Sender<Assignment>,
}

impl WorkerLink {
    pub(crate) fn new(id: StreamId, assignment_tx: mpsc::Sender<Assignment>) -> Self {
        WorkerLink { id, assignment_tx }
    }

    pub fn id(&self) -> &StreamId {
        &self.id
    }

    /// Posts an assignment to the worker; returns false when the worker is
    /// already gone.
    pub async fn assign(&self, assignment: Assignment) -> bool {
        self.assignment_tx.send(assignment).await.is_ok()
    }
}

impl fmt::Display for WorkerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker({})", self.id)
    }
}

impl fmt::Debug for WorkerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerLink").field("id", &self.id).finish()
    }
}

/// Assignment machinery consumed by the engines.
///
/// The worker notifications are fire-and-forget; implementations queue them
/// and react on their own schedule.
#[async_trait]
pub trait Mapper: Send + Sync + 'static {
    /// A freshly spawned worker that needs an executor.
    fn worker_spawned(&self, worker: WorkerLink);

    /// The worker wants a new executor: its broker failed, or it never had
    /// one.
    fn worker_reassign(&self, worker: WorkerLink);

    /// The worker will neither send nor receive from now on.
    fn worker_stopped(&self, worker: WorkerLink);

    /// Shuts the mapper down together with the executors it owns.
    async fn stop(&self);
}

/// Hooks the mapper calls back into; implemented by the stream factory.
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    /// Refreshes metadata for the worker's topic and returns its current
    /// leader broker.
    async fn resolve_broker(
        &self,
        worker: &WorkerLink,
    ) -> krill_cluster::Result<Arc<dyn BrokerLink>>;

    /// Builds a running executor for a broker connection.
    fn spawn_executor(&self, broker: Arc<dyn BrokerLink>) -> BrokerExecutor;
}
