// Shared doubles for the integration tests: a scriptable cluster, a
// reference mapper driving the factory's resolver hooks, and a mock async
// producer sink with configurable delivery delay.
#![allow(dead_code)]

use async_trait::async_trait;
use krill_cluster::{
    AsyncSink, BrokerLink, ClusterClient, ClusterError, FailedRecord, FetchRequest, FetchResponse,
    OffsetAt, ProduceRecord, Result as ClusterResult,
};
use krill_flow::consumer::executor::BrokerExecutor;
use krill_flow::consumer::mapper::{Mapper, Resolver, WorkerLink};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// One scripted answer a [`MockBroker`] hands out.
pub enum FetchOutcome {
    Response(FetchResponse),
    Error(ClusterError),
}

/// Pushes outcomes into a broker's script.
pub type Script = mpsc::UnboundedSender<FetchOutcome>;

/// Broker double: every fetch consumes one scripted outcome; with the
/// script empty it parks until the test pushes more or drops the script.
pub struct MockBroker {
    id: i32,
    outcomes: tokio::sync::Mutex<mpsc::UnboundedReceiver<FetchOutcome>>,
    pub fetch_calls: AtomicUsize,
    pub closed: AtomicUsize,
    requests: Mutex<Vec<FetchRequest>>,
}

impl MockBroker {
    pub fn new(id: i32) -> (Arc<Self>, Script) {
        let (script, outcomes) = mpsc::unbounded_channel();
        let broker = Arc::new(MockBroker {
            id,
            outcomes: tokio::sync::Mutex::new(outcomes),
            fetch_calls: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        });
        (broker, script)
    }

    /// Snapshot of every wire request this broker has seen.
    pub fn seen_requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    /// Waits until at least `count` wire requests have arrived.
    pub async fn wait_for_requests(&self, count: usize) {
        while self.requests.lock().expect("requests lock").len() < count {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl BrokerLink for MockBroker {
    fn id(&self) -> i32 {
        self.id
    }

    async fn fetch(&self, request: FetchRequest) -> ClusterResult<FetchResponse> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().expect("requests lock").push(request);
        match self.outcomes.lock().await.recv().await {
            Some(FetchOutcome::Response(response)) => Ok(response),
            Some(FetchOutcome::Error(error)) => Err(error),
            None => Err(ClusterError::Disconnected),
        }
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Cluster double with one logical partition range and a switchable leader.
pub struct MockCluster {
    oldest: AtomicI64,
    newest: AtomicI64,
    leader: AtomicI32,
    brokers: Mutex<HashMap<i32, Arc<MockBroker>>>,
    pub refreshes: AtomicUsize,
}

impl MockCluster {
    pub fn new(oldest: i64, newest: i64) -> Arc<Self> {
        Arc::new(MockCluster {
            oldest: AtomicI64::new(oldest),
            newest: AtomicI64::new(newest),
            leader: AtomicI32::new(0),
            brokers: Mutex::new(HashMap::new()),
            refreshes: AtomicUsize::new(0),
        })
    }

    /// Registers a broker and makes it the leader if none is set yet.
    pub fn add_broker(&self, id: i32) -> (Arc<MockBroker>, Script) {
        let (broker, script) = MockBroker::new(id);
        self.brokers
            .lock()
            .expect("brokers lock")
            .insert(id, Arc::clone(&broker));
        let _ = self
            .leader
            .compare_exchange(0, id, Ordering::SeqCst, Ordering::SeqCst);
        (broker, script)
    }

    pub fn set_leader(&self, id: i32) {
        self.leader.store(id, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn get_offset(&self, _topic: &str, _partition: i32, at: OffsetAt) -> ClusterResult<i64> {
        Ok(match at {
            OffsetAt::Oldest => self.oldest.load(Ordering::SeqCst),
            OffsetAt::Newest => self.newest.load(Ordering::SeqCst),
        })
    }

    async fn refresh_metadata(&self, _topic: &str) -> ClusterResult<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn leader(&self, _topic: &str, _partition: i32) -> ClusterResult<Arc<dyn BrokerLink>> {
        let id = self.leader.load(Ordering::SeqCst);
        let brokers = self.brokers.lock().expect("brokers lock");
        match brokers.get(&id) {
            Some(broker) => Ok(Arc::clone(broker) as Arc<dyn BrokerLink>),
            None => Err(ClusterError::UnknownTopicOrPartition),
        }
    }

    async fn async_producer(&self) -> ClusterResult<AsyncSink> {
        Ok(spawn_mock_sink(Duration::ZERO, None))
    }
}

enum MapperEvent {
    Spawned(WorkerLink),
    Reassign(WorkerLink),
    Stopped(WorkerLink),
    Install(Arc<dyn Resolver>),
    Stop(oneshot::Sender<()>),
}

/// Reference mapper: resolves every spawned or reassign-requesting worker
/// through the factory's hooks, keeps one executor per broker id, and stops
/// them all on shutdown. Tests must stop streams (and drop broker scripts)
/// before stopping the mapper, or executor shutdown will wait on them.
pub struct TestMapper {
    events_tx: mpsc::UnboundedSender<MapperEvent>,
    pub reassigns: AtomicUsize,
}

impl TestMapper {
    pub fn spawn() -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_mapper_loop(events_rx));
        Arc::new(TestMapper {
            events_tx,
            reassigns: AtomicUsize::new(0),
        })
    }

    /// Binds the resolver; worker events that arrived earlier are replayed.
    pub fn install_resolver(&self, resolver: Arc<dyn Resolver>) {
        let _ = self.events_tx.send(MapperEvent::Install(resolver));
    }

    pub fn reassign_count(&self) -> usize {
        self.reassigns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Mapper for TestMapper {
    fn worker_spawned(&self, worker: WorkerLink) {
        let _ = self.events_tx.send(MapperEvent::Spawned(worker));
    }

    fn worker_reassign(&self, worker: WorkerLink) {
        self.reassigns.fetch_add(1, Ordering::SeqCst);
        let _ = self.events_tx.send(MapperEvent::Reassign(worker));
    }

    fn worker_stopped(&self, worker: WorkerLink) {
        let _ = self.events_tx.send(MapperEvent::Stopped(worker));
    }

    async fn stop(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.events_tx.send(MapperEvent::Stop(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

async fn run_mapper_loop(mut events_rx: mpsc::UnboundedReceiver<MapperEvent>) {
    let mut resolver: Option<Arc<dyn Resolver>> = None;
    let mut waiting: Vec<WorkerLink> = Vec::new();
    let mut executors: HashMap<i32, BrokerExecutor> = HashMap::new();
    while let Some(event) = events_rx.recv().await {
        match event {
            MapperEvent::Install(installed) => {
                for worker in waiting.drain(..) {
                    resolve_and_assign(&installed, &mut executors, worker).await;
                }
                resolver = Some(installed);
            }
            MapperEvent::Spawned(worker) | MapperEvent::Reassign(worker) => match &resolver {
                Some(resolver) => resolve_and_assign(resolver, &mut executors, worker).await,
                None => waiting.push(worker),
            },
            MapperEvent::Stopped(_worker) => {}
            MapperEvent::Stop(ack) => {
                for (_, executor) in executors.drain() {
                    executor.stop().await;
                }
                let _ = ack.send(());
                break;
            }
        }
    }
}

async fn resolve_and_assign(
    resolver: &Arc<dyn Resolver>,
    executors: &mut HashMap<i32, BrokerExecutor>,
    worker: WorkerLink,
) {
    match resolver.resolve_broker(&worker).await {
        Ok(broker) => {
            let executor = executors
                .entry(broker.id())
                .or_insert_with(|| resolver.spawn_executor(broker));
            let _ = worker.assign(Some(executor.handle())).await;
        }
        Err(_) => {
            let _ = worker.assign(None).await;
        }
    }
}

/// Async sink double delivering each record `ack_delay` after intake;
/// records whose topic matches `fail_topic` come back on the error channel.
/// The close signal drops whatever is still queued, like the real sink.
pub fn spawn_mock_sink(ack_delay: Duration, fail_topic: Option<String>) -> AsyncSink {
    let (input_tx, mut input_rx) = mpsc::channel::<ProduceRecord>(128);
    let (success_tx, success_rx) = mpsc::channel(128);
    let (error_tx, error_rx) = mpsc::channel(128);
    let (close_tx, mut close_rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut queued: VecDeque<(ProduceRecord, Instant)> = VecDeque::new();
        let mut open = true;
        loop {
            let next_due = queued.front().map(|(_, due)| *due);
            tokio::select! {
                record = input_rx.recv(), if open => match record {
                    Some(record) => queued.push_back((record, Instant::now() + ack_delay)),
                    None => open = false,
                },
                _ = sleep_until_next(next_due) => {
                    if let Some((record, _)) = queued.pop_front() {
                        match &fail_topic {
                            Some(topic) if record.topic == *topic => {
                                let _ = error_tx
                                    .send(FailedRecord { record, error: ClusterError::Timeout })
                                    .await;
                            }
                            _ => {
                                let _ = success_tx.send(record).await;
                            }
                        }
                    }
                }
                _ = &mut close_rx => break,
            }
            if !open && queued.is_empty() {
                break;
            }
        }
    });
    AsyncSink {
        input: input_tx,
        successes: success_rx,
        errors: error_rx,
        close: close_tx,
    }
}

async fn sleep_until_next(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}
