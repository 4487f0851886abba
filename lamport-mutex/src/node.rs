//! The node process: event loop, inbound dispatch and multicast.
//!
//! A [`Node`] is the explicit context for one member of the cluster. It owns
//! the logical clock, the [`MutexCoordinator`], per-link sequence numbers and
//! counters behind a single async mutex. Two kinds of tasks touch that state:
//!
//! - the node's own event loop, which sends application traffic and runs
//!   critical-section cycles, and
//! - one short-lived task per inbound connection, spawned by the listener.
//!
//! Every state change happens under the lock. Messages are stamped while the
//! lock is held and written to the network after it is released, so a slow
//! peer never stalls inbound handling.
//!
//! The event loop waits for its grant on a [`Notify`] that the inbound path
//! signals after each protocol message. The lock is only taken for each
//! check, so replies and releases can always get through.
//!
//! Stopping is soft. A node asked to stop while inside the critical section
//! finishes it, releases and records the cycle; one still waiting for its
//! grant withdraws the request instead.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, ensure};
use tokio::{
    net::TcpListener,
    select,
    sync::{Mutex, Notify, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::audit::{AuditAction, AuditLog, AuditRecord};
use crate::clock::LogicalClock;
use crate::config::{ClusterConfig, NodeSettings, PeerDirectory};
use crate::message::{Message, MessageKind, NodeId};
use crate::metrics::{CycleMetrics, Metrics, MetricsLog};
use crate::mutex::MutexCoordinator;
use crate::queue::RequestEntry;
use crate::transport::{self, LinkOrder, Outbox, Transport};
use crate::workload::{Event, EventGenerator};

/// File name of the audit log shared by every node.
pub const SHARED_LOG: &str = "shared.log";

/// How long a stopping node keeps trying to flush queued messages.
const OUTBOX_GRACE: Duration = Duration::from_secs(2);

pub fn metrics_log_path(dir: &Path, id: NodeId) -> PathBuf {
    dir.join(format!("node{id}.log"))
}

/// Where a node is in its critical-section cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePhase {
    Idle,
    Requesting,
    WaitingGrant,
    InCriticalSection,
    Releasing,
    /// Quota reached; only inbound messages are served.
    Finished,
}

/// Everything needed to start one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: NodeId,
    pub directory: PeerDirectory,
    pub settings: NodeSettings,
    pub clock_seed: u64,
    /// Directory receiving `node<id>.log` and the shared audit log.
    pub log_dir: PathBuf,
}

impl NodeConfig {
    pub fn from_cluster(config: &ClusterConfig, id: NodeId) -> Result<Self> {
        Ok(Self {
            id,
            directory: config.directory()?,
            settings: config.settings.clone(),
            clock_seed: config.clock_seed(id)?,
            log_dir: config.log_dir(),
        })
    }
}

/// Point-in-time view of a node, for status output and tests.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub phase: NodePhase,
    pub clock: u64,
    pub queue: Vec<RequestEntry>,
    pub reply_count: usize,
    pub completed_cycles: u32,
    pub metrics: Metrics,
}

struct NodeState {
    clock: LogicalClock,
    mutex: MutexCoordinator,
    links: LinkOrder,
    metrics: Metrics,
    phase: NodePhase,
    completed_cycles: u32,
}

impl NodeState {
    /// Stamps a message for `receiver` with `timestamp` and a link sequence
    /// number, updating the send counters.
    fn stamp(
        &mut self,
        sender: NodeId,
        receiver: NodeId,
        timestamp: u64,
        kind: MessageKind,
    ) -> Message {
        match kind {
            MessageKind::Application => self.metrics.application_sent += 1,
            MessageKind::Request | MessageKind::Release => self.metrics.protocol_msgs += 1,
            MessageKind::Reply => {}
        }
        let seq = self.links.next_seq(receiver);
        Message::new(sender, receiver, timestamp, kind).with_seq(seq)
    }

    /// Builds a point-to-point message. Replies are never multicast, so they
    /// take their own clock step here.
    fn outbound(&mut self, sender: NodeId, receiver: NodeId, kind: MessageKind) -> Message {
        if kind == MessageKind::Reply {
            self.clock.local_event();
        }
        let timestamp = self.clock.peek();
        self.stamp(sender, receiver, timestamp, kind)
    }
}

pub struct Node {
    id: NodeId,
    peers: Vec<NodeId>,
    settings: NodeSettings,
    transport: Transport,
    outbox: Outbox,
    state: Mutex<NodeState>,
    grant: Notify,
    metrics_log: Mutex<MetricsLog>,
    audit: AuditLog,
}

impl Node {
    /// Builds the node and opens its log files.
    ///
    /// Failing to open either log is fatal: the node would run unaudited.
    pub async fn start(config: NodeConfig) -> Result<Arc<Self>> {
        let NodeConfig {
            id,
            directory,
            settings,
            clock_seed,
            log_dir,
        } = config;
        ensure!(
            directory.contains(id),
            "node id {id} missing from peer directory"
        );
        settings.validate()?;

        tokio::fs::create_dir_all(&log_dir)
            .await
            .with_context(|| format!("failed to create log dir {}", log_dir.display()))?;
        let metrics_log = MetricsLog::create(metrics_log_path(&log_dir, id)).await?;
        let audit = AuditLog::open(log_dir.join(SHARED_LOG))?;

        let peers = directory.peers_of(id);
        let state = NodeState {
            clock: LogicalClock::new(clock_seed),
            mutex: MutexCoordinator::new(id, peers.len()),
            links: LinkOrder::new(),
            metrics: Metrics::default(),
            phase: NodePhase::Idle,
            completed_cycles: 0,
        };

        let transport = Transport::new(id, Arc::new(directory));
        let outbox = Outbox::spawn(&transport, &peers, settings.connect_backoff());

        Ok(Arc::new(Self {
            id,
            peers,
            settings,
            transport,
            outbox,
            state: Mutex::new(state),
            grant: Notify::new(),
            metrics_log: Mutex::new(metrics_log),
            audit,
        }))
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    pub async fn clock(&self) -> u64 {
        self.state.lock().await.clock.peek()
    }

    pub async fn completed_cycles(&self) -> u32 {
        self.state.lock().await.completed_cycles
    }

    pub async fn snapshot(&self) -> NodeSnapshot {
        let state = self.state.lock().await;
        NodeSnapshot {
            id: self.id,
            phase: state.phase,
            clock: state.clock.peek(),
            queue: state.mutex.queue().iter().copied().collect(),
            reply_count: state.mutex.reply_count(),
            completed_cycles: state.completed_cycles,
            metrics: state.metrics,
        }
    }

    /// Serves inbound messages and runs the event loop until `shutdown`
    /// resolves.
    ///
    /// After the quota is reached the listener keeps running: other nodes
    /// still need this node's replies and must be able to release. When
    /// `shutdown` resolves mid-cycle, the cycle is brought to an end first.
    pub async fn run_until<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let (listener_stop_tx, listener_stop_rx) = oneshot::channel::<()>();
        let listener_task = self.spawn_listener(listener, listener_stop_rx);
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let drive = self.drive(&mut stop_rx);
        tokio::pin!(drive);
        tokio::pin!(shutdown);

        select! {
            _ = &mut drive => {
                info!(node = self.id, "quota reached, serving peers until shutdown");
                shutdown.await;
            }
            _ = &mut shutdown => {
                let _ = stop_tx.send(true);
                drive.await;
            }
        }

        info!(node = self.id, "node shutting down");
        self.outbox.close(OUTBOX_GRACE).await;
        let _ = listener_stop_tx.send(());
        match listener_task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(node = self.id, error = ?err, "listener exited with error"),
            Err(err) => warn!(node = self.id, error = ?err, "listener task failed"),
        }
        self.finish().await;
        Ok(())
    }

    fn spawn_listener(
        self: &Arc<Self>,
        listener: TcpListener,
        stop_rx: oneshot::Receiver<()>,
    ) -> JoinHandle<Result<()>> {
        let node = Arc::clone(self);
        tokio::spawn(transport::listen(
            listener,
            move |msg| {
                let node = Arc::clone(&node);
                async move { node.deliver_message(msg).await }
            },
            async move {
                let _ = stop_rx.await;
            },
        ))
    }

    /// Startup gate followed by the event loop. Returns `true` once the
    /// quota is reached and `false` when `stop` was raised first.
    async fn drive(&self, stop: &mut watch::Receiver<bool>) -> bool {
        let mut events = EventGenerator::new(self.id, &self.settings);

        let ready = async {
            tokio::time::sleep(self.settings.startup_delay()).await;
            self.transport
                .connect_all(&self.peers, self.settings.connect_backoff())
                .await;
        };
        select! {
            _ = ready => {}
            _ = stopped(stop) => return false,
        }

        loop {
            {
                let mut state = self.state.lock().await;
                if state.completed_cycles >= self.settings.quota {
                    state.phase = NodePhase::Finished;
                    return true;
                }
            }

            select! {
                _ = tokio::time::sleep(events.next_delay()) => {}
                _ = stopped(stop) => return false,
            }
            match events.next_event() {
                Event::Application => self.multicast(MessageKind::Application).await,
                Event::CriticalSection => {
                    if !self.run_cycle(&mut events, stop).await {
                        return false;
                    }
                }
            }
        }
    }

    /// One full request, grant, execute, release cycle.
    ///
    /// Returns `false` if `stop` was raised before the grant; the request is
    /// withdrawn and the critical section is skipped. Once entered, the cycle
    /// always runs to the end.
    pub async fn run_cycle(
        &self,
        events: &mut EventGenerator,
        stop: &mut watch::Receiver<bool>,
    ) -> bool {
        let started = Instant::now();
        let before = {
            let mut state = self.state.lock().await;
            state.phase = NodePhase::Requesting;
            state.metrics
        };

        self.multicast(MessageKind::Request).await;
        self.set_phase(NodePhase::WaitingGrant).await;
        let granted = select! {
            _ = self.wait_for_grant() => true,
            _ = stopped(stop) => false,
        };
        if !granted {
            self.withdraw_request().await;
            return false;
        }
        let delay = started.elapsed();

        self.execute_critical_section(events).await;

        {
            let mut state = self.state.lock().await;
            state.phase = NodePhase::Releasing;
            state.mutex.release_after_crit_section();
        }
        self.multicast(MessageKind::Release).await;

        let cycle = {
            let mut state = self.state.lock().await;
            state.completed_cycles += 1;
            state.phase = NodePhase::Idle;
            CycleMetrics::between(&before, &state.metrics, delay)
        };
        info!(
            node = self.id,
            proto_msgs = cycle.protocol_msgs,
            delay_ms = cycle.delay.as_millis() as u64,
            "critical section cycle complete"
        );
        if let Err(err) = self.metrics_log.lock().await.record_cycle(&cycle).await {
            error!(node = self.id, error = ?err, "failed to record cycle metrics");
        }
        true
    }

    /// Drops this node's pending request everywhere. Peers treat the release
    /// like any other and remove the entry from their queues.
    async fn withdraw_request(&self) {
        {
            let mut state = self.state.lock().await;
            state.phase = NodePhase::Releasing;
            state.mutex.release_after_crit_section();
        }
        info!(node = self.id, "stopping, request withdrawn before grant");
        self.multicast(MessageKind::Release).await;
        self.set_phase(NodePhase::Idle).await;
    }

    async fn set_phase(&self, phase: NodePhase) {
        self.state.lock().await.phase = phase;
    }

    /// Waits until this node's request heads the queue and every peer replied.
    async fn wait_for_grant(&self) {
        loop {
            {
                let state = self.state.lock().await;
                if state.mutex.request_crit_section() {
                    return;
                }
            }
            // notify_one stores a permit when nobody waits, so a signal sent
            // between the check and this await is not lost.
            self.grant.notified().await;
        }
    }

    async fn execute_critical_section(&self, events: &mut EventGenerator) {
        let entered = {
            let mut state = self.state.lock().await;
            state.phase = NodePhase::InCriticalSection;
            state.clock.peek()
        };
        self.audit(AuditAction::Entering, entered).await;
        info!(node = self.id, timestamp = entered, "entering critical section");

        tokio::time::sleep(events.critical_section_time()).await;

        let left = self.clock().await;
        self.audit(AuditAction::Leaving, left).await;
        info!(node = self.id, timestamp = left, "leaving critical section");
    }

    /// Appends to the shared log on the blocking pool, outside the node lock.
    async fn audit(&self, action: AuditAction, timestamp: u64) {
        let record = AuditRecord {
            node: self.id,
            action,
            timestamp,
        };
        let log = self.audit.clone();
        let result = tokio::task::spawn_blocking(move || log.append(&record))
            .await
            .context("audit writer panicked")
            .and_then(|written| written);
        if let Err(err) = result {
            error!(node = self.id, error = ?err, "failed to write audit log");
        }
    }

    /// Sends `kind` to every peer under a single clock step.
    ///
    /// A `request` also starts a new cycle and queues this node's own
    /// request before anything leaves, so no reply can beat it.
    pub async fn multicast(&self, kind: MessageKind) {
        let outbound: Vec<Message> = {
            let mut state = self.state.lock().await;
            let timestamp = state.clock.local_event();
            if kind == MessageKind::Request {
                state.mutex.begin_cycle();
                let own = Message::new(self.id, self.id, timestamp, kind);
                state.mutex.queue_request(&own);
            }
            self.peers
                .iter()
                .map(|&peer| state.stamp(self.id, peer, timestamp, kind))
                .collect()
        };
        if kind == MessageKind::Request {
            // A node without peers is granted by its own request.
            self.grant.notify_one();
        }
        self.dispatch(outbound);
    }

    /// Applies an inbound message.
    ///
    /// Messages pass through the link reorder buffer first, so one arrival
    /// may release several queued messages from the same sender.
    pub async fn deliver_message(&self, msg: Message) {
        if msg.receiver != self.id {
            warn!(node = self.id, %msg, "dropping message addressed to another node");
            return;
        }

        let (replies, signal) = {
            let mut state = self.state.lock().await;
            let mut replies = Vec::new();
            let mut signal = false;
            for msg in state.links.accept(msg) {
                let now = state.clock.msg_event(msg.timestamp);
                debug!(node = self.id, %msg, clock = now, "received");
                match msg.kind {
                    MessageKind::Request => {
                        state.mutex.queue_request(&msg);
                        replies.push(state.outbound(self.id, msg.sender, MessageKind::Reply));
                        signal = true;
                    }
                    MessageKind::Release => {
                        state.mutex.release_request(&msg);
                        signal = true;
                    }
                    MessageKind::Reply => {
                        state.mutex.reply_request(&msg);
                        state.metrics.protocol_msgs += 1;
                        signal = true;
                    }
                    MessageKind::Application => state.metrics.application_received += 1,
                }
            }
            (replies, signal)
        };

        if signal {
            self.grant.notify_one();
        }
        self.dispatch(replies);
    }

    /// Hands stamped messages to the per-peer outbound queues.
    fn dispatch(&self, outbound: Vec<Message>) {
        for msg in outbound {
            if let Err(err) = self.outbox.push(msg) {
                warn!(
                    node = self.id,
                    peer = msg.receiver,
                    kind = %msg.kind,
                    error = ?err,
                    "message dropped"
                );
            }
        }
    }

    /// Writes the shutdown summary to the metrics log.
    async fn finish(&self) {
        let metrics = self.state.lock().await.metrics;
        let mut log = self.metrics_log.lock().await;
        if let Err(err) = log.write_summary(&metrics).await {
            error!(node = self.id, error = ?err, "failed to write metrics summary");
        } else {
            info!(
                node = self.id,
                application_sent = metrics.application_sent,
                path = %log.path().display(),
                "metrics log closed"
            );
        }
    }
}

/// A node running in the background.
pub struct NodeHandle {
    node: Arc<Node>,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl NodeHandle {
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Stops the node and waits for it to flush its logs.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        self.task.await.context("node task panicked")?
    }
}

/// Starts a node on an already bound listener.
pub async fn spawn_node(config: NodeConfig, listener: TcpListener) -> Result<NodeHandle> {
    let node = Node::start(config).await?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(Arc::clone(&node).run_until(listener, async move {
        let _ = shutdown_rx.await;
    }));
    Ok(NodeHandle {
        node,
        shutdown_tx,
        task,
    })
}

/// Resolves once `stop` is raised, or its sender is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

/// Binds the listening socket registered for `id` in the directory.
pub async fn bind(directory: &PeerDirectory, id: NodeId) -> Result<TcpListener> {
    let addr = directory
        .addr(id)
        .with_context(|| format!("node id {id} missing from peer directory"))?;
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))
}
