//! Point-to-point messaging between nodes.
//!
//! Every message travels on its own TCP connection: connect, write one JSON
//! line, close. The listener side reads exactly one message per accepted
//! connection and hands it to a callback.
//!
//! Separate connections race each other, so the transport gives no ordering
//! guarantee. [`LinkOrder`] restores per-link send order from the sequence
//! number each message carries, and [`Outbox`] retries failed sends so that
//! sequence never has a gap while the node runs.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    select,
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::config::PeerDirectory;
use crate::message::{Message, NodeId, read_message, write_message};

/// Outbound side of the messaging layer for one node.
#[derive(Debug, Clone)]
pub struct Transport {
    id: NodeId,
    directory: Arc<PeerDirectory>,
}

impl Transport {
    pub fn new(id: NodeId, directory: Arc<PeerDirectory>) -> Self {
        Self { id, directory }
    }

    /// Delivers `msg` to its receiver over a fresh connection.
    ///
    /// Failures are returned as-is; there is no retry.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        let addr = self
            .directory
            .addr(msg.receiver)
            .ok_or_else(|| anyhow!("no address for node {}", msg.receiver))?;
        try_send(addr, msg)
            .await
            .with_context(|| format!("failed to send {} to {addr}", msg.kind))
    }

    /// Blocks until every peer has accepted one probe connection.
    ///
    /// Unreachable peers are retried after `backoff`, forever. The probe
    /// connections are closed right away; later sends open their own.
    pub async fn connect_all(&self, peers: &[NodeId], backoff: Duration) {
        for &peer in peers {
            let Some(addr) = self.directory.addr(peer) else {
                warn!(node = self.id, peer, "peer missing from directory, skipping");
                continue;
            };
            loop {
                match TcpStream::connect(addr).await {
                    Ok(mut stream) => {
                        let _ = stream.shutdown().await;
                        debug!(node = self.id, peer, %addr, "peer reachable");
                        break;
                    }
                    Err(err) => {
                        warn!(
                            node = self.id,
                            peer,
                            %addr,
                            error = %err,
                            "peer not reachable yet, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        info!(node = self.id, peers = peers.len(), "all peers reachable");
    }
}

async fn try_send(addr: SocketAddr, msg: &Message) -> std::io::Result<()> {
    let mut stream = TcpStream::connect(addr).await?;
    write_message(&mut stream, msg).await?;
    stream.shutdown().await
}

async fn run_link(
    transport: Transport,
    peer: NodeId,
    mut queue: mpsc::UnboundedReceiver<Message>,
    mut closing: watch::Receiver<bool>,
    backoff: Duration,
) {
    loop {
        let msg = if is_closing(&closing) {
            match queue.try_recv() {
                Ok(msg) => msg,
                Err(_) => break,
            }
        } else {
            select! {
                msg = queue.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
                _ = closing.changed() => continue,
            }
        };

        let mut attempts = 0u32;
        while let Err(err) = transport.send(&msg).await {
            attempts += 1;
            if is_closing(&closing) {
                warn!(
                    node = transport.id,
                    peer,
                    kind = %msg.kind,
                    error = ?err,
                    "send failed during shutdown, message abandoned"
                );
                break;
            }
            warn!(
                node = transport.id,
                peer,
                kind = %msg.kind,
                attempts,
                error = ?err,
                "send failed, retrying"
            );
            select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = closing.changed() => {}
            }
        }
    }
}

/// A dropped sender counts as closing too.
fn is_closing(closing: &watch::Receiver<bool>) -> bool {
    *closing.borrow() || closing.has_changed().is_err()
}

/// Accepts connections until `shutdown` resolves, reading one message from
/// each and passing it to `on_message`.
pub async fn listen<H, Fut, S>(listener: TcpListener, on_message: H, shutdown: S) -> Result<()>
where
    H: Fn(Message) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
    S: Future<Output = ()> + Send,
{
    tokio::pin!(shutdown);

    loop {
        select! {
            _ = &mut shutdown => break,
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer)) => {
                        spawn_connection_handler(stream, peer, on_message.clone())
                    }
                    Err(err) => warn!(error = ?err, "failed to accept connection"),
                }
            }
        }
    }

    Ok(())
}

fn spawn_connection_handler<H, Fut>(stream: TcpStream, peer: SocketAddr, on_message: H)
where
    H: Fn(Message) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        match read_one(stream).await {
            Ok(Some(msg)) => on_message(msg).await,
            // Startup probes connect and close without writing.
            Ok(None) => {}
            Err(err) => warn!(peer = %peer, error = ?err, "dropping malformed connection"),
        }
    });
}

async fn read_one(stream: TcpStream) -> std::io::Result<Option<Message>> {
    let mut reader = BufReader::new(stream);
    read_message::<_, Message>(&mut reader).await
}

/// Ordered, retrying outbound queues, one per peer.
///
/// Each peer gets a task that sends its messages one at a time in the order
/// they were pushed. A failed send is retried after `backoff` until it
/// succeeds. Once [`Outbox::close`] is called, whatever is still queued gets
/// one more attempt and is then dropped.
pub struct Outbox {
    id: NodeId,
    links: HashMap<NodeId, mpsc::UnboundedSender<Message>>,
    closing: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Outbox {
    pub fn spawn(transport: &Transport, peers: &[NodeId], backoff: Duration) -> Self {
        let (closing, closing_rx) = watch::channel(false);
        let mut links = HashMap::new();
        let mut tasks = Vec::with_capacity(peers.len());
        for &peer in peers {
            let (tx, rx) = mpsc::unbounded_channel();
            links.insert(peer, tx);
            tasks.push(tokio::spawn(run_link(
                transport.clone(),
                peer,
                rx,
                closing_rx.clone(),
                backoff,
            )));
        }
        Self {
            id: transport.id,
            links,
            closing,
            tasks: Mutex::new(tasks),
        }
    }

    /// Queues an already stamped message for its receiver.
    pub fn push(&self, msg: Message) -> Result<()> {
        let link = self
            .links
            .get(&msg.receiver)
            .ok_or_else(|| anyhow!("no outbound link to node {}", msg.receiver))?;
        link.send(msg)
            .map_err(|_| anyhow!("outbound link to node {} is closed", msg.receiver))
    }

    /// Stops retrying and waits up to `grace` for the queues to flush.
    pub async fn close(&self, grace: Duration) {
        let _ = self.closing.send(true);
        let deadline = Instant::now() + grace;
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout_at(deadline, task).await.is_err() {
                abort.abort();
                warn!(node = self.id, "outbound queue still busy at shutdown, dropping it");
            }
        }
    }
}
/// Held-message count at which [`LinkOrder`] starts warning, and the
/// step between repeated warnings.
const HELD_WARN_STEP: usize = 32;

/// Per-link sequence numbers on both sides of a node.
///
/// Outbound, each receiver gets its own counter. Inbound, messages from a
/// sender are released only in sequence order; early arrivals wait in a
/// buffer until the gap is filled.
#[derive(Debug, Default)]
pub struct LinkOrder {
    next_out: HashMap<NodeId, u64>,
    expected_in: HashMap<NodeId, u64>,
    held: HashMap<NodeId, BTreeMap<u64, Message>>,
}

impl LinkOrder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number for the next message to `receiver`.
    pub fn next_seq(&mut self, receiver: NodeId) -> u64 {
        let next = self.next_out.entry(receiver).or_insert(0);
        let seq = *next;
        *next += 1;
        seq
    }

    /// Takes an arrival and returns every message now deliverable from its
    /// sender, in send order. Duplicates of already delivered numbers are
    /// dropped.
    pub fn accept(&mut self, msg: Message) -> Vec<Message> {
        let expected = self.expected_in.entry(msg.sender).or_insert(0);
        if msg.seq < *expected {
            warn!(sender = msg.sender, seq = msg.seq, "dropping duplicate message");
            return Vec::new();
        }
        if msg.seq > *expected {
            debug!(
                sender = msg.sender,
                seq = msg.seq,
                expected = *expected,
                "holding early message"
            );
            let held = self.held.entry(msg.sender).or_default();
            held.insert(msg.seq, msg);
            if held.len() % HELD_WARN_STEP == 0 {
                warn!(
                    sender = msg.sender,
                    held = held.len(),
                    expected = *expected,
                    "messages piling up behind a missing one"
                );
            }
            return Vec::new();
        }

        let mut ready = vec![msg];
        *expected += 1;
        if let Some(held) = self.held.get_mut(&msg.sender) {
            while let Some(next) = held.remove(&*expected) {
                ready.push(next);
                *expected += 1;
            }
        }
        ready
    }

    /// Number of messages waiting for an earlier one from the same sender.
    pub fn held_count(&self) -> usize {
        self.held.values().map(BTreeMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerEntry;
    use crate::message::MessageKind;
    use tokio::sync::mpsc;

    fn msg(sender: NodeId, seq: u64, kind: MessageKind) -> Message {
        Message::new(sender, 1, seq + 10, kind).with_seq(seq)
    }

    #[test]
    fn in_order_messages_pass_straight_through() {
        let mut links = LinkOrder::new();
        assert_eq!(links.accept(msg(2, 0, MessageKind::Request)).len(), 1);
        assert_eq!(links.accept(msg(2, 1, MessageKind::Release)).len(), 1);
        assert_eq!(links.held_count(), 0);
    }

    #[test]
    fn early_message_waits_for_gap() {
        let mut links = LinkOrder::new();
        let reply = msg(2, 1, MessageKind::Reply);
        let request = msg(2, 0, MessageKind::Request);

        assert!(links.accept(reply).is_empty());
        assert_eq!(links.held_count(), 1);

        let ready = links.accept(request);
        assert_eq!(ready, vec![request, reply]);
        assert_eq!(links.held_count(), 0);
    }

    #[test]
    fn links_are_independent_per_sender() {
        let mut links = LinkOrder::new();
        assert!(links.accept(msg(2, 1, MessageKind::Reply)).is_empty());
        assert_eq!(links.accept(msg(3, 0, MessageKind::Reply)).len(), 1);
        assert_eq!(links.held_count(), 1);
    }

    #[test]
    fn duplicates_are_dropped() {
        let mut links = LinkOrder::new();
        assert_eq!(links.accept(msg(2, 0, MessageKind::Application)).len(), 1);
        assert!(links.accept(msg(2, 0, MessageKind::Application)).is_empty());
    }

    #[test]
    fn long_gap_releases_everything_once_filled() {
        let mut links = LinkOrder::new();
        for seq in 1..=50 {
            assert!(links.accept(msg(2, seq, MessageKind::Request)).is_empty());
        }
        assert_eq!(links.held_count(), 50);

        let ready = links.accept(msg(2, 0, MessageKind::Request));
        let seqs: Vec<u64> = ready.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, (0..=50).collect::<Vec<_>>());
        assert_eq!(links.held_count(), 0);
    }

    #[test]
    fn outbound_sequences_count_per_receiver() {
        let mut links = LinkOrder::new();
        assert_eq!(links.next_seq(2), 0);
        assert_eq!(links.next_seq(2), 1);
        assert_eq!(links.next_seq(3), 0);
    }

    #[tokio::test]
    async fn send_reaches_listener_callback() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let directory = Arc::new(PeerDirectory::new(vec![PeerEntry {
            id: 2,
            addr,
            clock: 0,
        }])?);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(listen(listener, forward_to(tx), async move {
            let _ = shutdown_rx.await;
        }));

        let transport = Transport::new(1, directory);
        transport.connect_all(&[2], Duration::from_millis(10)).await;

        let sent = Message::new(1, 2, 4, MessageKind::Request).with_seq(0);
        transport.send(&sent).await?;

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await?
            .expect("listener should forward the message");
        assert_eq!(received, sent);

        let _ = shutdown_tx.send(());
        server.await??;
        Ok(())
    }

    fn forward_to(
        tx: mpsc::UnboundedSender<Message>,
    ) -> impl Fn(Message) -> std::future::Ready<()> + Clone + Send + Sync + 'static {
        move |msg| {
            let _ = tx.send(msg);
            std::future::ready(())
        }
    }

    #[tokio::test]
    async fn outbox_retries_until_peer_listens() -> Result<()> {
        // Reserve a port, then leave it closed for a while.
        let addr = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;
        let directory = Arc::new(PeerDirectory::new(vec![
            PeerEntry {
                id: 1,
                addr: "127.0.0.1:1".parse()?,
                clock: 0,
            },
            PeerEntry {
                id: 2,
                addr,
                clock: 0,
            },
        ])?);
        let transport = Transport::new(1, directory);
        let outbox = Outbox::spawn(&transport, &[2], Duration::from_millis(10));

        let first = Message::new(1, 2, 4, MessageKind::Request).with_seq(0);
        let second = Message::new(1, 2, 6, MessageKind::Release).with_seq(1);
        outbox.push(first)?;
        outbox.push(second)?;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let listener = TcpListener::bind(addr).await?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(listen(listener, forward_to(tx), async move {
            let _ = shutdown_rx.await;
        }));

        let mut links = LinkOrder::new();
        let mut delivered = Vec::new();
        while delivered.len() < 2 {
            let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await?
                .expect("listener should forward the message");
            delivered.extend(links.accept(received));
        }
        assert_eq!(delivered, vec![first, second]);

        outbox.close(Duration::from_secs(1)).await;
        let _ = shutdown_tx.send(());
        server.await??;
        Ok(())
    }

    #[tokio::test]
    async fn outbox_close_abandons_undeliverable_messages() -> Result<()> {
        let addr = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;
        let directory = Arc::new(PeerDirectory::new(vec![PeerEntry {
            id: 2,
            addr,
            clock: 0,
        }])?);
        let outbox = Outbox::spawn(&Transport::new(1, directory), &[2], Duration::from_secs(5));
        outbox.push(Message::new(1, 2, 1, MessageKind::Application))?;
        assert!(outbox.push(Message::new(1, 3, 1, MessageKind::Application)).is_err());

        tokio::time::timeout(Duration::from_secs(2), outbox.close(Duration::from_secs(1))).await?;
        assert!(outbox.push(Message::new(1, 2, 2, MessageKind::Application)).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn send_to_unknown_node_fails() -> Result<()> {
        let directory = Arc::new(PeerDirectory::new(vec![PeerEntry {
            id: 1,
            addr: "127.0.0.1:1".parse()?,
            clock: 0,
        }])?);
        let transport = Transport::new(1, directory);
        let err = transport
            .send(&Message::new(1, 9, 1, MessageKind::Reply))
            .await
            .expect_err("unknown receiver");
        assert!(err.to_string().contains("no address"));
        Ok(())
    }
}
