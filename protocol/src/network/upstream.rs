//! # Upstream Connections
//!
//! Optional direct TCP links to full nodes. A node with upstream links acts
//! as a bridge: it polls full nodes for computor sets and quorum ticks, feeds
//! what it learns into the overlay, and hands overlay transactions back.
//!
//! Each connection picks a random known peer, greets it with an empty
//! `ExchangePublicPeers`, and then asks for the computor set every
//! [`UPSTREAM_REQUEST_INTERVAL`], followed shortly by the quorum of the next
//! tick. Peers that send garbage are struck off the list for good.

use bytes::Bytes;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::gossip::{InboundMessage, Origin, TransportEvent};
use crate::codec::{check_frame, encode_frame, FrameError, FrameReader, MessageType};
use crate::config::{
    UpstreamConfig, MAX_FRAME_SIZE, MIN_CONNECTION_ATTEMPT_DURATION, NUMBER_OF_COMPUTORS,
    NUMBER_OF_EXCHANGED_PEERS, UPSTREAM_QUORUM_TICK_DELAY, UPSTREAM_RECONNECT_UNIT,
    UPSTREAM_REQUEST_INTERVAL,
};

// ---------------------------------------------------------------------------
// Peer Book
// ---------------------------------------------------------------------------

/// Full nodes we know about, the ones currently dialed, and the ones that
/// misbehaved.
#[derive(Debug, Default)]
pub struct PeerBook {
    known: Vec<IpAddr>,
    in_use: HashSet<IpAddr>,
    faulty: HashSet<IpAddr>,
}

impl PeerBook {
    /// Seeds the book from configured addresses. Unparseable entries are
    /// logged and skipped.
    pub fn new(peers: &[String]) -> Self {
        let mut book = Self::default();
        for peer in peers {
            match peer.parse::<IpAddr>() {
                Ok(ip) => {
                    book.learn(ip);
                }
                Err(err) => warn!(%peer, %err, "ignoring upstream peer"),
            }
        }
        book
    }

    pub fn known(&self) -> &[IpAddr] {
        &self.known
    }

    pub fn is_faulty(&self, ip: &IpAddr) -> bool {
        self.faulty.contains(ip)
    }

    /// Adds `ip` unless it is unspecified, already known or faulty.
    pub fn learn(&mut self, ip: IpAddr) -> bool {
        if ip.is_unspecified() || self.faulty.contains(&ip) || self.known.contains(&ip) {
            return false;
        }
        self.known.push(ip);
        true
    }

    /// A random known peer no other connection is using.
    pub fn pick(&mut self) -> Option<IpAddr> {
        let free: Vec<IpAddr> = self
            .known
            .iter()
            .filter(|ip| !self.in_use.contains(*ip))
            .copied()
            .collect();
        let ip = *free.choose(&mut rand::thread_rng())?;
        self.in_use.insert(ip);
        Some(ip)
    }

    pub fn release(&mut self, ip: &IpAddr) {
        self.in_use.remove(ip);
    }

    /// Removes `ip` for the lifetime of the process.
    pub fn mark_faulty(&mut self, ip: IpAddr) {
        self.known.retain(|known| *known != ip);
        self.in_use.remove(&ip);
        self.faulty.insert(ip);
    }
}

/// IPv4 addresses packed four bytes each at the start of an
/// `ExchangePublicPeers` payload.
pub fn exchanged_peers(payload: &[u8]) -> Vec<IpAddr> {
    payload
        .chunks_exact(4)
        .take(NUMBER_OF_EXCHANGED_PEERS)
        .map(|octets| IpAddr::V4(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3])))
        .collect()
}

/// Payload of `RequestQuorumTick`: the tick wanted, then one bit per computor
/// whose vote we already hold. We never hold any, so the flags are zero.
pub fn quorum_tick_request(tick: u32) -> Vec<u8> {
    let mut payload = vec![0u8; 4 + NUMBER_OF_COMPUTORS / 4];
    payload[..4].copy_from_slice(&tick.to_le_bytes());
    payload
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    peer: Option<IpAddr>,
    outbound: Option<mpsc::Sender<Bytes>>,
}

/// The set of upstream connections. Cheap to clone.
#[derive(Clone)]
pub struct UpstreamPool {
    inner: Arc<Inner>,
}

struct Inner {
    config: UpstreamConfig,
    protocol: u8,
    book: Mutex<PeerBook>,
    slots: Mutex<Vec<Slot>>,
    events: mpsc::Sender<TransportEvent>,
    latest_tick: watch::Receiver<Option<u32>>,
    controls: Vec<mpsc::UnboundedSender<u64>>,
    control_receivers: Mutex<Vec<Option<mpsc::UnboundedReceiver<u64>>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UpstreamPool {
    pub fn new(
        config: UpstreamConfig,
        protocol: u8,
        events: mpsc::Sender<TransportEvent>,
        latest_tick: watch::Receiver<Option<u32>>,
    ) -> Self {
        let (controls, receivers): (Vec<_>, Vec<_>) = (0..config.connections)
            .map(|_| {
                let (tx, rx) = mpsc::unbounded_channel();
                (tx, Some(rx))
            })
            .unzip();
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                book: Mutex::new(PeerBook::new(&config.peers)),
                slots: Mutex::new((0..config.connections).map(|_| Slot::default()).collect()),
                config,
                protocol,
                events,
                latest_tick,
                controls,
                control_receivers: Mutex::new(receivers),
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn launch(&self) {
        if self.inner.book.lock().known().is_empty() {
            warn!("upstream peer list is empty, no connections started");
            return;
        }
        let receivers: Vec<_> = self.inner.control_receivers.lock().iter_mut().map(Option::take).collect();
        let mut tasks = self.inner.tasks.lock();
        for (index, control) in receivers.into_iter().enumerate() {
            let Some(control) = control else { continue };
            let inner = Arc::clone(&self.inner);
            let shutdown = self.inner.shutdown.subscribe();
            tasks.push(tokio::spawn(run_connection(inner, index, control, shutdown)));
        }
        info!(connections = self.inner.config.connections, "upstream connections launched");
    }

    /// Writes `frame` to every connected full node.
    pub fn forward(&self, frame: &Bytes) -> usize {
        let slots = self.inner.slots.lock();
        slots
            .iter()
            .filter_map(|slot| slot.outbound.as_ref())
            .filter(|outbound| outbound.try_send(frame.clone()).is_ok())
            .count()
    }

    /// Drops the connection `message` came from and never dials that peer
    /// again.
    pub fn reject(&self, message: &InboundMessage) {
        let Origin::Upstream(index) = message.origin else {
            return;
        };
        let peer = {
            let slots = self.inner.slots.lock();
            match slots.get(index) {
                Some(slot) if slot.generation == message.generation => slot.peer,
                _ => None,
            }
        };
        let Some(peer) = peer else { return };
        warn!(%peer, kind = ?message.kind, "faulty upstream peer");
        self.inner.book.lock().mark_faulty(peer);
        if let Some(control) = self.inner.controls.get(index) {
            let _ = control.send(message.generation);
        }
    }

    pub fn connected(&self) -> usize {
        self.inner
            .slots
            .lock()
            .iter()
            .filter(|slot| slot.outbound.is_some())
            .count()
    }

    pub fn known_peers(&self) -> Vec<IpAddr> {
        self.inner.book.lock().known().to_vec()
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        for slot in self.inner.slots.lock().iter_mut() {
            slot.outbound = None;
        }
    }
}

enum SessionEnd {
    Closed,
    Faulty,
    Shutdown,
}

async fn run_connection(
    inner: Arc<Inner>,
    index: usize,
    mut control: mpsc::UnboundedReceiver<u64>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures: u32 = 0;
    loop {
        if failures > 0 {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = sleep(UPSTREAM_RECONNECT_UNIT * failures) => {}
            }
        }

        let Some(peer) = inner.book.lock().pick() else {
            failures += 1;
            continue;
        };
        let address = SocketAddr::new(peer, inner.config.port);

        let connect = tokio::time::timeout(MIN_CONNECTION_ATTEMPT_DURATION, TcpStream::connect(address));
        let stream = tokio::select! {
            _ = shutdown.changed() => return,
            result = connect => result,
        };
        let stream = match stream {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                debug!(%address, %err, "upstream connect failed");
                inner.book.lock().release(&peer);
                failures += 1;
                continue;
            }
            Err(_) => {
                debug!(%address, "upstream connect timed out");
                inner.book.lock().release(&peer);
                failures += 1;
                continue;
            }
        };

        info!(%address, connection = index, "upstream connection open");
        failures = 0;
        let end = run_session(&inner, index, peer, stream, &mut control, &mut shutdown).await;

        {
            let mut slots = inner.slots.lock();
            slots[index].outbound = None;
            slots[index].peer = None;
        }
        inner.book.lock().release(&peer);
        match end {
            SessionEnd::Shutdown => return,
            SessionEnd::Faulty => info!(%address, "dropped faulty upstream peer"),
            SessionEnd::Closed => debug!(%address, "upstream connection closed"),
        }
        failures += 1;
    }
}

async fn run_session(
    inner: &Arc<Inner>,
    index: usize,
    peer: IpAddr,
    stream: TcpStream,
    control: &mut mpsc::UnboundedReceiver<u64>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let _ = stream.set_nodelay(true);
    let (outbound_tx, mut outbound) = mpsc::channel::<Bytes>(256);
    let generation = {
        let mut slots = inner.slots.lock();
        let slot = &mut slots[index];
        slot.generation += 1;
        slot.peer = Some(peer);
        slot.outbound = Some(outbound_tx.clone());
        slot.generation
    };

    let (mut reader, mut writer) = stream.into_split();
    let mut frames = FrameReader::new(MAX_FRAME_SIZE);
    let mut buf = vec![0u8; 16 * 1024];

    let request = |kind: MessageType, payload: &[u8], randomize: bool| -> Result<Bytes, FrameError> {
        encode_frame(payload, inner.protocol, randomize, kind)
    };
    let greeting = match request(MessageType::ExchangePublicPeers, &[], false) {
        Ok(frame) => frame,
        Err(_) => return SessionEnd::Closed,
    };
    if writer.write_all(&greeting).await.is_err() {
        return SessionEnd::Closed;
    }

    let mut polling = tokio::time::interval_at(
        tokio::time::Instant::now() + UPSTREAM_REQUEST_INTERVAL,
        UPSTREAM_REQUEST_INTERVAL,
    );
    let quorum_tick = sleep(Duration::MAX);
    tokio::pin!(quorum_tick);
    let mut quorum_tick_pending = false;

    loop {
        tokio::select! {
            _ = shutdown.changed() => return SessionEnd::Shutdown,
            Some(rejected) = control.recv() => {
                if rejected == generation {
                    return SessionEnd::Faulty;
                }
            }
            _ = polling.tick() => {
                if let Ok(frame) = request(MessageType::RequestComputors, &[], true) {
                    let _ = outbound_tx.try_send(frame);
                }
                quorum_tick.as_mut().reset(tokio::time::Instant::now() + UPSTREAM_QUORUM_TICK_DELAY);
                quorum_tick_pending = true;
            }
            _ = &mut quorum_tick, if quorum_tick_pending => {
                quorum_tick_pending = false;
                let latest = *inner.latest_tick.borrow();
                if let Some(tick) = latest.filter(|tick| *tick > 0) {
                    if let Ok(frame) = request(MessageType::RequestQuorumTick, &quorum_tick_request(tick + 1), true) {
                        let _ = outbound_tx.try_send(frame);
                    }
                }
            }
            Some(frame) = outbound.recv() => {
                if writer.write_all(&frame).await.is_err() {
                    return SessionEnd::Closed;
                }
            }
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => return SessionEnd::Closed,
                    Ok(n) => n,
                };
                frames.extend(&buf[..n]);
                loop {
                    let frame = match frames.next_frame() {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(err) => {
                            warn!(%peer, %err, "unframeable upstream stream");
                            inner.book.lock().mark_faulty(peer);
                            return SessionEnd::Faulty;
                        }
                    };
                    let header = match check_frame(&frame, inner.protocol) {
                        Ok(header) => header,
                        Err(err) => {
                            warn!(%peer, %err, "bad upstream frame");
                            inner.book.lock().mark_faulty(peer);
                            return SessionEnd::Faulty;
                        }
                    };

                    if header.message_type == MessageType::ExchangePublicPeers {
                        let learned = {
                            let mut book = inner.book.lock();
                            exchanged_peers(crate::codec::payload(&frame))
                                .into_iter()
                                .filter(|ip| book.learn(*ip))
                                .count()
                        };
                        debug!(%peer, learned, "exchanged public peers");
                        if let Ok(frame) = request(MessageType::RequestComputors, &[], true) {
                            let _ = outbound_tx.try_send(frame);
                        }
                        let tick = inner.latest_tick.borrow().unwrap_or(0);
                        if let Ok(frame) = request(MessageType::RequestQuorumTick, &quorum_tick_request(tick + 1), true) {
                            let _ = outbound_tx.try_send(frame);
                        }
                        continue;
                    }

                    let message = InboundMessage {
                        origin: Origin::Upstream(index),
                        generation,
                        kind: header.message_type,
                        frame,
                    };
                    if inner.events.send(TransportEvent::Message(message)).await.is_err() {
                        return SessionEnd::Shutdown;
                    }
                }
            }
        }
    }
}
