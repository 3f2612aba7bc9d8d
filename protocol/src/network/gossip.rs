//! # Gossip Transport
//!
//! Keeps `number_of_channels` independent links to the overlay alive and
//! moves frames across them. Each channel is one tokio task that loops
//! forever: attempt a connection, run a session, close, back off, repeat.
//!
//! The transport knows framing and nothing else. Every frame that passes the
//! size and version checks goes up as a [`TransportEvent::Message`]; the node
//! validates it and then calls either [`GossipTransport::propagate`] or
//! [`GossipTransport::close_and_reconnect`]. A message carries the session
//! generation it arrived on, so a verdict that comes back after the session
//! already ended cannot tear down its successor.
//!
//! ## Timers
//!
//! - connection attempt: `min_connection_attempt + streak × unit`
//! - inactivity: reset by every valid frame; firing reconnects at once
//! - rotation: last channel only, forces churn so the overlay mixes
//! - reconnect: `streak × unit` after a failing close
//!
//! Every timer is a future owned by its channel task. Aborting the task
//! cancels all of them.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::channel::{ChannelSlot, CloseReason};
use super::dejavu::Dejavu;
use super::link::{BoxedStream, Connector};
use crate::codec::field::Field;
use crate::codec::{check_frame, payload, FrameReader, Header, MessageType};
use crate::config::{GossipConfig, MAX_FRAME_SIZE};

const READ_BUFFER: usize = 16 * 1024;

const TICK_COMPUTOR_INDEX: Field<u16> = Field::at(0);
const TICK_NUMBER: Field<u32> = Field::at(4);

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Where an inbound frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// A gossip channel.
    Channel(usize),
    /// A direct connection to a full node.
    Upstream(usize),
}

/// A frame that passed framing checks, with enough context to answer it.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub origin: Origin,
    /// Session the frame arrived on.
    pub generation: u64,
    pub kind: MessageType,
    /// The whole frame, header included.
    pub frame: Bytes,
}

impl InboundMessage {
    pub fn payload(&self) -> &[u8] {
        payload(&self.frame)
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(InboundMessage),
    /// Number of connected channels changed.
    Peers(usize),
    /// Byte counters changed because something was discarded.
    Info(TransportInfo),
}

/// Traffic counters and channel summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportInfo {
    pub received_bytes: u64,
    pub transmitted_bytes: u64,
    pub discarded_bytes: u64,
    pub number_of_channels: usize,
    pub number_of_open_channels: usize,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    transmitted: AtomicU64,
    discarded: AtomicU64,
}

#[derive(Debug)]
enum Control {
    CloseAndReconnect { generation: u64 },
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Handle to the gossip transport. Cheap to clone.
#[derive(Clone)]
pub struct GossipTransport {
    inner: Arc<Inner>,
}

struct Inner {
    config: GossipConfig,
    protocol: u8,
    connector: Arc<dyn Connector>,
    channels: Mutex<Vec<ChannelSlot>>,
    dejavu: Mutex<Dejavu>,
    counters: Counters,
    events: mpsc::Sender<TransportEvent>,
    controls: Vec<mpsc::UnboundedSender<Control>>,
    control_receivers: Mutex<Vec<Option<mpsc::UnboundedReceiver<Control>>>>,
    shutdown: watch::Sender<bool>,
    channel_tasks: Mutex<Vec<JoinHandle<()>>>,
    rebroadcasts: Mutex<Vec<JoinHandle<()>>>,
}

impl GossipTransport {
    /// Builds a transport that reports to `events`. Nothing connects until
    /// [`launch`](Self::launch).
    pub fn new(
        config: GossipConfig,
        protocol: u8,
        connector: Arc<dyn Connector>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Self {
        let channels = config.number_of_channels;
        let (controls, receivers): (Vec<_>, Vec<_>) = (0..channels)
            .map(|_| {
                let (tx, rx) = mpsc::unbounded_channel();
                (tx, Some(rx))
            })
            .unzip();
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                dejavu: Mutex::new(Dejavu::new(&config)),
                channels: Mutex::new((0..channels).map(|_| ChannelSlot::default()).collect()),
                config,
                protocol,
                connector,
                counters: Counters::default(),
                events,
                controls,
                control_receivers: Mutex::new(receivers),
                shutdown,
                channel_tasks: Mutex::new(Vec::new()),
                rebroadcasts: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &GossipConfig {
        &self.inner.config
    }

    /// Spawns one task per channel. Calling it twice is a no-op.
    pub fn launch(&self) {
        let receivers: Vec<_> = self.inner.control_receivers.lock().iter_mut().map(Option::take).collect();
        let mut tasks = self.inner.channel_tasks.lock();
        for (index, control) in receivers.into_iter().enumerate() {
            let Some(control) = control else { continue };
            let inner = Arc::clone(&self.inner);
            let shutdown = self.inner.shutdown.subscribe();
            tasks.push(tokio::spawn(run_channel(inner, index, control, shutdown)));
        }
        info!(channels = self.inner.config.number_of_channels, "gossip transport launched");
    }

    /// Forwards a validated message to the other channels, following the
    /// per-type dedup policy. Unknown types are never forwarded.
    pub fn propagate(&self, message: &InboundMessage) {
        let source = match message.origin {
            Origin::Channel(index) => Some(index),
            Origin::Upstream(_) => None,
        };
        self.inner.propagate_from(source, message.kind, &message.frame);
    }

    /// Sends a locally originated frame with the same dedup policy as
    /// relayed ones.
    pub fn broadcast(&self, frame: Bytes) {
        match Header::parse(&frame) {
            Ok(header) => self.inner.propagate_from(None, header.message_type, &frame),
            Err(err) => warn!(%err, "refusing to broadcast a malformed frame"),
        }
    }

    /// Sends `frame` to every open channel, no questions asked.
    pub fn rebroadcast(&self, frame: Bytes) {
        for index in 0..self.inner.config.number_of_channels {
            self.inner.send_to(index, &frame);
        }
    }

    /// Tears down the session `message` arrived on and reconnects it with
    /// backoff. Does nothing if that session is already gone.
    pub fn close_and_reconnect(&self, message: &InboundMessage) {
        let Origin::Channel(index) = message.origin else {
            return;
        };
        let requested = self
            .inner
            .channels
            .lock()
            .get_mut(index)
            .is_some_and(|slot| slot.request_close(message.generation));
        if !requested {
            return;
        }
        self.inner.discard(message.frame.len());
        if let Some(control) = self.inner.controls.get(index) {
            let _ = control.send(Control::CloseAndReconnect {
                generation: message.generation,
            });
        }
    }

    pub fn info(&self) -> TransportInfo {
        self.inner.info()
    }

    /// Number of open or closing channels.
    pub fn peers(&self) -> usize {
        self.inner.peers()
    }

    pub fn prune_ticks_below(&self, tick: u32) {
        self.inner.dejavu.lock().prune_ticks_below(tick);
    }

    /// Stops every channel task and every pending transaction fan-out.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        for task in self.inner.channel_tasks.lock().drain(..) {
            task.abort();
        }
        for task in self.inner.rebroadcasts.lock().drain(..) {
            task.abort();
        }
        let mut channels = self.inner.channels.lock();
        let unit = self.inner.config.channel_timeout_multiplier();
        for slot in channels.iter_mut() {
            slot.close(CloseReason::Shutdown, unit);
        }
        info!("gossip transport shut down");
    }
}

impl Inner {
    fn info(&self) -> TransportInfo {
        let channels = self.channels.lock();
        TransportInfo {
            received_bytes: self.counters.received.load(Ordering::Relaxed),
            transmitted_bytes: self.counters.transmitted.load(Ordering::Relaxed),
            discarded_bytes: self.counters.discarded.load(Ordering::Relaxed),
            number_of_channels: channels.len(),
            number_of_open_channels: channels.iter().filter(|slot| slot.is_open()).count(),
        }
    }

    fn peers(&self) -> usize {
        self.channels.lock().iter().filter(|slot| slot.is_connected()).count()
    }

    fn open_mask(&self) -> Vec<bool> {
        self.channels.lock().iter().map(ChannelSlot::is_open).collect()
    }

    fn discard(&self, bytes: usize) {
        self.counters.discarded.fetch_add(bytes as u64, Ordering::Relaxed);
        let _ = self.events.try_send(TransportEvent::Info(self.info()));
    }

    fn emit_peers(&self) {
        let _ = self.events.try_send(TransportEvent::Peers(self.peers()));
    }

    /// Queues `frame` on channel `index` if it is open.
    fn send_to(&self, index: usize, frame: &Bytes) -> bool {
        let channels = self.channels.lock();
        let Some(sender) = channels.get(index).and_then(ChannelSlot::sender) else {
            return false;
        };
        match sender.try_send(frame.clone()) {
            Ok(()) => {
                self.counters
                    .transmitted
                    .fetch_add(frame.len() as u64, Ordering::Relaxed);
                true
            }
            Err(_) => {
                debug!(channel = index, "outbound queue full, frame dropped");
                false
            }
        }
    }

    fn send_to_others(&self, source: Option<usize>, frame: &Bytes) {
        for index in 0..self.config.number_of_channels {
            if Some(index) != source {
                self.send_to(index, frame);
            }
        }
    }

    fn propagate_from(self: &Arc<Self>, source: Option<usize>, kind: MessageType, frame: &Bytes) {
        let now = Instant::now();
        match kind {
            MessageType::BroadcastComputors => {
                let open = self.open_mask();
                let targets = self.dejavu.lock().computors_targets(source, &open, now);
                debug!(?source, ?targets, "propagating computor set");
                for index in targets {
                    self.send_to(index, frame);
                }
            }
            MessageType::BroadcastTick => {
                let body = payload(frame);
                if body.len() < TICK_NUMBER.end() {
                    return;
                }
                let computor_index = TICK_COMPUTOR_INDEX.read(body);
                let tick = TICK_NUMBER.read(body);
                let open = self.open_mask();
                let targets = self
                    .dejavu
                    .lock()
                    .tick_targets(computor_index, tick, source, &open, now);
                for index in targets {
                    self.send_to(index, frame);
                }
            }
            MessageType::BroadcastTransaction => {
                if !self.dejavu.lock().mark_transaction(payload(frame)) {
                    debug!("transaction already seen");
                    return;
                }
                self.send_to_others(source, frame);
                self.schedule_rebroadcasts(source, frame.clone());
            }
            _ => {}
        }
    }

    /// Repeats a fresh transaction a fixed number of times so a single lost
    /// send does not strand it.
    fn schedule_rebroadcasts(self: &Arc<Self>, source: Option<usize>, frame: Bytes) {
        let repeats = self.config.transaction_rebroadcastings;
        if repeats == 0 {
            return;
        }
        let interval = self.config.transaction_rebroadcast();
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            for _ in 0..repeats {
                sleep(interval).await;
                inner.send_to_others(source, &frame);
            }
        });
        let mut rebroadcasts = self.rebroadcasts.lock();
        rebroadcasts.retain(|task| !task.is_finished());
        rebroadcasts.push(task);
    }
}

// ---------------------------------------------------------------------------
// Channel task
// ---------------------------------------------------------------------------

async fn run_channel(
    inner: Arc<Inner>,
    index: usize,
    mut control: mpsc::UnboundedReceiver<Control>,
    mut shutdown: watch::Receiver<bool>,
) {
    let unit = inner.config.channel_timeout_multiplier();
    let min_attempt = inner.config.min_connection_attempt();

    loop {
        let (generation, deadline) = inner.channels.lock()[index].begin_attempt(min_attempt, unit);

        let attempt = tokio::select! {
            _ = shutdown.changed() => return,
            attempt = tokio::time::timeout(deadline, inner.connector.connect(index)) => attempt,
        };

        let reason = match attempt {
            Err(_) => {
                debug!(channel = index, ?deadline, "connection attempt timed out");
                CloseReason::AttemptTimeout
            }
            Ok(Err(err)) => {
                debug!(channel = index, %err, "connection attempt failed");
                CloseReason::ConnectFailed
            }
            Ok(Ok(stream)) => {
                run_session(&inner, index, generation, stream, &mut control, &mut shutdown).await
            }
        };

        let delay = inner.channels.lock()[index].close(reason, unit);
        inner.emit_peers();
        let Some(delay) = delay else {
            return;
        };
        debug!(channel = index, ?reason, ?delay, "channel closed");

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = sleep(delay) => {}
        }
    }
}

async fn run_session(
    inner: &Arc<Inner>,
    index: usize,
    generation: u64,
    stream: BoxedStream,
    control: &mut mpsc::UnboundedReceiver<Control>,
    shutdown: &mut watch::Receiver<bool>,
) -> CloseReason {
    let (outbound_tx, mut outbound) = mpsc::channel::<Bytes>(inner.config.outbound_queue);
    if !inner.channels.lock()[index].open(generation, outbound_tx) {
        return CloseReason::Shutdown;
    }
    info!(channel = index, generation, "channel open");
    inner.emit_peers();

    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut frames = FrameReader::new(MAX_FRAME_SIZE);
    let mut buf = vec![0u8; READ_BUFFER];

    let max_inactivity = inner.config.max_inactivity();
    let inactivity = sleep(max_inactivity);
    tokio::pin!(inactivity);

    let rotating = index + 1 == inner.config.number_of_channels;
    let rotation = sleep(inner.config.max_rotating_channel());
    tokio::pin!(rotation);

    loop {
        tokio::select! {
            _ = shutdown.changed() => return CloseReason::Shutdown,
            _ = &mut inactivity => {
                info!(channel = index, "channel inactive");
                return CloseReason::Inactivity;
            }
            _ = &mut rotation, if rotating => {
                info!(channel = index, "rotating channel");
                return CloseReason::Rotation;
            }
            Some(command) = control.recv() => match command {
                Control::CloseAndReconnect { generation: requested } if requested == generation => {
                    info!(channel = index, "closing channel after rejected message");
                    return CloseReason::Rejected;
                }
                Control::CloseAndReconnect { .. } => {}
            },
            Some(frame) = outbound.recv() => {
                if let Err(err) = writer.write_all(&frame).await {
                    debug!(channel = index, %err, "write failed");
                    return CloseReason::Remote;
                }
            }
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) => return CloseReason::Remote,
                    Ok(n) => n,
                    Err(err) => {
                        debug!(channel = index, %err, "read failed");
                        return CloseReason::Remote;
                    }
                };
                inner.counters.received.fetch_add(n as u64, Ordering::Relaxed);
                frames.extend(&buf[..n]);

                loop {
                    let frame = match frames.next_frame() {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(err) => {
                            warn!(channel = index, %err, "unframeable stream");
                            inner.discard(frames.pending());
                            return CloseReason::Framing;
                        }
                    };
                    let header = match check_frame(&frame, inner.protocol) {
                        Ok(header) => header,
                        Err(err) => {
                            warn!(channel = index, %err, "bad frame");
                            inner.discard(frame.len());
                            return CloseReason::Framing;
                        }
                    };
                    inactivity.as_mut().reset(Instant::now() + max_inactivity);

                    let message = InboundMessage {
                        origin: Origin::Channel(index),
                        generation,
                        kind: header.message_type,
                        frame,
                    };
                    if inner.events.send(TransportEvent::Message(message)).await.is_err() {
                        return CloseReason::Shutdown;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_frame;
    use async_trait::async_trait;
    use std::io;
    use tokio::io::DuplexStream;

    const PROTOCOL: u8 = 7;

    /// Hands out the far ends of duplex pipes to the test.
    struct PipeConnector {
        peers: mpsc::UnboundedSender<(usize, DuplexStream)>,
    }

    #[async_trait]
    impl Connector for PipeConnector {
        async fn connect(&self, channel: usize) -> io::Result<BoxedStream> {
            let (near, far) = tokio::io::duplex(64 * 1024);
            self.peers
                .send((channel, far))
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "test over"))?;
            Ok(Box::new(near))
        }
    }

    fn test_config(channels: usize) -> GossipConfig {
        GossipConfig {
            number_of_channels: channels,
            transaction_filter_capacity: 1_000,
            transaction_rebroadcastings: 2,
            transaction_rebroadcast_ms: 20,
            ..GossipConfig::default()
        }
    }

    struct Harness {
        transport: GossipTransport,
        events: mpsc::Receiver<TransportEvent>,
        peers: Vec<DuplexStream>,
    }

    async fn harness(config: GossipConfig) -> Harness {
        let channels = config.number_of_channels;
        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events) = mpsc::channel(64);
        let transport = GossipTransport::new(
            config,
            PROTOCOL,
            Arc::new(PipeConnector { peers: peer_tx }),
            events_tx,
        );
        transport.launch();

        let mut peers: Vec<Option<DuplexStream>> = (0..channels).map(|_| None).collect();
        for _ in 0..channels {
            let (index, far) = peer_rx.recv().await.unwrap();
            peers[index] = Some(far);
        }
        while transport.info().number_of_open_channels < channels {
            let _ = events.recv().await;
        }
        Harness {
            transport,
            events,
            peers: peers.into_iter().map(Option::unwrap).collect(),
        }
    }

    async fn next_message(events: &mut mpsc::Receiver<TransportEvent>) -> InboundMessage {
        loop {
            if let TransportEvent::Message(message) = events.recv().await.unwrap() {
                return message;
            }
        }
    }

    async fn read_frame(stream: &mut DuplexStream) -> Vec<u8> {
        let mut header = [0u8; 8];
        stream.read_exact(&mut header).await.unwrap();
        let size = crate::codec::field::read_u24(&header) as usize;
        let mut frame = header.to_vec();
        frame.resize(size, 0);
        stream.read_exact(&mut frame[8..]).await.unwrap();
        frame
    }

    #[tokio::test]
    async fn inbound_frames_reach_the_node() {
        let mut h = harness(test_config(2)).await;
        let frame = encode_frame(b"hello", PROTOCOL, true, MessageType::Unknown(99)).unwrap();
        h.peers[1].write_all(&frame).await.unwrap();

        let message = next_message(&mut h.events).await;
        assert_eq!(message.origin, Origin::Channel(1));
        assert_eq!(message.kind, MessageType::Unknown(99));
        assert_eq!(message.payload(), b"hello");
        assert_eq!(h.transport.info().received_bytes, frame.len() as u64);
        h.transport.shutdown();
    }

    #[tokio::test]
    async fn split_and_coalesced_frames_are_reassembled() {
        let mut h = harness(test_config(1)).await;
        let a = encode_frame(b"first", PROTOCOL, true, MessageType::Unknown(50)).unwrap();
        let b = encode_frame(b"second", PROTOCOL, true, MessageType::Unknown(51)).unwrap();
        let mut stream = a.to_vec();
        stream.extend_from_slice(&b);

        h.peers[0].write_all(&stream[..3]).await.unwrap();
        h.peers[0].write_all(&stream[3..]).await.unwrap();

        assert_eq!(next_message(&mut h.events).await.payload(), b"first");
        assert_eq!(next_message(&mut h.events).await.payload(), b"second");
        h.transport.shutdown();
    }

    #[tokio::test]
    async fn version_mismatch_closes_the_channel() {
        let mut h = harness(test_config(1)).await;
        let frame = encode_frame(b"x", PROTOCOL + 1, true, MessageType::BroadcastTick).unwrap();
        h.peers[0].write_all(&frame).await.unwrap();

        // The transport hangs up its end of the pipe.
        let mut buf = [0u8; 1];
        assert_eq!(h.peers[0].read(&mut buf).await.unwrap(), 0);
        assert_eq!(h.transport.info().discarded_bytes, frame.len() as u64);
        h.transport.shutdown();
    }

    #[tokio::test]
    async fn transactions_fan_out_once_plus_repeats() {
        let mut h = harness(test_config(2)).await;
        let frame = encode_frame(b"some transaction", PROTOCOL, true, MessageType::BroadcastTransaction)
            .unwrap();
        h.peers[0].write_all(&frame).await.unwrap();
        let message = next_message(&mut h.events).await;

        h.transport.propagate(&message);
        // A second copy of the same payload is a no-op.
        h.transport.propagate(&message);

        // Immediate send plus two repeats to channel 1, nothing back to 0.
        for _ in 0..3 {
            assert_eq!(read_frame(&mut h.peers[1]).await, frame.to_vec());
        }
        let transmitted = h.transport.info().transmitted_bytes;
        assert_eq!(transmitted, 3 * frame.len() as u64);
        h.transport.shutdown();
    }

    #[tokio::test]
    async fn stale_close_requests_are_ignored() {
        let mut h = harness(test_config(1)).await;
        let frame = encode_frame(b"x", PROTOCOL, true, MessageType::Unknown(1)).unwrap();
        h.peers[0].write_all(&frame).await.unwrap();
        let mut message = next_message(&mut h.events).await;

        message.generation += 1;
        h.transport.close_and_reconnect(&message);
        assert_eq!(h.transport.info().number_of_open_channels, 1);
        assert_eq!(h.transport.info().discarded_bytes, 0);

        message.generation -= 1;
        h.transport.close_and_reconnect(&message);
        let mut buf = [0u8; 1];
        assert_eq!(h.peers[0].read(&mut buf).await.unwrap(), 0);
        h.transport.shutdown();
    }
}
