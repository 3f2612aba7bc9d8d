//! # Node
//!
//! The `Node` wires the gossip transport, the optional upstream pool, the
//! validators and the consensus state together, and exposes the result to
//! application code as typed event streams.
//!
//! ```text
//! new() -> start() -> [running] -> stop()
//! ```
//!
//! Every inbound message, whichever channel or full node it came from, is
//! validated on the blocking pool under one state mutex, one at a time. The
//! verdict then goes back to the transport that delivered it:
//!
//! | verdict   | gossip channel          | upstream connection     |
//! |-----------|-------------------------|-------------------------|
//! | propagate | dedup and forward       | broadcast into overlay  |
//! | ignore    | nothing                 | nothing                 |
//! | reject    | close and reconnect     | drop peer as faulty     |

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::entity::{Entity, EntityError};
use super::gossip::{GossipTransport, InboundMessage, Origin, TransportEvent, TransportInfo};
use super::link::Connector;
use super::dejavu::TransactionFilter;
use super::upstream::UpstreamPool;
use crate::codec::{encode_frame, FrameError, MessageType};
use crate::config::{ConfigError, NodeConfig, OWN_TRANSACTION_REBROADCAST_TIMEOUT};
use crate::consensus::{
    process_computors, process_tick, AlignmentTester, ComputorsOutcome, ConsensusState,
    EntityRecord, FinalizedTick, StateError, TickVerdict,
};
use crate::crypto::{Digest, Keypair, PublicKey};
use crate::resource_test::{ResourceTestError, ResourceTester};
use crate::transaction::{is_resource_test_candidate, Transaction};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("node already started")]
    AlreadyStarted,

    #[error("cannot frame message: {0}")]
    Frame(#[from] FrameError),
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A valid computor-set announcement.
#[derive(Debug, Clone, Serialize)]
pub struct ComputorsEvent {
    pub epoch: u16,
    #[serde(serialize_with = "crate::codec::hex_serde::serialize")]
    pub digest: Digest,
    /// Share of sources holding the best-aligned digest.
    pub alignment: f64,
    /// Whether this announcement became the current computor set.
    pub accepted: bool,
}

/// Outcome of the resource test for a candidate transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceTestOutcome {
    pub identity: PublicKey,
    pub score: u64,
    /// `score` reached the node's minimum score.
    pub qualified: bool,
}

/// A transaction that passed validation.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionEvent {
    pub transaction: Transaction,
    pub resource_test: Option<ResourceTestOutcome>,
}

/// One broadcast stream per event kind. Lagging subscribers lose the oldest
/// events, not the node's time.
#[derive(Debug, Clone)]
pub struct NodeEvents {
    computors: broadcast::Sender<ComputorsEvent>,
    ticks: broadcast::Sender<FinalizedTick>,
    transactions: broadcast::Sender<TransactionEvent>,
    peers: broadcast::Sender<usize>,
    messages: broadcast::Sender<InboundMessage>,
    info: broadcast::Sender<TransportInfo>,
}

impl NodeEvents {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            computors: broadcast::channel(capacity).0,
            ticks: broadcast::channel(capacity).0,
            transactions: broadcast::channel(capacity).0,
            peers: broadcast::channel(capacity).0,
            messages: broadcast::channel(capacity).0,
            info: broadcast::channel(capacity).0,
        }
    }

    pub fn computors(&self) -> broadcast::Receiver<ComputorsEvent> {
        self.computors.subscribe()
    }

    /// Finalized ticks, in increasing tick order.
    pub fn ticks(&self) -> broadcast::Receiver<FinalizedTick> {
        self.ticks.subscribe()
    }

    pub fn transactions(&self) -> broadcast::Receiver<TransactionEvent> {
        self.transactions.subscribe()
    }

    /// Number of connected gossip channels.
    pub fn peers(&self) -> broadcast::Receiver<usize> {
        self.peers.subscribe()
    }

    /// Every framed message, before validation.
    pub fn messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.messages.subscribe()
    }

    pub fn info(&self) -> broadcast::Receiver<TransportInfo> {
        self.info.subscribe()
    }
}

/// Point-in-time summary for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub protocol: u8,
    pub epoch: u16,
    pub latest_tick: Option<u32>,
    pub peers: usize,
    pub upstream_connections: usize,
    pub entities: usize,
    pub min_score: u64,
    pub transport: TransportInfo,
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Propagate,
    Ignore,
    Reject,
}

struct NodeState {
    consensus: ConsensusState,
    alignment: AlignmentTester,
    /// Transactions already announced on the `transactions` stream.
    seen_transactions: TransactionFilter,
    min_score: u64,
}

/// A running ticknet node. Cheap to clone; all clones drive the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: NodeConfig,
    arbitrator: PublicKey,
    state: Mutex<NodeState>,
    /// Locked apart from `state` so a running simulation does not stall
    /// readers of the consensus state.
    resource_tester: Mutex<ResourceTester>,
    gossip: GossipTransport,
    upstream: Option<UpstreamPool>,
    events: NodeEvents,
    latest: watch::Sender<Option<u32>>,
    inbound: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    processor: Mutex<Option<JoinHandle<()>>>,
    broadcasts: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Validates `config` and builds every component. Nothing touches the
    /// network until [`start`](Self::start).
    pub fn new(config: NodeConfig, connector: Arc<dyn Connector>) -> Result<Self, NodeError> {
        config.validate()?;
        let arbitrator = config.arbitrator.ok_or(ConfigError::MissingArbitrator)?;
        let resource_tester = ResourceTester::new(config.resource_test.clone())?;
        let alignment = AlignmentTester::new(
            config.alignment_sources(),
            config.alignment_threshold,
            config.alignment_stale_after().into(),
        );

        let (events_tx, inbound) = mpsc::channel(config.event_capacity.max(1));
        let (latest, latest_rx) = watch::channel(config.initial_tick);
        let gossip = GossipTransport::new(
            config.gossip.clone(),
            config.protocol,
            connector,
            events_tx.clone(),
        );
        let upstream = (config.upstream.connections > 0).then(|| {
            UpstreamPool::new(config.upstream.clone(), config.protocol, events_tx, latest_rx)
        });

        info!(
            protocol = config.protocol,
            arbitrator = %arbitrator,
            channels = config.gossip.number_of_channels,
            upstream = config.upstream.connections,
            "node created"
        );

        Ok(Self {
            inner: Arc::new(NodeInner {
                state: Mutex::new(NodeState {
                    consensus: ConsensusState::new(config.initial_tick),
                    alignment,
                    seen_transactions: TransactionFilter::new(
                        config.gossip.transaction_filter_capacity,
                        config.gossip.transaction_filter_false_positive_rate,
                    ),
                    min_score: config.min_score,
                }),
                resource_tester: Mutex::new(resource_tester),
                events: NodeEvents::new(config.event_capacity),
                arbitrator,
                gossip,
                upstream,
                latest,
                inbound: Mutex::new(Some(inbound)),
                processor: Mutex::new(None),
                broadcasts: Mutex::new(Vec::new()),
                config,
            }),
        })
    }

    /// Starts processing and opens the channels. Must run inside a tokio
    /// runtime. A node starts once.
    pub fn start(&self) -> Result<(), NodeError> {
        let inbound = self
            .inner
            .inbound
            .lock()
            .take()
            .ok_or(NodeError::AlreadyStarted)?;
        let inner = Arc::clone(&self.inner);
        *self.inner.processor.lock() = Some(tokio::spawn(run_processor(inner, inbound)));

        self.inner.gossip.launch();
        if let Some(upstream) = &self.inner.upstream {
            upstream.launch();
        }
        info!("node started");
        Ok(())
    }

    /// Closes every connection and cancels every timer the node owns.
    pub fn stop(&self) {
        self.inner.gossip.shutdown();
        if let Some(upstream) = &self.inner.upstream {
            upstream.shutdown();
        }
        if let Some(processor) = self.inner.processor.lock().take() {
            processor.abort();
        }
        for task in self.inner.broadcasts.lock().drain(..) {
            task.abort();
        }
        info!("node stopped");
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &NodeEvents {
        &self.inner.events
    }

    pub fn latest_tick(&self) -> Option<FinalizedTick> {
        self.inner.state.lock().consensus.latest_tick().cloned()
    }

    /// Latest finalized tick number, falling back to the configured initial
    /// tick, then to 0.
    pub fn latest_tick_number(&self) -> u32 {
        self.inner.state.lock().consensus.latest_tick_number()
    }

    /// Whether any tick number is known yet.
    pub fn has_tick(&self) -> bool {
        self.inner.state.lock().consensus.has_tick()
    }

    /// Follows the latest known tick number.
    pub fn watch_latest_tick(&self) -> watch::Receiver<Option<u32>> {
        self.inner.latest.subscribe()
    }

    pub fn epoch(&self) -> u16 {
        self.inner.state.lock().consensus.epoch()
    }

    pub fn info(&self) -> TransportInfo {
        self.inner.gossip.info()
    }

    pub fn status(&self) -> NodeStatus {
        let (epoch, latest_tick, entities, min_score) = {
            let state = self.inner.state.lock();
            (
                state.consensus.epoch(),
                state.consensus.latest_tick().map(|tick| tick.tick),
                state.consensus.entity_count(),
                state.min_score,
            )
        };
        NodeStatus {
            protocol: self.inner.config.protocol,
            epoch,
            latest_tick,
            peers: self.inner.gossip.peers(),
            upstream_connections: self.inner.upstream.as_ref().map_or(0, UpstreamPool::connected),
            entities,
            min_score,
            transport: self.inner.gossip.info(),
        }
    }

    /// Minimum cumulative resource-test score for a computor to qualify.
    pub fn set_min_score(&self, min_score: u64) {
        self.inner.state.lock().min_score = min_score;
        info!(min_score, "minimum score changed");
    }

    pub fn score(&self, identity: &PublicKey) -> u64 {
        self.inner.resource_tester.lock().score(identity)
    }

    /// Publishes a local transaction and keeps re-sending it, with growing
    /// pauses, until its tick is no longer in the future.
    pub fn broadcast_transaction(&self, transaction: &Transaction) -> Result<BroadcastHandle, NodeError> {
        let frame = encode_frame(
            &transaction.encode(),
            self.inner.config.protocol,
            true,
            MessageType::BroadcastTransaction,
        )?;
        let target = transaction.tick;
        let inner = Arc::clone(&self.inner);
        debug!(digest = %transaction.digest_hex(), tick = target, "broadcasting own transaction");

        let task = tokio::spawn(async move {
            inner.gossip.broadcast(frame.clone());
            inner.forward_upstream(&frame);
            let mut attempt = 1;
            loop {
                sleep(OWN_TRANSACTION_REBROADCAST_TIMEOUT * attempt).await;
                if target <= inner.state.lock().consensus.latest_tick_number() {
                    break;
                }
                inner.gossip.rebroadcast(frame.clone());
                attempt += 1;
            }
        });

        let handle = BroadcastHandle {
            abort: task.abort_handle(),
        };
        let mut broadcasts = self.inner.broadcasts.lock();
        broadcasts.retain(|task| !task.is_finished());
        broadcasts.push(task);
        Ok(handle)
    }

    /// Registers the local entity derived from `seed` and `index`.
    pub fn entity(&self, seed: &str, index: u32) -> Result<Entity, EntityError> {
        let keypair = Keypair::from_seed_index(seed, index)?;
        self.inner
            .state
            .lock()
            .consensus
            .register_entity(keypair.public_key())?;
        Ok(Entity::new(self.clone(), keypair))
    }

    pub fn entity_record(&self, public_key: &PublicKey) -> Option<EntityRecord> {
        self.inner.state.lock().consensus.entity(public_key).cloned()
    }

    pub fn set_entity_energy(&self, public_key: &PublicKey, energy: u64) -> Result<(), StateError> {
        self.inner
            .state
            .lock()
            .consensus
            .set_entity_energy(public_key, energy)
    }

    pub(crate) fn unregister_entity(&self, public_key: &PublicKey) {
        self.inner.state.lock().consensus.unregister_entity(public_key);
    }
}

/// Cancels a running own-transaction broadcast.
#[derive(Debug, Clone)]
pub struct BroadcastHandle {
    abort: AbortHandle,
}

impl BroadcastHandle {
    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

// ---------------------------------------------------------------------------
// Processing
// ---------------------------------------------------------------------------

async fn run_processor(inner: Arc<NodeInner>, mut inbound: mpsc::Receiver<TransportEvent>) {
    while let Some(event) = inbound.recv().await {
        match event {
            TransportEvent::Peers(peers) => {
                let _ = inner.events.peers.send(peers);
            }
            TransportEvent::Info(info) => {
                let _ = inner.events.info.send(info);
            }
            TransportEvent::Message(message) => {
                let _ = inner.events.messages.send(message.clone());
                let worker = Arc::clone(&inner);
                let job = message.clone();
                let verdict = match tokio::task::spawn_blocking(move || worker.process(&job)).await {
                    Ok(verdict) => verdict,
                    Err(err) => {
                        warn!(%err, "message processing aborted");
                        continue;
                    }
                };
                inner.apply(verdict, &message);
            }
        }
    }
    debug!("inbound stream closed");
}

impl NodeInner {
    /// Alignment slot of an origin: channels first, then upstream links.
    fn source_index(&self, origin: Origin) -> usize {
        match origin {
            Origin::Channel(index) => index,
            Origin::Upstream(index) => self.config.gossip.number_of_channels + index,
        }
    }

    fn forward_upstream(&self, frame: &Bytes) {
        if let Some(upstream) = &self.upstream {
            upstream.forward(frame);
        }
    }

    fn apply(&self, verdict: Verdict, message: &InboundMessage) {
        match (verdict, message.origin) {
            (Verdict::Propagate, Origin::Channel(_)) => {
                self.gossip.propagate(message);
                if message.kind == MessageType::BroadcastTransaction {
                    self.forward_upstream(&message.frame);
                }
            }
            (Verdict::Propagate, Origin::Upstream(_)) => self.gossip.broadcast(message.frame.clone()),
            (Verdict::Reject, Origin::Channel(_)) => self.gossip.close_and_reconnect(message),
            (Verdict::Reject, Origin::Upstream(_)) => {
                if let Some(upstream) = &self.upstream {
                    upstream.reject(message);
                }
            }
            (Verdict::Ignore, _) => {}
        }
    }

    fn process(&self, message: &InboundMessage) -> Verdict {
        if message.kind == MessageType::BroadcastTransaction {
            return self.process_transaction(message);
        }

        let body = message.payload();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        match message.kind {
            MessageType::BroadcastComputors => {
                let outcome = process_computors(
                    body,
                    self.source_index(message.origin),
                    Instant::now(),
                    &self.arbitrator,
                    &mut state.consensus,
                    &mut state.alignment,
                );
                match outcome {
                    Ok(outcome) => {
                        let (alignment, accepted) = match &outcome {
                            ComputorsOutcome::Stale(_) => (0.0, false),
                            ComputorsOutcome::Unaligned { ratio, .. } => (*ratio, false),
                            ComputorsOutcome::Accepted { ratio, .. } => (*ratio, true),
                        };
                        let set = outcome.set();
                        let _ = self.events.computors.send(ComputorsEvent {
                            epoch: set.epoch,
                            digest: set.digest,
                            alignment,
                            accepted,
                        });
                        Verdict::Propagate
                    }
                    Err(err) => {
                        warn!(origin = ?message.origin, %err, "rejected computor set");
                        Verdict::Reject
                    }
                }
            }

            MessageType::BroadcastTick => match process_tick(body, &mut state.consensus) {
                Ok(TickVerdict::Accepted { finalized, .. }) => {
                    if let Some(finalized) = finalized {
                        self.latest.send_replace(Some(finalized.tick));
                        self.gossip.prune_ticks_below(finalized.tick);
                        let _ = self.events.ticks.send(finalized);
                    }
                    Verdict::Propagate
                }
                Ok(TickVerdict::NotApplicable(reason)) => {
                    debug!(?reason, "tick not applicable");
                    Verdict::Ignore
                }
                Err(err) => {
                    warn!(origin = ?message.origin, %err, "rejected tick");
                    Verdict::Reject
                }
            },

            _ => Verdict::Ignore,
        }
    }

    /// Transactions take the state lock only for the dedup filter and the
    /// score gate. The resource test runs under its own lock.
    fn process_transaction(&self, message: &InboundMessage) -> Verdict {
        let body = message.payload();
        let transaction = match Transaction::decode(body).and_then(|tx| tx.verify().map(|()| tx)) {
            Ok(transaction) => transaction,
            Err(err) => {
                warn!(origin = ?message.origin, %err, "rejected transaction");
                return Verdict::Reject;
            }
        };

        if self.state.lock().seen_transactions.contains(body) {
            debug!(digest = %transaction.digest_hex(), "transaction already announced");
            return Verdict::Ignore;
        }

        let mut resource_test = None;
        if is_resource_test_candidate(&transaction, &self.arbitrator) {
            let result = self.resource_tester.lock().test(&transaction);
            match result {
                Ok(score) => {
                    let min_score = self.state.lock().min_score;
                    resource_test = Some(ResourceTestOutcome {
                        identity: score.identity,
                        score: score.score,
                        qualified: score.score >= min_score,
                    });
                }
                Err(ResourceTestError::Replay(identity)) => {
                    debug!(%identity, "resource test replay");
                    return Verdict::Ignore;
                }
                Err(err) => {
                    warn!(origin = ?message.origin, %err, "failed resource test");
                    return Verdict::Reject;
                }
            }
        }

        self.state.lock().seen_transactions.mark_if_unseen(body);
        let _ = self.events.transactions.send(TransactionEvent {
            transaction,
            resource_test,
        });
        Verdict::Propagate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GossipConfig, ResourceTestParameters};
    use crate::consensus::computors::tests::{computor_keys, signed_set};
    use crate::consensus::tick::tests::sample_tick;
    use crate::network::link::BoxedStream;
    use crate::transaction::{create_transaction, TransactionParams};
    use async_trait::async_trait;
    use std::io;

    /// Never connects; processing is driven through `process` directly.
    struct Offline;

    #[async_trait]
    impl Connector for Offline {
        async fn connect(&self, _channel: usize) -> io::Result<BoxedStream> {
            Err(io::Error::new(io::ErrorKind::NotConnected, "offline"))
        }
    }

    fn config(arbitrator: &Keypair) -> NodeConfig {
        NodeConfig {
            arbitrator: Some(arbitrator.public_key()),
            gossip: GossipConfig {
                number_of_channels: 2,
                transaction_filter_capacity: 1_000,
                ..GossipConfig::default()
            },
            resource_test: ResourceTestParameters {
                random_seed: [7; 32],
                number_of_neurons: 32,
                solution_threshold: 1,
            },
            alignment_threshold: 0.5,
            ..NodeConfig::default()
        }
    }

    fn node(arbitrator: &Keypair) -> Node {
        Node::new(config(arbitrator), Arc::new(Offline)).unwrap()
    }

    fn message(origin: Origin, kind: MessageType, payload: &[u8]) -> InboundMessage {
        InboundMessage {
            origin,
            generation: 1,
            kind,
            frame: encode_frame(payload, 155, true, kind).unwrap(),
        }
    }

    #[test]
    fn missing_arbitrator_is_a_config_error() {
        let err = Node::new(NodeConfig::default(), Arc::new(Offline)).err().unwrap();
        assert!(matches!(err, NodeError::Config(ConfigError::MissingArbitrator)));
    }

    #[test]
    fn computor_sets_need_alignment_before_acceptance() {
        let arbitrator = Keypair::generate();
        let node = node(&arbitrator);
        let mut events = node.events().computors();
        let set = signed_set(3, &computor_keys(1), &arbitrator).encode();

        // One of two sources is exactly half, which meets the threshold.
        let first = message(Origin::Channel(0), MessageType::BroadcastComputors, &set);
        assert_eq!(node.inner.process(&first), Verdict::Propagate);
        let event = events.try_recv().unwrap();
        assert!(event.accepted);
        assert_eq!(event.epoch, 3);
        assert_eq!(node.epoch(), 3);
    }

    #[test]
    fn forged_computor_set_is_rejected() {
        let arbitrator = Keypair::generate();
        let node = node(&arbitrator);
        let forged = signed_set(3, &computor_keys(1), &Keypair::generate()).encode();
        let msg = message(Origin::Channel(1), MessageType::BroadcastComputors, &forged);
        assert_eq!(node.inner.process(&msg), Verdict::Reject);
        assert_eq!(node.epoch(), 0);
    }

    #[test]
    fn ticks_before_any_computor_set_are_ignored() {
        let arbitrator = Keypair::generate();
        let node = node(&arbitrator);
        let key = Keypair::generate();
        let tick = sample_tick(1, 10, 0).sign(&key).encode();
        let msg = message(Origin::Channel(0), MessageType::BroadcastTick, &tick);
        assert_eq!(node.inner.process(&msg), Verdict::Ignore);
    }

    #[test]
    fn badly_signed_ticks_are_rejected() {
        let arbitrator = Keypair::generate();
        let node = node(&arbitrator);
        let keys = computor_keys(1);
        let set = signed_set(1, &keys, &arbitrator).encode();
        node.inner
            .process(&message(Origin::Channel(0), MessageType::BroadcastComputors, &set));

        let forged = sample_tick(1, 10, 0).sign(&Keypair::generate()).encode();
        let msg = message(Origin::Channel(0), MessageType::BroadcastTick, &forged);
        assert_eq!(node.inner.process(&msg), Verdict::Reject);

        let valid = sample_tick(1, 10, 0).sign(&keys[0]).encode();
        let msg = message(Origin::Channel(0), MessageType::BroadcastTick, &valid);
        assert_eq!(node.inner.process(&msg), Verdict::Propagate);
    }

    #[test]
    fn transactions_are_validated_and_announced() {
        let arbitrator = Keypair::generate();
        let node = node(&arbitrator);
        let mut events = node.events().transactions();
        let tx = create_transaction(
            &Keypair::generate(),
            TransactionParams {
                destination: Keypair::generate().public_key(),
                energy: 10,
                tick: 5,
                ..Default::default()
            },
        )
        .unwrap();

        let msg = message(Origin::Channel(0), MessageType::BroadcastTransaction, &tx.encode());
        assert_eq!(node.inner.process(&msg), Verdict::Propagate);
        let event = events.try_recv().unwrap();
        assert_eq!(event.transaction, tx);
        assert!(event.resource_test.is_none());

        let mut tampered = tx.encode();
        tampered[70] ^= 1;
        let msg = message(Origin::Channel(0), MessageType::BroadcastTransaction, &tampered);
        assert_eq!(node.inner.process(&msg), Verdict::Reject);
    }

    #[test]
    fn resource_test_replays_are_ignored_not_rejected() {
        let arbitrator = Keypair::generate();
        let node = node(&arbitrator);
        let computor = Keypair::generate();
        node.set_min_score(1);

        let solution = (0u32..512)
            .map(|i| {
                let mut nonce = [0u8; 32];
                nonce[..4].copy_from_slice(&i.to_le_bytes());
                create_transaction(
                    &computor,
                    TransactionParams {
                        destination: arbitrator.public_key(),
                        input: nonce.to_vec(),
                        ..Default::default()
                    },
                )
                .unwrap()
            })
            .find(|tx| {
                let nonce = tx.nonce().unwrap();
                node.inner
                    .resource_tester
                    .lock()
                    .output_length(&computor.public_key(), &nonce)
                    >= 1
            })
            .expect("a nonce matching the first target bit");

        let mut events = node.events().transactions();
        let msg = message(Origin::Channel(0), MessageType::BroadcastTransaction, &solution.encode());
        assert_eq!(node.inner.process(&msg), Verdict::Propagate);
        let outcome = events.try_recv().unwrap().resource_test.unwrap();
        assert_eq!(outcome.score, 1);
        assert!(outcome.qualified);
        assert_eq!(node.score(&computor.public_key()), 1);

        assert_eq!(node.inner.process(&msg), Verdict::Ignore);

        // Same nonce under a later tick: new bytes, same solution.
        let reused = create_transaction(
            &computor,
            TransactionParams {
                destination: arbitrator.public_key(),
                tick: solution.tick + 1,
                input: solution.input.clone(),
                ..Default::default()
            },
        )
        .unwrap();
        let msg = message(Origin::Channel(1), MessageType::BroadcastTransaction, &reused.encode());
        assert_eq!(node.inner.process(&msg), Verdict::Ignore);
        assert!(events.try_recv().is_err());
        assert_eq!(node.score(&computor.public_key()), 1);
    }

    #[test]
    fn repeated_transactions_are_announced_once() {
        let node = node(&Keypair::generate());
        let mut events = node.events().transactions();
        let tx = create_transaction(
            &Keypair::generate(),
            TransactionParams {
                destination: Keypair::generate().public_key(),
                energy: 3,
                tick: 9,
                ..Default::default()
            },
        )
        .unwrap();
        let bytes = tx.encode();

        let first = message(Origin::Channel(0), MessageType::BroadcastTransaction, &bytes);
        assert_eq!(node.inner.process(&first), Verdict::Propagate);
        let again = message(Origin::Upstream(0), MessageType::BroadcastTransaction, &bytes);
        assert_eq!(node.inner.process(&again), Verdict::Ignore);

        assert_eq!(events.try_recv().unwrap().transaction, tx);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn state_stays_readable_while_a_resource_test_runs() {
        let arbitrator = Keypair::generate();
        let node = node(&arbitrator);
        let candidate = create_transaction(
            &Keypair::generate(),
            TransactionParams {
                destination: arbitrator.public_key(),
                input: vec![5; 32],
                ..Default::default()
            },
        )
        .unwrap();
        let msg = message(Origin::Channel(0), MessageType::BroadcastTransaction, &candidate.encode());

        // Park the worker inside the resource test.
        let tester = node.inner.resource_tester.lock();
        let worker = {
            let node = node.clone();
            std::thread::spawn(move || node.inner.process(&msg))
        };
        std::thread::sleep(std::time::Duration::from_millis(100));

        assert!(node.inner.state.try_lock().is_some());
        assert_eq!(node.status().latest_tick, None);
        assert_eq!(node.latest_tick_number(), 0);

        drop(tester);
        assert_ne!(worker.join().unwrap(), Verdict::Ignore);
    }

    #[test]
    fn unknown_types_are_ignored() {
        let node = node(&Keypair::generate());
        let msg = message(Origin::Channel(0), MessageType::Unknown(77), b"whatever");
        assert_eq!(node.inner.process(&msg), Verdict::Ignore);
    }

    #[test]
    fn upstream_sources_follow_the_channels() {
        let node = node(&Keypair::generate());
        assert_eq!(node.inner.source_index(Origin::Channel(1)), 1);
        assert_eq!(node.inner.source_index(Origin::Upstream(0)), 2);
    }

    #[tokio::test]
    async fn start_twice_fails_and_status_reports() {
        let node = node(&Keypair::generate());
        node.start().unwrap();
        assert!(matches!(node.start(), Err(NodeError::AlreadyStarted)));

        let status = node.status();
        assert_eq!(status.protocol, 155);
        assert_eq!(status.latest_tick, None);
        assert_eq!(status.transport.number_of_channels, 2);
        node.stop();
    }

    #[tokio::test]
    async fn own_broadcast_stops_once_the_tick_has_passed() {
        let mut cfg = config(&Keypair::generate());
        cfg.initial_tick = Some(100);
        let node = Node::new(cfg, Arc::new(Offline)).unwrap();
        let tx = create_transaction(
            &Keypair::generate(),
            TransactionParams {
                tick: 50,
                ..Default::default()
            },
        )
        .unwrap();

        tokio::time::pause();
        let handle = node.broadcast_transaction(&tx).unwrap();
        tokio::time::sleep(OWN_TRANSACTION_REBROADCAST_TIMEOUT * 2).await;
        assert!(handle.is_finished());
    }
}
