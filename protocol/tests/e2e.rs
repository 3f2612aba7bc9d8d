//! End-to-end tests for a ticknet node.
//!
//! The node runs for real: channel tasks, the processing loop, event
//! streams. Its "overlay" is a set of in-memory pipes whose far ends are held
//! by the test, which plays every remote peer: the arbitrator announcing the
//! computor set, the computors publishing ticks, and a misbehaving neighbour.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use ticknet_protocol::codec::{encode_frame, MessageType};
use ticknet_protocol::config::{GossipConfig, NodeConfig, NUMBER_OF_COMPUTORS, QUORUM};
use ticknet_protocol::consensus::{ComputorSet, Tick, TickTimestamp};
use ticknet_protocol::crypto::{Keypair, PublicKey};
use ticknet_protocol::network::{BoxedStream, Connector, EntityTransactionParams, Node};

const PROTOCOL: u8 = 155;
const WAIT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

/// Every connection attempt yields a pipe; the far end goes to the test.
struct PipeConnector {
    peers: mpsc::UnboundedSender<DuplexStream>,
}

#[async_trait]
impl Connector for PipeConnector {
    async fn connect(&self, _channel: usize) -> io::Result<BoxedStream> {
        let (near, far) = tokio::io::duplex(1 << 20);
        self.peers
            .send(far)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "test over"))?;
        Ok(Box::new(near))
    }
}

struct Network {
    arbitrator: Keypair,
    computors: Vec<Keypair>,
}

impl Network {
    fn new() -> Self {
        Self {
            arbitrator: Keypair::generate(),
            computors: (0..NUMBER_OF_COMPUTORS).map(|_| Keypair::generate()).collect(),
        }
    }

    fn computor_set(&self, epoch: u16) -> Vec<u8> {
        let keys: Vec<PublicKey> = self.computors.iter().map(Keypair::public_key).collect();
        let payload = ComputorSet::signed(epoch, keys, &self.arbitrator).encode();
        frame(&payload, MessageType::BroadcastComputors)
    }

    fn tick(&self, epoch: u16, tick: u32, computor_index: u16) -> Vec<u8> {
        let payload = Tick {
            computor_index,
            epoch,
            tick,
            timestamp: TickTimestamp {
                millisecond: 1,
                second: 2,
                minute: 3,
                hour: 4,
                day: 5,
                month: 6,
                year: 26,
            },
            prev_spectrum_digest: [9; 32],
            transaction_digest: [8; 32],
            ..Tick::default()
        }
        .sign(&self.computors[usize::from(computor_index)])
        .encode();
        frame(&payload, MessageType::BroadcastTick)
    }
}

fn frame(payload: &[u8], kind: MessageType) -> Vec<u8> {
    encode_frame(payload, PROTOCOL, true, kind).unwrap().to_vec()
}

fn start_node(network: &Network, initial_tick: Option<u32>) -> (Node, mpsc::UnboundedReceiver<DuplexStream>) {
    let (peers_tx, peers) = mpsc::unbounded_channel();
    let config = NodeConfig {
        protocol: PROTOCOL,
        arbitrator: Some(network.arbitrator.public_key()),
        gossip: GossipConfig {
            number_of_channels: 1,
            transaction_filter_capacity: 10_000,
            ..GossipConfig::default()
        },
        alignment_threshold: 1.0,
        initial_tick,
        event_capacity: 1_024,
        ..NodeConfig::default()
    };
    let node = Node::new(config, Arc::new(PipeConnector { peers: peers_tx })).unwrap();
    node.start().unwrap();
    (node, peers)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quorum_of_ticks_finalizes() {
    let network = Network::new();
    let (node, mut peers) = start_node(&network, None);
    let mut computors = node.events().computors();
    let mut ticks = node.events().ticks();
    let mut peer = timeout(WAIT, peers.recv()).await.unwrap().unwrap();

    peer.write_all(&network.computor_set(7)).await.unwrap();
    let event = timeout(WAIT, computors.recv()).await.unwrap().unwrap();
    assert!(event.accepted);
    assert_eq!(node.epoch(), 7);

    for index in 0..QUORUM as u16 {
        peer.write_all(&network.tick(7, 1_000, index)).await.unwrap();
    }

    let finalized = timeout(WAIT, ticks.recv()).await.unwrap().unwrap();
    assert_eq!(finalized.tick, 1_000);
    assert_eq!(finalized.epoch, 7);
    assert_eq!(finalized.signatures.len(), QUORUM);
    assert_eq!(node.latest_tick_number(), 1_000);
    assert_eq!(node.latest_tick().map(|t| t.tick), Some(1_000));

    node.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forged_tick_costs_the_channel() {
    let network = Network::new();
    let (node, mut peers) = start_node(&network, None);
    let mut computors = node.events().computors();
    let mut peer = timeout(WAIT, peers.recv()).await.unwrap().unwrap();

    peer.write_all(&network.computor_set(1)).await.unwrap();
    timeout(WAIT, computors.recv()).await.unwrap().unwrap();

    // Computor 3 signed it, but it claims to be computor 4.
    let mut forged = network.tick(1, 50, 3);
    forged[8] = 4;
    peer.write_all(&forged).await.unwrap();

    let mut buf = [0u8; 64];
    let closed = timeout(WAIT, async {
        loop {
            if peer.read(&mut buf).await.unwrap_or(0) == 0 {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "channel was not closed");
    assert!(node.info().discarded_bytes >= forged.len() as u64);

    // The channel redials with backoff.
    let redialed = timeout(WAIT, peers.recv()).await.unwrap();
    assert!(redialed.is_some());
    node.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn entity_transactions_reach_the_overlay() {
    let network = Network::new();
    let (node, mut peers) = start_node(&network, Some(20));
    let mut peer = timeout(WAIT, peers.recv()).await.unwrap().unwrap();

    // Wait until the channel is open before issuing.
    timeout(WAIT, async {
        while node.info().number_of_open_channels == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let entity = node.entity("e2e seed", 0).unwrap();
    entity.set_energy(1_000).unwrap();
    let pending = entity
        .transaction(EntityTransactionParams {
            destination: Keypair::generate().public_key(),
            energy: 250,
            ..Default::default()
        })
        .await
        .unwrap();
    let issued = pending.transactions()[0].clone();
    assert_eq!(issued.tick, 25);

    let mut header = [0u8; 8];
    timeout(WAIT, peer.read_exact(&mut header)).await.unwrap().unwrap();
    assert_eq!(header[7], MessageType::BroadcastTransaction.to_u8());
    let size = usize::from(header[0]) | usize::from(header[1]) << 8 | usize::from(header[2]) << 16;
    let mut body = vec![0u8; size - 8];
    peer.read_exact(&mut body).await.unwrap();
    assert_eq!(body, issued.encode());

    entity.destroy();
    node.stop();
}
