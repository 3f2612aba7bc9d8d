//! # Entities
//!
//! A locally owned identity: its key, its known energy and its outgoing
//! transactions. The node tracks the public half in the consensus state so
//! the computor index stays current across epochs.
//!
//! An entity is `Active` until [`Entity::destroy`] zeroes its key and
//! cancels every pending issuance and rebroadcast. After that, every method
//! fails with [`EntityError::Destroyed`].

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info};

use super::node::{BroadcastHandle, Node, NodeError};
use crate::config::{TICK_WAIT_RETRY_INTERVAL, TRANSACTION_PUBLICATION_TICK_OFFSET};
use crate::consensus::StateError;
use crate::crypto::{KeyError, Keypair, PublicKey, Signature};
use crate::transaction::{create_transaction, Transaction, TransactionError, TransactionParams};

#[derive(Debug, Error)]
pub enum EntityError {
    #[error("entity was destroyed")]
    Destroyed,

    #[error("insufficient energy: {available} available, {requested} requested")]
    InsufficientEnergy { available: u64, requested: u64 },

    #[error("tick {tick} has elapsed (latest {latest})")]
    TickElapsed { tick: u32, latest: u32 },

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Node(#[from] NodeError),
}

/// What a caller specifies for an outgoing transaction. `tick: None` means
/// a few ticks past the latest one.
#[derive(Debug, Clone, Default)]
pub struct EntityTransactionParams {
    pub destination: PublicKey,
    pub energy: u64,
    pub tick: Option<u32>,
    pub input_type: u16,
    pub input: Vec<u8>,
}

struct ActiveEntity {
    keypair: Keypair,
    broadcasts: Vec<BroadcastHandle>,
}

enum Lifecycle {
    Active(ActiveEntity),
    Destroyed,
}

/// Handle to a local entity. Clones share the same lifecycle.
#[derive(Clone)]
pub struct Entity {
    inner: Arc<EntityInner>,
}

struct EntityInner {
    node: Node,
    public_key: PublicKey,
    lifecycle: Mutex<Lifecycle>,
    destroyed: watch::Sender<bool>,
}

impl Entity {
    pub(crate) fn new(node: Node, keypair: Keypair) -> Self {
        let public_key = keypair.public_key();
        info!(identity = %public_key, "entity registered");
        Self {
            inner: Arc::new(EntityInner {
                node,
                public_key,
                lifecycle: Mutex::new(Lifecycle::Active(ActiveEntity {
                    keypair,
                    broadcasts: Vec::new(),
                })),
                destroyed: watch::channel(false).0,
            }),
        }
    }

    fn ensure_active(&self) -> Result<(), EntityError> {
        match *self.inner.lifecycle.lock() {
            Lifecycle::Active(_) => Ok(()),
            Lifecycle::Destroyed => Err(EntityError::Destroyed),
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.ensure_active().is_err()
    }

    pub fn identity(&self) -> Result<PublicKey, EntityError> {
        self.ensure_active()?;
        Ok(self.inner.public_key)
    }

    /// Energy as last reported for this entity.
    pub fn energy(&self) -> Result<u64, EntityError> {
        self.ensure_active()?;
        self.inner
            .node
            .entity_record(&self.inner.public_key)
            .map(|record| record.energy)
            .ok_or(EntityError::Destroyed)
    }

    pub fn set_energy(&self, energy: u64) -> Result<(), EntityError> {
        self.ensure_active()?;
        Ok(self.inner.node.set_entity_energy(&self.inner.public_key, energy)?)
    }

    /// Position in the current computor set, if the entity is a computor.
    pub fn computor_index(&self) -> Result<Option<u16>, EntityError> {
        self.ensure_active()?;
        Ok(self
            .inner
            .node
            .entity_record(&self.inner.public_key)
            .and_then(|record| record.computor_index))
    }

    pub fn sign(&self, message: &[u8]) -> Result<Signature, EntityError> {
        match &*self.inner.lifecycle.lock() {
            Lifecycle::Active(active) => Ok(active.keypair.sign(message)),
            Lifecycle::Destroyed => Err(EntityError::Destroyed),
        }
    }

    /// Signs and broadcasts a transaction.
    ///
    /// Without an explicit tick, waits until some tick is known and targets
    /// `latest + TRANSACTION_PUBLICATION_TICK_OFFSET`. An explicit tick must
    /// still be in the future. Destroying the entity while it waits fails
    /// the call.
    pub async fn transaction(&self, params: EntityTransactionParams) -> Result<PendingTransaction, EntityError> {
        let available = self.energy()?;
        if available < params.energy {
            return Err(EntityError::InsufficientEnergy {
                available,
                requested: params.energy,
            });
        }

        if params.tick.is_none() {
            self.wait_for_tick().await?;
        }
        let tick = publication_tick(params.tick, self.inner.node.latest_tick_number())?;

        let pending = PendingTransaction {
            entity: self.clone(),
            params,
            transactions: Mutex::new(Vec::new()),
        };
        pending.issue(tick)?;
        Ok(pending)
    }

    async fn wait_for_tick(&self) -> Result<(), EntityError> {
        let mut destroyed = self.inner.destroyed.subscribe();
        while !self.inner.node.has_tick() {
            debug!(identity = %self.inner.public_key, "no tick known yet, waiting");
            tokio::select! {
                _ = destroyed.changed() => return Err(EntityError::Destroyed),
                _ = sleep(TICK_WAIT_RETRY_INTERVAL) => {}
            }
            self.ensure_active()?;
        }
        Ok(())
    }

    fn sign_transaction(&self, params: &EntityTransactionParams, tick: u32) -> Result<Transaction, EntityError> {
        match &*self.inner.lifecycle.lock() {
            Lifecycle::Active(active) => Ok(create_transaction(
                &active.keypair,
                TransactionParams {
                    destination: params.destination,
                    energy: params.energy,
                    tick,
                    input_type: params.input_type,
                    input: params.input.clone(),
                },
            )?),
            Lifecycle::Destroyed => Err(EntityError::Destroyed),
        }
    }

    fn broadcast(&self, transaction: &Transaction) -> Result<BroadcastHandle, EntityError> {
        let mut lifecycle = self.inner.lifecycle.lock();
        let Lifecycle::Active(active) = &mut *lifecycle else {
            return Err(EntityError::Destroyed);
        };
        let handle = self.inner.node.broadcast_transaction(transaction)?;
        active.broadcasts.retain(|handle| !handle.is_finished());
        active.broadcasts.push(handle.clone());
        Ok(handle)
    }

    /// Unregisters the entity, zeroes its key and cancels its broadcasts.
    /// Idempotent.
    pub fn destroy(&self) {
        let previous = std::mem::replace(&mut *self.inner.lifecycle.lock(), Lifecycle::Destroyed);
        let Lifecycle::Active(active) = previous else {
            return;
        };
        for handle in &active.broadcasts {
            handle.cancel();
        }
        self.inner.node.unregister_entity(&self.inner.public_key);
        self.inner.destroyed.send_replace(true);
        info!(identity = %self.inner.public_key, "entity destroyed");
    }
}

/// The requested tick, or a few ticks past `latest`. Either way it must
/// still be ahead of `latest`.
fn publication_tick(requested: Option<u32>, latest: u32) -> Result<u32, EntityError> {
    let tick = requested.unwrap_or_else(|| latest.saturating_add(TRANSACTION_PUBLICATION_TICK_OFFSET));
    if tick <= latest {
        return Err(EntityError::TickElapsed { tick, latest });
    }
    Ok(tick)
}

/// A transaction issued by an entity, plus its replays at later ticks.
pub struct PendingTransaction {
    entity: Entity,
    params: EntityTransactionParams,
    transactions: Mutex<Vec<Transaction>>,
}

impl PendingTransaction {
    fn issue(&self, tick: u32) -> Result<Transaction, EntityError> {
        let transaction = self.entity.sign_transaction(&self.params, tick)?;
        self.entity.broadcast(&transaction)?;
        self.transactions.lock().push(transaction.clone());
        Ok(transaction)
    }

    /// The original transaction followed by every replay.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.transactions.lock().clone()
    }

    pub fn replays(&self) -> Vec<Transaction> {
        self.transactions.lock().iter().skip(1).cloned().collect()
    }

    /// Issues the same transfer again for a later tick. `None` picks a few
    /// ticks past the latest one.
    pub fn replay(&self, tick: Option<u32>) -> Result<Transaction, EntityError> {
        self.entity.ensure_active()?;
        let tick = publication_tick(tick, self.entity.inner.node.latest_tick_number())?;
        self.issue(tick)
    }

    /// Restarts the broadcast of the original transaction.
    pub fn rebroadcast(&self) -> Result<BroadcastHandle, EntityError> {
        let original = self
            .transactions
            .lock()
            .first()
            .cloned()
            .ok_or(EntityError::Destroyed)?;
        self.entity.broadcast(&original)
    }
}
