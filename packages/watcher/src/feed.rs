//! Feed and Resolver Interfaces
//!
//! The pipeline consumes pending transaction hashes from a `TransactionFeed`
//! and turns each hash into a `ResolvedTransaction` through a
//! `TransactionResolver`. Node-backed implementations live in `node`.

use alloy::primitives::{Address, Bytes, TxHash};
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Default capacity of the identifier queue between feed and driver
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Terminal feed failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("Subscription failed: {0}")]
    Subscription(String),

    #[error("Subscription stream closed: {0}")]
    Closed(String),

    #[error("Unsubscribe failed: {0}")]
    Unsubscribe(String),
}

/// Per-item resolution failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The transaction left the pending pool (or never reached this node)
    #[error("Transaction {0} not found")]
    NotFound(TxHash),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Resolution timed out after {0}ms")]
    Timeout(u64),
}

/// Transaction fields the pipeline needs
///
/// Deserializes straight from a JSON-RPC transaction object; other fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResolvedTransaction {
    pub hash: TxHash,
    /// Recipient address (None for contract creation)
    #[serde(default)]
    pub to: Option<Address>,
    /// Transaction input data (calldata)
    #[serde(default)]
    pub input: Bytes,
}

/// Live subscription: a bounded identifier queue plus a one-shot terminal error
#[derive(Debug)]
pub struct Subscription {
    pub ids: mpsc::Receiver<TxHash>,
    pub errors: oneshot::Receiver<FeedError>,
}

/// Source of pending transaction hashes
#[async_trait]
pub trait TransactionFeed: Send {
    /// Start delivering hashes into a queue of `capacity` entries
    async fn subscribe(&mut self, capacity: usize) -> Result<Subscription, FeedError>;

    /// Stop delivery and release every resource held by the subscription
    async fn unsubscribe(&mut self) -> Result<(), FeedError>;
}

/// Turns a hash into a transaction
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionResolver: Send + Sync {
    async fn resolve(&self, hash: TxHash) -> Result<ResolvedTransaction, ResolveError>;
}

/// Feed driven by an in-process producer
///
/// Useful for replaying recorded hashes and for tests. The queue is created
/// up front so the producer handle exists before the driver subscribes; its
/// capacity is fixed at construction.
#[derive(Debug)]
pub struct ChannelFeed {
    subscription: Option<Subscription>,
    subscribed: bool,
}

/// Producer side of a `ChannelFeed`
#[derive(Debug)]
pub struct FeedHandle {
    ids: mpsc::Sender<TxHash>,
    errors: Option<oneshot::Sender<FeedError>>,
}

impl ChannelFeed {
    pub fn new(capacity: usize) -> (Self, FeedHandle) {
        let (ids_tx, ids_rx) = mpsc::channel(capacity.max(1));
        let (err_tx, err_rx) = oneshot::channel();
        let feed = Self {
            subscription: Some(Subscription {
                ids: ids_rx,
                errors: err_rx,
            }),
            subscribed: false,
        };
        let handle = FeedHandle {
            ids: ids_tx,
            errors: Some(err_tx),
        };
        (feed, handle)
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }
}

impl FeedHandle {
    /// Push a hash, waiting while the queue is full.
    ///
    /// Returns `false` once the consumer has gone away.
    pub async fn send(&self, hash: TxHash) -> bool {
        self.ids.send(hash).await.is_ok()
    }

    /// Signal a terminal error; only the first call has an effect
    pub fn fail(&mut self, error: FeedError) {
        if let Some(tx) = self.errors.take() {
            let _ = tx.send(error);
        }
    }
}

#[async_trait]
impl TransactionFeed for ChannelFeed {
    async fn subscribe(&mut self, _capacity: usize) -> Result<Subscription, FeedError> {
        let subscription = self
            .subscription
            .take()
            .ok_or_else(|| FeedError::Subscription("channel feed already subscribed".to_string()))?;
        self.subscribed = true;
        Ok(subscription)
    }

    async fn unsubscribe(&mut self) -> Result<(), FeedError> {
        self.subscribed = false;
        debug!("channel feed unsubscribed");
        Ok(())
    }
}
