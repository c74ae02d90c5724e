//! Pipeline Driver
//!
//! Pulls transaction hashes from a feed and runs each one through
//! resolve -> classify -> decode -> unwind, handing results to an observer.
//!
//! Lifecycle: `Running` until cancellation, a terminal feed error, or the feed
//! closing; then `Draining`, where the queue is closed to new identifiers and
//! what is already buffered is handled per `DrainPolicy`; then `Stopped`, after
//! the feed has been unsubscribed. Cancellation is only observed between
//! items, so the item in flight always completes.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::TxHash;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::abi::DecodeError;
use crate::config::{DrainPolicy, RejectionLog, WatcherConfig};
use crate::decoder::decode_call;
use crate::feed::{FeedError, ResolveError, Subscription, TransactionFeed, TransactionResolver};
use crate::filter::{Classification, Classifier, RejectReason};
use crate::multicall::{ShapeMismatch, Unwinder};
use crate::observer::{Observer, PipelineEvent};
use crate::signatures::SignatureTable;

/// Driver lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Running,
    Draining,
    Stopped,
}

/// Terminal driver failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),
}

/// What happened to one identifier
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// No longer pending; expected churn
    NotFound,
    ResolveFailed(ResolveError),
    Rejected(RejectReason),
    DecodeFailed(DecodeError),
    /// Decoded and emitted; `unwound` inner calls followed
    Qualifying { unwound: usize },
    /// Decoded and emitted, but the batch could not be unwound
    ShapeMismatch(ShapeMismatch),
}

/// Per-run counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub received: u64,
    pub rejected: u64,
    pub not_found: u64,
    pub resolve_failures: u64,
    pub qualifying: u64,
    pub unwound: u64,
    pub decode_failures: u64,
    pub shape_mismatches: u64,
    pub discarded: u64,
}

/// Single-consumer pipeline loop
pub struct Driver<F, R, O> {
    feed: F,
    resolver: R,
    observer: O,
    classifier: Classifier,
    unwinder: Unwinder,
    queue_capacity: usize,
    drain_policy: DrainPolicy,
    rejection_log: RejectionLog,
    resolve_timeout: Duration,
    state: watch::Sender<DriverState>,
    stats: DriverStats,
}

impl<F, R, O> Driver<F, R, O>
where
    F: TransactionFeed,
    R: TransactionResolver,
    O: Observer,
{
    /// Create a driver with default queue, drain, and logging settings
    pub fn new(feed: F, resolver: R, observer: O, classifier: Classifier, unwinder: Unwinder) -> Self {
        let defaults = WatcherConfig::default();
        let (state, _) = watch::channel(DriverState::Running);
        Self {
            feed,
            resolver,
            observer,
            classifier,
            unwinder,
            queue_capacity: defaults.queue_capacity,
            drain_policy: defaults.drain_policy,
            rejection_log: defaults.rejection_log,
            resolve_timeout: Duration::from_millis(defaults.resolve_timeout_ms),
            state,
            stats: DriverStats::default(),
        }
    }

    /// Create a driver from a validated config and its signature table
    pub fn from_config(
        config: &WatcherConfig,
        table: Arc<SignatureTable>,
        feed: F,
        resolver: R,
        observer: O,
    ) -> Self {
        Self::new(
            feed,
            resolver,
            observer,
            config.classifier(Arc::clone(&table)),
            config.unwinder(table),
        )
        .with_queue_capacity(config.queue_capacity)
        .with_drain_policy(config.drain_policy)
        .with_rejection_log(config.rejection_log)
        .with_resolve_timeout(Duration::from_millis(config.resolve_timeout_ms))
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_drain_policy(mut self, policy: DrainPolicy) -> Self {
        self.drain_policy = policy;
        self
    }

    pub fn with_rejection_log(mut self, log: RejectionLog) -> Self {
        self.rejection_log = log;
        self
    }

    pub fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    /// Watch lifecycle transitions
    pub fn state(&self) -> watch::Receiver<DriverState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> &DriverStats {
        &self.stats
    }

    pub fn feed(&self) -> &F {
        &self.feed
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    /// Run until cancelled or the feed ends
    ///
    /// # Returns
    /// The run's counters, or `DriverError::Feed` when the feed failed
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<DriverStats, DriverError> {
        let Subscription {
            mut ids,
            mut errors,
        } = match self.feed.subscribe(self.queue_capacity).await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(error = %e, "failed to subscribe to feed");
                self.state.send_replace(DriverState::Stopped);
                return Err(e.into());
            }
        };

        self.state.send_replace(DriverState::Running);
        info!(capacity = self.queue_capacity, "pipeline running");

        let mut errors_open = true;
        let failure = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("shutdown requested");
                    break None;
                }
                result = &mut errors, if errors_open => match result {
                    Ok(e) => {
                        error!(error = %e, "feed failed");
                        break Some(e);
                    }
                    // Producer went away without reporting an error; the
                    // queue closing will end the loop.
                    Err(_) => errors_open = false,
                },
                next = ids.recv() => match next {
                    Some(hash) => {
                        self.process(hash).await;
                    }
                    None => {
                        info!("feed closed");
                        break None;
                    }
                },
            }
        };

        self.state.send_replace(DriverState::Draining);
        ids.close();
        self.drain(&mut ids).await;

        if let Err(e) = self.feed.unsubscribe().await {
            warn!(error = %e, "failed to unsubscribe from feed");
        }
        drop(ids);
        self.state.send_replace(DriverState::Stopped);
        info!(stats = ?self.stats, "pipeline stopped");

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(self.stats.clone()),
        }
    }

    async fn drain(&mut self, ids: &mut mpsc::Receiver<TxHash>) {
        while let Ok(hash) = ids.try_recv() {
            match self.drain_policy {
                DrainPolicy::Discard => {
                    self.stats.discarded += 1;
                    debug!(hash = %hash, "discarding queued transaction");
                }
                DrainPolicy::Drain => {
                    self.process(hash).await;
                }
            }
        }
    }

    /// Run one identifier through the pipeline
    pub async fn process(&mut self, hash: TxHash) -> Outcome {
        self.stats.received += 1;

        let resolved = match tokio::time::timeout(self.resolve_timeout, self.resolver.resolve(hash)).await {
            Ok(result) => result,
            Err(_) => Err(ResolveError::Timeout(millis(self.resolve_timeout))),
        };
        let tx = match resolved {
            Ok(tx) => tx,
            Err(ResolveError::NotFound(_)) => {
                self.stats.not_found += 1;
                debug!(hash = %hash, "transaction no longer pending");
                return Outcome::NotFound;
            }
            Err(e) => {
                self.stats.resolve_failures += 1;
                warn!(hash = %hash, error = %e, "failed to resolve transaction");
                return Outcome::ResolveFailed(e);
            }
        };

        let (schema, selector, remainder) = match self.classifier.classify(&tx) {
            Classification::Accepted {
                schema,
                selector,
                remainder,
            } => (schema, selector, remainder),
            Classification::Rejected(reason) => {
                self.stats.rejected += 1;
                self.log_rejection(hash, &reason);
                return Outcome::Rejected(reason);
            }
        };

        let decoded = match decode_call(&schema, remainder) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.stats.decode_failures += 1;
                error!(
                    hash = %hash,
                    function = %schema.signature,
                    input_data = %tx.input,
                    error = %e,
                    "failed to unpack call data"
                );
                return Outcome::DecodeFailed(e);
            }
        };

        self.stats.qualifying += 1;
        let batch = self.unwinder.handles(&selector).then(|| self.unwinder.unwind(&decoded));
        self.observer
            .emit(&PipelineEvent::QualifyingCall {
                hash,
                input: tx.input.clone(),
                decoded,
            })
            .await;

        match batch {
            None => Outcome::Qualifying { unwound: 0 },
            Some(Ok(calls)) => {
                let unwound = calls.len();
                for call in calls {
                    self.stats.unwound += 1;
                    self.observer.emit(&PipelineEvent::UnwoundCall { hash, call }).await;
                }
                Outcome::Qualifying { unwound }
            }
            Some(Err(e)) => {
                self.stats.shape_mismatches += 1;
                error!(hash = %hash, error = %e, "failed to unwind batch");
                Outcome::ShapeMismatch(e)
            }
        }
    }

    fn log_rejection(&self, hash: TxHash, reason: &RejectReason) {
        match self.rejection_log {
            RejectionLog::Silent => {}
            RejectionLog::Trace => trace!(hash = %hash, reason = %reason, "transaction rejected"),
            RejectionLog::Debug => debug!(hash = %hash, reason = %reason, "transaction rejected"),
        }
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
