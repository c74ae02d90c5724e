//! Node Connection Module
//!
//! Connects to an Ethereum node over WebSocket or a Unix IPC socket and adapts
//! it to the pipeline's feed and resolver traits. The feed forwards the
//! node's pending-transaction subscription into a bounded queue from a pump
//! task; the resolver issues `eth_getTransactionByHash`.
//!
//! There is a single connection attempt, bounded by a timeout. A dropped
//! subscription is reported to the driver as a terminal feed error.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy::primitives::TxHash;
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::pubsub::{PubSubFrontend, Subscription as PendingSubscription};
use alloy::transports::ipc::IpcConnect;
use alloy::transports::ws::WsConnect;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::feed::{
    FeedError, ResolveError, ResolvedTransaction, Subscription, TransactionFeed,
    TransactionResolver,
};

/// Default node endpoint
pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8546";

/// Connection timeout in milliseconds
pub const CONNECTION_TIMEOUT_MS: u64 = 5000;

/// Errors that can occur while connecting to the node
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("IPC socket not found at path: {0}")]
    SocketNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection timeout after {0}ms")]
    Timeout(u64),
}

/// Where the node listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `ws://` or `wss://` URL
    Ws(String),
    /// Unix socket path, `~` already expanded
    Ipc(PathBuf),
}

impl Endpoint {
    /// Parse an endpoint: WebSocket URLs by scheme, anything else as a socket path
    pub fn parse(endpoint: &str) -> Result<Self, NodeError> {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return Err(NodeError::InvalidEndpoint("endpoint cannot be empty".to_string()));
        }
        if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
            return Ok(Endpoint::Ws(endpoint.to_string()));
        }
        if endpoint.contains("://") {
            return Err(NodeError::InvalidEndpoint(format!(
                "unsupported scheme in {endpoint}, expected ws://, wss:// or a socket path"
            )));
        }
        Ok(Endpoint::Ipc(expand_path(endpoint)))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Ws(url) => f.write_str(url),
            Endpoint::Ipc(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Expand ~ to home directory in path
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Configuration for the node connection
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub endpoint: Endpoint,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::Ws(DEFAULT_ENDPOINT.to_string()),
            connect_timeout_ms: CONNECTION_TIMEOUT_MS,
        }
    }
}

impl NodeConfig {
    /// Create a new config for the given endpoint string
    pub fn with_endpoint(endpoint: &str) -> Result<Self, NodeError> {
        Ok(Self {
            endpoint: Endpoint::parse(endpoint)?,
            ..Default::default()
        })
    }
}

/// Open a pub/sub provider for the configured endpoint
pub async fn connect(config: &NodeConfig) -> Result<RootProvider<PubSubFrontend>, NodeError> {
    let limit = Duration::from_millis(config.connect_timeout_ms);
    info!(endpoint = %config.endpoint, "connecting to node");

    if let Endpoint::Ipc(path) = &config.endpoint {
        if !Path::new(path).exists() {
            return Err(NodeError::SocketNotFound(path.display().to_string()));
        }
    }

    let connecting = async {
        match &config.endpoint {
            Endpoint::Ws(url) => ProviderBuilder::new().on_ws(WsConnect::new(url.clone())).await,
            Endpoint::Ipc(path) => {
                let ipc: IpcConnect<String> = IpcConnect::new(path.to_string_lossy().into_owned());
                ProviderBuilder::new().on_ipc(ipc).await
            }
        }
    };

    let provider = tokio::time::timeout(limit, connecting)
        .await
        .map_err(|_| NodeError::Timeout(config.connect_timeout_ms))?
        .map_err(|e| NodeError::ConnectionFailed(e.to_string()))?;

    info!(endpoint = %config.endpoint, "connected to node");
    Ok(provider)
}

/// Connect once and build the feed and resolver over the shared provider
pub async fn open(config: &NodeConfig) -> Result<(NodeFeed, NodeResolver), NodeError> {
    let provider = connect(config).await?;
    Ok((NodeFeed::new(provider.clone()), NodeResolver::new(provider)))
}

/// Pending-transaction feed backed by a node subscription
pub struct NodeFeed {
    provider: RootProvider<PubSubFrontend>,
    cancel: CancellationToken,
    pump: Option<JoinHandle<()>>,
    subscription_id: Option<TxHash>,
}

impl NodeFeed {
    pub fn new(provider: RootProvider<PubSubFrontend>) -> Self {
        Self {
            provider,
            cancel: CancellationToken::new(),
            pump: None,
            subscription_id: None,
        }
    }
}

#[async_trait]
impl TransactionFeed for NodeFeed {
    async fn subscribe(&mut self, capacity: usize) -> Result<Subscription, FeedError> {
        if self.pump.is_some() {
            return Err(FeedError::Subscription("already subscribed".to_string()));
        }

        let pending = self
            .provider
            .subscribe_pending_transactions()
            .await
            .map_err(|e| FeedError::Subscription(e.to_string()))?;
        let id = *pending.local_id();
        debug!(subscription = %id, "subscribed to pending transactions");

        let (ids_tx, ids_rx) = mpsc::channel(capacity.max(1));
        let (err_tx, err_rx) = oneshot::channel();
        self.cancel = CancellationToken::new();
        self.pump = Some(tokio::spawn(pump(
            pending,
            ids_tx,
            err_tx,
            self.cancel.clone(),
        )));
        self.subscription_id = Some(id);

        Ok(Subscription {
            ids: ids_rx,
            errors: err_rx,
        })
    }

    async fn unsubscribe(&mut self) -> Result<(), FeedError> {
        self.cancel.cancel();
        if let Some(handle) = self.pump.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "subscription pump did not exit cleanly");
            }
        }
        if let Some(id) = self.subscription_id.take() {
            self.provider
                .unsubscribe(id)
                .map_err(|e| FeedError::Unsubscribe(e.to_string()))?;
            debug!(subscription = %id, "unsubscribed from pending transactions");
        }
        Ok(())
    }
}

/// Forward subscription items into the bounded queue until cancelled
///
/// Blocks on a full queue; the node-side broadcast buffer absorbs bursts in
/// the meantime and reports anything it had to drop as `Lagged`.
async fn pump(
    mut pending: PendingSubscription<TxHash>,
    ids: mpsc::Sender<TxHash>,
    errors: oneshot::Sender<FeedError>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = pending.recv() => next,
        };

        match next {
            Ok(hash) => {
                if !forward(hash, &ids, &cancel).await {
                    return;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "pending transaction subscription lagged, hashes dropped");
            }
            Err(RecvError::Closed) => {
                let _ = errors.send(FeedError::Closed(
                    "pending transaction subscription ended".to_string(),
                ));
                return;
            }
        }
    }
}

/// Queue one hash, returning false once the pump should stop
///
/// A hash that cannot be queued is traced before it is dropped.
async fn forward(hash: TxHash, ids: &mpsc::Sender<TxHash>, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(hash = %hash, "feed cancelled, dropping pending transaction");
            false
        }
        sent = ids.send(hash) => {
            if sent.is_err() {
                debug!(hash = %hash, "identifier queue closed, dropping pending transaction");
            }
            sent.is_ok()
        }
    }
}

/// Resolves hashes with `eth_getTransactionByHash`
///
/// A `null` result means the transaction is no longer pending (or was never
/// seen by this node) and maps to `NotFound`. Lookups are not time-bounded
/// here; the driver applies its own timeout around every resolution.
#[derive(Clone)]
pub struct NodeResolver {
    provider: RootProvider<PubSubFrontend>,
}

impl NodeResolver {
    pub fn new(provider: RootProvider<PubSubFrontend>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl TransactionResolver for NodeResolver {
    async fn resolve(&self, hash: TxHash) -> Result<ResolvedTransaction, ResolveError> {
        let found = self
            .provider
            .raw_request::<_, Option<ResolvedTransaction>>("eth_getTransactionByHash".into(), (hash,))
            .await
            .map_err(|e| ResolveError::Transport(e.to_string()))?;

        found.ok_or(ResolveError::NotFound(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Pump tests ====================

    #[tokio::test]
    async fn test_forward_queues_hash() {
        let (ids, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let hash = TxHash::repeat_byte(0x01);

        assert!(forward(hash, &ids, &cancel).await);
        assert_eq!(rx.recv().await, Some(hash));
    }

    #[tokio::test]
    async fn test_forward_stops_when_queue_closed() {
        let (ids, mut rx) = mpsc::channel(1);
        rx.close();
        let cancel = CancellationToken::new();

        assert!(!forward(TxHash::repeat_byte(0x02), &ids, &cancel).await);
    }

    #[tokio::test]
    async fn test_forward_stops_on_cancel_with_full_queue() {
        let (ids, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let first = TxHash::repeat_byte(0x03);
        assert!(forward(first, &ids, &cancel).await);

        cancel.cancel();
        assert!(!forward(TxHash::repeat_byte(0x04), &ids, &cancel).await);

        drop(ids);
        assert_eq!(rx.recv().await, Some(first));
        assert_eq!(rx.recv().await, None);
    }

    // ==================== Endpoint tests ====================

    #[test]
    fn test_endpoint_ws() {
        assert_eq!(
            Endpoint::parse("ws://127.0.0.1:8546").unwrap(),
            Endpoint::Ws("ws://127.0.0.1:8546".to_string())
        );
        assert_eq!(
            Endpoint::parse("wss://node.example.org/ws").unwrap(),
            Endpoint::Ws("wss://node.example.org/ws".to_string())
        );
    }

    #[test]
    fn test_endpoint_ipc_path() {
        assert_eq!(
            Endpoint::parse("/tmp/anvil.ipc").unwrap(),
            Endpoint::Ipc(PathBuf::from("/tmp/anvil.ipc"))
        );
    }

    #[test]
    fn test_endpoint_ipc_path_with_tilde() {
        match Endpoint::parse("~/.foundry/anvil.ipc").unwrap() {
            Endpoint::Ipc(path) => {
                assert!(!path.starts_with("~"));
                assert!(path.ends_with(".foundry/anvil.ipc"));
            }
            other => panic!("expected IPC endpoint, got {:?}", other),
        }
    }

    #[test]
    fn test_endpoint_empty() {
        assert!(matches!(Endpoint::parse("  "), Err(NodeError::InvalidEndpoint(_))));
    }

    #[test]
    fn test_endpoint_http_rejected() {
        assert!(matches!(
            Endpoint::parse("http://127.0.0.1:8545"),
            Err(NodeError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::parse("/tmp/geth.ipc").unwrap().to_string(), "/tmp/geth.ipc");
        assert_eq!(Endpoint::parse(DEFAULT_ENDPOINT).unwrap().to_string(), DEFAULT_ENDPOINT);
    }

    // ==================== expand_path tests ====================

    #[test]
    fn test_expand_path_without_tilde() {
        assert_eq!(expand_path("/tmp/test.ipc"), PathBuf::from("/tmp/test.ipc"));
    }

    #[test]
    fn test_expand_path_tilde_in_middle() {
        // Only leading ~ should be expanded
        let path = "/some/~path/test.ipc";
        assert_eq!(expand_path(path), PathBuf::from(path));
    }

    // ==================== NodeConfig tests ====================

    #[test]
    fn test_node_config_default() {
        let config = NodeConfig::default();
        assert_eq!(config.endpoint, Endpoint::Ws(DEFAULT_ENDPOINT.to_string()));
        assert_eq!(config.connect_timeout_ms, CONNECTION_TIMEOUT_MS);
    }

    #[test]
    fn test_node_config_with_endpoint() {
        let config = NodeConfig::with_endpoint("/custom/path.ipc").unwrap();
        assert_eq!(config.endpoint, Endpoint::Ipc(PathBuf::from("/custom/path.ipc")));
    }

    // ==================== NodeError tests ====================

    #[test]
    fn test_node_error_display() {
        let err = NodeError::SocketNotFound("/tmp/test.ipc".to_string());
        assert!(err.to_string().contains("/tmp/test.ipc"));

        let err = NodeError::Timeout(5000);
        assert!(err.to_string().contains("5000"));
    }

    // ==================== connect tests ====================

    #[tokio::test]
    async fn test_connect_to_missing_socket_returns_error() {
        let config = NodeConfig::with_endpoint("/nonexistent/path.ipc").unwrap();
        let result = connect(&config).await;
        assert!(matches!(result, Err(NodeError::SocketNotFound(_))));
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let config = NodeConfig {
            endpoint: Endpoint::Ws("ws://127.0.0.1:1".to_string()),
            connect_timeout_ms: 500,
        };
        let result = connect(&config).await;
        assert!(matches!(
            result,
            Err(NodeError::ConnectionFailed(_)) | Err(NodeError::Timeout(500))
        ));
    }
}
