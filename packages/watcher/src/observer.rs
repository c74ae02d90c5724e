//! Pipeline Observers
//!
//! Sinks for decoded results. The driver hands every qualifying call and every
//! unwound inner call to an `Observer`. Shipped observers write structured logs
//! or publish a JSON message to a Redis pub/sub channel.

use alloy::primitives::{Bytes, TxHash};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{error, info};

use crate::decoder::DecodedCall;
use crate::multicall::{multicall_shape, UnwoundCall};
use crate::signatures::format_selector;

/// Default Redis channel for decoded multicall events
pub const DEFAULT_CHANNEL: &str = "mempool_multicall";

/// Errors that can occur during publishing
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Redis connection error: {0}")]
    Connection(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Something the pipeline found
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// A transaction to the target whose call decoded successfully
    QualifyingCall {
        hash: TxHash,
        input: Bytes,
        decoded: DecodedCall,
    },
    /// One inner call of a qualifying batch
    UnwoundCall { hash: TxHash, call: UnwoundCall },
}

impl PipelineEvent {
    pub fn hash(&self) -> TxHash {
        match self {
            PipelineEvent::QualifyingCall { hash, .. } | PipelineEvent::UnwoundCall { hash, .. } => {
                *hash
            }
        }
    }
}

/// Consumer of pipeline events
///
/// `emit` has no failure path: an observer that can fail (a network sink)
/// handles and logs its own errors so one bad sink never stalls the pipeline.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Observer: Send {
    async fn emit(&mut self, event: &PipelineEvent);
}

/// Event message format for Redis publication
///
/// Optional fields are omitted from the JSON when absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    /// "qualifyingCall" or "unwoundCall"
    pub kind: String,
    /// Transaction hash with 0x prefix
    pub hash: String,
    /// Selector with 0x prefix, when the call data has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Canonical signature of the decoded function
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    /// Decoded arguments keyed by name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
    /// Batch deadline as decimal string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<String>,
    /// Raw call data with 0x prefix
    pub call_data: String,
    /// Nesting level of an unwound call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<usize>,
    /// Unix timestamp in milliseconds when the event was built
    pub timestamp: u64,
}

impl EventMessage {
    pub const QUALIFYING_CALL: &'static str = "qualifyingCall";
    pub const UNWOUND_CALL: &'static str = "unwoundCall";

    /// Build the message for a pipeline event
    pub fn from_event(event: &PipelineEvent) -> Self {
        match event {
            PipelineEvent::QualifyingCall {
                hash,
                input,
                decoded,
            } => EventMessage {
                kind: Self::QUALIFYING_CALL.to_string(),
                hash: format!("{:#x}", hash),
                selector: Some(decoded.schema.selector_hex()),
                function: Some(decoded.schema.signature.clone()),
                arguments: Some(decoded.arguments_json()),
                deadline: multicall_shape(decoded)
                    .ok()
                    .map(|(deadline, _)| deadline.to_string()),
                call_data: input.to_string(),
                depth: None,
                timestamp: current_timestamp_millis(),
            },
            PipelineEvent::UnwoundCall { hash, call } => {
                let selector = match &call.decoded {
                    Some(decoded) => Some(decoded.schema.selector_hex()),
                    None => call
                        .data
                        .get(..4)
                        .and_then(|s| <[u8; 4]>::try_from(s).ok())
                        .map(|s| format_selector(&s)),
                };
                EventMessage {
                    kind: Self::UNWOUND_CALL.to_string(),
                    hash: format!("{:#x}", hash),
                    selector,
                    function: call.decoded.as_ref().map(|d| d.schema.signature.clone()),
                    arguments: call.decoded.as_ref().map(DecodedCall::arguments_json),
                    deadline: Some(call.deadline.to_string()),
                    call_data: call.data.to_string(),
                    depth: Some(call.depth),
                    timestamp: current_timestamp_millis(),
                }
            }
        }
    }

    /// Serialize the message to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a message from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Get current timestamp in milliseconds
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// Writes every event as an `info` log line
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

#[async_trait]
impl Observer for LogObserver {
    async fn emit(&mut self, event: &PipelineEvent) {
        match event {
            PipelineEvent::QualifyingCall {
                hash,
                input,
                decoded,
            } => {
                let deadline = multicall_shape(decoded)
                    .ok()
                    .map(|(deadline, _)| deadline.to_string())
                    .unwrap_or_default();
                info!(
                    hash = %hash,
                    input_data = %input,
                    function = %decoded.schema.signature,
                    deadline = %deadline,
                    arguments = %decoded.arguments_json(),
                    "unpacked qualifying multicall"
                );
            }
            PipelineEvent::UnwoundCall { hash, call } => {
                info!(
                    hash = %hash,
                    call_data = %call.data,
                    deadline = %call.deadline,
                    depth = call.depth,
                    function = call.decoded.as_ref().map(|d| d.schema.signature.as_str()).unwrap_or("unknown"),
                    "unwound multicall call"
                );
            }
        }
    }
}

/// Redis publisher for event messages
pub struct RedisObserver {
    connection: MultiplexedConnection,
    channel: String,
}

impl RedisObserver {
    /// Create a new publisher with a Redis connection
    ///
    /// # Arguments
    /// * `connection` - An established Redis multiplexed connection
    /// * `channel` - The pub/sub channel name to publish to
    pub fn new(connection: MultiplexedConnection, channel: impl Into<String>) -> Self {
        Self {
            connection,
            channel: channel.into(),
        }
    }

    /// Open a multiplexed connection to `url` and publish on `channel`
    pub async fn connect(url: &str, channel: impl Into<String>) -> Result<Self, PublishError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self::new(connection, channel))
    }

    /// Publish a pre-formatted message to Redis
    ///
    /// # Returns
    /// The number of subscribers that received the message
    pub async fn publish_message(&mut self, message: &EventMessage) -> Result<i64, PublishError> {
        let json = message.to_json()?;
        let subscribers: i64 = self.connection.publish(&self.channel, &json).await?;
        Ok(subscribers)
    }

    /// Get the channel name
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl Observer for RedisObserver {
    async fn emit(&mut self, event: &PipelineEvent) {
        let message = EventMessage::from_event(event);
        if let Err(e) = self.publish_message(&message).await {
            error!(hash = %event.hash(), channel = %self.channel, error = %e, "failed to publish event");
        }
    }
}

/// Forwards every event to each observer in registration order
#[derive(Default)]
pub struct ObserverSet {
    observers: Vec<Box<dyn Observer>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, observer: impl Observer + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

#[async_trait]
impl Observer for ObserverSet {
    async fn emit(&mut self, event: &PipelineEvent) {
        for observer in &mut self.observers {
            observer.emit(event).await;
        }
    }
}
