//! TxnScope Watcher Library
//!
//! This crate provides components for watching pending transactions sent to a
//! DEX router, decoding their call data against JSON ABI descriptions, and
//! unwinding batched `multicall` payloads into their inner calls.

pub mod abi;
pub mod config;
pub mod decoder;
pub mod driver;
pub mod feed;
pub mod filter;
pub mod multicall;
pub mod node;
pub mod observer;
pub mod signatures;

// Re-export commonly used types
pub use abi::{AbiType, AbiValue, DecodeError};
pub use config::{DrainPolicy, RejectionLog, WatcherConfig};
pub use decoder::{decode_call, DecodedCall};
pub use driver::{Driver, DriverError, DriverState, DriverStats, Outcome};
pub use feed::{ChannelFeed, ResolvedTransaction, TransactionFeed, TransactionResolver};
pub use filter::{match_selector, Classification, Classifier, RejectReason};
pub use multicall::{ShapeMismatch, Unwinder, UnwoundCall};
pub use observer::{EventMessage, LogObserver, Observer, PipelineEvent};
pub use signatures::{AbiSource, CallSchema, SignatureTable};
