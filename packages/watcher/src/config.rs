//! Watcher Configuration
//!
//! Runtime settings for the pipeline, their defaults, and the checks that turn
//! a bad setting into a startup error instead of a silent no-op at runtime.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::{address, Address};
use thiserror::Error;

use crate::feed::DEFAULT_QUEUE_CAPACITY;
use crate::filter::Classifier;
use crate::multicall::Unwinder;
use crate::signatures::{
    format_selector, AbiSource, SignatureError, SignatureTable, MULTICALL_DEADLINE_SELECTOR,
};

/// Uniswap SwapRouter02 on Ethereum mainnet
pub const DEFAULT_TARGET: Address = address!("68b3465833fb72A70ecDF485E0e4C7bD8665Fc45");

/// Default per-transaction resolution timeout in milliseconds
pub const DEFAULT_RESOLVE_TIMEOUT_MS: u64 = 5000;

/// Errors that can occur while validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid address {input}: {reason}")]
    InvalidAddress { input: String, reason: String },

    #[error("Invalid selector {0}: expected 4 bytes of hex")]
    InvalidSelector(String),

    #[error("{role} selector {selector} is not in the signature table")]
    UnknownSelector { selector: String, role: &'static str },

    #[error("Queue capacity must be at least 1")]
    InvalidQueueCapacity,

    #[error("Invalid value {value} for {setting}, expected one of: {expected}")]
    InvalidChoice {
        setting: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error(transparent)]
    Signatures(#[from] SignatureError),
}

/// What happens to queued identifiers once shutdown starts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DrainPolicy {
    /// Drop them, tracing each hash at debug level
    #[default]
    Discard,
    /// Process them before stopping
    Drain,
}

impl FromStr for DrainPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "discard" => Ok(DrainPolicy::Discard),
            "drain" => Ok(DrainPolicy::Drain),
            _ => Err(ConfigError::InvalidChoice {
                setting: "drain policy",
                value: s.to_string(),
                expected: "discard, drain",
            }),
        }
    }
}

impl fmt::Display for DrainPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrainPolicy::Discard => f.write_str("discard"),
            DrainPolicy::Drain => f.write_str("drain"),
        }
    }
}

/// Log level for rejected transactions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RejectionLog {
    Silent,
    Trace,
    #[default]
    Debug,
}

impl FromStr for RejectionLog {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "silent" | "off" => Ok(RejectionLog::Silent),
            "trace" => Ok(RejectionLog::Trace),
            "debug" => Ok(RejectionLog::Debug),
            _ => Err(ConfigError::InvalidChoice {
                setting: "rejection logging",
                value: s.to_string(),
                expected: "silent, trace, debug",
            }),
        }
    }
}

/// Pipeline settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherConfig {
    /// Only transactions sent to this address are considered
    pub target: Address,
    /// Interface descriptions, registered in order (first selector wins)
    pub abi_sources: Vec<AbiSource>,
    /// Accepted selectors; empty accepts anything in the table
    pub expected_selectors: Vec<[u8; 4]>,
    /// Selectors treated as `(deadline, bytes[])` batches
    pub unwind_selectors: Vec<[u8; 4]>,
    /// Levels of inner calls to decode; 0 leaves inner calls undecoded
    pub nested_depth: usize,
    pub queue_capacity: usize,
    pub drain_policy: DrainPolicy,
    pub rejection_log: RejectionLog,
    pub resolve_timeout_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            target: DEFAULT_TARGET,
            abi_sources: vec![AbiSource::Builtin],
            expected_selectors: vec![MULTICALL_DEADLINE_SELECTOR],
            unwind_selectors: vec![MULTICALL_DEADLINE_SELECTOR],
            nested_depth: 0,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            drain_policy: DrainPolicy::default(),
            rejection_log: RejectionLog::default(),
            resolve_timeout_ms: DEFAULT_RESOLVE_TIMEOUT_MS,
        }
    }
}

impl WatcherConfig {
    /// Load the signature table and check every configured selector against it
    ///
    /// # Returns
    /// The shared table, or the first configuration problem found
    pub fn build_table(&self) -> Result<Arc<SignatureTable>, ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity);
        }

        let table = SignatureTable::load(&self.abi_sources)?;

        let configured = self
            .expected_selectors
            .iter()
            .map(|s| (s, "expected"))
            .chain(self.unwind_selectors.iter().map(|s| (s, "unwind")));
        for (selector, role) in configured {
            if !table.contains(selector) {
                return Err(ConfigError::UnknownSelector {
                    selector: format_selector(selector),
                    role,
                });
            }
        }

        Ok(Arc::new(table))
    }

    pub fn classifier(&self, table: Arc<SignatureTable>) -> Classifier {
        Classifier::new(self.target, table)
            .with_expected_selectors(self.expected_selectors.iter().copied())
    }

    pub fn unwinder(&self, table: Arc<SignatureTable>) -> Unwinder {
        Unwinder::new(self.unwind_selectors.iter().copied(), table)
            .with_nested_depth(self.nested_depth)
    }
}

/// Parse a 0x-prefixed hex address
pub fn parse_address(input: &str) -> Result<Address, ConfigError> {
    Address::from_str(input.trim()).map_err(|e| ConfigError::InvalidAddress {
        input: input.to_string(),
        reason: e.to_string(),
    })
}

/// Parse a 4-byte selector, with or without 0x prefix
pub fn parse_selector(input: &str) -> Result<[u8; 4], ConfigError> {
    let trimmed = input.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    hex::decode(digits)
        .ok()
        .and_then(|bytes| <[u8; 4]>::try_from(bytes.as_slice()).ok())
        .ok_or_else(|| ConfigError::InvalidSelector(input.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // ==================== Default tests ====================

    #[test]
    fn test_default_config() {
        let config = WatcherConfig::default();
        assert_eq!(config.target, DEFAULT_TARGET);
        assert_eq!(config.abi_sources, vec![AbiSource::Builtin]);
        assert_eq!(config.expected_selectors, vec![MULTICALL_DEADLINE_SELECTOR]);
        assert_eq!(config.unwind_selectors, vec![MULTICALL_DEADLINE_SELECTOR]);
        assert_eq!(config.nested_depth, 0);
        assert_eq!(config.queue_capacity, 10);
        assert_eq!(config.drain_policy, DrainPolicy::Discard);
        assert_eq!(config.rejection_log, RejectionLog::Debug);
        assert_eq!(config.resolve_timeout_ms, 5000);
    }

    #[test]
    fn test_default_target_is_router() {
        assert_eq!(
            format!("{:#x}", DEFAULT_TARGET),
            "0x68b3465833fb72a70ecdf485e0e4c7bd8665fc45"
        );
    }

    // ==================== build_table tests ====================

    #[test]
    fn test_build_table_with_defaults() {
        let table = WatcherConfig::default().build_table().unwrap();
        assert!(table.contains(&MULTICALL_DEADLINE_SELECTOR));
    }

    #[test]
    fn test_build_table_rejects_unknown_expected_selector() {
        let config = WatcherConfig {
            expected_selectors: vec![[0xde, 0xad, 0xbe, 0xef]],
            ..Default::default()
        };
        match config.build_table() {
            Err(ConfigError::UnknownSelector { selector, role }) => {
                assert_eq!(selector, "0xdeadbeef");
                assert_eq!(role, "expected");
            }
            other => panic!("expected UnknownSelector, got {:?}", other),
        }
    }

    #[test]
    fn test_build_table_rejects_unknown_unwind_selector() {
        let config = WatcherConfig {
            unwind_selectors: vec![[0xde, 0xad, 0xbe, 0xef]],
            ..Default::default()
        };
        assert!(matches!(
            config.build_table(),
            Err(ConfigError::UnknownSelector { role: "unwind", .. })
        ));
    }

    #[test]
    fn test_build_table_rejects_zero_capacity() {
        let config = WatcherConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(config.build_table(), Err(ConfigError::InvalidQueueCapacity)));
    }

    #[test]
    fn test_build_table_missing_abi_file() {
        let config = WatcherConfig {
            abi_sources: vec![AbiSource::File("/nonexistent/router.json".into())],
            expected_selectors: vec![],
            unwind_selectors: vec![],
            ..Default::default()
        };
        assert!(matches!(
            config.build_table(),
            Err(ConfigError::Signatures(SignatureError::Io { .. }))
        ));
    }

    #[test]
    fn test_build_table_from_extra_abi_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"type":"function","name":"transfer","inputs":[{{"name":"to","type":"address"}},{{"name":"amount","type":"uint256"}}],"outputs":[],"stateMutability":"nonpayable"}}]"#
        )
        .unwrap();

        let config = WatcherConfig {
            abi_sources: vec![AbiSource::Builtin, AbiSource::File(file.path().to_path_buf())],
            expected_selectors: vec![parse_selector("0xa9059cbb").unwrap()],
            ..Default::default()
        };
        let table = config.build_table().unwrap();
        assert!(table.contains(&[0xa9, 0x05, 0x9c, 0xbb]));
    }

    #[test]
    fn test_classifier_and_unwinder_follow_config() {
        let config = WatcherConfig::default();
        let table = config.build_table().unwrap();

        assert_eq!(config.classifier(Arc::clone(&table)).target(), DEFAULT_TARGET);
        let unwinder = config.unwinder(table);
        assert!(unwinder.handles(&MULTICALL_DEADLINE_SELECTOR));
        assert!(!unwinder.handles(&[0xac, 0x96, 0x50, 0xd8]));
    }

    // ==================== parse helper tests ====================

    #[test]
    fn test_parse_address() {
        let parsed = parse_address("0x68b3465833fb72A70ecDF485E0e4C7bD8665Fc45").unwrap();
        assert_eq!(parsed, DEFAULT_TARGET);
    }

    #[test]
    fn test_parse_address_invalid() {
        assert!(matches!(
            parse_address("0x1234"),
            Err(ConfigError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_parse_selector_with_and_without_prefix() {
        assert_eq!(parse_selector("0x5ae401dc").unwrap(), MULTICALL_DEADLINE_SELECTOR);
        assert_eq!(parse_selector("5AE401DC").unwrap(), MULTICALL_DEADLINE_SELECTOR);
    }

    #[test]
    fn test_parse_selector_wrong_length() {
        assert!(matches!(parse_selector("0x5ae401"), Err(ConfigError::InvalidSelector(_))));
        assert!(matches!(parse_selector("0x5ae401dc00"), Err(ConfigError::InvalidSelector(_))));
        assert!(matches!(parse_selector("0xzzzzzzzz"), Err(ConfigError::InvalidSelector(_))));
    }

    #[test]
    fn test_drain_policy_from_str() {
        assert_eq!("drain".parse::<DrainPolicy>().unwrap(), DrainPolicy::Drain);
        assert_eq!("Discard".parse::<DrainPolicy>().unwrap(), DrainPolicy::Discard);
        assert!("flush".parse::<DrainPolicy>().is_err());
        assert_eq!(DrainPolicy::Drain.to_string(), "drain");
    }

    #[test]
    fn test_rejection_log_from_str() {
        assert_eq!("silent".parse::<RejectionLog>().unwrap(), RejectionLog::Silent);
        assert_eq!("trace".parse::<RejectionLog>().unwrap(), RejectionLog::Trace);
        assert_eq!("debug".parse::<RejectionLog>().unwrap(), RejectionLog::Debug);
        assert!("info".parse::<RejectionLog>().is_err());
    }
}
