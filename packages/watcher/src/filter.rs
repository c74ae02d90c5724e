//! Transaction Filtering
//!
//! Selector matching and recipient/selector classification of resolved
//! transactions. Checks run cheapest first so the bulk of irrelevant pending
//! traffic is dropped before any table lookup or decode.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use alloy::primitives::Address;

use crate::feed::ResolvedTransaction;
use crate::signatures::{format_selector, CallSchema, SignatureTable};

/// Split input data into its 4-byte selector and the encoded arguments
///
/// # Returns
/// `None` if the input is shorter than 4 bytes
pub fn match_selector(input: &[u8]) -> Option<([u8; 4], &[u8])> {
    if input.len() < 4 {
        return None;
    }
    let mut selector = [0u8; 4];
    selector.copy_from_slice(&input[..4]);
    Some((selector, &input[4..]))
}

/// Why a transaction was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// No recipient: contract creation
    ContractCreation,
    /// Sent to some other contract
    RecipientMismatch(Address),
    /// Fewer than 4 bytes of input
    InputTooShort(usize),
    /// Selector outside the configured filter
    SelectorNotExpected([u8; 4]),
    /// Selector absent from the signature table
    UnknownSelector([u8; 4]),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::ContractCreation => f.write_str("contract creation"),
            RejectReason::RecipientMismatch(to) => write!(f, "recipient {:#x} is not the target", to),
            RejectReason::InputTooShort(len) => write!(f, "input of {len} bytes has no selector"),
            RejectReason::SelectorNotExpected(selector) => {
                write!(f, "selector {} not expected", format_selector(selector))
            }
            RejectReason::UnknownSelector(selector) => {
                write!(f, "selector {} not in signature table", format_selector(selector))
            }
        }
    }
}

/// Result of classifying one transaction
#[derive(Debug, Clone, PartialEq)]
pub enum Classification<'a> {
    Accepted {
        schema: Arc<CallSchema>,
        selector: [u8; 4],
        /// Input data without the selector
        remainder: &'a [u8],
    },
    Rejected(RejectReason),
}

/// Recipient and selector filter in front of the decoder
#[derive(Debug, Clone)]
pub struct Classifier {
    target: Address,
    expected: Option<HashSet<[u8; 4]>>,
    table: Arc<SignatureTable>,
}

impl Classifier {
    /// Accept any selector present in `table` for calls to `target`
    pub fn new(target: Address, table: Arc<SignatureTable>) -> Self {
        Self {
            target,
            expected: None,
            table,
        }
    }

    /// Only accept the given selectors; an empty list means no selector filter
    pub fn with_expected_selectors(mut self, selectors: impl IntoIterator<Item = [u8; 4]>) -> Self {
        let expected: HashSet<_> = selectors.into_iter().collect();
        self.expected = (!expected.is_empty()).then_some(expected);
        self
    }

    pub fn target(&self) -> Address {
        self.target
    }

    pub fn table(&self) -> &Arc<SignatureTable> {
        &self.table
    }

    /// Classify a resolved transaction.
    ///
    /// Order: recipient absent, recipient mismatch, short input,
    /// selector filter, table lookup.
    pub fn classify<'a>(&self, tx: &'a ResolvedTransaction) -> Classification<'a> {
        let Some(to) = tx.to else {
            return Classification::Rejected(RejectReason::ContractCreation);
        };
        if to != self.target {
            return Classification::Rejected(RejectReason::RecipientMismatch(to));
        }
        let Some((selector, remainder)) = match_selector(&tx.input) else {
            return Classification::Rejected(RejectReason::InputTooShort(tx.input.len()));
        };
        if let Some(expected) = &self.expected {
            if !expected.contains(&selector) {
                return Classification::Rejected(RejectReason::SelectorNotExpected(selector));
            }
        }
        match self.table.lookup(&selector) {
            Some(schema) => Classification::Accepted {
                schema,
                selector,
                remainder,
            },
            None => Classification::Rejected(RejectReason::UnknownSelector(selector)),
        }
    }
}
