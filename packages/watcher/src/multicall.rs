//! Multicall Unwinding
//!
//! Splits a decoded `multicall(uint256 deadline, bytes[] data)` into one record
//! per inner call. Inner calls are emitted undecoded unless nested unwinding is
//! enabled, in which case each inner payload goes through selector matching and
//! decoding again, down to a fixed depth.

use std::collections::HashSet;
use std::sync::Arc;

use alloy::primitives::{Bytes, U256};
use thiserror::Error;
use tracing::debug;

use crate::abi::{AbiType, AbiValue};
use crate::decoder::{decode_call, DecodedCall};
use crate::filter::match_selector;
use crate::signatures::SignatureTable;

/// The decoded call is not shaped like `(deadline: integer, data: bytes[])`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Shape mismatch for {signature}: expected (integer deadline, bytes[] data)")]
pub struct ShapeMismatch {
    pub signature: String,
}

/// One inner call of a batch
#[derive(Debug, Clone, PartialEq)]
pub struct UnwoundCall {
    /// Deadline of the batch that carried this call
    pub deadline: U256,
    /// Raw inner call data
    pub data: Bytes,
    /// 1 for calls of the top-level batch, 2 for calls of a nested batch, ...
    pub depth: usize,
    /// Inner call decoded against the signature table (nested unwinding only)
    pub decoded: Option<DecodedCall>,
}

/// Extract `(deadline, inner calls)` from a batch-shaped decoded call
pub fn multicall_shape(call: &DecodedCall) -> Result<(U256, Vec<Bytes>), ShapeMismatch> {
    let mismatch = || ShapeMismatch {
        signature: call.schema.signature.clone(),
    };

    let shape_ok = match call.schema.argument_types.as_slice() {
        [AbiType::Uint(_) | AbiType::Int(_), AbiType::Array(inner)] => **inner == AbiType::Bytes,
        _ => false,
    };
    if !shape_ok {
        return Err(mismatch());
    }

    let [(_, deadline), (_, data)] = call.arguments.as_slice() else {
        return Err(mismatch());
    };
    let deadline = deadline.as_uint().ok_or_else(mismatch)?;
    let calls = data
        .as_array()
        .ok_or_else(mismatch)?
        .iter()
        .map(|value| value.as_bytes().cloned().ok_or_else(mismatch))
        .collect::<Result<Vec<_>, _>>()?;

    Ok((deadline, calls))
}

/// Unwinding policy for batched calls
#[derive(Debug, Clone)]
pub struct Unwinder {
    selectors: HashSet<[u8; 4]>,
    nested_depth: usize,
    table: Arc<SignatureTable>,
}

impl Unwinder {
    /// Unwind calls whose selector is in `selectors`
    pub fn new(selectors: impl IntoIterator<Item = [u8; 4]>, table: Arc<SignatureTable>) -> Self {
        Self {
            selectors: selectors.into_iter().collect(),
            nested_depth: 0,
            table,
        }
    }

    /// Decode inner calls (and unwind nested batches) down to `depth` levels
    pub fn with_nested_depth(mut self, depth: usize) -> Self {
        self.nested_depth = depth;
        self
    }

    /// Whether calls with this selector are batches to unwind
    pub fn handles(&self, selector: &[u8; 4]) -> bool {
        self.selectors.contains(selector)
    }

    /// Emit one record per inner call, in order
    pub fn unwind(&self, call: &DecodedCall) -> Result<Vec<UnwoundCall>, ShapeMismatch> {
        let mut records = Vec::new();
        self.unwind_into(call, 1, &mut records)?;
        Ok(records)
    }

    fn unwind_into(
        &self,
        call: &DecodedCall,
        depth: usize,
        records: &mut Vec<UnwoundCall>,
    ) -> Result<(), ShapeMismatch> {
        let (deadline, calls) = multicall_shape(call)?;

        for data in calls {
            let decoded = if depth <= self.nested_depth {
                self.decode_inner(&data, depth)
            } else {
                None
            };
            let nested = decoded
                .as_ref()
                .filter(|inner| self.handles(&inner.schema.selector))
                .cloned();

            records.push(UnwoundCall {
                deadline,
                data,
                depth,
                decoded,
            });

            if let Some(inner) = nested {
                if let Err(e) = self.unwind_into(&inner, depth + 1, records) {
                    debug!(depth, error = %e, "nested batch not unwound");
                }
            }
        }

        Ok(())
    }

    fn decode_inner(&self, data: &[u8], depth: usize) -> Option<DecodedCall> {
        let (selector, remainder) = match_selector(data)?;
        let schema = self.table.lookup(&selector)?;
        match decode_call(&schema, remainder) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                debug!(depth, function = %schema.signature, error = %e, "could not decode inner call");
                None
            }
        }
    }
}
