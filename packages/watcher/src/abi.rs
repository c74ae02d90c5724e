//! ABI Type Model
//!
//! Type descriptors, decoded values and the head/tail decoding rules for
//! contract call arguments. The rules live here instead of being delegated to
//! an encoding library so the policy can be tested on its own.
//!
//! Every read goes through `word`/`slice`, which are bounds-checked against the
//! input buffer; malformed payloads surface as `DecodeError`, never as a panic.

use std::fmt;

use alloy::json_abi::Param;
use alloy::primitives::{Address, Bytes, I256, U256};
use thiserror::Error;

/// Size of one ABI word in bytes
pub const WORD: usize = 32;

/// Errors that can occur while decoding ABI-encoded arguments
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Truncated head: word at offset {offset} exceeds input of {len} bytes")]
    TruncatedHead { offset: usize, len: usize },

    #[error("Offset {offset} points outside input of {len} bytes")]
    OffsetOutOfBounds { offset: usize, len: usize },

    #[error("Length {length} declared at offset {offset} reads past end of input ({len} bytes)")]
    LengthOutOfBounds {
        offset: usize,
        length: usize,
        len: usize,
    },

    #[error("Unsupported type descriptor: {0}")]
    UnsupportedType(String),

    #[error("Non-canonical padding for {ty} at offset {offset}")]
    InvalidPadding { ty: String, offset: usize },

    #[error("Invalid boolean word at offset {0}")]
    InvalidBool(usize),

    #[error("Invalid UTF-8 string at offset {0}")]
    InvalidUtf8(usize),

    #[error("Decoded values exceed input of {len} bytes (overlapping tail regions)")]
    ExpansionLimit { len: usize },
}

/// ABI type descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbiType {
    /// `uintN`, N in 8..=256, multiple of 8
    Uint(usize),
    /// `intN`, N in 8..=256, multiple of 8
    Int(usize),
    Bool,
    Address,
    /// `bytesN`, N in 1..=32
    FixedBytes(usize),
    Bytes,
    String,
    /// `T[]`
    Array(Box<AbiType>),
    /// `T[N]`
    FixedArray(Box<AbiType>, usize),
    /// `(T1,T2,...)`
    Tuple(Vec<AbiType>),
    /// Anything the decoder does not understand (`function`, `fixed128x18`, `uint7`...)
    Unsupported(String),
}

impl AbiType {
    /// Parse a textual type descriptor such as `uint256`, `bytes[]` or `(address,uint24)[2]`
    pub fn parse(descriptor: &str) -> Self {
        Self::parse_with_components(descriptor, &[])
    }

    /// Build the type of a JSON ABI parameter, resolving `tuple` components
    pub fn from_param(param: &Param) -> Self {
        Self::parse_with_components(&param.ty, &param.components)
    }

    fn parse_with_components(descriptor: &str, components: &[Param]) -> Self {
        let descriptor = descriptor.trim();

        if let Some(stripped) = descriptor.strip_suffix(']') {
            let Some(open) = stripped.rfind('[') else {
                return AbiType::Unsupported(descriptor.to_string());
            };
            let inner = Self::parse_with_components(&stripped[..open], components);
            let size = &stripped[open + 1..];
            if size.is_empty() {
                return AbiType::Array(Box::new(inner));
            }
            return match size.parse::<usize>() {
                Ok(n) if n > 0 => AbiType::FixedArray(Box::new(inner), n),
                _ => AbiType::Unsupported(descriptor.to_string()),
            };
        }

        if let Some(body) = descriptor
            .strip_prefix('(')
            .and_then(|d| d.strip_suffix(')'))
        {
            return match split_tuple(body) {
                Some(parts) => AbiType::Tuple(parts.into_iter().map(AbiType::parse).collect()),
                None => AbiType::Unsupported(descriptor.to_string()),
            };
        }

        match descriptor {
            "bool" => AbiType::Bool,
            "address" => AbiType::Address,
            "bytes" => AbiType::Bytes,
            "string" => AbiType::String,
            "uint" => AbiType::Uint(256),
            "int" => AbiType::Int(256),
            "tuple" => AbiType::Tuple(components.iter().map(AbiType::from_param).collect()),
            _ => parse_sized(descriptor).unwrap_or_else(|| AbiType::Unsupported(descriptor.to_string())),
        }
    }

    /// Whether values of this type live in the tail region behind an offset
    pub fn is_dynamic(&self) -> bool {
        match self {
            AbiType::Bytes | AbiType::String | AbiType::Array(_) => true,
            AbiType::FixedArray(inner, _) => inner.is_dynamic(),
            AbiType::Tuple(types) => types.iter().any(AbiType::is_dynamic),
            _ => false,
        }
    }

    /// Number of bytes this type occupies in the head region
    pub fn head_size(&self) -> usize {
        if self.is_dynamic() {
            return WORD;
        }
        match self {
            AbiType::FixedArray(inner, n) => inner.head_size().saturating_mul(*n),
            AbiType::Tuple(types) => types
                .iter()
                .fold(0usize, |acc, ty| acc.saturating_add(ty.head_size())),
            _ => WORD,
        }
    }

    /// First unsupported descriptor nested anywhere in this type
    pub fn find_unsupported(&self) -> Option<&str> {
        match self {
            AbiType::Unsupported(descriptor) => Some(descriptor),
            AbiType::Array(inner) | AbiType::FixedArray(inner, _) => inner.find_unsupported(),
            AbiType::Tuple(types) => types.iter().find_map(AbiType::find_unsupported),
            _ => None,
        }
    }
}

impl fmt::Display for AbiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbiType::Uint(bits) => write!(f, "uint{bits}"),
            AbiType::Int(bits) => write!(f, "int{bits}"),
            AbiType::Bool => f.write_str("bool"),
            AbiType::Address => f.write_str("address"),
            AbiType::FixedBytes(n) => write!(f, "bytes{n}"),
            AbiType::Bytes => f.write_str("bytes"),
            AbiType::String => f.write_str("string"),
            AbiType::Array(inner) => write!(f, "{inner}[]"),
            AbiType::FixedArray(inner, n) => write!(f, "{inner}[{n}]"),
            AbiType::Tuple(types) => {
                f.write_str("(")?;
                for (i, ty) in types.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{ty}")?;
                }
                f.write_str(")")
            }
            AbiType::Unsupported(descriptor) => f.write_str(descriptor),
        }
    }
}

fn parse_sized(descriptor: &str) -> Option<AbiType> {
    let valid_bits = |bits: usize| (8..=256).contains(&bits) && bits % 8 == 0;

    if let Some(bits) = descriptor.strip_prefix("uint") {
        let bits = bits.parse().ok()?;
        return valid_bits(bits).then_some(AbiType::Uint(bits));
    }
    if let Some(bits) = descriptor.strip_prefix("int") {
        let bits = bits.parse().ok()?;
        return valid_bits(bits).then_some(AbiType::Int(bits));
    }
    if let Some(size) = descriptor.strip_prefix("bytes") {
        let size = size.parse().ok()?;
        return (1..=32).contains(&size).then_some(AbiType::FixedBytes(size));
    }
    None
}

/// Split a tuple body on top-level commas
fn split_tuple(body: &str) -> Option<Vec<&str>> {
    if body.trim().is_empty() {
        return Some(Vec::new());
    }
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in body.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        if depth < 0 {
            return None;
        }
    }
    if depth != 0 {
        return None;
    }
    parts.push(&body[start..]);
    Some(parts)
}

/// A decoded ABI value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbiValue {
    Uint(U256, usize),
    Int(I256, usize),
    Bool(bool),
    Address(Address),
    FixedBytes(Vec<u8>),
    Bytes(Bytes),
    String(String),
    Array(Vec<AbiValue>),
    Tuple(Vec<AbiValue>),
}

impl AbiValue {
    /// Integer value as unsigned, when non-negative
    pub fn as_uint(&self) -> Option<U256> {
        match self {
            AbiValue::Uint(value, _) => Some(*value),
            AbiValue::Int(value, _) if !value.is_negative() => Some(value.into_raw()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            AbiValue::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[AbiValue]> {
        match self {
            AbiValue::Array(values) => Some(values),
            _ => None,
        }
    }

    /// JSON rendering used by published event messages.
    ///
    /// Integers are decimal strings so 256-bit values survive JSON consumers.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            AbiValue::Uint(value, _) => Value::String(value.to_string()),
            AbiValue::Int(value, _) => Value::String(value.to_string()),
            AbiValue::Bool(value) => Value::Bool(*value),
            AbiValue::Address(address) => Value::String(format!("{:#x}", address)),
            AbiValue::FixedBytes(bytes) => Value::String(format!("0x{}", hex::encode(bytes))),
            AbiValue::Bytes(bytes) => Value::String(format!("0x{}", hex::encode(bytes))),
            AbiValue::String(value) => Value::String(value.clone()),
            AbiValue::Array(values) | AbiValue::Tuple(values) => {
                Value::Array(values.iter().map(AbiValue::to_json).collect())
            }
        }
    }
}

impl fmt::Display for AbiValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbiValue::Uint(value, _) => write!(f, "{value}"),
            AbiValue::Int(value, _) => write!(f, "{value}"),
            AbiValue::Bool(value) => write!(f, "{value}"),
            AbiValue::Address(address) => write!(f, "{:#x}", address),
            AbiValue::FixedBytes(bytes) => write!(f, "0x{}", hex::encode(bytes)),
            AbiValue::Bytes(bytes) => write!(f, "0x{}", hex::encode(bytes)),
            AbiValue::String(value) => write!(f, "{value:?}"),
            AbiValue::Array(values) => write_list(f, values, "[", "]"),
            AbiValue::Tuple(values) => write_list(f, values, "(", ")"),
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, values: &[AbiValue], open: &str, close: &str) -> fmt::Result {
    f.write_str(open)?;
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{value}")?;
    }
    f.write_str(close)
}

/// Decode a parameter list laid out as a top-level tuple.
///
/// Offsets are relative to the start of `data`. Unsupported descriptors are
/// reported before any byte is read.
///
/// The decoded output may not be larger than `data` itself: every value word,
/// length word and body byte is charged against a budget of `data.len()`, so
/// head offsets aliasing one tail region fail with `ExpansionLimit`.
pub fn decode_params(types: &[AbiType], data: &[u8]) -> Result<Vec<AbiValue>, DecodeError> {
    if let Some(descriptor) = types.iter().find_map(AbiType::find_unsupported) {
        return Err(DecodeError::UnsupportedType(descriptor.to_string()));
    }
    let mut budget = Budget::new(data.len());
    decode_sequence(types.iter(), data, 0, &mut budget)
}

/// Remaining decode allowance, in bytes of input
struct Budget {
    remaining: usize,
    len: usize,
}

impl Budget {
    fn new(len: usize) -> Self {
        Self { remaining: len, len }
    }

    fn charge(&mut self, amount: usize) -> Result<(), DecodeError> {
        self.remaining = self
            .remaining
            .checked_sub(amount)
            .ok_or(DecodeError::ExpansionLimit { len: self.len })?;
        Ok(())
    }

    /// Read a value word at `at` and charge it
    fn take_word<'d>(&mut self, data: &'d [u8], at: usize) -> Result<&'d [u8; WORD], DecodeError> {
        let word = word(data, at)?;
        self.charge(WORD)?;
        Ok(word)
    }
}

/// Decode consecutive head entries starting at `base`; offsets are relative to `base`
fn decode_sequence<'t>(
    types: impl IntoIterator<Item = &'t AbiType>,
    data: &[u8],
    base: usize,
    budget: &mut Budget,
) -> Result<Vec<AbiValue>, DecodeError> {
    let mut values = Vec::new();
    let mut cursor = base;

    for ty in types {
        let value = if ty.is_dynamic() {
            let offset = read_usize(data, cursor)?;
            let target = base
                .checked_add(offset)
                .filter(|t| t.checked_add(WORD).is_some_and(|end| end <= data.len()))
                .ok_or(DecodeError::OffsetOutOfBounds {
                    offset: base.saturating_add(offset),
                    len: data.len(),
                })?;
            decode_tail(ty, data, target, budget)?
        } else {
            decode_inline(ty, data, cursor, budget)?
        };
        values.push(value);
        cursor = cursor.saturating_add(ty.head_size());
    }

    Ok(values)
}

/// Decode a static value stored directly in the head region
fn decode_inline(
    ty: &AbiType,
    data: &[u8],
    at: usize,
    budget: &mut Budget,
) -> Result<AbiValue, DecodeError> {
    match ty {
        AbiType::Uint(bits) => {
            let word = budget.take_word(data, at)?;
            check_padding(ty, &word[..WORD - bits / 8], 0x00, at)?;
            Ok(AbiValue::Uint(U256::from_be_bytes(*word), *bits))
        }
        AbiType::Int(bits) => {
            let word = budget.take_word(data, at)?;
            let width = bits / 8;
            let fill = if word[WORD - width] & 0x80 != 0 { 0xff } else { 0x00 };
            check_padding(ty, &word[..WORD - width], fill, at)?;
            Ok(AbiValue::Int(I256::from_raw(U256::from_be_bytes(*word)), *bits))
        }
        AbiType::Bool => {
            let word = budget.take_word(data, at)?;
            if word[..WORD - 1].iter().any(|b| *b != 0) || word[WORD - 1] > 1 {
                return Err(DecodeError::InvalidBool(at));
            }
            Ok(AbiValue::Bool(word[WORD - 1] == 1))
        }
        AbiType::Address => {
            let word = budget.take_word(data, at)?;
            check_padding(ty, &word[..12], 0x00, at)?;
            Ok(AbiValue::Address(Address::from_slice(&word[12..])))
        }
        AbiType::FixedBytes(size) => {
            let word = budget.take_word(data, at)?;
            check_padding(ty, &word[*size..], 0x00, at)?;
            Ok(AbiValue::FixedBytes(word[..*size].to_vec()))
        }
        AbiType::FixedArray(inner, n) => Ok(AbiValue::Array(decode_sequence(
            std::iter::repeat(inner.as_ref()).take(*n),
            data,
            at,
            budget,
        )?)),
        AbiType::Tuple(types) => Ok(AbiValue::Tuple(decode_sequence(types.iter(), data, at, budget)?)),
        AbiType::Unsupported(descriptor) => Err(DecodeError::UnsupportedType(descriptor.clone())),
        AbiType::Bytes | AbiType::String | AbiType::Array(_) => decode_tail(ty, data, at, budget),
    }
}

/// Decode a dynamic value whose encoding starts at `at` in the tail region
fn decode_tail(
    ty: &AbiType,
    data: &[u8],
    at: usize,
    budget: &mut Budget,
) -> Result<AbiValue, DecodeError> {
    match ty {
        AbiType::Bytes => {
            let length = read_usize(data, at)?;
            let body = slice(data, at, length)?;
            budget.charge(WORD.saturating_add(length))?;
            Ok(AbiValue::Bytes(Bytes::copy_from_slice(body)))
        }
        AbiType::String => {
            let length = read_usize(data, at)?;
            let body = slice(data, at, length)?;
            budget.charge(WORD.saturating_add(length))?;
            let value = std::str::from_utf8(body).map_err(|_| DecodeError::InvalidUtf8(at))?;
            Ok(AbiValue::String(value.to_string()))
        }
        AbiType::Array(inner) => {
            let length = read_usize(data, at)?;
            let elements = at + WORD;
            // Every element needs at least its head; reject lengths that cannot fit.
            let remaining = data.len().saturating_sub(elements);
            let fits = length <= remaining
                && length
                    .checked_mul(inner.head_size())
                    .is_some_and(|size| size <= remaining);
            if !fits {
                return Err(DecodeError::LengthOutOfBounds {
                    offset: at,
                    length,
                    len: data.len(),
                });
            }
            // Zero-sized elements charge nothing while decoding, so count them here.
            let element_charge = if inner.head_size() == 0 { length } else { 0 };
            budget.charge(WORD.saturating_add(element_charge))?;
            Ok(AbiValue::Array(decode_sequence(
                std::iter::repeat(inner.as_ref()).take(length),
                data,
                elements,
                budget,
            )?))
        }
        AbiType::FixedArray(inner, n) => Ok(AbiValue::Array(decode_sequence(
            std::iter::repeat(inner.as_ref()).take(*n),
            data,
            at,
            budget,
        )?)),
        AbiType::Tuple(types) => Ok(AbiValue::Tuple(decode_sequence(types.iter(), data, at, budget)?)),
        _ => decode_inline(ty, data, at, budget),
    }
}

fn word(data: &[u8], at: usize) -> Result<&[u8; WORD], DecodeError> {
    at.checked_add(WORD)
        .and_then(|end| data.get(at..end))
        .and_then(|w| w.try_into().ok())
        .ok_or(DecodeError::TruncatedHead {
            offset: at,
            len: data.len(),
        })
}

/// Read a word as an offset or length; values that cannot index memory saturate
fn read_usize(data: &[u8], at: usize) -> Result<usize, DecodeError> {
    let word = word(data, at)?;
    if word[..WORD - 8].iter().any(|b| *b != 0) {
        return Ok(usize::MAX);
    }
    let mut low = [0u8; 8];
    low.copy_from_slice(&word[WORD - 8..]);
    Ok(usize::try_from(u64::from_be_bytes(low)).unwrap_or(usize::MAX))
}

/// Body of a length-prefixed value whose length word sits at `at`
fn slice(data: &[u8], at: usize, length: usize) -> Result<&[u8], DecodeError> {
    let start = at + WORD;
    start
        .checked_add(length)
        .and_then(|end| data.get(start..end))
        .ok_or(DecodeError::LengthOutOfBounds {
            offset: at,
            length,
            len: data.len(),
        })
}

fn check_padding(ty: &AbiType, padding: &[u8], fill: u8, at: usize) -> Result<(), DecodeError> {
    if padding.iter().all(|b| *b == fill) {
        Ok(())
    } else {
        Err(DecodeError::InvalidPadding {
            ty: ty.to_string(),
            offset: at,
        })
    }
}
