//! Call Signature Table
//!
//! Maps 4-byte function selectors to argument schemas loaded from JSON ABI
//! descriptions. The table is built once at startup and shared read-only.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use alloy::json_abi::{Function, JsonAbi};
use alloy::primitives::keccak256;
use thiserror::Error;
use tracing::debug;

use crate::abi::AbiType;

/// Uniswap SwapRouter02 subset shipped with the binary
pub const BUILTIN_ROUTER_ABI: &str = include_str!("../abi/swap_router02.json");

/// `multicall(uint256 deadline, bytes[] data)` - 0x5ae401dc
pub const MULTICALL_DEADLINE_SELECTOR: [u8; 4] = [0x5a, 0xe4, 0x01, 0xdc];

/// Errors that can occur while building the signature table
#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("Duplicate selector {selector}: {existing} already registered, {rejected} ignored")]
    DuplicateSelector {
        selector: String,
        existing: String,
        rejected: String,
    },

    #[error("{signature} has {types} argument types but {names} argument names")]
    ArityMismatch {
        signature: String,
        types: usize,
        names: usize,
    },

    #[error("Failed to read ABI file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid ABI description {origin}: {reason}")]
    InvalidAbi { origin: String, reason: String },
}

/// Where an interface description comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbiSource {
    /// The embedded router ABI
    Builtin,
    /// A JSON ABI array or a compiler artifact with an `abi` key
    File(PathBuf),
}

/// Argument schema for one function selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSchema {
    pub selector: [u8; 4],
    /// Function name (e.g., "multicall")
    pub name: String,
    /// Canonical signature (e.g., "multicall(uint256,bytes[])")
    pub signature: String,
    pub argument_types: Vec<AbiType>,
    pub argument_names: Vec<String>,
}

impl CallSchema {
    /// Build a schema; the selector is derived from the canonical signature.
    pub fn new(
        name: impl Into<String>,
        argument_types: Vec<AbiType>,
        argument_names: Vec<String>,
    ) -> Result<Self, SignatureError> {
        let name = name.into();
        let signature = format!(
            "{}({})",
            name,
            argument_types
                .iter()
                .map(|ty| ty.to_string())
                .collect::<Vec<_>>()
                .join(",")
        );

        if argument_types.len() != argument_names.len() {
            return Err(SignatureError::ArityMismatch {
                signature,
                types: argument_types.len(),
                names: argument_names.len(),
            });
        }

        let mut selector = [0u8; 4];
        selector.copy_from_slice(&keccak256(signature.as_bytes())[..4]);

        Ok(Self {
            selector,
            name,
            signature,
            argument_types,
            argument_names,
        })
    }

    /// Build a schema from a JSON ABI function; unnamed inputs become `arg{i}`
    pub fn from_function(function: &Function) -> Result<Self, SignatureError> {
        let argument_types = function.inputs.iter().map(AbiType::from_param).collect();
        let argument_names = function
            .inputs
            .iter()
            .enumerate()
            .map(|(i, param)| {
                if param.name.is_empty() {
                    format!("arg{i}")
                } else {
                    param.name.clone()
                }
            })
            .collect();
        Self::new(function.name.clone(), argument_types, argument_names)
    }

    /// Selector as a hex string with 0x prefix
    pub fn selector_hex(&self) -> String {
        format_selector(&self.selector)
    }
}

/// Format a selector as a hex string with 0x prefix
pub fn format_selector(selector: &[u8; 4]) -> String {
    format!("0x{}", hex::encode(selector))
}

/// Selector → schema lookup table
#[derive(Debug, Default)]
pub struct SignatureTable {
    schemas: HashMap<[u8; 4], Arc<CallSchema>>,
}

impl SignatureTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema. The first schema registered for a selector wins.
    pub fn register(&mut self, schema: CallSchema) -> Result<(), SignatureError> {
        if let Some(existing) = self.schemas.get(&schema.selector) {
            return Err(SignatureError::DuplicateSelector {
                selector: schema.selector_hex(),
                existing: existing.signature.clone(),
                rejected: schema.signature,
            });
        }
        self.schemas.insert(schema.selector, Arc::new(schema));
        Ok(())
    }

    /// Look up the schema for a selector
    pub fn lookup(&self, selector: &[u8; 4]) -> Option<Arc<CallSchema>> {
        self.schemas.get(selector).cloned()
    }

    pub fn contains(&self, selector: &[u8; 4]) -> bool {
        self.schemas.contains_key(selector)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Register every function of an ABI; returns how many were added.
    ///
    /// Selector collisions are not fatal: the earlier registration is kept.
    pub fn register_abi(&mut self, abi: &JsonAbi) -> Result<usize, SignatureError> {
        let mut added = 0;
        for function in abi.functions() {
            match self.register(CallSchema::from_function(function)?) {
                Ok(()) => added += 1,
                Err(SignatureError::DuplicateSelector {
                    selector,
                    existing,
                    rejected,
                }) => {
                    debug!(%selector, %existing, %rejected, "selector already registered, keeping first");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(added)
    }

    /// Build a table from a single JSON ABI description
    pub fn from_json_abi(json: &str) -> Result<Self, SignatureError> {
        let mut table = Self::new();
        table.register_abi(&parse_abi_json(json, "<inline>")?)?;
        Ok(table)
    }

    /// Build a table from the embedded router ABI
    pub fn builtin() -> Result<Self, SignatureError> {
        let mut table = Self::new();
        table.register_abi(&parse_abi_json(BUILTIN_ROUTER_ABI, "<builtin>")?)?;
        Ok(table)
    }

    /// Build a table from several sources, registered in order
    pub fn load(sources: &[AbiSource]) -> Result<Self, SignatureError> {
        let mut table = Self::new();
        for source in sources {
            let added = match source {
                AbiSource::Builtin => {
                    table.register_abi(&parse_abi_json(BUILTIN_ROUTER_ABI, "<builtin>")?)?
                }
                AbiSource::File(path) => table.register_abi(&read_abi_file(path)?)?,
            };
            debug!(?source, added, "loaded interface description");
        }
        Ok(table)
    }
}

/// Read and parse a JSON ABI file
pub fn read_abi_file(path: &Path) -> Result<JsonAbi, SignatureError> {
    let json = std::fs::read_to_string(path).map_err(|source| SignatureError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_abi_json(&json, &path.display().to_string())
}

/// Parse a JSON ABI array, or a compiler artifact object carrying one under `abi`
pub fn parse_abi_json(json: &str, origin: &str) -> Result<JsonAbi, SignatureError> {
    let invalid = |reason: String| SignatureError::InvalidAbi {
        origin: origin.to_string(),
        reason,
    };

    let value: serde_json::Value = serde_json::from_str(json).map_err(|e| invalid(e.to_string()))?;
    let abi = match value {
        serde_json::Value::Object(mut artifact) => artifact
            .remove("abi")
            .ok_or_else(|| invalid("object has no \"abi\" key".to_string()))?,
        other => other,
    };
    serde_json::from_value(abi).map_err(|e| invalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MULTICALL_BYTES_SELECTOR: [u8; 4] = [0xac, 0x96, 0x50, 0xd8];

    // ==================== CallSchema tests ====================

    #[test]
    fn test_schema_selector_from_signature() {
        let schema = CallSchema::new(
            "multicall",
            vec![AbiType::Uint(256), AbiType::parse("bytes[]")],
            vec!["deadline".into(), "data".into()],
        )
        .unwrap();
        assert_eq!(schema.signature, "multicall(uint256,bytes[])");
        assert_eq!(schema.selector, MULTICALL_DEADLINE_SELECTOR);
        assert_eq!(schema.selector_hex(), "0x5ae401dc");
    }

    #[test]
    fn test_schema_rejects_arity_mismatch() {
        let result = CallSchema::new("f", vec![AbiType::Bool], vec![]);
        assert!(matches!(
            result,
            Err(SignatureError::ArityMismatch { types: 1, names: 0, .. })
        ));
    }

    #[test]
    fn test_schema_from_function_names_unnamed_inputs() {
        let function = Function::parse("function transfer(address, uint256)").unwrap();
        let schema = CallSchema::from_function(&function).unwrap();
        assert_eq!(schema.argument_names, vec!["arg0", "arg1"]);
        assert_eq!(schema.selector, [0xa9, 0x05, 0x9c, 0xbb]);
    }

    #[test]
    fn test_schema_selector_matches_alloy_for_tuple_inputs() {
        let abi = parse_abi_json(BUILTIN_ROUTER_ABI, "test").unwrap();
        for function in abi.functions() {
            let schema = CallSchema::from_function(function).unwrap();
            assert_eq!(schema.selector, function.selector().0, "{}", schema.signature);
        }
    }

    // ==================== SignatureTable tests ====================

    #[test]
    fn test_builtin_table_contains_multicall_overloads() {
        let table = SignatureTable::builtin().unwrap();
        assert_eq!(table.len(), 9);

        let deadline = table.lookup(&MULTICALL_DEADLINE_SELECTOR).unwrap();
        assert_eq!(deadline.signature, "multicall(uint256,bytes[])");
        assert_eq!(deadline.argument_names, vec!["deadline", "data"]);

        let plain = table.lookup(&MULTICALL_BYTES_SELECTOR).unwrap();
        assert_eq!(plain.signature, "multicall(bytes[])");
    }

    #[test]
    fn test_builtin_tuple_parameter_is_resolved() {
        let table = SignatureTable::builtin().unwrap();
        let function = Function::parse(
            "function exactInput((bytes path, address recipient, uint256 amountIn, uint256 amountOutMinimum) params)",
        )
        .unwrap();
        let schema = table.lookup(&function.selector().0).unwrap();
        assert_eq!(
            schema.argument_types,
            vec![AbiType::Tuple(vec![
                AbiType::Bytes,
                AbiType::Address,
                AbiType::Uint(256),
                AbiType::Uint(256),
            ])]
        );
    }

    #[test]
    fn test_lookup_unknown_selector() {
        let table = SignatureTable::builtin().unwrap();
        assert!(table.lookup(&[0xde, 0xad, 0xbe, 0xef]).is_none());
        assert!(!table.contains(&[0xde, 0xad, 0xbe, 0xef]));
    }

    #[test]
    fn test_register_first_wins() {
        let mut table = SignatureTable::new();
        let first = CallSchema::new("f", vec![AbiType::Bool], vec!["a".into()]).unwrap();
        let mut second = CallSchema::new("g", vec![AbiType::Address], vec!["b".into()]).unwrap();
        second.selector = first.selector;

        table.register(first.clone()).unwrap();
        let err = table.register(second).unwrap_err();

        assert!(matches!(err, SignatureError::DuplicateSelector { .. }));
        assert_eq!(table.lookup(&first.selector).unwrap().name, "f");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_register_abi_collision_is_not_fatal() {
        let mut table = SignatureTable::builtin().unwrap();
        let abi = parse_abi_json(BUILTIN_ROUTER_ABI, "again").unwrap();
        assert_eq!(table.register_abi(&abi).unwrap(), 0);
        assert_eq!(table.len(), 9);
    }

    #[test]
    fn test_from_json_abi_accepts_artifact() {
        let artifact = r#"{
            "contractName": "Token",
            "abi": [
                {"type": "function", "name": "approve", "stateMutability": "nonpayable",
                 "inputs": [{"name": "spender", "type": "address"}, {"name": "amount", "type": "uint256"}],
                 "outputs": [{"name": "", "type": "bool"}]}
            ]
        }"#;
        let table = SignatureTable::from_json_abi(artifact).unwrap();
        assert!(table.contains(&[0x09, 0x5e, 0xa7, 0xb3]));
    }

    #[test]
    fn test_from_json_abi_rejects_garbage() {
        assert!(matches!(
            SignatureTable::from_json_abi("not json"),
            Err(SignatureError::InvalidAbi { .. })
        ));
        assert!(matches!(
            SignatureTable::from_json_abi(r#"{"bytecode": "0x00"}"#),
            Err(SignatureError::InvalidAbi { .. })
        ));
    }

    #[test]
    fn test_load_sources_in_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"type":"function","name":"transfer","stateMutability":"nonpayable",
                "inputs":[{{"name":"to","type":"address"}},{{"name":"amount","type":"uint256"}}],
                "outputs":[]}}]"#
        )
        .unwrap();

        let table = SignatureTable::load(&[
            AbiSource::Builtin,
            AbiSource::File(file.path().to_path_buf()),
        ])
        .unwrap();

        assert_eq!(table.len(), 10);
        assert!(table.contains(&[0xa9, 0x05, 0x9c, 0xbb]));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = SignatureTable::load(&[AbiSource::File(PathBuf::from("/nonexistent/router.json"))]);
        assert!(matches!(result, Err(SignatureError::Io { .. })));
    }

    #[test]
    fn test_format_selector() {
        assert_eq!(format_selector(&MULTICALL_DEADLINE_SELECTOR), "0x5ae401dc");
    }
}
