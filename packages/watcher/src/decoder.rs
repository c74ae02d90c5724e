//! Call Decoder
//!
//! Decodes the argument bytes of a matched call into named, typed values.

use std::sync::Arc;

use crate::abi::{decode_params, AbiValue, DecodeError};
use crate::signatures::CallSchema;

/// A decoded contract call
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedCall {
    /// Schema the arguments were decoded with
    pub schema: Arc<CallSchema>,
    /// (name, value) pairs in declaration order
    pub arguments: Vec<(String, AbiValue)>,
}

impl DecodedCall {
    /// Look up an argument by name
    pub fn argument(&self, name: &str) -> Option<&AbiValue> {
        self.arguments
            .iter()
            .find(|(arg, _)| arg == name)
            .map(|(_, value)| value)
    }

    /// Arguments as a JSON object keyed by name
    pub fn arguments_json(&self) -> serde_json::Value {
        self.arguments
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect::<serde_json::Map<_, _>>()
            .into()
    }
}

/// Decode call arguments (input data without the selector) against a schema
pub fn decode_call(schema: &Arc<CallSchema>, remainder: &[u8]) -> Result<DecodedCall, DecodeError> {
    let values = decode_params(&schema.argument_types, remainder)?;
    let arguments = schema
        .argument_names
        .iter()
        .cloned()
        .zip(values)
        .collect();

    Ok(DecodedCall {
        schema: Arc::clone(schema),
        arguments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::AbiType;
    use crate::filter::match_selector;
    use crate::signatures::SignatureTable;
    use alloy::primitives::{address, Bytes, U256};
    use alloy::sol;
    use alloy::sol_types::SolCall;

    sol! {
        function swapExactTokensForTokens(uint256 amountIn, uint256 amountOutMin, address[] path, address to);
        function multicall(uint256 deadline, bytes[] data);
    }

    fn builtin_schema(selector: [u8; 4]) -> Arc<CallSchema> {
        SignatureTable::builtin().unwrap().lookup(&selector).unwrap()
    }

    // ==================== decode_call tests ====================

    #[test]
    fn test_decode_swap_preserves_declaration_order() {
        let weth = address!("C02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2");
        let usdc = address!("A0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48");
        let recipient = address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266");

        let calldata = swapExactTokensForTokensCall {
            amountIn: U256::from(10u64).pow(U256::from(18u64)),
            amountOutMin: U256::from(1u64),
            path: vec![weth, usdc],
            to: recipient,
        }
        .abi_encode();

        let (selector, remainder) = match_selector(&calldata).unwrap();
        let decoded = decode_call(&builtin_schema(selector), remainder).unwrap();

        let names: Vec<_> = decoded.arguments.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["amountIn", "amountOutMin", "path", "to"]);
        assert_eq!(
            decoded.argument("path"),
            Some(&AbiValue::Array(vec![AbiValue::Address(weth), AbiValue::Address(usdc)]))
        );
        assert_eq!(decoded.argument("to"), Some(&AbiValue::Address(recipient)));
    }

    #[test]
    fn test_decode_multicall_round_trip() {
        let data = vec![
            Bytes::from(vec![0xaa, 0xbb]),
            Bytes::from(vec![0xcc, 0xdd, 0xee]),
        ];
        let calldata = multicallCall {
            deadline: U256::from(1_700_000_000u64),
            data: data.clone(),
        }
        .abi_encode();

        let (selector, remainder) = match_selector(&calldata).unwrap();
        assert_eq!(selector, multicallCall::SELECTOR);

        let decoded = decode_call(&builtin_schema(selector), remainder).unwrap();
        assert_eq!(
            decoded.argument("deadline").and_then(AbiValue::as_uint),
            Some(U256::from(1_700_000_000u64))
        );
        assert_eq!(
            decoded.argument("data"),
            Some(&AbiValue::Array(data.into_iter().map(AbiValue::Bytes).collect()))
        );
    }

    #[test]
    fn test_decode_truncated_arguments_fails() {
        let calldata = multicallCall {
            deadline: U256::from(1u64),
            data: vec![Bytes::from(vec![0x11; 64])],
        }
        .abi_encode();

        let (selector, remainder) = match_selector(&calldata[..calldata.len() - 32]).unwrap();
        let result = decode_call(&builtin_schema(selector), remainder);
        assert!(matches!(result, Err(DecodeError::LengthOutOfBounds { .. })));
    }

    #[test]
    fn test_decode_unsupported_schema_type() {
        let schema = Arc::new(
            CallSchema::new("f", vec![AbiType::parse("function")], vec!["cb".into()]).unwrap(),
        );
        let result = decode_call(&schema, &[0u8; 32]);
        assert_eq!(result, Err(DecodeError::UnsupportedType("function".to_string())));
    }

    #[test]
    fn test_arguments_json() {
        let calldata = multicallCall {
            deadline: U256::from(5u64),
            data: vec![Bytes::from(vec![0x01])],
        }
        .abi_encode();
        let (selector, remainder) = match_selector(&calldata).unwrap();
        let decoded = decode_call(&builtin_schema(selector), remainder).unwrap();

        assert_eq!(
            decoded.arguments_json(),
            serde_json::json!({"deadline": "5", "data": ["0x01"]})
        );
    }
}
