//! Wire-level types shared by the node clients.
//!
//! ## JSON-RPC Protocol Types
//! - [`JsonRpcRequest`], [`JsonRpcResponse`], [`JsonRpcError`]: JSON-RPC 2.0 envelopes
//!
//! ## Chain Primitives
//! - [`Hash32`]: 32-byte block hash with `0x`-hex parsing and display
//! - [`parse_hex_u64`]: quantity decoding for `0x`-prefixed integers

use serde::{Deserialize, Serialize};
use std::{borrow::Cow, sync::Arc};

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request.
///
/// # Example
///
/// ```
/// use meridian_core::types::JsonRpcRequest;
/// use serde_json::json;
///
/// let request = JsonRpcRequest::new("eth_chainId", None, json!(1));
///
/// assert_eq!(request.method, "eth_chainId");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: Cow<'static, str>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    pub id: Arc<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Creates a request; `params` is omitted from the wire form when `None`.
    #[must_use]
    pub fn new(
        method: impl Into<String>,
        params: Option<serde_json::Value>,
        id: serde_json::Value,
    ) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(JSONRPC_VERSION),
            method: method.into(),
            params,
            id: Arc::new(id),
        }
    }
}

/// JSON-RPC 2.0 response as received from an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: Cow<'static, str>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
    #[serde(default)]
    pub id: Arc<serde_json::Value>,
}

/// JSON-RPC 2.0 error object.
///
/// Standard codes:
///
/// - `-32700`: Parse error
/// - `-32600`: Invalid request
/// - `-32601`: Method not found
/// - `-32602`: Invalid params
/// - `-32603`: Internal error
/// - `-32000` to `-32099`: Server-defined errors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Error type for hex parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HexParseError {
    #[error("missing 0x prefix")]
    MissingPrefix,
    #[error("invalid hex: {0}")]
    InvalidHex(String),
    #[error("invalid length: expected 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// 32-byte hash used for block and parent hashes.
///
/// # Example
/// ```
/// use meridian_core::types::Hash32;
///
/// let hash: Hash32 = "0xabcd1234abcd1234abcd1234abcd1234abcd1234abcd1234abcd1234abcd1234"
///     .parse()
///     .unwrap();
/// assert_eq!(hash.as_bytes()[0], 0xab);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl TryFrom<&str> for Hash32 {
    type Error = HexParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let hex_str = value.strip_prefix("0x").ok_or(HexParseError::MissingPrefix)?;

        let bytes = hex::decode(hex_str).map_err(|e| HexParseError::InvalidHex(e.to_string()))?;

        let arr: [u8; 32] =
            bytes.as_slice().try_into().map_err(|_| HexParseError::InvalidLength(bytes.len()))?;
        Ok(Hash32(arr))
    }
}

impl From<[u8; 32]> for Hash32 {
    fn from(arr: [u8; 32]) -> Self {
        Hash32(arr)
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl std::str::FromStr for Hash32 {
    type Err = HexParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s)
    }
}

impl Serialize for Hash32 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Parses a `0x`-prefixed hex quantity such as `"0x1b4"`.
///
/// # Errors
///
/// Returns [`HexParseError`] when the prefix is missing or the digits are not valid hex.
pub fn parse_hex_u64(value: &str) -> Result<u64, HexParseError> {
    let digits = value.strip_prefix("0x").ok_or(HexParseError::MissingPrefix)?;
    if digits.is_empty() {
        return Err(HexParseError::InvalidHex(value.to_string()));
    }
    u64::from_str_radix(digits, 16).map_err(|e| HexParseError::InvalidHex(e.to_string()))
}
