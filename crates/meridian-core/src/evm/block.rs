use crate::{
    chain::Head,
    client::ClientError,
    types::{parse_hex_u64, Hash32},
};
use serde::Deserialize;
use serde_json::Value;

/// Header fields of an `eth_getBlockByNumber` result or a `newHeads` notification.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BlockHeader {
    number: String,
    hash: Hash32,
    parent_hash: Hash32,
    timestamp: String,
}

impl TryFrom<BlockHeader> for Head {
    type Error = ClientError;

    fn try_from(header: BlockHeader) -> Result<Self, Self::Error> {
        let number = parse_hex_u64(&header.number)
            .map_err(|e| ClientError::InvalidResponse(format!("block number: {e}")))?;
        let timestamp = parse_hex_u64(&header.timestamp)
            .map_err(|e| ClientError::InvalidResponse(format!("block timestamp: {e}")))?;
        Ok(Head { number, hash: header.hash, parent_hash: header.parent_hash, timestamp })
    }
}

/// Decodes a block object into a [`Head`]. A `null` block is an invalid response.
pub(crate) fn head_from_value(value: Value) -> Result<Head, ClientError> {
    if value.is_null() {
        return Err(ClientError::InvalidResponse("block not found".to_string()));
    }
    let header: BlockHeader = serde_json::from_value(value)
        .map_err(|e| ClientError::InvalidResponse(format!("malformed block header: {e}")))?;
    Head::try_from(header)
}
