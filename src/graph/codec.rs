use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a message for delivery to a peer's graph node.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(message).context("encoding stream message")
}

/// Decodes a message delivered by a peer.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> serde_json::Result<T> {
    serde_json::from_slice(payload)
}
