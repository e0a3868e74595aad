//! Payload and header encoding for the step transport.
//!
//! Payloads are MessagePack maps keyed by field name, the format the engine
//! reads and writes.
//! Headers are the payload length as an unsigned 64-bit little-endian integer.

use serde::{Serialize, de::DeserializeOwned};

use crate::error::TransportError;

pub const HEADER_LEN: usize = 8;

pub fn encode_header(length: u64) -> [u8; HEADER_LEN] {
    length.to_le_bytes()
}

pub fn decode_header(bytes: &[u8]) -> Result<u64, TransportError> {
    let header: [u8; HEADER_LEN] = bytes
        .try_into()
        .map_err(|_| TransportError::InvalidHeader(bytes.len()))?;
    Ok(u64::from_le_bytes(header))
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    rmp_serde::to_vec_named(value).map_err(|e| TransportError::Encode(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TransportError> {
    rmp_serde::from_slice(bytes).map_err(|e| TransportError::Decode(e.to_string()))
}
