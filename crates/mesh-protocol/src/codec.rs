//! MessagePack payload helpers for sub-protocols.
//!
//! A payload may carry several values back to back; [`read_value`] consumes
//! exactly one and leaves the rest in the stream.

use std::io::Cursor;

use bytes::{Buf, Bytes, BytesMut};
use mesh_transport::{message_writer, MessageWriter, ProtocolError};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Append `value` to `out`.
pub fn write_value<T: Serialize + ?Sized>(
    out: &mut BytesMut,
    value: &T,
) -> Result<(), ProtocolError> {
    let encoded = rmp_serde::to_vec(value).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    out.extend_from_slice(&encoded);
    Ok(())
}

/// Decode one value from the front of `payload`.
///
/// On error nothing is consumed.
pub fn read_value<T: DeserializeOwned>(payload: &mut Bytes) -> Result<T, ProtocolError> {
    if payload.is_empty() {
        return Err(ProtocolError::Truncated {
            needed: 1,
            remaining: 0,
        });
    }
    let mut cursor = Cursor::new(&payload[..]);
    let value =
        rmp_serde::from_read(&mut cursor).map_err(|e| ProtocolError::Decode(e.to_string()))?;
    let consumed = cursor.position() as usize;
    payload.advance(consumed);
    Ok(value)
}

/// Encode `value` now and return a writer that emits the bytes.
pub fn encode_writer<T: Serialize + ?Sized>(value: &T) -> Result<MessageWriter, ProtocolError> {
    let encoded = rmp_serde::to_vec(value).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(message_writer(move |out| out.extend_from_slice(&encoded)))
}
