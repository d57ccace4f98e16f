//! Body readers — typed views over a carried message's payload.

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::Carrier;
use crate::error::{Error, Result};

/// Largest body the readers will interpret. Guards against a handler
/// accidentally JSON-parsing a multi-fragment blob.
pub const MAX_READ_BYTES: usize = 64 * 1024 * 1024;

/// The body as UTF-8 text.
pub fn read_text<M: Carrier>(msg: &M) -> Result<String> {
    let raw = checked_bytes(msg)?;
    String::from_utf8(raw.to_vec()).map_err(|e| Error::bad_request(e.to_string()))
}

/// The body as a JSON value of the caller's choosing.
pub fn read_json<M: Carrier, T: DeserializeOwned>(msg: &M) -> Result<T> {
    let raw = checked_bytes(msg)?;
    serde_json::from_slice(&raw).map_err(|e| Error::bad_request(e.to_string()))
}

/// A form-encoded (deep-object) body as a JSON object.
pub fn read_form<M: Carrier>(msg: &M) -> Result<Value> {
    let raw = checked_bytes(msg)?;
    let text = std::str::from_utf8(&raw).map_err(|e| Error::bad_request(e.to_string()))?;
    super::query::decode(text)
}

fn checked_bytes<M: Carrier>(msg: &M) -> Result<bytes::Bytes> {
    if msg.body().len() > MAX_READ_BYTES {
        return Err(Error::bad_request("body too large to interpret"));
    }
    Ok(msg.body().to_bytes())
}
