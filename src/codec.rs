//! Wire codecs for request and response payloads
//!
//! Two interchangeable encodings cover the same protocol: `json` is
//! the human-readable one, `msgpack` the dense one. Exactly one codec
//! is active per server instance: a deployment-time choice, never
//! negotiated per request.
//!
//! The codecs intentionally differ in one respect: only `msgpack` can
//! represent an execution error on the wire. Under `json` a failed
//! query is logged and the response dropped. `encode_error` returning
//! `Option` keeps that asymmetry visible in the type.

use std::sync::Arc;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::backend::Row;
use crate::error::{Result, ServerError};

/// The two required fields of an inbound payload. Unknown keys are
/// ignored; a missing `id` or `query` rejects the whole message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DecodedRequest {
    pub id: String,
    pub query: String,
}

#[derive(Serialize)]
struct WireResult<'a> {
    id: &'a str,
    data: &'a [Row],
}

/// Error payload: `{"id": <id>, "ERROR:<kind>": <message>}`.
struct WireError<'a> {
    id: &'a str,
    kind: &'a str,
    message: &'a str,
}

impl Serialize for WireError<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("id", self.id)?;
        map.serialize_entry(&format!("ERROR:{}", self.kind), self.message)?;
        map.end()
    }
}

pub trait Codec: Send + Sync {
    fn name(&self) -> &'static str;

    fn decode_request(&self, bytes: &[u8]) -> Result<DecodedRequest>;

    fn encode_result(&self, query_id: &str, rows: &[Row]) -> Result<Vec<u8>>;

    /// Encode an error response, or `None` if this codec has no error
    /// representation (the caller logs and drops the response).
    fn encode_error(&self, query_id: &str, kind: &str, message: &str) -> Option<Vec<u8>>;
}

/// Deployment-time codec lookup.
pub fn codec_by_name(name: &str) -> Option<Arc<dyn Codec>> {
    match name {
        "json" => Some(Arc::new(JsonCodec)),
        "msgpack" => Some(Arc::new(MsgpackCodec)),
        _ => None,
    }
}

// ============================================================================
// JSON (text codec)
// ============================================================================

pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn decode_request(&self, bytes: &[u8]) -> Result<DecodedRequest> {
        serde_json::from_slice(bytes).map_err(|e| ServerError::Decode(e.to_string()))
    }

    fn encode_result(&self, query_id: &str, rows: &[Row]) -> Result<Vec<u8>> {
        serde_json::to_vec(&WireResult {
            id: query_id,
            data: rows,
        })
        .map_err(|e| ServerError::Encode(e.to_string()))
    }

    fn encode_error(&self, _query_id: &str, _kind: &str, _message: &str) -> Option<Vec<u8>> {
        // Historical behavior: the text codec drops failed queries.
        None
    }
}

// ============================================================================
// MessagePack (compact codec)
// ============================================================================

pub struct MsgpackCodec;

impl Codec for MsgpackCodec {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn decode_request(&self, bytes: &[u8]) -> Result<DecodedRequest> {
        rmp_serde::from_slice(bytes).map_err(|e| ServerError::Decode(e.to_string()))
    }

    fn encode_result(&self, query_id: &str, rows: &[Row]) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(&WireResult {
            id: query_id,
            data: rows,
        })
        .map_err(|e| ServerError::Encode(e.to_string()))
    }

    fn encode_error(&self, query_id: &str, kind: &str, message: &str) -> Option<Vec<u8>> {
        rmp_serde::to_vec_named(&WireError {
            id: query_id,
            kind,
            message,
        })
        .ok()
    }
}
