//! Payload encoding for the `data` column.
//!
//! Payloads are JSON objects. Gzip output is detected on read by its magic
//! bytes, so compressed and plain rows can live in the same table.

use std::io::{Read, Write};

use flate2::Compression as GzLevel;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde_json::{Map, Value};

use crate::config::Compression;
use crate::error::DatabaseError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Encode a payload object, optionally gzip-compressed.
pub fn encode(data: &Map<String, Value>, compression: Compression) -> Result<Vec<u8>, DatabaseError> {
    let json = serde_json::to_vec(data)
        .map_err(|e| DatabaseError::Serialization(format!("encode payload: {e}")))?;
    match compression {
        Compression::None => Ok(json),
        Compression::Gzip => {
            let mut enc = GzEncoder::new(Vec::new(), GzLevel::default());
            enc.write_all(&json)
                .and_then(|_| enc.finish())
                .map_err(|e| DatabaseError::Serialization(format!("gzip payload: {e}")))
        }
    }
}

/// Decode a stored payload. Empty blobs decode to an empty object.
pub fn decode(raw: &[u8]) -> Result<Map<String, Value>, DatabaseError> {
    if raw.is_empty() {
        return Ok(Map::new());
    }

    let inflated;
    let bytes = if raw.starts_with(&GZIP_MAGIC) {
        let mut out = Vec::new();
        GzDecoder::new(raw)
            .read_to_end(&mut out)
            .map_err(|e| DatabaseError::Serialization(format!("gunzip payload: {e}")))?;
        inflated = out;
        inflated.as_slice()
    } else {
        raw
    };

    match serde_json::from_slice::<Value>(bytes)
        .map_err(|e| DatabaseError::Serialization(format!("decode payload: {e}")))?
    {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(DatabaseError::Serialization(format!(
            "payload must be a JSON object, got {other}"
        ))),
    }
}
