//! Request body decoding for the node protocol: JSON, optionally
//! gzip-compressed either via Content-Encoding or raw (some agents
//! compress without setting the header, so the magic bytes are
//! sniffed too).

use std::io::Read;

use axum::http::{header, HeaderMap};
use flate2::read::GzDecoder;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::NodeGateError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub fn decode_json_body(headers: &HeaderMap, body: &[u8]) -> Result<Value, NodeGateError> {
    let gzipped = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false)
        || body.starts_with(&GZIP_MAGIC);

    let value = if gzipped {
        let mut decoder = GzDecoder::new(body);
        let mut decoded = Vec::new();
        decoder
            .read_to_end(&mut decoded)
            .map_err(|e| NodeGateError::BadRequest(format!("could not read gzip body: {e}")))?;
        serde_json::from_slice(&decoded)
    } else {
        serde_json::from_slice(body)
    };

    value.map_err(|e| NodeGateError::BadRequest(format!("could not read JSON data: {e}")))
}

/// Decodes the body and deserializes it into the request type, with
/// missing/invalid fields reported as validation errors.
pub fn parse_request<T: DeserializeOwned>(
    headers: &HeaderMap,
    body: &[u8],
) -> Result<T, NodeGateError> {
    let value = decode_json_body(headers, body)?;
    serde_json::from_value(value)
        .map_err(|e| NodeGateError::BadRequest(format!("invalid request body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use serde_json::json;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn plain_json() {
        let value = decode_json_body(&HeaderMap::new(), br#"{"node_key": "abc"}"#).unwrap();
        assert_eq!(value, json!({"node_key": "abc"}));
    }

    #[test]
    fn gzip_with_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());
        let body = gzip(br#"{"a": 1}"#);
        assert_eq!(decode_json_body(&headers, &body).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn gzip_without_header_is_sniffed() {
        let body = gzip(br#"{"a": 1}"#);
        assert_eq!(
            decode_json_body(&HeaderMap::new(), &body).unwrap(),
            json!({"a": 1})
        );
    }

    #[test]
    fn bad_json_is_a_bad_request() {
        let err = decode_json_body(&HeaderMap::new(), b"not json").unwrap_err();
        assert!(matches!(err, NodeGateError::BadRequest(_)));
    }
}
