use crate::protocol::{Envelope, ProtocolError};

pub const DEFAULT_MAX_ENVELOPE_BYTES: usize = 256 * 1024;

pub fn encode_envelope(envelope: &Envelope, max_bytes: usize) -> Result<String, ProtocolError> {
    let encoded =
        serde_json::to_string(envelope).map_err(|err| ProtocolError::Encode(err.to_string()))?;
    if encoded.len() > max_bytes {
        return Err(ProtocolError::TooLarge {
            size: encoded.len(),
            max: max_bytes,
        });
    }
    Ok(encoded)
}

/// Decodes one text frame. Trailing newlines from line-oriented clients are
/// tolerated.
pub fn decode_envelope(frame: &str, max_bytes: usize) -> Result<Envelope, ProtocolError> {
    let raw = frame.trim_end_matches(['\r', '\n']);
    if raw.len() > max_bytes {
        return Err(ProtocolError::TooLarge {
            size: raw.len(),
            max: max_bytes,
        });
    }
    let envelope: Envelope =
        serde_json::from_str(raw).map_err(|err| ProtocolError::Malformed(err.to_string()))?;
    if !envelope.payload.is_object() {
        return Err(ProtocolError::PayloadNotObject);
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{heartbeat, MessageType};

    #[test]
    fn decoder_rejects_missing_required_fields() {
        let missing_from = r#"{"type":"heartbeat","timestamp":1,"payload":{}}"#;
        let err = decode_envelope(missing_from, DEFAULT_MAX_ENVELOPE_BYTES).expect_err("from");
        assert!(matches!(err, ProtocolError::Malformed(_)));

        let missing_payload = r#"{"type":"heartbeat","from":"a","timestamp":1}"#;
        let err =
            decode_envelope(missing_payload, DEFAULT_MAX_ENVELOPE_BYTES).expect_err("payload");
        assert!(matches!(err, ProtocolError::Malformed(_)));

        let scalar_payload = r#"{"type":"heartbeat","from":"a","timestamp":1,"payload":3}"#;
        let err = decode_envelope(scalar_payload, DEFAULT_MAX_ENVELOPE_BYTES).expect_err("scalar");
        assert_eq!(err, ProtocolError::PayloadNotObject);
    }

    #[test]
    fn decoder_tolerates_trailing_newline_and_null_to() {
        let frame = "{\"type\":\"heartbeat\",\"from\":\"a\",\"to\":null,\"timestamp\":1,\"payload\":{}}\r\n";
        let envelope = decode_envelope(frame, DEFAULT_MAX_ENVELOPE_BYTES).expect("decode");
        assert_eq!(envelope.kind, MessageType::Heartbeat);
        assert_eq!(envelope.to, None);
    }

    #[test]
    fn size_limit_applies_both_ways() {
        let envelope = heartbeat("client-with-a-long-identifier");
        let result = encode_envelope(&envelope, 16);
        assert!(matches!(result, Err(ProtocolError::TooLarge { .. })));

        let frame = encode_envelope(&envelope, DEFAULT_MAX_ENVELOPE_BYTES).expect("encode");
        let result = decode_envelope(&frame, 16);
        assert!(matches!(result, Err(ProtocolError::TooLarge { .. })));
    }
}
