//! Wire format for consensus messages.
//!
//! A frame is the canonical JSON (sorted keys, no whitespace) of the message
//! envelope plus a derived `digest` field. Decoding recomputes the digest and
//! rejects the frame when it disagrees, so a frame cannot be altered in
//! transit without the receiver noticing, signature or not.

use sentinel_common::crypto::hash::canonical_json;
use sentinel_common::env::message::PbftMessage;
use serde_json::Value;

use crate::error::NetworkError;

const DIGEST_FIELD: &str = "digest";

pub fn encode(message: &PbftMessage) -> Result<Vec<u8>, NetworkError> {
    let mut value = serde_json::to_value(message)?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| NetworkError::InvalidFrame("message is not an object".into()))?;
    object.insert(DIGEST_FIELD.into(), Value::String(message.digest()));

    Ok(canonical_json(&value)?)
}

pub fn decode(frame: &[u8]) -> Result<PbftMessage, NetworkError> {
    let mut value: Value = serde_json::from_slice(frame)?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| NetworkError::InvalidFrame("frame is not a JSON object".into()))?;

    let declared = match object.remove(DIGEST_FIELD) {
        Some(Value::String(d)) => d,
        _ => return Err(NetworkError::InvalidFrame("missing digest".into())),
    };

    let message: PbftMessage = serde_json::from_value(value)?;
    let computed = message.digest();
    if declared != computed {
        return Err(NetworkError::DigestMismatch { declared, computed });
    }

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_common::env::message::MessageType;
    use sentinel_common::NodeId;

    fn commit() -> PbftMessage {
        PbftMessage::vote(MessageType::Commit, 2, 8, NodeId::from("n3"), "p1", "abc")
            .signed("00ff".into())
    }

    #[test]
    fn test_decode_restores_message() {
        let msg = commit();
        let frame = encode(&msg).unwrap();
        assert_eq!(decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_frame_is_canonical() {
        let frame = String::from_utf8(encode(&commit()).unwrap()).unwrap();
        assert!(frame.starts_with(r#"{"digest":"#));
        assert!(!frame.contains(' '));
    }

    #[test]
    fn test_tampered_frame_is_rejected() {
        let frame = encode(&commit()).unwrap();
        let tampered = String::from_utf8(frame).unwrap().replace(r#""view":2"#, r#""view":3"#);

        match decode(tampered.as_bytes()) {
            Err(NetworkError::DigestMismatch { .. }) => {}
            other => panic!("expected digest mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_digest_is_rejected() {
        let bare = serde_json::to_vec(&commit()).unwrap();
        assert!(matches!(decode(&bare), Err(NetworkError::InvalidFrame(_))));
        assert!(matches!(decode(b"[1,2]"), Err(NetworkError::InvalidFrame(_))));
        assert!(matches!(decode(b"not json"), Err(NetworkError::SerializationError(_))));
    }
}
