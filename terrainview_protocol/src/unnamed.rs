// Unnamed message envelope: `[1 byte kind][payload]`.
//
// Every peer-to-peer packet carried by the relay is one unnamed message. The
// kind byte says which synchronizer the payload belongs to; the payload
// encoding is kind-specific:
// - string kinds (terrain URL, layer fields) use a 4-byte big-endian length
//   followed by UTF-8 bytes (`write_string` / `read_string`),
// - structured kinds (pins, roster, variables, session control) carry a
//   JSON document, same as the relay control protocol.
//
// There is no version field in the envelope. Adding one would break every
// deployed peer at once, so it is left out on purpose until a migration plan
// exists.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::types::MessageKind;

/// Errors from decoding an unnamed message or its payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty message buffer")]
    Empty,
    #[error("truncated string: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("string payload is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// A decoded unnamed message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnnamedMessage {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl UnnamedMessage {
    pub fn new(kind: MessageKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    /// Build a message whose payload is a single length-prefixed string.
    pub fn from_string(kind: MessageKind, text: &str) -> Self {
        let mut payload = Vec::with_capacity(4 + text.len());
        write_string(&mut payload, text);
        Self { kind, payload }
    }

    /// Build a message whose payload is a JSON document.
    pub fn from_json<T: Serialize>(kind: MessageKind, value: &T) -> Result<Self, DecodeError> {
        Ok(Self {
            kind,
            payload: serde_json::to_vec(value)?,
        })
    }

    /// Wire bytes: kind byte followed by the payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.payload.len());
        buf.push(self.kind.0);
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (&kind, payload) = bytes.split_first().ok_or(DecodeError::Empty)?;
        Ok(Self {
            kind: MessageKind(kind),
            payload: payload.to_vec(),
        })
    }

    /// Read the payload as one length-prefixed string. Trailing bytes are
    /// ignored.
    pub fn read_string(&self) -> Result<String, DecodeError> {
        read_string(&self.payload).map(|(text, _)| text)
    }

    pub fn read_json<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Peek at the kind byte without copying the payload.
pub fn peek_kind(bytes: &[u8]) -> Option<MessageKind> {
    bytes.first().copied().map(MessageKind)
}

/// Append a 4-byte big-endian length and the UTF-8 bytes of `text`.
pub fn write_string(buf: &mut Vec<u8>, text: &str) {
    let len = (text.len() as u32).to_be_bytes();
    buf.extend_from_slice(&len);
    buf.extend_from_slice(text.as_bytes());
}

/// Read a length-prefixed string from the front of `bytes`. Returns the
/// string and the number of bytes consumed.
pub fn read_string(bytes: &[u8]) -> Result<(String, usize), DecodeError> {
    if bytes.len() < 4 {
        return Err(DecodeError::Truncated {
            needed: 4,
            available: bytes.len(),
        });
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let end = 4 + len;
    if bytes.len() < end {
        return Err(DecodeError::Truncated {
            needed: end,
            available: bytes.len(),
        });
    }
    let text = String::from_utf8(bytes[4..end].to_vec())?;
    Ok((text, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_byte_leads_the_wire_format() {
        let msg = UnnamedMessage::from_string(MessageKind::TERRAIN, "https://x/ceres.json");
        let wire = msg.encode();
        assert_eq!(wire[0], 1);
        assert_eq!(&wire[1..5], &(20u32).to_be_bytes());
        assert_eq!(&wire[5..], b"https://x/ceres.json");

        let back = UnnamedMessage::decode(&wire).unwrap();
        assert_eq!(back.kind, MessageKind::TERRAIN);
        assert_eq!(back.read_string().unwrap(), "https://x/ceres.json");
    }

    #[test]
    fn decode_empty_buffer_fails() {
        assert!(matches!(
            UnnamedMessage::decode(&[]),
            Err(DecodeError::Empty)
        ));
        assert_eq!(peek_kind(&[]), None);
        assert_eq!(peek_kind(&[4, 9]), Some(MessageKind::ROSTER));
    }

    #[test]
    fn kind_only_message_has_empty_payload() {
        let msg = UnnamedMessage::decode(&[6]).unwrap();
        assert_eq!(msg.kind, MessageKind::SESSION_CONTROL);
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn truncated_string_reports_sizes() {
        let mut buf = Vec::new();
        write_string(&mut buf, "height: 120m");
        buf.truncate(8);
        match read_string(&buf) {
            Err(DecodeError::Truncated { needed, available }) => {
                assert_eq!(needed, 16);
                assert_eq!(available, 8);
            }
            other => panic!("expected Truncated, got {other:?}"),
        }
        assert!(matches!(
            read_string(&[0, 0]),
            Err(DecodeError::Truncated { needed: 4, .. })
        ));
    }

    #[test]
    fn invalid_utf8_rejected() {
        let buf = vec![0, 0, 0, 2, 0xFF, 0xFE];
        assert!(matches!(read_string(&buf), Err(DecodeError::Utf8(_))));
    }

    #[test]
    fn consecutive_strings_report_consumed_length() {
        let mut buf = Vec::new();
        write_string(&mut buf, "Exaggeration");
        write_string(&mut buf, "2.5");
        let (first, used) = read_string(&buf).unwrap();
        assert_eq!(first, "Exaggeration");
        let (second, _) = read_string(&buf[used..]).unwrap();
        assert_eq!(second, "2.5");
    }

    #[test]
    fn json_payload() {
        let msg = UnnamedMessage::from_json(MessageKind::PIN, &vec![1u32, 2, 3]).unwrap();
        let back = UnnamedMessage::decode(&msg.encode()).unwrap();
        let values: Vec<u32> = back.read_json().unwrap();
        assert_eq!(values, vec![1, 2, 3]);
        assert!(back.read_json::<String>().is_err());
    }
}
