// Length-delimited message framing over TCP.
//
// Wire format: a 4-byte big-endian length prefix followed by the payload.
// `write_message` / `read_message` work on raw bytes; `write_json` /
// `read_json` add the serde_json step used for every relay control message.
//
// `MAX_MESSAGE_SIZE` (1 MB) guards against unbounded allocation from a
// malformed length prefix. Pin measurement text and dataset URLs are the
// largest payloads we carry, so this is far more than needed.

use std::io::{self, Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Maximum allowed frame size (1 MB).
pub const MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

/// Write a length-delimited frame: 4-byte big-endian length, then payload.
pub fn write_message<W: Write>(writer: &mut W, msg: &[u8]) -> io::Result<()> {
    let len = msg.len();
    if len > MAX_MESSAGE_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"),
        ));
    }
    #[expect(clippy::cast_possible_truncation)]
    let len_bytes = (len as u32).to_be_bytes();
    writer.write_all(&len_bytes)?;
    writer.write_all(msg)?;
    writer.flush()
}

/// Read a length-delimited frame.
///
/// Returns `UnexpectedEof` if the stream closes before or during a frame and
/// `InvalidData` if the length exceeds `MAX_MESSAGE_SIZE`.
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Serialize `msg` to JSON and write it as one frame.
pub fn write_json<W: Write, T: Serialize>(writer: &mut W, msg: &T) -> io::Result<()> {
    let json = serde_json::to_vec(msg).map_err(io::Error::other)?;
    write_message(writer, &json)
}

/// Read one frame and deserialize it from JSON. Malformed JSON is reported
/// as `InvalidData`.
pub fn read_json<R: Read, T: DeserializeOwned>(reader: &mut R) -> io::Result<T> {
    let bytes = read_message(reader)?;
    serde_json::from_slice(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ClientMessage, ServerMessage, Target};
    use crate::types::PeerId;
    use std::io::Cursor;

    #[test]
    fn rejects_oversized_write() {
        let big = vec![0u8; MAX_MESSAGE_SIZE as usize + 1];
        let mut buf = Vec::new();
        let err = write_message(&mut buf, &big).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_oversized_read() {
        let fake_len = (MAX_MESSAGE_SIZE + 1).to_be_bytes();
        let mut cursor = Cursor::new(fake_len.to_vec());
        let err = read_message(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn read_unexpected_eof() {
        // Only 2 bytes when 4 are needed for the length prefix.
        let mut cursor = Cursor::new(vec![0u8, 1]);
        let err = read_message(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn frames_stay_ordered_on_one_stream() {
        let mut buf = Vec::new();
        write_json(&mut buf, &ClientMessage::SignIn { protocol_version: 1 }).unwrap();
        write_json(
            &mut buf,
            &ClientMessage::Send {
                target: Target::Peer(PeerId(2)),
                payload: vec![1, 0, 0, 0, 0],
            },
        )
        .unwrap();
        write_json(&mut buf, &ClientMessage::Goodbye).unwrap();

        let mut cursor = Cursor::new(&buf);
        let first: ClientMessage = read_json(&mut cursor).unwrap();
        assert!(matches!(first, ClientMessage::SignIn { protocol_version: 1 }));
        let second: ClientMessage = read_json(&mut cursor).unwrap();
        assert!(matches!(
            second,
            ClientMessage::Send {
                target: Target::Peer(PeerId(2)),
                ..
            }
        ));
        let third: ClientMessage = read_json(&mut cursor).unwrap();
        assert_eq!(third, ClientMessage::Goodbye);
    }

    #[test]
    fn malformed_json_is_invalid_data() {
        let mut buf = Vec::new();
        write_message(&mut buf, b"{not json").unwrap();
        let mut cursor = Cursor::new(&buf);
        let err = read_json::<_, ServerMessage>(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
