// terrainview_protocol: wire formats for Terrainview multiuser sessions.
//
// Shared by the relay (`terrainview_relay`) and the session layer
// (`terrainview_session`). No networking of its own beyond
// `std::io::Read`/`Write` framing.
//
// Module overview:
// - `types.rs`:    IDs and small value types: `PeerId`, `AllocationId`,
//                  `NetworkObjectId`, `Guid`, `JoinCode`, `MessageKind`,
//                  `VrMode`, relay tokens and keys.
// - `message.rs`:  Relay control protocol (`ClientMessage`, `ServerMessage`,
//                  `Target`, `RelayErrorReason`).
// - `unnamed.rs`:  The `[kind][payload]` envelope peers exchange through
//                  the relay, plus the length-prefixed string codec.
// - `framing.rs`:  4-byte big-endian length prefix + payload, with JSON
//                  helpers.
//
// Design decisions:
// - **JSON for control and structured payloads.** Small messages, easy to
//   inspect in logs.
// - **Opaque packets.** The relay forwards `Vec<u8>` without looking inside,
//   so it has no dependency on session semantics.
// - **No async runtime.** Blocking `Read`/`Write` works for both the relay's
//   thread-per-reader model and the peers' background reader thread.

pub mod framing;
pub mod message;
pub mod types;
pub mod unnamed;

pub use framing::{MAX_MESSAGE_SIZE, read_json, read_message, write_json, write_message};
pub use message::{ClientMessage, PROTOCOL_VERSION, RelayErrorReason, ServerMessage, Target};
pub use types::{
    AllocationId, ConnectionKey, Guid, InvalidVrMode, JoinCode, JoinCodeError, MessageKind,
    NetworkObjectId, PeerId, PlayerToken, VrMode,
};
pub use unnamed::{DecodeError, UnnamedMessage, peek_kind, read_string, write_string};

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    /// Frame a ServerMessage, read it back, compare.
    fn server_roundtrip(msg: &ServerMessage) {
        let mut wire = Vec::new();
        write_json(&mut wire, msg).unwrap();
        let mut cursor = Cursor::new(&wire);
        let recovered: ServerMessage = read_json(&mut cursor).unwrap();
        assert_eq!(&recovered, msg);
    }

    #[test]
    fn roundtrip_join_allocation_keeps_raw_code() {
        let msg = ClientMessage::JoinAllocation {
            token: PlayerToken("tok".into()),
            join_code: "xq7k2p".into(),
        };
        let mut wire = Vec::new();
        write_json(&mut wire, &msg).unwrap();
        let recovered: ClientMessage = read_json(&mut Cursor::new(&wire)).unwrap();
        // The relay, not the wire, normalizes codes.
        assert_eq!(recovered, msg);
    }

    #[test]
    fn roundtrip_error_reason() {
        server_roundtrip(&ServerMessage::Error {
            reason: RelayErrorReason::JoinCodeNotFound,
            detail: "no allocation for code ABCDEF".into(),
        });
    }

    #[test]
    fn roundtrip_packet_carries_unnamed_message() {
        let inner = UnnamedMessage::from_string(MessageKind::TERRAIN, "https://x/mars.json");
        let msg = ServerMessage::Packet {
            from: PeerId::HOST,
            payload: inner.encode(),
        };
        server_roundtrip(&msg);
        if let ServerMessage::Packet { payload, .. } = msg {
            let back = UnnamedMessage::decode(&payload).unwrap();
            assert_eq!(back.read_string().unwrap(), "https://x/mars.json");
        }
    }

    #[test]
    fn join_code_serializes_as_plain_string() {
        let msg = ServerMessage::JoinCode {
            join_code: JoinCode::parse("ab23cd").unwrap(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"AB23CD\""), "{json}");
        server_roundtrip(&msg);
    }
}
