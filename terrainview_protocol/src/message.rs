// Relay control protocol: messages between a peer and the relay.
//
// Two enums define the vocabulary:
// - `ClientMessage`: sent by a peer to the relay.
// - `ServerMessage`: sent by the relay to a peer.
//
// A connection to the relay is one of two shapes:
// - **API call**: the first message is `SignIn`, `CreateAllocation`,
//   `GetJoinCode` or `JoinAllocation`; the relay answers once and closes.
// - **Bound connection**: the first message is `BindHost` / `BindClient`
//   with the key from an allocation. After `Bound`, the connection carries
//   `Send` packets one way and `Packet` / peer notifications the other way
//   until `Goodbye` or EOF.
//
// Packet payloads are opaque `Vec<u8>` (unnamed messages, see `unnamed.rs`).
// The relay never inspects them.

use serde::{Deserialize, Serialize};

use crate::types::{AllocationId, ConnectionKey, JoinCode, PeerId, PlayerToken};

/// Current relay protocol version, sent on sign-in.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent by a peer to the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Anonymous sign-in. Answered with `SignedIn`.
    SignIn { protocol_version: u32 },
    /// Reserve a relay allocation for up to `max_peers` connections.
    CreateAllocation { token: PlayerToken, max_peers: u32 },
    /// Look up the join code of an allocation this token created.
    GetJoinCode {
        token: PlayerToken,
        allocation_id: AllocationId,
    },
    /// Resolve a join code to an allocation. The code is sent as typed; the
    /// relay normalizes and validates it.
    JoinAllocation { token: PlayerToken, join_code: String },
    /// Bind this connection as the allocation's host.
    BindHost {
        allocation_id: AllocationId,
        key: ConnectionKey,
    },
    /// Bind this connection as a client of the allocation.
    BindClient {
        allocation_id: AllocationId,
        key: ConnectionKey,
    },
    /// Forward a packet to other peers of the same allocation.
    Send { target: Target, payload: Vec<u8> },
    /// Leaving gracefully.
    Goodbye,
}

/// Messages sent by the relay to a peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    SignedIn { token: PlayerToken },
    AllocationCreated {
        allocation_id: AllocationId,
        key: ConnectionKey,
        max_peers: u32,
    },
    JoinCode { join_code: JoinCode },
    AllocationJoined {
        allocation_id: AllocationId,
        key: ConnectionKey,
    },
    /// Bind accepted; this connection is now `peer_id` in the allocation.
    Bound { peer_id: PeerId },
    /// Any request failed.
    Error {
        reason: RelayErrorReason,
        detail: String,
    },
    /// Host only: a client bound to the allocation.
    PeerConnected { peer_id: PeerId },
    /// Host only: a client's connection went away.
    PeerDisconnected { peer_id: PeerId },
    /// A forwarded packet.
    Packet { from: PeerId, payload: Vec<u8> },
    /// Client only: the host left and the allocation is closed.
    HostDisconnected,
}

/// Where a forwarded packet goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// The allocation's host.
    Host,
    /// One specific peer.
    Peer(PeerId),
    /// Every peer in the allocation except the sender.
    Broadcast,
}

/// Machine-readable failure reason. Join failures are split finely so the
/// UI can tell "check your code" apart from "try again later".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayErrorReason {
    Unauthorized,
    InvalidRequest,
    QuotaExceeded,
    AllocationNotFound,
    JoinCodeNotFound,
    AllocationFull,
    Protocol,
}
