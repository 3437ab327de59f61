// terrainview_relay: relay and identity service for multiuser sessions.
//
// The relay is a rendezvous point and packet forwarder: peers behind NAT
// never talk to each other directly. A host signs in anonymously, reserves
// an allocation, gets a six-character join code and binds a long-lived
// connection; clients resolve the code and bind their own connections. From
// then on the relay forwards opaque packets between the host and its clients
// (hub-and-spoke; clients can only address the host). It never looks inside
// packets.
//
// Module overview:
// - `state.rs`:   `RelayState`: tokens, allocations, join codes, bound
//                 connections, forwarding rules. Single-threaded; driven by
//                 `server.rs`.
// - `server.rs`:  TCP listener, one reader thread per bound connection, and
//                 the main event loop that owns `RelayState`. Same
//                 thread-per-reader + `mpsc` funnel as every other network
//                 component in this workspace.
// - `client.rs`:  Peer side. `RelayApiClient` for one-shot API calls and
//                 `RelayConnection` for a bound connection with a background
//                 reader thread. Lives here (not in the session crate) so
//                 integration tests can drive the relay without session
//                 semantics.
//
// The relay runs standalone (`main.rs`) or embedded via `start_relay`.

pub mod client;
pub mod server;
pub mod state;

pub use client::{
    BindRole, HostAllocation, JoinedAllocation, RelayApiClient, RelayClientError,
    RelayConnection, RelayEvent,
};
pub use server::{RelayConfig, RelayConfigError, RelayHandle, start_relay};
pub use state::RelayState;
