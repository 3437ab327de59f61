// Host-authoritative session layer for Terrainview multiuser.
//
// A host and a small group of clients (nine by default) meet through the
// relay and share one view of a terrain: which dataset is loaded, how its
// layers and vertical exaggeration are set, and the measurement pins placed
// on it. The host is the single authority; clients send requests and mirror
// what the host broadcasts.
//
// Layers, bottom-up:
// - `context`: `SessionContext`, passed explicitly to every component. Holds
//   role and identity and queues outgoing messages and events.
// - `channel`: message-kind registry in front of dispatch.
// - `variables`: single-owner replicated values with versioned updates.
// - `roster`, `terrain`, `layers`, `pins`, `control`: one component per
//   message kind.
// - `synchronizers`: owns the components and routes between them.
// - `controller`: lifecycle state machine over the `services` traits.
// - `relay_backend`: the `services` traits implemented on the TCP relay.
//
// Nothing here touches sockets directly. The only threads are the relay
// connection's reader threads, which feed `ConnectionController::tick`.

pub mod channel;
pub mod config;
pub mod context;
pub mod control;
pub mod controller;
pub mod error;
pub mod events;
pub mod layers;
pub mod pins;
pub mod relay_backend;
pub mod roster;
pub mod services;
pub mod synchronizers;
pub mod terrain;
pub mod variables;

pub use config::SessionConfig;
pub use context::{Destination, Role, SessionContext};
pub use controller::{AbortHandle, ConnectionController, ConnectionState, SessionFlags};
pub use error::{SessionError, SyncError, TransportError, UiMessage};
pub use events::{EventEmitter, SubscriptionId, SyncEvent, UiEvent, VariableChange};
pub use pins::{Pin, TerrainPoint};
pub use relay_backend::{RelayBackend, RelayTransport};
pub use services::{
    DownloadState, RelayAllocation, RelayServerData, RelayService, SceneDownloader, Transport,
    TransportEvent,
};

/// A controller wired to the TCP relay.
pub type RelaySessionController<D> = ConnectionController<RelayBackend, RelayTransport, D>;

/// Build a controller that talks to the relay named in `config`.
pub fn relay_controller<D: SceneDownloader>(
    config: SessionConfig,
    downloader: D,
) -> RelaySessionController<D> {
    let relay = RelayBackend::new(config.relay_addr.clone());
    let transport = RelayTransport::new(config.relay_addr.clone());
    ConnectionController::new(config, relay, transport, downloader)
}
