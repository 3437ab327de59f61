// Collaborator interfaces the controller is generic over.
//
// - `RelayService`: identity and allocation calls (sign-in, allocate, join
//   code, join). Each call blocks until the relay answers.
// - `Transport`: the bound data connection. Bind first, then start as host
//   or client. `poll` never blocks; it returns whatever the background
//   reader has queued since the last call.
// - `SceneDownloader`: the out-of-band dataset loader. The session layer
//   only tells it what to fetch and watches its state.
//
// `relay_backend.rs` implements the first two on top of the relay client.
// Tests substitute scripted mocks.

use terrainview_protocol::message::Target;
use terrainview_protocol::types::{AllocationId, ConnectionKey, JoinCode, PeerId};

use crate::error::{SessionError, TransportError};

/// What the transport needs to bind to an allocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayServerData {
    pub allocation_id: AllocationId,
    pub key: ConnectionKey,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayAllocation {
    pub allocation_id: AllocationId,
    pub server: RelayServerData,
    pub max_peers: u32,
}

pub trait RelayService {
    /// Prepare the service. Called once before the first sign-in.
    fn initialize(&mut self) -> Result<(), SessionError>;

    fn sign_in_anonymously(&mut self) -> Result<(), SessionError>;

    fn is_signed_in(&self) -> bool;

    fn allocate(&mut self, max_peers: u32) -> Result<RelayAllocation, SessionError>;

    fn get_join_code(&mut self, allocation_id: AllocationId) -> Result<JoinCode, SessionError>;

    fn join_allocation(&mut self, code: &JoinCode) -> Result<RelayServerData, SessionError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    Data { from: PeerId, bytes: Vec<u8> },
    /// The connection is gone (host left, relay dropped us, I/O failure).
    Closed,
}

pub trait Transport {
    fn bind(&mut self, server: RelayServerData);

    /// Start as host. Returns the local peer ID.
    fn start_host(&mut self) -> Result<PeerId, TransportError>;

    /// Start as client. Returns the local peer ID.
    fn start_client(&mut self) -> Result<PeerId, TransportError>;

    /// Close the connection and forget the binding. Safe to call at any
    /// time, any number of times.
    fn shutdown(&mut self);

    fn is_running(&self) -> bool;

    fn send(&mut self, target: Target, bytes: &[u8]) -> Result<(), TransportError>;

    fn poll(&mut self) -> Vec<TransportEvent>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DownloadState {
    #[default]
    Idle,
    Downloading,
    Done,
}

pub trait SceneDownloader {
    /// URL of the dataset currently shown, if any.
    fn current_dataset(&self) -> Option<String>;

    fn state(&self) -> DownloadState;

    fn begin_download(&mut self, url: &str);

    fn load_sample(&mut self, url: &str);
}
