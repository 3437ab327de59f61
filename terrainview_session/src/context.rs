// Session context: the one object every synchronizer receives.
//
// Instead of ambient singletons, the controller builds a `SessionContext` per
// connection (and a solo one between sessions) and passes `&mut` to each
// component call. It carries who we are (role, local peer, guid, join code),
// the host's view of connected peers, the host's network-object ID counter,
// and two queues:
// - the **outbox** of unnamed messages components want sent. Sending is
//   role-dependent: the host broadcasts, a client addresses the host, and a
//   solo context drops everything. The controller flushes the outbox to the
//   transport after every operation and tick.
// - the **event queue** of `SyncEvent`s, drained by the controller.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::trace;

use terrainview_protocol::message::Target;
use terrainview_protocol::types::{Guid, JoinCode, NetworkObjectId, PeerId};
use terrainview_protocol::unnamed::UnnamedMessage;

use crate::error::SyncError;
use crate::events::SyncEvent;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Host,
    Client,
    /// Solo: no session. Components act locally and send nothing.
    Disconnected,
}

/// Where a queued message should go.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Destination {
    /// Host only: every connected client.
    AllPeers,
    /// Host only: every connected client except one (relaying a client's
    /// message back out).
    AllExcept(PeerId),
    /// Host only: one client.
    Peer(PeerId),
    /// Client only: the host.
    Host,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outgoing {
    pub destination: Destination,
    pub message: UnnamedMessage,
}

#[derive(Debug)]
pub struct SessionContext {
    role: Role,
    local_peer: PeerId,
    join_code: Option<JoinCode>,
    local_guid: Guid,
    peers: BTreeSet<PeerId>,
    next_object: u64,
    outbox: Vec<Outgoing>,
    events: Vec<SyncEvent>,
}

impl SessionContext {
    fn with_role(role: Role, local_peer: PeerId, join_code: Option<JoinCode>, guid: Guid) -> Self {
        Self {
            role,
            local_peer,
            join_code,
            local_guid: guid,
            peers: BTreeSet::new(),
            next_object: 1,
            outbox: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn solo(guid: Guid) -> Self {
        Self::with_role(Role::Disconnected, PeerId::HOST, None, guid)
    }

    pub fn host(local_peer: PeerId, join_code: JoinCode, guid: Guid) -> Self {
        Self::with_role(Role::Host, local_peer, Some(join_code), guid)
    }

    pub fn client(local_peer: PeerId, join_code: JoinCode, guid: Guid) -> Self {
        Self::with_role(Role::Client, local_peer, Some(join_code), guid)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }

    pub fn is_client(&self) -> bool {
        self.role == Role::Client
    }

    pub fn in_session(&self) -> bool {
        self.role != Role::Disconnected
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    pub fn join_code(&self) -> Option<&JoinCode> {
        self.join_code.as_ref()
    }

    pub fn local_guid(&self) -> &Guid {
        &self.local_guid
    }

    /// Clients currently connected (host view; empty elsewhere).
    pub fn connected_peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers.iter().copied()
    }

    pub(crate) fn add_peer(&mut self, peer: PeerId) {
        self.peers.insert(peer);
    }

    pub(crate) fn remove_peer(&mut self, peer: PeerId) {
        self.peers.remove(&peer);
    }

    /// Host only: a fresh network object ID.
    pub fn allocate_object(&mut self) -> Result<NetworkObjectId, SyncError> {
        if !self.is_host() {
            return Err(SyncError::NotHost);
        }
        let id = NetworkObjectId(self.next_object);
        self.next_object += 1;
        Ok(id)
    }

    /// Host: broadcast to every client. Client: send to the host. Solo:
    /// dropped.
    pub fn send(&mut self, message: UnnamedMessage) {
        let destination = match self.role {
            Role::Host => Destination::AllPeers,
            Role::Client => Destination::Host,
            Role::Disconnected => {
                trace!(kind = %message.kind, "solo; message dropped");
                return;
            }
        };
        self.outbox.push(Outgoing {
            destination,
            message,
        });
    }

    /// Host only: send to one client (late-joiner catch-up).
    pub fn send_to(&mut self, peer: PeerId, message: UnnamedMessage) -> Result<(), SyncError> {
        self.host_send(Destination::Peer(peer), message)
    }

    /// Host only: relay to every client except `origin`.
    pub fn send_except(&mut self, origin: PeerId, message: UnnamedMessage) -> Result<(), SyncError> {
        self.host_send(Destination::AllExcept(origin), message)
    }

    fn host_send(&mut self, destination: Destination, message: UnnamedMessage) -> Result<(), SyncError> {
        if !self.is_host() {
            return Err(SyncError::NotHost);
        }
        self.outbox.push(Outgoing {
            destination,
            message,
        });
        Ok(())
    }

    pub fn emit(&mut self, event: SyncEvent) {
        self.events.push(event);
    }

    pub fn outbox(&self) -> &[Outgoing] {
        &self.outbox
    }

    pub fn events(&self) -> &[SyncEvent] {
        &self.events
    }

    pub fn drain_outbox(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    pub fn drain_events(&mut self) -> Vec<SyncEvent> {
        std::mem::take(&mut self.events)
    }

    /// Relay targets for a destination. `AllExcept` expands to one targeted
    /// send per remaining client, since the relay has no exclusion list.
    pub fn targets(&self, destination: Destination) -> Vec<Target> {
        match destination {
            Destination::AllPeers => vec![Target::Broadcast],
            Destination::AllExcept(origin) => self
                .peers
                .iter()
                .filter(|p| **p != origin)
                .map(|p| Target::Peer(*p))
                .collect(),
            Destination::Peer(peer) => vec![Target::Peer(peer)],
            Destination::Host => vec![Target::Host],
        }
    }
}
