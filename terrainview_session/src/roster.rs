// Peer roster (message kind 4).
//
// The host owns the roster. For every connected peer, itself included, it
// spawns a player object and declares three identity variables on it, each
// owned by that peer: display name, VR mode and guid. It then announces
// `Joined` to everyone. Newcomers get a `Snapshot` of the peers already
// present (their variables arrive in the variable snapshot sent just
// before).
//
// Each peer fills in its own identity as soon as it learns which player
// object is its own (`write_identity`). Entries are refreshed from the
// variable store whenever one of their variables changes, so every peer's
// `PeerEntry` converges on what the owner wrote.
//
// When a peer drops, the host removes its entry, drops its player object
// and announces `Left`. Pins that peer placed are not touched here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use terrainview_protocol::types::{Guid, MessageKind, NetworkObjectId, PeerId, VrMode};
use terrainview_protocol::unnamed::UnnamedMessage;

use crate::context::SessionContext;
use crate::error::SyncError;
use crate::events::{SyncEvent, VariableChange};
use crate::variables::{Replicated, VariableStore};

/// Field numbers of the identity variables on a player object.
pub mod player_fields {
    pub const DISPLAY_NAME: u16 = 0;
    pub const VR_MODE: u16 = 1;
    pub const GUID: u16 = 2;
}

/// What this peer writes onto its own player object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalIdentity {
    pub display_name: String,
    pub vr_mode: VrMode,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerEntry {
    pub peer_id: PeerId,
    pub player_object: NetworkObjectId,
    pub display_name: String,
    pub vr_mode: VrMode,
    /// `None` until the peer has written it.
    pub guid: Option<Guid>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterRecord {
    pub peer_id: PeerId,
    pub player_object: NetworkObjectId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RosterMessage {
    Joined(RosterRecord),
    Left { peer_id: PeerId },
    Snapshot { peers: Vec<RosterRecord> },
}

struct IdentityHandles {
    display_name: Replicated<String>,
    vr_mode: Replicated<VrMode>,
    guid: Replicated<String>,
}

fn handles(object: NetworkObjectId) -> IdentityHandles {
    IdentityHandles {
        display_name: Replicated::new(object, player_fields::DISPLAY_NAME),
        vr_mode: Replicated::new(object, player_fields::VR_MODE),
        guid: Replicated::new(object, player_fields::GUID),
    }
}

#[derive(Debug, Default)]
pub struct Roster {
    peers: BTreeMap<PeerId, PeerEntry>,
    local_object: Option<NetworkObjectId>,
}

impl Roster {
    pub const KIND: MessageKind = MessageKind::ROSTER;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer: PeerId) -> Option<&PeerEntry> {
        self.peers.get(&peer)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerEntry> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn guid_of(&self, peer: PeerId) -> Option<&Guid> {
        self.peers.get(&peer).and_then(|e| e.guid.as_ref())
    }

    pub fn local_player_object(&self) -> Option<NetworkObjectId> {
        self.local_object
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        self.local_object = None;
    }

    /// Host only: spawn `peer`'s player object and announce it.
    pub fn add_peer(
        &mut self,
        ctx: &mut SessionContext,
        vars: &mut VariableStore,
        peer: PeerId,
    ) -> Result<NetworkObjectId, SyncError> {
        if !ctx.is_host() {
            return Err(SyncError::NotHost);
        }
        let object = ctx.allocate_object()?;
        let h = handles(object);
        h.display_name.declare(vars, ctx, peer, &String::new())?;
        h.vr_mode.declare(vars, ctx, peer, &VrMode::Unassigned)?;
        h.guid.declare(vars, ctx, peer, &String::new())?;

        let record = RosterRecord {
            peer_id: peer,
            player_object: object,
        };
        self.insert(ctx, vars, record);
        ctx.send(encode(&RosterMessage::Joined(record))?);
        Ok(object)
    }

    /// Host only: a peer's connection went away.
    pub fn remove_peer(
        &mut self,
        ctx: &mut SessionContext,
        vars: &mut VariableStore,
        peer: PeerId,
    ) -> Result<bool, SyncError> {
        if !ctx.is_host() {
            return Err(SyncError::NotHost);
        }
        let Some(entry) = self.peers.remove(&peer) else {
            return Ok(false);
        };
        vars.drop_object(ctx, entry.player_object)?;
        ctx.send(encode(&RosterMessage::Left { peer_id: peer })?);
        ctx.emit(SyncEvent::PeerLeft(peer));
        info!(%peer, name = %entry.display_name, "peer left");
        Ok(true)
    }

    /// Host only: send the current roster to a newly connected peer.
    pub fn snapshot_to(&self, ctx: &mut SessionContext, peer: PeerId) -> Result<(), SyncError> {
        let peers = self
            .peers
            .values()
            .map(|e| RosterRecord {
                peer_id: e.peer_id,
                player_object: e.player_object,
            })
            .collect();
        ctx.send_to(peer, encode(&RosterMessage::Snapshot { peers })?)
    }

    /// Apply a kind-4 message. Returns this peer's player object the moment
    /// it is first learned, so the caller can write the local identity.
    pub fn on_receive(
        &mut self,
        ctx: &mut SessionContext,
        vars: &VariableStore,
        from: PeerId,
        msg: &UnnamedMessage,
    ) -> Result<Option<NetworkObjectId>, SyncError> {
        if ctx.is_host() {
            warn!(%from, "roster message from a client ignored");
            return Ok(None);
        }
        let had_local = self.local_object.is_some();
        match msg.read_json::<RosterMessage>()? {
            RosterMessage::Joined(record) => self.insert(ctx, vars, record),
            RosterMessage::Snapshot { peers } => {
                for record in peers {
                    self.insert(ctx, vars, record);
                }
            }
            RosterMessage::Left { peer_id } => {
                if self.peers.remove(&peer_id).is_some() {
                    ctx.emit(SyncEvent::PeerLeft(peer_id));
                }
            }
        }
        Ok(if had_local { None } else { self.local_object })
    }

    /// Refresh the entry whose player object carries `change`.
    pub fn apply_variable(&mut self, vars: &VariableStore, change: &VariableChange) {
        let object = change.id.object;
        if let Some(entry) = self.peers.values_mut().find(|e| e.player_object == object) {
            refresh(entry, vars);
        }
    }

    /// Write this peer's identity variables. Fails with `NotInSession` until
    /// the host has assigned a player object.
    pub fn write_identity(
        &mut self,
        ctx: &mut SessionContext,
        vars: &mut VariableStore,
        identity: &LocalIdentity,
    ) -> Result<(), SyncError> {
        let object = self.local_object.ok_or(SyncError::NotInSession)?;
        let h = handles(object);
        let guid = ctx.local_guid().to_string();
        h.display_name.set(vars, ctx, &identity.display_name)?;
        h.vr_mode.set(vars, ctx, &identity.vr_mode)?;
        h.guid.set(vars, ctx, &guid)?;
        if let Some(entry) = self.peers.get_mut(&ctx.local_peer()) {
            refresh(entry, vars);
        }
        Ok(())
    }

    fn insert(&mut self, ctx: &mut SessionContext, vars: &VariableStore, record: RosterRecord) {
        let mut entry = PeerEntry {
            peer_id: record.peer_id,
            player_object: record.player_object,
            display_name: String::new(),
            vr_mode: VrMode::Unassigned,
            guid: None,
        };
        refresh(&mut entry, vars);
        if record.peer_id == ctx.local_peer() {
            self.local_object = Some(record.player_object);
        }
        if self.peers.insert(record.peer_id, entry).is_none() {
            debug!(peer = %record.peer_id, object = record.player_object.0, "peer joined");
            ctx.emit(SyncEvent::PeerJoined(record.peer_id));
        }
    }
}

fn refresh(entry: &mut PeerEntry, vars: &VariableStore) {
    let h = handles(entry.player_object);
    if let Some(name) = h.display_name.get(vars) {
        entry.display_name = name;
    }
    if let Some(mode) = h.vr_mode.get(vars) {
        entry.vr_mode = mode;
    }
    entry.guid = h
        .guid
        .get(vars)
        .filter(|g| !g.is_empty())
        .map(Guid::new);
}

fn encode(message: &RosterMessage) -> Result<UnnamedMessage, SyncError> {
    Ok(UnnamedMessage::from_json(Roster::KIND, message)?)
}
